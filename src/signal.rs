//! SIGINT → [`CancelToken`] bridge. The only place the VM observes the
//! token is the end of a loop iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Reads and clears the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

static INTERRUPT: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_sigint(_signum: libc::c_int) {
    if let Some(token) = INTERRUPT.get() {
        token.cancel();
    }
}

/// Routes SIGINT into a process-wide token and returns it. Later calls
/// return the same token without reinstalling the handler.
pub fn install() -> CancelToken {
    let mut fresh = false;
    let token = INTERRUPT.get_or_init(|| {
        fresh = true;
        CancelToken::new()
    });
    if fresh {
        let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only performs an atomic store.
        unsafe {
            libc::signal(libc::SIGINT, handler);
        }
        debug!("SIGINT handler installed");
    }
    token.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        assert!(token.take());
        assert!(!other.is_cancelled());
    }

    #[test]
    fn install_is_idempotent() {
        let a = install();
        let b = install();
        a.cancel();
        assert!(b.take());
    }
}
