//! Process-wide interpreter state shared by the VM and the AST evaluator.
//!
//! Both evaluation strategies funnel declarations, assignment, calls and
//! struct handling through [`Runtime`] so their observable behaviour can
//! only differ in how they walk their input.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::rc::Rc;

use tracing::debug;

use crate::dynload::ExtensionRegistry;
use crate::error::{ErrorCode, MangoError, MangoResult, SourcePos};
use crate::names::Context;
use crate::object::{Heap, ObjRef, Payload, TypeDescriptor, TypeTag};
use crate::signal::CancelToken;

mod builtins;
pub mod ops;

/// Nested calls beyond this depth fail instead of exhausting the host stack.
pub const MAX_CALL_DEPTH: usize = 1000;

/// Evaluators grow the stack once less than this much is left.
pub(crate) const STACK_RED_ZONE: usize = 128 * 1024;
/// Size of each stack segment added on growth.
pub(crate) const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

// ── Type registry ───────────────────────────────────────────────────

/// Type name → descriptor object. Descriptors are retained for the life
/// of the registry so heap sweeps never drop them.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, ObjRef>,
}

impl TypeRegistry {
    pub fn with_builtins(heap: &Heap) -> MangoResult<Self> {
        let mut registry = TypeRegistry::default();
        registry.register(heap, "int", TypeTag::INT, None)?;
        registry.register(heap, "chr", TypeTag::CHR, None)?;
        Ok(registry)
    }

    /// Binds `name`, replacing (and releasing) any previous descriptor.
    pub fn register(&mut self, heap: &Heap, name: &str, tag: TypeTag, template: Option<ObjRef>) -> MangoResult<ObjRef> {
        let desc = TypeDescriptor { name: Rc::from(name), tag, template };
        let obj = heap.type_descriptor(desc)?;
        obj.retain();
        if let Some(previous) = self.types.insert(name.to_string(), Rc::clone(&obj)) {
            previous.release();
        }
        debug!(name, %tag, "registered type");
        Ok(obj)
    }

    pub fn lookup(&self, name: &str) -> Option<TypeDescriptor> {
        let obj = self.types.get(name)?;
        match &*obj.payload() {
            Payload::Type(desc) => Some(desc.clone()),
            _ => None,
        }
    }

    pub fn resolve_type(&self, name: &str, pointer: bool) -> MangoResult<TypeTag> {
        let desc = self
            .lookup(name)
            .ok_or_else(|| MangoError::runtime(ErrorCode::InvalidType, format!("Unknown type '{name}'")))?;
        Ok(if pointer { desc.tag.pointer() } else { desc.tag })
    }

    /// The struct template a type name instantiates, following typedefs.
    pub fn template(&self, name: &str) -> Option<ObjRef> {
        self.lookup(name).and_then(|d| d.template)
    }

    pub fn release_all(&mut self) {
        for (_, obj) in self.types.drain() {
            obj.release();
        }
    }
}

// ── I/O ─────────────────────────────────────────────────────────────

/// In-memory stand-ins for the standard streams.
#[derive(Debug, Default)]
pub struct Capture {
    pub stdout: RefCell<Vec<u8>>,
    pub stderr: RefCell<Vec<u8>>,
    pub stdin: RefCell<VecDeque<u8>>,
}

impl Capture {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout.borrow()).into_owned()
    }

    pub fn feed_stdin(&self, bytes: &[u8]) {
        self.stdin.borrow_mut().extend(bytes);
    }
}

/// Where the `read`/`write` builtins go: the process streams, or a capture.
#[derive(Clone, Debug, Default)]
pub struct Io {
    capture: Option<Rc<Capture>>,
}

fn unknown_fd(fd: i32) -> MangoError {
    MangoError::runtime(ErrorCode::UnknownFd, format!("Unknown file descriptor {fd}"))
}

fn stream_error(e: std::io::Error) -> MangoError {
    MangoError::runtime(ErrorCode::InvalidValue, e.to_string())
}

impl Io {
    pub fn stdio() -> Self {
        Io { capture: None }
    }

    pub fn captured() -> (Self, Rc<Capture>) {
        let capture = Rc::new(Capture::default());
        (Io { capture: Some(Rc::clone(&capture)) }, capture)
    }

    pub fn write(&self, fd: i32, bytes: &[u8]) -> MangoResult<usize> {
        if let Some(capture) = &self.capture {
            match fd {
                1 => capture.stdout.borrow_mut().extend_from_slice(bytes),
                2 => capture.stderr.borrow_mut().extend_from_slice(bytes),
                _ => return Err(unknown_fd(fd)),
            }
            return Ok(bytes.len());
        }
        match fd {
            1 => {
                let mut out = std::io::stdout().lock();
                out.write_all(bytes).and_then(|()| out.flush()).map_err(stream_error)?;
            }
            2 => std::io::stderr().lock().write_all(bytes).map_err(stream_error)?,
            _ => return Err(unknown_fd(fd)),
        }
        Ok(bytes.len())
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> MangoResult<usize> {
        if fd != 0 {
            return Err(unknown_fd(fd));
        }
        match &self.capture {
            Some(capture) => {
                let mut stdin = capture.stdin.borrow_mut();
                let n = buf.len().min(stdin.len());
                for (slot, byte) in buf.iter_mut().zip(stdin.drain(..n)) {
                    *slot = byte;
                }
                Ok(n)
            }
            None => std::io::stdin().lock().read(buf).map_err(stream_error),
        }
    }
}

// ── Runtime ─────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct RuntimeConfig {
    pub heap_limit: Option<usize>,
    pub cancel: CancelToken,
    pub io: Io,
}

#[derive(Debug)]
pub struct Runtime {
    pub heap: Rc<Heap>,
    pub types: TypeRegistry,
    pub extensions: ExtensionRegistry,
    pub io: Io,
    globals: Rc<Context>,
    cancel: CancelToken,
    depth: Cell<usize>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> MangoResult<Self> {
        let heap = Rc::new(match config.heap_limit {
            Some(limit) => Heap::with_limit(limit),
            None => Heap::new(),
        });
        let types = TypeRegistry::with_builtins(&heap)?;
        let mut rt = Runtime {
            heap,
            types,
            extensions: ExtensionRegistry::default(),
            io: config.io,
            globals: Context::main(None),
            cancel: config.cancel,
            depth: Cell::new(0),
        };
        builtins::install(&mut rt)?;
        Ok(rt)
    }

    /// The single default context: top-level code, `extern` and library
    /// images all resolve against it.
    pub fn globals(&self) -> &Rc<Context> {
        &self.globals
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Loop-iteration cancellation point.
    pub fn check_cancelled(&self, pos: Option<&SourcePos>) -> MangoResult<()> {
        if self.cancel.take() {
            return Err(MangoError::runtime(ErrorCode::KeyboardInterrupt, "Keyboard interrupt").at_opt(pos));
        }
        Ok(())
    }

    pub fn collect(&self) -> usize {
        self.heap.collect()
    }

    pub(crate) fn enter_call(&self) -> MangoResult<()> {
        let depth = self.depth.get() + 1;
        if depth > MAX_CALL_DEPTH {
            return Err(MangoError::runtime(ErrorCode::Memory, "Maximum call depth exceeded"));
        }
        self.depth.set(depth);
        Ok(())
    }

    pub(crate) fn leave_call(&self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }

    /// Closes every extension and frees all objects without touching counts.
    pub fn teardown(&mut self) {
        self.extensions.close_all();
        self.types.release_all();
        self.heap.teardown();
    }
}
