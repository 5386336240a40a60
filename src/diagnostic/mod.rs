pub mod ansi;
pub mod json;
pub mod registry;

use crate::error::{ErrorCode, ErrorKind, MangoError, SourcePos};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    #[allow(dead_code)] // forward infrastructure for future warning diagnostics
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub pos: SourcePos,
    pub message: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: ErrorKind,
    pub code: Option<ErrorCode>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    /// Text of the file the primary label points into.
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            kind,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_pos(mut self, pos: SourcePos, label: impl Into<String>) -> Self {
        self.labels.push(Label { pos, message: label.into(), is_primary: true });
        self
    }

    pub fn with_secondary_pos(mut self, pos: SourcePos, label: impl Into<String>) -> Self {
        self.labels.push(Label { pos, message: label.into(), is_primary: false });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn primary(&self) -> Option<&Label> {
        self.labels.iter().find(|l| l.is_primary)
    }

    /// `"<Kind> Error (File 'f', Line l, Column c)"`, or just the kind
    /// label when nothing locates the error.
    pub fn headline(&self) -> String {
        match self.primary() {
            Some(label) => format!("{} ({})", self.kind, label.pos),
            None => self.kind.to_string(),
        }
    }
}

impl From<&MangoError> for Diagnostic {
    fn from(e: &MangoError) -> Self {
        let mut d = Diagnostic::error(e.kind, &e.message).with_code(e.code);
        if let Some(pos) = &e.pos {
            d = d.with_pos(pos.clone(), "here");
        }
        if let Some(outer) = &e.outer {
            d = d.with_secondary_pos(outer.clone(), format!("included from {outer}"));
        }
        if registry::lookup(&e.code.to_string()).is_some() {
            d = d.with_suggestion(format!("run 'mango --explain {}' for details", e.code));
        }
        d
    }
}
