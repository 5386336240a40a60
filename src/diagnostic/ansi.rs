use crate::ast::SourceMap;
use super::{Diagnostic, Severity};

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    fn dim(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[2m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        // "Runtime Error (File 'a.mg', Line 2, Column 5):\n  message"
        let headline = match d.severity {
            Severity::Error => self.bold_red(&d.headline()),
            Severity::Warning => self.bold(&self.cyan(&d.headline())),
        };
        out.push_str(&format!("{headline}:\n  {}\n", self.bold(&d.message)));

        if let (Some(label), Some(source)) = (d.primary(), &d.source) {
            let map = SourceMap::new(source);
            let line = label.pos.line as usize;
            let line_text = map.line_text(source, line);
            if !line_text.is_empty() {
                let gutter = line.to_string().len();
                let pipe = self.cyan("|");
                let pad = " ".repeat(gutter);

                out.push_str(&format!("{pad} {pipe}\n"));
                let line_num = self.cyan(&format!("{line:>gutter$}"));
                out.push_str(&format!("{line_num} {pipe} {line_text}\n"));

                let indent = " ".repeat((label.pos.column as usize).saturating_sub(1));
                let caret = self.bold_red("^");
                if label.message.is_empty() {
                    out.push_str(&format!("{pad} {pipe} {indent}{caret}\n"));
                } else {
                    out.push_str(&format!("{pad} {pipe} {indent}{caret} {}\n", self.bold_red(&label.message)));
                }
            }
        }

        for label in d.labels.iter().filter(|l| !l.is_primary) {
            if !label.message.is_empty() {
                out.push_str(&format!("  {} {}\n", self.dim("="), label.message));
            }
        }

        for note in &d.notes {
            out.push_str(&format!("  {} note: {}\n", self.dim("="), note));
        }

        if let Some(suggestion) = &d.suggestion {
            out.push_str(&format!("  {} help: {}\n", self.dim("="), suggestion));
        }

        out
    }
}
