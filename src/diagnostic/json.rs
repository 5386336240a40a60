use super::{Diagnostic, Severity};

pub fn render(d: &Diagnostic) -> String {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };

    let labels: Vec<serde_json::Value> = d
        .labels
        .iter()
        .map(|l| {
            serde_json::json!({
                "file": l.pos.file.as_deref(),
                "line": l.pos.line,
                "column": l.pos.column,
                "message": l.message,
                "primary": l.is_primary,
            })
        })
        .collect();

    let mut obj = serde_json::json!({
        "severity": severity,
        "kind": d.kind.label(),
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });

    if let Some(code) = d.code {
        obj["code"] = serde_json::Value::String(code.to_string());
    }

    if let Some(s) = &d.suggestion {
        obj["suggestion"] = serde_json::Value::String(s.clone());
    }

    serde_json::to_string(&obj)
        .unwrap_or_else(|_| r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, ErrorKind, MangoError, SourcePos};
    use std::rc::Rc;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let v = parse_json(&render(&Diagnostic::error(ErrorKind::Bytecode, "bad header")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["kind"], "Bytecode Error");
        assert_eq!(v["message"], "bad header");
        assert!(v["labels"].as_array().unwrap().is_empty());
        assert!(v.get("code").is_none());
    }

    #[test]
    fn render_located_error() {
        let pos = SourcePos::new(4, 2, Some(Rc::from("m.mg")));
        let e = MangoError::runtime(ErrorCode::NoFile, "Could not open 'x'").at(&pos);
        let v = parse_json(&render(&Diagnostic::from(&e)));
        assert_eq!(v["code"], "E406");
        let label = &v["labels"][0];
        assert_eq!(label["file"], "m.mg");
        assert_eq!(label["line"], 4);
        assert_eq!(label["column"], 2);
        assert_eq!(label["primary"], true);
    }

    #[test]
    fn unknown_file_is_null() {
        let d = Diagnostic::error(ErrorKind::Syntax, "x").with_pos(SourcePos::new(1, 1, None), "");
        let v = parse_json(&render(&d));
        assert!(v["labels"][0]["file"].is_null());
    }
}
