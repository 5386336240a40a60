use logos::Logos;

use crate::error::{ErrorCode, MangoError, SourcePos};

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
pub enum Token {
    // Keywords
    #[token("include")]
    Include,
    #[token("extern")]
    Extern,
    #[token("fun")]
    Fun,
    #[token("for")]
    For,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("return")]
    Return,
    #[token("typedef")]
    Typedef,
    #[token("as")]
    As,
    #[token("struct")]
    Struct,
    #[token("while")]
    While,
    #[token("unsigned")]
    Unsigned,
    #[token("const")]
    Const,

    // Operators
    #[token("++")]
    Inc,
    #[token("--")]
    Dec,
    #[token("->")]
    Arrow,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,

    // Punctuation
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,

    // Literals
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i32>().ok())]
    Int(i32),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| unescape(lex.slice()))]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Int(n) => format!("integer {n}"),
            Token::Str(_) => "string literal".to_string(),
            Token::Ident(name) => format!("identifier '{name}'"),
            other => format!("{other:?}"),
        }
    }
}

/// Strips the quotes and resolves `\n \t \0 \\ \" \'`. Unknown escapes keep the escaped char.
fn unescape(quoted: &str) -> Option<String> {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            '0' => out.push('\0'),
            other => out.push(other),
        }
    }
    Some(out)
}

/// Lex source code into a stream of tokens with byte ranges.
pub fn lex(source: &str) -> Result<Vec<(Token, std::ops::Range<usize>)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push((token, lexer.span())),
            Err(()) => {
                let span = lexer.span();
                return Err(LexError {
                    position: span.start,
                    snippet: source[span.clone()].to_string(),
                    suggestion: suggest_fix(&source[span.clone()]),
                });
            }
        }
    }

    Ok(tokens)
}

fn suggest_fix(bad_token: &str) -> String {
    if !bad_token.is_empty() && bad_token.bytes().all(|b| b.is_ascii_digit()) {
        "integer literals must fit in 32 bits".to_string()
    } else if bad_token.starts_with('"') || bad_token.starts_with('\'') {
        "string literal is never closed".to_string()
    } else {
        format!("'{bad_token}' is not part of the language")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Lex error at position {position}: '{snippet}'. {suggestion}")]
pub struct LexError {
    pub position: usize,
    pub snippet: String,
    pub suggestion: String,
}

impl LexError {
    pub fn into_error(self, pos: SourcePos) -> MangoError {
        MangoError::syntax(ErrorCode::UnknownChar, format!("Unknown character '{}': {}", self.snippet, self.suggestion))
            .at(&pos)
    }
}
