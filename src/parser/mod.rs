use std::rc::Rc;

use crate::ast::*;
use crate::error::{ErrorCode, MangoError, MangoResult, SourcePos};
use crate::lexer::{self, Token};

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    map: SourceMap,
    file: Option<Rc<str>>,
    source_len: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("Parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: ErrorCode,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

/// Lexes and parses a whole source file into a `Statements` root.
pub fn parse_source(source: &str, file: Option<&str>) -> MangoResult<Node> {
    let file: Option<Rc<str>> = file.map(Rc::from);
    let map = SourceMap::new(source);
    let tokens = lexer::lex(source).map_err(|e| {
        let pos = map.position(e.position, file.as_ref());
        e.into_error(pos)
    })?;
    let tokens = tokens
        .into_iter()
        .map(|(t, r)| (t, Span { start: r.start, end: r.end }))
        .collect();
    let mut parser = Parser::new(tokens, source, file);
    parser.parse_program().map_err(|e| parser.to_error(e))
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>, source: &str, file: Option<Rc<str>>) -> Self {
        Parser { tokens, pos: 0, map: SourceMap::new(source), file, source_len: source.len() }
    }

    pub fn to_error(&self, e: ParseError) -> MangoError {
        let pos = self.map.position(e.span.start, self.file.as_ref());
        MangoError::syntax(e.code, e.message).at(&pos)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens.get(self.pos).map(|(_, s)| *s).unwrap_or(Span {
            start: self.source_len,
            end: self.source_len,
        })
    }

    fn token_at(&self, idx: usize) -> Option<&Token> {
        self.tokens.get(idx).map(|(t, _)| t)
    }

    fn here(&self) -> SourcePos {
        self.map.position(self.peek_span().start, self.file.as_ref())
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.peek() {
            Some(tok) if tok == expected => {
                self.advance();
                Ok(())
            }
            Some(tok) => Err(self.error(ErrorCode::ExpectedToken, format!("expected {:?}, got {}", expected, tok.describe()))),
            None => Err(self.error(ErrorCode::ExpectedToken, format!("expected {:?}, got end of file", expected))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(tok) => Err(self.error(ErrorCode::ExpectedToken, format!("expected identifier, got {}", tok.describe()))),
            None => Err(self.error(ErrorCode::ExpectedToken, "expected identifier, got end of file".into())),
        }
    }

    fn error(&self, code: ErrorCode, message: String) -> ParseError {
        ParseError { code, position: self.pos, span: self.peek_span(), message }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Statements ----

    pub fn parse_program(&mut self) -> Result<Node> {
        let pos = SourcePos::new(1, 1, self.file.clone());
        let body = self.parse_statements(None)?;
        Ok(Node::new(NodeKind::Statements { body }, pos))
    }

    /// Parses statements until `close` (or end of input when `close` is None).
    fn parse_statements(&mut self, close: Option<&Token>) -> Result<Vec<Node>> {
        let mut body = Vec::new();
        loop {
            while self.eat(&Token::Semi) {}
            match (self.peek(), close) {
                (None, None) => break,
                (None, Some(c)) => {
                    return Err(self.error(ErrorCode::ExpectedChar, format!("expected {:?} before end of file", c)));
                }
                (Some(t), Some(c)) if t == c => break,
                _ => {}
            }
            body.push(self.parse_stmt()?);
            self.end_of_statement(close)?;
        }
        Ok(body)
    }

    fn end_of_statement(&mut self, close: Option<&Token>) -> Result<()> {
        let ended_with_block = self.pos > 0 && self.token_at(self.pos - 1) == Some(&Token::RBracket);
        if self.eat(&Token::Semi) || ended_with_block || self.at_end() {
            return Ok(());
        }
        match (self.peek(), close) {
            (Some(t), Some(c)) if t == c => Ok(()),
            _ => Err(self.error(ErrorCode::ExpectedChar, "expected ';' after statement".into())),
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Node>> {
        self.expect(&Token::Arrow)?;
        self.expect(&Token::LBracket)?;
        let body = self.parse_statements(Some(&Token::RBracket))?;
        self.expect(&Token::RBracket)?;
        Ok(body)
    }

    fn at_declaration(&self) -> bool {
        match (self.peek(), self.token_at(self.pos + 1), self.token_at(self.pos + 2)) {
            (Some(Token::Ident(_)), Some(Token::Ident(_)), _) => true,
            (Some(Token::Star), Some(Token::Ident(_)), Some(Token::Ident(_))) => true,
            _ => false,
        }
    }

    fn parse_stmt(&mut self) -> Result<Node> {
        let pos = self.here();
        let kind = match self.peek() {
            Some(Token::Include) => {
                self.advance();
                match self.advance() {
                    Some(Token::Str(file)) => NodeKind::Include { file },
                    _ => return Err(self.error(ErrorCode::ExpectedToken, "expected a file name after 'include'".into())),
                }
            }
            Some(Token::Extern) => {
                self.advance();
                NodeKind::Extern { inner: Box::new(self.parse_stmt()?) }
            }
            Some(Token::Const) => {
                self.advance();
                NodeKind::Const { inner: Box::new(self.parse_stmt()?) }
            }
            Some(Token::Unsigned) => {
                self.advance();
                NodeKind::Unsigned { inner: Box::new(self.parse_stmt()?) }
            }
            Some(Token::Return) => {
                self.advance();
                let value = if matches!(self.peek(), None | Some(Token::Semi) | Some(Token::RBracket)) {
                    Node::new(NodeKind::Int { value: 0 }, pos.clone())
                } else {
                    self.parse_expr()?
                };
                NodeKind::Return { value: Box::new(value) }
            }
            Some(Token::Typedef) => {
                self.advance();
                let base = self.parse_type()?;
                self.expect(&Token::As)?;
                let name = self.expect_ident()?;
                NodeKind::Typedef { base, name }
            }
            Some(Token::Struct) => {
                self.advance();
                let name = self.expect_ident()?;
                let members = self.parse_block()?;
                NodeKind::Struct { name, members }
            }
            Some(Token::Fun) => return self.parse_function(),
            Some(Token::If) => return self.parse_if(),
            Some(Token::While) => {
                self.advance();
                let cond = self.parse_condition()?;
                let body = self.parse_block()?;
                NodeKind::While { cond: Box::new(cond), body }
            }
            Some(Token::For) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let init = self.parse_stmt()?;
                self.expect(&Token::Semi)?;
                let cond = self.parse_expr()?;
                self.expect(&Token::Semi)?;
                let step = self.parse_stmt()?;
                self.expect(&Token::RParen)?;
                let body = self.parse_block()?;
                NodeKind::For { init: Box::new(init), cond: Box::new(cond), step: Box::new(step), body }
            }
            Some(Token::Else) => return Err(self.error(ErrorCode::ExpectedToken, "'else' without a matching 'if'".into())),
            _ if self.at_declaration() => return self.parse_declaration(),
            _ => return self.parse_expr_stmt(),
        };
        Ok(Node::new(kind, pos))
    }

    fn parse_condition(&mut self) -> Result<Node> {
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        Ok(cond)
    }

    fn parse_if(&mut self) -> Result<Node> {
        let pos = self.here();
        self.expect(&Token::If)?;
        let cond = self.parse_condition()?;
        let body = self.parse_block()?;
        let otherwise = if self.check(&Token::Else) {
            let else_pos = self.here();
            self.advance();
            let body = if self.check(&Token::If) { vec![self.parse_if()?] } else { self.parse_block()? };
            Some(Box::new(Node::new(NodeKind::Else { body }, else_pos)))
        } else {
            None
        };
        Ok(Node::new(NodeKind::If { cond: Box::new(cond), body, otherwise }, pos))
    }

    fn parse_type(&mut self) -> Result<TypeSpec> {
        let pointer = self.eat(&Token::Star);
        let name = self.expect_ident()?;
        Ok(TypeSpec { name, pointer })
    }

    fn parse_function(&mut self) -> Result<Node> {
        let pos = self.here();
        self.expect(&Token::Fun)?;
        let ret = self.parse_type()?;
        let name = self.expect_ident()?;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                let ty = self.parse_type()?;
                let name = self.expect_ident()?;
                params.push(ParamSpec { ty, name });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let decl = Node::new(NodeKind::FuncDec { ret, name, params }, pos.clone());
        if !self.check(&Token::Arrow) {
            return Ok(decl);
        }
        let body = self.parse_block()?;
        Ok(Node::new(NodeKind::FuncDef { decl: Box::new(decl), body }, pos))
    }

    fn parse_declaration(&mut self) -> Result<Node> {
        let pos = self.here();
        let ty = self.parse_type()?;
        let name = self.expect_ident()?;
        let size = if self.eat(&Token::LBracket) {
            let size = self.parse_expr()?;
            self.expect(&Token::RBracket)?;
            Some(Box::new(size))
        } else {
            None
        };
        let decl = DeclSpec { ty, name, array: size.is_some() };
        let kind = if self.eat(&Token::Assign) {
            NodeKind::VarNew { decl, size, value: Box::new(self.parse_expr()?) }
        } else {
            NodeKind::VarUn { decl, size }
        };
        Ok(Node::new(kind, pos))
    }

    fn parse_expr_stmt(&mut self) -> Result<Node> {
        let target = self.parse_expr()?;
        if !self.check(&Token::Assign) {
            return Ok(target);
        }
        self.advance();
        let value = Box::new(self.parse_expr()?);
        let kind = match target.kind {
            NodeKind::VarAccess { path } => NodeKind::VarAssign { path, value },
            NodeKind::GetItem { path, index } => NodeKind::SetItem { path, index, value },
            _ => return Err(self.error(ErrorCode::ExpectedToken, "left side of '=' is not assignable".into())),
        };
        Ok(Node::new(kind, target.pos))
    }

    // ---- Expressions ----

    pub fn parse_expr(&mut self) -> Result<Node> {
        let mut lhs = self.parse_arith()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::LtEq) => BinOp::Le,
                Some(Token::GtEq) => BinOp::Ge,
                _ => return Ok(lhs),
            };
            lhs = self.binary(lhs, op, Self::parse_arith)?;
        }
    }

    fn parse_arith(&mut self) -> Result<Node> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            lhs = self.binary(lhs, op, Self::parse_term)?;
        }
    }

    fn parse_term(&mut self) -> Result<Node> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => return Ok(lhs),
            };
            lhs = self.binary(lhs, op, Self::parse_unary)?;
        }
    }

    fn binary(&mut self, lhs: Node, op: BinOp, rhs: fn(&mut Self) -> Result<Node>) -> Result<Node> {
        let pos = self.here();
        self.advance();
        let rhs = rhs(self)?;
        Ok(Node::new(NodeKind::BinOp { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, pos))
    }

    fn parse_unary(&mut self) -> Result<Node> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Plus) => UnaryOp::Plus,
            Some(Token::Amp) => UnaryOp::AddressOf,
            Some(Token::Star) => UnaryOp::Deref,
            _ => return self.parse_postfix(),
        };
        let pos = self.here();
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Node::new(NodeKind::UnOp { op, operand: Box::new(operand) }, pos))
    }

    fn parse_postfix(&mut self) -> Result<Node> {
        let pos = self.here();
        let mut node = match self.peek().cloned() {
            Some(Token::Int(value)) => {
                self.advance();
                Node::new(NodeKind::Int { value }, pos)
            }
            Some(Token::Str(value)) => {
                self.advance();
                Node::new(NodeKind::Str { value }, pos)
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                inner
            }
            Some(Token::Ident(_)) => {
                let path = self.parse_path()?;
                let kind = if self.eat(&Token::LBracket) {
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    NodeKind::GetItem { path, index: Box::new(index) }
                } else if self.eat(&Token::Inc) {
                    NodeKind::Inc { path }
                } else if self.eat(&Token::Dec) {
                    NodeKind::Dec { path }
                } else {
                    NodeKind::VarAccess { path }
                };
                Node::new(kind, pos)
            }
            Some(tok) => return Err(self.error(ErrorCode::ExpectedToken, format!("expected expression, got {}", tok.describe()))),
            None => return Err(self.error(ErrorCode::ExpectedToken, "expected expression, got end of file".into())),
        };

        while self.check(&Token::LParen) {
            let pos = self.here();
            self.advance();
            let mut args = Vec::new();
            if !self.check(&Token::RParen) {
                loop {
                    args.push(self.parse_expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
            }
            self.expect(&Token::RParen)?;
            node = Node::new(NodeKind::Call { callee: Box::new(node), args }, pos);
        }
        Ok(node)
    }

    fn parse_path(&mut self) -> Result<Vec<String>> {
        let mut path = vec![self.expect_ident()?];
        while self.eat(&Token::Dot) {
            path.push(self.expect_ident()?);
        }
        Ok(path)
    }
}
