use serde::Serialize;

use crate::error::SourcePos;

pub mod source_map;
pub use source_map::SourceMap;

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

// ---- Operators ----

/// Binary operator. The discriminant is the sub-byte written after `0x9D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum BinOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    Eq = 5,
    Ne = 6,
    Lt = 7,
    Gt = 8,
    Le = 9,
    Ge = 10,
}

impl BinOp {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => BinOp::Add,
            1 => BinOp::Sub,
            2 => BinOp::Mul,
            3 => BinOp::Div,
            4 => BinOp::Mod,
            5 => BinOp::Eq,
            6 => BinOp::Ne,
            7 => BinOp::Lt,
            8 => BinOp::Gt,
            9 => BinOp::Le,
            10 => BinOp::Ge,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge)
    }
}

/// Unary operator. The discriminant is the sub-byte written after `0x9C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum UnaryOp {
    Neg = 0,
    Plus = 1,
    AddressOf = 2,
    Deref = 3,
}

impl UnaryOp {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => UnaryOp::Neg,
            1 => UnaryOp::Plus,
            2 => UnaryOp::AddressOf,
            3 => UnaryOp::Deref,
            _ => return None,
        })
    }
}

// ---- Declarations ----

/// A type as written in source: a name and an optional leading `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeSpec {
    pub name: String,
    pub pointer: bool,
}

impl TypeSpec {
    pub fn new(name: impl Into<String>, pointer: bool) -> Self {
        TypeSpec { name: name.into(), pointer }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclSpec {
    pub ty: TypeSpec,
    pub name: String,
    pub array: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub ty: TypeSpec,
    pub name: String,
}

// ---- Nodes ----

/// Closed enumeration of node types, numbered in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum NodeType {
    Int,
    String,
    VarAccess,
    VarAssign,
    FuncDef,
    FuncDec,
    Call,
    BinOp,
    UnOp,
    If,
    For,
    While,
    Else,
    Statements,
    Extern,
    GetItem,
    SetItem,
    VarNew,
    VarUn,
    Inc,
    Dec,
    Return,
    Include,
    Typedef,
    Const,
    Unsigned,
    Struct,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node")]
pub enum NodeKind {
    Int { value: i32 },
    Str { value: String },
    VarAccess { path: Vec<String> },
    VarAssign { path: Vec<String>, value: Box<Node> },
    /// `decl` is always a `FuncDec`.
    FuncDef { decl: Box<Node>, body: Vec<Node> },
    FuncDec { ret: TypeSpec, name: String, params: Vec<ParamSpec> },
    Call { callee: Box<Node>, args: Vec<Node> },
    BinOp { op: BinOp, lhs: Box<Node>, rhs: Box<Node> },
    UnOp { op: UnaryOp, operand: Box<Node> },
    /// `otherwise` is always an `Else`.
    If { cond: Box<Node>, body: Vec<Node>, otherwise: Option<Box<Node>> },
    For { init: Box<Node>, cond: Box<Node>, step: Box<Node>, body: Vec<Node> },
    While { cond: Box<Node>, body: Vec<Node> },
    Else { body: Vec<Node> },
    Statements { body: Vec<Node> },
    Extern { inner: Box<Node> },
    GetItem { path: Vec<String>, index: Box<Node> },
    SetItem { path: Vec<String>, index: Box<Node>, value: Box<Node> },
    VarNew { decl: DeclSpec, size: Option<Box<Node>>, value: Box<Node> },
    VarUn { decl: DeclSpec, size: Option<Box<Node>> },
    Inc { path: Vec<String> },
    Dec { path: Vec<String> },
    Return { value: Box<Node> },
    Include { file: String },
    Typedef { base: TypeSpec, name: String },
    Const { inner: Box<Node> },
    Unsigned { inner: Box<Node> },
    Struct { name: String, members: Vec<Node> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(skip)]
    pub pos: SourcePos,
}

impl Node {
    pub fn new(kind: NodeKind, pos: SourcePos) -> Self {
        Node { kind, pos }
    }

    pub fn node_type(&self) -> NodeType {
        match &self.kind {
            NodeKind::Int { .. } => NodeType::Int,
            NodeKind::Str { .. } => NodeType::String,
            NodeKind::VarAccess { .. } => NodeType::VarAccess,
            NodeKind::VarAssign { .. } => NodeType::VarAssign,
            NodeKind::FuncDef { .. } => NodeType::FuncDef,
            NodeKind::FuncDec { .. } => NodeType::FuncDec,
            NodeKind::Call { .. } => NodeType::Call,
            NodeKind::BinOp { .. } => NodeType::BinOp,
            NodeKind::UnOp { .. } => NodeType::UnOp,
            NodeKind::If { .. } => NodeType::If,
            NodeKind::For { .. } => NodeType::For,
            NodeKind::While { .. } => NodeType::While,
            NodeKind::Else { .. } => NodeType::Else,
            NodeKind::Statements { .. } => NodeType::Statements,
            NodeKind::Extern { .. } => NodeType::Extern,
            NodeKind::GetItem { .. } => NodeType::GetItem,
            NodeKind::SetItem { .. } => NodeType::SetItem,
            NodeKind::VarNew { .. } => NodeType::VarNew,
            NodeKind::VarUn { .. } => NodeType::VarUn,
            NodeKind::Inc { .. } => NodeType::Inc,
            NodeKind::Dec { .. } => NodeType::Dec,
            NodeKind::Return { .. } => NodeType::Return,
            NodeKind::Include { .. } => NodeType::Include,
            NodeKind::Typedef { .. } => NodeType::Typedef,
            NodeKind::Const { .. } => NodeType::Const,
            NodeKind::Unsigned { .. } => NodeType::Unsigned,
            NodeKind::Struct { .. } => NodeType::Struct,
        }
    }

    /// Children of a `Statements` root, or the node itself otherwise.
    pub fn statements(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Statements { body } => body,
            _ => std::slice::from_ref(self),
        }
    }
}
