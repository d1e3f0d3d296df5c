use serde_json::Value;

/// The syntax tree of a restricted condition expression. Only the node
/// kinds below exist; anything else fails at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    /// `object.property` — the object side must resolve to a whitelisted
    /// namespace or a plain value.
    Member(Box<Expr>, String),
    /// `callee(args…)` — callee must be a whitelisted function or a
    /// `Math.*` member.
    Call(Box<Expr>, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
}
