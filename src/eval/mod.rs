pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod simple;

pub use interp::{EvalScope, evaluate_expression};
pub use simple::{CompareOp, evaluate_simple};

/// Hard cap on expression source length. Longer input is rejected before
/// parsing.
pub const MAX_EXPRESSION_LEN: usize = 1000;

/// Shared deadline for parsing plus evaluation of one expression.
pub const EVAL_TIMEOUT_MS: u64 = 5000;

/// Recursion depth cap for parsing and evaluation.
pub const MAX_DEPTH: usize = 64;
