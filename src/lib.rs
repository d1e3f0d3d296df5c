pub mod api;
pub mod cli;
pub mod clients;
pub mod engine;
pub mod error;
pub mod eval;
pub mod graph;
pub mod nodes;
pub mod storage;
pub mod template;
pub mod vars;
