//! Build script front end
//!
//! Turns script text into a [`Program`]: a list of statements whose task
//! definitions are registered before anything executes.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{Block, Expr, Program, Stmt};
pub use parser::parse;
