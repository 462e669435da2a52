//! The da source-language frontend: lexer, AST and recursive-descent
//! parser.
//!
//! The frontend is a collaborator of the compiler: it turns source text
//! into the arena-allocated AST the compiler walks. Error reporting
//! carries `file:line:col` locations throughout.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

use thiserror::Error;

/// A frontend failure, reported against a source position.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{file}:{line}:{col}: error: {message}")]
pub struct ParseError {
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub message: String,
}

pub type ParseResult<T> = Result<T, ParseError>;

pub use ast::{BinOp, Expr, ExprId, ExprKind, FuncDecl, LitKind, Module, Param, Stmt, StmtId, StmtKind};
pub use lexer::Lexer;
pub use parser::Parser;
pub use token::{Keyword, Token, TokenKind};
