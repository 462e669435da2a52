//! The da compiler: walks the frontend's AST and produces the code objects
//! the VM interprets.

pub mod code;
pub mod compile;
pub mod disasm;

use thiserror::Error;

/// A compile-time failure, reported against a source position. Compilation
/// stops at the first one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{file}:{line}:{col}: error: {message}")]
pub struct CompileError {
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub message: String,
}

pub type CompileResult<T> = Result<T, CompileError>;

pub use code::{CmpOp, Code, CodeId, CodeKind, CompiledProgram, ConstKind, Constant, Inst, Opcode};
pub use compile::{Compiler, CompileOptions, INTRINSIC_NAMES};
pub use disasm::dump;
