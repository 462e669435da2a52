//! The da stack VM.
//!
//! A frame stack over the compiler's code objects. Ordinary instructions
//! compute scalar values on the operand stack; the tensor-producing forms
//! (`CallIntrin`, `CallOps`) emit nodes into the graph executor's current
//! graph instead of computing anything.

pub mod intrinsic;
pub mod slot;
pub mod vm;

use thiserror::Error;

use da_runtime::RtError;

/// A VM failure. Runtime errors carry the source position of the
/// instruction that raised them; executor failures pass through.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{file}:{line}: error: {message}")]
    Runtime { file: String, line: u32, message: String },
    #[error(transparent)]
    Exec(#[from] RtError),
}

pub type VmResult<T> = Result<T, VmError>;

pub use intrinsic::Intrinsic;
pub use slot::Slot;
pub use vm::Vm;
