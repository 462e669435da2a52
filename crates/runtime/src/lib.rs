//! The da runtime: device resource management, kernel libraries, the graph
//! executor and its three-stage asynchronous pipeline.
//!
//! The VM drives a [`executor::GraphExecutor`]; the executor appends nodes
//! to the current graph while the VM interprets tensor-producing
//! instructions, then optimizes the finished graph, binds kernels from the
//! registered [`kernel::KernelLib`]s, and runs it over the lock-free
//! infer/launch queues in [`pipeline`]. Device memory, streams and events
//! come from a per-device [`res::ResManager`].

pub mod executor;
pub mod kernel;
pub mod kernels;
pub mod pipeline;
pub mod pool;
pub mod recycler;
pub mod res;

use thiserror::Error;

use da_ir::GraphError;
use da_ops::Op;

use kernel::KernelError;

/// Runtime failures. All of them are fatal to the current graph run; the
/// pipeline drains to a safe state and reports the first one recorded.
#[derive(Debug, Error)]
pub enum RtError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("kernel `{op}` failed: {source}")]
    Kernel {
        op: Op,
        #[source]
        source: KernelError,
    },
    #[error("no registered kernel library provides op `{0}`")]
    KernelNotFound(Op),
    #[error("memory pool exhausted allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("stream {0} does not exist")]
    UnknownStream(u32),
    #[error("pipeline queue `{0}` rejected a task")]
    QueuePush(&'static str),
    #[error("graph executor is {actual}, expected {expected}")]
    BadState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("graph `{graph}` takes {expected} arguments, got {actual}")]
    ArgCount {
        graph: String,
        expected: usize,
        actual: usize,
    },
    #[error("shape inference left a dynamic shape where a static one is required on {0}")]
    DynamicShapeAtLaunch(Op),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("{0}")]
    Internal(String),
}

pub type RtResult<T> = Result<T, RtError>;
