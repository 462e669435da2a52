//! Intermediate representation for the da execution stack.
//!
//! This crate holds the data model shared by the compiler-facing and the
//! runtime-facing halves of the system: element types and devices, the
//! reference-counted storage / tensor / value hierarchy, the computation
//! graph the VM builds while it interprets bytecode, and the
//! pattern-replacement pass machinery that rewrites a finished graph.
//!
//! Graph nodes are entity references (indices into a [`cranelift_entity::PrimaryMap`])
//! rather than pointers; the cyclic relationships between a node and its
//! users live in side tables keyed by [`graph::NodeId`].

pub mod device;
pub mod dtype;
pub mod graph;
pub mod pass;
pub mod storage;
pub mod tensor;
pub mod ud;
pub mod value;

pub use device::{Device, DeviceKind};
pub use dtype::DataType;
pub use graph::{Graph, GraphError, Node, NodeId};
pub use storage::{Storage, StorageAllocator};
pub use tensor::Tensor;
pub use value::{TypeError, Value};
