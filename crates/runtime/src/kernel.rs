//! The kernel-library contract and the registry of loaded libraries.

use thiserror::Error;

use da_ir::{Node, Storage, Value};

use crate::res::{ResManager, StreamId};
use crate::{RtError, RtResult};

/// The execution-stream handle a launch runs against: the stream id plus
/// the resource manager that owns it, so a kernel can synchronize its own
/// stream when its output shape is only known after execution.
pub struct LaunchStream<'a> {
    pub id: StreamId,
    pub res: &'a dyn ResManager,
}

impl LaunchStream<'_> {
    pub fn sync(&self) -> RtResult<()> {
        self.res.sync_stream(self.id)
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("invalid device address: {0}")]
    InvalidDeviceAddr(String),
    #[error("unsupported input type: {0}")]
    Unsupported(String),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// One bound kernel for one node. The pipeline calls the methods in order:
/// `init` once at bind time, then `infer_shape` / `resize` on the infer
/// thread and `launch` on the launch thread, every run.
pub trait Kernel: Send {
    fn init(&mut self) -> KernelResult<()> {
        Ok(())
    }

    /// Write the output shape (or scalar variant) derived from the inputs.
    fn infer_shape(&mut self, inputs: &[Value], output: &mut Value) -> KernelResult<()>;

    /// Workspace bytes this launch needs. Zero by default.
    fn resize(&mut self, inputs: &[Value], output: &Value) -> KernelResult<usize> {
        let _ = (inputs, output);
        Ok(0)
    }

    /// Run the computation. Output storage is already materialized. Kernels
    /// whose output shape is only known after execution must synchronize
    /// their stream in here and fix the shape up before returning.
    fn launch(
        &mut self,
        inputs: &[Value],
        workspace: Option<&Storage>,
        output: &mut Value,
        stream: &LaunchStream,
    ) -> KernelResult<()>;

    fn updates_shape_after_launch(&self) -> bool {
        false
    }
}

/// A named kernel library: a factory of kernels per node.
pub trait KernelLib: Send + Sync {
    fn name(&self) -> &str;

    /// A kernel for `node`, or `None` when this library has no
    /// implementation for its op.
    fn create_kernel(&self, node: &Node) -> Option<Box<dyn Kernel>>;
}

/// The process-wide set of kernel libraries, queried in registration order
/// when binding kernels to a graph.
#[derive(Default)]
pub struct KernelLibRegistry {
    libs: Vec<Box<dyn KernelLib>>,
}

impl KernelLibRegistry {
    pub fn new() -> KernelLibRegistry {
        KernelLibRegistry::default()
    }

    /// A registry with the built-in CPU library registered.
    pub fn with_builtin() -> KernelLibRegistry {
        let mut registry = KernelLibRegistry::new();
        registry.register(Box::new(crate::kernels::cpu::CpuKernelLib));
        registry
    }

    pub fn register(&mut self, lib: Box<dyn KernelLib>) {
        log::debug!("kernel library registered: {}", lib.name());
        self.libs.push(lib);
    }

    pub fn get(&self, name: &str) -> Option<&dyn KernelLib> {
        self.libs.iter().find(|l| l.name() == name).map(Box::as_ref)
    }

    /// Load a library from a shared object path.
    pub fn load(&mut self, _path: &str) -> RtResult<()> {
        // The in-process registries cover every shipped library; dlopen-style
        // loading needs a stable C ABI first.
        Err(RtError::Unsupported("loading kernel libraries from shared objects"))
    }

    /// The first kernel any registered library offers for `node`, in
    /// deterministic registration order.
    pub fn create_kernel(&self, node: &Node) -> Option<Box<dyn Kernel>> {
        self.libs.iter().find_map(|lib| lib.create_kernel(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use da_ir::Graph;
    use da_ops::Op;

    #[test]
    fn registry_order_is_deterministic() {
        let registry = KernelLibRegistry::with_builtin();
        assert!(registry.get("cpu").is_some());
        assert!(registry.get("nope").is_none());

        let mut g = Graph::new("t");
        let x = g.add_value_node(Value::Int(1));
        let y = g.add_value_node(Value::Int(2));
        let add = g
            .add_op_node(Op::Add, &[x, y], Value::None)
            .unwrap();
        assert!(registry.create_kernel(g.node(add)).is_some());
    }

    #[test]
    fn dynamic_loading_is_rejected() {
        let mut registry = KernelLibRegistry::new();
        assert!(registry.load("/tmp/libkernels.so").is_err());
    }
}
