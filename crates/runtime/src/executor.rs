//! The graph executor: owns the graph being built by the VM, optimizes it,
//! binds kernels and drives runs through the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use da_ir::pass::PassManager;
use da_ir::{DataType, Graph, NodeId, Tensor, Value};
use da_ops::Op;

use crate::kernel::{Kernel, KernelLibRegistry, LaunchStream};
use crate::pipeline::Pipeline;
use crate::recycler::Recycler;
use crate::res::{DeviceRegistry, ResManager, StreamId};
use crate::{RtError, RtResult};

/// The executor's lifecycle. "Run now" calls are legal in `Building` and
/// `Built`; starting a second graph while one is building is not.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExecState {
    Idle,
    Building,
    Built,
}

impl ExecState {
    fn as_str(self) -> &'static str {
        match self {
            ExecState::Idle => "idle",
            ExecState::Building => "building",
            ExecState::Built => "built",
        }
    }
}

/// What the pipeline does for one node.
enum KernelSlot {
    /// Value node; its output is supplied externally.
    Value,
    /// Structural op with no kernel (`make_tuple`, `tuple_getitem`).
    Structural(Op),
    /// Output aliases the given input; the internal pass-through kernel.
    PassThrough(usize),
    /// A bound kernel from a library.
    Kernel(Box<dyn Kernel>),
}

struct RunCtx {
    graph: Graph,
    kernels: Vec<Mutex<KernelSlot>>,
    workspaces: Vec<Mutex<Option<da_ir::Storage>>>,
    recycler: Recycler,
    res: Arc<dyn ResManager>,
    failed: AtomicBool,
    error: Mutex<Option<RtError>>,
}

impl RunCtx {
    fn fail(&self, err: RtError) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            log::error!("graph run failed: {err}");
            *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        }
    }

    fn kernel(&self, id: NodeId) -> MutexGuard<'_, KernelSlot> {
        self.kernels[id.as_u32() as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn gather_inputs(&self, id: NodeId) -> Vec<Value> {
        self.graph
            .node(id)
            .inputs
            .iter()
            .map(|&input| self.graph.node(input).clone_output())
            .collect()
    }
}

pub struct GraphExecutor {
    res: Arc<dyn ResManager>,
    libs: KernelLibRegistry,
    passes: PassManager,
    pipeline: Pipeline,
    state: ExecState,
    graph: Option<Graph>,
    kernels: Option<Vec<Mutex<KernelSlot>>>,
    recycler: Option<Recycler>,
}

impl GraphExecutor {
    /// An executor on the default CPU device with the built-in kernel
    /// libraries and passes.
    pub fn new() -> RtResult<GraphExecutor> {
        let registry = DeviceRegistry::with_builtin();
        let res = registry.get_or_create(da_ir::Device::CPU)?;
        Ok(GraphExecutor::with_parts(res, KernelLibRegistry::with_builtin()))
    }

    /// An executor over explicit device and kernel registries.
    pub fn with_parts(res: Arc<dyn ResManager>, libs: KernelLibRegistry) -> GraphExecutor {
        GraphExecutor {
            res,
            libs,
            passes: PassManager::with_default_passes(),
            pipeline: Pipeline::new(),
            state: ExecState::Idle,
            graph: None,
            kernels: None,
            recycler: None,
        }
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    pub fn graph_name(&self) -> Option<&str> {
        self.graph.as_ref().map(|g| g.name.as_str())
    }

    pub fn res(&self) -> &Arc<dyn ResManager> {
        &self.res
    }

    fn expect_state(&self, expected: ExecState) -> RtResult<()> {
        if self.state != expected {
            return Err(RtError::BadState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn graph_mut(&mut self) -> RtResult<&mut Graph> {
        self.graph
            .as_mut()
            .ok_or(RtError::BadState { expected: "a current graph", actual: "none" })
    }

    fn graph_ref(&self) -> RtResult<&Graph> {
        self.graph
            .as_ref()
            .ok_or(RtError::BadState { expected: "a current graph", actual: "none" })
    }

    /// Start building a graph.
    pub fn begin_graph(&mut self, name: &str) -> RtResult<()> {
        self.expect_state(ExecState::Idle)?;
        log::debug!("begin graph `{name}`");
        self.graph = Some(Graph::new(name));
        self.kernels = None;
        self.recycler = None;
        self.state = ExecState::Building;
        Ok(())
    }

    /// Add a parameter node carrying `value` as its placeholder output.
    pub fn add_parameter(&mut self, value: Value) -> RtResult<NodeId> {
        self.expect_state(ExecState::Building)?;
        let graph = self.graph_mut()?;
        let id = graph.add_value_node(value);
        graph.add_parameter(id)?;
        Ok(id)
    }

    /// Add a const/externally-shaped tensor node (the `tensor` intrinsic).
    pub fn add_value_node(&mut self, value: Value) -> RtResult<NodeId> {
        self.expect_state(ExecState::Building)?;
        Ok(self.graph_mut()?.add_value_node(value))
    }

    /// Append an op node with an uninitialized dynamic output.
    pub fn add_op_node(&mut self, op: Op, inputs: &[NodeId]) -> RtResult<NodeId> {
        self.expect_state(ExecState::Building)?;
        let output = Value::Tensor(Tensor::new(DataType::Float32, vec![-1]));
        Ok(self.graph_mut()?.add_op_node(op, inputs, output)?)
    }

    /// Close the graph: synthesize the `return` and seal it.
    pub fn finish_graph(&mut self) -> RtResult<()> {
        self.expect_state(ExecState::Building)?;
        let graph = self.graph_mut()?;
        graph.add_return()?;
        graph.finish()?;
        self.state = ExecState::Built;
        log::debug!("graph finished:\n{}", self.graph_ref()?);
        Ok(())
    }

    /// Run the registered passes to fixpoint.
    pub fn opt_graph(&mut self) -> RtResult<usize> {
        self.expect_state(ExecState::Built)?;
        let graph = self
            .graph
            .as_mut()
            .ok_or(RtError::BadState { expected: "a current graph", actual: "none" })?;
        let iterations = self.passes.run(graph)?;
        log::debug!("optimized in {iterations} iteration(s):\n{graph}");
        Ok(iterations)
    }

    /// Bind a kernel (or classify a structural role) for every node.
    pub fn build_kernels(&mut self) -> RtResult<()> {
        self.expect_state(ExecState::Built)?;
        let graph = self.graph_ref()?;
        let len = graph
            .order()
            .iter()
            .map(|id| id.as_u32() as usize + 1)
            .max()
            .unwrap_or(0);
        let mut kernels: Vec<Mutex<KernelSlot>> =
            (0..len).map(|_| Mutex::new(KernelSlot::Value)).collect();
        for &id in graph.order() {
            let node = graph.node(id);
            let slot = match node.op {
                None => KernelSlot::Value,
                Some(op) => match op.aliased_input() {
                    Some(index) => KernelSlot::PassThrough(index),
                    None if op.is_structural() => KernelSlot::Structural(op),
                    None => {
                        let mut kernel = self
                            .libs
                            .create_kernel(node)
                            .ok_or(RtError::KernelNotFound(op))?;
                        kernel.init().map_err(|source| RtError::Kernel { op, source })?;
                        KernelSlot::Kernel(kernel)
                    }
                },
            };
            kernels[id.as_u32() as usize] = Mutex::new(slot);
        }
        let recycler = Recycler::build(graph);
        self.kernels = Some(kernels);
        self.recycler = Some(recycler);
        Ok(())
    }

    /// Write run arguments into the graph's parameter nodes.
    pub fn bind_arguments(&mut self, args: &[Value]) -> RtResult<()> {
        let graph = self.graph_ref()?;
        if args.len() != graph.params().len() {
            return Err(RtError::ArgCount {
                graph: graph.name.clone(),
                expected: graph.params().len(),
                actual: args.len(),
            });
        }
        for (&param, value) in graph.params().iter().zip(args) {
            graph.node(param).set_output(value.clone());
        }
        Ok(())
    }

    /// The current output value of a node.
    pub fn node_output(&self, id: NodeId) -> RtResult<Value> {
        Ok(self.graph_ref()?.node(id).clone_output())
    }

    /// A printable dump of the current graph.
    pub fn dump_graph(&self) -> Option<String> {
        self.graph.as_ref().map(|g| g.to_string())
    }

    /// Run the built graph through the pipeline and return the root value.
    pub fn run_graph(&mut self, is_dynamic: bool) -> RtResult<Value> {
        let _ = is_dynamic;
        self.expect_state(ExecState::Built)?;
        let graph = self
            .graph
            .take()
            .ok_or(RtError::BadState { expected: "a current graph", actual: "none" })?;
        let kernels = match self.kernels.take() {
            Some(kernels) => kernels,
            None => {
                self.graph = Some(graph);
                return Err(RtError::BadState { expected: "kernels built", actual: "unbound" });
            }
        };
        let recycler = match self.recycler.take() {
            Some(recycler) => recycler,
            None => {
                self.graph = Some(graph);
                return Err(RtError::BadState { expected: "kernels built", actual: "unbound" });
            }
        };
        recycler.reset();

        let order: Vec<NodeId> = graph.order().to_vec();
        let ctx = Arc::new(RunCtx {
            graph,
            kernels,
            workspaces: order.iter().map(|_| Mutex::new(None)).collect(),
            recycler,
            res: self.res.clone(),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        });

        self.pipeline.resume_all();
        let launch_queue = self.pipeline.launch.clone();
        for (pos, &id) in order.iter().enumerate() {
            let task_ctx = ctx.clone();
            let task_launch = launch_queue.clone();
            if let Err(err) = self.pipeline.infer.push(Box::new(move || {
                infer_stage(&task_ctx, pos, id, &task_launch);
            })) {
                ctx.fail(err);
                break;
            }
        }
        self.pipeline.wait_all();
        self.pipeline.pause_all();
        self.res.sync_all_streams()?;

        let ctx = Arc::try_unwrap(ctx)
            .map_err(|_| RtError::Internal("pipeline kept a run context alive".into()))?;
        let RunCtx { graph, kernels, recycler, error, .. } = ctx;
        let root = graph.root();
        self.graph = Some(graph);
        self.kernels = Some(kernels);
        self.recycler = Some(recycler);

        if let Some(err) = error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(err);
        }
        let root = root.ok_or_else(|| RtError::Internal("run on an empty graph".into()))?;
        self.node_output(root)
    }

    /// Bind `args` and run: the "run now" path for calls on an
    /// already-built graph.
    pub fn run_built(&mut self, args: &[Value]) -> RtResult<Value> {
        self.bind_arguments(args)?;
        self.run_graph(false)
    }
}

impl Drop for GraphExecutor {
    fn drop(&mut self) {
        self.pipeline.join_all();
    }
}

/// Stages one and two, on the infer thread: shape inference and workspace
/// sizing, then the hand-off to the launch queue.
fn infer_stage(ctx: &Arc<RunCtx>, pos: usize, id: NodeId, launch_queue: &Arc<crate::pipeline::AsyncTaskQueue>) {
    if ctx.failed.load(Ordering::Acquire) {
        return;
    }
    if let Err(err) = run_infer(ctx, pos, id) {
        ctx.fail(err);
        return;
    }
    let task_ctx = ctx.clone();
    if let Err(err) = launch_queue.push(Box::new(move || launch_stage(&task_ctx, pos, id))) {
        ctx.fail(err);
    }
}

fn run_infer(ctx: &Arc<RunCtx>, pos: usize, id: NodeId) -> RtResult<()> {
    let node = ctx.graph.node(id);
    let mut slot = ctx.kernel(id);
    match &mut *slot {
        KernelSlot::Value => Ok(()),
        KernelSlot::PassThrough(index) => {
            // Copy the designated input's shape and borrow its storage.
            let input = node.inputs[*index];
            node.set_output(ctx.graph.node(input).clone_output());
            Ok(())
        }
        KernelSlot::Structural(op) => structural_infer(ctx, id, *op),
        KernelSlot::Kernel(kernel) => {
            let op = node.op.unwrap_or(Op::End);
            let inputs = ctx.gather_inputs(id);
            let mut output = node.output();
            kernel
                .infer_shape(&inputs, &mut output)
                .map_err(|source| RtError::Kernel { op, source })?;
            let workspace_bytes = kernel
                .resize(&inputs, &output)
                .map_err(|source| RtError::Kernel { op, source })?;
            drop(output);
            if workspace_bytes > 0 {
                let stream = ctx.res.default_stream();
                let storage = da_ir::Storage::new_allocated(
                    workspace_bytes,
                    ctx.res.device(),
                    stream,
                    ctx.res.storage_allocator(),
                )
                .ok_or(RtError::OutOfMemory(workspace_bytes))?;
                *ctx.workspaces[pos].lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(storage);
            }
            Ok(())
        }
    }
}

fn structural_infer(ctx: &Arc<RunCtx>, id: NodeId, op: Op) -> RtResult<()> {
    let node = ctx.graph.node(id);
    match op {
        Op::MakeTuple => {
            node.set_output(Value::Tuple(ctx.gather_inputs(id)));
            Ok(())
        }
        Op::TupleGetItem => {
            let inputs = ctx.gather_inputs(id);
            let index = inputs
                .get(1)
                .ok_or_else(|| RtError::Internal("tuple_getitem without an index".into()))?
                .to_int()
                .map_err(|e| RtError::Internal(e.to_string()))?;
            let tuple = inputs[0]
                .as_tuple()
                .map_err(|e| RtError::Internal(e.to_string()))?;
            let item = tuple.get(index as usize).ok_or_else(|| {
                RtError::Internal(format!("tuple_getitem index {index} out of range"))
            })?;
            node.set_output(item.clone());
            Ok(())
        }
        other => Err(RtError::Internal(format!("structural op {other} in the kernel stage"))),
    }
}

/// Stage three, on the launch thread: output materialization, the kernel
/// launch, and the recycler decrements for this consumer.
fn launch_stage(ctx: &Arc<RunCtx>, pos: usize, id: NodeId) {
    if ctx.failed.load(Ordering::Acquire) {
        return;
    }
    if let Err(err) = run_launch(ctx, pos, id) {
        ctx.fail(err);
        return;
    }
    ctx.recycler.consumer_submitted(&ctx.graph, id);
}

fn run_launch(ctx: &Arc<RunCtx>, pos: usize, id: NodeId) -> RtResult<()> {
    let node = ctx.graph.node(id);
    let mut slot = ctx.kernel(id);
    let kernel = match &mut *slot {
        KernelSlot::Value => return Ok(()),
        // Alias and structural outputs are refreshed once their inputs
        // have launched; scalar inputs are copied by value, so the infer
        // stage's snapshot can predate the input's result.
        KernelSlot::PassThrough(index) => {
            let input = node.inputs[*index];
            node.set_output(ctx.graph.node(input).clone_output());
            return Ok(());
        }
        KernelSlot::Structural(op) => return structural_infer(ctx, id, *op),
        KernelSlot::Kernel(kernel) => kernel,
    };
    let op = node.op.unwrap_or(Op::End);
    let inputs = ctx.gather_inputs(id);
    let stream: StreamId = ctx.res.default_stream();
    // Launch against a clone of the output value so the node's lock is not
    // held across the kernel; tensor clones share storage, so the write
    // lands in the right buffer either way.
    let mut output = node.clone_output();

    if let Value::Tensor(tensor) = &mut output {
        if tensor.has_dynamic_shape() {
            return Err(RtError::DynamicShapeAtLaunch(op));
        }
        let needed = tensor.size_bytes().unwrap_or(0);
        let allocator = ctx.res.storage_allocator();
        if !tensor.resize_storage(ctx.res.device(), stream, &allocator) {
            return Err(RtError::OutOfMemory(needed));
        }
    }

    {
        let workspace = ctx.workspaces[pos].lock().unwrap_or_else(PoisonError::into_inner);
        let launch_stream = LaunchStream { id: stream, res: &*ctx.res };
        kernel
            .launch(&inputs, workspace.as_ref(), &mut output, &launch_stream)
            .map_err(|source| RtError::Kernel { op, source })?;
    }
    node.set_output(output);
    Ok(())
}
