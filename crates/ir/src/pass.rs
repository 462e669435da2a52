//! Pattern-replacement passes over a finished graph.
//!
//! A pass is a `match` predicate plus a replacement builder. The manager
//! runs its registered passes to a fixpoint (bounded by an iteration cap),
//! maintaining a use-def index and a doubly-linked ordering list so a
//! replacement lands at the replaced node's position. Nodes whose user list
//! drains during an iteration are collected and physically removed at the
//! end of it.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

use da_ops::Op;

use crate::dtype::DataType;
use crate::graph::{Graph, GraphError, NodeId};
use crate::tensor::Tensor;
use crate::ud::UseDefs;
use crate::value::Value;

/// Upper bound on fixpoint iterations; a pass set that keeps rewriting past
/// this is a bug in the passes.
pub const ITERATION_LIMIT: usize = 16;

/// Context handed to a pass while it builds its replacement.
pub struct RewriteCtx<'a> {
    graph: &'a mut Graph,
    created: Vec<NodeId>,
}

impl<'a> RewriteCtx<'a> {
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Create a new operator node for the replacement. Its output starts as
    /// an uninitialized dynamic tensor, like every freshly-emitted op node.
    pub fn new_node(&mut self, op: Op, inputs: &[NodeId]) -> Result<NodeId, GraphError> {
        let output = Value::Tensor(Tensor::new(DataType::Float32, vec![-1]));
        let id = self.graph.add_op_node(op, inputs, output)?;
        self.created.push(id);
        Ok(id)
    }
}

/// A single rewrite rule.
///
/// `matched` inspects one node and may stash whatever it needs; when it
/// returns true the manager immediately asks for the `replacement`, which is
/// either an existing node or one built through the context. Returning
/// `None` declines the rewrite after all.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn matched(&mut self, graph: &Graph, node: NodeId) -> bool;
    fn replacement(&mut self, ctx: &mut RewriteCtx) -> Result<Option<NodeId>, GraphError>;
}

/// Doubly-linked ordering parallel to the graph's node list, so removals
/// and positional inserts are O(1) during a pass iteration.
struct OrderList {
    links: SecondaryMap<NodeId, Link>,
    first: Option<NodeId>,
    last: Option<NodeId>,
}

#[derive(Clone, Default)]
struct Link {
    prev: PackedOption<NodeId>,
    next: PackedOption<NodeId>,
    in_list: bool,
}

impl OrderList {
    fn build(order: &[NodeId]) -> OrderList {
        let mut list = OrderList { links: SecondaryMap::new(), first: None, last: None };
        for &id in order {
            list.push_back(id);
        }
        list
    }

    fn push_back(&mut self, node: NodeId) {
        self.links[node] = Link { prev: self.last.into(), next: None.into(), in_list: true };
        match self.last {
            Some(last) => self.links[last].next = Some(node).into(),
            None => self.first = Some(node),
        }
        self.last = Some(node);
    }

    fn insert_before(&mut self, anchor: NodeId, node: NodeId) {
        let prev = self.links[anchor].prev;
        self.links[node] = Link { prev, next: Some(anchor).into(), in_list: true };
        self.links[anchor].prev = Some(node).into();
        match prev.expand() {
            Some(prev) => self.links[prev].next = Some(node).into(),
            None => self.first = Some(node),
        }
    }

    fn remove(&mut self, node: NodeId) {
        if !self.links[node].in_list {
            return;
        }
        let Link { prev, next, .. } = self.links[node].clone();
        match prev.expand() {
            Some(prev) => self.links[prev].next = next,
            None => self.first = next.expand(),
        }
        match next.expand() {
            Some(next) => self.links[next].prev = prev,
            None => self.last = prev.expand(),
        }
        self.links[node] = Link::default();
    }

    fn next(&self, node: NodeId) -> Option<NodeId> {
        self.links[node].next.expand()
    }

    fn to_vec(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut cursor = self.first;
        while let Some(node) = cursor {
            order.push(node);
            cursor = self.next(node);
        }
        order
    }
}

/// Holds the ordered list of registered passes and drives them to fixpoint.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    limit: usize,
}

impl Default for PassManager {
    fn default() -> Self {
        PassManager::new()
    }
}

impl PassManager {
    pub fn new() -> PassManager {
        PassManager { passes: Vec::new(), limit: ITERATION_LIMIT }
    }

    /// The stock pass set.
    pub fn with_default_passes() -> PassManager {
        let mut pm = PassManager::new();
        pm.add_pass(Box::new(CancelDoubleNeg::default()));
        pm.add_pass(Box::new(FuseAddOfNeg::default()));
        pm
    }

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        log::debug!("register pass `{}`", pass.name());
        self.passes.push(pass);
    }

    /// Run all passes until nothing changes (or the iteration cap).
    /// Returns the number of iterations executed.
    pub fn run(&mut self, graph: &mut Graph) -> Result<usize, GraphError> {
        let mut iterations = 0;
        loop {
            iterations += 1;
            if !self.run_once(graph)? {
                break;
            }
            if iterations >= self.limit {
                log::warn!(
                    "pass manager on graph `{}` hit the iteration cap ({})",
                    graph.name,
                    self.limit
                );
                break;
            }
        }
        Ok(iterations)
    }

    fn run_once(&mut self, graph: &mut Graph) -> Result<bool, GraphError> {
        let mut ud = UseDefs::build(graph);
        let mut list = OrderList::build(graph.order());
        let mut unused: Vec<NodeId> = Vec::new();
        let mut changed = false;

        for pass in &mut self.passes {
            let mut cursor = list.first;
            while let Some(node) = cursor {
                let next = list.next(node);
                if graph.is_live(node) && !ud.is_root(node) && pass.matched(graph, node) {
                    let mut ctx = RewriteCtx { graph: &mut *graph, created: Vec::new() };
                    let replacement = pass.replacement(&mut ctx)?;
                    let created = ctx.created;
                    if let Some(new) = replacement {
                        if new != node {
                            log::debug!("pass `{}`: {} -> {}", pass.name(), node, new);
                            for &c in &created {
                                list.insert_before(node, c);
                                for (i, &input) in
                                    graph.node(c).inputs.clone().iter().enumerate()
                                {
                                    ud.add_edge(c, i, input);
                                }
                            }
                            replace(graph, &mut ud, &mut list, &mut unused, node, new);
                            changed = true;
                        }
                    }
                }
                cursor = next;
            }
        }

        flush_unused(graph, &mut ud, &mut list, unused);
        graph.set_order(list.to_vec());
        graph.validate().map_err(|err| match err {
            GraphError::OrderViolation(id) => GraphError::Cycle(id),
            other => other,
        })?;
        Ok(changed)
    }
}

/// Splice `new` into every user edge of `old`, transfer the user list, drop
/// `old`'s own input edges, and remove `old` from the ordering.
fn replace(
    graph: &mut Graph,
    ud: &mut UseDefs,
    list: &mut OrderList,
    unused: &mut Vec<NodeId>,
    old: NodeId,
    new: NodeId,
) {
    let users = ud.take_users(old);
    for &(user, index) in &users {
        graph.set_input(user, index, new);
    }
    ud.append_users(new, users);

    let inputs: Vec<NodeId> = graph.node(old).inputs.to_vec();
    for (index, &input) in inputs.iter().enumerate() {
        if ud.drop_edge(old, index, input) {
            unused.push(input);
        }
    }
    list.remove(old);
    graph.mark_removed(old);
}

/// Physically remove every node whose user list drained, cascading into
/// inputs that become unused in turn. Parameters and the root survive.
fn flush_unused(graph: &mut Graph, ud: &mut UseDefs, list: &mut OrderList, mut unused: Vec<NodeId>) {
    while let Some(node) = unused.pop() {
        if !graph.is_live(node) || graph.is_param(node) || ud.is_root(node) {
            continue;
        }
        if ud.has_users(node) {
            continue;
        }
        let inputs: Vec<NodeId> = graph.node(node).inputs.to_vec();
        for (index, &input) in inputs.iter().enumerate() {
            if ud.drop_edge(node, index, input) {
                unused.push(input);
            }
        }
        log::trace!("flush unused node {node}");
        list.remove(node);
        graph.mark_removed(node);
    }
}

/// neg(neg(x)) rewrites to x itself.
#[derive(Default)]
pub struct CancelDoubleNeg {
    target: Option<NodeId>,
}

impl Pass for CancelDoubleNeg {
    fn name(&self) -> &'static str {
        "cancel-double-neg"
    }

    fn matched(&mut self, graph: &Graph, node: NodeId) -> bool {
        self.target = None;
        let n = graph.node(node);
        if n.op != Some(Op::Neg) {
            return false;
        }
        let inner = n.inputs[0];
        if graph.node(inner).op == Some(Op::Neg) {
            self.target = Some(graph.node(inner).inputs[0]);
        }
        self.target.is_some()
    }

    fn replacement(&mut self, _ctx: &mut RewriteCtx) -> Result<Option<NodeId>, GraphError> {
        Ok(self.target.take())
    }
}

/// add(x, neg(y)) rewrites to sub(x, y).
#[derive(Default)]
pub struct FuseAddOfNeg {
    operands: Option<(NodeId, NodeId)>,
}

impl Pass for FuseAddOfNeg {
    fn name(&self) -> &'static str {
        "fuse-add-of-neg"
    }

    fn matched(&mut self, graph: &Graph, node: NodeId) -> bool {
        self.operands = None;
        let n = graph.node(node);
        if n.op != Some(Op::Add) {
            return false;
        }
        let (lhs, rhs) = (n.inputs[0], n.inputs[1]);
        if graph.node(rhs).op == Some(Op::Neg) {
            self.operands = Some((lhs, graph.node(rhs).inputs[0]));
        }
        self.operands.is_some()
    }

    fn replacement(&mut self, ctx: &mut RewriteCtx) -> Result<Option<NodeId>, GraphError> {
        match self.operands.take() {
            Some((lhs, rhs)) => Ok(Some(ctx.new_node(Op::Sub, &[lhs, rhs])?)),
            None => Ok(None),
        }
    }
}
