//! The computation graph: a DAG of operator nodes built incrementally
//! while the VM interprets a graph-kind code object.

use core::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;
use thiserror::Error;

use da_ops::Op;

use crate::value::Value;

/// An opaque reference to a node in a [`Graph`].
///
/// Node references are indices into the graph's node arena; they stay valid
/// for the lifetime of the graph even when a rewrite pass removes the node
/// from the ordering.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
entity_impl!(NodeId, "n");

/// A graph node: an operator, its input edges, and the output value the
/// runtime materializes during shape inference.
///
/// Value nodes (parameters, constants) carry no operator.
pub struct Node {
    pub op: Option<Op>,
    pub inputs: SmallVec<[NodeId; 4]>,
    output: Mutex<Value>,
}

impl Node {
    fn new(op: Option<Op>, inputs: SmallVec<[NodeId; 4]>, output: Value) -> Node {
        Node { op, inputs, output: Mutex::new(output) }
    }

    /// Lock the output value. The pipeline writes each output exactly once
    /// per run; everything else only reads.
    pub fn output(&self) -> MutexGuard<'_, Value> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_output(&self, value: Value) {
        *self.output() = value;
    }

    pub fn clone_output(&self) -> Value {
        self.output().clone()
    }
}

/// Graph construction and well-formedness failures. All are fatal to the
/// current run.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("input edge to a node not in the graph: {0}")]
    InputNotInGraph(NodeId),
    #[error("graph `{0}` has no nodes")]
    EmptyGraph(String),
    #[error("graph `{0}` is already finished")]
    AlreadyFinished(String),
    #[error("graph `{0}` does not end in a return node")]
    MissingReturn(String),
    #[error("node ordering violates data dependencies at {0}")]
    OrderViolation(NodeId),
    #[error("rewrite produced a cyclic graph at {0}")]
    Cycle(NodeId),
    #[error("pass `{pass}` failed: {message}")]
    PassFailed { pass: &'static str, message: String },
}

/// An ordered DAG of [`Node`]s plus the parameter list bound externally at
/// each run. The final node of a finished graph is its `return`.
pub struct Graph {
    pub name: String,
    nodes: PrimaryMap<NodeId, Node>,
    order: Vec<NodeId>,
    params: Vec<NodeId>,
    live: SecondaryMap<NodeId, bool>,
    finished: bool,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Graph {
        Graph {
            name: name.into(),
            nodes: PrimaryMap::new(),
            order: Vec::new(),
            params: Vec::new(),
            live: SecondaryMap::new(),
            finished: false,
        }
    }

    /// Append a value node (no operator; the output is supplied externally).
    pub fn add_value_node(&mut self, value: Value) -> NodeId {
        let id = self.nodes.push(Node::new(None, SmallVec::new(), value));
        self.live[id] = true;
        self.order.push(id);
        log::trace!("graph {}: value node {}", self.name, id);
        id
    }

    /// Append an operator node. Every input must already be in the graph.
    pub fn add_op_node(
        &mut self,
        op: Op,
        inputs: &[NodeId],
        output: Value,
    ) -> Result<NodeId, GraphError> {
        for &input in inputs {
            if !self.is_live(input) {
                return Err(GraphError::InputNotInGraph(input));
            }
        }
        let id = self
            .nodes
            .push(Node::new(Some(op), SmallVec::from_slice(inputs), output));
        self.live[id] = true;
        self.order.push(id);
        log::trace!("graph {}: {} node {} inputs {:?}", self.name, op, id, inputs);
        Ok(id)
    }

    /// Register an existing node as the next graph parameter.
    pub fn add_parameter(&mut self, node: NodeId) -> Result<(), GraphError> {
        if !self.is_live(node) {
            return Err(GraphError::InputNotInGraph(node));
        }
        self.params.push(node);
        Ok(())
    }

    /// Synthesize the terminating `return` node over the last node appended.
    pub fn add_return(&mut self) -> Result<NodeId, GraphError> {
        if self.finished {
            return Err(GraphError::AlreadyFinished(self.name.clone()));
        }
        let last = *self
            .order
            .last()
            .ok_or_else(|| GraphError::EmptyGraph(self.name.clone()))?;
        let output = self.nodes[last].clone_output();
        self.add_op_node(Op::Return, &[last], output)
    }

    /// Seal the graph. The last node must be a `return`.
    pub fn finish(&mut self) -> Result<(), GraphError> {
        if self.finished {
            return Err(GraphError::AlreadyFinished(self.name.clone()));
        }
        match self.order.last() {
            Some(&last) if self.nodes[last].op == Some(Op::Return) => {
                self.finished = true;
                Ok(())
            }
            Some(_) => Err(GraphError::MissingReturn(self.name.clone())),
            None => Err(GraphError::EmptyGraph(self.name.clone())),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Live nodes, in graph order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn params(&self) -> &[NodeId] {
        &self.params
    }

    pub fn is_param(&self, id: NodeId) -> bool {
        self.params.contains(&id)
    }

    /// The conventional root: the final (`return`) node.
    pub fn root(&self) -> Option<NodeId> {
        self.order.last().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.live[id]
    }

    pub(crate) fn set_input(&mut self, user: NodeId, index: usize, input: NodeId) {
        self.nodes[user].inputs[index] = input;
    }

    pub(crate) fn mark_removed(&mut self, id: NodeId) {
        self.live[id] = false;
    }

    pub(crate) fn set_order(&mut self, order: Vec<NodeId>) {
        self.order = order;
    }

    /// Check the structural invariants: every input edge points to a live
    /// node appearing earlier in the ordering, and a finished graph ends in
    /// its sole `return` node.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut position: SecondaryMap<NodeId, u32> = SecondaryMap::with_default(u32::MAX);
        for (pos, &id) in self.order.iter().enumerate() {
            position[id] = pos as u32;
        }
        for (pos, &id) in self.order.iter().enumerate() {
            for &input in &self.nodes[id].inputs {
                if !self.is_live(input) {
                    return Err(GraphError::InputNotInGraph(input));
                }
                if position[input] >= pos as u32 {
                    return Err(GraphError::OrderViolation(id));
                }
            }
        }
        if self.finished {
            let returns = self
                .order
                .iter()
                .filter(|&&id| self.nodes[id].op == Some(Op::Return))
                .count();
            match self.root() {
                Some(root) if self.nodes[root].op == Some(Op::Return) && returns == 1 => {}
                _ => return Err(GraphError::MissingReturn(self.name.clone())),
            }
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "graph {} {{", self.name)?;
        for &id in &self.order {
            let node = &self.nodes[id];
            write!(f, "  {id}")?;
            if self.is_param(id) {
                write!(f, " (param)")?;
            }
            match node.op {
                Some(op) => {
                    write!(f, " = {op}(")?;
                    for (i, input) in node.inputs.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{input}")?;
                    }
                    write!(f, ")")?;
                }
                None => write!(f, " = value {}", node.output())?,
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::tensor::Tensor;

    fn dynamic_tensor() -> Value {
        Value::Tensor(Tensor::new(DataType::Float32, vec![-1]))
    }

    #[test]
    fn build_protocol() {
        let mut g = Graph::new("g");
        let x = g.add_value_node(Value::None);
        let y = g.add_value_node(Value::None);
        g.add_parameter(x).unwrap();
        g.add_parameter(y).unwrap();
        let add = g.add_op_node(Op::Add, &[x, y], dynamic_tensor()).unwrap();
        let ret = g.add_return().unwrap();
        g.finish().unwrap();
        assert_eq!(g.params(), &[x, y]);
        assert_eq!(g.order(), &[x, y, add, ret]);
        assert_eq!(g.root(), Some(ret));
        assert_eq!(g.node(ret).op, Some(Op::Return));
        assert_eq!(g.node(ret).inputs.as_slice(), &[add]);
        g.validate().unwrap();
    }

    #[test]
    fn edges_must_point_backwards() {
        let mut g = Graph::new("g");
        let x = g.add_value_node(Value::None);
        let bogus = NodeId::from_u32(42);
        assert!(matches!(
            g.add_op_node(Op::Neg, &[bogus], dynamic_tensor()),
            Err(GraphError::InputNotInGraph(_))
        ));
        assert!(g.add_op_node(Op::Neg, &[x], dynamic_tensor()).is_ok());
    }

    #[test]
    fn finish_requires_return() {
        let mut g = Graph::new("g");
        g.add_value_node(Value::None);
        assert!(matches!(g.finish(), Err(GraphError::MissingReturn(_))));
        g.add_return().unwrap();
        g.finish().unwrap();
        assert!(matches!(g.add_return(), Err(GraphError::AlreadyFinished(_))));
    }

    #[test]
    fn empty_graph_cannot_return() {
        let mut g = Graph::new("g");
        assert!(matches!(g.add_return(), Err(GraphError::EmptyGraph(_))));
    }

    #[test]
    fn display_lists_nodes() {
        let mut g = Graph::new("g");
        let x = g.add_value_node(Value::Int(1));
        g.add_parameter(x).unwrap();
        let neg = g.add_op_node(Op::Neg, &[x], dynamic_tensor()).unwrap();
        let text = g.to_string();
        assert!(text.contains("graph g {"));
        assert!(text.contains("(param)"));
        assert!(text.contains(&format!("{neg} = neg({x})")));
    }
}
