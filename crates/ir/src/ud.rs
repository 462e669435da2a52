//! The use-def index: for every node, the ordered list of (consumer,
//! input-index) edges that reference it. Rebuilt once per pass iteration.

use rustc_hash::FxHashMap;

use crate::graph::{Graph, NodeId};

pub struct UseDefs {
    users: FxHashMap<NodeId, Vec<(NodeId, usize)>>,
    root: Option<NodeId>,
}

impl UseDefs {
    /// Build the index from a graph, walking nodes from the root backwards
    /// the way the ordering guarantees definitions precede uses.
    pub fn build(graph: &Graph) -> UseDefs {
        let mut users: FxHashMap<NodeId, Vec<(NodeId, usize)>> = FxHashMap::default();
        for &id in graph.order().iter().rev() {
            for (index, &input) in graph.node(id).inputs.iter().enumerate() {
                users.entry(input).or_default().push((id, index));
            }
        }
        UseDefs { users, root: graph.root() }
    }

    pub fn users(&self, node: NodeId) -> &[(NodeId, usize)] {
        self.users.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_users(&self, node: NodeId) -> bool {
        !self.users(node).is_empty()
    }

    /// Record `node` as input `index` of `user`. Returns true when this is
    /// the node's first user.
    pub fn add_edge(&mut self, user: NodeId, index: usize, node: NodeId) -> bool {
        let list = self.users.entry(node).or_default();
        let first = list.is_empty();
        list.push((user, index));
        first
    }

    /// Drop the `(user, index)` edge from `node`'s user list. Returns true
    /// when the list became empty.
    pub fn drop_edge(&mut self, user: NodeId, index: usize, node: NodeId) -> bool {
        match self.users.get_mut(&node) {
            Some(list) => {
                list.retain(|&(u, i)| (u, i) != (user, index));
                if list.is_empty() {
                    self.users.remove(&node);
                    true
                } else {
                    false
                }
            }
            None => {
                log::trace!("use-def: {node} had no user list to drop from");
                true
            }
        }
    }

    /// Move `old`'s entire user list away, for transfer onto a replacement.
    pub fn take_users(&mut self, old: NodeId) -> Vec<(NodeId, usize)> {
        self.users.remove(&old).unwrap_or_default()
    }

    pub fn append_users(&mut self, node: NodeId, mut users: Vec<(NodeId, usize)>) {
        self.users.entry(node).or_default().append(&mut users);
    }

    pub fn is_root(&self, node: NodeId) -> bool {
        self.root == Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::tensor::Tensor;
    use crate::value::Value;
    use da_ops::Op;

    fn tensor() -> Value {
        Value::Tensor(Tensor::new(DataType::Float32, vec![-1]))
    }

    #[test]
    fn build_and_mutate() {
        let mut g = Graph::new("g");
        let x = g.add_value_node(Value::None);
        let a = g.add_op_node(Op::Neg, &[x], tensor()).unwrap();
        let b = g.add_op_node(Op::Add, &[x, a], tensor()).unwrap();
        let ret = g.add_return().unwrap();

        let mut ud = UseDefs::build(&g);
        assert!(ud.is_root(ret));
        assert_eq!(ud.users(a), &[(b, 1)]);
        assert_eq!(ud.users(x).len(), 2);
        assert_eq!(ud.users(b), &[(ret, 0)]);

        assert!(!ud.drop_edge(b, 0, x));
        assert!(ud.drop_edge(a, 0, x));
        assert!(!ud.has_users(x));
    }
}
