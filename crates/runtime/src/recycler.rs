//! The refcount-driven storage recycler.
//!
//! Before the first run the recycler walks the graph and counts, for every
//! node, how many consumers reference it. At run time a consumer's inputs
//! are decremented once that consumer has been submitted to launch; a node
//! whose count reaches zero has its output storage returned to the pool,
//! unless it is a graph output or a parameter. Output-aliases-input
//! consumers hold their aliased input until they are recycled themselves;
//! ops flagged skip-refcount take no part at all.

use core::sync::atomic::{AtomicI64, Ordering};

use da_ir::{Graph, NodeId, Value};

pub struct Recycler {
    /// Remaining consumers per node, indexed by node number.
    counts: Vec<AtomicI64>,
    /// The per-run starting counts.
    base: Vec<i64>,
    /// `deferred[c]` lists the inputs whose decrement waits until consumer
    /// `c` is recycled (its output aliases them).
    deferred: Vec<Vec<NodeId>>,
    /// Nodes whose storage is visible outside the run (the root and its
    /// alias chain) or owned externally (parameters, value nodes).
    pinned: Vec<bool>,
}

impl Recycler {
    pub fn build(graph: &Graph) -> Recycler {
        let len = graph
            .order()
            .iter()
            .map(|id| id.as_u32() as usize + 1)
            .max()
            .unwrap_or(0);
        let mut base = vec![0i64; len];
        let mut deferred = vec![Vec::new(); len];
        let mut pinned = vec![false; len];

        for &id in graph.order() {
            let node = graph.node(id);
            let Some(op) = node.op else {
                // Value nodes (parameters, constants) own no recyclable
                // storage and consume nothing.
                pinned[id.as_u32() as usize] = true;
                continue;
            };
            if op.is_structural() && op.aliased_input().is_none() {
                // make_tuple and friends repackage their inputs.
                pinned[id.as_u32() as usize] = true;
            }
            if op.skips_refcount() {
                continue;
            }
            let alias = op.aliased_input();
            for (index, &input) in node.inputs.iter().enumerate() {
                base[input.as_u32() as usize] += 1;
                if alias == Some(index) {
                    deferred[id.as_u32() as usize].push(input);
                }
            }
        }

        // The root's storage is the run's result; everything it aliases
        // into must survive the run too.
        let mut cursor = graph.root();
        while let Some(id) = cursor {
            pinned[id.as_u32() as usize] = true;
            let node = graph.node(id);
            cursor = node
                .op
                .and_then(|op| op.aliased_input())
                .and_then(|index| node.inputs.get(index).copied());
        }

        let counts = base.iter().map(|&c| AtomicI64::new(c)).collect();
        Recycler { counts, base, deferred, pinned }
    }

    /// Restore the starting counts for a new run.
    pub fn reset(&self) {
        for (count, &start) in self.counts.iter().zip(&self.base) {
            count.store(start, Ordering::Relaxed);
        }
    }

    pub fn remaining(&self, id: NodeId) -> i64 {
        self.counts[id.as_u32() as usize].load(Ordering::Acquire)
    }

    /// Called once consumer `id` has been submitted to launch: decrement
    /// every input except the ones this consumer aliases.
    pub fn consumer_submitted(&self, graph: &Graph, id: NodeId) {
        let node = graph.node(id);
        let Some(op) = node.op else {
            return;
        };
        if op.skips_refcount() {
            return;
        }
        let alias = op.aliased_input();
        for (index, &input) in node.inputs.iter().enumerate() {
            if alias == Some(index) {
                continue;
            }
            self.decrement(graph, input);
        }
    }

    fn decrement(&self, graph: &Graph, id: NodeId) {
        let idx = id.as_u32() as usize;
        if self.counts[idx].fetch_sub(1, Ordering::AcqRel) == 1 {
            self.recycle(graph, id);
        }
    }

    /// A node with no remaining consumers: free its storage (unless pinned)
    /// and propagate the decrements it was holding back.
    fn recycle(&self, graph: &Graph, id: NodeId) {
        let idx = id.as_u32() as usize;
        if !self.pinned[idx] {
            let node = graph.node(id);
            if let Value::Tensor(tensor) = &*node.output() {
                if let Some(storage) = tensor.storage() {
                    log::trace!("recycler: releasing storage of {id}");
                    storage.release();
                }
            }
        }
        for &held in &self.deferred[idx] {
            self.decrement(graph, held);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use da_ir::{DataType, Device, Storage, StorageAllocator, Tensor};
    use da_ops::Op;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingAlloc {
        live: AtomicUsize,
    }

    impl StorageAllocator for CountingAlloc {
        fn allocate(&self, size: usize, _stream: u32) -> Option<*mut u8> {
            self.live.fetch_add(1, Ordering::SeqCst);
            let layout = std::alloc::Layout::from_size_align(size.max(1), 8).ok()?;
            Some(unsafe { std::alloc::alloc_zeroed(layout) })
        }

        fn free(&self, _ptr: *mut u8) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn tensor_with_storage(alloc: &Arc<CountingAlloc>) -> Value {
        let storage =
            Storage::new_allocated(64, Device::CPU, 0, alloc.clone() as Arc<dyn StorageAllocator>)
                .unwrap();
        Value::Tensor(Tensor::with_storage(DataType::Float32, vec![16], storage))
    }

    #[test]
    fn chain_frees_intermediates_only() {
        let alloc = Arc::new(CountingAlloc { live: AtomicUsize::new(0) });
        let mut g = Graph::new("g");
        let p = g.add_value_node(Value::None);
        g.add_parameter(p).unwrap();
        let a = g.add_op_node(Op::Relu, &[p], tensor_with_storage(&alloc)).unwrap();
        let b = g.add_op_node(Op::Relu, &[a], tensor_with_storage(&alloc)).unwrap();
        let c = g.add_op_node(Op::Relu, &[b], tensor_with_storage(&alloc)).unwrap();
        let ret = g.add_return().unwrap();
        g.finish().unwrap();

        let recycler = Recycler::build(&g);
        recycler.reset();
        assert_eq!(alloc.live.load(Ordering::SeqCst), 3);

        recycler.consumer_submitted(&g, a);
        // p hit zero but is a parameter; nothing freed.
        assert_eq!(alloc.live.load(Ordering::SeqCst), 3);

        recycler.consumer_submitted(&g, b);
        // a's storage goes back to the pool.
        assert_eq!(alloc.live.load(Ordering::SeqCst), 2);
        assert!(g.node(a).output().as_tensor().unwrap().data_ptr().is_null());

        recycler.consumer_submitted(&g, c);
        assert_eq!(alloc.live.load(Ordering::SeqCst), 1);

        // The return aliases c; submitting it must not free c's storage.
        recycler.consumer_submitted(&g, ret);
        assert_eq!(alloc.live.load(Ordering::SeqCst), 1);
        assert_eq!(recycler.remaining(c), 1);
        assert!(!g.node(c).output().as_tensor().unwrap().data_ptr().is_null());
    }

    #[test]
    fn reset_restores_counts() {
        let alloc = Arc::new(CountingAlloc { live: AtomicUsize::new(0) });
        let mut g = Graph::new("g");
        let p = g.add_value_node(Value::None);
        g.add_parameter(p).unwrap();
        let a = g.add_op_node(Op::Relu, &[p], tensor_with_storage(&alloc)).unwrap();
        let b = g.add_op_node(Op::Relu, &[a], tensor_with_storage(&alloc)).unwrap();
        g.add_return().unwrap();
        g.finish().unwrap();

        let recycler = Recycler::build(&g);
        recycler.reset();
        recycler.consumer_submitted(&g, b);
        assert_eq!(recycler.remaining(a), 0);
        recycler.reset();
        assert_eq!(recycler.remaining(a), 1);
    }
}
