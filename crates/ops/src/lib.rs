//! The closed registry of operator kinds.
//!
//! Every tensor-producing instruction in the bytecode and every node in a
//! computation graph refers to one of the operators enumerated here. The
//! registry is deliberately closed: the compiler resolves `ops.NAME` at
//! compile time with [`Op::from_name`], and everything downstream (shape
//! inference, kernel binding, lifetime analysis) keys off the classification
//! methods on [`Op`].

use core::fmt;

/// A macro listing every operator exactly once, so the enum, the name table
/// and the iteration order can never drift apart.
macro_rules! for_each_op {
    ($m:ident) => {
        $m! {
            (Add, "add"),
            (Sub, "sub"),
            (Mul, "mul"),
            (Div, "div"),
            (MatMul, "matmul"),
            (Neg, "neg"),
            (Relu, "relu"),
            (Unique, "unique"),
            (MakeTuple, "make_tuple"),
            (TupleGetItem, "tuple_getitem"),
            (Return, "return"),
            (Depend, "depend"),
            (UpdateState, "update_state"),
            (Load, "load"),
            (End, "end"),
        }
    };
}

macro_rules! define_op {
    ($(($variant:ident, $name:expr)),* $(,)?) => {
        /// An operator kind.
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
        pub enum Op {
            $($variant),*
        }

        impl Op {
            /// Every operator, in registry order.
            pub const ALL: &'static [Op] = &[$(Op::$variant),*];

            /// The registry name of this operator. Total.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Op::$variant => $name),*
                }
            }

            /// Look an operator up by its registry name.
            ///
            /// Returns `None` for unknown names; callers report the failure
            /// with their own error type (the compiler as a compile error,
            /// the VM as a runtime error).
            pub fn from_name(name: &str) -> Option<Op> {
                match name {
                    $($name => Some(Op::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

for_each_op!(define_op);

impl Op {
    /// Structural operators do not compute data and never launch a kernel.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Op::MakeTuple | Op::TupleGetItem | Op::Return | Op::Depend | Op::UpdateState | Op::Load
        )
    }

    /// For operators whose output shares storage with one of their inputs,
    /// the index of that input.
    ///
    /// Such nodes never allocate output memory; shape inference copies the
    /// designated input's shape and borrows its storage.
    pub fn aliased_input(self) -> Option<usize> {
        match self {
            Op::Return | Op::Depend | Op::Load | Op::UpdateState => Some(0),
            _ => None,
        }
    }

    /// Operators excluded from refcount-driven storage recycling.
    pub fn skips_refcount(self) -> bool {
        matches!(self, Op::End | Op::Load | Op::UpdateState)
    }

    /// Whether the kernel must synchronize its stream inside `launch` and
    /// update the output shape afterwards (the `unique` family).
    pub fn updates_shape_after_launch(self) -> bool {
        matches!(self, Op::Unique)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        for &op in Op::ALL {
            assert_eq!(Op::from_name(op.as_str()), Some(op));
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert_eq!(Op::from_name("definitely_not_an_op"), None);
        assert_eq!(Op::from_name(""), None);
        // Registry names are exact; no case folding.
        assert_eq!(Op::from_name("Add"), None);
    }

    #[test]
    fn classifications_are_consistent() {
        for &op in Op::ALL {
            if let Some(idx) = op.aliased_input() {
                assert_eq!(idx, 0, "only input 0 aliasing is defined");
            }
        }
        // Alias ops are all structural except none; every alias op is structural
        // or excluded from recycling, never a plain compute op.
        for &op in &[Op::Return, Op::Depend, Op::Load, Op::UpdateState] {
            assert!(op.aliased_input().is_some());
        }
        assert!(Op::End.skips_refcount());
        assert!(!Op::Add.is_structural());
        assert!(Op::Unique.updates_shape_after_launch());
    }
}
