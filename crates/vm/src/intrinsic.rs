//! The intrinsic ids. They mirror the intrinsic-name prefix the compiler
//! pre-installs in the module symbol pool, so a `LoadIntrin` operand is
//! both a symbol index and an intrinsic id.

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Intrinsic {
    Bool,
    Int,
    Float,
    Str,
    List,
    Set,
    Dict,
    Tensor,
    Print,
}

impl Intrinsic {
    pub const ALL: &'static [Intrinsic] = &[
        Intrinsic::Bool,
        Intrinsic::Int,
        Intrinsic::Float,
        Intrinsic::Str,
        Intrinsic::List,
        Intrinsic::Set,
        Intrinsic::Dict,
        Intrinsic::Tensor,
        Intrinsic::Print,
    ];

    pub fn from_index(index: i64) -> Option<Intrinsic> {
        Intrinsic::ALL.get(usize::try_from(index).ok()?).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::Bool => "bool",
            Intrinsic::Int => "int",
            Intrinsic::Float => "float",
            Intrinsic::Str => "str",
            Intrinsic::List => "list",
            Intrinsic::Set => "set",
            Intrinsic::Dict => "dict",
            Intrinsic::Tensor => "tensor",
            Intrinsic::Print => "print",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use da_compiler::INTRINSIC_NAMES;

    #[test]
    fn ids_match_the_compilers_symbol_prefix() {
        assert_eq!(Intrinsic::ALL.len(), INTRINSIC_NAMES.len());
        for (intrinsic, &name) in Intrinsic::ALL.iter().zip(INTRINSIC_NAMES) {
            assert_eq!(intrinsic.name(), name);
        }
        for (index, &intrinsic) in Intrinsic::ALL.iter().enumerate() {
            assert_eq!(Intrinsic::from_index(index as i64), Some(intrinsic));
        }
        assert_eq!(Intrinsic::from_index(-1), None);
        assert_eq!(Intrinsic::from_index(99), None);
    }
}
