//! The bytecode model: code objects, instructions and their pools.

use core::fmt;

use cranelift_entity::{entity_impl, PrimaryMap};

/// An opaque reference to a [`Code`] object in a [`CompiledProgram`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct CodeId(u32);
entity_impl!(CodeId, "code");

/// What a code object compiles.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CodeKind {
    Module,
    Graph,
    Function,
    Block,
}

impl CodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CodeKind::Module => "module",
            CodeKind::Graph => "graph",
            CodeKind::Function => "function",
            CodeKind::Block => "block",
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConstKind {
    Bool,
    Int,
    Float,
    Str,
}

impl ConstKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConstKind::Bool => "bool",
            ConstKind::Int => "int",
            ConstKind::Float => "float",
            ConstKind::Str => "str",
        }
    }
}

/// A pooled constant. The textual form is kept as written; the VM converts
/// at load time.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Constant {
    pub kind: ConstKind,
    pub text: String,
}

/// Comparison selector carried in a `Compare` instruction's operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CmpOp {
    pub const ALL: &'static [CmpOp] =
        &[CmpOp::Eq, CmpOp::Ne, CmpOp::Gt, CmpOp::Lt, CmpOp::Ge, CmpOp::Le];

    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
        }
    }

    pub fn to_offset(self) -> i64 {
        self as i64
    }

    pub fn from_offset(offset: i64) -> Option<CmpOp> {
        CmpOp::ALL.get(usize::try_from(offset).ok()?).copied()
    }
}

/// The instruction set. Operands are indices into the symbol/constant
/// pools, jump targets, argument counts or selector ids, depending on the
/// opcode.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Opcode {
    LoadConst,
    LoadName,
    StoreName,
    LoadLocal,
    StoreLocal,
    LoadGlobal,
    StoreGlobal,
    PopTop,
    BinaryAdd,
    BinarySub,
    BinaryMul,
    BinaryDiv,
    Compare,
    Jump,
    JumpTrue,
    JumpFalse,
    DoCall,
    ReturnVal,
    DefineFunc,
    DefineGraph,
    EnterBlock,
    LoadIntrin,
    CallIntrin,
    LoadOps,
    CallOps,
    StdCin,
    StdCout,
}

impl Opcode {
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::LoadConst => "LoadConst",
            Opcode::LoadName => "LoadName",
            Opcode::StoreName => "StoreName",
            Opcode::LoadLocal => "LoadLocal",
            Opcode::StoreLocal => "StoreLocal",
            Opcode::LoadGlobal => "LoadGlobal",
            Opcode::StoreGlobal => "StoreGlobal",
            Opcode::PopTop => "PopTop",
            Opcode::BinaryAdd => "BinaryAdd",
            Opcode::BinarySub => "BinarySub",
            Opcode::BinaryMul => "BinaryMul",
            Opcode::BinaryDiv => "BinaryDiv",
            Opcode::Compare => "Compare",
            Opcode::Jump => "Jump",
            Opcode::JumpTrue => "JumpTrue",
            Opcode::JumpFalse => "JumpFalse",
            Opcode::DoCall => "DoCall",
            Opcode::ReturnVal => "ReturnVal",
            Opcode::DefineFunc => "DefineFunc",
            Opcode::DefineGraph => "DefineGraph",
            Opcode::EnterBlock => "EnterBlock",
            Opcode::LoadIntrin => "LoadIntrin",
            Opcode::CallIntrin => "CallIntrin",
            Opcode::LoadOps => "LoadOps",
            Opcode::CallOps => "CallOps",
            Opcode::StdCin => "StdCin",
            Opcode::StdCout => "StdCout",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instruction: opcode, operand, source line.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Inst {
    pub op: Opcode,
    pub offset: i64,
    pub line: u32,
}

/// A compiled function, graph, block or module.
#[derive(Debug)]
pub struct Code {
    pub kind: CodeKind,
    pub name: String,
    /// The symbol pool; local-variable slots index into it.
    pub symbols: Vec<String>,
    pub constants: Vec<Constant>,
    pub insts: Vec<Inst>,
    pub arg_names: Vec<String>,
    /// Local-variable slot of each formal parameter.
    pub arg_indexes: Vec<usize>,
    pub arg_defaults: Vec<Option<Constant>>,
}

impl Code {
    pub fn new(kind: CodeKind, name: impl Into<String>) -> Code {
        Code {
            kind,
            name: name.into(),
            symbols: Vec::new(),
            constants: Vec::new(),
            insts: Vec::new(),
            arg_names: Vec::new(),
            arg_indexes: Vec::new(),
            arg_defaults: Vec::new(),
        }
    }

    pub fn find_symbol(&self, name: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s == name)
    }

    /// The symbol's index, registering it on first use.
    pub fn intern_symbol(&mut self, name: &str) -> usize {
        match self.find_symbol(name) {
            Some(index) => index,
            None => {
                self.symbols.push(name.to_string());
                self.symbols.len() - 1
            }
        }
    }

    pub fn find_constant(&self, constant: &Constant) -> Option<usize> {
        self.constants.iter().position(|c| c == constant)
    }

    pub fn intern_constant(&mut self, constant: Constant) -> usize {
        match self.find_constant(&constant) {
            Some(index) => index,
            None => {
                self.constants.push(constant);
                self.constants.len() - 1
            }
        }
    }

    pub fn emit(&mut self, op: Opcode, offset: i64, line: u32) {
        self.insts.push(Inst { op, offset, line });
    }

    pub fn last_opcode(&self) -> Option<Opcode> {
        self.insts.last().map(|inst| inst.op)
    }
}

/// The compiler's output: the code arena, with `codes[0]` the module.
#[derive(Debug)]
pub struct CompiledProgram {
    pub codes: PrimaryMap<CodeId, Code>,
    pub file: String,
    /// Intrinsic names occupy module symbol indices `[0, intrinsic_count)`.
    pub intrinsic_count: usize,
}

impl CompiledProgram {
    pub fn module_code(&self) -> CodeId {
        CodeId::from_u32(0)
    }

    pub fn code(&self, id: CodeId) -> &Code {
        &self.codes[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmp_offsets_round_trip() {
        for &cmp in CmpOp::ALL {
            assert_eq!(CmpOp::from_offset(cmp.to_offset()), Some(cmp));
        }
        assert_eq!(CmpOp::from_offset(-1), None);
        assert_eq!(CmpOp::from_offset(99), None);
    }

    #[test]
    fn pools_dedup() {
        let mut code = Code::new(CodeKind::Module, "m");
        assert_eq!(code.intern_symbol("x"), 0);
        assert_eq!(code.intern_symbol("y"), 1);
        assert_eq!(code.intern_symbol("x"), 0);
        let two = Constant { kind: ConstKind::Int, text: "2".into() };
        assert_eq!(code.intern_constant(two.clone()), 0);
        assert_eq!(code.intern_constant(two), 0);
        // Same text, different kind is a different constant.
        assert_eq!(
            code.intern_constant(Constant { kind: ConstKind::Str, text: "2".into() }),
            1
        );
    }
}
