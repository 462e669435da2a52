//! The AST walker producing code objects.
//!
//! `codes[0]` is always the module (or, in single-function mode, the
//! preset function/graph code). Intrinsic names are pre-installed at the
//! front of the module symbol pool; a call to a bare name resolving into
//! that prefix compiles to `LoadIntrin`/`CallIntrin` instead of
//! `LoadGlobal`/`DoCall`.

use cranelift_entity::PrimaryMap;

use da_frontend::ast::{ExprId, ExprKind, FuncDecl, LitKind, Module, StmtId, StmtKind};
use da_frontend::BinOp;
use da_ops::Op;

use crate::code::{
    CmpOp, Code, CodeId, CodeKind, CompiledProgram, ConstKind, Constant, Opcode,
};
use crate::{CompileError, CompileResult};

/// Names pre-installed in the module symbol pool, in intrinsic-id order.
pub const INTRINSIC_NAMES: &[&str] =
    &["bool", "int", "float", "str", "list", "set", "dict", "tensor", "print"];

#[derive(Copy, Clone, Default)]
pub struct CompileOptions {
    /// Compile a single pre-seeded function instead of a module.
    pub single_function: bool,
    /// In single-function mode, force the code kind to `Graph`.
    pub force_graph: bool,
}

pub struct Compiler<'a> {
    ast: &'a Module,
    file: String,
    opts: CompileOptions,
    codes: PrimaryMap<CodeId, Code>,
    stack: Vec<CodeId>,
}

impl<'a> Compiler<'a> {
    pub fn new(ast: &'a Module, file: &str) -> Compiler<'a> {
        Compiler::with_options(ast, file, CompileOptions::default())
    }

    pub fn with_options(ast: &'a Module, file: &str, opts: CompileOptions) -> Compiler<'a> {
        Compiler {
            ast,
            file: file.to_string(),
            opts,
            codes: PrimaryMap::new(),
            stack: Vec::new(),
        }
    }

    /// Walk the module and produce the program.
    pub fn compile(mut self) -> CompileResult<CompiledProgram> {
        let (kind, name) = if self.opts.single_function {
            let kind = if self.opts.force_graph { CodeKind::Graph } else { CodeKind::Function };
            (kind, "@single/".to_string())
        } else {
            (CodeKind::Module, self.file.clone())
        };
        let module_id = self.codes.push(Code::new(kind, name));
        self.stack.push(module_id);
        for &name in INTRINSIC_NAMES {
            self.codes[module_id].symbols.push(name.to_string());
        }

        let ast = self.ast;
        for &stmt in &ast.body {
            self.compile_stmt(stmt)?;
        }
        log::debug!("compiled {} code object(s) from {}", self.codes.len(), self.file);
        Ok(CompiledProgram {
            codes: self.codes,
            file: self.file,
            intrinsic_count: INTRINSIC_NAMES.len(),
        })
    }

    fn err(&self, line: u32, col: u32, message: impl Into<String>) -> CompileError {
        CompileError { file: self.file.clone(), line, col, message: message.into() }
    }

    fn current(&self) -> CodeId {
        self.stack.last().copied().unwrap_or_else(|| CodeId::from_u32(0))
    }

    fn code_ref(&self) -> &Code {
        &self.codes[self.current()]
    }

    fn code_mut(&mut self) -> &mut Code {
        let id = self.current();
        &mut self.codes[id]
    }

    fn module_mut(&mut self) -> &mut Code {
        &mut self.codes[CodeId::from_u32(0)]
    }

    fn module_find(&self, name: &str) -> Option<usize> {
        self.codes[CodeId::from_u32(0)].find_symbol(name)
    }

    fn emit(&mut self, op: Opcode, offset: i64, line: u32) {
        self.code_mut().emit(op, offset, line);
    }

    fn insts_len(&self) -> usize {
        self.code_ref().insts.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        self.code_mut().insts[at].offset = target as i64;
    }

    fn compile_stmt(&mut self, id: StmtId) -> CompileResult<()> {
        let ast = self.ast;
        let stmt = ast.stmt(id);
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.compile_expr(*expr)?;
                self.emit(Opcode::PopTop, 0, stmt.line);
                Ok(())
            }
            StmtKind::Assign { target, value } => {
                let target_expr = ast.expr(*target);
                let ExprKind::Name(name) = &target_expr.kind else {
                    return Err(self.err(
                        target_expr.line,
                        target_expr.col,
                        "assignment target must be a name",
                    ));
                };
                let name = name.clone();
                self.compile_expr(*value)?;
                let index = self.code_mut().intern_symbol(&name);
                self.emit(Opcode::StoreLocal, index as i64, target_expr.line);
                Ok(())
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => {
                        self.compile_expr(*value)?;
                        self.emit(Opcode::ReturnVal, 0, stmt.line);
                    }
                    None => self.emit(Opcode::ReturnVal, -1, stmt.line),
                }
                Ok(())
            }
            StmtKind::If { cond, then_body, else_body } => {
                let cond_line = ast.expr(*cond).line;
                self.compile_expr(*cond)?;
                self.emit(Opcode::JumpFalse, 0, cond_line);
                let jump_false_at = self.insts_len() - 1;

                for &s in then_body {
                    self.compile_stmt(s)?;
                }
                // A then-branch ending in `return` never falls through, so
                // the jump over the else-branch is dead weight.
                let then_returns = then_body
                    .last()
                    .is_some_and(|&s| matches!(ast.stmt(s).kind, StmtKind::Return(_)));
                let mut jump_at = None;
                if !else_body.is_empty() && !then_returns {
                    self.emit(Opcode::Jump, 0, cond_line);
                    jump_at = Some(self.insts_len() - 1);
                }
                let else_target = self.insts_len();
                self.patch(jump_false_at, else_target);
                for &s in else_body {
                    self.compile_stmt(s)?;
                }
                if let Some(at) = jump_at {
                    let end = self.insts_len();
                    self.patch(at, end);
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                let cond_at = self.insts_len();
                let cond_line = ast.expr(*cond).line;
                self.compile_expr(*cond)?;
                self.emit(Opcode::JumpFalse, 0, cond_line);
                let jump_false_at = self.insts_len() - 1;
                for &s in body {
                    self.compile_stmt(s)?;
                }
                self.emit(Opcode::Jump, cond_at as i64, cond_line);
                let end = self.insts_len();
                self.patch(jump_false_at, end);
                Ok(())
            }
            StmtKind::Function(decl) => self.compile_callable(decl, false, stmt.line),
            StmtKind::Graph(decl) => self.compile_callable(decl, true, stmt.line),
            StmtKind::Block(body) => {
                for &s in body {
                    self.compile_stmt(s)?;
                }
                Ok(())
            }
            StmtKind::StdCin(target) => {
                let target_expr = ast.expr(*target);
                let ExprKind::Name(name) = &target_expr.kind else {
                    return Err(self.err(
                        target_expr.line,
                        target_expr.col,
                        "cin target must be a name",
                    ));
                };
                let name = name.clone();
                let index = self.code_mut().intern_symbol(&name);
                self.emit(Opcode::StdCin, index as i64, target_expr.line);
                Ok(())
            }
            StmtKind::StdCout(value) => {
                self.compile_expr(*value)?;
                self.emit(Opcode::StdCout, 0, stmt.line);
                Ok(())
            }
        }
    }

    fn compile_callable(&mut self, decl: &FuncDecl, graph: bool, line: u32) -> CompileResult<()> {
        if self.opts.single_function && self.stack.len() == 1 && self.insts_len() == 0 {
            // Single-function mode compiles the body straight into the
            // preset code; no define/store wrapping.
            let name = decl.name.clone();
            self.code_mut().name.push_str(&name);
            self.register_params(decl)?;
            for &s in &decl.body.clone() {
                self.compile_stmt(s)?;
            }
            if self.code_ref().last_opcode() != Some(Opcode::ReturnVal) {
                self.emit(Opcode::ReturnVal, -1, line);
            }
            return Ok(());
        }

        let symbol = self.module_mut().intern_symbol(&decl.name);
        let define = if graph { Opcode::DefineGraph } else { Opcode::DefineFunc };
        let code_index = self.codes.len() as i64;
        self.emit(define, code_index, line);

        let kind = if graph { CodeKind::Graph } else { CodeKind::Function };
        let new_id = self.codes.push(Code::new(kind, decl.name.clone()));
        self.stack.push(new_id);
        self.register_params(decl)?;
        for &s in &decl.body.clone() {
            self.compile_stmt(s)?;
        }
        if self.code_ref().last_opcode() != Some(Opcode::ReturnVal) {
            self.emit(Opcode::ReturnVal, -1, line);
        }
        self.stack.pop();
        self.emit(Opcode::StoreGlobal, symbol as i64, line);
        Ok(())
    }

    /// Register formal parameters at the front of the new code's symbol
    /// pool. A duplicate name is a compile error.
    fn register_params(&mut self, decl: &FuncDecl) -> CompileResult<()> {
        let ast = self.ast;
        for (position, param) in decl.params.iter().enumerate() {
            let default = match param.default {
                None => None,
                Some(expr) => match &ast.expr(expr).kind {
                    ExprKind::Literal { kind, text } => {
                        Some(Constant { kind: const_kind(*kind), text: text.clone() })
                    }
                    _ => {
                        return Err(self.err(
                            param.line,
                            param.col,
                            format!("invalid default for parameter[{position}]: {}", param.name),
                        ));
                    }
                },
            };
            if self.code_ref().find_symbol(&param.name).is_some() {
                let name = param.name.clone();
                return Err(self.err(
                    param.line,
                    param.col,
                    format!("invalid parameter[{position}]: {name}, already defined before"),
                ));
            }
            let code = self.code_mut();
            let index = code.intern_symbol(&param.name);
            code.arg_names.push(param.name.clone());
            code.arg_indexes.push(index);
            code.arg_defaults.push(default);
        }
        Ok(())
    }

    fn compile_expr(&mut self, id: ExprId) -> CompileResult<()> {
        let ast = self.ast;
        let expr = ast.expr(id);
        match &expr.kind {
            ExprKind::Name(name) => {
                let index = self.code_ref().find_symbol(name).ok_or_else(|| {
                    self.err(expr.line, expr.col, format!("not defined name: '{name}'"))
                })?;
                self.emit(Opcode::LoadLocal, index as i64, expr.line);
                Ok(())
            }
            ExprKind::Literal { kind, text } => {
                let constant = Constant { kind: const_kind(*kind), text: text.clone() };
                let index = self.code_mut().intern_constant(constant);
                self.emit(Opcode::LoadConst, index as i64, expr.line);
                Ok(())
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.compile_expr(*lhs)?;
                self.compile_expr(*rhs)?;
                let line = ast.expr(*lhs).line;
                match op {
                    BinOp::Add => self.emit(Opcode::BinaryAdd, 0, line),
                    BinOp::Sub => self.emit(Opcode::BinarySub, 0, line),
                    BinOp::Mul => self.emit(Opcode::BinaryMul, 0, line),
                    BinOp::Div => self.emit(Opcode::BinaryDiv, 0, line),
                    compare => {
                        let cmp = match compare {
                            BinOp::Eq => CmpOp::Eq,
                            BinOp::Ne => CmpOp::Ne,
                            BinOp::Lt => CmpOp::Lt,
                            BinOp::Gt => CmpOp::Gt,
                            BinOp::Le => CmpOp::Le,
                            BinOp::Ge => CmpOp::Ge,
                            _ => unreachable!(),
                        };
                        self.emit(Opcode::Compare, cmp.to_offset(), line);
                    }
                }
                Ok(())
            }
            ExprKind::Call { callee, args } => self.compile_call(expr.line, *callee, args),
            ExprKind::Attribute { .. } => Err(self.err(
                expr.line,
                expr.col,
                "attribute expressions are only callable as ops.NAME(...)",
            )),
        }
    }

    fn compile_call(&mut self, line: u32, callee: ExprId, args: &[ExprId]) -> CompileResult<()> {
        let ast = self.ast;
        let callee_expr = ast.expr(callee);
        match &callee_expr.kind {
            ExprKind::Name(name) => {
                let global = self.module_find(name);
                match global {
                    Some(index) if index < INTRINSIC_NAMES.len() => {
                        self.emit(Opcode::LoadIntrin, index as i64, callee_expr.line);
                        for &arg in args {
                            self.compile_expr(arg)?;
                        }
                        self.emit(Opcode::CallIntrin, args.len() as i64, line);
                    }
                    _ => {
                        let name = name.clone();
                        let index =
                            global.unwrap_or_else(|| self.module_mut().intern_symbol(&name));
                        self.emit(Opcode::LoadGlobal, index as i64, callee_expr.line);
                        for &arg in args {
                            self.compile_expr(arg)?;
                        }
                        self.emit(Opcode::DoCall, args.len() as i64, line);
                    }
                }
                Ok(())
            }
            ExprKind::Attribute { base, attr } => {
                let base_expr = ast.expr(*base);
                let is_ops = matches!(&base_expr.kind, ExprKind::Name(n) if n == "ops");
                if !is_ops {
                    return Err(self.err(
                        callee_expr.line,
                        callee_expr.col,
                        "only ops.NAME(...) attribute calls are supported",
                    ));
                }
                let op = Op::from_name(attr).ok_or_else(|| {
                    self.err(
                        callee_expr.line,
                        callee_expr.col,
                        format!("not found op with name '{attr}'"),
                    )
                })?;
                self.emit(Opcode::LoadOps, op as i64, callee_expr.line);
                for &arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Opcode::CallOps, args.len() as i64, line);
                Ok(())
            }
            _ => Err(self.err(
                callee_expr.line,
                callee_expr.col,
                "call target is not callable",
            )),
        }
    }
}

fn const_kind(kind: LitKind) -> ConstKind {
    match kind {
        LitKind::Bool => ConstKind::Bool,
        LitKind::Int => ConstKind::Int,
        LitKind::Float => ConstKind::Float,
        LitKind::Str => ConstKind::Str,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use da_frontend::Parser;

    fn compile(source: &str) -> CompiledProgram {
        let module = Parser::new("test.da", source).unwrap().parse_module().unwrap();
        Compiler::new(&module, "test.da").compile().unwrap()
    }

    fn compile_err(source: &str) -> CompileError {
        let module = Parser::new("test.da", source).unwrap().parse_module().unwrap();
        Compiler::new(&module, "test.da").compile().unwrap_err()
    }

    fn opcodes(code: &Code) -> Vec<Opcode> {
        code.insts.iter().map(|i| i.op).collect()
    }

    #[test]
    fn scalar_arithmetic_sequence() {
        let program = compile("x=2+3; print(x)");
        let module = program.code(program.module_code());
        assert_eq!(
            opcodes(module),
            vec![
                Opcode::LoadConst,
                Opcode::LoadConst,
                Opcode::BinaryAdd,
                Opcode::StoreLocal,
                Opcode::LoadIntrin,
                Opcode::LoadLocal,
                Opcode::CallIntrin,
                Opcode::PopTop,
            ]
        );
        // `x` lands after the intrinsic prefix.
        assert_eq!(module.insts[3].offset as usize, INTRINSIC_NAMES.len());
        // `print` is the last intrinsic.
        assert_eq!(module.insts[4].offset as usize, INTRINSIC_NAMES.len() - 1);
        assert_eq!(module.insts[6].offset, 1);
    }

    #[test]
    fn if_else_has_one_jump_of_each_kind() {
        let program = compile("if 1<2 { print(\"a\") } else { print(\"b\") }");
        let module = program.code(program.module_code());
        let ops = opcodes(module);
        assert_eq!(ops.iter().filter(|&&op| op == Opcode::JumpFalse).count(), 1);
        assert_eq!(ops.iter().filter(|&&op| op == Opcode::Jump).count(), 1);
        // JumpFalse lands on the first else-branch instruction, the Jump
        // one past the end.
        let jump_false = module.insts.iter().find(|i| i.op == Opcode::JumpFalse).unwrap();
        let jump = module.insts.iter().find(|i| i.op == Opcode::Jump).unwrap();
        assert_eq!(module.insts[jump_false.offset as usize].op, Opcode::LoadIntrin);
        assert_eq!(jump.offset as usize, module.insts.len());
    }

    #[test]
    fn returning_then_branch_skips_the_jump() {
        let program = compile("function f(x) { if x < 1 { return 0 } else { return 1 } }");
        let f = program
            .codes
            .values()
            .find(|c| c.kind == CodeKind::Function)
            .unwrap();
        assert_eq!(opcodes(f).iter().filter(|&&op| op == Opcode::Jump).count(), 0);
        assert_eq!(opcodes(f).iter().filter(|&&op| op == Opcode::JumpFalse).count(), 1);
    }

    #[test]
    fn while_jumps_back_to_the_condition() {
        let program = compile("x = 0; while x < 3 { x = x + 1 }");
        let module = program.code(program.module_code());
        let jump = module.insts.iter().rfind(|i| i.op == Opcode::Jump).unwrap();
        // The back-edge targets the first condition instruction.
        assert_eq!(module.insts[jump.offset as usize].op, Opcode::LoadLocal);
        let jump_false = module.insts.iter().find(|i| i.op == Opcode::JumpFalse).unwrap();
        assert_eq!(jump_false.offset as usize, module.insts.len());
    }

    #[test]
    fn graph_compiles_to_its_own_code() {
        let program = compile("graph g(x, y) { return ops.add(x, y) }\ng(3, 4)");
        let module = program.code(program.module_code());
        assert!(opcodes(module).contains(&Opcode::DefineGraph));
        assert!(opcodes(module).contains(&Opcode::StoreGlobal));
        assert!(opcodes(module).contains(&Opcode::DoCall));

        let graph = program.codes.values().find(|c| c.kind == CodeKind::Graph).unwrap();
        assert_eq!(graph.name, "g");
        assert_eq!(graph.arg_names, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(graph.arg_indexes, vec![0, 1]);
        assert_eq!(
            opcodes(graph),
            vec![
                Opcode::LoadOps,
                Opcode::LoadLocal,
                Opcode::LoadLocal,
                Opcode::CallOps,
                Opcode::ReturnVal,
            ]
        );
        assert_eq!(graph.insts[0].offset, Op::Add as i64);
        assert_eq!(graph.insts[4].offset, 0);
    }

    #[test]
    fn functions_get_an_implicit_void_return() {
        let program = compile("function f() { x = 1 }");
        let f = program.codes.values().find(|c| c.kind == CodeKind::Function).unwrap();
        let last = f.insts.last().unwrap();
        assert_eq!(last.op, Opcode::ReturnVal);
        assert_ne!(last.offset, 0);
    }

    #[test]
    fn duplicate_parameter_is_an_error() {
        let err = compile_err("function f(a, a) { return a }");
        assert!(err.message.contains("already defined"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn unknown_name_is_an_error() {
        let err = compile_err("x = y + 1");
        assert!(err.message.contains("not defined name: 'y'"));
    }

    #[test]
    fn unknown_op_is_an_error() {
        let err = compile_err("graph g(x) { return ops.frobnicate(x) }");
        assert!(err.message.contains("not found op with name 'frobnicate'"));
    }

    #[test]
    fn recompilation_is_deterministic() {
        let source = "graph g(x, y) { return ops.add(x, y) }\nif 1 < 2 { print(\"a\") }\ng(1, 2)";
        let a = compile(source);
        let b = compile(source);
        assert_eq!(a.codes.len(), b.codes.len());
        for (code_a, code_b) in a.codes.values().zip(b.codes.values()) {
            assert_eq!(code_a.insts, code_b.insts);
            assert_eq!(code_a.symbols, code_b.symbols);
        }
    }

    #[test]
    fn single_function_mode_seeds_the_root_code() {
        let module = Parser::new("test.da", "function main(a) { return a }")
            .unwrap()
            .parse_module()
            .unwrap();
        let program = Compiler::with_options(
            &module,
            "test.da",
            CompileOptions { single_function: true, force_graph: true },
        )
        .compile()
        .unwrap();
        assert_eq!(program.codes.len(), 1);
        let root = program.code(program.module_code());
        assert_eq!(root.kind, CodeKind::Graph);
        assert_eq!(root.name, "@single/main");
        assert_eq!(root.arg_names, vec!["a".to_string()]);
    }
}
