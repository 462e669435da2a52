//! The frame stack and the dispatch loop.

use std::io::{BufRead, Write};

use rustc_hash::FxHashMap;

use da_compiler::{CmpOp, Code, CodeId, CodeKind, CompiledProgram, ConstKind, Inst, Opcode};
use da_ir::Value;
use da_ops::Op;
use da_runtime::executor::{ExecState, GraphExecutor};

use crate::intrinsic::Intrinsic;
use crate::slot::Slot;
use crate::{VmError, VmResult};

/// One call record: program counter, operand stack, local variables and
/// the dynamically-introduced name bindings.
struct Frame {
    code: CodeId,
    kind: CodeKind,
    pc: usize,
    stack: Vec<Slot>,
    vars: Vec<Slot>,
    names: FxHashMap<String, Slot>,
}

impl Frame {
    fn new(code: CodeId, kind: CodeKind, symbol_count: usize) -> Frame {
        Frame {
            code,
            kind,
            pc: 0,
            stack: Vec::new(),
            vars: vec![Slot::Invalid; symbol_count],
            names: FxHashMap::default(),
        }
    }
}

enum Flow {
    Continue,
    Finished(Slot),
}

pub struct Vm {
    file: String,
    program: CompiledProgram,
    frames: Vec<Frame>,
    executor: GraphExecutor,
    single_function: bool,
    out: Box<dyn Write>,
    input: Box<dyn BufRead>,
}

impl Vm {
    /// A VM over a compiled program, printing to stdout and reading stdin.
    /// Single-function mode is implied by the program's root code kind.
    pub fn new(program: CompiledProgram) -> VmResult<Vm> {
        let executor = GraphExecutor::new()?;
        Ok(Vm::with_executor(program, executor))
    }

    pub fn with_executor(program: CompiledProgram, executor: GraphExecutor) -> Vm {
        let single_function = program.code(program.module_code()).kind != CodeKind::Module;
        Vm {
            file: program.file.clone(),
            program,
            frames: Vec::new(),
            executor,
            single_function,
            out: Box::new(std::io::stdout()),
            input: Box::new(std::io::BufReader::new(std::io::stdin())),
        }
    }

    /// Redirect `print`/`cout` output.
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    /// Redirect `cin` input.
    pub fn set_input(&mut self, input: Box<dyn BufRead>) {
        self.input = input;
    }

    pub fn executor(&self) -> &GraphExecutor {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut GraphExecutor {
        &mut self.executor
    }

    /// Run a module program from the top.
    pub fn run(&mut self) -> VmResult<Slot> {
        self.run_args(Vec::new())
    }

    /// Run, binding `args` into the root frame's parameter slots
    /// (single-function mode).
    pub fn run_args(&mut self, args: Vec<Slot>) -> VmResult<Slot> {
        let root = self.program.module_code();
        let code = self.program.code(root);
        let kind = code.kind;
        let symbol_count = code.symbols.len();
        let arg_indexes = code.arg_indexes.clone();
        let name = code.name.clone();

        if self.single_function {
            if args.len() != arg_indexes.len() {
                return Err(self.error_at(
                    0,
                    format!(
                        "{} `{name}` takes {} arguments, got {}",
                        kind.as_str(),
                        arg_indexes.len(),
                        args.len()
                    ),
                ));
            }
            // A graph already built by a previous run is just re-run.
            if kind == CodeKind::Graph && self.executor.state() == ExecState::Built {
                let values = args
                    .into_iter()
                    .map(|slot| self.slot_to_value(slot, 0))
                    .collect::<VmResult<Vec<Value>>>()?;
                let result = self.executor.run_built(&values)?;
                return Ok(Slot::Data(result));
            }
        }

        let mut frame = Frame::new(root, kind, symbol_count);
        if self.single_function {
            let building_graph = kind == CodeKind::Graph;
            if building_graph {
                self.executor.begin_graph(&name)?;
            }
            for (position, arg) in args.into_iter().enumerate() {
                let slot = if building_graph {
                    let value = self.slot_to_value(arg, 0)?;
                    Slot::Tensor(self.executor.add_parameter(value)?)
                } else {
                    arg
                };
                frame.vars[arg_indexes[position]] = slot;
            }
        }
        self.frames.push(frame);
        self.execute()
    }

    fn execute(&mut self) -> VmResult<Slot> {
        while let Some(frame) = self.frames.last() {
            let code_id = frame.code;
            let pc = frame.pc;
            let insts_len = self.program.code(code_id).insts.len();
            if pc >= insts_len {
                // Exhausted frame.
                self.frames.pop();
                continue;
            }
            let inst: Inst = self.program.code(code_id).insts[pc];
            if let Some(frame) = self.frames.last_mut() {
                frame.pc += 1;
            }

            // Single-function programs return their top-of-stack result
            // straight from the root frame.
            if self.single_function
                && self.frames.len() == 1
                && inst.op == Opcode::ReturnVal
                && inst.offset == 0
                && self.frames.last().map(|f| f.stack.len()) == Some(1)
            {
                if self.frames.last().map(|f| f.kind) == Some(CodeKind::Graph)
                    && self.executor.state() == ExecState::Building
                {
                    self.executor.finish_graph()?;
                    self.executor.opt_graph()?;
                    self.executor.build_kernels()?;
                }
                let result = self
                    .frames
                    .last_mut()
                    .and_then(|f| f.stack.pop())
                    .unwrap_or(Slot::Void);
                self.frames.clear();
                return Ok(result);
            }

            match self.dispatch(inst)? {
                Flow::Continue => {}
                Flow::Finished(slot) => return Ok(slot),
            }
        }
        Ok(Slot::Void)
    }

    fn dispatch(&mut self, inst: Inst) -> VmResult<Flow> {
        log::trace!("exec {} offset {}", inst.op, inst.offset);
        let line = inst.line;
        let offset = inst.offset;
        match inst.op {
            Opcode::LoadConst => self.inst_load_const(offset, line)?,
            Opcode::LoadName => self.inst_load_name(offset, line)?,
            Opcode::StoreName => self.inst_store_name(offset, line)?,
            Opcode::LoadLocal => self.inst_load_local(offset, line)?,
            Opcode::StoreLocal => self.inst_store_local(offset, line)?,
            Opcode::LoadGlobal => self.inst_load_global(offset, line)?,
            Opcode::StoreGlobal => self.inst_store_global(offset, line)?,
            Opcode::PopTop => {
                self.pop(line, "pop top")?;
            }
            Opcode::BinaryAdd | Opcode::BinarySub | Opcode::BinaryMul | Opcode::BinaryDiv => {
                self.inst_binary(inst.op, line)?;
            }
            Opcode::Compare => self.inst_compare(offset, line)?,
            Opcode::Jump => self.jump(offset, line)?,
            Opcode::JumpTrue => self.inst_jump_cond(offset, line, true)?,
            Opcode::JumpFalse => self.inst_jump_cond(offset, line, false)?,
            Opcode::DoCall => self.inst_do_call(offset, line)?,
            Opcode::ReturnVal => return self.inst_return_val(offset, line),
            Opcode::DefineFunc => {
                let slot = Slot::Function(CodeId::from_u32(offset as u32));
                self.push(slot, line)?;
            }
            Opcode::DefineGraph => {
                let slot = Slot::GraphFn(CodeId::from_u32(offset as u32));
                self.push(slot, line)?;
            }
            Opcode::EnterBlock => {
                // Blocks compile inline; the instruction is a no-op.
                log::trace!("enter block {offset}");
            }
            Opcode::LoadIntrin => self.inst_load_intrin(offset, line)?,
            Opcode::CallIntrin => self.inst_call_intrin(offset, line)?,
            Opcode::LoadOps => self.inst_load_ops(offset, line)?,
            Opcode::CallOps => self.inst_call_ops(offset, line)?,
            Opcode::StdCin => self.inst_std_cin(offset, line)?,
            Opcode::StdCout => self.inst_std_cout(line)?,
        }
        Ok(Flow::Continue)
    }

    // ---- frame and stack plumbing ----

    fn error_at(&self, line: u32, message: impl Into<String>) -> VmError {
        VmError::Runtime { file: self.file.clone(), line, message: message.into() }
    }

    fn frame(&self, line: u32) -> VmResult<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| self.error_at(line, "no frame left"))
    }

    fn frame_mut(&mut self, line: u32) -> VmResult<&mut Frame> {
        if self.frames.is_empty() {
            return Err(self.error_at(line, "no frame left"));
        }
        let index = self.frames.len() - 1;
        Ok(&mut self.frames[index])
    }

    fn push(&mut self, slot: Slot, line: u32) -> VmResult<()> {
        self.frame_mut(line)?.stack.push(slot);
        Ok(())
    }

    fn pop(&mut self, line: u32, what: &str) -> VmResult<Slot> {
        let file = self.file.clone();
        let frame = self.frame_mut(line)?;
        frame.stack.pop().ok_or(VmError::Runtime {
            file,
            line,
            message: format!("stack is empty.\nfail to {what}"),
        })
    }

    fn code(&self, id: CodeId) -> &Code {
        self.program.code(id)
    }

    fn current_code(&self, line: u32) -> VmResult<&Code> {
        let id = self.frame(line)?.code;
        Ok(self.code(id))
    }

    fn local_symbol(&self, offset: i64, line: u32) -> VmResult<String> {
        let code = self.current_code(line)?;
        code.symbols
            .get(offset as usize)
            .cloned()
            .ok_or_else(|| self.error_at(line, format!("bad symbol index {offset}")))
    }

    fn global_symbol(&self, offset: i64, line: u32) -> VmResult<String> {
        let code = self.code(self.program.module_code());
        code.symbols
            .get(offset as usize)
            .cloned()
            .ok_or_else(|| self.error_at(line, format!("bad global symbol index {offset}")))
    }

    // ---- loads and stores ----

    fn inst_load_const(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let code = self.current_code(line)?;
        let constant = code
            .constants
            .get(offset as usize)
            .ok_or_else(|| self.error_at(line, format!("bad constant index {offset}")))?
            .clone();
        let slot = match constant.kind {
            ConstKind::Bool => Slot::Bool(constant.text == "true"),
            ConstKind::Int => Slot::Int(constant.text.parse::<i64>().map_err(|_| {
                self.error_at(line, format!("invalid int constant: {}", constant.text))
            })?),
            ConstKind::Float => Slot::Float(constant.text.parse::<f64>().map_err(|_| {
                self.error_at(line, format!("invalid float constant: {}", constant.text))
            })?),
            ConstKind::Str => Slot::Str(constant.text),
        };
        self.push(slot, line)
    }

    /// Search the name in every frame, innermost first.
    fn find_loaded_name(&mut self, name: &str) -> Option<&mut Slot> {
        self.frames
            .iter_mut()
            .rev()
            .find_map(|frame| frame.names.get_mut(name))
    }

    fn inst_load_name(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let name = self.local_symbol(offset, line)?;
        let slot = match self.find_loaded_name(&name) {
            Some(slot) => slot.clone(),
            None => {
                return Err(self.error_at(line, format!("not defined symbol: '{name}'")));
            }
        };
        self.push(slot, line)
    }

    fn inst_store_name(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let name = self.local_symbol(offset, line)?;
        let value = self.pop(line, "store name")?;
        let frame = self.frame(line)?;
        if frame.names.contains_key(&name) {
            self.frame_mut(line)?.names.insert(name, value);
        } else if let Some(slot) = self.find_loaded_name(&name) {
            // The name lives in an enclosing frame; store there.
            *slot = value;
        } else {
            self.frame_mut(line)?.names.insert(name, value);
        }
        Ok(())
    }

    fn inst_load_local(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let frame = self.frame(line)?;
        let slot = frame
            .vars
            .get(offset as usize)
            .cloned()
            .ok_or_else(|| self.error_at(line, format!("bad local index {offset}")))?;
        self.push(slot, line)
    }

    fn inst_store_local(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let value = self.pop(line, "store local")?;
        let frame = self.frame_mut(line)?;
        if frame.vars.len() <= offset as usize {
            frame.vars.resize(offset as usize + 1, Slot::Invalid);
        }
        frame.vars[offset as usize] = value;
        Ok(())
    }

    fn inst_load_global(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let slot = self
            .frames
            .first()
            .and_then(|frame| frame.vars.get(offset as usize))
            .cloned()
            .ok_or_else(|| self.error_at(line, format!("bad global index {offset}")))?;
        if slot.is_invalid() {
            let name = self.global_symbol(offset, line)?;
            return Err(self.error_at(line, format!("undefined symbol '{name}'")));
        }
        self.push(slot, line)
    }

    fn inst_store_global(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let value = self.pop(line, "store global")?;
        let file = self.file.clone();
        let globals = self.frames.first_mut().ok_or(VmError::Runtime {
            file,
            line,
            message: "no frame left".into(),
        })?;
        if globals.vars.len() <= offset as usize {
            globals.vars.resize(offset as usize + 1, Slot::Invalid);
        }
        globals.vars[offset as usize] = value;
        Ok(())
    }

    // ---- arithmetic and comparison ----

    fn inst_binary(&mut self, op: Opcode, line: u32) -> VmResult<()> {
        let rhs = self.pop(line, "binary op")?;
        let lhs = self.pop(line, "binary op")?;
        let result = match (&lhs, &rhs) {
            (Slot::Int(a), Slot::Int(b)) => {
                let (a, b) = (*a, *b);
                match op {
                    Opcode::BinaryAdd => Slot::Int(a + b),
                    Opcode::BinarySub => Slot::Int(a - b),
                    Opcode::BinaryMul => Slot::Int(a * b),
                    Opcode::BinaryDiv => {
                        if b == 0 {
                            return Err(self.error_at(line, "divide by zero"));
                        }
                        Slot::Int(a / b)
                    }
                    _ => return Err(self.error_at(line, "bad binary opcode")),
                }
            }
            (Slot::Float(_) | Slot::Int(_), Slot::Float(_) | Slot::Int(_)) => {
                let a = match &lhs {
                    Slot::Float(v) => *v,
                    Slot::Int(v) => *v as f64,
                    _ => 0.0,
                };
                let b = match &rhs {
                    Slot::Float(v) => *v,
                    Slot::Int(v) => *v as f64,
                    _ => 0.0,
                };
                match op {
                    Opcode::BinaryAdd => Slot::Float(a + b),
                    Opcode::BinarySub => Slot::Float(a - b),
                    Opcode::BinaryMul => Slot::Float(a * b),
                    Opcode::BinaryDiv => Slot::Float(a / b),
                    _ => return Err(self.error_at(line, "bad binary opcode")),
                }
            }
            (Slot::Str(a), other) if op == Opcode::BinaryAdd => {
                Slot::Str(format!("{a}{}", self.slot_text(other)))
            }
            (other, Slot::Str(b)) if op == Opcode::BinaryAdd => {
                Slot::Str(format!("{}{b}", self.slot_text(other)))
            }
            (l, r) => {
                return Err(self.error_at(
                    line,
                    format!(
                        "not support binary op between '{}' and '{}'",
                        l.type_str(),
                        r.type_str()
                    ),
                ));
            }
        };
        self.push(result, line)
    }

    fn inst_compare(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let cmp = CmpOp::from_offset(offset)
            .ok_or_else(|| self.error_at(line, format!("bad compare id {offset}")))?;
        let rhs = self.pop(line, "compare")?;
        let lhs = self.pop(line, "compare")?;
        let ordering = match (&lhs, &rhs) {
            (Slot::Int(a), Slot::Int(b)) => a.partial_cmp(b),
            (Slot::Float(_) | Slot::Int(_), Slot::Float(_) | Slot::Int(_)) => {
                let a = match &lhs {
                    Slot::Float(v) => *v,
                    Slot::Int(v) => *v as f64,
                    _ => 0.0,
                };
                let b = match &rhs {
                    Slot::Float(v) => *v,
                    Slot::Int(v) => *v as f64,
                    _ => 0.0,
                };
                a.partial_cmp(&b)
            }
            (Slot::Str(a), Slot::Str(b)) => a.partial_cmp(b),
            (Slot::Bool(a), Slot::Bool(b)) if matches!(cmp, CmpOp::Eq | CmpOp::Ne) => {
                a.partial_cmp(b)
            }
            _ => None,
        };
        let Some(ordering) = ordering else {
            return Err(self.error_at(
                line,
                format!(
                    "not support to do [{}] compare between '{}' and '{}'",
                    cmp.as_str(),
                    lhs.type_str(),
                    rhs.type_str()
                ),
            ));
        };
        let result = match cmp {
            CmpOp::Eq => ordering.is_eq(),
            CmpOp::Ne => !ordering.is_eq(),
            CmpOp::Lt => ordering.is_lt(),
            CmpOp::Gt => ordering.is_gt(),
            CmpOp::Le => ordering.is_le(),
            CmpOp::Ge => ordering.is_ge(),
        };
        self.push(Slot::Bool(result), line)
    }

    // ---- control flow ----

    fn jump(&mut self, offset: i64, line: u32) -> VmResult<()> {
        if offset < 0 {
            return Err(self.error_at(line, format!("bad jump target {offset}")));
        }
        self.frame_mut(line)?.pc = offset as usize;
        Ok(())
    }

    fn inst_jump_cond(&mut self, offset: i64, line: u32, when: bool) -> VmResult<()> {
        let condition = self.pop(line, "conditional jump")?;
        let Slot::Bool(value) = condition else {
            return Err(self.error_at(
                line,
                format!("the condition type is not bool: '{}'", condition.type_str()),
            ));
        };
        if value == when {
            self.jump(offset, line)?;
        }
        Ok(())
    }

    // ---- calls ----

    fn inst_do_call(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let argc = offset as usize;
        let stack_len = self.frame(line)?.stack.len();
        if stack_len < argc + 1 {
            return Err(self.error_at(
                line,
                format!("invalid function call. stack size: {stack_len}"),
            ));
        }
        let callee_pos = stack_len - argc - 1;
        let callee = self.frame(line)?.stack[callee_pos].clone();
        let code_id = match callee {
            Slot::Function(id) | Slot::GraphFn(id) => id,
            other => {
                return Err(self.error_at(
                    line,
                    format!("call target is not callable: '{}'", other.type_str()),
                ));
            }
        };
        let kind = self.code(code_id).kind;
        let param_count = self.code(code_id).arg_names.len();
        let name = self.code(code_id).name.clone();

        if kind == CodeKind::Graph {
            match self.executor.state() {
                ExecState::Built => {
                    // Run-now: the graph is already built; bind and execute.
                    // The executor holds one graph at a time, so the call
                    // must name the graph that was built.
                    if self.executor.graph_name() != Some(name.as_str()) {
                        return Err(self.error_at(
                            line,
                            format!(
                                "graph `{name}` called while graph `{}` is current",
                                self.executor.graph_name().unwrap_or("<none>")
                            ),
                        ));
                    }
                    let args: Vec<Slot> = {
                        let frame = self.frame_mut(line)?;
                        let tail: Vec<Slot> = frame.stack.drain(callee_pos + 1..).collect();
                        frame.stack.pop();
                        tail
                    };
                    let values = args
                        .into_iter()
                        .map(|slot| self.slot_to_value(slot, line))
                        .collect::<VmResult<Vec<Value>>>()?;
                    let result = self.executor.run_built(&values)?;
                    return self.push(Slot::Data(result), line);
                }
                ExecState::Building => {
                    return Err(self.error_at(
                        line,
                        format!("graph `{name}` called while another graph is building"),
                    ));
                }
                ExecState::Idle => {
                    self.executor.begin_graph(&name)?;
                }
            }
        }

        if argc > param_count {
            return Err(self.error_at(
                line,
                format!(
                    "{} arguments size({argc}) should not exceed parameters size({param_count})",
                    kind.as_str()
                ),
            ));
        }
        if argc < param_count {
            log::warn!("{}: default parameters are not supported yet", name);
        }

        let symbol_count = self.code(code_id).symbols.len();
        let arg_indexes = self.code(code_id).arg_indexes.clone();
        let mut new_frame = Frame::new(code_id, kind, symbol_count);
        let args: Vec<Slot> = {
            let frame = self.frame_mut(line)?;
            let tail: Vec<Slot> = frame.stack.drain(callee_pos + 1..).collect();
            frame.stack.pop();
            tail
        };
        for (position, arg) in args.into_iter().enumerate() {
            let slot = if kind == CodeKind::Graph {
                // Graph arguments become parameter nodes.
                let value = self.slot_to_value(arg, line)?;
                Slot::Tensor(self.executor.add_parameter(value)?)
            } else {
                arg
            };
            new_frame.vars[arg_indexes[position]] = slot;
        }
        log::trace!("call {} `{}` with {argc} args", kind.as_str(), name);
        self.frames.push(new_frame);
        Ok(())
    }

    fn inst_return_val(&mut self, offset: i64, line: u32) -> VmResult<Flow> {
        let result = if offset == 0 {
            self.pop(line, "return value")?
        } else {
            Slot::Void
        };
        let kind = self.frame(line)?.kind;
        if kind == CodeKind::Graph && self.executor.state() == ExecState::Building {
            self.executor.finish_graph()?;
            self.executor.opt_graph()?;
            self.executor.build_kernels()?;
        }
        self.frames.pop();
        match self.frames.last_mut() {
            Some(frame) => {
                frame.stack.push(result);
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Finished(result)),
        }
    }

    // ---- intrinsics and ops ----

    fn inst_load_intrin(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let intrinsic = Intrinsic::from_index(offset)
            .ok_or_else(|| self.error_at(line, format!("bad intrinsic index {offset}")))?;
        self.push(Slot::Intrinsic(intrinsic), line)
    }

    fn inst_call_intrin(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let argc = offset as usize;
        let stack_len = self.frame(line)?.stack.len();
        if stack_len < argc + 1 {
            return Err(self.error_at(
                line,
                format!("invalid intrinsic call. stack size: {stack_len}"),
            ));
        }
        let callee_pos = stack_len - argc - 1;
        let Slot::Intrinsic(intrinsic) = self.frame(line)?.stack[callee_pos].clone() else {
            return Err(self.error_at(line, "invalid intrinsic"));
        };
        let result = match intrinsic {
            Intrinsic::Tensor => {
                if self.executor.state() != ExecState::Building {
                    return Err(
                        self.error_at(line, "tensor() is only usable while a graph is building")
                    );
                }
                let value = Value::Tensor(da_ir::Tensor::new(da_ir::DataType::Float32, vec![-1]));
                Slot::Tensor(self.executor.add_value_node(value)?)
            }
            Intrinsic::Print => {
                let top = self.frame(line)?.stack.last().cloned().unwrap_or(Slot::Void);
                let text = self.slot_text(&top);
                self.write_out(&text, line)?;
                Slot::Void
            }
            other => {
                return Err(self.error_at(
                    line,
                    format!("intrinsic '{}' is not supported", other.name()),
                ));
            }
        };
        let frame = self.frame_mut(line)?;
        frame.stack.truncate(callee_pos);
        frame.stack.push(result);
        Ok(())
    }

    fn inst_load_ops(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let op = Op::ALL
            .get(offset as usize)
            .copied()
            .ok_or_else(|| self.error_at(line, format!("bad op index {offset}")))?;
        self.push(Slot::Ops(op), line)
    }

    /// The VM never computes op results; it only emits graph nodes.
    fn inst_call_ops(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let argc = offset as usize;
        let stack_len = self.frame(line)?.stack.len();
        if stack_len < argc + 1 {
            return Err(
                self.error_at(line, format!("invalid ops call. stack size: {stack_len}"))
            );
        }
        let callee_pos = stack_len - argc - 1;
        let Slot::Ops(op) = self.frame(line)?.stack[callee_pos].clone() else {
            return Err(self.error_at(line, "invalid ops slot"));
        };
        if self.executor.state() != ExecState::Building {
            return Err(self.error_at(
                line,
                format!("ops.{op} is only usable while a graph is building"),
            ));
        }
        let args: Vec<Slot> = {
            let frame = self.frame_mut(line)?;
            let tail: Vec<Slot> = frame.stack.drain(callee_pos + 1..).collect();
            frame.stack.pop();
            tail
        };
        let mut inputs = Vec::with_capacity(args.len());
        for arg in args {
            let node = match arg {
                Slot::Tensor(id) => id,
                scalar @ (Slot::Int(_) | Slot::Float(_) | Slot::Bool(_) | Slot::Str(_)
                | Slot::Data(_)) => {
                    let value = self.slot_to_value(scalar, line)?;
                    self.executor.add_value_node(value)?
                }
                other => {
                    return Err(self.error_at(
                        line,
                        format!("ops.{op} argument is not a tensor: '{}'", other.type_str()),
                    ));
                }
            };
            inputs.push(node);
        }
        let node = self.executor.add_op_node(op, &inputs)?;
        self.push(Slot::Tensor(node), line)
    }

    // ---- standard streams ----

    fn inst_std_cin(&mut self, offset: i64, line: u32) -> VmResult<()> {
        let mut text = String::new();
        self.input
            .read_line(&mut text)
            .map_err(|e| self.error_at(line, format!("stdin read failed: {e}")))?;
        let text = text.trim_end_matches(['\n', '\r']).to_string();
        let slot = if (text.starts_with('\'') && text.ends_with('\'') && text.len() >= 2)
            || (text.starts_with('"') && text.ends_with('"') && text.len() >= 2)
        {
            Slot::Str(text[1..text.len() - 1].to_string())
        } else if text.contains('.') {
            Slot::Float(text.parse::<f64>().map_err(|_| {
                self.error_at(line, format!("invalid input for float type: {text}"))
            })?)
        } else {
            Slot::Int(text.parse::<i64>().map_err(|_| {
                self.error_at(line, format!("invalid input for int type: {text}"))
            })?)
        };
        let frame = self.frame_mut(line)?;
        if frame.vars.len() <= offset as usize {
            frame.vars.resize(offset as usize + 1, Slot::Invalid);
        }
        frame.vars[offset as usize] = slot;
        Ok(())
    }

    fn inst_std_cout(&mut self, line: u32) -> VmResult<()> {
        let slot = self.pop(line, "output by stdout")?;
        let text = self.slot_text(&slot);
        self.write_out(&text, line)
    }

    fn write_out(&mut self, text: &str, line: u32) -> VmResult<()> {
        let file = self.file.clone();
        self.out.write_all(text.as_bytes()).map_err(|e| VmError::Runtime {
            file,
            line,
            message: format!("stdout write failed: {e}"),
        })
    }

    // ---- slot conversions ----

    /// Materialize a slot as a runtime value, for graph parameter binding
    /// and run-now argument passing.
    fn slot_to_value(&self, slot: Slot, line: u32) -> VmResult<Value> {
        match slot {
            Slot::Int(v) => Ok(Value::Int(v)),
            Slot::Float(v) => Ok(Value::Double(v)),
            Slot::Bool(v) => Ok(Value::Bool(v)),
            Slot::Str(v) => Ok(Value::String(v)),
            Slot::Data(v) => Ok(v),
            Slot::Tensor(id) => Ok(self.executor.node_output(id)?),
            Slot::Void => Ok(Value::None),
            other => Err(self.error_at(
                line,
                format!("'{}' has no value representation", other.type_str()),
            )),
        }
    }

    /// The print/cout formatter.
    fn slot_text(&self, slot: &Slot) -> String {
        match slot {
            Slot::Invalid => "<invalid>".to_string(),
            Slot::Void => String::new(),
            Slot::Int(v) => v.to_string(),
            Slot::Float(v) => v.to_string(),
            Slot::Bool(v) => v.to_string(),
            Slot::Str(v) => v.clone(),
            Slot::Data(v) => v.to_string(),
            Slot::Tensor(id) => match self.executor.node_output(*id) {
                Ok(value) => value.to_string(),
                Err(_) => format!("tensor({id})"),
            },
            Slot::Function(_) => "<function>".to_string(),
            Slot::GraphFn(_) => "<graph>".to_string(),
            Slot::Intrinsic(i) => format!("<intrinsic {}>", i.name()),
            Slot::Ops(op) => format!("<ops.{op}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::PrimaryMap;
    use da_compiler::{Constant, ConstKind};

    fn inst(op: Opcode, offset: i64) -> Inst {
        Inst { op, offset, line: 1 }
    }

    /// A module program assembled by hand, for the opcodes the compiler
    /// does not currently emit.
    fn hand_program(
        symbols: &[&str],
        constants: Vec<Constant>,
        insts: Vec<Inst>,
    ) -> CompiledProgram {
        let mut code = Code::new(CodeKind::Module, "hand.da");
        code.symbols = symbols.iter().map(|s| s.to_string()).collect();
        code.constants = constants;
        code.insts = insts;
        let mut codes = PrimaryMap::new();
        codes.push(code);
        CompiledProgram { codes, file: "hand.da".into(), intrinsic_count: 0 }
    }

    fn int_const(text: &str) -> Constant {
        Constant { kind: ConstKind::Int, text: text.into() }
    }

    #[test]
    fn store_name_then_load_name() {
        let program = hand_program(
            &["x"],
            vec![int_const("7")],
            vec![
                inst(Opcode::LoadConst, 0),
                inst(Opcode::StoreName, 0),
                inst(Opcode::LoadName, 0),
                inst(Opcode::ReturnVal, 0),
            ],
        );
        let mut vm = Vm::new(program).unwrap();
        let result = vm.run().unwrap();
        assert!(matches!(result, Slot::Int(7)));
    }

    #[test]
    fn load_name_without_a_binding_fails() {
        let program = hand_program(
            &["y"],
            vec![],
            vec![inst(Opcode::LoadName, 0), inst(Opcode::ReturnVal, 0)],
        );
        let mut vm = Vm::new(program).unwrap();
        let err = vm.run().unwrap_err();
        assert!(err.to_string().contains("not defined symbol: 'y'"), "{err}");
    }

    #[test]
    fn jump_true_takes_the_branch() {
        let program = hand_program(
            &[],
            vec![
                Constant { kind: ConstKind::Bool, text: "true".into() },
                int_const("1"),
                int_const("2"),
            ],
            vec![
                inst(Opcode::LoadConst, 0),
                inst(Opcode::JumpTrue, 4),
                inst(Opcode::LoadConst, 1),
                inst(Opcode::ReturnVal, 0),
                inst(Opcode::LoadConst, 2),
                inst(Opcode::ReturnVal, 0),
            ],
        );
        let mut vm = Vm::new(program).unwrap();
        let result = vm.run().unwrap();
        assert!(matches!(result, Slot::Int(2)));
    }

    #[test]
    fn enter_block_is_inert() {
        let program = hand_program(
            &[],
            vec![int_const("3")],
            vec![
                inst(Opcode::EnterBlock, 0),
                inst(Opcode::LoadConst, 0),
                inst(Opcode::ReturnVal, 0),
            ],
        );
        let mut vm = Vm::new(program).unwrap();
        assert!(matches!(vm.run().unwrap(), Slot::Int(3)));
    }

    #[test]
    fn pop_on_an_empty_stack_underflows() {
        let program = hand_program(&[], vec![], vec![inst(Opcode::PopTop, 0)]);
        let mut vm = Vm::new(program).unwrap();
        let err = vm.run().unwrap_err();
        assert!(err.to_string().contains("stack is empty"), "{err}");
    }

    #[test]
    fn falling_off_the_end_finishes_cleanly() {
        let program = hand_program(&[], vec![int_const("1")], vec![inst(Opcode::LoadConst, 0)]);
        let mut vm = Vm::new(program).unwrap();
        assert!(matches!(vm.run().unwrap(), Slot::Void));
    }
}
