//! The bytecode printer behind the CLI's `-c` flag.

use core::fmt::Write;

use da_ops::Op;

use crate::code::{CmpOp, Code, CompiledProgram, ConstKind, Opcode};

/// Render the whole program the way the VM will see it: per code object,
/// its arguments, instructions with operand annotations, symbols and
/// constants.
pub fn dump(program: &CompiledProgram) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "--------------------");
    let _ = writeln!(out, "----- bytecode -----");
    let _ = writeln!(out, "total codes: {}", program.codes.len());
    for (_, code) in program.codes.iter() {
        dump_code(&mut out, program, code);
    }
    out
}

fn dump_code(out: &mut String, program: &CompiledProgram, code: &Code) {
    let module = program.code(program.module_code());
    let _ = writeln!(out, "----------");
    let _ = writeln!(out, "code: <{} '{}'>", code.kind.as_str(), code.name);

    if !code.arg_names.is_empty() {
        let _ = writeln!(out, "arguments:");
        for (position, name) in code.arg_names.iter().enumerate() {
            let index = code.arg_indexes[position];
            match &code.arg_defaults[position] {
                Some(default) => {
                    let _ = writeln!(out, "{position:<8}{name:<8} {index} {}", default.text);
                }
                None => {
                    let _ = writeln!(out, "{position:<8}{name} {index}");
                }
            }
        }
    }

    let _ = writeln!(out, "instructions:");
    let mut last_line = None;
    for (index, inst) in code.insts.iter().enumerate() {
        if last_line != Some(inst.line) {
            if last_line.is_some() {
                let _ = writeln!(out);
            }
            last_line = Some(inst.line);
            let _ = write!(out, "{:<8}", inst.line);
        } else {
            let _ = write!(out, "{:<8}", "");
        }
        let _ = write!(out, "{index:<8}{:<16}", inst.op.as_str());
        annotate(out, code, module, inst.op, inst.offset);
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "symbols:");
    for (index, symbol) in code.symbols.iter().enumerate() {
        let _ = writeln!(out, "{index:<8}{symbol}");
    }

    let _ = writeln!(out, "constants:");
    for (index, constant) in code.constants.iter().enumerate() {
        let text = quoted(constant.kind, &constant.text);
        let _ = writeln!(out, "{index:<8}{:<8}{text}", constant.kind.as_str());
    }
}

fn quoted(kind: ConstKind, text: &str) -> String {
    if kind == ConstKind::Str {
        format!("'{}'", text.escape_default())
    } else {
        text.to_string()
    }
}

fn annotate(out: &mut String, code: &Code, module: &Code, op: Opcode, offset: i64) {
    let local_symbol = |index: i64| {
        code.symbols
            .get(index as usize)
            .map(String::as_str)
            .unwrap_or("<bad symbol>")
    };
    let global_symbol = |index: i64| {
        module
            .symbols
            .get(index as usize)
            .map(String::as_str)
            .unwrap_or("<bad symbol>")
    };
    match op {
        Opcode::LoadName | Opcode::StoreName | Opcode::LoadLocal | Opcode::StoreLocal
        | Opcode::StdCin => {
            let _ = write!(out, "{offset} ({})", local_symbol(offset));
        }
        Opcode::LoadGlobal | Opcode::StoreGlobal | Opcode::LoadIntrin => {
            let _ = write!(out, "{offset} ({})", global_symbol(offset));
        }
        Opcode::LoadOps => {
            let name = Op::ALL
                .get(offset as usize)
                .map(|op| op.as_str())
                .unwrap_or("<bad op>");
            let _ = write!(out, "{offset} ({name})");
        }
        Opcode::LoadConst => match code.constants.get(offset as usize) {
            Some(constant) => {
                let _ = write!(out, "{offset} ({})", quoted(constant.kind, &constant.text));
            }
            None => {
                let _ = write!(out, "{offset} (<bad constant>)");
            }
        },
        Opcode::Compare => {
            let text = CmpOp::from_offset(offset).map(CmpOp::as_str).unwrap_or("<bad cmp>");
            let _ = write!(out, "{offset} ({text})");
        }
        Opcode::Jump | Opcode::JumpTrue | Opcode::JumpFalse | Opcode::DoCall
        | Opcode::CallIntrin | Opcode::CallOps | Opcode::ReturnVal | Opcode::DefineFunc
        | Opcode::DefineGraph | Opcode::EnterBlock => {
            let _ = write!(out, "{offset}");
        }
        Opcode::PopTop | Opcode::BinaryAdd | Opcode::BinarySub | Opcode::BinaryMul
        | Opcode::BinaryDiv | Opcode::StdCout => {}
    }
}
