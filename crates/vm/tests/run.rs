//! End-to-end tests: source text through the compiler and VM, with the
//! graph executor running real kernels underneath.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use da_compiler::{CompileOptions, Compiler};
use da_frontend::Parser;
use da_ir::Value;
use da_runtime::executor::ExecState;
use da_vm::{Slot, Vm, VmError};

#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn vm_for(source: &str) -> (Vm, Arc<Mutex<Vec<u8>>>) {
    let module = Parser::new("test.da", source).unwrap().parse_module().unwrap();
    let program = Compiler::new(&module, "test.da").compile().unwrap();
    let buf = Arc::new(Mutex::new(Vec::new()));
    let mut vm = Vm::new(program).unwrap();
    vm.set_output(Box::new(SharedBuf(buf.clone())));
    (vm, buf)
}

fn run_source(source: &str) -> String {
    let (mut vm, buf) = vm_for(source);
    vm.run().unwrap();
    let bytes = buf.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

fn run_source_err(source: &str) -> VmError {
    let (mut vm, _buf) = vm_for(source);
    vm.run().unwrap_err()
}

#[test]
fn scalar_arithmetic_prints_five() {
    assert_eq!(run_source("x=2+3; print(x)"), "5");
}

#[test]
fn if_else_takes_the_true_branch() {
    assert_eq!(run_source("if 1<2 { print(\"a\") } else { print(\"b\") }"), "a");
    assert_eq!(run_source("if 2<1 { print(\"a\") } else { print(\"b\") }"), "b");
}

#[test]
fn if_without_else_can_fall_off_the_end() {
    // The patched JumpFalse target is one past the last instruction.
    assert_eq!(run_source("if 1<2 { print('x') }"), "x");
    assert_eq!(run_source("if 2<1 { print('x') }"), "");
}

#[test]
fn while_loop_accumulates() {
    assert_eq!(run_source("i=0; s=0; while i<5 { s = s + i; i = i + 1 } print(s)"), "10");
}

#[test]
fn mixed_arithmetic_promotes() {
    assert_eq!(run_source("print(1.5 + 2)"), "3.5");
    assert_eq!(run_source("print(7 / 2)"), "3");
    assert_eq!(run_source("print(7.0 / 2)"), "3.5");
}

#[test]
fn string_concatenation_formats_the_other_side() {
    assert_eq!(run_source("print('v=' + 5)"), "v=5");
    assert_eq!(run_source("print(1 + 'x')"), "1x");
}

#[test]
fn comparisons_produce_bools() {
    assert_eq!(run_source("print(1 < 2)"), "true");
    assert_eq!(run_source("print('a' < 'b')"), "true");
    assert_eq!(run_source("print(2 == 2.0)"), "true");
}

#[test]
fn function_calls_nest() {
    let source = "function a(x) { return x + 1 }\n\
                  function b(x) { return a(x) * 2 }\n\
                  print(b(3))";
    assert_eq!(run_source(source), "8");
}

#[test]
fn zero_arg_function_call() {
    assert_eq!(run_source("function z() { return 5 }\nprint(z())"), "5");
}

#[test]
fn void_functions_leave_a_void_result() {
    assert_eq!(run_source("function v() { x = 1 }\nv(); print(2)"), "2");
}

#[test]
fn cin_cout_round_trip() {
    let (mut vm, buf) = vm_for("cin >> x; cout << x * 2");
    vm.set_input(Box::new(Cursor::new(b"7\n".to_vec())));
    vm.run().unwrap();
    assert_eq!(String::from_utf8(buf.lock().unwrap().clone()).unwrap(), "14");
}

#[test]
fn divide_by_zero_is_fatal() {
    let err = run_source_err("x = 1 / 0");
    assert!(err.to_string().contains("divide by zero"), "{err}");
    assert!(err.to_string().contains("test.da:1"), "{err}");
}

#[test]
fn too_many_arguments_is_fatal() {
    let err = run_source_err("function f(a) { return a }\nf(1, 2)");
    assert!(err.to_string().contains("should not exceed"), "{err}");
}

#[test]
fn calling_before_definition_is_fatal() {
    let err = run_source_err("f()\nfunction f() { return 1 }");
    assert!(err.to_string().contains("undefined symbol 'f'"), "{err}");
}

#[test]
fn jump_condition_must_be_bool() {
    // `while 1 { }` compiles but the condition is an int at run time.
    let err = run_source_err("while 1 { x = 0 }");
    assert!(err.to_string().contains("condition type is not bool"), "{err}");
}

#[test]
fn graph_call_builds_then_runs() {
    let source = "graph g(x, y) { return ops.add(x, y) }\n\
                  g(3, 4)\n\
                  print(g(3, 4))";
    let (mut vm, buf) = vm_for(source);
    vm.run().unwrap();
    assert_eq!(String::from_utf8(buf.lock().unwrap().clone()).unwrap(), "7");

    // The first call built the graph: two parameters feeding one add,
    // wrapped by the return.
    assert_eq!(vm.executor().state(), ExecState::Built);
    let dump = vm.executor().dump_graph().unwrap();
    assert_eq!(dump.matches("(param)").count(), 2);
    assert_eq!(dump.matches("= add(").count(), 1);
    assert_eq!(dump.matches("= return(").count(), 1);
}

#[test]
fn graph_of_fused_ops_optimizes_and_runs() {
    // add(x, neg(y)) rewrites to sub(x, y) before kernels bind.
    let source = "graph g(x, y) { return ops.add(x, ops.neg(y)) }\n\
                  g(10, 4)\n\
                  print(g(10, 4))";
    let (mut vm, buf) = vm_for(source);
    vm.run().unwrap();
    assert_eq!(String::from_utf8(buf.lock().unwrap().clone()).unwrap(), "6");
    let dump = vm.executor().dump_graph().unwrap();
    assert_eq!(dump.matches("= sub(").count(), 1);
    assert_eq!(dump.matches("= neg(").count(), 0);
}

#[test]
fn trivial_graph_returns_its_input_unchanged() {
    let source = "graph e(x) { return x }\n\
                  e(5)\n\
                  print(e(5))";
    assert_eq!(run_source(source), "5");
}

#[test]
fn single_function_graph_mode() {
    let module = Parser::new("test.da", "function main(a, b) { return ops.mul(a, b) }")
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
    let mut vm = Vm::new(program).unwrap();

    // First run builds the graph and returns the root reference.
    let first = vm.run_args(vec![Slot::Int(6), Slot::Int(7)]).unwrap();
    assert!(matches!(first, Slot::Tensor(_)));
    assert_eq!(vm.executor().state(), ExecState::Built);

    // Later runs bind and execute.
    let second = vm.run_args(vec![Slot::Int(6), Slot::Int(7)]).unwrap();
    match second {
        Slot::Data(Value::Int(v)) => assert_eq!(v, 42),
        other => panic!("expected a materialized int, got {other:?}"),
    }
    let third = vm.run_args(vec![Slot::Int(2), Slot::Int(3)]).unwrap();
    match third {
        Slot::Data(Value::Int(v)) => assert_eq!(v, 6),
        other => panic!("expected a materialized int, got {other:?}"),
    }
}

#[test]
fn streams_are_idle_after_a_run() {
    let source = "graph g(x) { return ops.relu(x) }\ng(1)\ng(1)";
    let (mut vm, _buf) = vm_for(source);
    vm.run().unwrap();
    assert!(vm.executor().res().all_streams_idle());
}

#[test]
fn calling_a_second_graph_is_rejected() {
    // The executor holds one graph at a time: building `a` succeeds, a
    // later call naming `b` must not silently run `a`.
    let source = "graph a(x) { return ops.relu(x) }\n\
                  graph b(x) { return ops.relu(x) }\n\
                  a(1)\n\
                  b(1)";
    let err = run_source_err(source);
    assert!(err.to_string().contains("graph `b` called while graph `a` is current"), "{err}");
}
