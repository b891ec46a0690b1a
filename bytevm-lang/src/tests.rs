use std::sync::Arc;

use crate::code::assemble::Assembler;
use crate::code::opcode::{BinaryOperator, CompareOp, Opcode, UnaryOperator};
use crate::code::{Code, CodeBody, CodeFlags, CodeObject, Constant};
use crate::runtime::exception::ErrorKind;
use crate::runtime::list::{List, Tuple};
use crate::runtime::namespace::Namespace;
use crate::runtime::symbol::Symbol;
use crate::runtime::types::Class;
use crate::runtime::value::Value;
use crate::vm::call::Arguments;
use crate::vm::function::{Method, NativeFunction};
use crate::vm::import::SourceRegistry;
use crate::vm::{ExecutionError, Fault, OutputBuffer, Vm, DEFAULT_MAX_DEPTH};

fn run(code: &Code) -> Result<Value, ExecutionError> {
    Vm::default().run(code, [])
}

fn run_logged(code: &Code) -> (Result<Value, ExecutionError>, Vec<Value>) {
    let log = Value::list(Vec::new());
    let result = Vm::default().run(code, [(Symbol::from("log"), log.clone())]);
    let entries = log.downcast_ref::<List>().expect("list").to_vec();
    (result, entries)
}

fn strings(values: &[&str]) -> Vec<Value> {
    values.iter().copied().map(Value::from).collect()
}

/// Appends `log.append(text)` using `load` to find `log`.
fn log(asm: &mut Assembler, load: Opcode, text: &str) {
    asm.named(load, "log")
        .load_attr("append")
        .load_const(text)
        .call(1)
        .op(Opcode::PopTop);
}

/// Appends `name = <function built from code>`.
fn define(asm: &mut Assembler, name: &str, code: Code) {
    asm.load_const(code)
        .load_const(name)
        .op_arg(Opcode::MakeFunction, 0)
        .store_name(name);
}

fn raise(asm: &mut Assembler, load: Opcode, class: &str, message: &str) {
    asm.named(load, class)
        .load_const(message)
        .call(1)
        .op_arg(Opcode::RaiseVarargs, 1);
}

fn wordcode(constants: Vec<Constant>, bytes: Vec<u8>) -> Code {
    Code::from(CodeObject {
        name: Symbol::from("<module>"),
        filename: Symbol::from("<wordcode>"),
        first_line: 1,
        arg_count: 0,
        kwonly_arg_count: 0,
        flags: CodeFlags::NOFREE,
        varnames: Vec::new(),
        cellvars: Vec::new(),
        freevars: Vec::new(),
        names: Vec::new(),
        constants,
        body: CodeBody::Wordcode {
            bytes,
            lines: Vec::new(),
        },
    })
}

#[test]
fn arithmetic() {
    let mut asm = Assembler::new("<module>");
    asm.load_const(6)
        .load_const(7)
        .binary(BinaryOperator::Multiply)
        .load_const(2)
        .binary(BinaryOperator::Subtract)
        .return_value();
    assert_eq!(run(&asm.build()).unwrap(), Value::Int(40));
}

#[test]
fn finally_runs_on_fall_through() {
    let mut asm = Assembler::new("<module>");
    let finally = asm.label();
    asm.jump(Opcode::SetupFinally, finally)
        .op(Opcode::Nop)
        .op(Opcode::PopBlock)
        .load_none()
        .mark(finally);
    log(&mut asm, Opcode::LoadName, "finally");
    asm.op(Opcode::EndFinally).load_none().return_value();

    let (result, log) = run_logged(&asm.build());
    assert_eq!(result.unwrap(), Value::None);
    assert_eq!(log, strings(&["finally"]));
}

#[test]
fn finally_runs_on_return() {
    let mut body = Assembler::new("f");
    let finally = body.label();
    body.jump(Opcode::SetupFinally, finally)
        .load_const(42)
        .return_value()
        .op(Opcode::PopBlock)
        .load_none()
        .mark(finally);
    log(&mut body, Opcode::LoadGlobal, "finally");
    body.op(Opcode::EndFinally).load_none().return_value();

    let mut asm = Assembler::new("<module>");
    define(&mut asm, "f", body.build());
    asm.load_name("f").call(0).return_value();

    let (result, log) = run_logged(&asm.build());
    assert_eq!(result.unwrap(), Value::Int(42));
    assert_eq!(log, strings(&["finally"]));
}

#[test]
fn finally_runs_on_break() {
    let mut asm = Assembler::new("<module>");
    let end = asm.label();
    let finally = asm.label();
    asm.jump(Opcode::SetupLoop, end)
        .jump(Opcode::SetupFinally, finally)
        .op(Opcode::BreakLoop)
        .op(Opcode::PopBlock)
        .load_none()
        .mark(finally);
    log(&mut asm, Opcode::LoadName, "finally");
    asm.op(Opcode::EndFinally).op(Opcode::PopBlock).mark(end);
    log(&mut asm, Opcode::LoadName, "after");
    asm.load_none().return_value();

    let (result, log) = run_logged(&asm.build());
    assert_eq!(result.unwrap(), Value::None);
    assert_eq!(log, strings(&["finally", "after"]));
}

#[test]
fn finally_runs_on_continue() {
    let mut asm = Assembler::new("<module>");
    let end = asm.label();
    let top = asm.label();
    let exit = asm.label();
    let finally = asm.label();
    asm.load_const(0)
        .store_name("i")
        .jump(Opcode::SetupLoop, end)
        .mark(top)
        .load_name("i")
        .load_const(2)
        .compare(CompareOp::Less)
        .jump(Opcode::PopJumpIfFalse, exit)
        .load_name("i")
        .load_const(1)
        .binary(BinaryOperator::Add)
        .store_name("i")
        .jump(Opcode::SetupFinally, finally)
        .jump(Opcode::ContinueLoop, top)
        .op(Opcode::PopBlock)
        .load_none()
        .mark(finally);
    log(&mut asm, Opcode::LoadName, "finally");
    asm.op(Opcode::EndFinally)
        .jump(Opcode::JumpAbsolute, top)
        .mark(exit)
        .op(Opcode::PopBlock)
        .mark(end)
        .load_name("i")
        .return_value();

    let (result, log) = run_logged(&asm.build());
    assert_eq!(result.unwrap(), Value::Int(2));
    assert_eq!(log, strings(&["finally", "finally"]));
}

#[test]
fn finally_runs_on_exception() {
    let mut asm = Assembler::new("<module>");
    let finally = asm.label();
    asm.jump(Opcode::SetupFinally, finally);
    raise(&mut asm, Opcode::LoadName, "ValueError", "x");
    asm.op(Opcode::PopBlock).load_none().mark(finally);
    log(&mut asm, Opcode::LoadName, "cleanup");
    asm.op(Opcode::EndFinally).load_none().return_value();

    let (result, log) = run_logged(&asm.build());
    let err = result.unwrap_err();
    assert!(err.is_exception(ErrorKind::ValueError));
    assert_eq!(err.to_string(), "ValueError: x");
    assert_eq!(log, strings(&["cleanup"]));
}

#[test]
fn nested_break_runs_finally_first() {
    let mut asm = Assembler::new("<module>");
    let outer_end = asm.label();
    let outer = asm.label();
    let outer_done = asm.label();
    let inner_end = asm.label();
    let inner = asm.label();
    let inner_done = asm.label();
    let finally = asm.label();
    asm.jump(Opcode::SetupLoop, outer_end)
        .load_name("range")
        .load_const(2)
        .call(1)
        .op(Opcode::GetIter)
        .mark(outer)
        .jump(Opcode::ForIter, outer_done)
        .store_name("i")
        .jump(Opcode::SetupLoop, inner_end)
        .load_name("range")
        .load_const(3)
        .call(1)
        .op(Opcode::GetIter)
        .mark(inner)
        .jump(Opcode::ForIter, inner_done)
        .store_name("j")
        .jump(Opcode::SetupFinally, finally)
        .op(Opcode::BreakLoop)
        .op(Opcode::PopBlock)
        .load_none()
        .mark(finally);
    log(&mut asm, Opcode::LoadName, "finally");
    asm.op(Opcode::EndFinally)
        .jump(Opcode::JumpAbsolute, inner)
        .mark(inner_done)
        .op(Opcode::PopBlock)
        .mark(inner_end);
    log(&mut asm, Opcode::LoadName, "outer");
    asm.jump(Opcode::JumpAbsolute, outer)
        .mark(outer_done)
        .op(Opcode::PopBlock)
        .mark(outer_end)
        .load_none()
        .return_value();

    let (result, log) = run_logged(&asm.build());
    assert_eq!(result.unwrap(), Value::None);
    assert_eq!(log, strings(&["finally", "outer", "finally", "outer"]));
}

#[test]
fn except_handler_matches_and_restores() {
    let mut asm = Assembler::new("<module>");
    let handler = asm.label();
    let reraise = asm.label();
    let after = asm.label();
    asm.jump(Opcode::SetupExcept, handler);
    raise(&mut asm, Opcode::LoadName, "KeyError", "k");
    asm.op(Opcode::PopBlock)
        .jump(Opcode::JumpForward, after)
        .mark(handler)
        .op(Opcode::DupTop)
        .load_name("LookupError")
        .compare(CompareOp::ExceptionMatch)
        .jump(Opcode::PopJumpIfFalse, reraise)
        .op(Opcode::PopTop)
        .store_name("error")
        .op(Opcode::PopTop)
        .op(Opcode::PopExcept)
        .jump(Opcode::JumpForward, after)
        .mark(reraise)
        .op(Opcode::EndFinally)
        .mark(after)
        .load_name("error")
        .load_attr("args")
        .return_value();

    let mut vm = Vm::default();
    let result = vm.run(&asm.build(), []).unwrap();
    assert_eq!(result.repr(), "('k',)");
    assert!(vm.handled_exception().is_none());
}

#[test]
fn unmatched_except_propagates() {
    let mut asm = Assembler::new("<module>");
    let handler = asm.label();
    let reraise = asm.label();
    let after = asm.label();
    asm.jump(Opcode::SetupExcept, handler);
    raise(&mut asm, Opcode::LoadName, "ValueError", "v");
    asm.op(Opcode::PopBlock)
        .jump(Opcode::JumpForward, after)
        .mark(handler)
        .op(Opcode::DupTop)
        .load_name("KeyError")
        .compare(CompareOp::ExceptionMatch)
        .jump(Opcode::PopJumpIfFalse, reraise)
        .op(Opcode::PopTop)
        .op(Opcode::PopTop)
        .op(Opcode::PopTop)
        .op(Opcode::PopExcept)
        .jump(Opcode::JumpForward, after)
        .mark(reraise)
        .op(Opcode::EndFinally)
        .mark(after)
        .load_none()
        .return_value();

    let err = run(&asm.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::ValueError));
    assert!(!err.is_exception(ErrorKind::KeyError));
}

#[test]
fn raise_in_handler_records_context() {
    let mut asm = Assembler::new("<module>");
    let handler = asm.label();
    asm.jump(Opcode::SetupExcept, handler);
    raise(&mut asm, Opcode::LoadName, "KeyError", "k");
    asm.op(Opcode::PopBlock).mark(handler);
    asm.op(Opcode::PopTop).op(Opcode::PopTop).op(Opcode::PopTop);
    raise(&mut asm, Opcode::LoadName, "ValueError", "v");

    let err = run(&asm.build()).unwrap_err();
    let triple = err.exception().expect("exception");
    assert!(triple.is_instance_of(ErrorKind::ValueError));
    let context = triple
        .instance()
        .and_then(|instance| instance.attribute(&Symbol::from("__context__")))
        .expect("context");
    assert_eq!(context.to_string(), "'k'");
    let report = triple.format();
    assert!(report.contains("KeyError: 'k'"), "{report}");
    assert!(report.contains("During handling of the above exception"));
    assert!(report.ends_with("ValueError: v\n"), "{report}");
}

#[test]
fn bare_raise_without_active_exception() {
    let mut asm = Assembler::new("<module>");
    asm.op_arg(Opcode::RaiseVarargs, 0);
    let err = run(&asm.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::RuntimeError));
    assert_eq!(err.to_string(), "RuntimeError: No active exception to reraise");
}

#[test]
fn raise_from_sets_cause() {
    let mut asm = Assembler::new("<module>");
    asm.load_name("ValueError")
        .load_const("outer")
        .call(1)
        .load_name("KeyError")
        .load_const("inner")
        .call(1)
        .op_arg(Opcode::RaiseVarargs, 2);
    let err = run(&asm.build()).unwrap_err();
    let report = err.exception().expect("exception").format();
    assert!(report.contains("direct cause"), "{report}");
}

#[test]
fn traceback_lists_frames_outermost_first() {
    let mut body = Assembler::new("fail").with_filename("lib.py");
    body.set_line(7);
    raise(&mut body, Opcode::LoadGlobal, "ValueError", "deep");

    let mut asm = Assembler::new("<module>").with_filename("main.py");
    define(&mut asm, "fail", body.build());
    asm.set_line(3).load_name("fail").call(0).return_value();

    let err = run(&asm.build()).unwrap_err();
    let triple = err.exception().expect("exception");
    let names = triple
        .entries()
        .iter()
        .map(|entry| entry.name.to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, ["<module>", "fail"]);
    assert_eq!(triple.entries()[1].line, Some(7));
    assert!(triple.format().contains("File \"lib.py\", line 7, in fail"));
}

#[test]
fn with_suppresses_when_exit_is_truthy() {
    let (result, _) = run_with_manager(true);
    assert_eq!(result.unwrap(), Value::from("after"));
}

#[test]
fn with_propagates_when_exit_is_falsy() {
    let (result, exits) = run_with_manager(false);
    assert!(result.unwrap_err().is_exception(ErrorKind::ValueError));
    assert_eq!(exits, 1);
}

fn run_with_manager(suppress: bool) -> (Result<Value, ExecutionError>, usize) {
    let exits = Arc::new(parking_lot::Mutex::new(0));
    let namespace = Namespace::default();
    namespace.insert(
        Symbol::from("__enter__"),
        Value::dynamic(NativeFunction::method("__enter__", |_vm, args| {
            Ok(args.positional.first().cloned().unwrap_or_default())
        })),
    );
    let counter = exits.clone();
    namespace.insert(
        Symbol::from("__exit__"),
        Value::dynamic(NativeFunction::method("__exit__", move |_vm, args| {
            assert_eq!(args.positional.len(), 4);
            *counter.lock() += 1;
            Ok(Value::Bool(suppress))
        })),
    );
    let manager = Class::new(
        Symbol::from("Manager"),
        Symbol::from("Manager"),
        Vec::new(),
        Arc::new(namespace),
    )
    .unwrap();

    let mut asm = Assembler::new("<module>");
    let cleanup = asm.label();
    asm.load_name("Manager")
        .call(0)
        .jump(Opcode::SetupWith, cleanup)
        .op(Opcode::PopTop);
    raise(&mut asm, Opcode::LoadName, "ValueError", "inside");
    asm.op(Opcode::PopBlock)
        .load_none()
        .mark(cleanup)
        .op(Opcode::WithCleanupStart)
        .op(Opcode::WithCleanupFinish)
        .op(Opcode::EndFinally)
        .load_const("after")
        .return_value();

    let result = Vm::default().run(
        &asm.build(),
        [(Symbol::from("Manager"), Value::dynamic(manager))],
    );
    let exits = *exits.lock();
    (result, exits)
}

fn closure_pair() -> Code {
    let mut getter = Assembler::new("get").with_freevars(&["x"]);
    getter.load_deref("x").return_value();

    let mut setter = Assembler::new("set")
        .with_arguments(&["value"])
        .with_freevars(&["x"]);
    setter
        .load_fast("value")
        .store_deref("x")
        .load_none()
        .return_value();

    let mut outer = Assembler::new("outer").with_cellvars(&["x"]);
    outer
        .load_const(0)
        .store_deref("x")
        .load_closure("x")
        .op_arg(Opcode::BuildTuple, 1)
        .load_const(getter.build())
        .load_const("outer.<locals>.get")
        .op_arg(Opcode::MakeFunction, 0x08)
        .load_closure("x")
        .op_arg(Opcode::BuildTuple, 1)
        .load_const(setter.build())
        .load_const("outer.<locals>.set")
        .op_arg(Opcode::MakeFunction, 0x08)
        .op_arg(Opcode::BuildTuple, 2)
        .return_value();
    outer.build()
}

#[test]
fn closures_share_cells_per_invocation() {
    let mut asm = Assembler::new("<module>");
    define(&mut asm, "outer", closure_pair());
    asm.load_name("outer")
        .call(0)
        .op_arg(Opcode::UnpackSequence, 2)
        .store_name("get1")
        .store_name("set1")
        .load_name("outer")
        .call(0)
        .op_arg(Opcode::UnpackSequence, 2)
        .store_name("get2")
        .store_name("set2")
        .load_name("set1")
        .load_const(5)
        .call(1)
        .op(Opcode::PopTop)
        .load_name("get1")
        .call(0)
        .load_name("get2")
        .call(0)
        .op_arg(Opcode::BuildTuple, 2)
        .return_value();
    assert_eq!(run(&asm.build()).unwrap().repr(), "(5, 0)");
}

#[test]
fn binding_defaults_and_varargs() {
    let mut body = Assembler::new("f")
        .with_arguments(&["a", "b"])
        .with_varargs("rest");
    body.load_fast("a")
        .load_fast("b")
        .load_fast("rest")
        .op_arg(Opcode::BuildTuple, 3)
        .return_value();

    let mut asm = Assembler::new("<module>");
    asm.load_const(Constant::Tuple(vec![Constant::Int(2)]))
        .load_const(body.build())
        .load_const("f")
        .op_arg(Opcode::MakeFunction, 0x01)
        .store_name("f")
        .load_name("f")
        .load_const(1)
        .load_const(3)
        .load_const(4)
        .load_const(5)
        .call(4)
        .load_name("f")
        .load_const(1)
        .call(1)
        .op_arg(Opcode::BuildTuple, 2)
        .return_value();
    assert_eq!(
        run(&asm.build()).unwrap().repr(),
        "((1, 3, (4, 5)), (1, 2, ()))"
    );
}

#[test]
fn binding_errors() {
    let mut body = Assembler::new("f").with_arguments(&["a"]);
    body.load_fast("a").return_value();

    let mut missing = Assembler::new("<module>");
    define(&mut missing, "f", body.build());
    missing.load_name("f").call(0).return_value();
    let err = run(&missing.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::TypeError));
    assert!(err.to_string().contains("missing 1 required positional argument"));

    let mut body = Assembler::new("f").with_arguments(&["a"]);
    body.load_fast("a").return_value();
    let mut unexpected = Assembler::new("<module>");
    define(&mut unexpected, "f", body.build());
    unexpected
        .load_name("f")
        .load_const(1)
        .load_const(2)
        .load_const(Constant::Tuple(vec![Constant::from("b")]))
        .op_arg(Opcode::CallFunctionKw, 2)
        .return_value();
    let err = run(&unexpected.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::TypeError));
    assert!(err.to_string().contains("unexpected keyword argument 'b'"));
}

#[test]
fn generators_yield_in_order() {
    let mut body = Assembler::new("gen").generator();
    body.load_const(1)
        .op(Opcode::YieldValue)
        .op(Opcode::PopTop)
        .load_const(2)
        .op(Opcode::YieldValue)
        .op(Opcode::PopTop)
        .load_const("done")
        .return_value();

    let mut asm = Assembler::new("<module>");
    let handler = asm.label();
    let reraise = asm.label();
    let after = asm.label();
    define(&mut asm, "gen", body.build());
    asm.load_name("gen")
        .call(0)
        .store_name("g")
        .load_name("next")
        .load_name("g")
        .call(1)
        .store_name("first")
        .load_name("next")
        .load_name("g")
        .call(1)
        .store_name("second")
        .jump(Opcode::SetupExcept, handler)
        .load_name("next")
        .load_name("g")
        .call(1)
        .op(Opcode::PopTop)
        .op(Opcode::PopBlock)
        .load_const("not exhausted")
        .store_name("result")
        .jump(Opcode::JumpForward, after)
        .mark(handler)
        .op(Opcode::DupTop)
        .load_name("StopIteration")
        .compare(CompareOp::ExceptionMatch)
        .jump(Opcode::PopJumpIfFalse, reraise)
        .op(Opcode::PopTop)
        .store_name("stop")
        .op(Opcode::PopTop)
        .load_name("first")
        .load_name("second")
        .load_name("stop")
        .load_attr("value")
        .op_arg(Opcode::BuildTuple, 3)
        .store_name("result")
        .op(Opcode::PopExcept)
        .jump(Opcode::JumpForward, after)
        .mark(reraise)
        .op(Opcode::EndFinally)
        .mark(after)
        .load_name("result")
        .return_value();

    assert_eq!(run(&asm.build()).unwrap().repr(), "(1, 2, 'done')");
}

#[test]
fn generator_send() {
    let mut body = Assembler::new("echo").generator();
    body.load_const(1)
        .op(Opcode::YieldValue)
        .store_fast("x")
        .load_fast("x")
        .load_const(2)
        .binary(BinaryOperator::Multiply)
        .op(Opcode::YieldValue)
        .op(Opcode::PopTop)
        .load_none()
        .return_value();

    let mut asm = Assembler::new("<module>");
    define(&mut asm, "echo", body.build());
    asm.load_name("echo")
        .call(0)
        .store_name("g")
        .load_name("next")
        .load_name("g")
        .call(1)
        .load_name("g")
        .load_attr("send")
        .load_const(5)
        .call(1)
        .op_arg(Opcode::BuildTuple, 2)
        .return_value();
    assert_eq!(run(&asm.build()).unwrap().repr(), "(1, 10)");
}

#[test]
fn sending_into_unstarted_generator() {
    let mut body = Assembler::new("gen").generator();
    body.load_const(1)
        .op(Opcode::YieldValue)
        .return_value();

    let mut asm = Assembler::new("<module>");
    define(&mut asm, "gen", body.build());
    asm.load_name("gen")
        .call(0)
        .load_attr("send")
        .load_const(1)
        .call(1)
        .return_value();
    let err = run(&asm.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::TypeError));
}

#[test]
fn yield_from_forwards_values_and_result() {
    let mut inner = Assembler::new("inner").generator();
    inner
        .load_const(1)
        .op(Opcode::YieldValue)
        .op(Opcode::PopTop)
        .load_const(2)
        .op(Opcode::YieldValue)
        .op(Opcode::PopTop)
        .load_const("r")
        .return_value();

    let mut outer = Assembler::new("outer").generator();
    outer
        .load_global("inner")
        .call(0)
        .op(Opcode::GetYieldFromIter)
        .load_none()
        .op(Opcode::YieldFrom)
        .store_fast("x")
        .load_fast("x")
        .op(Opcode::YieldValue)
        .op(Opcode::PopTop)
        .load_none()
        .return_value();

    let mut asm = Assembler::new("<module>");
    define(&mut asm, "inner", inner.build());
    define(&mut asm, "outer", outer.build());
    asm.load_name("list")
        .load_name("outer")
        .call(0)
        .call(1)
        .return_value();
    assert_eq!(run(&asm.build()).unwrap().repr(), "[1, 2, 'r']");
}

#[test]
fn classes_and_methods() {
    let mut init = Assembler::new("__init__").with_arguments(&["self", "start"]);
    init.load_fast("start")
        .load_fast("self")
        .store_attr("value")
        .load_none()
        .return_value();

    let mut bump = Assembler::new("bump").with_arguments(&["self"]);
    bump.load_fast("self")
        .op(Opcode::DupTop)
        .load_attr("value")
        .load_const(1)
        .inplace(BinaryOperator::Add)
        .op(Opcode::RotTwo)
        .store_attr("value")
        .load_fast("self")
        .load_attr("value")
        .return_value();

    let mut class_body = Assembler::new("Counter");
    class_body
        .load_name("__name__")
        .store_name("__module__")
        .load_const("Counter")
        .store_name("__qualname__");
    define(&mut class_body, "__init__", init.build());
    define(&mut class_body, "bump", bump.build());
    class_body.load_none().return_value();

    let mut asm = Assembler::new("<module>");
    asm.op(Opcode::LoadBuildClass)
        .load_const(class_body.build())
        .load_const("Counter")
        .op_arg(Opcode::MakeFunction, 0)
        .load_const("Counter")
        .call(2)
        .store_name("Counter")
        .load_name("Counter")
        .load_const(10)
        .call(1)
        .store_name("counter")
        .load_name("counter")
        .load_attr("bump")
        .call(0)
        .op(Opcode::PopTop)
        .load_name("counter")
        .load_attr("bump")
        .call(0)
        .load_name("isinstance")
        .load_name("counter")
        .load_name("Counter")
        .call(2)
        .op_arg(Opcode::BuildTuple, 2)
        .return_value();
    assert_eq!(run(&asm.build()).unwrap().repr(), "(12, True)");
}

#[test]
fn imports_use_loader_then_native_modules() {
    let mut helpers = Assembler::new("<module>");
    helpers
        .load_const(42)
        .store_name("VALUE")
        .load_none()
        .return_value();

    let mut asm = Assembler::new("<module>");
    asm.load_const(0)
        .load_none()
        .named(Opcode::ImportName, "helpers")
        .store_name("helpers")
        .load_const(0)
        .load_const(Constant::Tuple(vec![Constant::from("answer")]))
        .named(Opcode::ImportName, "native")
        .named(Opcode::ImportFrom, "answer")
        .store_name("answer")
        .op(Opcode::PopTop)
        .load_name("helpers")
        .load_attr("VALUE")
        .load_name("answer")
        .binary(BinaryOperator::Add)
        .return_value();

    let mut vm = Vm::default()
        .with_loader(SourceRegistry::default().with_module("helpers", helpers.build()))
        .with_native_module("native", |_vm| {
            let namespace = Namespace::default();
            namespace.insert(Symbol::from("answer"), Value::Int(1));
            Ok(Arc::new(namespace))
        });
    assert_eq!(vm.run(&asm.build(), []).unwrap(), Value::Int(43));
    assert!(vm.modules().contains_key(&Symbol::from("helpers")));
}

#[test]
fn missing_module() {
    let mut asm = Assembler::new("<module>");
    asm.load_const(0)
        .load_none()
        .named(Opcode::ImportName, "nowhere")
        .return_value();
    let err = run(&asm.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::ModuleNotFoundError));
    assert!(err.is_exception(ErrorKind::ImportError));
}

#[test]
fn string_formatting() {
    let mut asm = Assembler::new("<module>");
    asm.load_const("%s-%03d")
        .load_const("a")
        .load_const(7)
        .op_arg(Opcode::BuildTuple, 2)
        .binary(BinaryOperator::Modulo)
        .load_const("{}+{!r}")
        .load_attr("format")
        .load_const(1)
        .load_const("b")
        .call(2)
        .load_const("[")
        .load_const(3.5)
        .load_const(">6.2f")
        .op_arg(Opcode::FormatValue, 0x04)
        .load_const("]")
        .op_arg(Opcode::BuildString, 3)
        .op_arg(Opcode::BuildTuple, 3)
        .return_value();
    assert_eq!(
        run(&asm.build()).unwrap().repr(),
        "('a-007', \"1+'b'\", '[  3.50]')"
    );
}

#[test]
fn print_writes_to_output() {
    let output = OutputBuffer::default();
    let mut asm = Assembler::new("<module>");
    asm.load_name("print")
        .load_const("a")
        .load_const(1)
        .load_const("-")
        .load_const(Constant::Tuple(vec![Constant::from("sep")]))
        .op_arg(Opcode::CallFunctionKw, 3)
        .op(Opcode::PopTop)
        .load_const("shown")
        .op(Opcode::PrintExpr)
        .load_none()
        .return_value();
    Vm::default()
        .with_output(output.clone())
        .run(&asm.build(), [])
        .unwrap();
    assert_eq!(output.contents(), "a-1\n'shown'\n");
}

#[test]
fn name_errors() {
    let mut asm = Assembler::new("<module>");
    asm.load_name("missing").return_value();
    let err = run(&asm.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::NameError));
    assert_eq!(err.to_string(), "NameError: name 'missing' is not defined");

    let mut body = Assembler::new("f");
    body.load_fast("x").return_value();
    let mut asm = Assembler::new("<module>");
    define(&mut asm, "f", body.build());
    asm.load_name("f").call(0).return_value();
    let err = run(&asm.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::UnboundLocalError));
    assert!(err.is_exception(ErrorKind::NameError));
}

/// `def forever(): return forever()` followed by a call to it.
fn unbounded_recursion() -> Code {
    let mut body = Assembler::new("forever");
    body.load_global("forever").call(0).return_value();
    let mut asm = Assembler::new("<module>");
    define(&mut asm, "forever", body.build());
    asm.load_name("forever").call(0).return_value();
    asm.build()
}

/// `def countdown(n): return n if n == 0 else countdown(n - 1)` called
/// with `depth`.
fn countdown(depth: i64) -> Code {
    let mut body = Assembler::new("countdown").with_arguments(&["n"]);
    let recurse = body.label();
    body.load_fast("n")
        .load_const(0)
        .compare(CompareOp::Equal)
        .jump(Opcode::PopJumpIfFalse, recurse)
        .load_fast("n")
        .return_value()
        .mark(recurse)
        .load_global("countdown")
        .load_fast("n")
        .load_const(1)
        .binary(BinaryOperator::Subtract)
        .call(1)
        .return_value();
    let mut asm = Assembler::new("<module>");
    define(&mut asm, "countdown", body.build());
    asm.load_name("countdown")
        .load_const(depth)
        .call(1)
        .return_value();
    asm.build()
}

#[test]
fn recursion_limit() {
    let err = run(&unbounded_recursion()).unwrap_err();
    assert!(err.is_exception(ErrorKind::RecursionError));
    assert_eq!(
        err.to_string(),
        "RecursionError: maximum recursion depth exceeded"
    );
}

#[test]
fn recursion_limit_is_configurable() {
    let err = Vm::default()
        .with_max_depth(20)
        .run(&unbounded_recursion(), [])
        .unwrap_err();
    assert!(err.is_exception(ErrorKind::RecursionError));

    let err = Vm::default()
        .with_max_depth(2_000)
        .run(&unbounded_recursion(), [])
        .unwrap_err();
    assert!(err.is_exception(ErrorKind::RecursionError));
}

#[test]
fn recursion_up_to_the_limit_on_a_small_thread() {
    let depth = i64::try_from(DEFAULT_MAX_DEPTH).unwrap() - 2;
    let result = std::thread::Builder::new()
        .stack_size(256 * 1024)
        .spawn(move || {
            let result = run(&countdown(depth)).map(|value| value.as_i64());
            let overflow = run(&unbounded_recursion())
                .is_err_and(|err| err.is_exception(ErrorKind::RecursionError));
            (result.map_err(|err| err.to_string()), overflow)
        })
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(result, (Ok(Some(0)), true));
}

#[test]
fn data_left_on_stack_is_internal() {
    let mut asm = Assembler::new("<module>");
    asm.load_const(1).load_const(2).return_value();
    assert_eq!(
        run(&asm.build()).unwrap_err(),
        ExecutionError::Internal(Fault::DataLeftOnStack)
    );
}

#[test]
fn budgeting() {
    let mut asm = Assembler::new("<module>");
    asm.load_const(1)
        .load_const(2)
        .binary(BinaryOperator::Add)
        .return_value();
    let code = asm.build();

    let mut vm = Vm::default();
    vm.increase_budget(3);
    assert_eq!(vm.run(&code, []).unwrap_err(), ExecutionError::NoBudget);
    assert_eq!(vm.steps(), 3);

    let mut vm = Vm::default();
    vm.increase_budget(4);
    assert_eq!(vm.run(&code, []).unwrap(), Value::Int(3));
    assert_eq!(vm.steps(), 4);
}

#[test]
fn unknown_opcode_is_internal() {
    let code = wordcode(Vec::new(), vec![0, 0]);
    assert_eq!(
        run(&code).unwrap_err(),
        ExecutionError::Internal(Fault::UnknownOpcode(0))
    );
}

#[test]
fn extended_arg_is_folded() {
    let constants = (0..300).map(Constant::Int).collect();
    let load_const = Opcode::LoadConst.number().expect("numbered");
    let return_value = Opcode::ReturnValue.number().expect("numbered");
    let code = wordcode(
        constants,
        vec![144, 1, load_const, 43, return_value, 0],
    );
    assert_eq!(run(&code).unwrap(), Value::Int(299));
}

#[test]
fn wordcode_relative_jumps() {
    let number = |opcode: Opcode| opcode.number().expect("numbered");
    let code = wordcode(
        vec![Constant::Int(1), Constant::Int(2)],
        vec![
            number(Opcode::JumpForward),
            4,
            number(Opcode::LoadConst),
            0,
            number(Opcode::ReturnValue),
            0,
            number(Opcode::LoadConst),
            1,
            number(Opcode::ReturnValue),
            0,
        ],
    );
    // The jump is relative to the following unit, skipping the first return.
    assert_eq!(run(&code).unwrap(), Value::Int(2));
}

#[test]
fn dict_and_comprehension_opcodes() {
    let mut asm = Assembler::new("<module>");
    let top = asm.label();
    let done = asm.label();
    asm.op_arg(Opcode::BuildMap, 0)
        .load_name("range")
        .load_const(3)
        .call(1)
        .op(Opcode::GetIter)
        .mark(top)
        .jump(Opcode::ForIter, done)
        .store_name("i")
        .load_name("i")
        .load_name("i")
        .load_name("i")
        .binary(BinaryOperator::Multiply)
        .op(Opcode::RotTwo)
        .op_arg(Opcode::MapAdd, 2)
        .jump(Opcode::JumpAbsolute, top)
        .mark(done)
        .return_value();
    assert_eq!(run(&asm.build()).unwrap().repr(), "{0: 0, 1: 1, 2: 4}");
}

#[test]
fn oversized_repetition_raises_memory_error() {
    let huge = 4_611_686_018_427_387_904_i64;
    let sequences: [fn(&mut Assembler); 3] = [
        |asm| {
            asm.load_const("ab");
        },
        |asm| {
            asm.load_const(1).op_arg(Opcode::BuildList, 1);
        },
        |asm| {
            asm.load_const(Constant::Tuple(vec![Constant::from(1)]));
        },
    ];
    for sequence in sequences {
        let mut asm = Assembler::new("<module>");
        sequence(&mut asm);
        asm.load_const(huge)
            .binary(BinaryOperator::Multiply)
            .return_value();
        let err = run(&asm.build()).unwrap_err();
        assert!(err.is_exception(ErrorKind::MemoryError), "{err}");
    }

    // l = [1]; l *= huge
    let mut asm = Assembler::new("<module>");
    asm.load_const(1)
        .op_arg(Opcode::BuildList, 1)
        .load_const(huge)
        .inplace(BinaryOperator::Multiply)
        .return_value();
    assert!(run(&asm.build())
        .unwrap_err()
        .is_exception(ErrorKind::MemoryError));

    let mut asm = Assembler::new("<module>");
    asm.load_const(-3)
        .load_const("ab")
        .binary(BinaryOperator::Multiply)
        .load_const("ab")
        .load_const(3)
        .binary(BinaryOperator::Multiply)
        .op_arg(Opcode::BuildTuple, 2)
        .return_value();
    assert_eq!(run(&asm.build()).unwrap().repr(), "('', 'ababab')");
}

#[test]
fn huge_exponents_of_unit_bases() {
    let huge = 1_i64 << 40;
    let power = |base: i64, exponent: i64| {
        let mut asm = Assembler::new("<module>");
        asm.load_const(base)
            .load_const(exponent)
            .binary(BinaryOperator::Power)
            .return_value();
        run(&asm.build())
    };
    assert_eq!(power(0, huge).unwrap(), Value::Int(0));
    assert_eq!(power(1, huge).unwrap(), Value::Int(1));
    assert_eq!(power(-1, huge).unwrap(), Value::Int(1));
    assert_eq!(power(-1, huge + 1).unwrap(), Value::Int(-1));
    assert!(power(2, huge)
        .unwrap_err()
        .is_exception(ErrorKind::OverflowError));
}

/// Appends `name = <class built from body>`, deriving from the names in
/// `bases` and passing `metaclass=` when given.
fn define_class(
    asm: &mut Assembler,
    name: &str,
    body: Code,
    bases: &[&str],
    metaclass: Option<&str>,
) {
    asm.op(Opcode::LoadBuildClass)
        .load_const(body)
        .load_const(name)
        .op_arg(Opcode::MakeFunction, 0)
        .load_const(name);
    for base in bases {
        asm.load_name(base);
    }
    let positional = u32::try_from(bases.len()).unwrap() + 2;
    match metaclass {
        Some(metaclass) => {
            asm.load_name(metaclass)
                .load_const(Constant::Tuple(vec![Constant::from("metaclass")]))
                .op_arg(Opcode::CallFunctionKw, positional + 1);
        }
        None => {
            asm.call(positional);
        }
    }
    asm.store_name(name);
}

fn empty_body(name: &str) -> Code {
    let mut body = Assembler::new(name);
    body.load_none().return_value();
    body.build()
}

#[test]
fn bound_methods_record_their_declaring_class() {
    let mut who = Assembler::new("who").with_arguments(&["self"]);
    who.load_const("base").return_value();
    let mut base_body = Assembler::new("Base");
    define(&mut base_body, "who", who.build());
    base_body.load_none().return_value();

    // class Base: def who(self): ...; class Child(Base): pass; Child().who
    let mut asm = Assembler::new("<module>");
    define_class(&mut asm, "Base", base_body.build(), &[], None);
    define_class(&mut asm, "Child", empty_body("Child"), &["Base"], None);
    asm.load_name("Child").call(0).load_attr("who").return_value();

    let mut vm = Vm::default();
    let globals = vm.module_namespace("__main__");
    let method = vm.run_in(&asm.build(), &globals).unwrap();
    let base = globals
        .get(&Symbol::from("Base"))
        .and_then(|base| base.as_type::<Class>())
        .expect("Base defined");
    let bound = method.downcast_ref::<Method>().expect("bound method");
    assert!(bound.class().is_some_and(|class| class.ptr_eq(&base)));
    assert_eq!(
        vm.call(&method, Arguments::default()).unwrap(),
        Value::from("base")
    );

    let misplaced = Value::dynamic(Method::bound(
        bound.function().clone(),
        Value::Int(1),
        Some(base),
    ));
    let err = vm.call(&misplaced, Arguments::default()).unwrap_err();
    assert!(err.is_exception(ErrorKind::TypeError));
    assert!(err
        .to_string()
        .contains("must be called with Base instance as first argument"));
}

#[test]
fn metaclass_keyword_accepts_any_callable() {
    // def tagged(name, bases, ns): return name + "!"
    let mut tagged = Assembler::new("tagged").with_arguments(&["name", "bases", "ns"]);
    tagged
        .load_fast("name")
        .load_const("!")
        .binary(BinaryOperator::Add)
        .return_value();

    let mut asm = Assembler::new("<module>");
    define(&mut asm, "tagged", tagged.build());
    define_class(&mut asm, "A", empty_body("A"), &[], Some("tagged"));
    asm.load_name("A").return_value();
    assert_eq!(run(&asm.build()).unwrap(), Value::from("A!"));
}

/// `class Meta(type)` with a `__prepare__` classmethod seeding `seed = 1`,
/// an `__init__` recording the class name as `created`, and a `describe`
/// method returning `cls.__name__`.
fn recording_metaclass() -> Code {
    let mut prepare = Assembler::new("__prepare__").with_arguments(&["mcs", "name", "bases"]);
    prepare
        .load_const("seed")
        .load_const(1)
        .op_arg(Opcode::BuildMap, 1)
        .return_value();

    let mut init = Assembler::new("__init__").with_arguments(&["cls", "name", "bases", "ns"]);
    init.load_fast("name")
        .load_fast("cls")
        .store_attr("created")
        .load_none()
        .return_value();

    let mut describe = Assembler::new("describe").with_arguments(&["cls"]);
    describe.load_fast("cls").load_attr("__name__").return_value();

    let mut body = Assembler::new("Meta");
    body.load_name("classmethod")
        .load_const(prepare.build())
        .load_const("Meta.__prepare__")
        .op_arg(Opcode::MakeFunction, 0)
        .call(1)
        .store_name("__prepare__");
    define(&mut body, "__init__", init.build());
    define(&mut body, "describe", describe.build());
    body.load_none().return_value();
    body.build()
}

#[test]
fn metaclass_prepares_initializes_and_is_inherited() {
    let mut asm = Assembler::new("<module>");
    define_class(&mut asm, "Meta", recording_metaclass(), &["type"], None);
    define_class(&mut asm, "A", empty_body("A"), &[], Some("Meta"));
    define_class(&mut asm, "B", empty_body("B"), &["A"], None);
    asm.load_name("type")
        .load_name("B")
        .call(1)
        .load_name("Meta")
        .compare(CompareOp::Is)
        .load_name("B")
        .load_attr("seed")
        .load_name("B")
        .load_attr("created")
        .load_name("B")
        .load_attr("describe")
        .call(0)
        .load_name("isinstance")
        .load_name("B")
        .load_name("Meta")
        .call(2)
        .load_name("issubclass")
        .load_name("Meta")
        .load_name("type")
        .call(2)
        .op_arg(Opcode::BuildTuple, 6)
        .return_value();
    assert_eq!(
        run(&asm.build()).unwrap().repr(),
        "(True, 1, 'B', 'B', True, True)"
    );
}

#[test]
fn metaclass_conflict() {
    let mut asm = Assembler::new("<module>");
    define_class(&mut asm, "First", empty_body("First"), &["type"], None);
    define_class(&mut asm, "Second", empty_body("Second"), &["type"], None);
    define_class(&mut asm, "A", empty_body("A"), &[], Some("First"));
    define_class(&mut asm, "B", empty_body("B"), &[], Some("Second"));
    define_class(&mut asm, "C", empty_body("C"), &["A", "B"], None);
    asm.load_none().return_value();
    let err = run(&asm.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::TypeError));
    assert!(err.to_string().starts_with("TypeError: metaclass conflict"));

    // A metaclass deriving from both resolves the conflict.
    let mut asm = Assembler::new("<module>");
    define_class(&mut asm, "First", empty_body("First"), &["type"], None);
    define_class(&mut asm, "Second", empty_body("Second"), &["type"], None);
    define_class(&mut asm, "Both", empty_body("Both"), &["First", "Second"], None);
    define_class(&mut asm, "A", empty_body("A"), &[], Some("First"));
    define_class(&mut asm, "B", empty_body("B"), &[], Some("Both"));
    define_class(&mut asm, "C", empty_body("C"), &["A", "B"], None);
    asm.load_name("type")
        .load_name("C")
        .call(1)
        .load_attr("__name__")
        .return_value();
    assert_eq!(run(&asm.build()).unwrap(), Value::from("Both"));
}

/// A class whose `__enter__` returns nothing and whose `__exit__` records
/// whether it saw an exception.
fn recording_manager(events: &Arc<parking_lot::Mutex<Vec<&'static str>>>) -> Value {
    let namespace = Namespace::default();
    namespace.insert(
        Symbol::from("__enter__"),
        Value::dynamic(NativeFunction::method("__enter__", |_vm, _args| {
            Ok(Value::None)
        })),
    );
    let events = events.clone();
    namespace.insert(
        Symbol::from("__exit__"),
        Value::dynamic(NativeFunction::method("__exit__", move |_vm, args| {
            let clean = args.positional.get(1).map_or(true, Value::is_none);
            events.lock().push(if clean { "exit" } else { "exit error" });
            Ok(Value::None)
        })),
    );
    Value::dynamic(
        Class::new(
            Symbol::from("Manager"),
            Symbol::from("Manager"),
            Vec::new(),
            Arc::new(namespace),
        )
        .unwrap(),
    )
}

/// Appends the cleanup sequence a `with` block ends with.
fn with_cleanup(asm: &mut Assembler, cleanup: crate::code::assemble::Label) {
    asm.op(Opcode::PopBlock)
        .load_none()
        .mark(cleanup)
        .op(Opcode::WithCleanupStart)
        .op(Opcode::WithCleanupFinish)
        .op(Opcode::EndFinally);
}

#[test]
fn with_exits_on_return() {
    // def f(): with Manager(): return 42
    let mut body = Assembler::new("f");
    let cleanup = body.label();
    body.load_global("Manager")
        .call(0)
        .jump(Opcode::SetupWith, cleanup)
        .op(Opcode::PopTop)
        .load_const(42)
        .return_value();
    with_cleanup(&mut body, cleanup);
    body.load_none().return_value();

    let mut asm = Assembler::new("<module>");
    define(&mut asm, "f", body.build());
    asm.load_name("f").call(0).return_value();

    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let result = Vm::default().run(
        &asm.build(),
        [(Symbol::from("Manager"), recording_manager(&events))],
    );
    assert_eq!(result.unwrap(), Value::Int(42));
    assert_eq!(*events.lock(), ["exit"]);
}

#[test]
fn with_exits_on_break_and_continue() {
    // for i in range(3):
    //     with Manager():
    //         if i == 0: continue
    //         break
    let mut asm = Assembler::new("<module>");
    let end = asm.label();
    let top = asm.label();
    let done = asm.label();
    let cleanup = asm.label();
    let brk = asm.label();
    asm.jump(Opcode::SetupLoop, end)
        .load_name("range")
        .load_const(3)
        .call(1)
        .op(Opcode::GetIter)
        .mark(top)
        .jump(Opcode::ForIter, done)
        .store_name("i")
        .load_name("Manager")
        .call(0)
        .jump(Opcode::SetupWith, cleanup)
        .op(Opcode::PopTop)
        .load_name("i")
        .load_const(0)
        .compare(CompareOp::Equal)
        .jump(Opcode::PopJumpIfFalse, brk)
        .jump(Opcode::ContinueLoop, top)
        .mark(brk)
        .op(Opcode::BreakLoop);
    with_cleanup(&mut asm, cleanup);
    asm.jump(Opcode::JumpAbsolute, top)
        .mark(done)
        .op(Opcode::PopBlock)
        .mark(end)
        .load_name("i")
        .return_value();

    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let result = Vm::default().run(
        &asm.build(),
        [(Symbol::from("Manager"), recording_manager(&events))],
    );
    assert_eq!(result.unwrap(), Value::Int(1));
    assert_eq!(*events.lock(), ["exit", "exit"]);
}

/// Emits an instruction's inputs followed by the instruction, paired with
/// the number of values it leaves on the stack.
type ArityCase = (&'static str, fn(&mut Assembler), u32);

const ARITIES: &[ArityCase] = &[
    ("NOP", |asm| {
        asm.op(Opcode::Nop);
    }, 0),
    ("LOAD_CONST", |asm| {
        asm.load_const(1);
    }, 1),
    ("POP_TOP", |asm| {
        asm.load_const(1).op(Opcode::PopTop);
    }, 0),
    ("ROT_TWO", |asm| {
        asm.load_const(1).load_const(2).op(Opcode::RotTwo);
    }, 2),
    ("ROT_THREE", |asm| {
        asm.load_const(1)
            .load_const(2)
            .load_const(3)
            .op(Opcode::RotThree);
    }, 3),
    ("DUP_TOP", |asm| {
        asm.load_const(1).op(Opcode::DupTop);
    }, 2),
    ("DUP_TOP_TWO", |asm| {
        asm.load_const(1).load_const(2).op(Opcode::DupTopTwo);
    }, 4),
    ("UNARY_NEGATIVE", |asm| {
        asm.load_const(1).unary(UnaryOperator::Negative);
    }, 1),
    ("BINARY_ADD", |asm| {
        asm.load_const(1)
            .load_const(2)
            .binary(BinaryOperator::Add);
    }, 1),
    ("INPLACE_ADD", |asm| {
        asm.load_const(1)
            .load_const(2)
            .inplace(BinaryOperator::Add);
    }, 1),
    ("COMPARE_OP", |asm| {
        asm.load_const(1).load_const(2).compare(CompareOp::Less);
    }, 1),
    ("STORE_NAME", |asm| {
        asm.load_const(1).store_name("x");
    }, 0),
    ("BUILD_TUPLE", |asm| {
        asm.load_const(1)
            .load_const(2)
            .load_const(3)
            .op_arg(Opcode::BuildTuple, 3);
    }, 1),
    ("BUILD_LIST", |asm| {
        asm.load_const(1).load_const(2).op_arg(Opcode::BuildList, 2);
    }, 1),
    ("BUILD_MAP", |asm| {
        asm.load_const("a")
            .load_const(1)
            .load_const("b")
            .load_const(2)
            .op_arg(Opcode::BuildMap, 2);
    }, 1),
    ("BUILD_CONST_KEY_MAP", |asm| {
        asm.load_const(1)
            .load_const(2)
            .load_const(Constant::Tuple(vec![Constant::from("a"), Constant::from("b")]))
            .op_arg(Opcode::BuildConstKeyMap, 2);
    }, 1),
    ("BUILD_SLICE", |asm| {
        asm.load_const(1).load_const(2).op_arg(Opcode::BuildSlice, 2);
    }, 1),
    ("BUILD_STRING", |asm| {
        asm.load_const("a").load_const("b").op_arg(Opcode::BuildString, 2);
    }, 1),
    ("FORMAT_VALUE", |asm| {
        asm.load_const(1).op_arg(Opcode::FormatValue, 0);
    }, 1),
    ("UNPACK_SEQUENCE", |asm| {
        asm.load_const(Constant::Tuple(vec![
            Constant::from(1),
            Constant::from(2),
            Constant::from(3),
        ]))
        .op_arg(Opcode::UnpackSequence, 3);
    }, 3),
    ("UNPACK_EX", |asm| {
        asm.load_const(Constant::Tuple(vec![
            Constant::from(1),
            Constant::from(2),
            Constant::from(3),
            Constant::from(4),
        ]))
        .op_arg(Opcode::UnpackEx, 1 | (1 << 8));
    }, 3),
    ("BINARY_SUBSCR", |asm| {
        asm.load_const(1)
            .op_arg(Opcode::BuildList, 1)
            .load_const(0)
            .binary(BinaryOperator::Subscr);
    }, 1),
    ("STORE_SUBSCR", |asm| {
        asm.load_const(2)
            .load_const(1)
            .op_arg(Opcode::BuildList, 1)
            .load_const(0)
            .op(Opcode::StoreSubscr);
    }, 0),
    ("DELETE_SUBSCR", |asm| {
        asm.load_const(1)
            .op_arg(Opcode::BuildList, 1)
            .load_const(0)
            .op(Opcode::DeleteSubscr);
    }, 0),
    ("LOAD_ATTR", |asm| {
        asm.load_const("a").load_attr("upper");
    }, 1),
    ("GET_ITER", |asm| {
        asm.op_arg(Opcode::BuildList, 0).op(Opcode::GetIter);
    }, 1),
    ("CALL_FUNCTION", |asm| {
        asm.load_name("abs").load_const(-1).call(1);
    }, 1),
    ("CALL_FUNCTION_KW", |asm| {
        asm.load_name("int")
            .load_const("10")
            .load_const(2)
            .load_const(Constant::Tuple(vec![Constant::from("base")]))
            .op_arg(Opcode::CallFunctionKw, 2);
    }, 1),
    ("MAKE_FUNCTION", |asm| {
        let mut body = Assembler::new("f");
        body.load_none().return_value();
        asm.load_const(body.build())
            .load_const("f")
            .op_arg(Opcode::MakeFunction, 0);
    }, 1),
];

#[test]
fn instructions_leave_their_documented_arity() {
    for (name, emit, outputs) in ARITIES {
        let mut asm = Assembler::new("<module>");
        emit(&mut asm);
        for _ in 0..*outputs {
            asm.op(Opcode::PopTop);
        }
        asm.load_none().return_value();
        assert_eq!(run(&asm.build()), Ok(Value::None), "{name}");
    }
}

#[test]
fn nested_scopes_restore_stack_depth() {
    // Each scope is entered and left normally around a sentinel left on the
    // stack beforehand; returning the sentinel requires every scope to leave
    // the stack as it found it.
    let mut asm = Assembler::new("<module>");
    let loop_end = asm.label();
    let handler = asm.label();
    let after_except = asm.label();
    let finally = asm.label();
    let cleanup = asm.label();
    asm.load_const("sentinel")
        .jump(Opcode::SetupLoop, loop_end)
        .jump(Opcode::SetupExcept, handler)
        .jump(Opcode::SetupFinally, finally)
        .load_name("Manager")
        .call(0)
        .jump(Opcode::SetupWith, cleanup)
        .op(Opcode::PopTop)
        .load_const(1)
        .load_const(2)
        .binary(BinaryOperator::Add)
        .op(Opcode::PopTop);
    with_cleanup(&mut asm, cleanup);
    asm.op(Opcode::PopBlock)
        .load_none()
        .mark(finally)
        .op(Opcode::EndFinally)
        .op(Opcode::PopBlock)
        .jump(Opcode::JumpForward, after_except)
        .mark(handler)
        .op(Opcode::EndFinally)
        .mark(after_except)
        .op(Opcode::PopBlock)
        .mark(loop_end)
        .return_value();

    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let result = Vm::default().run(
        &asm.build(),
        [(Symbol::from("Manager"), recording_manager(&events))],
    );
    assert_eq!(result.unwrap(), Value::from("sentinel"));
    assert_eq!(*events.lock(), ["exit"]);
}

#[test]
fn diamond_inheritance_uses_c3_order() {
    // class A; class B(A); class C(A); class D(B, C); D.__mro__
    let mut asm = Assembler::new("<module>");
    define_class(&mut asm, "A", empty_body("A"), &[], None);
    define_class(&mut asm, "B", empty_body("B"), &["A"], None);
    define_class(&mut asm, "C", empty_body("C"), &["A"], None);
    define_class(&mut asm, "D", empty_body("D"), &["B", "C"], None);
    asm.load_name("D").load_attr("__mro__").return_value();
    let mro = run(&asm.build()).unwrap();
    let names = mro
        .downcast_ref::<Tuple>()
        .expect("tuple")
        .as_slice()
        .iter()
        .map(|class| class.downcast_ref::<Class>().expect("class").name().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, ["D", "B", "C", "A", "object"]);

    // class E(A, B) cannot place A both before and after B.
    let mut asm = Assembler::new("<module>");
    define_class(&mut asm, "A", empty_body("A"), &[], None);
    define_class(&mut asm, "B", empty_body("B"), &["A"], None);
    define_class(&mut asm, "E", empty_body("E"), &["A", "B"], None);
    asm.load_none().return_value();
    let err = run(&asm.build()).unwrap_err();
    assert!(err.is_exception(ErrorKind::TypeError));
}
