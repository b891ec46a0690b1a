//! Exercises the embedding surface: native modules and functions, host calls
//! into interpreted code, and loading modules from disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytevm::code::assemble::Assembler;
use bytevm::code::opcode::{BinaryOperator, CompareOp, Opcode};
use bytevm::code::{Code, Constant};
use bytevm::loader::{run_file, to_rsn, FsLoader};
use bytevm::runtime::exception::ErrorKind;
use bytevm::runtime::namespace::Namespace;
use bytevm::runtime::symbol::Symbol;
use bytevm::runtime::types::Class;
use bytevm::runtime::value::Value;
use bytevm::vm::call::Arguments;
use bytevm::vm::function::NativeFunction;
use bytevm::vm::import::{LoadError, Module};
use bytevm::vm::{ExecutionError, Fault, OutputBuffer, Vm};
use parking_lot::Mutex;

fn main() {
    let filter = std::env::args().nth(1).unwrap_or_default();
    let tests: [(&str, fn()); 6] = [
        ("native_module", native_module),
        ("host_calls_interpreted_function", host_calls_interpreted_function),
        ("host_errors_become_exceptions", host_errors_become_exceptions),
        ("host_context_manager", host_context_manager),
        ("filesystem_loader", filesystem_loader),
        ("unreadable_module", unreadable_module),
    ];
    for (name, test) in tests {
        if !filter.is_empty() && !name.starts_with(filter.trim()) {
            continue;
        }
        println!("Running {name}");
        test();
    }
}

fn import(asm: &mut Assembler, module: &str, bind: &str) {
    asm.load_const(0)
        .load_none()
        .named(Opcode::ImportName, module)
        .store_name(bind);
}

fn greeter_vm() -> Vm {
    Vm::new().with_native_module("host", |_vm| {
        let namespace = Namespace::default();
        namespace.insert(
            Symbol::from("greet"),
            Value::dynamic(NativeFunction::new("greet", |_vm, args| {
                let [name] = args.exactly("greet")?;
                let name = name
                    .as_str()
                    .ok_or_else(|| Fault::type_error("greet() expects a str"))?;
                Ok(Value::from(format!("hello, {name}")))
            })),
        );
        namespace.insert(
            Symbol::from("reject"),
            Value::dynamic(NativeFunction::new("reject", |_vm, _args| {
                Err(Fault::value_error("bad host input"))
            })),
        );
        Ok(Arc::new(namespace))
    })
}

fn native_module() {
    let mut asm = Assembler::new("<module>");
    import(&mut asm, "host", "host");
    asm.load_name("host")
        .load_attr("greet")
        .load_const("vm")
        .call(1)
        .return_value();

    let mut vm = greeter_vm();
    let result = vm.run(&asm.build(), []).unwrap();
    assert_eq!(result.as_str(), Some("hello, vm"));

    let host = vm.import("host").unwrap();
    assert_eq!(host.repr(), "<module 'host'>");
}

fn host_calls_interpreted_function() {
    let mut double = Assembler::new("double").with_arguments(&["x"]);
    double
        .load_fast("x")
        .load_const(2)
        .binary(BinaryOperator::Multiply)
        .return_value();

    let mut asm = Assembler::new("<module>");
    asm.load_const(double.build())
        .load_const("double")
        .op_arg(Opcode::MakeFunction, 0)
        .store_name("double")
        .load_none()
        .return_value();

    let mut vm = Vm::new();
    let globals = vm.module_namespace("__main__");
    vm.run_in(&asm.build(), &globals).unwrap();
    let double = globals
        .get(&Symbol::from("double"))
        .expect("double defined");
    let result = vm
        .call(&double, Arguments::new(vec![Value::Int(21)]))
        .unwrap();
    assert_eq!(result, Value::Int(42));

    let err = vm.call(&double, Arguments::default()).unwrap_err();
    assert!(err.is_exception(ErrorKind::TypeError));
    assert!(vm.frames().is_empty());
}

fn host_errors_become_exceptions() {
    // try: host.reject() except ValueError as e: result = e.args[0]
    let mut asm = Assembler::new("<module>").with_filename("host.py");
    import(&mut asm, "host", "host");
    let handler = asm.label();
    let reraise = asm.label();
    let end = asm.label();
    asm.jump(Opcode::SetupExcept, handler)
        .set_line(3)
        .load_name("host")
        .load_attr("reject")
        .call(0)
        .op(Opcode::PopTop)
        .op(Opcode::PopBlock)
        .jump(Opcode::JumpForward, end)
        .mark(handler)
        .op(Opcode::DupTop)
        .load_name("ValueError")
        .compare(CompareOp::ExceptionMatch)
        .jump(Opcode::PopJumpIfFalse, reraise)
        .op(Opcode::PopTop)
        .store_name("e")
        .op(Opcode::PopTop)
        .load_name("e")
        .load_attr("args")
        .load_const(0)
        .binary(BinaryOperator::Subscr)
        .store_name("result")
        .op(Opcode::PopExcept)
        .jump(Opcode::JumpForward, end)
        .mark(reraise)
        .op(Opcode::EndFinally)
        .mark(end)
        .load_name("result")
        .return_value();
    let mut vm = greeter_vm();
    let result = vm.run(&asm.build(), []).unwrap();
    assert_eq!(result.as_str(), Some("bad host input"));

    let mut uncaught = Assembler::new("<module>").with_filename("host.py");
    import(&mut uncaught, "host", "host");
    uncaught
        .set_line(2)
        .load_name("host")
        .load_attr("reject")
        .call(0)
        .return_value();
    let err = greeter_vm().run(&uncaught.build(), []).unwrap_err();
    let ExecutionError::Exception(exception) = err else {
        unreachable!("expected an exception, got {err:?}")
    };
    assert_eq!(exception.to_string(), "ValueError: bad host input");
    assert_eq!(
        exception.format(),
        "Traceback (most recent call last):\n  File \"host.py\", line 2, in <module>\nValueError: bad host input\n"
    );
}

fn host_context_manager() {
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let namespace = Namespace::default();
    let entered = events.clone();
    namespace.insert(
        Symbol::from("__enter__"),
        Value::dynamic(NativeFunction::method("__enter__", move |_vm, _args| {
            entered.lock().push(String::from("enter"));
            Ok(Value::from("resource"))
        })),
    );
    let exited = events.clone();
    namespace.insert(
        Symbol::from("__exit__"),
        Value::dynamic(NativeFunction::method("__exit__", move |_vm, args| {
            let kind = args.positional.get(1).cloned().unwrap_or_default();
            exited
                .lock()
                .push(format!("exit {}", if kind.is_none() { "clean" } else { "error" }));
            Ok(Value::Bool(false))
        })),
    );
    let resource = Class::new(
        Symbol::from("Resource"),
        Symbol::from("Resource"),
        Vec::new(),
        Arc::new(namespace),
    )
    .unwrap();

    // with Resource() as r: print(r)
    let mut asm = Assembler::new("<module>");
    let cleanup = asm.label();
    asm.load_name("Resource")
        .call(0)
        .jump(Opcode::SetupWith, cleanup)
        .store_name("r")
        .load_name("print")
        .load_name("r")
        .call(1)
        .op(Opcode::PopTop)
        .op(Opcode::PopBlock)
        .load_none()
        .mark(cleanup)
        .op(Opcode::WithCleanupStart)
        .op(Opcode::WithCleanupFinish)
        .op(Opcode::EndFinally)
        .load_none()
        .return_value();

    let output = OutputBuffer::default();
    let mut vm = Vm::new().with_output(output.clone());
    vm.run(
        &asm.build(),
        [(Symbol::from("Resource"), Value::dynamic(resource))],
    )
    .unwrap();
    assert_eq!(output.contents(), "resource\n");
    assert_eq!(*events.lock(), ["enter", "exit clean"]);
}

struct ScratchDir(PathBuf);

impl ScratchDir {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("bytevm-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    fn write(&self, relative: &str, contents: &str) {
        let path = self.0.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn constant_module(name: &str, value: i64) -> Code {
    let mut asm = Assembler::new("<module>").with_filename(format!("{name}.py"));
    asm.load_const(value)
        .store_name("VALUE")
        .load_none()
        .return_value();
    asm.build()
}

fn filesystem_loader() {
    let dir = ScratchDir::new("loader");
    dir.write("mathutil.rsn", &to_rsn(&constant_module("mathutil", 7)));
    dir.write("pkg/__init__.rsn", &to_rsn(&constant_module("pkg", 1)));
    dir.write("pkg/sub.rsn", &to_rsn(&constant_module("sub", 35)));

    // import mathutil; import pkg.sub; mathutil.VALUE + pkg.sub.VALUE
    let mut asm = Assembler::new("<module>");
    import(&mut asm, "mathutil", "mathutil");
    import(&mut asm, "pkg.sub", "pkg");
    asm.load_name("mathutil")
        .load_attr("VALUE")
        .load_name("pkg")
        .load_attr("sub")
        .load_attr("VALUE")
        .binary(BinaryOperator::Add)
        .return_value();

    let mut vm = Vm::new().with_loader(FsLoader::new(dir.path()));
    let result = vm.run(&asm.build(), []).unwrap();
    assert_eq!(result, Value::Int(42));

    for name in ["pkg", "pkg.sub"] {
        let module = vm.modules().get(&Symbol::from(name)).expect("module loaded");
        let module = module.downcast_ref::<Module>().expect("module");
        assert_eq!(
            module.namespace().get(&Symbol::from("__package__")),
            Some(Value::from("pkg")),
            "{name}"
        );
    }

    // The same program, run from a file next to its modules.
    let mut program = Assembler::new("<module>");
    import(&mut program, "mathutil", "mathutil");
    program.load_name("mathutil").load_attr("VALUE").return_value();
    dir.write("main.rsn", &to_rsn(&program.build()));
    let mut fresh = Vm::new().with_loader(FsLoader::new(dir.path()));
    let result = run_file(&mut fresh, &dir.path().join("main.rsn")).unwrap();
    assert_eq!(result, Value::Int(7));
    assert!(matches!(
        run_file(&mut fresh, &dir.path().join("absent.rsn")),
        Err(bytevm::Error::Load(LoadError::Unreadable { .. }))
    ));

    // from pkg import missing
    let mut asm = Assembler::new("<module>");
    asm.load_const(0)
        .load_const(Constant::Tuple(vec![Constant::from("missing")]))
        .named(Opcode::ImportName, "pkg")
        .named(Opcode::ImportFrom, "missing")
        .return_value();
    let err = vm.run(&asm.build(), []).unwrap_err();
    assert!(err.is_exception(ErrorKind::ImportError));
    assert_eq!(err.to_string(), "ImportError: cannot import name 'missing'");
}

fn unreadable_module() {
    let dir = ScratchDir::new("unreadable");
    dir.write("broken.rsn", "this is not a code object");

    let mut asm = Assembler::new("<module>");
    import(&mut asm, "broken", "broken");
    asm.load_none().return_value();

    let err = Vm::new()
        .with_loader(FsLoader::new(dir.path()))
        .run(&asm.build(), [])
        .unwrap_err();
    assert!(err.is_exception(ErrorKind::ImportError));
    assert!(!err.is_exception(ErrorKind::ModuleNotFoundError));
    assert!(err
        .to_string()
        .starts_with("ImportError: module 'broken' could not be loaded"));
}
