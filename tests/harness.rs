//! Runs named programs after round-tripping them through their rsn
//! representation, comparing each result to its expected output.

use bytevm::code::assemble::Assembler;
use bytevm::code::opcode::{BinaryOperator, CompareOp, Opcode};
use bytevm::code::{Code, Constant};
use bytevm::runtime::value::Value;
use bytevm::vm::{ExecutionError, Vm};
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum TestOutput {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Repr(String),
    Exception(String),
    NoBudget,
}

impl From<Result<Value, ExecutionError>> for TestOutput {
    fn from(result: Result<Value, ExecutionError>) -> Self {
        match result {
            Ok(Value::None) => TestOutput::None,
            Ok(Value::Bool(value)) => TestOutput::Bool(value),
            Ok(Value::Int(value)) => TestOutput::Int(value),
            Ok(Value::Float(value)) => TestOutput::Float(value),
            Ok(Value::Str(value)) => TestOutput::Str(value.to_string()),
            Ok(other) => TestOutput::Repr(other.repr()),
            Err(ExecutionError::Exception(exception)) => {
                TestOutput::Exception(exception.to_string())
            }
            Err(ExecutionError::NoBudget) => TestOutput::NoBudget,
            Err(ExecutionError::Internal(fault)) => {
                unreachable!("internal error: {fault}")
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Case {
    pub code: Code,
    #[serde(default)]
    pub budget: Option<usize>,
    pub output: TestOutput,
}

impl Case {
    fn new(code: Code, output: TestOutput) -> Self {
        Self {
            code,
            budget: None,
            output,
        }
    }

    fn with_budget(mut self, budget: usize) -> Self {
        self.budget = Some(budget);
        self
    }

    fn run(&self) -> TestOutput {
        let mut vm = Vm::new();
        if let Some(budget) = self.budget {
            vm.increase_budget(budget);
        }
        TestOutput::from(vm.run(&self.code, []))
    }
}

fn main() {
    let filter = std::env::args().nth(1).unwrap_or_default();
    for (name, case) in cases() {
        if !filter.is_empty() && !name.starts_with(filter.trim()) {
            continue;
        }
        println!("Running {name}");
        let serialized = rsn::to_string_pretty(&case);
        let case: Case = match rsn::from_str(&serialized) {
            Ok(case) => case,
            Err(err) => unreachable!("error parsing {name}: {err}\n{serialized}"),
        };
        assert_eq!(
            rsn::to_string_pretty(&case),
            serialized,
            "{name} changed after round-tripping"
        );
        let output = case.run();
        assert_eq!(
            output, case.output,
            "in {name}: expected {expected:?}, got {output:?}",
            expected = case.output
        );
    }
}

fn define(asm: &mut Assembler, name: &str, code: Code) {
    asm.load_const(code)
        .load_const(name)
        .op_arg(Opcode::MakeFunction, 0)
        .store_name(name);
}

fn cases() -> Vec<(&'static str, Case)> {
    vec![
        ("fibonacci", fibonacci()),
        ("for_loop_accumulates", for_loop_accumulates()),
        ("generator_feeds_sum", generator_feeds_sum()),
        ("keyword_call", keyword_call()),
        ("string_methods", string_methods()),
        ("slicing", slicing()),
        ("unpacking", unpacking()),
        ("dict_subscripts", dict_subscripts()),
        ("float_division", float_division()),
        ("zero_division", zero_division()),
        ("missing_key", missing_key()),
        ("comparison_chain", comparison_chain()),
        ("budget_exhausted", budget_exhausted()),
    ]
}

fn fibonacci() -> Case {
    let mut fib = Assembler::new("fib")
        .with_filename("fib.py")
        .with_arguments(&["n"]);
    let recurse = fib.label();
    fib.load_fast("n")
        .load_const(2)
        .compare(CompareOp::Less)
        .jump(Opcode::PopJumpIfFalse, recurse)
        .load_fast("n")
        .return_value()
        .mark(recurse)
        .load_global("fib")
        .load_fast("n")
        .load_const(1)
        .binary(BinaryOperator::Subtract)
        .call(1)
        .load_global("fib")
        .load_fast("n")
        .load_const(2)
        .binary(BinaryOperator::Subtract)
        .call(1)
        .binary(BinaryOperator::Add)
        .return_value();

    let mut asm = Assembler::new("<module>").with_filename("fib.py");
    define(&mut asm, "fib", fib.build());
    asm.load_name("fib").load_const(15).call(1).return_value();
    Case::new(asm.build(), TestOutput::Int(610))
}

fn for_loop_accumulates() -> Case {
    let mut asm = Assembler::new("<module>");
    let end = asm.label();
    let top = asm.label();
    let done = asm.label();
    asm.load_const(0)
        .store_name("total")
        .jump(Opcode::SetupLoop, end)
        .load_name("range")
        .load_const(5)
        .call(1)
        .op(Opcode::GetIter)
        .mark(top)
        .jump(Opcode::ForIter, done)
        .store_name("i")
        .load_name("total")
        .load_name("i")
        .load_name("i")
        .binary(BinaryOperator::Multiply)
        .inplace(BinaryOperator::Add)
        .store_name("total")
        .jump(Opcode::JumpAbsolute, top)
        .mark(done)
        .op(Opcode::PopBlock)
        .mark(end)
        .load_name("total")
        .return_value();
    Case::new(asm.build(), TestOutput::Int(30))
}

fn generator_feeds_sum() -> Case {
    let mut generator = Assembler::new("count").generator();
    let end = generator.label();
    let top = generator.label();
    let done = generator.label();
    generator
        .jump(Opcode::SetupLoop, end)
        .load_global("range")
        .load_const(4)
        .call(1)
        .op(Opcode::GetIter)
        .mark(top)
        .jump(Opcode::ForIter, done)
        .store_fast("i")
        .load_fast("i")
        .op(Opcode::YieldValue)
        .op(Opcode::PopTop)
        .jump(Opcode::JumpAbsolute, top)
        .mark(done)
        .op(Opcode::PopBlock)
        .mark(end)
        .load_none()
        .return_value();

    let mut asm = Assembler::new("<module>");
    define(&mut asm, "count", generator.build());
    asm.load_name("sum")
        .load_name("count")
        .call(0)
        .call(1)
        .return_value();
    Case::new(asm.build(), TestOutput::Int(6))
}

fn keyword_call() -> Case {
    // sorted([3, 1, 2], reverse=True)
    let mut asm = Assembler::new("<module>");
    asm.load_name("sorted")
        .load_const(3)
        .load_const(1)
        .load_const(2)
        .op_arg(Opcode::BuildList, 3)
        .load_const(true)
        .load_const(Constant::Tuple(vec!["reverse".into()]))
        .op_arg(Opcode::CallFunctionKw, 2)
        .return_value();
    Case::new(asm.build(), TestOutput::Repr(String::from("[3, 2, 1]")))
}

fn string_methods() -> Case {
    // "-".join(["a", "b"]).upper()
    let mut asm = Assembler::new("<module>");
    asm.load_const("-")
        .load_attr("join")
        .load_const("a")
        .load_const("b")
        .op_arg(Opcode::BuildList, 2)
        .call(1)
        .load_attr("upper")
        .call(0)
        .return_value();
    Case::new(asm.build(), TestOutput::Str(String::from("A-B")))
}

fn slicing() -> Case {
    // list(range(5))[1:4]
    let mut asm = Assembler::new("<module>");
    asm.load_name("list")
        .load_name("range")
        .load_const(5)
        .call(1)
        .call(1)
        .load_const(1)
        .load_const(4)
        .op_arg(Opcode::BuildSlice, 2)
        .binary(BinaryOperator::Subscr)
        .return_value();
    Case::new(asm.build(), TestOutput::Repr(String::from("[1, 2, 3]")))
}

fn unpacking() -> Case {
    // a, b = (1, 2); (b, a)
    let mut asm = Assembler::new("<module>");
    asm.load_const(1)
        .load_const(2)
        .op_arg(Opcode::BuildTuple, 2)
        .op_arg(Opcode::UnpackSequence, 2)
        .store_name("a")
        .store_name("b")
        .load_name("b")
        .load_name("a")
        .op_arg(Opcode::BuildTuple, 2)
        .return_value();
    Case::new(asm.build(), TestOutput::Repr(String::from("(2, 1)")))
}

fn dict_subscripts() -> Case {
    // d = {'a': 1}; d['b'] = 2; sorted(d.keys())
    let mut asm = Assembler::new("<module>");
    asm.load_const("a")
        .load_const(1)
        .op_arg(Opcode::BuildMap, 1)
        .store_name("d")
        .load_const(2)
        .load_name("d")
        .load_const("b")
        .op(Opcode::StoreSubscr)
        .load_name("sorted")
        .load_name("d")
        .load_attr("keys")
        .call(0)
        .call(1)
        .return_value();
    Case::new(asm.build(), TestOutput::Repr(String::from("['a', 'b']")))
}

fn float_division() -> Case {
    let mut asm = Assembler::new("<module>");
    asm.load_const(7)
        .load_const(2)
        .binary(BinaryOperator::TrueDivide)
        .return_value();
    Case::new(asm.build(), TestOutput::Float(3.5))
}

fn zero_division() -> Case {
    let mut asm = Assembler::new("<module>");
    asm.load_const(1)
        .load_const(0)
        .binary(BinaryOperator::FloorDivide)
        .return_value();
    Case::new(
        asm.build(),
        TestOutput::Exception(String::from(
            "ZeroDivisionError: integer division or modulo by zero",
        )),
    )
}

fn missing_key() -> Case {
    let mut asm = Assembler::new("<module>");
    asm.op_arg(Opcode::BuildMap, 0)
        .load_const("missing")
        .binary(BinaryOperator::Subscr)
        .return_value();
    Case::new(
        asm.build(),
        TestOutput::Exception(String::from("KeyError: 'missing'")),
    )
}

fn comparison_chain() -> Case {
    // 1 < 2 < 3, compiled the way CPython chains comparisons.
    let mut asm = Assembler::new("<module>");
    let cleanup = asm.label();
    let end = asm.label();
    asm.load_const(1)
        .load_const(2)
        .op(Opcode::DupTop)
        .op(Opcode::RotThree)
        .compare(CompareOp::Less)
        .jump(Opcode::JumpIfFalseOrPop, cleanup)
        .load_const(3)
        .compare(CompareOp::Less)
        .jump(Opcode::JumpForward, end)
        .mark(cleanup)
        .op(Opcode::RotTwo)
        .op(Opcode::PopTop)
        .mark(end)
        .return_value();
    Case::new(asm.build(), TestOutput::Bool(true))
}

fn budget_exhausted() -> Case {
    let mut asm = Assembler::new("<module>");
    let top = asm.label();
    asm.mark(top).jump(Opcode::JumpAbsolute, top);
    Case::new(asm.build(), TestOutput::NoBudget).with_budget(100)
}
