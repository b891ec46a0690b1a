//! Building [`CodeObject`]s instruction by instruction.

use super::opcode::{BinaryOperator, CompareOp, Opcode, OperandKind, UnaryOperator};
use super::{Code, CodeBody, CodeFlags, CodeObject, Constant, RawInstruction};
use crate::runtime::symbol::Symbol;

/// A jump target that may be placed after the jumps that reference it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum Argument {
    Value(u32),
    Label(Label),
}

/// Builds a [`Code`] object using the logical instruction form.
///
/// Jump targets are expressed with [`Label`]s, which are resolved to
/// relative or absolute arguments by [`Assembler::build`].
#[derive(Debug)]
pub struct Assembler {
    code: CodeObject,
    instructions: Vec<(Opcode, Argument, Option<u32>)>,
    labels: Vec<Option<usize>>,
    line: Option<u32>,
}

impl Assembler {
    /// Returns an assembler for a code object named `name`.
    #[must_use]
    pub fn new(name: impl Into<Symbol>) -> Self {
        Self {
            code: CodeObject {
                name: name.into(),
                filename: Symbol::from("<assembled>"),
                first_line: 1,
                arg_count: 0,
                kwonly_arg_count: 0,
                flags: CodeFlags::default(),
                varnames: Vec::new(),
                cellvars: Vec::new(),
                freevars: Vec::new(),
                names: Vec::new(),
                constants: Vec::new(),
                body: CodeBody::Instructions(Vec::new()),
            },
            instructions: Vec::new(),
            labels: Vec::new(),
            line: None,
        }
    }

    /// Sets the file name recorded in the code object.
    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<Symbol>) -> Self {
        self.code.filename = filename.into();
        self
    }

    /// Declares the positional parameters.
    ///
    /// # Panics
    ///
    /// Panics if any local variable has already been declared.
    #[must_use]
    pub fn with_arguments(mut self, names: &[&str]) -> Self {
        assert!(
            self.code.varnames.is_empty(),
            "parameters must be declared first"
        );
        self.code.arg_count = u32::try_from(names.len()).expect("too many arguments");
        self.code.varnames.extend(names.iter().copied().map(Symbol::from));
        self
    }

    /// Declares the keyword-only parameters. Must follow
    /// [`Self::with_arguments`], if used.
    #[must_use]
    pub fn with_kwonly_arguments(mut self, names: &[&str]) -> Self {
        self.code.kwonly_arg_count = u32::try_from(names.len()).expect("too many arguments");
        self.code.varnames.extend(names.iter().copied().map(Symbol::from));
        self
    }

    /// Declares the `*args` parameter.
    #[must_use]
    pub fn with_varargs(mut self, name: &str) -> Self {
        self.code.flags = self.code.flags | CodeFlags::VARARGS;
        self.code.varnames.push(Symbol::from(name));
        self
    }

    /// Declares the `**kwargs` parameter.
    #[must_use]
    pub fn with_varkeywords(mut self, name: &str) -> Self {
        self.code.flags = self.code.flags | CodeFlags::VARKEYWORDS;
        self.code.varnames.push(Symbol::from(name));
        self
    }

    /// Declares locals captured by nested functions.
    #[must_use]
    pub fn with_cellvars(mut self, names: &[&str]) -> Self {
        self.code.cellvars.extend(names.iter().copied().map(Symbol::from));
        self
    }

    /// Declares variables captured from the enclosing scope.
    #[must_use]
    pub fn with_freevars(mut self, names: &[&str]) -> Self {
        self.code.freevars.extend(names.iter().copied().map(Symbol::from));
        self
    }

    /// Marks this code as a generator.
    #[must_use]
    pub fn generator(mut self) -> Self {
        self.code.flags = self.code.flags | CodeFlags::GENERATOR;
        self
    }

    /// Attributes the following instructions to `line`.
    pub fn set_line(&mut self, line: u32) -> &mut Self {
        self.line = Some(line);
        self
    }

    /// Returns a new, unplaced label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Places `label` at the next instruction.
    ///
    /// # Panics
    ///
    /// Panics if `label` has already been placed.
    pub fn mark(&mut self, label: Label) -> &mut Self {
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label placed twice");
        *slot = Some(self.instructions.len());
        self
    }

    /// Appends `opcode` with no argument.
    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.op_arg(opcode, 0)
    }

    /// Appends `opcode` with `arg`.
    pub fn op_arg(&mut self, opcode: Opcode, arg: u32) -> &mut Self {
        let line = self.line.take();
        self.instructions
            .push((opcode, Argument::Value(arg), line));
        self
    }

    /// Appends a jump instruction targeting `label`.
    pub fn jump(&mut self, opcode: Opcode, label: Label) -> &mut Self {
        let line = self.line.take();
        self.instructions
            .push((opcode, Argument::Label(label), line));
        self
    }

    /// Appends `UNARY_<op>`.
    pub fn unary(&mut self, op: UnaryOperator) -> &mut Self {
        self.op(Opcode::Unary(op))
    }

    /// Appends `BINARY_<op>`.
    pub fn binary(&mut self, op: BinaryOperator) -> &mut Self {
        self.op(Opcode::Binary(op))
    }

    /// Appends `INPLACE_<op>`.
    pub fn inplace(&mut self, op: BinaryOperator) -> &mut Self {
        self.op(Opcode::Inplace(op))
    }

    /// Appends `COMPARE_OP`.
    pub fn compare(&mut self, op: CompareOp) -> &mut Self {
        self.op_arg(Opcode::CompareOp, op.arg())
    }

    /// Adds `constant` to the constants table and appends `LOAD_CONST`.
    pub fn load_const(&mut self, constant: impl Into<Constant>) -> &mut Self {
        let index = self.constant(constant.into());
        self.op_arg(Opcode::LoadConst, index)
    }

    /// Appends `LOAD_CONST None`.
    pub fn load_none(&mut self) -> &mut Self {
        self.load_const(Constant::None)
    }

    /// Adds `constant` to the constants table, returning its index.
    pub fn constant(&mut self, constant: Constant) -> u32 {
        self.code.constants.push(constant);
        index_of(self.code.constants.len() - 1)
    }

    /// Appends an instruction whose argument is the index of `name` in the
    /// names table.
    pub fn named(&mut self, opcode: Opcode, name: &str) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Name);
        let index = intern(&mut self.code.names, name);
        self.op_arg(opcode, index)
    }

    /// Appends `LOAD_NAME`.
    pub fn load_name(&mut self, name: &str) -> &mut Self {
        self.named(Opcode::LoadName, name)
    }

    /// Appends `STORE_NAME`.
    pub fn store_name(&mut self, name: &str) -> &mut Self {
        self.named(Opcode::StoreName, name)
    }

    /// Appends `LOAD_GLOBAL`.
    pub fn load_global(&mut self, name: &str) -> &mut Self {
        self.named(Opcode::LoadGlobal, name)
    }

    /// Appends `STORE_GLOBAL`.
    pub fn store_global(&mut self, name: &str) -> &mut Self {
        self.named(Opcode::StoreGlobal, name)
    }

    /// Appends `LOAD_ATTR`.
    pub fn load_attr(&mut self, name: &str) -> &mut Self {
        self.named(Opcode::LoadAttr, name)
    }

    /// Appends `STORE_ATTR`.
    pub fn store_attr(&mut self, name: &str) -> &mut Self {
        self.named(Opcode::StoreAttr, name)
    }

    /// Appends an instruction whose argument is the index of `name` in the
    /// local variable names, declaring it if needed.
    pub fn local(&mut self, opcode: Opcode, name: &str) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Local);
        let index = intern(&mut self.code.varnames, name);
        self.op_arg(opcode, index)
    }

    /// Appends `LOAD_FAST`.
    pub fn load_fast(&mut self, name: &str) -> &mut Self {
        self.local(Opcode::LoadFast, name)
    }

    /// Appends `STORE_FAST`.
    pub fn store_fast(&mut self, name: &str) -> &mut Self {
        self.local(Opcode::StoreFast, name)
    }

    /// Appends an instruction referencing the cell or free variable `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` was not declared with [`Self::with_cellvars`] or
    /// [`Self::with_freevars`].
    pub fn cell(&mut self, opcode: Opcode, name: &str) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Free);
        let index = self
            .code
            .cellvars
            .iter()
            .chain(&self.code.freevars)
            .position(|candidate| candidate == name)
            .unwrap_or_else(|| panic!("{name} is not a cell or free variable"));
        self.op_arg(opcode, index_of(index))
    }

    /// Appends `LOAD_DEREF`.
    pub fn load_deref(&mut self, name: &str) -> &mut Self {
        self.cell(Opcode::LoadDeref, name)
    }

    /// Appends `STORE_DEREF`.
    pub fn store_deref(&mut self, name: &str) -> &mut Self {
        self.cell(Opcode::StoreDeref, name)
    }

    /// Appends `LOAD_CLOSURE`.
    pub fn load_closure(&mut self, name: &str) -> &mut Self {
        self.cell(Opcode::LoadClosure, name)
    }

    /// Appends `CALL_FUNCTION` with `arg_count` positional arguments.
    pub fn call(&mut self, arg_count: u32) -> &mut Self {
        self.op_arg(Opcode::CallFunction, arg_count)
    }

    /// Appends `RETURN_VALUE`.
    pub fn return_value(&mut self) -> &mut Self {
        self.op(Opcode::ReturnValue)
    }

    /// Resolves every label and returns the finished code object.
    ///
    /// # Panics
    ///
    /// Panics if a referenced label was never placed.
    #[must_use]
    pub fn build(self) -> Code {
        let Self {
            mut code,
            instructions,
            labels,
            ..
        } = self;
        let instructions = instructions
            .into_iter()
            .enumerate()
            .map(|(index, (opcode, arg, line))| {
                let arg = match arg {
                    Argument::Value(arg) => arg,
                    Argument::Label(label) => {
                        let target = labels[label.0].expect("label never placed");
                        match opcode.operand_kind() {
                            OperandKind::RelativeJump => index_of(
                                target
                                    .checked_sub(index + 1)
                                    .expect("relative jumps must go forward"),
                            ),
                            _ => index_of(target),
                        }
                    }
                };
                RawInstruction { opcode, arg, line }
            })
            .collect();
        code.body = CodeBody::Instructions(instructions);
        if code.cellvars.is_empty() && code.freevars.is_empty() {
            code.flags = code.flags | CodeFlags::NOFREE;
        }
        Code::from(code)
    }
}

fn intern(table: &mut Vec<Symbol>, name: &str) -> u32 {
    let index = table
        .iter()
        .position(|candidate| candidate == name)
        .unwrap_or_else(|| {
            table.push(Symbol::from(name));
            table.len() - 1
        });
    index_of(index)
}

fn index_of(index: usize) -> u32 {
    u32::try_from(index).expect("table too large")
}
