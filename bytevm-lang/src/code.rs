//! Compiled code objects and their instruction streams.

use std::fmt::Debug;
use std::ops::{BitOr, Deref};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use self::opcode::Opcode;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{AnyDynamic, CustomType, Value};

pub mod assemble;
pub mod decode;
pub mod opcode;

/// Flags describing a [`CodeObject`], using CPython's bit values.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeFlags(pub u32);

impl CodeFlags {
    /// Locals are stored in fast slots.
    pub const OPTIMIZED: Self = Self(0x01);
    /// A new locals namespace is created for each call.
    pub const NEWLOCALS: Self = Self(0x02);
    /// The code accepts `*args`.
    pub const VARARGS: Self = Self(0x04);
    /// The code accepts `**kwargs`.
    pub const VARKEYWORDS: Self = Self(0x08);
    /// The code is a nested function.
    pub const NESTED: Self = Self(0x10);
    /// Calling the function creates a generator.
    pub const GENERATOR: Self = Self(0x20);
    /// The code has no free or cell variables.
    pub const NOFREE: Self = Self(0x40);

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// A compiled unit of code: its instructions and the tables their
/// arguments index into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeObject {
    /// The function, class, or module name.
    pub name: Symbol,
    /// The file this code was compiled from.
    #[serde(default)]
    pub filename: Symbol,
    /// The first source line.
    #[serde(default)]
    pub first_line: u32,
    /// The number of positional parameters.
    #[serde(default)]
    pub arg_count: u32,
    /// The number of keyword-only parameters.
    #[serde(default)]
    pub kwonly_arg_count: u32,
    /// Code flags.
    #[serde(default)]
    pub flags: CodeFlags,
    /// Local variable names, starting with the parameters.
    #[serde(default)]
    pub varnames: Vec<Symbol>,
    /// Names of locals captured by nested functions.
    #[serde(default)]
    pub cellvars: Vec<Symbol>,
    /// Names of variables captured from enclosing scopes.
    #[serde(default)]
    pub freevars: Vec<Symbol>,
    /// Global, attribute and imported names.
    #[serde(default)]
    pub names: Vec<Symbol>,
    /// Constants.
    #[serde(default)]
    pub constants: Vec<Constant>,
    /// The instructions.
    pub body: CodeBody,
}

impl CodeObject {
    /// Returns the source line of the instruction at `offset`.
    #[must_use]
    pub fn line_for(&self, offset: usize) -> Option<u32> {
        match &self.body {
            CodeBody::Instructions(instructions) => {
                instructions.get(..=offset)?.iter().rev().find_map(|i| i.line)
            }
            CodeBody::Wordcode { lines, .. } => lines
                .iter()
                .take_while(|(start, _)| usize::try_from(*start).map_or(false, |s| s <= offset))
                .last()
                .map(|(_, line)| *line)
                .or((self.first_line > 0).then_some(self.first_line)),
        }
    }

    /// Returns the number of offset units in the instruction stream.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.body {
            CodeBody::Instructions(instructions) => instructions.len(),
            CodeBody::Wordcode { bytes, .. } => bytes.len(),
        }
    }

    /// Returns true if this code has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the name of the `*args` parameter, if any.
    #[must_use]
    pub fn varargs_name(&self) -> Option<&Symbol> {
        self.flags
            .contains(CodeFlags::VARARGS)
            .then(|| self.varnames.get(self.parameter_count()))
            .flatten()
    }

    /// Returns the name of the `**kwargs` parameter, if any.
    #[must_use]
    pub fn varkeywords_name(&self) -> Option<&Symbol> {
        let index = self.parameter_count() + usize::from(self.flags.contains(CodeFlags::VARARGS));
        self.flags
            .contains(CodeFlags::VARKEYWORDS)
            .then(|| self.varnames.get(index))
            .flatten()
    }

    /// Returns the number of named positional and keyword-only parameters.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        (self.arg_count + self.kwonly_arg_count) as usize
    }

    /// Returns the cell or free variable name at `index`, which counts the
    /// cell variables first.
    #[must_use]
    pub fn cell_name(&self, index: usize) -> Option<&Symbol> {
        self.cellvars
            .get(index)
            .or_else(|| self.freevars.get(index.checked_sub(self.cellvars.len())?))
    }
}

/// The instruction stream of a [`CodeObject`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CodeBody {
    /// Decoded instructions. Offsets are instruction indices.
    Instructions(Vec<RawInstruction>),
    /// CPython 3.6 wordcode. Offsets are byte offsets.
    Wordcode {
        /// Two bytes per unit: opcode, argument.
        bytes: Vec<u8>,
        /// `(byte offset, line)` pairs in ascending offset order.
        #[serde(default)]
        lines: Vec<(u32, u32)>,
    },
}

/// An instruction whose argument has not been resolved against the code
/// object's tables.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct RawInstruction {
    /// The operation.
    pub opcode: Opcode,
    /// The full-width argument.
    #[serde(default)]
    pub arg: u32,
    /// The source line this instruction begins.
    #[serde(default)]
    pub line: Option<u32>,
}

/// A constant referenced by `LOAD_CONST`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constant {
    /// `None`
    None,
    /// A bool.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    Str(Symbol),
    /// A tuple of constants.
    Tuple(Vec<Constant>),
    /// A nested code object.
    Code(Code),
}

impl Constant {
    /// Returns this constant as a [`Value`].
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Constant::None => Value::None,
            Constant::Bool(value) => Value::Bool(*value),
            Constant::Int(value) => Value::Int(*value),
            Constant::Float(value) => Value::Float(*value),
            Constant::Str(value) => Value::Str(value.clone()),
            Constant::Tuple(values) => Value::tuple(values.iter().map(Constant::to_value).collect()),
            Constant::Code(code) => Value::dynamic(code.clone()),
        }
    }
}

impl_from!(Constant, bool, Bool);
impl_from!(Constant, i64, Int);
impl_from!(Constant, i32, Int);
impl_from!(Constant, f64, Float);
impl_from!(Constant, &'_ str, Str);
impl_from!(Constant, Symbol, Str);
impl_from!(Constant, Code, Code);
impl_from!(Constant, CodeObject, Code);

/// A shared, immutable [`CodeObject`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Code {
    data: Arc<CodeObject>,
}

impl Code {
    /// Returns true if both handles refer to the same code object.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl From<CodeObject> for Code {
    fn from(value: CodeObject) -> Self {
        Self {
            data: Arc::new(value),
        }
    }
}

impl Deref for Code {
    type Target = CodeObject;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<code {}>", self.data.name)
    }
}

impl Default for Code {
    fn default() -> Self {
        static EMPTY: OnceLock<Code> = OnceLock::new();
        EMPTY
            .get_or_init(|| {
                Code::from(CodeObject {
                    name: Symbol::from("<empty>"),
                    filename: Symbol::empty(),
                    first_line: 0,
                    arg_count: 0,
                    kwonly_arg_count: 0,
                    flags: CodeFlags::default(),
                    varnames: Vec::new(),
                    cellvars: Vec::new(),
                    freevars: Vec::new(),
                    names: Vec::new(),
                    constants: vec![Constant::None],
                    body: CodeBody::Instructions(vec![
                        RawInstruction {
                            opcode: Opcode::LoadConst,
                            arg: 0,
                            line: None,
                        },
                        RawInstruction {
                            opcode: Opcode::ReturnValue,
                            arg: 0,
                            line: None,
                        },
                    ]),
                })
            })
            .clone()
    }
}

impl CustomType for Code {
    fn type_name(&self) -> Symbol {
        Symbol::from("code")
    }

    fn repr(&self, this: &AnyDynamic) -> String {
        format!(
            "<code object {} at {:#x}, file \"{}\", line {}>",
            self.name,
            this.address(),
            self.filename,
            self.first_line
        )
    }

    fn equals(&self, other: &Value) -> bool {
        other.downcast_ref::<Code>().is_some_and(|other| self.ptr_eq(other))
    }
}
