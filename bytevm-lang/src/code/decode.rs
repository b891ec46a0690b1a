//! Turning a code object's instruction stream into logical instructions.

use std::fmt::{Debug, Display};

use super::opcode::{CompareOp, Opcode, OperandKind, EXTENDED_ARG};
use super::{CodeBody, CodeObject};
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;
use crate::vm::Fault;

/// An instruction argument resolved against its code object's tables.
#[derive(Debug, Clone)]
pub enum Operand {
    /// The instruction takes no argument.
    None,
    /// A constant.
    Const(Value),
    /// A global, attribute, or import name.
    Name(Symbol),
    /// A local variable name.
    Local(Symbol),
    /// A cell or free variable name.
    Free(Symbol),
    /// An absolute jump target.
    Jump(usize),
    /// A comparison operator.
    Compare(CompareOp),
    /// A raw integer.
    Raw(u32),
}

impl Operand {
    /// Returns the name referenced by this operand.
    pub fn name(&self) -> Result<&Symbol, Fault> {
        match self {
            Operand::Name(name) | Operand::Local(name) | Operand::Free(name) => Ok(name),
            _ => Err(Fault::InvalidOperand),
        }
    }

    /// Returns the jump target of this operand.
    pub fn jump(&self) -> Result<usize, Fault> {
        match self {
            Operand::Jump(target) => Ok(*target),
            _ => Err(Fault::InvalidOperand),
        }
    }

    /// Returns the raw integer of this operand.
    pub fn raw(&self) -> Result<usize, Fault> {
        match self {
            Operand::Raw(value) => usize::try_from(*value).map_err(|_| Fault::InvalidOperand),
            _ => Err(Fault::InvalidOperand),
        }
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Const(value) => f.write_str(&value.repr()),
            Operand::Name(name) | Operand::Local(name) | Operand::Free(name) => {
                Display::fmt(name, f)
            }
            Operand::Jump(target) => write!(f, "to {target}"),
            Operand::Compare(op) => f.write_str(op.symbol()),
            Operand::Raw(value) => Display::fmt(value, f),
        }
    }
}

/// A decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// The operation.
    pub opcode: Opcode,
    /// The resolved argument.
    pub operand: Operand,
    /// The offset of this instruction, including any `EXTENDED_ARG`
    /// prefixes.
    pub offset: usize,
    /// The offset of the following instruction.
    pub next: usize,
}

/// Produces logical instructions from a code object.
pub trait Decoder: Send + Sync + Debug + 'static {
    /// Decodes the instruction at `offset`, folding any `EXTENDED_ARG`
    /// prefixes into it.
    fn decode(&self, code: &CodeObject, offset: usize) -> Result<Instruction, Fault>;
}

/// Decodes both the logical and CPython 3.6 wordcode forms of
/// [`CodeBody`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDecoder;

impl Decoder for StandardDecoder {
    fn decode(&self, code: &CodeObject, offset: usize) -> Result<Instruction, Fault> {
        let (opcode, arg, next) = match &code.body {
            CodeBody::Instructions(instructions) => {
                let mut index = offset;
                let mut arg = 0_u64;
                loop {
                    let instruction = instructions
                        .get(index)
                        .ok_or(Fault::InvalidInstructionAddress(offset))?;
                    index += 1;
                    arg = fold_argument(arg, u64::from(instruction.arg), 8)?;
                    if instruction.opcode != Opcode::ExtendedArg {
                        break (instruction.opcode, arg, index);
                    }
                }
            }
            CodeBody::Wordcode { bytes, .. } => {
                let mut index = offset;
                let mut arg = 0_u64;
                loop {
                    let [number, unit_arg] = bytes
                        .get(index..index + 2)
                        .and_then(|unit| <[u8; 2]>::try_from(unit).ok())
                        .ok_or(Fault::InvalidInstructionAddress(offset))?;
                    index += 2;
                    arg = fold_argument(arg, u64::from(unit_arg), 8)?;
                    if number != EXTENDED_ARG {
                        let opcode =
                            Opcode::from_number(number).ok_or(Fault::UnknownOpcode(number))?;
                        break (opcode, arg, index);
                    }
                }
            }
        };

        let arg = u32::try_from(arg).map_err(|_| Fault::InvalidOperand)?;
        let operand = resolve(code, opcode, arg, next)?;
        Ok(Instruction {
            opcode,
            operand,
            offset,
            next,
        })
    }
}

/// Shifts the argument accumulated from preceding `EXTENDED_ARG` units and
/// appends `unit`.
fn fold_argument(accumulated: u64, unit: u64, bits: u32) -> Result<u64, Fault> {
    let folded = (accumulated << bits) | unit;
    if folded > u64::from(u32::MAX) {
        Err(Fault::InvalidOperand)
    } else {
        Ok(folded)
    }
}

fn resolve(code: &CodeObject, opcode: Opcode, arg: u32, next: usize) -> Result<Operand, Fault> {
    let index = arg as usize;
    Ok(match opcode.operand_kind() {
        OperandKind::None => Operand::None,
        OperandKind::Const => Operand::Const(
            code.constants
                .get(index)
                .ok_or(Fault::InvalidOperand)?
                .to_value(),
        ),
        OperandKind::Name => Operand::Name(
            code.names
                .get(index)
                .cloned()
                .ok_or(Fault::InvalidOperand)?,
        ),
        OperandKind::Local => Operand::Local(
            code.varnames
                .get(index)
                .cloned()
                .ok_or(Fault::InvalidOperand)?,
        ),
        OperandKind::Free => Operand::Free(
            code.cell_name(index)
                .cloned()
                .ok_or(Fault::InvalidOperand)?,
        ),
        OperandKind::RelativeJump => Operand::Jump(next + index),
        OperandKind::AbsoluteJump => Operand::Jump(index),
        OperandKind::Compare => {
            Operand::Compare(CompareOp::from_arg(arg).ok_or(Fault::InvalidOperand)?)
        }
        OperandKind::Raw => Operand::Raw(arg),
    })
}
