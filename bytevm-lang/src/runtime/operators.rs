//! Unary, binary and comparison operators.

use std::cmp::Ordering;

use crate::code::opcode::{BinaryOperator, CompareOp, UnaryOperator};
use crate::runtime::exception::ErrorKind;
use crate::runtime::list::Tuple;
use crate::runtime::string;
use crate::runtime::types::{call_special, defines_special, Class};
use crate::runtime::value::{Number, Value};
use crate::vm::{Fault, Vm};

impl UnaryOperator {
    const fn dunder(self) -> &'static str {
        match self {
            UnaryOperator::Positive => "__pos__",
            UnaryOperator::Negative => "__neg__",
            UnaryOperator::Not => "__bool__",
            UnaryOperator::Invert => "__invert__",
        }
    }

    /// Applies this operator to `value`.
    pub fn apply(self, vm: &mut Vm, value: &Value) -> Result<Value, Fault> {
        let result = match (self, value.number()) {
            (UnaryOperator::Not, _) => return Ok(Value::Bool(!value.truthy(vm)?)),
            (UnaryOperator::Positive, Some(Number::Int(value))) => Some(Value::Int(value)),
            (UnaryOperator::Positive, Some(Number::Float(value))) => Some(Value::Float(value)),
            (UnaryOperator::Negative, Some(Number::Int(value))) => {
                Some(Value::Int(value.checked_neg().ok_or_else(Fault::overflow)?))
            }
            (UnaryOperator::Negative, Some(Number::Float(value))) => Some(Value::Float(-value)),
            (UnaryOperator::Invert, Some(Number::Int(value))) => Some(Value::Int(!value)),
            _ => call_special(vm, value, self.dunder(), Vec::new())?,
        };
        result.ok_or_else(|| {
            Fault::type_error(format!(
                "bad operand type for {}: '{}'",
                self.symbol(),
                value.type_name()
            ))
        })
    }
}

impl BinaryOperator {
    /// Applies this operator to `lhs` and `rhs`.
    pub fn apply(self, vm: &mut Vm, lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
        self.evaluate(vm, lhs, rhs, true)
    }

    /// Applies the augmented assignment form of this operator, which may
    /// modify `lhs` in place.
    pub fn apply_inplace(self, vm: &mut Vm, lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
        if let Value::Dynamic(dynamic) = lhs {
            if let Some(result) = dynamic.inplace_op(vm, self, rhs)? {
                return Ok(result);
            }
            return self.evaluate(vm, lhs, rhs, false);
        }
        self.evaluate(vm, lhs, rhs, true)
    }

    fn evaluate(
        self,
        vm: &mut Vm,
        lhs: &Value,
        rhs: &Value,
        try_lhs: bool,
    ) -> Result<Value, Fault> {
        if self == BinaryOperator::Subscr {
            return lhs.get_item(vm, rhs);
        }
        if let (Some(left), Some(right)) = (lhs.number(), rhs.number()) {
            if let Some(result) = self.numeric(left, right)? {
                return Ok(match (lhs, rhs, result) {
                    (Value::Bool(_), Value::Bool(_), Value::Int(bits))
                        if matches!(
                            self,
                            BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Xor
                        ) =>
                    {
                        Value::Bool(bits != 0)
                    }
                    (_, _, result) => result,
                });
            }
        }
        if let Some(result) = self.string(lhs, rhs)? {
            return Ok(result);
        }
        if try_lhs {
            if let Value::Dynamic(dynamic) = lhs {
                if let Some(result) = dynamic.binary_op(vm, self, rhs)? {
                    return Ok(result);
                }
            }
        }
        if let Some(result) = self.reflected(vm, lhs, rhs)? {
            return Ok(result);
        }
        if self == BinaryOperator::Add && lhs.as_str().is_some() {
            return Err(Fault::type_error(format!(
                "must be str, not {}",
                rhs.type_name()
            )));
        }
        Err(Fault::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            self.symbol(),
            lhs.type_name(),
            rhs.type_name()
        )))
    }

    fn reflected(self, vm: &mut Vm, lhs: &Value, rhs: &Value) -> Result<Option<Value>, Fault> {
        let name = format!("__r{}", &self.dunder()[2..]);
        if let Some(result) = call_special(vm, rhs, &name, vec![lhs.clone()])? {
            return Ok(Some(result));
        }
        match (self, lhs, rhs) {
            (BinaryOperator::Multiply, Value::Int(_) | Value::Bool(_), Value::Dynamic(sequence))
                if !defines_special(rhs, "__mul__") =>
            {
                sequence.binary_op(vm, self, lhs)
            }
            _ => Ok(None),
        }
    }

    fn string(self, lhs: &Value, rhs: &Value) -> Result<Option<Value>, Fault> {
        let repeat = |text: &str, count: &Value| {
            let count = repeat_count(text.len(), count.as_i64().unwrap_or_default())?;
            Ok::<_, Fault>(Value::from(text.repeat(count)))
        };
        Ok(match (self, lhs, rhs) {
            (BinaryOperator::Add, Value::Str(lhs), Value::Str(rhs)) => {
                Some(Value::from(format!("{lhs}{rhs}")))
            }
            (BinaryOperator::Multiply, Value::Str(text), count @ (Value::Int(_) | Value::Bool(_)))
            | (BinaryOperator::Multiply, count @ (Value::Int(_) | Value::Bool(_)), Value::Str(text)) => {
                Some(repeat(text, count)?)
            }
            (BinaryOperator::Modulo, Value::Str(template), args) => {
                Some(Value::from(string::percent_format(template, args)?))
            }
            _ => None,
        })
    }

    fn numeric(self, lhs: Number, rhs: Number) -> Result<Option<Value>, Fault> {
        match (lhs, rhs) {
            (Number::Int(lhs), Number::Int(rhs)) => self.integer(lhs, rhs),
            (lhs, rhs) => self.float(lhs.as_f64(), rhs.as_f64()),
        }
    }

    fn integer(self, lhs: i64, rhs: i64) -> Result<Option<Value>, Fault> {
        let checked = |result: Option<i64>| result.map(Value::Int).ok_or_else(Fault::overflow);
        let result = match self {
            BinaryOperator::Add => checked(lhs.checked_add(rhs))?,
            BinaryOperator::Subtract => checked(lhs.checked_sub(rhs))?,
            BinaryOperator::Multiply => checked(lhs.checked_mul(rhs))?,
            BinaryOperator::TrueDivide => {
                if rhs == 0 {
                    return Err(Fault::zero_division("division by zero"));
                }
                #[allow(clippy::cast_precision_loss)]
                let quotient = lhs as f64 / rhs as f64;
                Value::Float(quotient)
            }
            BinaryOperator::FloorDivide => {
                if rhs == 0 {
                    return Err(Fault::zero_division("integer division or modulo by zero"));
                }
                checked(floor_divide(lhs, rhs))?
            }
            BinaryOperator::Modulo => {
                if rhs == 0 {
                    return Err(Fault::zero_division("integer division or modulo by zero"));
                }
                checked(floor_modulo(lhs, rhs))?
            }
            BinaryOperator::Power => {
                if rhs < 0 {
                    if lhs == 0 {
                        return Err(Fault::zero_division(
                            "0.0 cannot be raised to a negative power",
                        ));
                    }
                    #[allow(clippy::cast_precision_loss)]
                    return Ok(Some(Value::Float((lhs as f64).powf(rhs as f64))));
                }
                let exponent = match (lhs, u32::try_from(rhs)) {
                    (_, Ok(exponent)) => exponent,
                    (0 | 1, Err(_)) => return Ok(Some(Value::Int(lhs))),
                    (-1, Err(_)) => {
                        return Ok(Some(Value::Int(if rhs % 2 == 0 { 1 } else { -1 })))
                    }
                    (_, Err(_)) => return Err(Fault::overflow()),
                };
                checked(lhs.checked_pow(exponent))?
            }
            BinaryOperator::LShift => {
                if rhs < 0 {
                    return Err(Fault::value_error("negative shift count"));
                }
                if lhs == 0 {
                    Value::Int(0)
                } else {
                    let shifted = u32::try_from(rhs)
                        .ok()
                        .filter(|shift| *shift < 64)
                        .map(|shift| lhs << shift)
                        .filter(|shifted| shifted >> rhs == lhs);
                    checked(shifted)?
                }
            }
            BinaryOperator::RShift => {
                if rhs < 0 {
                    return Err(Fault::value_error("negative shift count"));
                }
                Value::Int(if rhs >= 64 { lhs >> 63 } else { lhs >> rhs })
            }
            BinaryOperator::And => Value::Int(lhs & rhs),
            BinaryOperator::Or => Value::Int(lhs | rhs),
            BinaryOperator::Xor => Value::Int(lhs ^ rhs),
            BinaryOperator::MatrixMultiply | BinaryOperator::Subscr => return Ok(None),
        };
        Ok(Some(result))
    }

    fn float(self, lhs: f64, rhs: f64) -> Result<Option<Value>, Fault> {
        let result = match self {
            BinaryOperator::Add => lhs + rhs,
            BinaryOperator::Subtract => lhs - rhs,
            BinaryOperator::Multiply => lhs * rhs,
            BinaryOperator::TrueDivide => {
                if rhs == 0. {
                    return Err(Fault::zero_division("float division by zero"));
                }
                lhs / rhs
            }
            BinaryOperator::FloorDivide => {
                if rhs == 0. {
                    return Err(Fault::zero_division("float divmod()"));
                }
                (lhs / rhs).floor()
            }
            BinaryOperator::Modulo => {
                if rhs == 0. {
                    return Err(Fault::zero_division("float modulo"));
                }
                let remainder = lhs % rhs;
                if remainder != 0. && (remainder < 0.) != (rhs < 0.) {
                    remainder + rhs
                } else {
                    remainder
                }
            }
            BinaryOperator::Power => {
                if lhs == 0. && rhs < 0. {
                    return Err(Fault::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                if lhs < 0. && rhs.fract() != 0. {
                    return Err(Fault::value_error("math domain error"));
                }
                lhs.powf(rhs)
            }
            _ => return Ok(None),
        };
        Ok(Some(Value::Float(result)))
    }
}

/// The largest number of items or bytes a repetition may produce.
pub const MAX_REPEAT_LEN: usize = 1 << 28;

/// Returns how many copies of a `len`-long sequence `count` asks for. A
/// negative count produces no copies, and a result longer than
/// [`MAX_REPEAT_LEN`] raises `MemoryError`.
pub fn repeat_count(len: usize, count: i64) -> Result<usize, Fault> {
    let count = usize::try_from(count).unwrap_or(0);
    match len.checked_mul(count) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(count),
        _ => Err(Fault::error(
            ErrorKind::MemoryError,
            "repeated sequence is too long",
        )),
    }
}

fn floor_divide(lhs: i64, rhs: i64) -> Option<i64> {
    let quotient = lhs.checked_div(rhs)?;
    if lhs % rhs != 0 && (lhs < 0) != (rhs < 0) {
        quotient.checked_sub(1)
    } else {
        Some(quotient)
    }
}

fn floor_modulo(lhs: i64, rhs: i64) -> Option<i64> {
    let remainder = lhs.checked_rem(rhs)?;
    if remainder != 0 && (remainder < 0) != (rhs < 0) {
        remainder.checked_add(rhs)
    } else {
        Some(remainder)
    }
}

impl CompareOp {
    const fn dunders(self) -> Option<(&'static str, &'static str)> {
        match self {
            CompareOp::Less => Some(("__lt__", "__gt__")),
            CompareOp::LessEqual => Some(("__le__", "__ge__")),
            CompareOp::Equal => Some(("__eq__", "__eq__")),
            CompareOp::NotEqual => Some(("__ne__", "__ne__")),
            CompareOp::Greater => Some(("__gt__", "__lt__")),
            CompareOp::GreaterEqual => Some(("__ge__", "__le__")),
            _ => None,
        }
    }

    /// Compares `lhs` to `rhs`.
    pub fn apply(self, vm: &mut Vm, lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
        match self {
            CompareOp::Is => Ok(Value::Bool(lhs.identical(rhs))),
            CompareOp::IsNot => Ok(Value::Bool(!lhs.identical(rhs))),
            CompareOp::In => Ok(Value::Bool(rhs.contains(vm, lhs)?)),
            CompareOp::NotIn => Ok(Value::Bool(!rhs.contains(vm, lhs)?)),
            CompareOp::ExceptionMatch => exception_match(lhs, rhs).map(Value::Bool),
            _ => self.rich_compare(vm, lhs, rhs),
        }
    }

    fn rich_compare(self, vm: &mut Vm, lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
        if let Some((forward, reflected)) = self.dunders() {
            if let Some(result) = call_special(vm, lhs, forward, vec![rhs.clone()])? {
                return Ok(result);
            }
            if let Some(result) = call_special(vm, rhs, reflected, vec![lhs.clone()])? {
                return Ok(result);
            }
        }
        let result = match self {
            CompareOp::Equal => equals(vm, lhs, rhs)?,
            CompareOp::NotEqual => !equals(vm, lhs, rhs)?,
            _ => {
                let ordering = match (lhs.number(), rhs.number()) {
                    (Some(Number::Int(left)), Some(Number::Int(right))) => Some(left.cmp(&right)),
                    (Some(left), Some(right)) => {
                        match left.as_f64().partial_cmp(&right.as_f64()) {
                            Some(ordering) => Some(ordering),
                            // Comparisons involving NaN are always false.
                            None => return Ok(Value::Bool(false)),
                        }
                    }
                    _ => lhs.compare(rhs),
                };
                let ordering = ordering.ok_or_else(|| {
                    Fault::type_error(format!(
                        "'{}' not supported between instances of '{}' and '{}'",
                        self.symbol(),
                        lhs.type_name(),
                        rhs.type_name()
                    ))
                })?;
                match self {
                    CompareOp::Less => ordering == Ordering::Less,
                    CompareOp::LessEqual => ordering != Ordering::Greater,
                    CompareOp::Greater => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }
            }
        };
        Ok(Value::Bool(result))
    }
}

/// Returns true if `lhs == rhs`, honoring `__eq__` defined by classes.
pub(crate) fn equals(vm: &mut Vm, lhs: &Value, rhs: &Value) -> Result<bool, Fault> {
    if lhs.identical(rhs) {
        return Ok(true);
    }
    if let Some(result) = call_special(vm, lhs, "__eq__", vec![rhs.clone()])? {
        return result.truthy(vm);
    }
    if let Some(result) = call_special(vm, rhs, "__eq__", vec![lhs.clone()])? {
        return result.truthy(vm);
    }
    Ok(lhs.equals(rhs))
}

/// Returns true if `lhs < rhs`.
pub(crate) fn less_than(vm: &mut Vm, lhs: &Value, rhs: &Value) -> Result<bool, Fault> {
    CompareOp::Less.apply(vm, lhs, rhs)?.truthy(vm)
}

/// Returns true if the exception class `kind` matches `handler`, a class or
/// tuple of classes named by an `except` clause.
fn exception_match(kind: &Value, handler: &Value) -> Result<bool, Fault> {
    let handlers = match handler.downcast_ref::<Tuple>() {
        Some(handlers) => handlers.as_slice().to_vec(),
        None => vec![handler.clone()],
    };
    let kind = kind.as_type::<Class>();
    let mut matched = false;
    for handler in handlers {
        let handler = handler
            .as_type::<Class>()
            .filter(|handler| handler.is_exception())
            .ok_or_else(|| {
                Fault::type_error(
                    "catching classes that do not inherit from BaseException is not allowed",
                )
            })?;
        matched |= kind
            .as_ref()
            .is_some_and(|kind| Class::is_subclass(kind, &handler));
    }
    if matched {
        trace!("exception matched handler");
    }
    Ok(matched)
}
