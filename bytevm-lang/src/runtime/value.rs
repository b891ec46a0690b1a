//! The dynamically typed [`Value`] and the [`CustomType`] trait that backs
//! every heap-allocated value.

use std::any::Any;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::code::opcode::BinaryOperator;
use crate::runtime::iter::SequenceIter;
use crate::runtime::list::{List, Tuple};
use crate::runtime::string;
use crate::runtime::symbol::Symbol;
use crate::vm::call::Arguments;
use crate::vm::{Fault, Vm};

/// The hasher used for dictionary and set keys.
pub type ValueHasher = ahash::AHasher;

/// A value manipulated by interpreted code.
#[derive(Default, Clone)]
pub enum Value {
    /// `None`.
    #[default]
    None,
    /// `True` or `False`.
    Bool(bool),
    /// A 64-bit signed integer. Arithmetic that leaves this range raises
    /// `OverflowError`.
    Int(i64),
    /// A double precision float.
    Float(f64),
    /// An immutable string.
    Str(Symbol),
    /// Any other value.
    Dynamic(AnyDynamic),
}

impl Value {
    /// Returns a new value containing `value`.
    pub fn dynamic<T>(value: T) -> Self
    where
        T: CustomType,
    {
        Self::Dynamic(AnyDynamic::new(value))
    }

    /// Returns a value sharing ownership of `value`.
    #[must_use]
    pub fn shared<T>(value: Arc<T>) -> Self
    where
        T: CustomType,
    {
        Self::Dynamic(AnyDynamic::from_arc(value))
    }

    /// Returns a new `tuple` value.
    #[must_use]
    pub fn tuple(values: Vec<Value>) -> Self {
        Self::dynamic(Tuple::from(values))
    }

    /// Returns a new `list` value.
    #[must_use]
    pub fn list(values: Vec<Value>) -> Self {
        Self::dynamic(List::from(values))
    }

    /// Returns true if this value is `None`.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns this value as an `i64`, if it is an integer or bool.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    /// Returns this value as a `usize`, if it is a non-negative integer.
    #[must_use]
    pub fn as_usize(&self) -> Option<usize> {
        self.as_i64().and_then(|value| usize::try_from(value).ok())
    }

    /// Returns this value as an `f64`, if it is numeric.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Value::Int(value) => Some(*value as f64),
            Value::Bool(value) => Some(f64::from(u8::from(*value))),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns this value as a string slice, if it is a `str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the symbol contained in this value, if it is a `str`.
    #[must_use]
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the dynamic value, if this is not a primitive.
    #[must_use]
    pub fn as_any_dynamic(&self) -> Option<&AnyDynamic> {
        match self {
            Value::Dynamic(value) => Some(value),
            _ => None,
        }
    }

    /// Returns a reference to the contained `T`, if this value contains one.
    #[must_use]
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: CustomType,
    {
        self.as_any_dynamic()?.downcast_ref()
    }

    /// Returns a typed handle to the contained `T`, if this value contains
    /// one.
    #[must_use]
    pub fn as_type<T>(&self) -> Option<Dynamic<T>>
    where
        T: CustomType,
    {
        self.as_any_dynamic()?.as_type()
    }

    /// Returns true if this value contains a `T`.
    #[must_use]
    pub fn is<T>(&self) -> bool
    where
        T: CustomType,
    {
        self.downcast_ref::<T>().is_some()
    }

    /// Returns the Python type name of this value.
    #[must_use]
    pub fn type_name(&self) -> Symbol {
        match self {
            Value::None => Symbol::from("NoneType"),
            Value::Bool(_) => Symbol::from("bool"),
            Value::Int(_) => Symbol::from("int"),
            Value::Float(_) => Symbol::from("float"),
            Value::Str(_) => Symbol::from("str"),
            Value::Dynamic(value) => value.type_name(),
        }
    }

    /// Returns the `repr()` of this value.
    #[must_use]
    pub fn repr(&self) -> String {
        match self {
            Value::None => String::from("None"),
            Value::Bool(true) => String::from("True"),
            Value::Bool(false) => String::from("False"),
            Value::Int(value) => value.to_string(),
            Value::Float(value) => float_repr(*value),
            Value::Str(value) => string::repr(value),
            Value::Dynamic(value) => value.repr(),
        }
    }

    /// Returns the truthiness of this value.
    pub fn truthy(&self, vm: &mut Vm) -> Result<bool, Fault> {
        match self {
            Value::None => Ok(false),
            Value::Bool(value) => Ok(*value),
            Value::Int(value) => Ok(*value != 0),
            Value::Float(value) => Ok(*value != 0.),
            Value::Str(value) => Ok(!value.is_empty()),
            Value::Dynamic(value) => value.truthy(vm),
        }
    }

    /// Returns true if `self == other`.
    #[must_use]
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(lhs), Value::Str(rhs)) => lhs == rhs,
            (Value::Dynamic(lhs), Value::Dynamic(rhs)) => lhs.ptr_eq(rhs) || lhs.equals(other),
            (Value::Dynamic(lhs), _) => lhs.equals(other),
            (_, Value::Dynamic(rhs)) => rhs.equals(self),
            _ => match (self.number(), other.number()) {
                (Some(Number::Int(lhs)), Some(Number::Int(rhs))) => lhs == rhs,
                (Some(lhs), Some(rhs)) => lhs.as_f64() == rhs.as_f64(),
                _ => false,
            },
        }
    }

    /// Returns true if `self is other`.
    #[must_use]
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(lhs), Value::Bool(rhs)) => lhs == rhs,
            (Value::Int(lhs), Value::Int(rhs)) => lhs == rhs,
            (Value::Float(lhs), Value::Float(rhs)) => lhs.to_bits() == rhs.to_bits(),
            (Value::Str(lhs), Value::Str(rhs)) => lhs.ptr_eq(rhs) || lhs == rhs,
            (Value::Dynamic(lhs), Value::Dynamic(rhs)) => lhs.ptr_eq(rhs),
            _ => false,
        }
    }

    /// Returns the ordering of `self` relative to `other`, if the two values
    /// can be ordered.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(lhs), Value::Str(rhs)) => Some(lhs.cmp(rhs)),
            (Value::Dynamic(lhs), _) => lhs.compare(other),
            _ => match (self.number()?, other.number()?) {
                (Number::Int(lhs), Number::Int(rhs)) => Some(lhs.cmp(&rhs)),
                (lhs, rhs) => lhs.as_f64().partial_cmp(&rhs.as_f64()),
            },
        }
    }

    /// Returns the hash of this value, or a `TypeError` if this value is
    /// unhashable.
    pub fn hash(&self) -> Result<u64, Fault> {
        let mut hasher = ValueHasher::default();
        self.hash_into(&mut hasher)?;
        Ok(hasher.finish())
    }

    /// Feeds this value into `hasher`.
    pub fn hash_into(&self, hasher: &mut ValueHasher) -> Result<(), Fault> {
        match self {
            Value::None => 0_u8.hash(hasher),
            Value::Bool(value) => i64::from(*value).hash(hasher),
            Value::Int(value) => value.hash(hasher),
            #[allow(clippy::cast_possible_truncation)]
            Value::Float(value) => {
                if value.fract() == 0. && value.abs() < 9.0e18 {
                    (*value as i64).hash(hasher);
                } else {
                    value.to_bits().hash(hasher);
                }
            }
            Value::Str(value) => value.hash(hasher),
            Value::Dynamic(value) => value.hash(hasher)?,
        }
        Ok(())
    }

    /// Invokes this value with `args`.
    pub fn call(&self, vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
        match self {
            Value::Dynamic(value) => value.call(vm, args),
            _ => Err(Fault::type_error(format!(
                "'{}' object is not callable",
                self.type_name()
            ))),
        }
    }

    /// Returns the attribute `name` of this value.
    pub fn get_attr(&self, vm: &mut Vm, name: &Symbol) -> Result<Value, Fault> {
        match self {
            Value::Str(value) => string::bind_method(value, name)
                .ok_or_else(|| Fault::no_attribute(&self.type_name(), name)),
            Value::Dynamic(value) => value.get_attr(vm, name),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }

    /// Assigns `value` to the attribute `name` of this value.
    pub fn set_attr(&self, vm: &mut Vm, name: Symbol, value: Value) -> Result<(), Fault> {
        match self {
            Value::Dynamic(this) => this.set_attr(vm, name, value),
            _ => Err(Fault::no_attribute(&self.type_name(), &name)),
        }
    }

    /// Removes the attribute `name` from this value.
    pub fn del_attr(&self, vm: &mut Vm, name: &Symbol) -> Result<(), Fault> {
        match self {
            Value::Dynamic(this) => this.del_attr(vm, name),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }

    /// Returns `self[key]`.
    pub fn get_item(&self, vm: &mut Vm, key: &Value) -> Result<Value, Fault> {
        match self {
            Value::Str(value) => string::get_item(value, key),
            Value::Dynamic(value) => value.get_item(vm, key),
            _ => Err(Fault::type_error(format!(
                "'{}' object is not subscriptable",
                self.type_name()
            ))),
        }
    }

    /// Performs `self[key] = value`.
    pub fn set_item(&self, vm: &mut Vm, key: Value, value: Value) -> Result<(), Fault> {
        match self {
            Value::Dynamic(this) => this.set_item(vm, key, value),
            _ => Err(Fault::type_error(format!(
                "'{}' object does not support item assignment",
                self.type_name()
            ))),
        }
    }

    /// Performs `del self[key]`.
    pub fn del_item(&self, vm: &mut Vm, key: &Value) -> Result<(), Fault> {
        match self {
            Value::Dynamic(this) => this.del_item(vm, key),
            _ => Err(Fault::type_error(format!(
                "'{}' object does not support item deletion",
                self.type_name()
            ))),
        }
    }

    /// Returns an iterator over this value, as `iter()` would.
    pub fn iterate(&self, vm: &mut Vm) -> Result<Value, Fault> {
        match self {
            Value::Str(value) => Ok(Value::dynamic(SequenceIter::new(string::characters(
                value,
            )))),
            Value::Dynamic(value) => value.iterate(vm),
            _ => Err(Fault::type_error(format!(
                "'{}' object is not iterable",
                self.type_name()
            ))),
        }
    }

    /// Advances this iterator. Returns `None` once the iterator is
    /// exhausted.
    pub fn next(&self, vm: &mut Vm) -> Result<Option<Value>, Fault> {
        match self {
            Value::Dynamic(value) => value.next(vm),
            _ => Err(Fault::type_error(format!(
                "'{}' object is not an iterator",
                self.type_name()
            ))),
        }
    }

    /// Iterates this value to exhaustion, returning every item.
    pub fn collect(&self, vm: &mut Vm) -> Result<Vec<Value>, Fault> {
        match self {
            Value::Str(value) => Ok(string::characters(value)),
            Value::Dynamic(value) => {
                if let Some(items) = value.snapshot() {
                    return Ok(items);
                }
                let iterator = value.iterate(vm)?;
                let mut items = Vec::new();
                while let Some(item) = iterator.next(vm)? {
                    items.push(item);
                }
                Ok(items)
            }
            _ => Err(Fault::type_error(format!(
                "'{}' object is not iterable",
                self.type_name()
            ))),
        }
    }

    /// Returns true if `item in self`.
    pub fn contains(&self, vm: &mut Vm, item: &Value) -> Result<bool, Fault> {
        match self {
            Value::Str(haystack) => match item {
                Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
                other => Err(Fault::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::Dynamic(value) => value.contains(vm, item),
            _ => Err(Fault::type_error(format!(
                "argument of type '{}' is not iterable",
                self.type_name()
            ))),
        }
    }

    /// Returns the length of this value.
    pub fn len(&self, vm: &mut Vm) -> Result<usize, Fault> {
        match self {
            Value::Str(value) => Ok(value.chars().count()),
            Value::Dynamic(value) => value.len(vm),
            _ => Err(Fault::type_error(format!(
                "object of type '{}' has no len()",
                self.type_name()
            ))),
        }
    }

    pub(crate) fn number(&self) -> Option<Number> {
        match self {
            Value::Bool(value) => Some(Number::Int(i64::from(*value))),
            Value::Int(value) => Some(Number::Int(*value)),
            Value::Float(value) => Some(Number::Float(*value)),
            _ => None,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Dynamic(value) => Debug::fmt(value, f),
            other => f.write_str(&other.repr()),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(value) => f.write_str(value),
            Value::Dynamic(value) => f.write_str(&value.display()),
            other => f.write_str(&other.repr()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl_from!(Value, bool, Bool);
impl_from!(Value, i64, Int);
impl_from!(Value, i32, Int);
impl_from!(Value, u32, Int);
impl_from!(Value, f64, Float);
impl_from!(Value, Symbol, Str);
impl_from!(Value, &'_ str, Str);
impl_from!(Value, String, Str);
impl_from!(Value, AnyDynamic, Dynamic);

impl TryFrom<usize> for Value {
    type Error = Fault;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        i64::try_from(value)
            .map(Value::Int)
            .map_err(|_| Fault::overflow())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Number::Int(value) => value as f64,
            Number::Float(value) => value,
        }
    }
}

fn float_repr(value: f64) -> String {
    if value.is_nan() {
        String::from("nan")
    } else if value.is_infinite() {
        String::from(if value > 0. { "inf" } else { "-inf" })
    } else if value != 0. && (value.abs() >= 1e16 || value.abs() < 1e-4) {
        let formatted = format!("{value:e}");
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(digits) => ('-', digits),
            None => ('+', exponent),
        };
        format!("{mantissa}e{sign}{digits:0>2}")
    } else if value.fract() == 0. {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

thread_local! {
    static REPR_GUARD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Invokes `repr` unless the container at `address` is already being
/// formatted further up this thread's stack, in which case `recursive` is
/// returned.
pub(crate) fn guard_repr(address: usize, recursive: &str, repr: impl FnOnce() -> String) -> String {
    let entered = REPR_GUARD.with_borrow_mut(|active| {
        if active.contains(&address) {
            false
        } else {
            active.push(address);
            true
        }
    });
    if !entered {
        return recursive.to_string();
    }
    let result = repr();
    REPR_GUARD.with_borrow_mut(|active| active.retain(|entry| *entry != address));
    result
}

/// A reference counted, type-erased [`CustomType`].
#[derive(Clone)]
pub struct AnyDynamic(Arc<dyn DynamicValue>);

impl AnyDynamic {
    /// Returns `value` as a type-erased dynamic value.
    pub fn new<T>(value: T) -> Self
    where
        T: CustomType,
    {
        Self(Arc::new(value))
    }

    /// Returns an already shared `value` as a type-erased dynamic value.
    pub fn from_arc<T>(value: Arc<T>) -> Self
    where
        T: CustomType,
    {
        Self(value)
    }

    /// Returns a typed handle to the contained value, if it is a `T`.
    #[must_use]
    pub fn as_type<T>(&self) -> Option<Dynamic<T>>
    where
        T: CustomType,
    {
        self.downcast_ref::<T>().map(|_| Dynamic {
            dynamic: self.clone(),
            _t: PhantomData,
        })
    }

    /// Returns a reference to the contained value, if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: CustomType,
    {
        self.0.as_any().downcast_ref()
    }

    /// Returns true if both values are the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }

    /// Returns the address of the underlying allocation, used as this
    /// value's identity.
    #[must_use]
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    /// Returns the Python type name of the contained value.
    #[must_use]
    pub fn type_name(&self) -> Symbol {
        self.0.type_name()
    }

    /// Returns the `repr()` of the contained value.
    #[must_use]
    pub fn repr(&self) -> String {
        self.0.repr(self)
    }

    /// Returns the `str()` of the contained value.
    #[must_use]
    pub fn display(&self) -> String {
        self.0.display(self)
    }

    /// Returns the truthiness of the contained value.
    pub fn truthy(&self, vm: &mut Vm) -> Result<bool, Fault> {
        self.0.truthy(vm, self)
    }

    /// Returns true if the contained value equals `other`.
    #[must_use]
    pub fn equals(&self, other: &Value) -> bool {
        self.0.equals(other)
    }

    /// Orders the contained value relative to `other`.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        self.0.compare(other)
    }

    /// Feeds the contained value into `hasher`.
    pub fn hash(&self, hasher: &mut ValueHasher) -> Result<(), Fault> {
        self.0.hash(self, hasher)
    }

    /// Returns the length of the contained value.
    pub fn len(&self, vm: &mut Vm) -> Result<usize, Fault> {
        self.0.len(vm, self)
    }

    /// Invokes the contained value.
    pub fn call(&self, vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
        self.0.call(vm, self, args)
    }

    /// Returns the attribute `name`.
    pub fn get_attr(&self, vm: &mut Vm, name: &Symbol) -> Result<Value, Fault> {
        self.0.get_attr(vm, self, name)
    }

    /// Assigns the attribute `name`.
    pub fn set_attr(&self, vm: &mut Vm, name: Symbol, value: Value) -> Result<(), Fault> {
        self.0.set_attr(vm, self, name, value)
    }

    /// Removes the attribute `name`.
    pub fn del_attr(&self, vm: &mut Vm, name: &Symbol) -> Result<(), Fault> {
        self.0.del_attr(vm, self, name)
    }

    /// Returns `self[key]`.
    pub fn get_item(&self, vm: &mut Vm, key: &Value) -> Result<Value, Fault> {
        self.0.get_item(vm, self, key)
    }

    /// Performs `self[key] = value`.
    pub fn set_item(&self, vm: &mut Vm, key: Value, value: Value) -> Result<(), Fault> {
        self.0.set_item(vm, self, key, value)
    }

    /// Performs `del self[key]`.
    pub fn del_item(&self, vm: &mut Vm, key: &Value) -> Result<(), Fault> {
        self.0.del_item(vm, self, key)
    }

    /// Returns an iterator over the contained value.
    pub fn iterate(&self, vm: &mut Vm) -> Result<Value, Fault> {
        self.0.iterate(vm, self)
    }

    /// Advances the contained iterator.
    pub fn next(&self, vm: &mut Vm) -> Result<Option<Value>, Fault> {
        self.0.next(vm, self)
    }

    /// Returns true if `item` is contained.
    pub fn contains(&self, vm: &mut Vm, item: &Value) -> Result<bool, Fault> {
        self.0.contains(vm, self, item)
    }

    /// Applies a binary operator with this value on the left.
    pub fn binary_op(
        &self,
        vm: &mut Vm,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        self.0.binary_op(vm, self, op, rhs)
    }

    /// Applies an in-place binary operator with this value on the left.
    pub fn inplace_op(
        &self,
        vm: &mut Vm,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        self.0.inplace_op(vm, self, op, rhs)
    }

    /// Returns a snapshot of the items of a finite collection.
    #[must_use]
    pub fn snapshot(&self) -> Option<Vec<Value>> {
        self.0.snapshot()
    }
}

impl Debug for AnyDynamic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr())
    }
}

/// A typed handle to a reference counted [`CustomType`].
pub struct Dynamic<T>
where
    T: CustomType,
{
    dynamic: AnyDynamic,
    _t: PhantomData<T>,
}

impl<T> Dynamic<T>
where
    T: CustomType,
{
    /// Moves `value` into a new reference counted allocation.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            dynamic: AnyDynamic::new(value),
            _t: PhantomData,
        }
    }

    /// Returns the type-erased handle.
    #[must_use]
    pub const fn as_any_dynamic(&self) -> &AnyDynamic {
        &self.dynamic
    }

    /// Returns this handle as a [`Value`].
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Dynamic(self.dynamic.clone())
    }

    /// Returns true if both handles point to the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.dynamic.ptr_eq(&other.dynamic)
    }
}

impl<T> Clone for Dynamic<T>
where
    T: CustomType,
{
    fn clone(&self) -> Self {
        Self {
            dynamic: self.dynamic.clone(),
            _t: PhantomData,
        }
    }
}

impl<T> Deref for Dynamic<T>
where
    T: CustomType,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.dynamic.downcast_ref().expect("type checked")
    }
}

impl<T> Debug for Dynamic<T>
where
    T: CustomType,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl<T> From<Dynamic<T>> for Value
where
    T: CustomType,
{
    fn from(value: Dynamic<T>) -> Self {
        Value::Dynamic(value.dynamic)
    }
}

/// A type that can be stored in a [`Value`].
///
/// Every method has a default that raises the same error CPython raises for
/// objects lacking the corresponding protocol.
#[allow(unused_variables)]
pub trait CustomType: Send + Sync + Debug + 'static {
    /// Returns the Python type name.
    fn type_name(&self) -> Symbol;

    /// Returns the `repr()` of this value.
    fn repr(&self, this: &AnyDynamic) -> String {
        format!("<{} object at {:#x}>", self.type_name(), this.address())
    }

    /// Returns the `str()` of this value.
    fn display(&self, this: &AnyDynamic) -> String {
        self.repr(this)
    }

    /// Returns the truthiness of this value.
    fn truthy(&self, vm: &mut Vm, this: &AnyDynamic) -> Result<bool, Fault> {
        Ok(true)
    }

    /// Returns true if this value equals `other`. Identity has already been
    /// checked.
    fn equals(&self, other: &Value) -> bool {
        false
    }

    /// Orders this value relative to `other`.
    fn compare(&self, other: &Value) -> Option<Ordering> {
        None
    }

    /// Feeds this value into `hasher`. Defaults to hashing by identity.
    fn hash(&self, this: &AnyDynamic, hasher: &mut ValueHasher) -> Result<(), Fault> {
        this.address().hash(hasher);
        Ok(())
    }

    /// Returns the number of items in this value.
    fn len(&self, vm: &mut Vm, this: &AnyDynamic) -> Result<usize, Fault> {
        Err(Fault::type_error(format!(
            "object of type '{}' has no len()",
            self.type_name()
        )))
    }

    /// Invokes this value.
    fn call(&self, vm: &mut Vm, this: &AnyDynamic, args: Arguments) -> Result<Value, Fault> {
        Err(Fault::type_error(format!(
            "'{}' object is not callable",
            self.type_name()
        )))
    }

    /// Returns the attribute `name`.
    fn get_attr(&self, vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        Err(Fault::no_attribute(&self.type_name(), name))
    }

    /// Assigns the attribute `name`.
    fn set_attr(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        name: Symbol,
        value: Value,
    ) -> Result<(), Fault> {
        Err(Fault::no_attribute(&self.type_name(), &name))
    }

    /// Removes the attribute `name`.
    fn del_attr(&self, vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<(), Fault> {
        Err(Fault::no_attribute(&self.type_name(), name))
    }

    /// Returns `self[key]`.
    fn get_item(&self, vm: &mut Vm, this: &AnyDynamic, key: &Value) -> Result<Value, Fault> {
        Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            self.type_name()
        )))
    }

    /// Performs `self[key] = value`.
    fn set_item(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        key: Value,
        value: Value,
    ) -> Result<(), Fault> {
        Err(Fault::type_error(format!(
            "'{}' object does not support item assignment",
            self.type_name()
        )))
    }

    /// Performs `del self[key]`.
    fn del_item(&self, vm: &mut Vm, this: &AnyDynamic, key: &Value) -> Result<(), Fault> {
        Err(Fault::type_error(format!(
            "'{}' object does not support item deletion",
            self.type_name()
        )))
    }

    /// Returns an iterator over this value.
    fn iterate(&self, vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Err(Fault::type_error(format!(
            "'{}' object is not iterable",
            self.type_name()
        )))
    }

    /// Advances this iterator, returning `None` when exhausted.
    fn next(&self, vm: &mut Vm, this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        Err(Fault::type_error(format!(
            "'{}' object is not an iterator",
            self.type_name()
        )))
    }

    /// Returns true if `item` is contained in this value.
    fn contains(&self, vm: &mut Vm, this: &AnyDynamic, item: &Value) -> Result<bool, Fault> {
        let iterator = self.iterate(vm, this).map_err(|_| {
            Fault::type_error(format!(
                "argument of type '{}' is not iterable",
                self.type_name()
            ))
        })?;
        while let Some(candidate) = iterator.next(vm)? {
            if candidate.equals(item) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Applies `op` with this value on the left. Returning `Ok(None)` raises
    /// the standard unsupported operand error.
    fn binary_op(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        Ok(None)
    }

    /// Applies the in-place form of `op`. Defaults to [`Self::binary_op`].
    fn inplace_op(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        self.binary_op(vm, this, op, rhs)
    }

    /// Returns every item of a finite collection without running the
    /// iterator protocol.
    fn snapshot(&self) -> Option<Vec<Value>> {
        None
    }
}

/// A [`CustomType`] that can be downcast.
pub trait DynamicValue: CustomType {
    /// Returns self as an [`Any`].
    fn as_any(&self) -> &dyn Any;
}

impl<T> DynamicValue for T
where
    T: CustomType,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}
