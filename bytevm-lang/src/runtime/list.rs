//! Types used for lists, tuples and slices.

use std::cmp::Ordering;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::code::opcode::BinaryOperator;
use crate::runtime::exception::ErrorKind;
use crate::runtime::iter::SequenceIter;
use crate::runtime::methods::MethodTable;
use crate::runtime::operators;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{guard_repr, AnyDynamic, CustomType, Dynamic, Value, ValueHasher};
use crate::vm::call::Arguments;
use crate::vm::{Fault, Vm};

/// A mutable list of [`Value`]s.
#[derive(Debug, Default)]
pub struct List(Mutex<Vec<Value>>);

impl List {
    /// Returns an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    /// Returns the value at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.lock().get(index).cloned()
    }

    /// Pushes `value` to the end of the list.
    pub fn push(&self, value: Value) {
        self.0.lock().push(value);
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns true if this list has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Converts this list into a Vec.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.lock().clone()
    }
}

impl From<Vec<Value>> for List {
    fn from(value: Vec<Value>) -> Self {
        Self(Mutex::new(value))
    }
}

impl FromIterator<Value> for List {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self::from(Vec::from_iter(iter))
    }
}

/// An immutable sequence of [`Value`]s.
#[derive(Debug, Default, Clone)]
pub struct Tuple(Vec<Value>);

impl Tuple {
    /// Returns the items of this tuple.
    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(value: Vec<Value>) -> Self {
        Self(value)
    }
}

/// The result of `BUILD_SLICE` or `slice()`.
#[derive(Debug, Clone)]
pub struct Slice {
    start: Value,
    stop: Value,
    step: Value,
}

impl Slice {
    /// Returns a slice from `start` to `stop` advancing by `step`. Any bound
    /// may be `None`.
    #[must_use]
    pub const fn new(start: Value, stop: Value, step: Value) -> Self {
        Self { start, stop, step }
    }

    /// Returns the indices this slice selects from a sequence of `len`
    /// items, in selection order.
    pub fn positions(&self, len: usize) -> Result<Vec<usize>, Fault> {
        let len = i64::try_from(len).map_err(|_| Fault::overflow())?;
        let step = match slice_bound(&self.step)? {
            None => 1,
            Some(0) => return Err(Fault::value_error("slice step cannot be zero")),
            Some(step) => step,
        };
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
        let clamp = |bound: Option<i64>, default: i64| match bound {
            None => default,
            Some(bound) if bound < 0 => (bound + len).max(lower),
            Some(bound) => bound.min(upper),
        };
        let start = clamp(
            slice_bound(&self.start)?,
            if step < 0 { upper } else { lower },
        );
        let stop = clamp(slice_bound(&self.stop)?, if step < 0 { lower } else { upper });

        let mut positions = Vec::new();
        let mut index = start;
        while (step > 0 && index < stop) || (step < 0 && index > stop) {
            positions.push(usize::try_from(index).map_err(|_| Fault::overflow())?);
            index += step;
        }
        Ok(positions)
    }

    /// Returns true if this slice selects a contiguous, forward range.
    fn is_contiguous(&self) -> Result<bool, Fault> {
        Ok(matches!(slice_bound(&self.step)?, None | Some(1)))
    }
}

fn slice_bound(bound: &Value) -> Result<Option<i64>, Fault> {
    match bound {
        Value::None => Ok(None),
        other => other.as_i64().map(Some).ok_or_else(|| {
            Fault::type_error("slice indices must be integers or None or have an __index__ method")
        }),
    }
}

impl CustomType for Slice {
    fn type_name(&self) -> Symbol {
        Symbol::from("slice")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        format!(
            "slice({}, {}, {})",
            self.start.repr(),
            self.stop.repr(),
            self.step.repr()
        )
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        match name.as_str() {
            "start" => Ok(self.start.clone()),
            "stop" => Ok(self.stop.clone()),
            "step" => Ok(self.step.clone()),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }
}

/// Resolves `index` against a sequence of `len` items, accepting negative
/// indices.
pub(crate) fn normalize_index(index: &Value, len: usize, kind: &str) -> Result<usize, Fault> {
    let Some(index) = index.as_i64() else {
        return Err(Fault::type_error(format!(
            "{kind} indices must be integers or slices, not {}",
            index.type_name()
        )));
    };
    let len = i64::try_from(len).map_err(|_| Fault::overflow())?;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).map_err(|_| Fault::overflow())
    } else {
        Err(Fault::index_error(format!("{kind} index out of range")))
    }
}

enum Selection {
    Item(Value),
    Slice(Vec<Value>),
}

/// Returns `items[key]` where `key` is an integer or a [`Slice`].
fn subscript(items: &[Value], key: &Value, kind: &str) -> Result<Selection, Fault> {
    if let Some(slice) = key.downcast_ref::<Slice>() {
        Ok(Selection::Slice(
            slice
                .positions(items.len())?
                .into_iter()
                .map(|index| items[index].clone())
                .collect(),
        ))
    } else {
        let index = normalize_index(key, items.len(), kind)?;
        Ok(Selection::Item(items[index].clone()))
    }
}

fn repeat(items: &[Value], count: &Value) -> Result<Option<Vec<Value>>, Fault> {
    let Some(count) = count.as_i64() else {
        return Ok(None);
    };
    let count = operators::repeat_count(items.len(), count)?;
    Ok(Some(
        std::iter::repeat(items)
            .take(count)
            .flatten()
            .cloned()
            .collect(),
    ))
}

fn sequence_repr(items: &[Value], open: &str, close: &str) -> String {
    let mut repr = String::from(open);
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            repr.push_str(", ");
        }
        repr.push_str(&item.repr());
    }
    repr.push_str(close);
    repr
}

fn sequence_equals(lhs: &[Value], rhs: &[Value]) -> bool {
    lhs.len() == rhs.len() && lhs.iter().zip(rhs).all(|(lhs, rhs)| lhs.equals(rhs))
}

fn sequence_compare(lhs: &[Value], rhs: &[Value]) -> Option<Ordering> {
    for (lhs, rhs) in lhs.iter().zip(rhs) {
        if !lhs.equals(rhs) {
            return lhs.compare(rhs);
        }
    }
    Some(lhs.len().cmp(&rhs.len()))
}

fn position_of(items: &[Value], needle: &Value) -> Option<usize> {
    items.iter().position(|item| item.equals(needle))
}

/// Sorts `items` using only the `<` operator, as `sorted()` does. The sort
/// is stable, including when `reverse` is set.
pub(crate) fn sort_values(
    vm: &mut Vm,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> Result<Vec<Value>, Fault> {
    let keys = match key {
        Some(key) if !key.is_none() => items
            .iter()
            .map(|item| key.call(vm, Arguments::new(vec![item.clone()])))
            .collect::<Result<Vec<_>, _>>()?,
        _ => items.clone(),
    };
    let mut order = (0..items.len()).collect::<Vec<_>>();
    let mut failure = None;
    order.sort_by(|&a, &b| {
        if failure.is_some() {
            return Ordering::Equal;
        }
        let (a, b) = if reverse { (b, a) } else { (a, b) };
        let ordering = operators::less_than(vm, &keys[a], &keys[b]).and_then(|less| {
            if less {
                Ok(Ordering::Less)
            } else if operators::less_than(vm, &keys[b], &keys[a])? {
                Ok(Ordering::Greater)
            } else {
                Ok(Ordering::Equal)
            }
        });
        ordering.unwrap_or_else(|err| {
            failure = Some(err);
            Ordering::Equal
        })
    });
    if let Some(err) = failure {
        return Err(err);
    }
    Ok(order.into_iter().map(|index| items[index].clone()).collect())
}

static LIST_METHODS: MethodTable<Dynamic<List>> = MethodTable::new(
    "list",
    &[
        ("append", |_vm, this, args| {
            let [value] = args.exactly("append")?;
            this.push(value);
            Ok(Value::None)
        }),
        ("extend", |vm, this, args| {
            let [iterable] = args.exactly("extend")?;
            let items = iterable.collect(vm)?;
            this.0.lock().extend(items);
            Ok(Value::None)
        }),
        ("pop", |_vm, this, args| {
            let args = args.between("pop", 0, 1)?;
            let mut items = this.0.lock();
            if items.is_empty() {
                return Err(Fault::index_error("pop from empty list"));
            }
            let index = match args.first() {
                Some(index) => normalize_index(index, items.len(), "pop")
                    .map_err(|_| Fault::index_error("pop index out of range"))?,
                None => items.len() - 1,
            };
            Ok(items.remove(index))
        }),
        ("insert", |_vm, this, args| {
            let [index, value] = args.exactly("insert")?;
            let index = index.as_i64().ok_or_else(|| {
                Fault::type_error(format!(
                    "'{}' object cannot be interpreted as an integer",
                    index.type_name()
                ))
            })?;
            let mut items = this.0.lock();
            let len = i64::try_from(items.len()).map_err(|_| Fault::overflow())?;
            let index = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(usize::try_from(index).map_err(|_| Fault::overflow())?, value);
            Ok(Value::None)
        }),
        ("remove", |_vm, this, args| {
            let [value] = args.exactly("remove")?;
            let mut items = this.0.lock();
            let index = position_of(&items, &value)
                .ok_or_else(|| Fault::value_error("list.remove(x): x not in list"))?;
            items.remove(index);
            Ok(Value::None)
        }),
        ("index", |_vm, this, args| {
            let [value] = args.exactly("index")?;
            let items = this.to_vec();
            let index = position_of(&items, &value)
                .ok_or_else(|| Fault::value_error(format!("{} is not in list", value.repr())))?;
            Value::try_from(index)
        }),
        ("count", |_vm, this, args| {
            let [value] = args.exactly("count")?;
            let count = this.to_vec().iter().filter(|item| item.equals(&value)).count();
            Value::try_from(count)
        }),
        ("clear", |_vm, this, args| {
            let [] = args.exactly("clear")?;
            this.0.lock().clear();
            Ok(Value::None)
        }),
        ("reverse", |_vm, this, args| {
            let [] = args.exactly("reverse")?;
            this.0.lock().reverse();
            Ok(Value::None)
        }),
        ("copy", |_vm, this, args| {
            let [] = args.exactly("copy")?;
            Ok(Value::list(this.to_vec()))
        }),
        ("sort", |vm, this, mut args| {
            let key = args.take_keyword("key");
            let reverse = match args.take_keyword("reverse") {
                Some(reverse) => reverse.truthy(vm)?,
                None => false,
            };
            if !args.positional.is_empty() {
                return Err(Fault::type_error("sort() takes no positional arguments"));
            }
            args.no_keywords("sort")?;
            let items = std::mem::take(&mut *this.0.lock());
            let sorted = sort_values(vm, items, key.as_ref(), reverse)?;
            *this.0.lock() = sorted;
            Ok(Value::None)
        }),
    ],
);

impl CustomType for List {
    fn type_name(&self) -> Symbol {
        Symbol::from("list")
    }

    fn repr(&self, this: &AnyDynamic) -> String {
        guard_repr(this.address(), "[...]", || {
            sequence_repr(&self.to_vec(), "[", "]")
        })
    }

    fn truthy(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<bool, Fault> {
        Ok(!self.is_empty())
    }

    fn equals(&self, other: &Value) -> bool {
        other
            .downcast_ref::<List>()
            .is_some_and(|other| sequence_equals(&self.to_vec(), &other.to_vec()))
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        sequence_compare(&self.to_vec(), &other.downcast_ref::<List>()?.to_vec())
    }

    fn hash(&self, _this: &AnyDynamic, _hasher: &mut ValueHasher) -> Result<(), Fault> {
        Err(Fault::type_error("unhashable type: 'list'"))
    }

    fn len(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<usize, Fault> {
        Ok(List::len(self))
    }

    fn get_attr(&self, _vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        this.as_type::<List>()
            .and_then(|this| LIST_METHODS.lookup(&this, name))
            .ok_or_else(|| Fault::no_attribute(&self.type_name(), name))
    }

    fn get_item(&self, _vm: &mut Vm, _this: &AnyDynamic, key: &Value) -> Result<Value, Fault> {
        match subscript(&self.0.lock(), key, "list")? {
            Selection::Item(item) => Ok(item),
            Selection::Slice(items) => Ok(Value::list(items)),
        }
    }

    fn set_item(
        &self,
        vm: &mut Vm,
        _this: &AnyDynamic,
        key: Value,
        value: Value,
    ) -> Result<(), Fault> {
        let Some(slice) = key.downcast_ref::<Slice>() else {
            let mut items = self.0.lock();
            let index = normalize_index(&key, items.len(), "list").map_err(|err| {
                if err.is_exception(ErrorKind::IndexError) {
                    Fault::index_error("list assignment index out of range")
                } else {
                    err
                }
            })?;
            items[index] = value;
            return Ok(());
        };
        let replacement = value.collect(vm)?;
        let mut items = self.0.lock();
        let positions = slice.positions(items.len())?;
        if slice.is_contiguous()? {
            let len = items.len();
            let start = match slice_bound(&slice.start)? {
                None => 0,
                Some(start) => {
                    let start = if start < 0 {
                        start + i64::try_from(len).map_err(|_| Fault::overflow())?
                    } else {
                        start
                    };
                    usize::try_from(start.max(0)).map_or(len, |start| start.min(len))
                }
            };
            let end = positions.last().map_or(start, |last| last + 1);
            items.splice(start..end, replacement);
        } else if positions.len() == replacement.len() {
            for (index, value) in positions.into_iter().zip(replacement) {
                items[index] = value;
            }
        } else {
            return Err(Fault::value_error(format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                replacement.len(),
                positions.len()
            )));
        }
        Ok(())
    }

    fn del_item(&self, _vm: &mut Vm, _this: &AnyDynamic, key: &Value) -> Result<(), Fault> {
        let mut items = self.0.lock();
        if let Some(slice) = key.downcast_ref::<Slice>() {
            let mut positions = slice.positions(items.len())?;
            positions.sort_unstable();
            for index in positions.into_iter().rev() {
                items.remove(index);
            }
        } else {
            let index = normalize_index(key, items.len(), "list").map_err(|err| {
                if err.is_exception(ErrorKind::IndexError) {
                    Fault::index_error("list assignment index out of range")
                } else {
                    err
                }
            })?;
            items.remove(index);
        }
        Ok(())
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        let list = this
            .as_type::<List>()
            .ok_or_else(|| Fault::type_error("expected a list"))?;
        Ok(Value::dynamic(ListIter {
            list,
            index: Mutex::new(0),
        }))
    }

    fn contains(&self, _vm: &mut Vm, _this: &AnyDynamic, item: &Value) -> Result<bool, Fault> {
        Ok(position_of(&self.to_vec(), item).is_some())
    }

    fn binary_op(
        &self,
        _vm: &mut Vm,
        _this: &AnyDynamic,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        match op {
            BinaryOperator::Add => match rhs.downcast_ref::<List>() {
                Some(rhs) => {
                    let mut items = self.to_vec();
                    items.extend(rhs.to_vec());
                    Ok(Some(Value::list(items)))
                }
                None => Err(Fault::type_error(format!(
                    "can only concatenate list (not \"{}\") to list",
                    rhs.type_name()
                ))),
            },
            BinaryOperator::Multiply => Ok(repeat(&self.to_vec(), rhs)?.map(Value::list)),
            _ => Ok(None),
        }
    }

    fn inplace_op(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        match op {
            BinaryOperator::Add => {
                let items = rhs.collect(vm)?;
                self.0.lock().extend(items);
                Ok(Some(Value::Dynamic(this.clone())))
            }
            BinaryOperator::Multiply => {
                let Some(repeated) = repeat(&self.to_vec(), rhs)? else {
                    return Ok(None);
                };
                *self.0.lock() = repeated;
                Ok(Some(Value::Dynamic(this.clone())))
            }
            _ => Ok(None),
        }
    }

    fn snapshot(&self) -> Option<Vec<Value>> {
        Some(self.to_vec())
    }
}

/// Iterates a list by position, observing modifications made while
/// iterating.
#[derive(Debug)]
struct ListIter {
    list: Dynamic<List>,
    index: Mutex<usize>,
}

impl CustomType for ListIter {
    fn type_name(&self) -> Symbol {
        Symbol::from("list_iterator")
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::Dynamic(this.clone()))
    }

    fn next(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        let mut index = self.index.lock();
        let item = self.list.get(*index);
        if item.is_some() {
            *index += 1;
        }
        Ok(item)
    }
}

static TUPLE_METHODS: MethodTable<Dynamic<Tuple>> = MethodTable::new(
    "tuple",
    &[
        ("index", |_vm, this, args| {
            let [value] = args.exactly("index")?;
            let index = position_of(&this.0, &value)
                .ok_or_else(|| Fault::value_error("tuple.index(x): x not in tuple"))?;
            Value::try_from(index)
        }),
        ("count", |_vm, this, args| {
            let [value] = args.exactly("count")?;
            Value::try_from(this.0.iter().filter(|item| item.equals(&value)).count())
        }),
    ],
);

impl CustomType for Tuple {
    fn type_name(&self) -> Symbol {
        Symbol::from("tuple")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        if let [only] = self.0.as_slice() {
            format!("({},)", only.repr())
        } else {
            sequence_repr(&self.0, "(", ")")
        }
    }

    fn truthy(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<bool, Fault> {
        Ok(!self.0.is_empty())
    }

    fn equals(&self, other: &Value) -> bool {
        other
            .downcast_ref::<Tuple>()
            .is_some_and(|other| sequence_equals(&self.0, &other.0))
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        sequence_compare(&self.0, &other.downcast_ref::<Tuple>()?.0)
    }

    fn hash(&self, _this: &AnyDynamic, hasher: &mut ValueHasher) -> Result<(), Fault> {
        self.0.len().hash(hasher);
        for item in &self.0 {
            item.hash_into(hasher)?;
        }
        Ok(())
    }

    fn len(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<usize, Fault> {
        Ok(self.0.len())
    }

    fn get_attr(&self, _vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        this.as_type::<Tuple>()
            .and_then(|this| TUPLE_METHODS.lookup(&this, name))
            .ok_or_else(|| Fault::no_attribute(&self.type_name(), name))
    }

    fn get_item(&self, _vm: &mut Vm, _this: &AnyDynamic, key: &Value) -> Result<Value, Fault> {
        match subscript(&self.0, key, "tuple")? {
            Selection::Item(item) => Ok(item),
            Selection::Slice(items) => Ok(Value::tuple(items)),
        }
    }

    fn iterate(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::dynamic(SequenceIter::new(self.0.clone())))
    }

    fn contains(&self, _vm: &mut Vm, _this: &AnyDynamic, item: &Value) -> Result<bool, Fault> {
        Ok(position_of(&self.0, item).is_some())
    }

    fn binary_op(
        &self,
        _vm: &mut Vm,
        _this: &AnyDynamic,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        match op {
            BinaryOperator::Add => match rhs.downcast_ref::<Tuple>() {
                Some(rhs) => {
                    let mut items = self.0.clone();
                    items.extend(rhs.0.iter().cloned());
                    Ok(Some(Value::tuple(items)))
                }
                None => Err(Fault::type_error(format!(
                    "can only concatenate tuple (not \"{}\") to tuple",
                    rhs.type_name()
                ))),
            },
            BinaryOperator::Multiply => Ok(repeat(&self.0, rhs)?.map(Value::tuple)),
            _ => Ok(None),
        }
    }

    fn snapshot(&self) -> Option<Vec<Value>> {
        Some(self.0.clone())
    }
}
