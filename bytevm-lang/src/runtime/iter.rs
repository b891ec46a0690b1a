//! Iterators over builtin collections, and `range`.

use parking_lot::Mutex;

use crate::runtime::exception::ErrorKind;
use crate::runtime::list::normalize_index;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{AnyDynamic, CustomType, Value};
use crate::vm::call::Arguments;
use crate::vm::{Fault, Vm};

/// Iterates a snapshot of values.
#[derive(Debug)]
pub struct SequenceIter {
    items: Vec<Value>,
    index: Mutex<usize>,
}

impl SequenceIter {
    /// Returns an iterator over `items`.
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            index: Mutex::new(0),
        }
    }
}

impl CustomType for SequenceIter {
    fn type_name(&self) -> Symbol {
        Symbol::from("iterator")
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::Dynamic(this.clone()))
    }

    fn next(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        let mut index = self.index.lock();
        let item = self.items.get(*index).cloned();
        if item.is_some() {
            *index += 1;
        }
        Ok(item)
    }
}

/// An immutable arithmetic progression of integers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Range {
    start: i64,
    stop: i64,
    step: i64,
}

impl Range {
    /// Returns the integers from `start` up to, but excluding, `stop`
    /// advancing by `step`.
    pub fn new(start: i64, stop: i64, step: i64) -> Result<Self, Fault> {
        if step == 0 {
            return Err(Fault::value_error("range() arg 3 must not be zero"));
        }
        Ok(Self { start, stop, step })
    }

    /// Returns the number of integers in this range.
    #[must_use]
    pub fn len(&self) -> usize {
        let (low, high, step) = if self.step > 0 {
            (self.start, self.stop, self.step)
        } else {
            (self.stop, self.start, -self.step)
        };
        if low >= high {
            return 0;
        }
        let span = i128::from(high) - i128::from(low) - 1;
        usize::try_from(span / i128::from(step) + 1).unwrap_or(usize::MAX)
    }

    /// Returns true if this range contains no integers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn nth(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let index = i64::try_from(index).ok()?;
        self.start.checked_add(index.checked_mul(self.step)?)
    }
}

impl CustomType for Range {
    fn type_name(&self) -> Symbol {
        Symbol::from("range")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        if self.step == 1 {
            format!("range({}, {})", self.start, self.stop)
        } else {
            format!("range({}, {}, {})", self.start, self.stop, self.step)
        }
    }

    fn truthy(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<bool, Fault> {
        Ok(!self.is_empty())
    }

    fn equals(&self, other: &Value) -> bool {
        other.downcast_ref::<Range>().is_some_and(|other| {
            let len = self.len();
            len == other.len()
                && (len == 0
                    || (self.start == other.start && (len == 1 || self.step == other.step)))
        })
    }

    fn len(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<usize, Fault> {
        Ok(Range::len(self))
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        match name.as_str() {
            "start" => Ok(Value::Int(self.start)),
            "stop" => Ok(Value::Int(self.stop)),
            "step" => Ok(Value::Int(self.step)),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }

    fn get_item(&self, _vm: &mut Vm, _this: &AnyDynamic, key: &Value) -> Result<Value, Fault> {
        let index = normalize_index(key, Range::len(self), "range")
            .map_err(|err| {
                if err.is_exception(ErrorKind::IndexError) {
                    Fault::index_error("range object index out of range")
                } else {
                    err
                }
            })?;
        self.nth(index).map(Value::Int).ok_or_else(Fault::overflow)
    }

    fn contains(&self, _vm: &mut Vm, _this: &AnyDynamic, item: &Value) -> Result<bool, Fault> {
        let Some(value) = item.as_i64() else {
            return Ok(false);
        };
        let in_bounds = if self.step > 0 {
            self.start <= value && value < self.stop
        } else {
            self.stop < value && value <= self.start
        };
        Ok(in_bounds && (i128::from(value) - i128::from(self.start)) % i128::from(self.step) == 0)
    }

    fn iterate(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::dynamic(RangeIter {
            range: *self,
            index: Mutex::new(0),
        }))
    }
}

#[derive(Debug)]
struct RangeIter {
    range: Range,
    index: Mutex<usize>,
}

impl CustomType for RangeIter {
    fn type_name(&self) -> Symbol {
        Symbol::from("range_iterator")
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::Dynamic(this.clone()))
    }

    fn next(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        let mut index = self.index.lock();
        let value = self.range.nth(*index);
        if value.is_some() {
            *index += 1;
        }
        Ok(value.map(Value::Int))
    }
}

/// Pairs each item of an iterator with a running count.
#[derive(Debug)]
pub struct Enumerate {
    iterator: Value,
    count: Mutex<i64>,
}

impl Enumerate {
    /// Returns an iterator pairing the items of `iterator` with a count
    /// beginning at `start`.
    #[must_use]
    pub fn new(iterator: Value, start: i64) -> Self {
        Self {
            iterator,
            count: Mutex::new(start),
        }
    }
}

impl CustomType for Enumerate {
    fn type_name(&self) -> Symbol {
        Symbol::from("enumerate")
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::Dynamic(this.clone()))
    }

    fn next(&self, vm: &mut Vm, _this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        let Some(item) = self.iterator.next(vm)? else {
            return Ok(None);
        };
        let mut count = self.count.lock();
        let index = *count;
        *count = count.checked_add(1).ok_or_else(Fault::overflow)?;
        Ok(Some(Value::tuple(vec![Value::Int(index), item])))
    }
}

/// Advances several iterators in lockstep.
#[derive(Debug)]
pub struct Zip {
    iterators: Vec<Value>,
}

impl Zip {
    /// Returns an iterator of tuples drawn from each of `iterators`.
    #[must_use]
    pub fn new(iterators: Vec<Value>) -> Self {
        Self { iterators }
    }
}

impl CustomType for Zip {
    fn type_name(&self) -> Symbol {
        Symbol::from("zip")
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::Dynamic(this.clone()))
    }

    fn next(&self, vm: &mut Vm, _this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        if self.iterators.is_empty() {
            return Ok(None);
        }
        let mut items = Vec::with_capacity(self.iterators.len());
        for iterator in &self.iterators {
            match iterator.next(vm)? {
                Some(item) => items.push(item),
                None => return Ok(None),
            }
        }
        Ok(Some(Value::tuple(items)))
    }
}

/// Lazily applies a function to the items of one or more iterators, as
/// `map()` does.
#[derive(Debug)]
pub struct MapIter {
    function: Value,
    iterators: Vec<Value>,
}

impl MapIter {
    /// Returns an iterator calling `function` with one item from each of
    /// `iterators`.
    #[must_use]
    pub fn new(function: Value, iterators: Vec<Value>) -> Self {
        Self {
            function,
            iterators,
        }
    }
}

impl CustomType for MapIter {
    fn type_name(&self) -> Symbol {
        Symbol::from("map")
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::Dynamic(this.clone()))
    }

    fn next(&self, vm: &mut Vm, _this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        let mut args = Vec::with_capacity(self.iterators.len());
        for iterator in &self.iterators {
            match iterator.next(vm)? {
                Some(item) => args.push(item),
                None => return Ok(None),
            }
        }
        self.function.call(vm, Arguments::new(args)).map(Some)
    }
}

/// Lazily yields the items of an iterator for which a predicate is true, as
/// `filter()` does. A `None` predicate tests each item's truthiness.
#[derive(Debug)]
pub struct Filter {
    predicate: Value,
    iterator: Value,
}

impl Filter {
    /// Returns an iterator over the items of `iterator` that satisfy
    /// `predicate`.
    #[must_use]
    pub fn new(predicate: Value, iterator: Value) -> Self {
        Self {
            predicate,
            iterator,
        }
    }
}

impl CustomType for Filter {
    fn type_name(&self) -> Symbol {
        Symbol::from("filter")
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::Dynamic(this.clone()))
    }

    fn next(&self, vm: &mut Vm, _this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        while let Some(item) = self.iterator.next(vm)? {
            let keep = if self.predicate.is_none() {
                item.truthy(vm)?
            } else {
                self.predicate
                    .call(vm, Arguments::new(vec![item.clone()]))?
                    .truthy(vm)?
            };
            if keep {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }
}
