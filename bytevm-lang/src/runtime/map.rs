//! Types used for dictionaries and sets.

use std::cmp::Ordering;

use parking_lot::Mutex;

use crate::code::opcode::BinaryOperator;
use crate::runtime::iter::SequenceIter;
use crate::runtime::methods::MethodTable;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{guard_repr, AnyDynamic, CustomType, Dynamic, Value, ValueHasher};
use crate::vm::{Fault, Vm};

/// Insertion-ordered key-value storage keyed by value hash and equality.
#[derive(Debug, Default, Clone)]
struct Table(Vec<Field>);

impl Table {
    fn position(&self, key: &MapKey) -> Option<usize> {
        self.0
            .iter()
            .position(|field| field.key.hash == key.hash && field.key.value.equals(&key.value))
    }

    fn get(&self, key: &MapKey) -> Option<Value> {
        self.position(key).map(|index| self.0[index].value.clone())
    }

    fn insert(&mut self, key: MapKey, value: Value) -> Option<Value> {
        match self.position(&key) {
            Some(index) => Some(std::mem::replace(&mut self.0[index].value, value)),
            None => {
                self.0.push(Field { key, value });
                None
            }
        }
    }

    fn remove(&mut self, key: &MapKey) -> Option<Field> {
        let index = self.position(key)?;
        Some(self.0.remove(index))
    }

    fn keys(&self) -> Vec<Value> {
        self.0.iter().map(|field| field.key.value.clone()).collect()
    }
}

/// A key-value pair.
#[derive(Debug, Clone)]
pub struct Field {
    key: MapKey,
    value: Value,
}

impl Field {
    /// Returns the key of this field.
    #[must_use]
    pub const fn key(&self) -> &Value {
        &self.key.value
    }

    /// Returns the value of this field.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Splits this field into its key and value.
    #[must_use]
    pub fn into_parts(self) -> (Value, Value) {
        (self.key.value, self.value)
    }
}

#[derive(Debug, Clone)]
struct MapKey {
    value: Value,
    hash: u64,
}

impl MapKey {
    fn new(value: Value) -> Result<Self, Fault> {
        Ok(Self {
            hash: value.hash()?,
            value,
        })
    }
}

/// An insertion-ordered dictionary.
#[derive(Debug, Default)]
pub struct Dict(Mutex<Table>);

impl Dict {
    /// Returns an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dictionary from key-value pairs. Later pairs replace earlier
    /// pairs with equal keys.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Value, Value)>) -> Result<Self, Fault> {
        let dict = Self::new();
        for (key, value) in pairs {
            dict.insert(key, value)?;
        }
        Ok(dict)
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &Value) -> Result<Option<Value>, Fault> {
        let key = MapKey::new(key.clone())?;
        Ok(self.0.lock().get(&key))
    }

    /// Stores `value` for `key`, returning the value it replaced.
    pub fn insert(&self, key: Value, value: Value) -> Result<Option<Value>, Fault> {
        let key = MapKey::new(key)?;
        Ok(self.0.lock().insert(key, value))
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &Value) -> Result<Option<Value>, Fault> {
        let key = MapKey::new(key.clone())?;
        Ok(self.0.lock().remove(&key).map(|field| field.value))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().0.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().0.is_empty()
    }

    /// Returns the keys, in insertion order.
    #[must_use]
    pub fn keys(&self) -> Vec<Value> {
        self.0.lock().keys()
    }

    /// Returns every entry as a key-value pair, in insertion order.
    #[must_use]
    pub fn pairs(&self) -> Vec<(Value, Value)> {
        self.to_vec().into_iter().map(Field::into_parts).collect()
    }

    /// Returns this dictionary as a vec of fields.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Field> {
        self.0.lock().0.clone()
    }

    pub(crate) fn update(&self, vm: &mut Vm, source: &Value) -> Result<(), Fault> {
        let pairs = if let Some(dict) = source.downcast_ref::<Dict>() {
            dict.pairs()
        } else {
            let mut pairs = Vec::new();
            for (index, item) in source.collect(vm)?.into_iter().enumerate() {
                let pair = item.collect(vm)?;
                let [key, value] = <[Value; 2]>::try_from(pair).map_err(|pair| {
                    Fault::value_error(format!(
                        "dictionary update sequence element #{index} has length {}; 2 is required",
                        pair.len()
                    ))
                })?;
                pairs.push((key, value));
            }
            pairs
        };
        for (key, value) in pairs {
            self.insert(key, value)?;
        }
        Ok(())
    }
}

static DICT_METHODS: MethodTable<Dynamic<Dict>> = MethodTable::new(
    "dict",
    &[
        ("keys", |_vm, this, args| {
            let [] = args.exactly("keys")?;
            Ok(Value::list(this.keys()))
        }),
        ("values", |_vm, this, args| {
            let [] = args.exactly("values")?;
            Ok(Value::list(
                this.pairs().into_iter().map(|(_, value)| value).collect(),
            ))
        }),
        ("items", |_vm, this, args| {
            let [] = args.exactly("items")?;
            Ok(Value::list(
                this.pairs()
                    .into_iter()
                    .map(|(key, value)| Value::tuple(vec![key, value]))
                    .collect(),
            ))
        }),
        ("get", |_vm, this, args| {
            let mut args = args.between("get", 1, 2)?.into_iter();
            let key = args.next().unwrap_or_default();
            let default = args.next().unwrap_or_default();
            Ok(this.get(&key)?.unwrap_or(default))
        }),
        ("pop", |_vm, this, args| {
            let mut args = args.between("pop", 1, 2)?.into_iter();
            let key = args.next().unwrap_or_default();
            match (this.remove(&key)?, args.next()) {
                (Some(value), _) | (None, Some(value)) => Ok(value),
                (None, None) => Err(Fault::key_error(key)),
            }
        }),
        ("popitem", |_vm, this, args| {
            let [] = args.exactly("popitem")?;
            let field = this
                .0
                .lock()
                .0
                .pop()
                .ok_or_else(|| Fault::key_error(Value::from("popitem(): dictionary is empty")))?;
            let (key, value) = field.into_parts();
            Ok(Value::tuple(vec![key, value]))
        }),
        ("setdefault", |_vm, this, args| {
            let mut args = args.between("setdefault", 1, 2)?.into_iter();
            let key = args.next().unwrap_or_default();
            let default = args.next().unwrap_or_default();
            if let Some(existing) = this.get(&key)? {
                return Ok(existing);
            }
            this.insert(key, default.clone())?;
            Ok(default)
        }),
        ("update", |vm, this, args| {
            let keywords = args.keywords.clone();
            let sources = args.positional;
            if sources.len() > 1 {
                return Err(Fault::type_error(format!(
                    "update expected at most 1 arguments, got {}",
                    sources.len()
                )));
            }
            if let Some(source) = sources.first() {
                this.update(vm, source)?;
            }
            for (name, value) in keywords {
                this.insert(Value::Str(name), value)?;
            }
            Ok(Value::None)
        }),
        ("clear", |_vm, this, args| {
            let [] = args.exactly("clear")?;
            this.0.lock().0.clear();
            Ok(Value::None)
        }),
        ("copy", |_vm, this, args| {
            let [] = args.exactly("copy")?;
            Ok(Value::dynamic(Dict(Mutex::new(this.0.lock().clone()))))
        }),
    ],
);

impl CustomType for Dict {
    fn type_name(&self) -> Symbol {
        Symbol::from("dict")
    }

    fn repr(&self, this: &AnyDynamic) -> String {
        guard_repr(this.address(), "{...}", || {
            let entries = self
                .pairs()
                .into_iter()
                .map(|(key, value)| format!("{}: {}", key.repr(), value.repr()))
                .collect::<Vec<_>>();
            format!("{{{}}}", entries.join(", "))
        })
    }

    fn truthy(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<bool, Fault> {
        Ok(!self.is_empty())
    }

    fn equals(&self, other: &Value) -> bool {
        let Some(other) = other.downcast_ref::<Dict>() else {
            return false;
        };
        let (ours, theirs) = (self.pairs(), other.pairs());
        ours.len() == theirs.len()
            && ours.iter().all(|(key, value)| {
                other
                    .get(key)
                    .ok()
                    .flatten()
                    .is_some_and(|theirs| theirs.equals(value))
            })
    }

    fn hash(&self, _this: &AnyDynamic, _hasher: &mut ValueHasher) -> Result<(), Fault> {
        Err(Fault::type_error("unhashable type: 'dict'"))
    }

    fn len(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<usize, Fault> {
        Ok(Dict::len(self))
    }

    fn get_attr(&self, _vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        this.as_type::<Dict>()
            .and_then(|this| DICT_METHODS.lookup(&this, name))
            .ok_or_else(|| Fault::no_attribute(&self.type_name(), name))
    }

    fn get_item(&self, _vm: &mut Vm, _this: &AnyDynamic, key: &Value) -> Result<Value, Fault> {
        self.get(key)?.ok_or_else(|| Fault::key_error(key.clone()))
    }

    fn set_item(
        &self,
        _vm: &mut Vm,
        _this: &AnyDynamic,
        key: Value,
        value: Value,
    ) -> Result<(), Fault> {
        self.insert(key, value)?;
        Ok(())
    }

    fn del_item(&self, _vm: &mut Vm, _this: &AnyDynamic, key: &Value) -> Result<(), Fault> {
        self.remove(key)?
            .map(|_| ())
            .ok_or_else(|| Fault::key_error(key.clone()))
    }

    fn contains(&self, _vm: &mut Vm, _this: &AnyDynamic, item: &Value) -> Result<bool, Fault> {
        Ok(self.get(item)?.is_some())
    }

    fn iterate(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::dynamic(SequenceIter::new(self.keys())))
    }

    fn snapshot(&self) -> Option<Vec<Value>> {
        Some(self.keys())
    }
}

/// An insertion-ordered set of hashable values.
#[derive(Debug, Default)]
pub struct Set(Mutex<Table>);

impl Set {
    /// Returns a set of the distinct `values`.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Result<Self, Fault> {
        let set = Self::default();
        for value in values {
            set.insert(value)?;
        }
        Ok(set)
    }

    /// Adds `value`, returning true if it was not already present.
    pub fn insert(&self, value: Value) -> Result<bool, Fault> {
        let key = MapKey::new(value)?;
        Ok(self.0.lock().insert(key, Value::None).is_none())
    }

    /// Returns true if `value` is a member.
    pub fn contains_value(&self, value: &Value) -> Result<bool, Fault> {
        let key = MapKey::new(value.clone())?;
        Ok(self.0.lock().position(&key).is_some())
    }

    /// Removes `value`, returning true if it was present.
    pub fn remove(&self, value: &Value) -> Result<bool, Fault> {
        let key = MapKey::new(value.clone())?;
        Ok(self.0.lock().remove(&key).is_some())
    }

    /// Returns the members, in insertion order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.lock().keys()
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().0.len()
    }

    /// Returns true if there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().0.is_empty()
    }

    fn combine(&self, other: &Set, op: BinaryOperator) -> Result<Option<Set>, Fault> {
        let ours = self.to_vec();
        let theirs = other.to_vec();
        let result = match op {
            BinaryOperator::Or => Set::from_values(ours.into_iter().chain(theirs))?,
            BinaryOperator::And => Set::from_values(
                ours.into_iter()
                    .filter(|value| other.contains_value(value).unwrap_or(false)),
            )?,
            BinaryOperator::Subtract => Set::from_values(
                ours.into_iter()
                    .filter(|value| !other.contains_value(value).unwrap_or(false)),
            )?,
            BinaryOperator::Xor => {
                let mut members = ours
                    .iter()
                    .filter(|value| !other.contains_value(value).unwrap_or(false))
                    .cloned()
                    .collect::<Vec<_>>();
                members.extend(
                    theirs
                        .into_iter()
                        .filter(|value| !self.contains_value(value).unwrap_or(false)),
                );
                Set::from_values(members)?
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn is_subset(&self, other: &Set) -> bool {
        self.to_vec()
            .iter()
            .all(|value| other.contains_value(value).unwrap_or(false))
    }
}

fn other_set(vm: &mut Vm, value: &Value) -> Result<Set, Fault> {
    Set::from_values(value.collect(vm)?)
}

static SET_METHODS: MethodTable<Dynamic<Set>> = MethodTable::new(
    "set",
    &[
        ("add", |_vm, this, args| {
            let [value] = args.exactly("add")?;
            this.insert(value)?;
            Ok(Value::None)
        }),
        ("remove", |_vm, this, args| {
            let [value] = args.exactly("remove")?;
            if this.remove(&value)? {
                Ok(Value::None)
            } else {
                Err(Fault::key_error(value))
            }
        }),
        ("discard", |_vm, this, args| {
            let [value] = args.exactly("discard")?;
            this.remove(&value)?;
            Ok(Value::None)
        }),
        ("pop", |_vm, this, args| {
            let [] = args.exactly("pop")?;
            let mut table = this.0.lock();
            if table.0.is_empty() {
                return Err(Fault::key_error(Value::from("pop from an empty set")));
            }
            Ok(table.0.remove(0).key.value)
        }),
        ("clear", |_vm, this, args| {
            let [] = args.exactly("clear")?;
            this.0.lock().0.clear();
            Ok(Value::None)
        }),
        ("copy", |_vm, this, args| {
            let [] = args.exactly("copy")?;
            Ok(Value::dynamic(Set(Mutex::new(this.0.lock().clone()))))
        }),
        ("update", |vm, this, args| {
            for iterable in args.between("update", 0, usize::MAX)? {
                for value in iterable.collect(vm)? {
                    this.insert(value)?;
                }
            }
            Ok(Value::None)
        }),
        ("union", |vm, this, args| {
            let [other] = args.exactly("union")?;
            let other = other_set(vm, &other)?;
            set_result(this.combine(&other, BinaryOperator::Or)?)
        }),
        ("intersection", |vm, this, args| {
            let [other] = args.exactly("intersection")?;
            let other = other_set(vm, &other)?;
            set_result(this.combine(&other, BinaryOperator::And)?)
        }),
        ("difference", |vm, this, args| {
            let [other] = args.exactly("difference")?;
            let other = other_set(vm, &other)?;
            set_result(this.combine(&other, BinaryOperator::Subtract)?)
        }),
        ("issubset", |vm, this, args| {
            let [other] = args.exactly("issubset")?;
            let other = other_set(vm, &other)?;
            Ok(Value::Bool(this.is_subset(&other)))
        }),
    ],
);

fn set_result(set: Option<Set>) -> Result<Value, Fault> {
    set.map(Value::dynamic).ok_or(Fault::InvalidOperand)
}

impl CustomType for Set {
    fn type_name(&self) -> Symbol {
        Symbol::from("set")
    }

    fn repr(&self, this: &AnyDynamic) -> String {
        let members = self.to_vec();
        if members.is_empty() {
            return String::from("set()");
        }
        guard_repr(this.address(), "set(...)", || {
            let members = members.iter().map(Value::repr).collect::<Vec<_>>();
            format!("{{{}}}", members.join(", "))
        })
    }

    fn truthy(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<bool, Fault> {
        Ok(!self.is_empty())
    }

    fn equals(&self, other: &Value) -> bool {
        other
            .downcast_ref::<Set>()
            .is_some_and(|other| self.len() == other.len() && self.is_subset(other))
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        let other = other.downcast_ref::<Set>()?;
        match (self.is_subset(other), other.is_subset(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    fn hash(&self, _this: &AnyDynamic, _hasher: &mut ValueHasher) -> Result<(), Fault> {
        Err(Fault::type_error("unhashable type: 'set'"))
    }

    fn len(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<usize, Fault> {
        Ok(Set::len(self))
    }

    fn get_attr(&self, _vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        this.as_type::<Set>()
            .and_then(|this| SET_METHODS.lookup(&this, name))
            .ok_or_else(|| Fault::no_attribute(&self.type_name(), name))
    }

    fn contains(&self, _vm: &mut Vm, _this: &AnyDynamic, item: &Value) -> Result<bool, Fault> {
        self.contains_value(item)
    }

    fn iterate(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::dynamic(SequenceIter::new(self.to_vec())))
    }

    fn binary_op(
        &self,
        _vm: &mut Vm,
        _this: &AnyDynamic,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        let Some(rhs) = rhs.downcast_ref::<Set>() else {
            return Ok(None);
        };
        Ok(self.combine(rhs, op)?.map(Value::dynamic))
    }

    fn snapshot(&self) -> Option<Vec<Value>> {
        Some(self.to_vec())
    }
}
