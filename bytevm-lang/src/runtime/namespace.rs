//! Name-to-value mappings used for locals, globals, builtins, class bodies
//! and attribute storage.

use std::fmt::Debug;

use kempt::Map;
use parking_lot::Mutex;

use crate::runtime::iter::SequenceIter;
use crate::runtime::methods::MethodTable;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{guard_repr, AnyDynamic, CustomType, Dynamic, Value};
use crate::vm::{Fault, Vm};

/// A mutable mapping of names to values.
#[derive(Default)]
pub struct Namespace(Mutex<Map<Symbol, Value>>);

impl Namespace {
    /// Binds `name` to `value`, returning the previously bound value.
    pub fn insert(&self, name: Symbol, value: Value) -> Option<Value> {
        self.0.lock().insert(name, value).map(|field| field.value)
    }

    /// Returns the value bound to `name`.
    #[must_use]
    pub fn get(&self, name: &Symbol) -> Option<Value> {
        self.0.lock().get(name).cloned()
    }

    /// Unbinds `name`, returning its value.
    pub fn remove(&self, name: &Symbol) -> Option<Value> {
        self.0.lock().remove(name).map(|field| field.value)
    }

    /// Returns true if `name` is bound.
    #[must_use]
    pub fn contains(&self, name: &Symbol) -> bool {
        self.0.lock().contains(name)
    }

    /// Returns every bound name.
    #[must_use]
    pub fn names(&self) -> Vec<Symbol> {
        self.0.lock().iter().map(|field| field.key().clone()).collect()
    }

    /// Returns every binding.
    #[must_use]
    pub fn pairs(&self) -> Vec<(Symbol, Value)> {
        self.0
            .lock()
            .iter()
            .map(|field| (field.key().clone(), field.value.clone()))
            .collect()
    }

    /// Returns the number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns true if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl FromIterator<(Symbol, Value)> for Namespace {
    fn from_iter<T: IntoIterator<Item = (Symbol, Value)>>(iter: T) -> Self {
        let namespace = Self::default();
        for (name, value) in iter {
            namespace.insert(name, value);
        }
        namespace
    }
}

impl Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

fn name_key(key: &Value) -> Result<&Symbol, Fault> {
    key.as_symbol().ok_or_else(|| {
        Fault::type_error(format!(
            "namespace keys must be str, not {}",
            key.type_name()
        ))
    })
}

static NAMESPACE_METHODS: MethodTable<Dynamic<Namespace>> = MethodTable::new(
    "dict",
    &[
        ("keys", |_vm, this, args| {
            let [] = args.exactly("keys")?;
            Ok(Value::list(this.names().into_iter().map(Value::Str).collect()))
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
                    .map(|(name, value)| Value::tuple(vec![Value::Str(name), value]))
                    .collect(),
            ))
        }),
        ("get", |_vm, this, args| {
            let mut args = args.between("get", 1, 2)?.into_iter();
            let key = args.next().unwrap_or_default();
            let default = args.next().unwrap_or_default();
            Ok(this.get(name_key(&key)?).unwrap_or(default))
        }),
    ],
);

impl CustomType for Namespace {
    fn type_name(&self) -> Symbol {
        Symbol::from("dict")
    }

    fn repr(&self, this: &AnyDynamic) -> String {
        guard_repr(this.address(), "{...}", || {
            let entries = self
                .pairs()
                .into_iter()
                .map(|(name, value)| format!("{}: {}", Value::Str(name).repr(), value.repr()))
                .collect::<Vec<_>>();
            format!("{{{}}}", entries.join(", "))
        })
    }

    fn truthy(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<bool, Fault> {
        Ok(!self.is_empty())
    }

    fn len(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<usize, Fault> {
        Ok(Namespace::len(self))
    }

    fn get_attr(&self, _vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        this.as_type::<Namespace>()
            .and_then(|this| NAMESPACE_METHODS.lookup(&this, name))
            .ok_or_else(|| Fault::no_attribute(&self.type_name(), name))
    }

    fn get_item(&self, _vm: &mut Vm, _this: &AnyDynamic, key: &Value) -> Result<Value, Fault> {
        self.get(name_key(key)?)
            .ok_or_else(|| Fault::key_error(key.clone()))
    }

    fn set_item(
        &self,
        _vm: &mut Vm,
        _this: &AnyDynamic,
        key: Value,
        value: Value,
    ) -> Result<(), Fault> {
        self.insert(name_key(&key)?.clone(), value);
        Ok(())
    }

    fn del_item(&self, _vm: &mut Vm, _this: &AnyDynamic, key: &Value) -> Result<(), Fault> {
        self.remove(name_key(key)?)
            .map(|_| ())
            .ok_or_else(|| Fault::key_error(key.clone()))
    }

    fn contains(&self, _vm: &mut Vm, _this: &AnyDynamic, item: &Value) -> Result<bool, Fault> {
        Ok(item.as_symbol().is_some_and(|name| Namespace::contains(self, name)))
    }

    fn iterate(&self, _vm: &mut Vm, _this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::dynamic(SequenceIter::new(
            self.names().into_iter().map(Value::Str).collect(),
        )))
    }

    fn snapshot(&self) -> Option<Vec<Value>> {
        Some(self.names().into_iter().map(Value::Str).collect())
    }
}
