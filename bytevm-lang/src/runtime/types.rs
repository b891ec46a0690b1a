//! User-defined classes and their instances, the descriptors that customize
//! attribute lookup, and the vm-aware `str()`/`repr()` helpers.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::code::opcode::BinaryOperator;
use crate::runtime::exception::{exception_message, ErrorKind};
use crate::runtime::list::Tuple;
use crate::runtime::map::Dict;
use crate::runtime::namespace::Namespace;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{AnyDynamic, CustomType, Dynamic, Value, ValueHasher};
use crate::vm::call::Arguments;
use crate::vm::function::{bind_to, Cell, Function, Method, NativeFunction};
use crate::vm::{Fault, Vm};

/// A class created by a `class` statement, or one of the builtin exception
/// classes.
#[derive(Debug)]
pub struct Class {
    name: Symbol,
    qualname: Symbol,
    bases: Vec<Dynamic<Class>>,
    ancestors: Vec<Dynamic<Class>>,
    namespace: Arc<Namespace>,
    kind: Option<ErrorKind>,
    metaclass: Option<Dynamic<Class>>,
}

impl Class {
    /// Returns a new class deriving from `bases`, whose attributes are
    /// `namespace`. A class without bases derives from `object`.
    pub fn new(
        name: Symbol,
        qualname: Symbol,
        bases: Vec<Dynamic<Class>>,
        namespace: Arc<Namespace>,
    ) -> Result<Self, Fault> {
        for (index, base) in bases.iter().enumerate() {
            if bases[..index].iter().any(|other| other.ptr_eq(base)) {
                return Err(Fault::type_error(format!(
                    "duplicate base class {}",
                    base.name
                )));
            }
        }
        let ancestors = if bases.is_empty() {
            vec![Class::object()]
        } else {
            linearize(&bases)?
        };
        let kind = ancestors.iter().find_map(|ancestor| ancestor.kind);
        Ok(Self {
            name,
            qualname,
            bases,
            ancestors,
            namespace,
            kind,
            metaclass: None,
        })
    }

    /// Returns this class with `metaclass` recorded as its type.
    #[must_use]
    pub fn with_metaclass(mut self, metaclass: Dynamic<Class>) -> Self {
        if !metaclass.ptr_eq(&Class::type_class()) {
            self.metaclass = Some(metaclass);
        }
        self
    }

    pub(crate) fn builtin_exception(kind: ErrorKind, bases: Vec<Dynamic<Class>>) -> Self {
        let namespace = Namespace::default();
        if kind == ErrorKind::BaseException {
            namespace.insert(
                Symbol::from("__init__"),
                Value::dynamic(NativeFunction::method(
                    "BaseException.__init__",
                    |_vm, args| {
                        args.no_keywords("BaseException.__init__")?;
                        let mut positional = args.positional.into_iter();
                        let receiver = positional.next().unwrap_or_default();
                        if let Some(instance) = receiver.downcast_ref::<Instance>() {
                            instance.set_attribute(
                                Symbol::from("args"),
                                Value::tuple(positional.collect()),
                            );
                        }
                        Ok(Value::None)
                    },
                )),
            );
        }
        let ancestors = match bases.first() {
            Some(base) => {
                let mut ancestors = vec![base.clone()];
                ancestors.extend(base.ancestors.iter().cloned());
                ancestors
            }
            None => vec![Class::object()],
        };
        let name = Symbol::from(kind.name());
        Self {
            qualname: name.clone(),
            name,
            bases,
            ancestors,
            namespace: Arc::new(namespace),
            kind: Some(kind),
            metaclass: None,
        }
    }

    /// Returns the `object` class every class derives from.
    #[must_use]
    pub fn object() -> Dynamic<Class> {
        static OBJECT: OnceLock<Dynamic<Class>> = OnceLock::new();
        OBJECT
            .get_or_init(|| {
                let namespace = Namespace::default();
                namespace.insert(
                    Symbol::from("__init__"),
                    Value::dynamic(NativeFunction::method("object.__init__", |_vm, args| {
                        args.no_keywords("object")?;
                        if args.positional.len() > 1 {
                            return Err(Fault::type_error("object() takes no parameters"));
                        }
                        Ok(Value::None)
                    })),
                );
                let name = Symbol::from("object");
                Dynamic::new(Class {
                    qualname: name.clone(),
                    name,
                    bases: Vec::new(),
                    ancestors: Vec::new(),
                    namespace: Arc::new(namespace),
                    kind: None,
                    metaclass: None,
                })
            })
            .clone()
    }

    /// Returns the `type` class: the default metaclass, and the base of every
    /// user-defined metaclass.
    #[must_use]
    pub fn type_class() -> Dynamic<Class> {
        static TYPE: OnceLock<Dynamic<Class>> = OnceLock::new();
        TYPE.get_or_init(|| {
            let namespace = Namespace::default();
            namespace.insert(
                Symbol::from("__new__"),
                Value::dynamic(NativeFunction::new("type.__new__", type_new)),
            );
            namespace.insert(
                Symbol::from("__init__"),
                Value::dynamic(NativeFunction::method("type.__init__", |_vm, _args| {
                    Ok(Value::None)
                })),
            );
            let name = Symbol::from("type");
            Dynamic::new(Class {
                qualname: name.clone(),
                name,
                bases: vec![Class::object()],
                ancestors: vec![Class::object()],
                namespace: Arc::new(namespace),
                kind: None,
                metaclass: None,
            })
        })
        .clone()
    }

    /// Returns the metaclass this class was created by, if it is not `type`.
    #[must_use]
    pub const fn metaclass(&self) -> Option<&Dynamic<Class>> {
        self.metaclass.as_ref()
    }

    /// Returns the type of this class: its metaclass or `type`.
    #[must_use]
    pub fn metatype(&self) -> Dynamic<Class> {
        self.metaclass.clone().unwrap_or_else(Class::type_class)
    }

    /// Returns true if instances of this class are classes.
    #[must_use]
    pub fn is_metaclass(&self) -> bool {
        let type_class = Class::type_class();
        self.ancestors
            .iter()
            .any(|ancestor| ancestor.ptr_eq(&type_class))
    }

    /// Returns true if `value` is an instance of `class` or one of its
    /// subclasses. Classes are instances of their metatype, and every value
    /// is an instance of `object`.
    #[must_use]
    pub fn has_instance(class: &Dynamic<Class>, value: &Value) -> bool {
        if let Some(instance) = value.downcast_ref::<Instance>() {
            Class::is_subclass(instance.class(), class)
        } else if let Some(value) = value.downcast_ref::<Class>() {
            Class::is_subclass(&value.metatype(), class)
        } else {
            class.ptr_eq(&Class::object())
        }
    }

    /// Returns the class name.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns the direct base classes.
    #[must_use]
    pub fn bases(&self) -> &[Dynamic<Class>] {
        &self.bases
    }

    /// Returns the class's own attributes.
    #[must_use]
    pub const fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    /// Returns the builtin exception this class is, or derives from.
    #[must_use]
    pub const fn error_kind(&self) -> Option<ErrorKind> {
        self.kind
    }

    /// Returns true if this class derives from `BaseException`.
    #[must_use]
    pub const fn is_exception(&self) -> bool {
        self.kind.is_some()
    }

    /// Returns true if `class` is `base` or derives from it.
    #[must_use]
    pub fn is_subclass(class: &Dynamic<Class>, base: &Dynamic<Class>) -> bool {
        class.ptr_eq(base) || class.ancestors.iter().any(|ancestor| ancestor.ptr_eq(base))
    }

    /// Looks `name` up on this class and then its ancestors in method
    /// resolution order.
    #[must_use]
    pub fn lookup(&self, name: &Symbol) -> Option<Value> {
        self.namespace.get(name).or_else(|| {
            self.ancestors
                .iter()
                .find_map(|ancestor| ancestor.namespace.get(name))
        })
    }

    /// Looks `name` up on `class` and then its ancestors, returning the
    /// attribute together with the class whose namespace defines it.
    #[must_use]
    pub fn lookup_owner(class: &Dynamic<Class>, name: &Symbol) -> Option<(Value, Dynamic<Class>)> {
        std::iter::once(class)
            .chain(class.ancestors.iter())
            .find_map(|owner| owner.namespace.get(name).map(|value| (value, owner.clone())))
    }

    fn module(&self) -> Option<Symbol> {
        self.namespace
            .get(&Symbol::from("__module__"))
            .and_then(|module| module.as_symbol().cloned())
    }
}

/// Computes the C3 linearization of `bases`.
fn linearize(bases: &[Dynamic<Class>]) -> Result<Vec<Dynamic<Class>>, Fault> {
    let mut sequences = bases
        .iter()
        .map(|base| {
            let mut sequence = vec![base.clone()];
            sequence.extend(base.ancestors.iter().cloned());
            sequence
        })
        .collect::<Vec<_>>();
    sequences.push(bases.to_vec());
    let mut order = Vec::new();
    loop {
        sequences.retain(|sequence| !sequence.is_empty());
        if sequences.is_empty() {
            return Ok(order);
        }
        let next = sequences
            .iter()
            .map(|sequence| &sequence[0])
            .find(|head| {
                !sequences
                    .iter()
                    .any(|sequence| sequence[1..].iter().any(|class| class.ptr_eq(head)))
            })
            .cloned()
            .ok_or_else(|| {
                Fault::type_error("Cannot create a consistent method resolution order (MRO)")
            })?;
        for sequence in &mut sequences {
            if sequence[0].ptr_eq(&next) {
                sequence.remove(0);
            }
        }
        order.push(next);
    }
}

fn class_handle(this: &AnyDynamic) -> Dynamic<Class> {
    this.as_type().expect("class handle")
}

impl CustomType for Class {
    fn type_name(&self) -> Symbol {
        Symbol::from("type")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        match self.module() {
            Some(module) if module != "builtins" => format!("<class '{module}.{}'>", self.qualname),
            _ => format!("<class '{}'>", self.qualname),
        }
    }

    fn call(&self, vm: &mut Vm, this: &AnyDynamic, args: Arguments) -> Result<Value, Fault> {
        let class = class_handle(this);
        if self.is_metaclass() || class.ptr_eq(&Class::type_class()) {
            return construct_class(vm, &class, args);
        }
        let instance = if self.is_exception() {
            Instance::exception(class.clone(), args.positional.clone())
        } else {
            Instance::new(class.clone())
        };
        let instance = Value::dynamic(instance);
        if let Some((init, owner)) = Class::lookup_owner(&class, &Symbol::from("__init__")) {
            let init = resolve_attribute(vm, init, Some(&instance), &class, &owner)?;
            let result = init.call(vm, args)?;
            if !result.is_none() {
                return Err(Fault::type_error(format!(
                    "__init__() should return None, not '{}'",
                    result.type_name()
                )));
            }
        }
        trace!(class = %self.name, "instantiated");
        Ok(instance)
    }

    fn get_attr(&self, vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        let class = class_handle(this);
        match name.as_str() {
            "__name__" => return Ok(Value::Str(self.name.clone())),
            "__qualname__" => return Ok(Value::Str(self.qualname.clone())),
            "__bases__" => {
                return Ok(Value::tuple(
                    self.bases.iter().map(Dynamic::to_value).collect(),
                ))
            }
            "__mro__" => {
                let mut mro = vec![class.to_value()];
                mro.extend(self.ancestors.iter().map(Dynamic::to_value));
                return Ok(Value::tuple(mro));
            }
            "__dict__" => return Ok(Value::shared(self.namespace.clone())),
            _ => {}
        }
        if let Some(attribute) = self.lookup(name) {
            return resolve_attribute(vm, attribute, None, &class, &class);
        }
        if let Some((attribute, owner)) = self
            .metaclass
            .as_ref()
            .and_then(|metaclass| Class::lookup_owner(metaclass, name))
        {
            return resolve_attribute(vm, attribute, Some(&class.to_value()), &self.metatype(), &owner);
        }
        match name.as_str() {
            "__module__" => Ok(Value::from("builtins")),
            "__doc__" => Ok(Value::None),
            _ => Err(Fault::error(
                ErrorKind::AttributeError,
                format!("type object '{}' has no attribute '{name}'", self.name),
            )),
        }
    }

    fn set_attr(
        &self,
        _vm: &mut Vm,
        _this: &AnyDynamic,
        name: Symbol,
        value: Value,
    ) -> Result<(), Fault> {
        self.namespace.insert(name, value);
        Ok(())
    }

    fn del_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<(), Fault> {
        self.namespace.remove(name).map(|_| ()).ok_or_else(|| {
            Fault::error(
                ErrorKind::AttributeError,
                format!("type object '{}' has no attribute '{name}'", self.name),
            )
        })
    }
}

/// Applies the descriptor protocol to `attribute` as it is looked up through
/// `receiver` (or the class itself when `receiver` is `None`). `class` is the
/// class the lookup started from and `owner` the class defining `attribute`.
fn resolve_attribute(
    vm: &mut Vm,
    attribute: Value,
    receiver: Option<&Value>,
    class: &Dynamic<Class>,
    owner: &Dynamic<Class>,
) -> Result<Value, Fault> {
    if let Some(method) = attribute.downcast_ref::<StaticMethod>() {
        return Ok(method.0.clone());
    }
    if let Some(method) = attribute.downcast_ref::<ClassMethod>() {
        return Ok(Value::dynamic(Method::bound(
            method.0.clone(),
            class.to_value(),
            None,
        )));
    }
    match receiver {
        Some(receiver) => {
            if let Some(property) = attribute.downcast_ref::<Property>() {
                return property.get(vm, receiver);
            }
            Ok(bind_to(attribute, receiver, Some(owner)))
        }
        None => Ok(attribute),
    }
}

/// An instance of a [`Class`].
#[derive(Debug)]
pub struct Instance {
    class: Dynamic<Class>,
    attributes: Arc<Namespace>,
}

impl Instance {
    /// Returns a new instance of `class` with no attributes.
    #[must_use]
    pub fn new(class: Dynamic<Class>) -> Self {
        Self {
            class,
            attributes: Arc::default(),
        }
    }

    /// Returns a new exception instance of `class` constructed with `args`.
    #[must_use]
    pub fn exception(class: Dynamic<Class>, args: Vec<Value>) -> Self {
        let instance = Self::new(class);
        instance.set_attribute(Symbol::from("args"), Value::tuple(args));
        instance
    }

    /// Returns this instance's class.
    #[must_use]
    pub const fn class(&self) -> &Dynamic<Class> {
        &self.class
    }

    /// Returns the attribute `name` stored on this instance.
    #[must_use]
    pub fn attribute(&self, name: &Symbol) -> Option<Value> {
        self.attributes.get(name)
    }

    /// Stores `value` as the attribute `name` on this instance.
    pub fn set_attribute(&self, name: Symbol, value: Value) {
        self.attributes.insert(name, value);
    }

    /// Returns the arguments an exception instance was constructed with.
    #[must_use]
    pub fn args(&self) -> Vec<Value> {
        self.attribute(&Symbol::from("args"))
            .and_then(|args| args.downcast_ref::<Tuple>().map(|args| args.as_slice().to_vec()))
            .unwrap_or_default()
    }

    fn special(&self, vm: &mut Vm, this: &AnyDynamic, name: &str) -> Result<Option<Value>, Fault> {
        match Class::lookup_owner(&self.class, &Symbol::from(name)) {
            Some((method, owner)) => resolve_attribute(
                vm,
                method,
                Some(&Value::Dynamic(this.clone())),
                &self.class,
                &owner,
            )
            .map(Some),
            None => Ok(None),
        }
    }

    fn call_special(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, Fault> {
        match self.special(vm, this, name)? {
            Some(method) => method.call(vm, Arguments::new(args)).map(Some),
            None => Ok(None),
        }
    }

    fn defines(&self, name: &str) -> bool {
        self.class.lookup(&Symbol::from(name)).is_some()
    }
}

impl CustomType for Instance {
    fn type_name(&self) -> Symbol {
        self.class.name.clone()
    }

    fn repr(&self, this: &AnyDynamic) -> String {
        if self.class.is_exception() {
            let args = self.args();
            let args = match args.as_slice() {
                [arg] => format!("({},)", arg.repr()),
                args => Value::tuple(args.to_vec()).repr(),
            };
            format!("{}{args}", self.class.name)
        } else {
            match self.class.module() {
                Some(module) => format!(
                    "<{module}.{} object at {:#x}>",
                    self.class.qualname,
                    this.address()
                ),
                None => format!("<{} object at {:#x}>", self.class.qualname, this.address()),
            }
        }
    }

    fn display(&self, this: &AnyDynamic) -> String {
        if self.class.is_exception() {
            exception_message(self.class.kind, &self.args())
        } else {
            self.repr(this)
        }
    }

    fn truthy(&self, vm: &mut Vm, this: &AnyDynamic) -> Result<bool, Fault> {
        if let Some(result) = self.call_special(vm, this, "__bool__", Vec::new())? {
            return match result {
                Value::Bool(result) => Ok(result),
                other => Err(Fault::type_error(format!(
                    "__bool__ should return bool, returned {}",
                    other.type_name()
                ))),
            };
        }
        if self.defines("__len__") {
            return Ok(self.len(vm, this)? > 0);
        }
        Ok(true)
    }

    fn hash(&self, this: &AnyDynamic, hasher: &mut ValueHasher) -> Result<(), Fault> {
        if self.defines("__eq__") && !self.class.namespace.contains(&Symbol::from("__hash__")) {
            return Err(Fault::type_error(format!(
                "unhashable type: '{}'",
                self.class.name
            )));
        }
        std::hash::Hash::hash(&this.address(), hasher);
        Ok(())
    }

    fn len(&self, vm: &mut Vm, this: &AnyDynamic) -> Result<usize, Fault> {
        let Some(result) = self.call_special(vm, this, "__len__", Vec::new())? else {
            return Err(Fault::type_error(format!(
                "object of type '{}' has no len()",
                self.class.name
            )));
        };
        match result.as_i64() {
            Some(len) => usize::try_from(len)
                .map_err(|_| Fault::value_error("__len__() should return >= 0")),
            None => Err(Fault::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                result.type_name()
            ))),
        }
    }

    fn call(&self, vm: &mut Vm, this: &AnyDynamic, args: Arguments) -> Result<Value, Fault> {
        match self.special(vm, this, "__call__")? {
            Some(method) => method.call(vm, args),
            None => Err(Fault::type_error(format!(
                "'{}' object is not callable",
                self.class.name
            ))),
        }
    }

    fn get_attr(&self, vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        match name.as_str() {
            "__class__" => return Ok(self.class.to_value()),
            "__dict__" => return Ok(Value::shared(self.attributes.clone())),
            _ => {}
        }
        let receiver = Value::Dynamic(this.clone());
        let class_attribute = Class::lookup_owner(&self.class, name);
        if let Some(property) = class_attribute
            .as_ref()
            .and_then(|(attribute, _)| attribute.downcast_ref::<Property>())
        {
            return property.get(vm, &receiver);
        }
        if let Some(value) = self.attributes.get(name) {
            return Ok(value);
        }
        if let Some((attribute, owner)) = class_attribute {
            return resolve_attribute(vm, attribute, Some(&receiver), &self.class, &owner);
        }
        if let Some(result) =
            self.call_special(vm, this, "__getattr__", vec![Value::Str(name.clone())])?
        {
            return Ok(result);
        }
        Err(Fault::no_attribute(&self.class.name, name))
    }

    fn set_attr(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        name: Symbol,
        value: Value,
    ) -> Result<(), Fault> {
        if let Some(attribute) = self.class.lookup(&name) {
            if let Some(property) = attribute.downcast_ref::<Property>() {
                return property.set(vm, &Value::Dynamic(this.clone()), value);
            }
        }
        self.attributes.insert(name, value);
        Ok(())
    }

    fn del_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<(), Fault> {
        self.attributes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Fault::no_attribute(&self.class.name, name))
    }

    fn get_item(&self, vm: &mut Vm, this: &AnyDynamic, key: &Value) -> Result<Value, Fault> {
        self.call_special(vm, this, "__getitem__", vec![key.clone()])?
            .ok_or_else(|| {
                Fault::type_error(format!(
                    "'{}' object is not subscriptable",
                    self.class.name
                ))
            })
    }

    fn set_item(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        key: Value,
        value: Value,
    ) -> Result<(), Fault> {
        self.call_special(vm, this, "__setitem__", vec![key, value])?
            .map(|_| ())
            .ok_or_else(|| {
                Fault::type_error(format!(
                    "'{}' object does not support item assignment",
                    self.class.name
                ))
            })
    }

    fn del_item(&self, vm: &mut Vm, this: &AnyDynamic, key: &Value) -> Result<(), Fault> {
        self.call_special(vm, this, "__delitem__", vec![key.clone()])?
            .map(|_| ())
            .ok_or_else(|| {
                Fault::type_error(format!(
                    "'{}' object does not support item deletion",
                    self.class.name
                ))
            })
    }

    fn iterate(&self, vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        if let Some(iterator) = self.call_special(vm, this, "__iter__", Vec::new())? {
            return Ok(iterator);
        }
        if self.defines("__getitem__") {
            return Ok(Value::dynamic(GetItemIter {
                target: Value::Dynamic(this.clone()),
                index: Mutex::new(0),
            }));
        }
        Err(Fault::type_error(format!(
            "'{}' object is not iterable",
            self.class.name
        )))
    }

    fn next(&self, vm: &mut Vm, this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        let Some(method) = self.special(vm, this, "__next__")? else {
            return Err(Fault::type_error(format!(
                "'{}' object is not an iterator",
                self.class.name
            )));
        };
        match method.call(vm, Arguments::default()) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_exception(ErrorKind::StopIteration) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn contains(&self, vm: &mut Vm, this: &AnyDynamic, item: &Value) -> Result<bool, Fault> {
        if let Some(result) = self.call_special(vm, this, "__contains__", vec![item.clone()])? {
            return result.truthy(vm);
        }
        let iterator = self.iterate(vm, this).map_err(|_| {
            Fault::type_error(format!(
                "argument of type '{}' is not iterable",
                self.class.name
            ))
        })?;
        while let Some(candidate) = iterator.next(vm)? {
            if candidate.equals(item) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn binary_op(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        let result = self.call_special(vm, this, op.dunder(), vec![rhs.clone()])?;
        Ok(result.filter(|result| !result.is::<NotImplementedType>()))
    }

    fn inplace_op(
        &self,
        vm: &mut Vm,
        this: &AnyDynamic,
        op: BinaryOperator,
        rhs: &Value,
    ) -> Result<Option<Value>, Fault> {
        let name = format!("__i{}", &op.dunder()[2..]);
        match self.call_special(vm, this, &name, vec![rhs.clone()])? {
            Some(result) if !result.is::<NotImplementedType>() => Ok(Some(result)),
            _ => self.binary_op(vm, this, op, rhs),
        }
    }
}

/// Invokes the special method `name` of `value`, if `value` is an instance
/// whose class defines it. `NotImplemented` results are returned as `None`.
pub(crate) fn call_special(
    vm: &mut Vm,
    value: &Value,
    name: &str,
    args: Vec<Value>,
) -> Result<Option<Value>, Fault> {
    let Some(this) = value.as_any_dynamic() else {
        return Ok(None);
    };
    let Some(instance) = this.downcast_ref::<Instance>() else {
        return Ok(None);
    };
    let result = instance.call_special(vm, this, name, args)?;
    Ok(result.filter(|result| !result.is::<NotImplementedType>()))
}

/// Returns true if `value` is an instance whose class defines `name`.
pub(crate) fn defines_special(value: &Value, name: &str) -> bool {
    value
        .downcast_ref::<Instance>()
        .is_some_and(|instance| instance.defines(name))
}

/// Returns `repr(value)`, honoring `__repr__` defined by classes.
pub fn repr_of(vm: &mut Vm, value: &Value) -> Result<String, Fault> {
    match call_special(vm, value, "__repr__", Vec::new())? {
        Some(Value::Str(repr)) => Ok(repr.to_string()),
        Some(other) => Err(Fault::type_error(format!(
            "__repr__ returned non-string (type {})",
            other.type_name()
        ))),
        None => Ok(value.repr()),
    }
}

/// Returns `str(value)`, honoring `__str__` and `__repr__` defined by
/// classes.
pub fn str_of(vm: &mut Vm, value: &Value) -> Result<String, Fault> {
    match call_special(vm, value, "__str__", Vec::new())? {
        Some(Value::Str(text)) => Ok(text.to_string()),
        Some(other) => Err(Fault::type_error(format!(
            "__str__ returned non-string (type {})",
            other.type_name()
        ))),
        None if defines_special(value, "__repr__") => repr_of(vm, value),
        None => Ok(value.to_string()),
    }
}

/// Iterates an object that only supports `__getitem__` by indexing it from
/// zero until it raises `IndexError`.
#[derive(Debug)]
struct GetItemIter {
    target: Value,
    index: Mutex<i64>,
}

impl CustomType for GetItemIter {
    fn type_name(&self) -> Symbol {
        Symbol::from("iterator")
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::Dynamic(this.clone()))
    }

    fn next(&self, vm: &mut Vm, _this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        let index = *self.index.lock();
        match self.target.get_item(vm, &Value::Int(index)) {
            Ok(item) => {
                *self.index.lock() = index + 1;
                Ok(Some(item))
            }
            Err(err)
                if err.is_exception(ErrorKind::IndexError)
                    || err.is_exception(ErrorKind::StopIteration) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// The type of the `NotImplemented` singleton.
#[derive(Debug)]
pub struct NotImplementedType;

impl NotImplementedType {
    /// Returns the `NotImplemented` singleton.
    #[must_use]
    pub fn singleton() -> Value {
        static SINGLETON: OnceLock<Value> = OnceLock::new();
        SINGLETON
            .get_or_init(|| Value::dynamic(NotImplementedType))
            .clone()
    }
}

impl CustomType for NotImplementedType {
    fn type_name(&self) -> Symbol {
        Symbol::from("NotImplementedType")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        String::from("NotImplemented")
    }
}

/// A function that is not bound when looked up, created by
/// `staticmethod()`.
#[derive(Debug)]
pub struct StaticMethod(pub Value);

impl CustomType for StaticMethod {
    fn type_name(&self) -> Symbol {
        Symbol::from("staticmethod")
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        match name.as_str() {
            "__func__" => Ok(self.0.clone()),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }
}

/// A function bound to the class it is looked up on, created by
/// `classmethod()`.
#[derive(Debug)]
pub struct ClassMethod(pub Value);

impl CustomType for ClassMethod {
    fn type_name(&self) -> Symbol {
        Symbol::from("classmethod")
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        match name.as_str() {
            "__func__" => Ok(self.0.clone()),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }
}

/// A computed attribute, created by `property()`.
#[derive(Debug, Clone, Default)]
pub struct Property {
    getter: Option<Value>,
    setter: Option<Value>,
}

impl Property {
    /// Returns a property read through `getter` and assigned through
    /// `setter`.
    #[must_use]
    pub fn new(getter: Option<Value>, setter: Option<Value>) -> Self {
        Self { getter, setter }
    }

    fn get(&self, vm: &mut Vm, receiver: &Value) -> Result<Value, Fault> {
        match &self.getter {
            Some(getter) => getter.call(vm, Arguments::new(vec![receiver.clone()])),
            None => Err(Fault::error(ErrorKind::AttributeError, "unreadable attribute")),
        }
    }

    fn set(&self, vm: &mut Vm, receiver: &Value, value: Value) -> Result<(), Fault> {
        match &self.setter {
            Some(setter) => setter
                .call(vm, Arguments::new(vec![receiver.clone(), value]))
                .map(|_| ()),
            None => Err(Fault::error(ErrorKind::AttributeError, "can't set attribute")),
        }
    }
}

impl CustomType for Property {
    fn type_name(&self) -> Symbol {
        Symbol::from("property")
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        let replace = |setter: bool| {
            let property = self.clone();
            Value::dynamic(NativeFunction::new(
                format!("property.{}", if setter { "setter" } else { "getter" }),
                move |_vm, args| {
                    let [function] = args.exactly(if setter { "setter" } else { "getter" })?;
                    let mut property = property.clone();
                    if setter {
                        property.setter = Some(function);
                    } else {
                        property.getter = Some(function);
                    }
                    Ok(Value::dynamic(property))
                },
            ))
        };
        match name.as_str() {
            "fget" => Ok(self.getter.clone().unwrap_or_default()),
            "fset" => Ok(self.setter.clone().unwrap_or_default()),
            "getter" => Ok(replace(false)),
            "setter" => Ok(replace(true)),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }
}

/// The proxy returned by `super()`, which looks attributes up on the classes
/// following `class` in the receiver's method resolution order.
#[derive(Debug)]
pub struct Super {
    class: Dynamic<Class>,
    receiver: Value,
    start: Dynamic<Class>,
    binds: bool,
}

impl Super {
    /// Implements `super()` and `super(class, receiver)`.
    ///
    /// The zero-argument form reads the `__class__` cell and the first
    /// argument of the calling frame.
    pub fn create(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
        let args = args.between("super", 0, 2)?;
        let (class, receiver) = match <[Value; 2]>::try_from(args) {
            Ok([class, receiver]) => (class, receiver),
            Err(args) if args.is_empty() => {
                let frame = vm
                    .current_frame()
                    .ok_or_else(|| Fault::runtime_error("super(): no current frame"))?;
                let class = frame
                    .cell(&Symbol::from("__class__"))
                    .ok()
                    .and_then(Cell::get)
                    .ok_or_else(|| Fault::runtime_error("super(): __class__ cell not found"))?;
                let first = frame
                    .code()
                    .varnames
                    .first()
                    .filter(|_| frame.code().arg_count > 0)
                    .ok_or_else(|| Fault::runtime_error("super(): no arguments"))?;
                let receiver = frame
                    .locals()
                    .get(first)
                    .or_else(|| frame.cell(first).ok().and_then(Cell::get))
                    .ok_or_else(|| Fault::runtime_error("super(): arg[0] deleted"))?;
                (class, receiver)
            }
            Err(_) => {
                return Err(Fault::type_error(
                    "super() without a receiver is not supported",
                ))
            }
        };
        let class = class
            .as_type::<Class>()
            .ok_or_else(|| Fault::type_error("super() argument 1 must be type"))?;
        let (start, binds) = Self::search_start(&receiver, &class).ok_or_else(|| {
            Fault::type_error("super(type, obj): obj must be an instance or subtype of type")
        })?;
        Ok(Value::dynamic(Super {
            class,
            receiver,
            start,
            binds,
        }))
    }

    /// Returns the class whose method resolution order is searched for
    /// `receiver`, and whether attributes found there bind to it.
    ///
    /// A class receiver is treated as a subtype of `class` when it is one,
    /// and otherwise as an instance of its metaclass.
    fn search_start(receiver: &Value, class: &Dynamic<Class>) -> Option<(Dynamic<Class>, bool)> {
        if let Some(instance) = receiver.downcast_ref::<Instance>() {
            return Class::is_subclass(instance.class(), class)
                .then(|| (instance.class().clone(), true));
        }
        let receiver = receiver.as_type::<Class>()?;
        if Class::is_subclass(&receiver, class) {
            Some((receiver, false))
        } else {
            let metatype = receiver.metatype();
            Class::is_subclass(&metatype, class).then_some((metatype, true))
        }
    }
}

impl CustomType for Super {
    fn type_name(&self) -> Symbol {
        Symbol::from("super")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        format!(
            "<super: <class '{}'>, <{} object>>",
            self.class.name,
            self.receiver.type_name()
        )
    }

    fn get_attr(&self, vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        let mut mro = std::iter::once(self.start.clone())
            .chain(self.start.ancestors.iter().cloned())
            .skip_while(|class| !class.ptr_eq(&self.class))
            .skip(1);
        let attribute =
            mro.find_map(|class| class.namespace.get(name).map(|attribute| (attribute, class)));
        match attribute {
            Some((attribute, owner)) => {
                let receiver = self.binds.then_some(&self.receiver);
                resolve_attribute(vm, attribute, receiver, &self.start, &owner)
            }
            None => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }
}

/// Implements `__build_class__(body, name, *bases, metaclass=None, **kwds)`.
///
/// The metaclass is the `metaclass` keyword, or the type of the first base.
/// When it is a class, the most derived metaclass of it and every base's
/// type is used instead. Its `__prepare__`, if any, provides the namespace
/// the body runs in, and calling it with `(name, bases, namespace)` creates
/// the class.
pub(crate) fn build_class(vm: &mut Vm, mut args: Arguments) -> Result<Value, Fault> {
    let explicit = args.take_keyword("metaclass");
    let keywords = std::mem::take(&mut args.keywords);
    let mut positional = args.positional.into_iter();
    let body = positional
        .next()
        .and_then(|body| body.as_type::<Function>())
        .ok_or_else(|| Fault::type_error("__build_class__: func must be a function"))?;
    let name = positional
        .next()
        .and_then(|name| name.as_symbol().cloned())
        .ok_or_else(|| Fault::type_error("__build_class__: name is not a string"))?;
    let bases = class_bases(positional)?;

    let metaclass = explicit.unwrap_or_else(|| {
        bases
            .first()
            .map_or_else(Class::type_class, |base| base.metatype())
            .to_value()
    });
    let metaclass = match as_metatype(&metaclass) {
        Some(metatype) => calculate_metaclass(metatype, &bases)?.to_value(),
        None => metaclass,
    };
    let bases_tuple = Value::tuple(bases.iter().map(Dynamic::to_value).collect());

    let prepare = match metaclass.as_type::<Class>() {
        Some(metatype) => Class::lookup_owner(&metatype, &Symbol::from("__prepare__"))
            .map(|(prepare, owner)| resolve_attribute(vm, prepare, None, &metatype, &owner))
            .transpose()?,
        None => match metaclass.get_attr(vm, &Symbol::from("__prepare__")) {
            Ok(prepare) => Some(prepare),
            Err(err) if err.is_exception(ErrorKind::AttributeError) => None,
            Err(err) => return Err(err),
        },
    };
    let namespace = match prepare {
        Some(prepare) => {
            let prepared = prepare.call(
                vm,
                Arguments {
                    positional: vec![Value::Str(name.clone()), bases_tuple.clone()],
                    keywords: keywords.clone(),
                },
            )?;
            prepared_namespace(&prepared)?
        }
        None => Arc::new(Namespace::default()),
    };
    namespace.insert(
        Symbol::from("__module__"),
        body.globals()
            .get(&Symbol::from("__name__"))
            .unwrap_or_default(),
    );
    namespace.insert(
        Symbol::from("__qualname__"),
        Value::Str(body.qualname().clone()),
    );
    let returned = vm.run_class_body(&body, namespace.clone())?;
    let cell = namespace
        .remove(&Symbol::from("__classcell__"))
        .or(Some(returned))
        .and_then(|cell| cell.downcast_ref::<Cell>().cloned());
    debug!(class = %name, bases = bases.len(), metaclass = %metaclass.repr(), "building class");
    let class = metaclass.call(
        vm,
        Arguments {
            positional: vec![Value::Str(name), bases_tuple, Value::shared(namespace)],
            keywords,
        },
    )?;
    if let Some(cell) = cell {
        cell.set(class.clone());
    }
    Ok(class)
}

/// Converts base class values, treating the builtin `type` as the `type`
/// class so that metaclasses can derive from it.
fn class_bases(bases: impl IntoIterator<Item = Value>) -> Result<Vec<Dynamic<Class>>, Fault> {
    bases
        .into_iter()
        .map(|base| {
            as_metatype(&base).ok_or_else(|| {
                Fault::type_error(format!("bases must be classes, not {}", base.type_name()))
            })
        })
        .collect()
}

/// Returns `value` as a class usable as a metaclass: a class, or the builtin
/// `type`.
fn as_metatype(value: &Value) -> Option<Dynamic<Class>> {
    if let Some(class) = value.as_type::<Class>() {
        return Some(class);
    }
    value
        .downcast_ref::<BuiltinType>()
        .filter(|builtin| builtin.name() == "type")
        .map(|_| Class::type_class())
}

/// Returns the most derived of `metaclass` and the types of `bases`.
fn calculate_metaclass(
    metaclass: Dynamic<Class>,
    bases: &[Dynamic<Class>],
) -> Result<Dynamic<Class>, Fault> {
    let mut winner = metaclass;
    for base in bases {
        let metatype = base.metatype();
        if Class::is_subclass(&metatype, &winner) {
            winner = metatype;
        } else if !Class::is_subclass(&winner, &metatype) {
            return Err(Fault::type_error(
                "metaclass conflict: the metaclass of a derived class must be a (non-strict) \
                 subclass of the metaclasses of all its bases",
            ));
        }
    }
    Ok(winner)
}

/// Copies the mapping returned by `__prepare__` into a class namespace.
fn prepared_namespace(prepared: &Value) -> Result<Arc<Namespace>, Fault> {
    let namespace = Namespace::default();
    if let Some(dict) = prepared.downcast_ref::<Dict>() {
        for (key, value) in dict.pairs() {
            let key = key
                .as_symbol()
                .cloned()
                .ok_or_else(|| Fault::type_error("class namespace keys must be str"))?;
            namespace.insert(key, value);
        }
    } else if let Some(existing) = prepared.downcast_ref::<Namespace>() {
        for (key, value) in existing.pairs() {
            namespace.insert(key, value);
        }
    } else {
        return Err(Fault::type_error(format!(
            "__prepare__() must return a mapping, not {}",
            prepared.type_name()
        )));
    }
    Ok(Arc::new(namespace))
}

/// Calls `metaclass` to create a class: its `__new__` creates it, and its
/// `__init__` initializes it when the result is an instance of `metaclass`.
fn construct_class(
    vm: &mut Vm,
    metaclass: &Dynamic<Class>,
    args: Arguments,
) -> Result<Value, Fault> {
    let type_class = Class::type_class();
    let mut new_args = args.clone();
    new_args.prepend(metaclass.to_value());
    let created = match Class::lookup_owner(metaclass, &Symbol::from("__new__")) {
        Some((new, owner)) if !owner.ptr_eq(&type_class) => new.call(vm, new_args)?,
        _ => type_new(vm, new_args)?,
    };
    if Class::has_instance(metaclass, &created) {
        if let Some((init, owner)) = Class::lookup_owner(metaclass, &Symbol::from("__init__"))
            .filter(|(_, owner)| !owner.ptr_eq(&type_class))
        {
            let init = resolve_attribute(vm, init, Some(&created), metaclass, &owner)?;
            let result = init.call(vm, args)?;
            if !result.is_none() {
                return Err(Fault::type_error(format!(
                    "__init__() should return None, not '{}'",
                    result.type_name()
                )));
            }
        }
    }
    Ok(created)
}

/// Implements `type.__new__(metaclass, name, bases, namespace)`.
fn type_new(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [metaclass, name, bases, namespace] = args.exactly("type.__new__")?;
    let metaclass = as_metatype(&metaclass)
        .ok_or_else(|| Fault::type_error("type.__new__(X): X is not a type object"))?;
    let name = name
        .as_symbol()
        .cloned()
        .ok_or_else(|| Fault::type_error("type.__new__() argument 1 must be str"))?;
    let bases = bases
        .downcast_ref::<Tuple>()
        .ok_or_else(|| Fault::type_error("type.__new__() argument 2 must be tuple"))?
        .as_slice()
        .to_vec();
    let bases = class_bases(bases)?;
    let namespace = prepared_namespace(&namespace)?;
    let qualname = namespace
        .get(&Symbol::from("__qualname__"))
        .and_then(|qualname| qualname.as_symbol().cloned())
        .unwrap_or_else(|| name.clone());
    let class = Class::new(name, qualname, bases, namespace)?.with_metaclass(metaclass);
    Ok(Dynamic::new(class).to_value())
}

/// A builtin type such as `int` or `list`: callable to convert or construct
/// values, and usable with `isinstance()`.
#[derive(Debug)]
pub struct BuiltinType {
    name: Symbol,
    construct: Option<fn(&mut Vm, Arguments) -> Result<Value, Fault>>,
}

impl BuiltinType {
    /// Returns a builtin type named `name` that constructs values with
    /// `construct`.
    #[must_use]
    pub fn new(
        name: impl Into<Symbol>,
        construct: fn(&mut Vm, Arguments) -> Result<Value, Fault>,
    ) -> Self {
        Self {
            name: name.into(),
            construct: Some(construct),
        }
    }

    /// Returns a builtin type whose instances cannot be created directly.
    #[must_use]
    pub fn opaque(name: impl Into<Symbol>) -> Self {
        Self {
            name: name.into(),
            construct: None,
        }
    }

    /// Returns the type name.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns true if `value` is an instance of this type.
    #[must_use]
    pub fn contains_instance(&self, value: &Value) -> bool {
        match self.name.as_str() {
            "object" => true,
            "int" => matches!(value, Value::Int(_) | Value::Bool(_)),
            "type" => value.is::<Class>() || value.is::<BuiltinType>(),
            name => value.type_name() == name,
        }
    }
}

impl CustomType for BuiltinType {
    fn type_name(&self) -> Symbol {
        Symbol::from("type")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        format!("<class '{}'>", self.name)
    }

    fn call(&self, vm: &mut Vm, _this: &AnyDynamic, args: Arguments) -> Result<Value, Fault> {
        match self.construct {
            Some(construct) => construct(vm, args),
            None => Err(Fault::type_error(format!(
                "cannot create '{}' instances",
                self.name
            ))),
        }
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        match name.as_str() {
            "__name__" | "__qualname__" => Ok(Value::Str(self.name.clone())),
            "__module__" => Ok(Value::from("builtins")),
            _ => Err(Fault::error(
                ErrorKind::AttributeError,
                format!("type object '{}' has no attribute '{name}'", self.name),
            )),
        }
    }
}
