//! Callable values: interpreted functions, bound methods and native
//! functions, plus the cells closures share.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::code::{Code, CodeFlags, Constant};
use crate::runtime::namespace::Namespace;
use crate::runtime::symbol::Symbol;
use crate::runtime::types::Class;
use crate::runtime::value::{AnyDynamic, CustomType, Dynamic, Value};
use crate::vm::call::Arguments;
use crate::vm::{Fault, Vm};

/// A mutable slot shared between a frame and the closures created in it.
#[derive(Clone, Default)]
pub struct Cell(Arc<Mutex<Option<Value>>>);

impl Cell {
    /// Returns a cell holding `value`.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(Arc::new(Mutex::new(Some(value))))
    }

    /// Returns the contents, or `None` if the cell is empty.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.0.lock().clone()
    }

    /// Replaces the contents.
    pub fn set(&self, value: Value) {
        *self.0.lock() = Some(value);
    }

    /// Empties the cell, returning the previous contents.
    pub fn clear(&self) -> Option<Value> {
        self.0.lock().take()
    }

    /// Returns true if both handles refer to the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<cell at {:#x}>", self.address())
    }
}

impl CustomType for Cell {
    fn type_name(&self) -> Symbol {
        Symbol::from("cell")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        match self.get() {
            Some(value) => format!(
                "<cell at {:#x}: {} object>",
                self.address(),
                value.type_name()
            ),
            None => format!("<cell at {:#x}: empty>", self.address()),
        }
    }

    fn equals(&self, other: &Value) -> bool {
        other.downcast_ref::<Cell>().is_some_and(|other| self.ptr_eq(other))
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        match name.as_str() {
            "cell_contents" => self
                .get()
                .ok_or_else(|| Fault::value_error("Cell is empty")),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }
}

/// A function defined by interpreted code.
pub struct Function {
    name: Symbol,
    qualname: Symbol,
    code: Code,
    globals: Arc<Namespace>,
    defaults: Vec<Value>,
    kwdefaults: Vec<(Symbol, Value)>,
    closure: Vec<Cell>,
    annotations: Value,
    attributes: Namespace,
}

impl Function {
    /// Returns a function executing `code` with `globals` as its global
    /// namespace.
    #[must_use]
    pub fn new(code: Code, globals: Arc<Namespace>) -> Self {
        Self {
            name: code.name.clone(),
            qualname: code.name.clone(),
            code,
            globals,
            defaults: Vec::new(),
            kwdefaults: Vec::new(),
            closure: Vec::new(),
            annotations: Value::None,
            attributes: Namespace::default(),
        }
    }

    /// Sets the qualified name.
    #[must_use]
    pub fn with_qualname(mut self, qualname: impl Into<Symbol>) -> Self {
        self.qualname = qualname.into();
        self
    }

    /// Sets the default values of the trailing positional parameters.
    #[must_use]
    pub fn with_defaults(mut self, defaults: Vec<Value>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Sets the default values of keyword-only parameters.
    #[must_use]
    pub fn with_kwdefaults(mut self, kwdefaults: Vec<(Symbol, Value)>) -> Self {
        self.kwdefaults = kwdefaults;
        self
    }

    /// Sets the cells bound to the code's free variables.
    #[must_use]
    pub fn with_closure(mut self, closure: Vec<Cell>) -> Self {
        self.closure = closure;
        self
    }

    /// Sets the annotations dictionary.
    #[must_use]
    pub fn with_annotations(mut self, annotations: Value) -> Self {
        self.annotations = annotations;
        self
    }

    /// Returns the function's name.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns the function's qualified name.
    #[must_use]
    pub const fn qualname(&self) -> &Symbol {
        &self.qualname
    }

    /// Returns the code this function executes.
    #[must_use]
    pub const fn code(&self) -> &Code {
        &self.code
    }

    /// Returns the function's global namespace.
    #[must_use]
    pub const fn globals(&self) -> &Arc<Namespace> {
        &self.globals
    }

    /// Returns the positional parameter defaults.
    #[must_use]
    pub fn defaults(&self) -> &[Value] {
        &self.defaults
    }

    /// Returns the keyword-only parameter defaults.
    #[must_use]
    pub fn kwdefaults(&self) -> &[(Symbol, Value)] {
        &self.kwdefaults
    }

    /// Returns the cells bound to the code's free variables.
    #[must_use]
    pub fn closure(&self) -> &[Cell] {
        &self.closure
    }

    /// Returns true if calling this function creates a generator.
    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.code.flags.contains(CodeFlags::GENERATOR)
    }
}

impl Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("qualname", &self.qualname)
            .field("code", &self.code)
            .field("defaults", &self.defaults)
            .field("closure", &self.closure)
            .finish_non_exhaustive()
    }
}

impl CustomType for Function {
    fn type_name(&self) -> Symbol {
        Symbol::from("function")
    }

    fn repr(&self, this: &AnyDynamic) -> String {
        format!("<function {} at {:#x}>", self.qualname, this.address())
    }

    fn call(&self, vm: &mut Vm, _this: &AnyDynamic, args: Arguments) -> Result<Value, Fault> {
        vm.call_function_object(self, args)
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        Ok(match name.as_str() {
            "__name__" => Value::Str(self.name.clone()),
            "__qualname__" => Value::Str(self.qualname.clone()),
            "__code__" => Value::dynamic(self.code.clone()),
            "__globals__" => Value::shared(self.globals.clone()),
            "__module__" => self
                .globals
                .get(&Symbol::from("__name__"))
                .unwrap_or_default(),
            "__defaults__" if self.defaults.is_empty() => Value::None,
            "__defaults__" => Value::tuple(self.defaults.clone()),
            "__kwdefaults__" if self.kwdefaults.is_empty() => Value::None,
            "__kwdefaults__" => Value::dynamic(crate::runtime::map::Dict::from_pairs(
                self.kwdefaults
                    .iter()
                    .map(|(name, value)| (Value::Str(name.clone()), value.clone())),
            )?),
            "__closure__" if self.closure.is_empty() => Value::None,
            "__closure__" => Value::tuple(
                self.closure
                    .iter()
                    .map(|cell| Value::dynamic(cell.clone()))
                    .collect(),
            ),
            "__annotations__" => self.annotations.clone(),
            "__doc__" => match self.code.constants.first() {
                Some(Constant::Str(doc)) => Value::Str(doc.clone()),
                _ => Value::None,
            },
            _ => self
                .attributes
                .get(name)
                .ok_or_else(|| Fault::no_attribute(&self.type_name(), name))?,
        })
    }

    fn set_attr(
        &self,
        _vm: &mut Vm,
        _this: &AnyDynamic,
        name: Symbol,
        value: Value,
    ) -> Result<(), Fault> {
        self.attributes.insert(name, value);
        Ok(())
    }

    fn del_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<(), Fault> {
        self.attributes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Fault::no_attribute(&self.type_name(), name))
    }
}

/// A function paired with the receiver it was looked up on and, for methods
/// found on a class, the class that declares it.
#[derive(Debug)]
pub struct Method {
    function: Value,
    receiver: Value,
    class: Option<Dynamic<Class>>,
}

impl Method {
    /// Returns `function` bound to `receiver`. When `class` is provided,
    /// the receiver must be an instance of it when the method is called.
    #[must_use]
    pub fn bound(function: Value, receiver: Value, class: Option<Dynamic<Class>>) -> Self {
        Self {
            function,
            receiver,
            class,
        }
    }

    /// Returns the underlying function.
    #[must_use]
    pub const fn function(&self) -> &Value {
        &self.function
    }

    /// Returns the bound receiver.
    #[must_use]
    pub const fn receiver(&self) -> &Value {
        &self.receiver
    }

    /// Returns the class declaring this method, if it was found on one.
    #[must_use]
    pub const fn class(&self) -> Option<&Dynamic<Class>> {
        self.class.as_ref()
    }

    fn function_name(&self) -> String {
        if let Some(function) = self.function.downcast_ref::<Function>() {
            function.qualname().to_string()
        } else if let Some(native) = self.function.downcast_ref::<NativeFunction>() {
            native.name().to_string()
        } else {
            self.function.repr()
        }
    }

    fn check_receiver(&self) -> Result<(), Fault> {
        let Some(class) = &self.class else {
            return Ok(());
        };
        if Class::has_instance(class, &self.receiver) {
            Ok(())
        } else {
            Err(Fault::type_error(format!(
                "{}() must be called with {} instance as first argument (got {} instance instead)",
                self.function_name(),
                class.name(),
                self.receiver.type_name(),
            )))
        }
    }
}

impl CustomType for Method {
    fn type_name(&self) -> Symbol {
        Symbol::from("method")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        format!(
            "<bound method {} of {}>",
            self.function_name(),
            self.receiver.repr()
        )
    }

    fn equals(&self, other: &Value) -> bool {
        other.downcast_ref::<Method>().is_some_and(|other| {
            self.function.identical(&other.function) && self.receiver.identical(&other.receiver)
        })
    }

    fn call(&self, vm: &mut Vm, _this: &AnyDynamic, mut args: Arguments) -> Result<Value, Fault> {
        self.check_receiver()?;
        args.prepend(self.receiver.clone());
        self.function.call(vm, args)
    }

    fn get_attr(&self, vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        match name.as_str() {
            "__self__" => Ok(self.receiver.clone()),
            "__func__" => Ok(self.function.clone()),
            _ => self.function.get_attr(vm, name),
        }
    }
}

/// The signature of a [`NativeFunction`].
pub type NativeFn = dyn Fn(&mut Vm, Arguments) -> Result<Value, Fault> + Send + Sync;

/// A function implemented by the host.
#[derive(Clone)]
pub struct NativeFunction {
    name: Symbol,
    binds: bool,
    function: Arc<NativeFn>,
}

impl NativeFunction {
    /// Returns a native function that is not bound when looked up on an
    /// instance.
    pub fn new<F>(name: impl Into<Symbol>, function: F) -> Self
    where
        F: Fn(&mut Vm, Arguments) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            binds: false,
            function: Arc::new(function),
        }
    }

    /// Returns a native function that receives the instance it was looked
    /// up on as its first argument.
    pub fn method<F>(name: impl Into<Symbol>, function: F) -> Self
    where
        F: Fn(&mut Vm, Arguments) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        Self {
            binds: true,
            ..Self::new(name, function)
        }
    }

    /// Returns the function's name.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns true if this function binds to instances.
    #[must_use]
    pub const fn binds(&self) -> bool {
        self.binds
    }

    /// Invokes this function.
    pub fn invoke(&self, vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
        (self.function)(vm, args)
    }
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("binds", &self.binds)
            .finish_non_exhaustive()
    }
}

impl CustomType for NativeFunction {
    fn type_name(&self) -> Symbol {
        Symbol::from("builtin_function_or_method")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        format!("<built-in function {}>", self.name)
    }

    fn call(&self, vm: &mut Vm, _this: &AnyDynamic, args: Arguments) -> Result<Value, Fault> {
        self.invoke(vm, args)
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        match name.as_str() {
            "__name__" | "__qualname__" => Ok(Value::Str(self.name.clone())),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }
}

/// Returns `attribute` bound to `receiver` if it is a function that binds to
/// instances, otherwise returns it unchanged.
pub(crate) fn bind_to(
    attribute: Value,
    receiver: &Value,
    class: Option<&Dynamic<Class>>,
) -> Value {
    let binds = attribute.is::<Function>()
        || attribute
            .downcast_ref::<NativeFunction>()
            .is_some_and(NativeFunction::binds);
    if binds {
        Value::dynamic(Method::bound(attribute, receiver.clone(), class.cloned()))
    } else {
        attribute
    }
}
