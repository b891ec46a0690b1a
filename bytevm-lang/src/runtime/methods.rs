//! Tables of host-implemented methods for the builtin types.

use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;
use crate::vm::call::Arguments;
use crate::vm::function::NativeFunction;
use crate::vm::{Fault, Vm};

/// A method implemented by the host for receivers of type `R`.
pub type Method<R> = fn(&mut Vm, &R, Arguments) -> Result<Value, Fault>;

/// A static list of named methods for one builtin type.
///
/// Looking a method up produces a native function that has already captured
/// its receiver, the same way a bound method would.
pub struct MethodTable<R: 'static> {
    type_name: &'static str,
    methods: &'static [(&'static str, Method<R>)],
}

impl<R> MethodTable<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Returns a table of `methods` for the type named `type_name`.
    #[must_use]
    pub const fn new(type_name: &'static str, methods: &'static [(&'static str, Method<R>)]) -> Self {
        Self { type_name, methods }
    }

    /// Returns the names of every method in this table.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.iter().map(|(name, _)| *name)
    }

    /// Returns the method `name` bound to `receiver`.
    #[must_use]
    pub fn lookup(&self, receiver: &R, name: &Symbol) -> Option<Value> {
        let (name, method) = self
            .methods
            .iter()
            .find(|(method_name, _)| *method_name == name.as_str())?;
        let method = *method;
        let receiver = receiver.clone();
        trace!(type_name = self.type_name, method = name, "binding builtin method");
        Some(Value::dynamic(NativeFunction::new(
            format!("{}.{name}", self.type_name),
            move |vm, args| method(vm, &receiver, args),
        )))
    }
}
