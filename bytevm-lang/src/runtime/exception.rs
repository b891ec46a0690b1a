//! The builtin exception hierarchy, exception triples and tracebacks.

use std::fmt::{Display, Write};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::runtime::list::Tuple;
use crate::runtime::symbol::Symbol;
use crate::runtime::types::{Class, Instance};
use crate::runtime::value::{AnyDynamic, CustomType, Dynamic, Value};
use crate::vm::call::Arguments;
use crate::vm::frame::Frame;
use crate::vm::{Fault, Vm};

macro_rules! error_kinds {
    ($($kind:ident => $parent:expr),+ $(,)?) => {
        /// A builtin exception class.
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
        pub enum ErrorKind {
            $(
                #[allow(missing_docs)]
                $kind,
            )+
        }

        impl ErrorKind {
            /// Every builtin exception class, each listed after its base.
            pub const ALL: &'static [ErrorKind] = &[$(ErrorKind::$kind),+];

            /// Returns the class name.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(ErrorKind::$kind => stringify!($kind),)+
                }
            }

            /// Returns the base class, or `None` for `BaseException`.
            #[must_use]
            pub const fn parent(self) -> Option<ErrorKind> {
                match self {
                    $(ErrorKind::$kind => $parent,)+
                }
            }
        }
    };
}

error_kinds!(
    BaseException => None,
    SystemExit => Some(ErrorKind::BaseException),
    KeyboardInterrupt => Some(ErrorKind::BaseException),
    GeneratorExit => Some(ErrorKind::BaseException),
    Exception => Some(ErrorKind::BaseException),
    StopIteration => Some(ErrorKind::Exception),
    ArithmeticError => Some(ErrorKind::Exception),
    FloatingPointError => Some(ErrorKind::ArithmeticError),
    OverflowError => Some(ErrorKind::ArithmeticError),
    ZeroDivisionError => Some(ErrorKind::ArithmeticError),
    AssertionError => Some(ErrorKind::Exception),
    AttributeError => Some(ErrorKind::Exception),
    EOFError => Some(ErrorKind::Exception),
    ImportError => Some(ErrorKind::Exception),
    ModuleNotFoundError => Some(ErrorKind::ImportError),
    LookupError => Some(ErrorKind::Exception),
    IndexError => Some(ErrorKind::LookupError),
    KeyError => Some(ErrorKind::LookupError),
    MemoryError => Some(ErrorKind::Exception),
    NameError => Some(ErrorKind::Exception),
    UnboundLocalError => Some(ErrorKind::NameError),
    OSError => Some(ErrorKind::Exception),
    RuntimeError => Some(ErrorKind::Exception),
    NotImplementedError => Some(ErrorKind::RuntimeError),
    RecursionError => Some(ErrorKind::RuntimeError),
    SyntaxError => Some(ErrorKind::Exception),
    SystemError => Some(ErrorKind::Exception),
    TypeError => Some(ErrorKind::Exception),
    ValueError => Some(ErrorKind::Exception),
    UnicodeError => Some(ErrorKind::ValueError),
);

impl ErrorKind {
    /// Returns true if this class is `kind` or derives from it.
    #[must_use]
    pub fn is_subclass_of(self, kind: ErrorKind) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if class == kind {
                return true;
            }
            current = class.parent();
        }
        false
    }

    /// Returns the class object for this exception.
    ///
    /// Builtin exception classes are shared by every virtual machine in the
    /// process.
    #[must_use]
    pub fn class(self) -> Dynamic<Class> {
        static CLASSES: OnceLock<Vec<Dynamic<Class>>> = OnceLock::new();
        let classes = CLASSES.get_or_init(|| {
            let mut classes: Vec<Dynamic<Class>> = Vec::with_capacity(ErrorKind::ALL.len());
            for kind in ErrorKind::ALL {
                let bases = kind
                    .parent()
                    .and_then(|parent| ErrorKind::ALL.iter().position(|k| *k == parent))
                    .map(|index| vec![classes[index].clone()])
                    .unwrap_or_default();
                classes.push(Dynamic::new(Class::builtin_exception(*kind, bases)));
            }
            classes
        });
        let index = ErrorKind::ALL
            .iter()
            .position(|kind| *kind == self)
            .expect("every kind is listed");
        classes[index].clone()
    }

    /// Returns the builtin exception class named `name`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        ErrorKind::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The class, instance and traceback of an exception, as the interpreter
/// stores them on the operand stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionTriple {
    /// The exception's class, or `None`.
    pub kind: Value,
    /// The exception instance, or `None`.
    pub value: Value,
    /// The exception's [`Traceback`], or `None`.
    pub traceback: Value,
}

impl ExceptionTriple {
    /// Returns the triple pushed when no exception is being handled.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            kind: Value::None,
            value: Value::None,
            traceback: Value::None,
        }
    }

    /// Returns a triple for a freshly raised `instance`. Its traceback
    /// continues any traceback it carried from a previous raise.
    #[must_use]
    pub fn new(instance: &Dynamic<Instance>) -> Self {
        let traceback = instance
            .attribute(&Symbol::from("__traceback__"))
            .filter(|traceback| traceback.is::<Traceback>())
            .unwrap_or_else(|| Value::dynamic(Traceback::default()));
        Self {
            kind: instance.class().to_value(),
            value: instance.to_value(),
            traceback,
        }
    }

    /// Returns an instance of the builtin exception `kind` constructed with
    /// `args`.
    #[must_use]
    pub fn builtin(kind: ErrorKind, args: Vec<Value>) -> Self {
        let instance = Dynamic::new(Instance::exception(kind.class(), args));
        Self::new(&instance)
    }

    /// Resolves the operands of a `raise` statement into a triple.
    ///
    /// `exception` may be an exception class, which is instantiated with no
    /// arguments, or an exception instance. `cause` is the operand of a
    /// `from` clause, if one was present.
    pub fn raise(vm: &mut Vm, exception: Value, cause: Option<Value>) -> Result<Self, Fault> {
        let instance = instantiate(vm, exception)
            .ok_or_else(|| Fault::type_error("exceptions must derive from BaseException"))??;
        if let Some(cause) = cause {
            let cause = if cause.is_none() {
                Value::None
            } else {
                instantiate(vm, cause)
                    .ok_or_else(|| {
                        Fault::type_error("exception causes must derive from BaseException")
                    })??
                    .to_value()
            };
            instance.set_attribute(Symbol::from("__cause__"), cause);
            instance.set_attribute(Symbol::from("__suppress_context__"), Value::Bool(true));
        }
        Ok(Self::new(&instance))
    }

    /// Returns the exception instance.
    #[must_use]
    pub fn instance(&self) -> Option<Dynamic<Instance>> {
        self.value.as_type::<Instance>()
    }

    /// Returns the exception class.
    #[must_use]
    pub fn class(&self) -> Option<Dynamic<Class>> {
        self.kind.as_type::<Class>()
    }

    /// Returns true if the exception is an instance of the builtin class
    /// `kind` or one of its subclasses.
    #[must_use]
    pub fn is_instance_of(&self, kind: ErrorKind) -> bool {
        self.class()
            .is_some_and(|class| Class::is_subclass(&class, &kind.class()))
    }

    /// Returns the first argument the exception was constructed with.
    #[must_use]
    pub fn first_arg(&self) -> Option<Value> {
        self.instance()?.args().first().cloned()
    }

    /// Returns the value a `StopIteration` carries.
    #[must_use]
    pub fn stop_iteration_value(&self) -> Value {
        self.instance()
            .and_then(|instance| instance.attribute(&Symbol::from("value")))
            .or_else(|| self.first_arg())
            .unwrap_or_default()
    }

    /// Records `handled` as the exception that was being handled when this
    /// exception was raised.
    pub fn set_context(&self, handled: &ExceptionTriple) {
        let Some(instance) = self.instance() else {
            return;
        };
        if handled.value.is_none() || handled.value.identical(&self.value) {
            return;
        }
        instance.set_attribute(Symbol::from("__context__"), handled.value.clone());
    }

    /// Returns this triple with `entry` recorded as the outermost frame the
    /// exception has propagated through.
    #[must_use]
    pub fn with_entry(self, entry: TracebackEntry) -> Self {
        let mut entries = vec![entry];
        if let Some(existing) = self.traceback.downcast_ref::<Traceback>() {
            entries.extend(existing.entries.iter().cloned());
        }
        let traceback = Value::dynamic(Traceback { entries });
        if let Some(instance) = self.instance() {
            instance.set_attribute(Symbol::from("__traceback__"), traceback.clone());
        }
        Self { traceback, ..self }
    }

    /// Returns the traceback entries, outermost first.
    #[must_use]
    pub fn entries(&self) -> &[TracebackEntry] {
        self.traceback
            .downcast_ref::<Traceback>()
            .map_or(&[], |traceback| &traceback.entries)
    }

    /// Formats this exception the way an uncaught exception is reported,
    /// including any chained cause or context.
    #[must_use]
    pub fn format(&self) -> String {
        let mut report = String::new();
        self.format_into(&mut report, 0);
        report
    }

    fn format_into(&self, report: &mut String, depth: usize) {
        if let Some(instance) = self.instance().filter(|_| depth < 16) {
            let chained = |name: &str| {
                instance
                    .attribute(&Symbol::from(name))
                    .and_then(|value| value.as_type::<Instance>())
                    .map(|instance| ExceptionTriple::new(&instance))
            };
            let suppress = instance
                .attribute(&Symbol::from("__suppress_context__"))
                .is_some_and(|value| matches!(value, Value::Bool(true)));
            if let Some(cause) = chained("__cause__") {
                cause.format_into(report, depth + 1);
                report.push_str(
                    "\nThe above exception was the direct cause of the following exception:\n\n",
                );
            } else if let Some(context) = chained("__context__").filter(|_| !suppress) {
                context.format_into(report, depth + 1);
                report.push_str(
                    "\nDuring handling of the above exception, another exception occurred:\n\n",
                );
            }
        }
        if !self.entries().is_empty() {
            report.push_str("Traceback (most recent call last):\n");
            for entry in self.entries() {
                let _ = writeln!(report, "  {entry}");
            }
        }
        let _ = writeln!(report, "{self}");
    }
}

impl Display for ExceptionTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.class() {
            Some(class) => class.name().clone(),
            None => self.kind.type_name(),
        };
        let message = self.value.to_string();
        if message.is_empty() {
            f.write_str(&name)
        } else {
            write!(f, "{name}: {message}")
        }
    }
}

/// Instantiates `exception` if it is an exception class, or returns it if it
/// is already an exception instance.
fn instantiate(vm: &mut Vm, exception: Value) -> Option<Result<Dynamic<Instance>, Fault>> {
    if let Some(class) = exception.downcast_ref::<Class>() {
        if !class.is_exception() {
            return None;
        }
        return Some(
            exception
                .call(vm, Arguments::default())
                .and_then(|instance| {
                    instance
                        .as_type::<Instance>()
                        .filter(|instance| instance.class().is_exception())
                        .ok_or_else(|| {
                            Fault::type_error(format!(
                                "calling {} should have returned an instance of BaseException, not {}",
                                exception.repr(),
                                instance.type_name()
                            ))
                        })
                }),
        );
    }
    exception
        .as_type::<Instance>()
        .filter(|instance| instance.class().is_exception())
        .map(Ok)
}

/// One frame an exception propagated through.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TracebackEntry {
    /// The name of the frame's code.
    pub name: Symbol,
    /// The file the frame's code was compiled from.
    pub filename: Symbol,
    /// The line being executed, if known.
    pub line: Option<u32>,
    /// The offset of the instruction being executed.
    pub offset: usize,
}

impl TracebackEntry {
    /// Returns an entry for the instruction `frame` last executed.
    #[must_use]
    pub fn for_frame(frame: &Frame) -> Self {
        Self {
            name: frame.code().name.clone(),
            filename: frame.code().filename.clone(),
            line: frame.line(),
            offset: frame.last_offset(),
        }
    }
}

impl Display for TracebackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "File \"{}\", ", self.filename)?;
        match self.line {
            Some(line) => write!(f, "line {line}, ")?,
            None => write!(f, "offset {}, ", self.offset)?,
        }
        write!(f, "in {}", self.name)
    }
}

/// The frames an exception has propagated through, outermost first.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Traceback {
    entries: Vec<TracebackEntry>,
}

impl Traceback {
    /// Returns the recorded entries, outermost first.
    #[must_use]
    pub fn entries(&self) -> &[TracebackEntry] {
        &self.entries
    }
}

impl CustomType for Traceback {
    fn type_name(&self) -> Symbol {
        Symbol::from("traceback")
    }

    fn equals(&self, other: &Value) -> bool {
        other.downcast_ref::<Traceback>() == Some(self)
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        let innermost = self.entries.last();
        match name.as_str() {
            "tb_lineno" => Ok(innermost
                .and_then(|entry| entry.line)
                .map(Value::from)
                .unwrap_or_default()),
            "tb_lasti" => innermost.map_or(Ok(Value::None), |entry| Value::try_from(entry.offset)),
            "tb_next" => Ok(if self.entries.len() > 1 {
                Value::dynamic(Traceback {
                    entries: self.entries[1..].to_vec(),
                })
            } else {
                Value::None
            }),
            _ => Err(Fault::no_attribute(&self.type_name(), name)),
        }
    }
}

impl Fault {
    /// Converts a language-level fault into an exception triple. Internal
    /// faults are returned unchanged.
    pub(crate) fn into_triple(self) -> Result<ExceptionTriple, Fault> {
        match self {
            Fault::Raised(triple) => Ok(triple),
            Fault::StopIteration(value) | Fault::Error(ErrorKind::StopIteration, value) => {
                let args = if value.is_none() {
                    Vec::new()
                } else {
                    vec![value.clone()]
                };
                let triple = ExceptionTriple::builtin(ErrorKind::StopIteration, args);
                if let Some(instance) = triple.instance() {
                    instance.set_attribute(Symbol::from("value"), value);
                }
                Ok(triple)
            }
            Fault::Error(kind, arg) => Ok(ExceptionTriple::builtin(kind, vec![arg])),
            internal => Err(internal),
        }
    }
}

/// Returns the `str()` of an exception constructed with `args`.
pub(crate) fn exception_message(kind: Option<ErrorKind>, args: &[Value]) -> String {
    match args {
        [] => String::new(),
        [key] if kind.is_some_and(|kind| kind.is_subclass_of(ErrorKind::KeyError)) => key.repr(),
        [arg] => arg.to_string(),
        args => Value::dynamic(Tuple::from(args.to_vec())).repr(),
    }
}
