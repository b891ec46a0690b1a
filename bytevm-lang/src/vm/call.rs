//! Call arguments and binding them to a function's parameters.

use std::sync::Arc;

use crate::runtime::map::Dict;
use crate::runtime::namespace::Namespace;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{Dynamic, Value};
use crate::vm::frame::Frame;
use crate::vm::function::Function;
use crate::vm::generator::Generator;
use crate::vm::{Fault, FrameExit, Vm};

/// The positional and keyword arguments of a call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Arguments {
    /// Positional arguments, in order.
    pub positional: Vec<Value>,
    /// Keyword arguments, in the order they were passed.
    pub keywords: Vec<(Symbol, Value)>,
}

impl Arguments {
    /// Returns arguments consisting of `positional` only.
    #[must_use]
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    /// Adds a keyword argument.
    #[must_use]
    pub fn with_keyword(mut self, name: impl Into<Symbol>, value: impl Into<Value>) -> Self {
        self.keywords.push((name.into(), value.into()));
        self
    }

    /// Inserts `value` as the first positional argument.
    pub fn prepend(&mut self, value: Value) {
        self.positional.insert(0, value);
    }

    /// Returns true if there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    /// Returns the keyword argument `name`, if passed.
    #[must_use]
    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords
            .iter()
            .find_map(|(keyword, value)| (keyword == name).then_some(value))
    }

    /// Removes and returns the keyword argument `name`, if passed.
    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        let index = self.keywords.iter().position(|(keyword, _)| keyword == name)?;
        Some(self.keywords.remove(index).1)
    }

    /// Returns an error if any keyword arguments were passed to `function`.
    pub fn no_keywords(&self, function: &str) -> Result<(), Fault> {
        if self.keywords.is_empty() {
            Ok(())
        } else {
            Err(Fault::type_error(format!(
                "{function}() takes no keyword arguments"
            )))
        }
    }

    /// Returns exactly `N` positional arguments, with no keywords.
    pub fn exactly<const N: usize>(self, function: &str) -> Result<[Value; N], Fault> {
        self.no_keywords(function)?;
        let given = self.positional.len();
        <[Value; N]>::try_from(self.positional).map_err(|_| {
            let expected = match N {
                0 => String::from("no arguments"),
                1 => String::from("exactly one argument"),
                n => format!("exactly {n} arguments"),
            };
            Fault::type_error(format!("{function}() takes {expected} ({given} given)"))
        })
    }

    /// Returns between `min` and `max` positional arguments, with no
    /// keywords.
    pub fn between(self, function: &str, min: usize, max: usize) -> Result<Vec<Value>, Fault> {
        self.no_keywords(function)?;
        let given = self.positional.len();
        if given < min {
            Err(Fault::type_error(format!(
                "{function} expected at least {min} argument{}, got {given}",
                plural(min)
            )))
        } else if given > max {
            Err(Fault::type_error(format!(
                "{function} expected at most {max} argument{}, got {given}",
                plural(max)
            )))
        } else {
            Ok(self.positional)
        }
    }
}

impl From<Vec<Value>> for Arguments {
    fn from(positional: Vec<Value>) -> Self {
        Self::new(positional)
    }
}

/// Combines explicitly passed keyword pairs with those unpacked from a
/// mapping. Explicit pairs take precedence.
pub(crate) fn merge_keywords(
    explicit: Vec<(Symbol, Value)>,
    unpacked: Vec<(Symbol, Value)>,
) -> Vec<(Symbol, Value)> {
    let mut merged = explicit;
    for (name, value) in unpacked {
        if !merged.iter().any(|(existing, _)| *existing == name) {
            merged.push((name, value));
        }
    }
    merged
}

impl Vm {
    /// Binds `args` to `function`'s parameters and runs it, or returns a
    /// generator if its code is a generator.
    pub(crate) fn call_function_object(
        &mut self,
        function: &Function,
        args: Arguments,
    ) -> Result<Value, Fault> {
        let locals = bind(function, args)?;
        let frame = Frame::new(
            function.code().clone(),
            function.globals().clone(),
            Arc::new(locals),
            self.builtins().clone(),
            function.closure(),
        )?;
        if function.is_generator() {
            return Ok(Value::dynamic(Generator::new(
                frame,
                function.name().clone(),
                function.qualname().clone(),
            )));
        }
        match self.run_frame(frame)? {
            FrameExit::Returned(value, _) => Ok(value),
            FrameExit::Yielded(..) => Err(Fault::UnexpectedYield),
        }
    }

    /// Runs a class body function with `namespace` as its locals, returning
    /// the value the body returns.
    pub(crate) fn run_class_body(
        &mut self,
        body: &Function,
        namespace: Arc<Namespace>,
    ) -> Result<Value, Fault> {
        let frame = Frame::new(
            body.code().clone(),
            body.globals().clone(),
            namespace,
            self.builtins().clone(),
            body.closure(),
        )?;
        match self.run_frame(frame)? {
            FrameExit::Returned(value, _) => Ok(value),
            FrameExit::Yielded(..) => Err(Fault::UnexpectedYield),
        }
    }
}

/// Binds `args` to the parameters of `function`, returning the initial local
/// namespace of its frame.
pub(crate) fn bind(function: &Function, args: Arguments) -> Result<Namespace, Fault> {
    let code = function.code();
    let name = &code.name;
    let arg_count = code.arg_count as usize;
    let parameter_count = code.parameter_count();
    let parameters = code.varnames.get(..parameter_count).ok_or(Fault::InvalidOperand)?;
    let locals = Namespace::default();

    let extra_keywords = match code.varkeywords_name() {
        Some(kwargs) => {
            let dict = Dynamic::new(Dict::default());
            locals.insert(kwargs.clone(), dict.to_value());
            Some(dict)
        }
        None => None,
    };

    let Arguments {
        mut positional,
        keywords,
    } = args;
    let given = positional.len();
    let extra_positional = positional.split_off(given.min(arg_count));
    for (parameter, value) in parameters.iter().zip(positional) {
        locals.insert(parameter.clone(), value);
    }
    if let Some(varargs) = code.varargs_name() {
        locals.insert(varargs.clone(), Value::tuple(extra_positional));
    } else if !extra_positional.is_empty() {
        return Err(too_many_positional(function, given));
    }

    for (keyword, value) in keywords {
        match parameters.iter().position(|parameter| *parameter == keyword) {
            Some(_) if locals.contains(&keyword) => {
                return Err(Fault::type_error(format!(
                    "{name}() got multiple values for argument '{keyword}'"
                )));
            }
            Some(_) => {
                locals.insert(keyword, value);
            }
            None => match &extra_keywords {
                Some(dict) => {
                    dict.insert(Value::Str(keyword), value)?;
                }
                None => {
                    return Err(Fault::type_error(format!(
                        "{name}() got an unexpected keyword argument '{keyword}'"
                    )));
                }
            },
        }
    }

    let defaults = function.defaults();
    let first_default = arg_count.saturating_sub(defaults.len());
    let mut missing = Vec::new();
    for (index, parameter) in parameters[..arg_count].iter().enumerate() {
        if locals.contains(parameter) {
            continue;
        }
        match index.checked_sub(first_default) {
            Some(default) => {
                locals.insert(parameter.clone(), defaults[default].clone());
            }
            None => missing.push(parameter),
        }
    }
    if !missing.is_empty() {
        return Err(missing_arguments(name, "positional", &missing));
    }

    for parameter in &parameters[arg_count..] {
        if locals.contains(parameter) {
            continue;
        }
        match function
            .kwdefaults()
            .iter()
            .find_map(|(name, value)| (name == parameter).then_some(value))
        {
            Some(default) => {
                locals.insert(parameter.clone(), default.clone());
            }
            None => missing.push(parameter),
        }
    }
    if !missing.is_empty() {
        return Err(missing_arguments(name, "keyword-only", &missing));
    }

    Ok(locals)
}

fn too_many_positional(function: &Function, given: usize) -> Fault {
    let code = function.code();
    let arg_count = code.arg_count as usize;
    let defaults = function.defaults().len().min(arg_count);
    let takes = if defaults > 0 {
        format!("from {} to {arg_count}", arg_count - defaults)
    } else {
        arg_count.to_string()
    };
    let plural_takes = if defaults == 0 && arg_count == 1 {
        ""
    } else {
        "s"
    };
    let was = if given == 1 { "was" } else { "were" };
    Fault::type_error(format!(
        "{}() takes {takes} positional argument{plural_takes} but {given} {was} given",
        code.name
    ))
}

fn missing_arguments(function: &Symbol, kind: &str, missing: &[&Symbol]) -> Fault {
    let quoted = missing
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>();
    let names = match quoted.as_slice() {
        [only] => only.clone(),
        [first, second] => format!("{first} and {second}"),
        [leading @ .., last] => format!("{}, and {last}", leading.join(", ")),
        [] => String::new(),
    };
    Fault::type_error(format!(
        "{function}() missing {} required {kind} argument{}: {names}",
        missing.len(),
        plural(missing.len())
    ))
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}
