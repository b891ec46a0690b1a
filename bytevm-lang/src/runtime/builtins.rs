//! The `builtins` namespace shared by every frame of a virtual machine.

use std::sync::Arc;

use crate::code::opcode::BinaryOperator;
use crate::runtime::exception::ErrorKind;
use crate::runtime::iter::{Enumerate, Filter, MapIter, Range, SequenceIter, Zip};
use crate::runtime::list::{sort_values, List, Slice, Tuple};
use crate::runtime::map::{Dict, Set};
use crate::runtime::namespace::Namespace;
use crate::runtime::operators::less_than;
use crate::runtime::string;
use crate::runtime::symbol::Symbol;
use crate::runtime::types::{
    build_class, call_special, repr_of, str_of, BuiltinType, Class, ClassMethod, Instance,
    NotImplementedType, Property, StaticMethod, Super,
};
use crate::runtime::value::{Number, Value};
use crate::vm::call::Arguments;
use crate::vm::function::{Function, Method, NativeFunction};
use crate::vm::generator::Generator;
use crate::vm::{Fault, Vm};

type Builtin = fn(&mut Vm, Arguments) -> Result<Value, Fault>;

const FUNCTIONS: &[(&str, Builtin)] = &[
    ("print", print),
    ("len", len),
    ("repr", repr),
    ("ascii", ascii),
    ("format", format),
    ("iter", iter),
    ("next", next),
    ("isinstance", isinstance),
    ("issubclass", issubclass),
    ("getattr", getattr),
    ("setattr", setattr),
    ("hasattr", hasattr),
    ("delattr", delattr),
    ("callable", callable),
    ("abs", abs),
    ("min", min),
    ("max", max),
    ("sum", sum),
    ("sorted", sorted),
    ("reversed", reversed),
    ("enumerate", enumerate),
    ("zip", zip),
    ("map", map),
    ("filter", filter),
    ("any", any),
    ("all", all),
    ("round", round),
    ("divmod", divmod),
    ("pow", pow),
    ("hex", hex),
    ("oct", oct),
    ("bin", bin),
    ("chr", chr),
    ("ord", ord),
    ("hash", hash),
    ("id", id),
    ("globals", globals),
    ("locals", locals),
    ("vars", vars),
    ("super", Super::create),
    ("__build_class__", build_class),
    ("__import__", import),
];

const TYPES: &[(&str, Builtin)] = &[
    ("type", type_of),
    ("int", int),
    ("float", float),
    ("bool", bool),
    ("str", str),
    ("tuple", tuple),
    ("list", list),
    ("dict", dict),
    ("set", set),
    ("range", range),
    ("slice", slice),
    ("property", property),
    ("staticmethod", staticmethod),
    ("classmethod", classmethod),
];

/// Returns a new builtins namespace.
#[must_use]
pub fn namespace() -> Namespace {
    let namespace = Namespace::default();
    for (name, function) in FUNCTIONS {
        namespace.insert(
            Symbol::from(*name),
            Value::dynamic(NativeFunction::new(*name, *function)),
        );
    }
    for (name, construct) in TYPES {
        namespace.insert(
            Symbol::from(*name),
            Value::dynamic(BuiltinType::new(*name, *construct)),
        );
    }
    for name in ["NoneType", "function", "builtin_function_or_method", "generator"] {
        namespace.insert(Symbol::from(name), Value::dynamic(BuiltinType::opaque(name)));
    }
    namespace.insert(Symbol::from("object"), Class::object().to_value());
    namespace.insert(
        Symbol::from("NotImplemented"),
        NotImplementedType::singleton(),
    );
    for kind in ErrorKind::ALL {
        namespace.insert(Symbol::from(kind.name()), kind.class().to_value());
    }
    namespace
}

fn print(vm: &mut Vm, mut args: Arguments) -> Result<Value, Fault> {
    let separator = optional_str(args.take_keyword("sep"), " ", "sep")?;
    let end = optional_str(args.take_keyword("end"), "\n", "end")?;
    args.take_keyword("file");
    args.take_keyword("flush");
    args.no_keywords("print")?;
    let mut line = String::new();
    for (index, value) in args.positional.iter().enumerate() {
        if index > 0 {
            line.push_str(&separator);
        }
        line.push_str(&str_of(vm, value)?);
    }
    line.push_str(&end);
    vm.write_output(&line)?;
    Ok(Value::None)
}

fn optional_str(value: Option<Value>, default: &str, name: &str) -> Result<String, Fault> {
    match value {
        None | Some(Value::None) => Ok(default.to_string()),
        Some(Value::Str(value)) => Ok(value.to_string()),
        Some(other) => Err(Fault::type_error(format!(
            "{name} must be None or a string, not {}",
            other.type_name()
        ))),
    }
}

fn len(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [value] = args.exactly("len")?;
    Value::try_from(value.len(vm)?)
}

fn repr(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [value] = args.exactly("repr")?;
    repr_of(vm, &value).map(Value::from)
}

fn ascii(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [value] = args.exactly("ascii")?;
    Ok(Value::from(string::ascii(&repr_of(vm, &value)?)))
}

fn format(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let mut args = args.between("format", 1, 2)?.into_iter();
    let value = args.next().unwrap_or_default();
    let spec = args.next().unwrap_or_else(|| Value::from(""));
    let Some(spec_text) = spec.as_str() else {
        return Err(Fault::type_error(format!(
            "format() argument 2 must be str, not {}",
            spec.type_name()
        )));
    };
    if let Some(formatted) = call_special(vm, &value, "__format__", vec![spec.clone()])? {
        return Ok(formatted);
    }
    if spec_text.is_empty() {
        return str_of(vm, &value).map(Value::from);
    }
    string::format_value(&value, spec_text).map(Value::from)
}

fn iter(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [iterable] = args.exactly("iter")?;
    iterable.iterate(vm)
}

fn next(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let mut args = args.between("next", 1, 2)?.into_iter();
    let iterator = args.next().unwrap_or_default();
    if let Some(generator) = iterator.downcast_ref::<Generator>() {
        return match (generator.send(vm, Value::None), args.next()) {
            (Err(Fault::StopIteration(_)), Some(default)) => Ok(default),
            (result, _) => result,
        };
    }
    match iterator.next(vm)? {
        Some(value) => Ok(value),
        None => match args.next() {
            Some(default) => Ok(default),
            None => Err(Fault::StopIteration(Value::None)),
        },
    }
}

/// Returns true if `value` is an instance of `class_info`, a class, builtin
/// type, or tuple of either.
fn instance_of(value: &Value, class_info: &Value, function: &str) -> Result<bool, Fault> {
    if let Some(class) = class_info.as_type::<Class>() {
        return Ok(Class::has_instance(&class, value));
    }
    if let Some(builtin) = class_info.downcast_ref::<BuiltinType>() {
        return Ok(builtin.contains_instance(value));
    }
    if let Some(classes) = class_info.downcast_ref::<Tuple>() {
        for class_info in classes.as_slice() {
            if instance_of(value, class_info, function)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    Err(Fault::type_error(format!(
        "{function}() arg 2 must be a type or tuple of types"
    )))
}

fn isinstance(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [value, class_info] = args.exactly("isinstance")?;
    instance_of(&value, &class_info, "isinstance").map(Value::Bool)
}

fn subclass_of(class: &Value, class_info: &Value) -> Result<bool, Fault> {
    if let Some(classes) = class_info.downcast_ref::<Tuple>() {
        for class_info in classes.as_slice() {
            if subclass_of(class, class_info)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    match (
        class.as_type::<Class>(),
        class.downcast_ref::<BuiltinType>(),
        class_info.as_type::<Class>(),
        class_info.downcast_ref::<BuiltinType>(),
    ) {
        (Some(class), _, Some(base), _) => Ok(Class::is_subclass(&class, &base)),
        (_, Some(_), Some(base), _) => Ok(base.ptr_eq(&Class::object())),
        (_, Some(class), _, Some(base)) => Ok(class.name() == base.name()
            || (class.name() == "bool" && base.name() == "int")
            || base.name() == "object"),
        (Some(class), _, _, Some(base)) => {
            Ok(base.name() == "object" || (base.name() == "type" && class.is_metaclass()))
        }
        (None, None, _, _) => Err(Fault::type_error("issubclass() arg 1 must be a class")),
        _ => Err(Fault::type_error(
            "issubclass() arg 2 must be a class or tuple of classes",
        )),
    }
}

fn issubclass(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [class, class_info] = args.exactly("issubclass")?;
    subclass_of(&class, &class_info).map(Value::Bool)
}

fn attribute_name(name: &Value, function: &str) -> Result<Symbol, Fault> {
    name.as_symbol().cloned().ok_or_else(|| {
        Fault::type_error(format!("{function}(): attribute name must be string"))
    })
}

fn getattr(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let mut args = args.between("getattr", 2, 3)?.into_iter();
    let target = args.next().unwrap_or_default();
    let name = attribute_name(&args.next().unwrap_or_default(), "getattr")?;
    match (target.get_attr(vm, &name), args.next()) {
        (Err(err), Some(default)) if err.is_exception(ErrorKind::AttributeError) => Ok(default),
        (result, _) => result,
    }
}

fn setattr(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [target, name, value] = args.exactly("setattr")?;
    target.set_attr(vm, attribute_name(&name, "setattr")?, value)?;
    Ok(Value::None)
}

fn hasattr(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [target, name] = args.exactly("hasattr")?;
    match target.get_attr(vm, &attribute_name(&name, "hasattr")?) {
        Ok(_) => Ok(Value::Bool(true)),
        Err(err) if err.is_exception(ErrorKind::AttributeError) => Ok(Value::Bool(false)),
        Err(err) => Err(err),
    }
}

fn delattr(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [target, name] = args.exactly("delattr")?;
    target.del_attr(vm, &attribute_name(&name, "delattr")?)?;
    Ok(Value::None)
}

fn callable(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [value] = args.exactly("callable")?;
    let callable = value.is::<Function>()
        || value.is::<NativeFunction>()
        || value.is::<Method>()
        || value.is::<Class>()
        || value.is::<BuiltinType>()
        || value
            .downcast_ref::<Instance>()
            .is_some_and(|instance| instance.class().lookup(&Symbol::from("__call__")).is_some());
    Ok(Value::Bool(callable))
}

fn abs(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [value] = args.exactly("abs")?;
    match value.number() {
        Some(Number::Int(value)) => value.checked_abs().map(Value::Int).ok_or_else(Fault::overflow),
        Some(Number::Float(value)) => Ok(Value::Float(value.abs())),
        None => call_special(vm, &value, "__abs__", Vec::new())?.ok_or_else(|| {
            Fault::type_error(format!(
                "bad operand type for abs(): '{}'",
                value.type_name()
            ))
        }),
    }
}

fn extreme(vm: &mut Vm, mut args: Arguments, function: &str, want_less: bool) -> Result<Value, Fault> {
    let key = args.take_keyword("key").filter(|key| !key.is_none());
    let default = args.take_keyword("default");
    args.no_keywords(function)?;
    let candidates = match args.positional.len() {
        0 => {
            return Err(Fault::type_error(format!(
                "{function} expected 1 arguments, got 0"
            )))
        }
        1 => {
            let iterable = args.positional.pop().unwrap_or_default();
            iterable.collect(vm)?
        }
        _ if default.is_some() => {
            return Err(Fault::type_error(format!(
                "Cannot specify a default for {function}() with multiple positional arguments"
            )))
        }
        _ => args.positional,
    };
    let mut best: Option<(Value, Value)> = None;
    for candidate in candidates {
        let rank = match &key {
            Some(key) => key.call(vm, Arguments::new(vec![candidate.clone()]))?,
            None => candidate.clone(),
        };
        let replace = match &best {
            None => true,
            Some((_, best_rank)) if want_less => less_than(vm, &rank, best_rank)?,
            Some((_, best_rank)) => less_than(vm, best_rank, &rank)?,
        };
        if replace {
            best = Some((candidate, rank));
        }
    }
    match (best, default) {
        (Some((best, _)), _) => Ok(best),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(Fault::value_error(format!(
            "{function}() arg is an empty sequence"
        ))),
    }
}

fn min(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    extreme(vm, args, "min", true)
}

fn max(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    extreme(vm, args, "max", false)
}

fn sum(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let mut args = args.between("sum", 1, 2)?.into_iter();
    let iterable = args.next().unwrap_or_default();
    let mut total = args.next().unwrap_or(Value::Int(0));
    if total.as_str().is_some() {
        return Err(Fault::type_error(
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    for item in iterable.collect(vm)? {
        total = BinaryOperator::Add.apply(vm, &total, &item)?;
    }
    Ok(total)
}

fn sorted(vm: &mut Vm, mut args: Arguments) -> Result<Value, Fault> {
    let key = args.take_keyword("key");
    let reverse = match args.take_keyword("reverse") {
        Some(reverse) => reverse.truthy(vm)?,
        None => false,
    };
    let [iterable] = args.exactly("sorted")?;
    let items = iterable.collect(vm)?;
    Ok(Value::list(sort_values(vm, items, key.as_ref(), reverse)?))
}

fn reversed(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [sequence] = args.exactly("reversed")?;
    if let Some(iterator) = call_special(vm, &sequence, "__reversed__", Vec::new())? {
        return Ok(iterator);
    }
    if sequence.is::<Set>() || sequence.is::<Dict>() || sequence.is::<Generator>() {
        return Err(Fault::type_error(format!(
            "'{}' object is not reversible",
            sequence.type_name()
        )));
    }
    let mut items = sequence.collect(vm)?;
    items.reverse();
    Ok(Value::dynamic(SequenceIter::new(items)))
}

fn enumerate(vm: &mut Vm, mut args: Arguments) -> Result<Value, Fault> {
    let start = args.take_keyword("start");
    let mut positional = args.between("enumerate", 1, 2)?.into_iter();
    let iterable = positional.next().unwrap_or_default();
    let start = match start.or_else(|| positional.next()) {
        Some(start) => start.as_i64().ok_or_else(|| {
            Fault::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                start.type_name()
            ))
        })?,
        None => 0,
    };
    let iterator = iterable.iterate(vm)?;
    Ok(Value::dynamic(Enumerate::new(iterator, start)))
}

fn zip(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    args.no_keywords("zip")?;
    let iterators = args
        .positional
        .iter()
        .map(|iterable| iterable.iterate(vm))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::dynamic(Zip::new(iterators)))
}

fn map(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    args.no_keywords("map")?;
    let mut positional = args.positional.into_iter();
    let function = positional.next().unwrap_or_default();
    let iterators = positional
        .map(|iterable| iterable.iterate(vm))
        .collect::<Result<Vec<_>, _>>()?;
    if iterators.is_empty() {
        return Err(Fault::type_error("map() must have at least two arguments."));
    }
    Ok(Value::dynamic(MapIter::new(function, iterators)))
}

fn filter(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [predicate, iterable] = args.exactly("filter")?;
    let iterator = iterable.iterate(vm)?;
    Ok(Value::dynamic(Filter::new(predicate, iterator)))
}

fn any(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [iterable] = args.exactly("any")?;
    let iterator = iterable.iterate(vm)?;
    while let Some(item) = iterator.next(vm)? {
        if item.truthy(vm)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn all(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [iterable] = args.exactly("all")?;
    let iterator = iterable.iterate(vm)?;
    while let Some(item) = iterator.next(vm)? {
        if !item.truthy(vm)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

/// Rounds half-way cases to the nearest even integer.
fn round_half_even(value: f64) -> f64 {
    let rounded = value.round();
    if (value - value.trunc()).abs() == 0.5 {
        2. * (value / 2.).round()
    } else {
        rounded
    }
}

fn round(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let mut args = args.between("round", 1, 2)?.into_iter();
    let value = args.next().unwrap_or_default();
    let digits = args.next().filter(|digits| !digits.is_none());
    match (value.number(), digits) {
        (Some(Number::Int(value)), _) => Ok(Value::Int(value)),
        (Some(Number::Float(value)), None) => {
            if !value.is_finite() {
                return Err(if value.is_nan() {
                    Fault::value_error("cannot convert float NaN to integer")
                } else {
                    Fault::error(
                        ErrorKind::OverflowError,
                        "cannot convert float infinity to integer",
                    )
                });
            }
            float_to_int(round_half_even(value))
        }
        (Some(Number::Float(value)), Some(digits)) => {
            let digits = digits.as_i64().ok_or_else(|| {
                Fault::type_error(format!(
                    "'{}' object cannot be interpreted as an integer",
                    digits.type_name()
                ))
            })?;
            let digits = i32::try_from(digits).map_err(|_| Fault::overflow())?;
            let scale = 10_f64.powi(digits);
            Ok(Value::Float(round_half_even(value * scale) / scale))
        }
        (None, _) => Err(Fault::type_error(format!(
            "type {} doesn't define __round__ method",
            value.type_name()
        ))),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn float_to_int(value: f64) -> Result<Value, Fault> {
    if value.is_nan() {
        return Err(Fault::value_error("cannot convert float NaN to integer"));
    }
    if value.is_infinite() {
        return Err(Fault::error(
            ErrorKind::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    let truncated = value.trunc();
    if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return Err(Fault::overflow());
    }
    Ok(Value::Int(truncated as i64))
}

fn divmod(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [lhs, rhs] = args.exactly("divmod")?;
    let quotient = BinaryOperator::FloorDivide.apply(vm, &lhs, &rhs)?;
    let remainder = BinaryOperator::Modulo.apply(vm, &lhs, &rhs)?;
    Ok(Value::tuple(vec![quotient, remainder]))
}

fn pow(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("pow", 2, 3)?;
    match args.as_slice() {
        [base, exponent] => BinaryOperator::Power.apply(vm, base, exponent),
        [base, exponent, modulus] => {
            let (Some(base), Some(exponent), Some(modulus)) =
                (base.as_i64(), exponent.as_i64(), modulus.as_i64())
            else {
                return Err(Fault::type_error(
                    "pow() 3rd argument not allowed unless all arguments are integers",
                ));
            };
            if exponent < 0 {
                return Err(Fault::value_error(
                    "pow() 2nd argument cannot be negative when 3rd argument specified",
                ));
            }
            if modulus == 0 {
                return Err(Fault::value_error("pow() 3rd argument cannot be 0"));
            }
            let modulus = i128::from(modulus);
            let mut result = 1_i128;
            let mut base = i128::from(base).rem_euclid(modulus);
            let mut exponent = exponent;
            while exponent > 0 {
                if exponent & 1 == 1 {
                    result = result * base % modulus;
                }
                base = base * base % modulus;
                exponent >>= 1;
            }
            if result != 0 && (result < 0) != (modulus < 0) {
                result += modulus;
            }
            i64::try_from(result)
                .map(Value::Int)
                .map_err(|_| Fault::overflow())
        }
        _ => Err(Fault::InvalidOperand),
    }
}

fn radix(args: Arguments, function: &str, prefix: &str) -> Result<Value, Fault> {
    let [value] = args.exactly(function)?;
    let Some(number) = value.as_i64() else {
        return Err(Fault::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        )));
    };
    let magnitude = number.unsigned_abs();
    let digits = match prefix {
        "0x" => format!("{magnitude:x}"),
        "0o" => format!("{magnitude:o}"),
        _ => format!("{magnitude:b}"),
    };
    let sign = if number < 0 { "-" } else { "" };
    Ok(Value::from(format!("{sign}{prefix}{digits}")))
}

fn hex(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    radix(args, "hex", "0x")
}

fn oct(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    radix(args, "oct", "0o")
}

fn bin(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    radix(args, "bin", "0b")
}

fn chr(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [code] = args.exactly("chr")?;
    let ch = code
        .as_i64()
        .and_then(|code| u32::try_from(code).ok())
        .and_then(char::from_u32)
        .ok_or_else(|| Fault::value_error("chr() arg not in range(0x110000)"))?;
    Ok(Value::from(ch.to_string()))
}

fn ord(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [text] = args.exactly("ord")?;
    let Some(text) = text.as_str() else {
        return Err(Fault::type_error(format!(
            "ord() expected string of length 1, but {} found",
            text.type_name()
        )));
    };
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Ok(Value::from(u32::from(ch))),
        _ => Err(Fault::type_error(format!(
            "ord() expected a character, but string of length {} found",
            text.chars().count()
        ))),
    }
}

fn hash(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [value] = args.exactly("hash")?;
    if let Some(hash) = call_special(vm, &value, "__hash__", Vec::new())? {
        return Ok(hash);
    }
    #[allow(clippy::cast_possible_wrap)]
    let hash = value.hash()? as i64;
    Ok(Value::Int(hash))
}

fn id(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [value] = args.exactly("id")?;
    match value.as_any_dynamic() {
        Some(dynamic) => Value::try_from(dynamic.address()),
        #[allow(clippy::cast_possible_wrap)]
        None => Ok(Value::Int(value.hash()? as i64)),
    }
}

fn globals(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    args.exactly::<0>("globals")?;
    let frame = vm
        .current_frame()
        .ok_or_else(|| Fault::runtime_error("globals(): no current frame"))?;
    Ok(Value::shared(frame.globals().clone()))
}

fn locals(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    args.exactly::<0>("locals")?;
    let frame = vm
        .current_frame()
        .ok_or_else(|| Fault::runtime_error("locals(): no current frame"))?;
    Ok(Value::shared(frame.locals().clone()))
}

fn vars(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("vars", 0, 1)?;
    match args.into_iter().next() {
        Some(target) => target
            .get_attr(vm, &Symbol::from("__dict__"))
            .map_err(|_| Fault::type_error("vars() argument must have __dict__ attribute")),
        None => locals(vm, Arguments::default()),
    }
}

fn import(vm: &mut Vm, mut args: Arguments) -> Result<Value, Fault> {
    let fromlist = args.take_keyword("fromlist");
    let level = args.take_keyword("level");
    let mut positional = args.between("__import__", 1, 5)?.into_iter();
    let name = positional
        .next()
        .and_then(|name| name.as_symbol().cloned())
        .ok_or_else(|| Fault::type_error("__import__() argument 1 must be str"))?;
    let _globals = positional.next();
    let _locals = positional.next();
    let fromlist = fromlist.or_else(|| positional.next()).unwrap_or_default();
    let level = match level.or_else(|| positional.next()) {
        Some(level) => level
            .as_usize()
            .ok_or_else(|| Fault::value_error("level must be >= 0"))?,
        None => 0,
    };
    vm.import_name(&name, &fromlist, level)
}

fn type_of(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    args.no_keywords("type")?;
    match args.positional.as_slice() {
        [value] => {
            if let Some(instance) = value.downcast_ref::<Instance>() {
                return Ok(instance.class().to_value());
            }
            if let Some(metaclass) = value.downcast_ref::<Class>().and_then(Class::metaclass) {
                return Ok(metaclass.to_value());
            }
            let name = value.type_name();
            match vm.builtins().get(&name) {
                Some(builtin) if builtin.downcast_ref::<BuiltinType>().is_some_and(|builtin| builtin.name() == &name) => {
                    Ok(builtin)
                }
                _ => Ok(Value::dynamic(BuiltinType::opaque(name))),
            }
        }
        [name, bases, namespace] => {
            let name = name
                .as_symbol()
                .cloned()
                .ok_or_else(|| Fault::type_error("type() argument 1 must be str"))?;
            let bases = bases
                .downcast_ref::<Tuple>()
                .ok_or_else(|| Fault::type_error("type() argument 2 must be tuple"))?
                .as_slice()
                .iter()
                .map(|base| {
                    base.as_type::<Class>()
                        .ok_or_else(|| Fault::type_error("bases must be classes"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let dict = namespace
                .downcast_ref::<Dict>()
                .ok_or_else(|| Fault::type_error("type() argument 3 must be dict"))?;
            let attributes = Namespace::default();
            for (key, value) in dict.pairs() {
                let key = key
                    .as_symbol()
                    .cloned()
                    .ok_or_else(|| Fault::type_error("attribute names must be str"))?;
                attributes.insert(key, value);
            }
            let class = Class::new(name.clone(), name, bases, Arc::new(attributes))?;
            Ok(Value::dynamic(class))
        }
        _ => Err(Fault::type_error("type() takes 1 or 3 arguments")),
    }
}

fn int(vm: &mut Vm, mut args: Arguments) -> Result<Value, Fault> {
    let base = args.take_keyword("base");
    let mut positional = args.between("int", 0, 2)?.into_iter();
    let value = positional.next();
    let base = base.or_else(|| positional.next());
    let Some(value) = value else {
        return Ok(Value::Int(0));
    };
    if let Some(base) = base {
        let Some(text) = value.as_str() else {
            return Err(Fault::type_error(
                "int() can't convert non-string with explicit base",
            ));
        };
        let radix = base
            .as_i64()
            .and_then(|base| u32::try_from(base).ok())
            .filter(|base| (2..=36).contains(base))
            .ok_or_else(|| Fault::value_error("int() base must be >= 2 and <= 36"))?;
        return parse_int(text, radix);
    }
    match &value {
        Value::Int(_) => Ok(value),
        Value::Bool(value) => Ok(Value::Int(i64::from(*value))),
        Value::Float(value) => float_to_int(*value),
        Value::Str(text) => parse_int(text, 10),
        _ => call_special(vm, &value, "__int__", Vec::new())?.ok_or_else(|| {
            Fault::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                value.type_name()
            ))
        }),
    }
}

fn parse_int(text: &str, radix: u32) -> Result<Value, Fault> {
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let prefix = match radix {
        16 => Some(["0x", "0X"]),
        8 => Some(["0o", "0O"]),
        2 => Some(["0b", "0B"]),
        _ => None,
    };
    let digits = prefix
        .and_then(|prefixes| prefixes.iter().find_map(|prefix| digits.strip_prefix(prefix)))
        .unwrap_or(digits);
    let cleaned = digits.replace('_', "");
    let invalid = || {
        Fault::value_error(format!(
            "invalid literal for int() with base {radix}: {}",
            string::repr(text)
        ))
    };
    if cleaned.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__") {
        return Err(invalid());
    }
    let magnitude = i128::from_str_radix(&cleaned, radix).map_err(|_| invalid())?;
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value).map(Value::Int).map_err(|_| Fault::overflow())
}

fn float(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("float", 0, 1)?;
    let Some(value) = args.into_iter().next() else {
        return Ok(Value::Float(0.));
    };
    if let Some(value) = value.as_f64() {
        return Ok(Value::Float(value));
    }
    if let Some(text) = value.as_str() {
        let trimmed = text.trim();
        let parsed = match trimmed.to_ascii_lowercase().as_str() {
            "inf" | "+inf" | "infinity" | "+infinity" => Some(f64::INFINITY),
            "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
            "nan" | "+nan" | "-nan" => Some(f64::NAN),
            _ => trimmed.replace('_', "").parse::<f64>().ok(),
        };
        return parsed.map(Value::Float).ok_or_else(|| {
            Fault::value_error(format!(
                "could not convert string to float: {}",
                string::repr(text)
            ))
        });
    }
    call_special(vm, &value, "__float__", Vec::new())?.ok_or_else(|| {
        Fault::type_error(format!(
            "float() argument must be a string or a number, not '{}'",
            value.type_name()
        ))
    })
}

fn bool(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("bool", 0, 1)?;
    match args.into_iter().next() {
        Some(value) => Ok(Value::Bool(value.truthy(vm)?)),
        None => Ok(Value::Bool(false)),
    }
}

fn str(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("str", 0, 1)?;
    match args.into_iter().next() {
        Some(value @ Value::Str(_)) => Ok(value),
        Some(value) => str_of(vm, &value).map(Value::from),
        None => Ok(Value::from("")),
    }
}

fn tuple(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("tuple", 0, 1)?;
    match args.into_iter().next() {
        Some(value) if value.is::<Tuple>() => Ok(value),
        Some(iterable) => Ok(Value::tuple(iterable.collect(vm)?)),
        None => Ok(Value::tuple(Vec::new())),
    }
}

fn list(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("list", 0, 1)?;
    match args.into_iter().next() {
        Some(iterable) => Ok(Value::list(iterable.collect(vm)?)),
        None => Ok(Value::dynamic(List::new())),
    }
}

fn dict(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let keywords = args.keywords;
    if args.positional.len() > 1 {
        return Err(Fault::type_error(format!(
            "dict expected at most 1 arguments, got {}",
            args.positional.len()
        )));
    }
    let dict = Dict::new();
    if let Some(source) = args.positional.first() {
        if let Some(namespace) = source.downcast_ref::<Namespace>() {
            for (key, value) in namespace.pairs() {
                dict.insert(Value::Str(key), value)?;
            }
        } else {
            dict.update(vm, source)?;
        }
    }
    for (name, value) in keywords {
        dict.insert(Value::Str(name), value)?;
    }
    Ok(Value::dynamic(dict))
}

fn set(vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("set", 0, 1)?;
    let items = match args.into_iter().next() {
        Some(iterable) => iterable.collect(vm)?,
        None => Vec::new(),
    };
    Ok(Value::dynamic(Set::from_values(items)?))
}

fn integer_argument(value: &Value) -> Result<i64, Fault> {
    value.as_i64().ok_or_else(|| {
        Fault::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

fn range(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("range", 1, 3)?;
    let range = match args.as_slice() {
        [stop] => Range::new(0, integer_argument(stop)?, 1)?,
        [start, stop] => Range::new(integer_argument(start)?, integer_argument(stop)?, 1)?,
        [start, stop, step] => Range::new(
            integer_argument(start)?,
            integer_argument(stop)?,
            integer_argument(step)?,
        )?,
        _ => return Err(Fault::InvalidOperand),
    };
    Ok(Value::dynamic(range))
}

fn slice(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let args = args.between("slice", 1, 3)?;
    let slice = match <[Value; 3]>::try_from(args) {
        Ok([start, stop, step]) => Slice::new(start, stop, step),
        Err(args) => match <[Value; 2]>::try_from(args) {
            Ok([start, stop]) => Slice::new(start, stop, Value::None),
            Err(mut args) => Slice::new(Value::None, args.pop().unwrap_or_default(), Value::None),
        },
    };
    Ok(Value::dynamic(slice))
}

fn property(_vm: &mut Vm, mut args: Arguments) -> Result<Value, Fault> {
    let getter = args.take_keyword("fget");
    let setter = args.take_keyword("fset");
    args.take_keyword("doc");
    let mut positional = args.between("property", 0, 3)?.into_iter();
    let getter = getter.or_else(|| positional.next()).filter(|getter| !getter.is_none());
    let setter = setter.or_else(|| positional.next()).filter(|setter| !setter.is_none());
    Ok(Value::dynamic(Property::new(getter, setter)))
}

fn staticmethod(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [function] = args.exactly("staticmethod")?;
    Ok(Value::dynamic(StaticMethod(function)))
}

fn classmethod(_vm: &mut Vm, args: Arguments) -> Result<Value, Fault> {
    let [function] = args.exactly("classmethod")?;
    Ok(Value::dynamic(ClassMethod(function)))
}
