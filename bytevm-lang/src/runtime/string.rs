//! `str` methods, `repr()` quoting and the format-spec mini-language.

use std::fmt::Write;

use crate::runtime::list::{normalize_index, Slice};
use crate::runtime::methods::MethodTable;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{Number, Value};
use crate::vm::call::Arguments;
use crate::vm::{Fault, Vm};

/// Returns the `repr()` of a string, quoted the way CPython quotes it.
#[must_use]
pub fn repr(value: &str) -> String {
    let quote = if value.contains('\'') && !value.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut repr = String::with_capacity(value.len() + 2);
    repr.push(quote);
    for ch in value.chars() {
        match ch {
            '\\' => repr.push_str("\\\\"),
            '\n' => repr.push_str("\\n"),
            '\r' => repr.push_str("\\r"),
            '\t' => repr.push_str("\\t"),
            ch if ch == quote => {
                repr.push('\\');
                repr.push(ch);
            }
            ch if ch.is_control() => {
                let _ = write!(repr, "\\x{:02x}", u32::from(ch));
            }
            ch => repr.push(ch),
        }
    }
    repr.push(quote);
    repr
}

/// Escapes every non-ASCII character of `value`, as `ascii()` does to a
/// `repr()`.
#[must_use]
pub fn ascii(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        let code = u32::from(ch);
        if ch.is_ascii() {
            escaped.push(ch);
        } else if code <= 0xFF {
            let _ = write!(escaped, "\\x{code:02x}");
        } else if code <= 0xFFFF {
            let _ = write!(escaped, "\\u{code:04x}");
        } else {
            let _ = write!(escaped, "\\U{code:08x}");
        }
    }
    escaped
}

/// Returns each character of `value` as a one-character string.
#[must_use]
pub fn characters(value: &str) -> Vec<Value> {
    value
        .chars()
        .map(|ch| Value::from(ch.to_string()))
        .collect()
}

/// Returns `value[key]` for an integer or slice `key`.
pub fn get_item(value: &Symbol, key: &Value) -> Result<Value, Fault> {
    let chars = value.chars().collect::<Vec<_>>();
    if let Some(slice) = key.downcast_ref::<Slice>() {
        let selected = slice
            .positions(chars.len())?
            .into_iter()
            .map(|index| chars[index])
            .collect::<String>();
        return Ok(Value::from(selected));
    }
    let index = normalize_index(key, chars.len(), "string").map_err(|err| {
        if err.is_exception(crate::runtime::exception::ErrorKind::IndexError) {
            Fault::index_error("string index out of range")
        } else {
            err
        }
    })?;
    Ok(Value::from(chars[index].to_string()))
}

/// Returns the method `name` bound to the string `value`.
#[must_use]
pub fn bind_method(value: &Symbol, name: &Symbol) -> Option<Value> {
    STR_METHODS.lookup(value, name)
}

fn str_argument<'a>(value: &'a Value, method: &str) -> Result<&'a str, Fault> {
    value.as_str().ok_or_else(|| {
        Fault::type_error(format!(
            "{method}() argument must be str, not {}",
            value.type_name()
        ))
    })
}

fn optional_chars(args: Arguments, method: &str) -> Result<Option<Vec<char>>, Fault> {
    match args.between(method, 0, 1)?.pop() {
        None | Some(Value::None) => Ok(None),
        Some(chars) => Ok(Some(str_argument(&chars, method)?.chars().collect())),
    }
}

fn count_argument(value: Option<&Value>) -> Result<Option<usize>, Fault> {
    match value {
        None => Ok(None),
        Some(count) => match count.as_i64() {
            Some(count) if count < 0 => Ok(None),
            Some(count) => Ok(usize::try_from(count).ok()),
            None => Err(Fault::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                count.type_name()
            ))),
        },
    }
}

fn pad(value: &Symbol, args: Arguments, method: &str, align: char) -> Result<Value, Fault> {
    let args = args.between(method, 1, 2)?;
    let width = args
        .first()
        .and_then(Value::as_usize)
        .unwrap_or_default();
    let fill = match args.get(1) {
        Some(fill) => {
            let fill = str_argument(fill, method)?;
            let mut chars = fill.chars();
            match (chars.next(), chars.next()) {
                (Some(fill), None) => fill,
                _ => {
                    return Err(Fault::type_error(
                        "The fill character must be exactly one character long",
                    ))
                }
            }
        }
        None => ' ',
    };
    Ok(Value::from(align_text(value, fill, align, width)))
}

static STR_METHODS: MethodTable<Symbol> = MethodTable::new(
    "str",
    &[
        ("upper", |_vm, this, args| {
            let [] = args.exactly("upper")?;
            Ok(Value::from(this.to_uppercase()))
        }),
        ("lower", |_vm, this, args| {
            let [] = args.exactly("lower")?;
            Ok(Value::from(this.to_lowercase()))
        }),
        ("capitalize", |_vm, this, args| {
            let [] = args.exactly("capitalize")?;
            let mut chars = this.chars();
            let capitalized = match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
                None => String::new(),
            };
            Ok(Value::from(capitalized))
        }),
        ("strip", |_vm, this, args| {
            Ok(Value::from(match optional_chars(args, "strip")? {
                Some(chars) => this.trim_matches(chars.as_slice()),
                None => this.trim(),
            }))
        }),
        ("lstrip", |_vm, this, args| {
            Ok(Value::from(match optional_chars(args, "lstrip")? {
                Some(chars) => this.trim_start_matches(chars.as_slice()),
                None => this.trim_start(),
            }))
        }),
        ("rstrip", |_vm, this, args| {
            Ok(Value::from(match optional_chars(args, "rstrip")? {
                Some(chars) => this.trim_end_matches(chars.as_slice()),
                None => this.trim_end(),
            }))
        }),
        ("split", |_vm, this, mut args| {
            let separator = args.take_keyword("sep");
            let limit = args.take_keyword("maxsplit");
            let mut positional = args.between("split", 0, 2)?.into_iter();
            let separator = separator.or_else(|| positional.next()).unwrap_or_default();
            let limit = count_argument(limit.or_else(|| positional.next()).as_ref())?;
            let pieces: Vec<Value> = match &separator {
                Value::None => match limit {
                    Some(limit) => {
                        let mut pieces = Vec::new();
                        let mut rest = this.trim_start();
                        while !rest.is_empty() && pieces.len() < limit {
                            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                            pieces.push(Value::from(&rest[..end]));
                            rest = rest[end..].trim_start();
                        }
                        if !rest.is_empty() {
                            pieces.push(Value::from(rest));
                        }
                        pieces
                    }
                    None => this.split_whitespace().map(Value::from).collect(),
                },
                separator => {
                    let separator = str_argument(separator, "split")?;
                    if separator.is_empty() {
                        return Err(Fault::value_error("empty separator"));
                    }
                    match limit {
                        Some(limit) => this
                            .splitn(limit + 1, separator)
                            .map(Value::from)
                            .collect(),
                        None => this.split(separator).map(Value::from).collect(),
                    }
                }
            };
            Ok(Value::list(pieces))
        }),
        ("join", |vm, this, args| {
            let [iterable] = args.exactly("join")?;
            let mut joined = String::new();
            for (index, item) in iterable.collect(vm)?.into_iter().enumerate() {
                if index > 0 {
                    joined.push_str(this);
                }
                let item = item.as_str().ok_or_else(|| {
                    Fault::type_error(format!(
                        "sequence item {index}: expected str instance, {} found",
                        item.type_name()
                    ))
                })?;
                joined.push_str(item);
            }
            Ok(Value::from(joined))
        }),
        ("replace", |_vm, this, args| {
            let args = args.between("replace", 2, 3)?;
            let old = str_argument(&args[0], "replace")?;
            let new = str_argument(&args[1], "replace")?;
            Ok(Value::from(match count_argument(args.get(2))? {
                Some(count) => this.replacen(old, new, count),
                None => this.replace(old, new),
            }))
        }),
        ("startswith", |_vm, this, args| {
            let [prefix] = args.exactly("startswith")?;
            affix_matches(&prefix, "startswith", |prefix| this.starts_with(prefix))
        }),
        ("endswith", |_vm, this, args| {
            let [suffix] = args.exactly("endswith")?;
            affix_matches(&suffix, "endswith", |suffix| this.ends_with(suffix))
        }),
        ("find", |_vm, this, args| {
            let [needle] = args.exactly("find")?;
            let needle = str_argument(&needle, "find")?;
            match char_position(this, needle) {
                Some(index) => Value::try_from(index),
                None => Ok(Value::Int(-1)),
            }
        }),
        ("index", |_vm, this, args| {
            let [needle] = args.exactly("index")?;
            let needle = str_argument(&needle, "index")?;
            char_position(this, needle)
                .ok_or_else(|| Fault::value_error("substring not found"))
                .and_then(Value::try_from)
        }),
        ("count", |_vm, this, args| {
            let [needle] = args.exactly("count")?;
            let needle = str_argument(&needle, "count")?;
            let count = if needle.is_empty() {
                this.chars().count() + 1
            } else {
                this.matches(needle).count()
            };
            Value::try_from(count)
        }),
        ("isdigit", |_vm, this, args| {
            let [] = args.exactly("isdigit")?;
            Ok(Value::Bool(
                !this.is_empty() && this.chars().all(|ch| ch.is_ascii_digit()),
            ))
        }),
        ("isalpha", |_vm, this, args| {
            let [] = args.exactly("isalpha")?;
            Ok(Value::Bool(
                !this.is_empty() && this.chars().all(char::is_alphabetic),
            ))
        }),
        ("isspace", |_vm, this, args| {
            let [] = args.exactly("isspace")?;
            Ok(Value::Bool(
                !this.is_empty() && this.chars().all(char::is_whitespace),
            ))
        }),
        ("ljust", |_vm, this, args| pad(this, args, "ljust", '<')),
        ("rjust", |_vm, this, args| pad(this, args, "rjust", '>')),
        ("center", |_vm, this, args| pad(this, args, "center", '^')),
        ("zfill", |_vm, this, args| {
            let [width] = args.exactly("zfill")?;
            let width = width.as_usize().unwrap_or_default();
            let (sign, digits) = match this.strip_prefix(['-', '+']) {
                Some(digits) => (&this[..1], digits),
                None => ("", this.as_str()),
            };
            let padding = width.saturating_sub(this.chars().count());
            Ok(Value::from(format!("{sign}{}{digits}", "0".repeat(padding))))
        }),
        ("format", |vm, this, args| Ok(Value::from(format_str(vm, this, args)?))),
    ],
);

fn affix_matches(
    affix: &Value,
    method: &str,
    matches: impl Fn(&str) -> bool,
) -> Result<Value, Fault> {
    if let Some(affix) = affix.as_str() {
        return Ok(Value::Bool(matches(affix)));
    }
    let Some(choices) = affix.downcast_ref::<crate::runtime::list::Tuple>() else {
        return Err(Fault::type_error(format!(
            "{method} first arg must be str or a tuple of str, not {}",
            affix.type_name()
        )));
    };
    for choice in choices.as_slice() {
        if matches(str_argument(choice, method)?) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn char_position(haystack: &str, needle: &str) -> Option<usize> {
    let byte = haystack.find(needle)?;
    Some(haystack[..byte].chars().count())
}

/// Implements `str.format`: `{}`, `{0}` and `{name}` fields, each with an
/// optional `!r`/`!s`/`!a` conversion and a format spec.
fn format_str(vm: &mut Vm, template: &str, args: Arguments) -> Result<String, Fault> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_positional = 0;
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                output.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                output.push('}');
            }
            '}' => {
                return Err(Fault::value_error(
                    "Single '}' encountered in format string",
                ))
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => {
                            return Err(Fault::value_error(
                                "expected '}' before end of string",
                            ))
                        }
                    }
                }
                let (field, spec) = field.split_once(':').unwrap_or((&field, ""));
                let (name, conversion) = match field.split_once('!') {
                    Some((name, conversion)) => (name, Some(conversion)),
                    None => (field, None),
                };
                let value = if name.is_empty() {
                    let value = args.positional.get(next_positional).cloned();
                    next_positional += 1;
                    value.ok_or_else(|| {
                        Fault::index_error("tuple index out of range")
                    })?
                } else if let Ok(index) = name.parse::<usize>() {
                    args.positional
                        .get(index)
                        .cloned()
                        .ok_or_else(|| Fault::index_error("tuple index out of range"))?
                } else {
                    args.keyword(name)
                        .cloned()
                        .ok_or_else(|| Fault::key_error(Value::from(name)))?
                };
                let value = match conversion {
                    None => value,
                    Some("s") => Value::from(crate::runtime::types::str_of(vm, &value)?),
                    Some("r") => Value::from(crate::runtime::types::repr_of(vm, &value)?),
                    Some("a") => Value::from(ascii(&crate::runtime::types::repr_of(vm, &value)?)),
                    Some(other) => {
                        return Err(Fault::value_error(format!(
                            "Unknown conversion specifier {other}"
                        )))
                    }
                };
                output.push_str(&format_value(&value, spec)?);
            }
            ch => output.push(ch),
        }
    }
    Ok(output)
}

/// A parsed format spec: `[[fill]align][sign][#][0][width][,][.precision][type]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FormatSpec {
    fill: char,
    align: Option<char>,
    sign: char,
    alternate: bool,
    width: usize,
    grouping: bool,
    precision: Option<usize>,
    kind: Option<char>,
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            fill: ' ',
            align: None,
            sign: '-',
            alternate: false,
            width: 0,
            grouping: false,
            precision: None,
            kind: None,
        }
    }
}

impl FormatSpec {
    fn parse(spec: &str) -> Result<Self, Fault> {
        let invalid = || Fault::value_error("Invalid format specifier");
        let chars = spec.chars().collect::<Vec<_>>();
        let mut parsed = Self::default();
        let mut index = 0;
        let is_align = |ch: char| matches!(ch, '<' | '>' | '^' | '=');
        if chars.len() >= 2 && is_align(chars[1]) {
            parsed.fill = chars[0];
            parsed.align = Some(chars[1]);
            index = 2;
        } else if chars.first().copied().is_some_and(is_align) {
            parsed.align = Some(chars[0]);
            index = 1;
        }
        if let Some(&sign @ ('+' | '-' | ' ')) = chars.get(index) {
            parsed.sign = sign;
            index += 1;
        }
        if chars.get(index) == Some(&'#') {
            parsed.alternate = true;
            index += 1;
        }
        if chars.get(index) == Some(&'0') {
            if parsed.align.is_none() {
                parsed.fill = '0';
                parsed.align = Some('=');
            }
            index += 1;
        }
        let digits = |index: &mut usize| {
            let start = *index;
            while chars.get(*index).is_some_and(char::is_ascii_digit) {
                *index += 1;
            }
            chars[start..*index].iter().collect::<String>()
        };
        let width = digits(&mut index);
        if !width.is_empty() {
            parsed.width = width.parse().map_err(|_| invalid())?;
        }
        if chars.get(index) == Some(&',') {
            parsed.grouping = true;
            index += 1;
        }
        if chars.get(index) == Some(&'.') {
            index += 1;
            let precision = digits(&mut index);
            if precision.is_empty() {
                return Err(Fault::value_error("Format specifier missing precision"));
            }
            parsed.precision = Some(precision.parse().map_err(|_| invalid())?);
        }
        match &chars[index..] {
            [] => {}
            [kind] => parsed.kind = Some(*kind),
            _ => return Err(invalid()),
        }
        Ok(parsed)
    }
}

fn align_text(text: &str, fill: char, align: char, width: usize) -> String {
    let len = text.chars().count();
    if len >= width {
        return text.to_string();
    }
    let padding = width - len;
    let fill_with = |count: usize| std::iter::repeat(fill).take(count).collect::<String>();
    match align {
        '<' => format!("{text}{}", fill_with(padding)),
        '^' => format!(
            "{}{text}{}",
            fill_with(padding / 2),
            fill_with(padding - padding / 2)
        ),
        _ => format!("{}{text}", fill_with(padding)),
    }
}

fn group_thousands(digits: &str) -> String {
    let (integer, fraction) = match digits.find(|ch: char| !ch.is_ascii_digit()) {
        Some(split) => digits.split_at(split),
        None => (digits, ""),
    };
    let mut grouped = String::with_capacity(integer.len() + integer.len() / 3);
    for (index, ch) in integer.chars().enumerate() {
        if index > 0 && (integer.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped.push_str(fraction);
    grouped
}

fn format_general(value: f64, precision: usize, upper: bool) -> String {
    let precision = precision.max(1);
    if value == 0. || !value.is_finite() {
        return format_float_fixed(value, 0, upper);
    }
    #[allow(clippy::cast_possible_truncation)]
    let exponent = value.abs().log10().floor() as i64;
    let precision_exp = i64::try_from(precision).unwrap_or(i64::MAX);
    let formatted = if (-4..precision_exp).contains(&exponent) {
        let decimals = usize::try_from(precision_exp - 1 - exponent).unwrap_or(0);
        format!("{value:.decimals$}")
    } else {
        format_exponent(value, precision - 1, upper)
    };
    strip_fraction_zeros(&formatted)
}

fn strip_fraction_zeros(formatted: &str) -> String {
    let (mantissa, exponent) = match formatted.find(['e', 'E']) {
        Some(split) => formatted.split_at(split),
        None => (formatted, ""),
    };
    let mantissa = if mantissa.contains('.') {
        mantissa.trim_end_matches('0').trim_end_matches('.')
    } else {
        mantissa
    };
    format!("{mantissa}{exponent}")
}

fn format_exponent(value: f64, precision: usize, upper: bool) -> String {
    let formatted = format!("{value:.precision$e}");
    let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exponent),
    };
    let e = if upper { 'E' } else { 'e' };
    format!("{mantissa}{e}{sign}{digits:0>2}")
}

fn format_float_fixed(value: f64, precision: usize, upper: bool) -> String {
    let formatted = if value.is_nan() {
        String::from("nan")
    } else if value.is_infinite() {
        String::from(if value > 0. { "inf" } else { "-inf" })
    } else {
        format!("{value:.precision$}")
    };
    if upper {
        formatted.to_uppercase()
    } else {
        formatted
    }
}

fn format_number(number: Number, spec: &FormatSpec) -> Result<String, Fault> {
    let unknown = |type_name: &str| {
        Fault::value_error(format!(
            "Unknown format code '{}' for object of type '{type_name}'",
            spec.kind.unwrap_or_default()
        ))
    };
    let (negative, body) = match (number, spec.kind) {
        (Number::Int(value), None | Some('d' | 'n')) => (value < 0, value.unsigned_abs().to_string()),
        (Number::Int(value), Some(radix @ ('x' | 'X' | 'o' | 'b'))) => {
            let magnitude = value.unsigned_abs();
            let (digits, prefix) = match radix {
                'x' => (format!("{magnitude:x}"), "0x"),
                'X' => (format!("{magnitude:X}"), "0X"),
                'o' => (format!("{magnitude:o}"), "0o"),
                _ => (format!("{magnitude:b}"), "0b"),
            };
            let body = if spec.alternate {
                format!("{prefix}{digits}")
            } else {
                digits
            };
            (value < 0, body)
        }
        (Number::Int(value), Some('c')) => {
            let ch = u32::try_from(value)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| Fault::overflow())?;
            (false, ch.to_string())
        }
        (Number::Int(_), Some(kind)) if !matches!(kind, 'f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%') => {
            return Err(unknown("int"))
        }
        (number, kind) => {
            let value = number.as_f64();
            let magnitude = value.abs();
            let body = match kind {
                Some('f' | 'F') => {
                    format_float_fixed(magnitude, spec.precision.unwrap_or(6), kind == Some('F'))
                }
                Some('e' | 'E') => {
                    format_exponent(magnitude, spec.precision.unwrap_or(6), kind == Some('E'))
                }
                Some('g' | 'G') => {
                    format_general(magnitude, spec.precision.unwrap_or(6), kind == Some('G'))
                }
                Some('%') => format!(
                    "{}%",
                    format_float_fixed(magnitude * 100., spec.precision.unwrap_or(6), false)
                ),
                None => match spec.precision {
                    Some(precision) => format_general(magnitude, precision, false),
                    None => Value::Float(magnitude).repr(),
                },
                Some(_) => return Err(unknown("float")),
            };
            (value.is_sign_negative() && !value.is_nan(), body)
        }
    };
    let body = if spec.grouping {
        group_thousands(&body)
    } else {
        body
    };
    let sign = match (negative, spec.sign) {
        (true, _) => "-",
        (false, '+') => "+",
        (false, ' ') => " ",
        _ => "",
    };
    Ok(match spec.align.unwrap_or('>') {
        '=' => {
            let width = spec.width.saturating_sub(sign.len());
            format!("{sign}{}", align_text(&body, spec.fill, '>', width))
        }
        align => align_text(&format!("{sign}{body}"), spec.fill, align, spec.width),
    })
}

/// Formats `value` according to the format spec `spec`, as `format()` and
/// f-strings do.
pub fn format_value(value: &Value, spec: &str) -> Result<String, Fault> {
    if spec.is_empty() {
        return Ok(value.to_string());
    }
    let parsed = FormatSpec::parse(spec)?;
    if let Some(number) = value.number() {
        if !matches!(value, Value::Bool(_)) || parsed.kind.is_some() {
            return format_number(number, &parsed);
        }
    }
    match value {
        Value::Str(text) => {
            if !matches!(parsed.kind, None | Some('s')) {
                return Err(Fault::value_error(format!(
                    "Unknown format code '{}' for object of type 'str'",
                    parsed.kind.unwrap_or_default()
                )));
            }
            let text = match parsed.precision {
                Some(precision) => text.chars().take(precision).collect(),
                None => text.to_string(),
            };
            Ok(align_text(
                &text,
                parsed.fill,
                parsed.align.unwrap_or('<'),
                parsed.width,
            ))
        }
        Value::Bool(_) => Ok(align_text(
            &value.to_string(),
            parsed.fill,
            parsed.align.unwrap_or('<'),
            parsed.width,
        )),
        other => Err(Fault::type_error(format!(
            "unsupported format string passed to {}.__format__",
            other.type_name()
        ))),
    }
}

/// Implements `template % args`.
pub fn percent_format(template: &str, args: &Value) -> Result<String, Fault> {
    let positional = match args.downcast_ref::<crate::runtime::list::Tuple>() {
        Some(tuple) => tuple.as_slice().to_vec(),
        None => vec![args.clone()],
    };
    let mapping = args.downcast_ref::<crate::runtime::map::Dict>();
    let mut next = 0;
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            output.push(ch);
            continue;
        }
        let mut value = None;
        if chars.peek() == Some(&'(') {
            chars.next();
            let name = chars.by_ref().take_while(|ch| *ch != ')').collect::<String>();
            let mapping = mapping
                .ok_or_else(|| Fault::type_error("format requires a mapping"))?;
            let key = Value::from(name);
            value = Some(
                mapping
                    .get(&key)?
                    .ok_or_else(|| Fault::key_error(key))?,
            );
        }
        let mut spec = String::new();
        let mut left = false;
        while let Some(&flag @ ('-' | '+' | ' ' | '0' | '#')) = chars.peek() {
            chars.next();
            match flag {
                '-' => left = true,
                '0' if !spec.contains('0') => spec.push('0'),
                '+' | ' ' => spec.insert(0, flag),
                '#' => spec.push('#'),
                _ => {}
            }
        }
        let mut width = String::new();
        while let Some(&digit) = chars.peek().filter(|ch| ch.is_ascii_digit()) {
            chars.next();
            width.push(digit);
        }
        let mut precision = String::new();
        if chars.peek() == Some(&'.') {
            chars.next();
            precision.push('.');
            while let Some(&digit) = chars.peek().filter(|ch| ch.is_ascii_digit()) {
                chars.next();
                precision.push(digit);
            }
            if precision.len() == 1 {
                precision.push('0');
            }
        }
        let Some(conversion) = chars.next() else {
            return Err(Fault::value_error("incomplete format"));
        };
        if conversion == '%' {
            output.push('%');
            continue;
        }
        let value = match value {
            Some(value) => value,
            None => {
                let value = positional.get(next).cloned().ok_or_else(|| {
                    Fault::type_error("not enough arguments for format string")
                })?;
                next += 1;
                value
            }
        };
        let spec = if left {
            format!("<{}{width}{precision}", spec.replace('0', ""))
        } else {
            format!("{spec}{width}{precision}")
        };
        let formatted = match conversion {
            's' => format_value(&Value::from(value.to_string()), &spec.replace(['+', ' ', '#'], ""))?,
            'r' => format_value(&Value::from(value.repr()), &spec.replace(['+', ' ', '#'], ""))?,
            'a' => format_value(&Value::from(ascii(&value.repr())), &spec.replace(['+', ' ', '#'], ""))?,
            'd' | 'i' | 'u' => match value.number() {
                #[allow(clippy::cast_possible_truncation)]
                Some(Number::Float(float)) => format_value(&Value::Int(float.trunc() as i64), &format!("{spec}d"))?,
                Some(_) => format_value(&value, &format!("{spec}d"))?,
                None => {
                    return Err(Fault::type_error(format!(
                        "%{conversion} format: a number is required, not {}",
                        value.type_name()
                    )))
                }
            },
            'x' | 'X' | 'o' | 'c' => format_value(&value, &format!("{spec}{conversion}"))?,
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let float = value.as_f64().ok_or_else(|| {
                    Fault::type_error(format!(
                        "must be real number, not {}",
                        value.type_name()
                    ))
                })?;
                format_value(&Value::Float(float), &format!("{spec}{conversion}"))?
            }
            other => {
                return Err(Fault::value_error(format!(
                    "unsupported format character '{other}'"
                )))
            }
        };
        output.push_str(&formatted);
    }
    if mapping.is_none() && next < positional.len() && !(positional.len() == 1 && next == 0 && args.is::<crate::runtime::list::Tuple>()) {
        return Err(Fault::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(output)
}
