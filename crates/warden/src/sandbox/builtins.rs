//! Safe globals available to every run.
//!
//! Nothing here reaches the host: no clock, no I/O, no code construction.
//! `Math.random` draws from a generator seeded by the OS once per run.
//! Methods on strings, numbers, arrays and plain objects are resolved by name
//! through [`method`] and dispatched by [`call_method`].
//!
//! Strings are indexed by Unicode scalar value, not UTF-16 code unit:
//! `'😀x'.length` is 2, and `charAt`, `slice` and `indexOf` agree with it.
//! Lone surrogates cannot be represented, so no index can split one.

use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;

use super::ConsoleLevel;
use super::interpreter::{
    Interpreter, Interrupt, Scope, error_value, property_key, range_error, to_int32, to_uint32,
    type_error,
};
use super::value::{Function, Value, number_to_string, strict_equals};

/// Error constructors exposed as globals.
const ERROR_TYPES: &[&str] = &[
    "Error",
    "TypeError",
    "RangeError",
    "SyntaxError",
    "ReferenceError",
];

const ARRAY_METHODS: &[&str] = &[
    "push",
    "pop",
    "shift",
    "unshift",
    "slice",
    "splice",
    "concat",
    "join",
    "reverse",
    "indexOf",
    "lastIndexOf",
    "includes",
    "find",
    "findIndex",
    "findLast",
    "findLastIndex",
    "filter",
    "map",
    "forEach",
    "some",
    "every",
    "reduce",
    "reduceRight",
    "sort",
    "flat",
    "flatMap",
    "fill",
    "at",
    "keys",
    "entries",
    "toString",
];

const STRING_METHODS: &[&str] = &[
    "charAt",
    "charCodeAt",
    "indexOf",
    "lastIndexOf",
    "includes",
    "startsWith",
    "endsWith",
    "slice",
    "substring",
    "substr",
    "toUpperCase",
    "toLowerCase",
    "trim",
    "trimStart",
    "trimEnd",
    "split",
    "replace",
    "replaceAll",
    "repeat",
    "padStart",
    "padEnd",
    "concat",
    "at",
    "toString",
];

const NUMBER_METHODS: &[&str] = &["toFixed", "toString"];

const BOOL_METHODS: &[&str] = &["toString"];

const OBJECT_METHODS: &[&str] = &["hasOwnProperty", "toString"];

type NativeResult = Result<Value, Interrupt>;

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

fn num_arg(args: &[Value], index: usize) -> f64 {
    args.get(index).map_or(f64::NAN, Value::to_number)
}

/// Integer argument with a default for `undefined`.
fn int_arg(args: &[Value], index: usize, default: f64) -> f64 {
    match args.get(index) {
        None | Some(Value::Undefined) => default,
        Some(value) => {
            let n = value.to_number();
            if n.is_nan() { 0.0 } else { n.trunc() }
        }
    }
}

/// Resolve a possibly negative relative index against `len`.
fn relative(n: f64, len: usize) -> usize {
    let len_f = len as f64;
    if n < 0.0 {
        (len_f + n).max(0.0) as usize
    } else {
        n.min(len_f) as usize
    }
}

fn install_object(globals: &Rc<Scope>, name: &str, members: Vec<(&str, Value)>) {
    let entries = members
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
    globals.declare(name, Value::object(entries), false);
}

/// Declare the built-in globals in `globals`.
pub(crate) fn install(globals: &Rc<Scope>) {
    globals.declare("undefined", Value::Undefined, false);
    globals.declare("NaN", Value::Number(f64::NAN), false);
    globals.declare("Infinity", Value::Number(f64::INFINITY), false);

    install_object(globals, "console", vec![
        ("log", Value::native("log", console_log)),
        ("info", Value::native("info", console_info)),
        ("warn", Value::native("warn", console_warn)),
        ("error", Value::native("error", console_error)),
        ("debug", Value::native("debug", console_log)),
    ]);

    install_object(globals, "Math", vec![
        ("PI", Value::Number(std::f64::consts::PI)),
        ("E", Value::Number(std::f64::consts::E)),
        ("LN2", Value::Number(std::f64::consts::LN_2)),
        ("LN10", Value::Number(std::f64::consts::LN_10)),
        ("LOG2E", Value::Number(std::f64::consts::LOG2_E)),
        ("LOG10E", Value::Number(std::f64::consts::LOG10_E)),
        ("SQRT2", Value::Number(std::f64::consts::SQRT_2)),
        ("abs", Value::native("abs", math_abs)),
        ("floor", Value::native("floor", math_floor)),
        ("ceil", Value::native("ceil", math_ceil)),
        ("round", Value::native("round", math_round)),
        ("trunc", Value::native("trunc", math_trunc)),
        ("sign", Value::native("sign", math_sign)),
        ("sqrt", Value::native("sqrt", math_sqrt)),
        ("cbrt", Value::native("cbrt", math_cbrt)),
        ("exp", Value::native("exp", math_exp)),
        ("log", Value::native("log", math_log)),
        ("log2", Value::native("log2", math_log2)),
        ("log10", Value::native("log10", math_log10)),
        ("sin", Value::native("sin", math_sin)),
        ("cos", Value::native("cos", math_cos)),
        ("tan", Value::native("tan", math_tan)),
        ("atan", Value::native("atan", math_atan)),
        ("pow", Value::native("pow", math_pow)),
        ("atan2", Value::native("atan2", math_atan2)),
        ("min", Value::native("min", math_min)),
        ("max", Value::native("max", math_max)),
        ("hypot", Value::native("hypot", math_hypot)),
        ("random", Value::native("random", math_random)),
    ]);

    install_object(globals, "JSON", vec![
        ("stringify", Value::native("stringify", json_stringify)),
        ("parse", Value::native("parse", json_parse)),
    ]);

    globals.declare("Object", Value::native("Object", object_ctor), false);
    globals.declare("Array", Value::native("Array", array_ctor), false);
    globals.declare("Number", Value::native("Number", number_ctor), false);
    globals.declare("String", Value::native("String", string_ctor), false);
    globals.declare("Boolean", Value::native("Boolean", boolean_ctor), false);
    globals.declare("parseInt", Value::native("parseInt", parse_int), false);
    globals.declare("parseFloat", Value::native("parseFloat", parse_float), false);
    globals.declare("isNaN", Value::native("isNaN", is_nan), false);
    globals.declare("isFinite", Value::native("isFinite", is_finite), false);

    globals.declare("Error", Value::native("Error", error_ctor), false);
    globals.declare("TypeError", Value::native("TypeError", type_error_ctor), false);
    globals.declare("RangeError", Value::native("RangeError", range_error_ctor), false);
    globals.declare("SyntaxError", Value::native("SyntaxError", syntax_error_ctor), false);
    globals.declare(
        "ReferenceError",
        Value::native("ReferenceError", reference_error_ctor),
        false,
    );
}

/// Static members of the global constructors, e.g. `Object.keys`.
pub(crate) fn static_member(function: &Function, key: &str) -> Option<Value> {
    let Function::Native { name, .. } = function else {
        return None;
    };
    let value = match (*name, key) {
        ("Object", "keys") => Value::native("keys", object_keys),
        ("Object", "values") => Value::native("values", object_values),
        ("Object", "entries") => Value::native("entries", object_entries),
        ("Object", "assign") => Value::native("assign", object_assign),
        ("Object", "fromEntries") => Value::native("fromEntries", object_from_entries),
        ("Object", "freeze") => Value::native("freeze", identity),
        ("Array", "isArray") => Value::native("isArray", array_is_array),
        ("Array", "from") => Value::native("from", array_from),
        ("Array", "of") => Value::native("of", array_of),
        ("String", "fromCharCode") => Value::native("fromCharCode", string_from_char_code),
        ("Number", "isInteger") => Value::native("isInteger", number_is_integer),
        ("Number", "isSafeInteger") => Value::native("isSafeInteger", number_is_safe_integer),
        ("Number", "isFinite") => Value::native("isFinite", number_is_finite),
        ("Number", "isNaN") => Value::native("isNaN", number_is_nan),
        ("Number", "parseFloat") => Value::native("parseFloat", parse_float),
        ("Number", "parseInt") => Value::native("parseInt", parse_int),
        ("Number", "MAX_SAFE_INTEGER") => Value::Number(9_007_199_254_740_991.0),
        ("Number", "MIN_SAFE_INTEGER") => Value::Number(-9_007_199_254_740_991.0),
        ("Number", "EPSILON") => Value::Number(f64::EPSILON),
        ("Number", "MAX_VALUE") => Value::Number(f64::MAX),
        ("Number", "MIN_VALUE") => Value::Number(5e-324),
        ("Number", "POSITIVE_INFINITY") => Value::Number(f64::INFINITY),
        ("Number", "NEGATIVE_INFINITY") => Value::Number(f64::NEG_INFINITY),
        ("Number", "NaN") => Value::Number(f64::NAN),
        _ => return None,
    };
    Some(value)
}

/// Bound built-in method `name` of `target`, if it has one.
pub(crate) fn method(target: &Value, name: &str) -> Option<Value> {
    let methods = match target {
        Value::Array(_) => ARRAY_METHODS,
        Value::Str(_) => STRING_METHODS,
        Value::Number(_) => NUMBER_METHODS,
        Value::Bool(_) => BOOL_METHODS,
        Value::Object(_) => OBJECT_METHODS,
        _ => return None,
    };
    let name = methods.iter().copied().find(|m| *m == name)?;
    Some(Value::Function(Rc::new(Function::Method {
        receiver: target.clone(),
        name,
    })))
}

/// Own enumerable keys, as `for..in` and `Object.keys` see them.
pub(crate) fn keys_of(value: &Value) -> Vec<String> {
    match value {
        Value::Object(entries) => entries.borrow().keys().cloned().collect(),
        Value::Array(items) => (0..items.borrow().len()).map(|i| i.to_string()).collect(),
        Value::Str(s) => (0..s.chars().count()).map(|i| i.to_string()).collect(),
        _ => Vec::new(),
    }
}

/// `value instanceof constructor` for the built-in constructors.
pub(crate) fn instance_of(value: &Value, constructor: &Function) -> bool {
    let Function::Native { name, .. } = constructor else {
        return false;
    };
    match (*name, value) {
        ("Array", Value::Array(_)) => true,
        ("Object", Value::Object(_) | Value::Array(_) | Value::Function(_)) => true,
        (name, Value::Object(entries)) if ERROR_TYPES.contains(&name) => {
            match entries.borrow().get("name") {
                Some(Value::Str(actual)) => {
                    &**actual == name || (name == "Error" && actual.ends_with("Error"))
                }
                _ => false,
            }
        }
        _ => false,
    }
}

pub(crate) fn call_method(
    interp: &mut Interpreter,
    receiver: Value,
    name: &str,
    args: Vec<Value>,
) -> NativeResult {
    match &receiver {
        Value::Array(_) => array_method(interp, &receiver, name, args),
        Value::Str(s) => string_method(interp, s, name, args),
        Value::Number(n) => number_method(interp, *n, name, &args),
        Value::Bool(b) => Ok(Value::string(b.to_string())),
        Value::Object(entries) => Ok(match name {
            "hasOwnProperty" => {
                let key = property_key(&arg(&args, 0));
                Value::Bool(entries.borrow().contains_key(&key))
            }
            _ => Value::string(receiver.to_js_string()),
        }),
        other => Err(type_error(format!(
            "{}.{name} is not a function",
            other.to_js_string()
        ))),
    }
}

// console

fn console_log(interp: &mut Interpreter, _this: Value, args: Vec<Value>) -> NativeResult {
    interp.console(ConsoleLevel::Log, &args);
    Ok(Value::Undefined)
}

fn console_info(interp: &mut Interpreter, _this: Value, args: Vec<Value>) -> NativeResult {
    interp.console(ConsoleLevel::Info, &args);
    Ok(Value::Undefined)
}

fn console_warn(interp: &mut Interpreter, _this: Value, args: Vec<Value>) -> NativeResult {
    interp.console(ConsoleLevel::Warn, &args);
    Ok(Value::Undefined)
}

fn console_error(interp: &mut Interpreter, _this: Value, args: Vec<Value>) -> NativeResult {
    interp.console(ConsoleLevel::Error, &args);
    Ok(Value::Undefined)
}

// Math

macro_rules! math_unary {
    ($($name:ident => $op:expr;)*) => {
        $(
            fn $name(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
                let op: fn(f64) -> f64 = $op;
                Ok(Value::Number(op(num_arg(&args, 0))))
            }
        )*
    };
}

math_unary! {
    math_abs => f64::abs;
    math_floor => f64::floor;
    math_ceil => f64::ceil;
    math_round => |x| (x + 0.5).floor();
    math_trunc => f64::trunc;
    math_sign => |x| if x.is_nan() || x == 0.0 { x } else { x.signum() };
    math_sqrt => f64::sqrt;
    math_cbrt => f64::cbrt;
    math_exp => f64::exp;
    math_log => f64::ln;
    math_log2 => f64::log2;
    math_log10 => f64::log10;
    math_sin => f64::sin;
    math_cos => f64::cos;
    math_tan => f64::tan;
    math_atan => f64::atan;
}

fn math_pow(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Number(num_arg(&args, 0).powf(num_arg(&args, 1))))
}

fn math_atan2(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Number(num_arg(&args, 0).atan2(num_arg(&args, 1))))
}

fn math_min(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let mut result = f64::INFINITY;
    for n in args.iter().map(Value::to_number) {
        if n.is_nan() {
            return Ok(Value::Number(f64::NAN));
        }
        result = result.min(n);
    }
    Ok(Value::Number(result))
}

fn math_max(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let mut result = f64::NEG_INFINITY;
    for n in args.iter().map(Value::to_number) {
        if n.is_nan() {
            return Ok(Value::Number(f64::NAN));
        }
        result = result.max(n);
    }
    Ok(Value::Number(result))
}

fn math_hypot(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let sum: f64 = args.iter().map(|v| v.to_number().powi(2)).sum();
    Ok(Value::Number(sum.sqrt()))
}

fn math_random(interp: &mut Interpreter, _: Value, _: Vec<Value>) -> NativeResult {
    Ok(Value::Number(interp.next_random()))
}

// JSON

fn json_stringify(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let value = arg(&args, 0);
    if matches!(value, Value::Undefined | Value::Function(_)) {
        return Ok(Value::Undefined);
    }
    let indent = match arg(&args, 2) {
        Value::Number(n) if n >= 1.0 => " ".repeat(n.min(10.0) as usize),
        Value::Str(s) => s.chars().take(10).collect(),
        _ => String::new(),
    };
    let json = value
        .to_json()
        .map_err(|circular| type_error(circular.to_string()))?;
    let text = if indent.is_empty() {
        serde_json::to_string(&json)
    } else {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        json.serialize(&mut serializer)
            .map(|()| String::from_utf8_lossy(&buf).into_owned())
    };
    let text = text.map_err(|err| type_error(err.to_string()))?;
    interp.new_string(text)
}

fn json_parse(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let text = arg(&args, 0).to_js_string();
    interp.check_string_len(text.len())?;
    serde_json::from_str::<serde_json::Value>(&text)
        .map(|json| Value::from_json(&json))
        .map_err(|err| Interrupt::Throw(error_value("SyntaxError", err.to_string())))
}

// Constructors and conversions

fn identity(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(arg(&args, 0))
}

fn object_ctor(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(match arg(&args, 0) {
        Value::Undefined | Value::Null => Value::object(IndexMap::new()),
        other => other,
    })
}

fn array_ctor(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    if let [Value::Number(n)] = args.as_slice() {
        if *n < 0.0 || n.fract() != 0.0 || *n > 4_294_967_295.0 {
            return Err(range_error("Invalid array length"));
        }
        let len = *n as usize;
        interp.check_len(len)?;
        return Ok(Value::array(vec![Value::Undefined; len]));
    }
    interp.new_array(args)
}

fn number_ctor(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Number(args.first().map_or(0.0, Value::to_number)))
}

fn string_ctor(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::string(
        args.first().map(Value::to_js_string).unwrap_or_default(),
    ))
}

fn boolean_ctor(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
}

fn make_error(name: &str, args: &[Value]) -> Value {
    let message = match args.first() {
        None | Some(Value::Undefined) => String::new(),
        Some(value) => value.to_js_string(),
    };
    error_value(name, message)
}

fn error_ctor(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(make_error("Error", &args))
}

fn type_error_ctor(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(make_error("TypeError", &args))
}

fn range_error_ctor(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(make_error("RangeError", &args))
}

fn syntax_error_ctor(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(make_error("SyntaxError", &args))
}

fn reference_error_ctor(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(make_error("ReferenceError", &args))
}

fn parse_int(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let text = arg(&args, 0).to_js_string();
    let mut rest = text.trim_start();
    let mut sign = 1.0;
    if let Some(stripped) = rest.strip_prefix('-') {
        sign = -1.0;
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    }
    let mut radix = to_int32(num_arg(&args, 1));
    if (radix == 0 || radix == 16)
        && let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X"))
    {
        rest = hex;
        radix = 16;
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return Ok(Value::Number(f64::NAN));
    }
    let mut result = 0.0;
    let mut any = false;
    for c in rest.chars() {
        let Some(digit) = c.to_digit(radix as u32) else {
            break;
        };
        result = result * f64::from(radix) + f64::from(digit);
        any = true;
    }
    Ok(Value::Number(if any { sign * result } else { f64::NAN }))
}

/// Longest numeric prefix of `text`, as `parseFloat` reads it.
fn float_prefix(text: &str) -> f64 {
    let text = text.trim_start();
    let unsigned = text.trim_start_matches(['+', '-']);
    if unsigned.starts_with("Infinity") {
        return if text.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }
    let bytes = text.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let mut best = None;
    while end < bytes.len() {
        match bytes[end] {
            b'+' | b'-' if end == 0 || matches!(bytes[end - 1], b'e' | b'E') => {}
            b'0'..=b'9' => {
                seen_digit = true;
                best = Some(end + 1);
            }
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        end += 1;
    }
    best.and_then(|end| text[..end].parse().ok())
        .unwrap_or(f64::NAN)
}

fn parse_float(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Number(float_prefix(&arg(&args, 0).to_js_string())))
}

fn is_nan(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Bool(num_arg(&args, 0).is_nan()))
}

fn is_finite(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Bool(num_arg(&args, 0).is_finite()))
}

// Statics

fn object_keys(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::array(
        keys_of(&arg(&args, 0)).into_iter().map(Value::string).collect(),
    ))
}

fn object_values(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let target = arg(&args, 0);
    let mut values = Vec::new();
    for key in keys_of(&target) {
        values.push(interp.get_property(&target, &Value::string(key))?);
    }
    Ok(Value::array(values))
}

fn object_entries(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let target = arg(&args, 0);
    let mut entries = Vec::new();
    for key in keys_of(&target) {
        let key = Value::string(key);
        let value = interp.get_property(&target, &key)?;
        entries.push(Value::array(vec![key, value]));
    }
    Ok(Value::array(entries))
}

fn object_assign(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let target = arg(&args, 0);
    if !matches!(target, Value::Object(_)) {
        return Err(type_error("Cannot convert undefined or null to object"));
    }
    for source in args.iter().skip(1) {
        for key in keys_of(source) {
            let key = Value::string(key);
            let value = interp.get_property(source, &key)?;
            interp.set_property(&target, &key, value)?;
        }
    }
    Ok(target)
}

fn object_from_entries(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let mut entries = IndexMap::new();
    for entry in interp.iterate(&arg(&args, 0))? {
        let key = interp.get_property(&entry, &Value::Number(0.0))?;
        let value = interp.get_property(&entry, &Value::Number(1.0))?;
        entries.insert(property_key(&key), value);
    }
    interp.check_len(entries.len())?;
    Ok(Value::object(entries))
}

fn array_is_array(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Bool(matches!(arg(&args, 0), Value::Array(_))))
}

fn array_from(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let source = arg(&args, 0);
    let items = match &source {
        Value::Object(entries) => {
            let len = entries.borrow().get("length").map_or(0.0, Value::to_number);
            let len = if len.is_finite() && len > 0.0 { len as usize } else { 0 };
            interp.check_len(len)?;
            let mut items = Vec::with_capacity(len);
            for i in 0..len {
                items.push(interp.get_property(&source, &Value::Number(i as f64))?);
            }
            items
        }
        Value::Undefined | Value::Null => {
            return Err(type_error("Array.from requires an array-like object"));
        }
        Value::Array(_) | Value::Str(_) => interp.iterate(&source)?,
        _ => Vec::new(),
    };
    let mapper = arg(&args, 1);
    if mapper.is_nullish() {
        return Ok(Value::array(items));
    }
    let mut mapped = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        mapped.push(interp.call_value(&mapper, Value::Undefined, vec![
            item,
            Value::Number(i as f64),
        ])?);
    }
    Ok(Value::array(mapped))
}

fn array_of(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    interp.new_array(args)
}

fn string_from_char_code(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    let units: Vec<u16> = args
        .iter()
        .map(|v| to_int32(v.to_number()) as u16)
        .collect();
    interp.new_string(String::from_utf16_lossy(&units))
}

fn number_is_integer(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Bool(matches!(
        arg(&args, 0),
        Value::Number(n) if n.is_finite() && n.fract() == 0.0
    )))
}

fn number_is_safe_integer(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Bool(matches!(
        arg(&args, 0),
        Value::Number(n) if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0
    )))
}

fn number_is_finite(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Bool(matches!(arg(&args, 0), Value::Number(n) if n.is_finite())))
}

fn number_is_nan(_: &mut Interpreter, _: Value, args: Vec<Value>) -> NativeResult {
    Ok(Value::Bool(matches!(arg(&args, 0), Value::Number(n) if n.is_nan())))
}

// Number methods

fn number_method(interp: &mut Interpreter, n: f64, name: &str, args: &[Value]) -> NativeResult {
    match name {
        "toFixed" => {
            let digits = int_arg(args, 0, 0.0);
            if !(0.0..=100.0).contains(&digits) {
                return Err(range_error("toFixed() digits argument must be between 0 and 100"));
            }
            if !n.is_finite() || n.abs() >= 1e21 {
                return Ok(Value::string(number_to_string(n)));
            }
            interp.new_string(format!("{:.*}", digits as usize, n))
        }
        _ => {
            let radix = int_arg(args, 0, 10.0);
            if !(2.0..=36.0).contains(&radix) {
                return Err(range_error("toString() radix must be between 2 and 36"));
            }
            Ok(Value::string(to_radix_string(n, radix as u32)))
        }
    }
}

fn to_radix_string(n: f64, radix: u32) -> String {
    if radix == 10 || !n.is_finite() {
        return number_to_string(n);
    }
    let mut int = n.abs().trunc();
    let mut frac = n.abs().fract();
    let mut digits = Vec::new();
    loop {
        let digit = (int % f64::from(radix)) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('0'));
        int = (int / f64::from(radix)).trunc();
        if int == 0.0 {
            break;
        }
    }
    if n < 0.0 {
        digits.push('-');
    }
    let mut out: String = digits.into_iter().rev().collect();
    if frac > 0.0 {
        out.push('.');
        for _ in 0..20 {
            frac *= f64::from(radix);
            let digit = frac.trunc() as u32;
            out.push(std::char::from_digit(digit, radix).unwrap_or('0'));
            frac = frac.fract();
            if frac == 0.0 {
                break;
            }
        }
    }
    out
}

// String methods

fn char_index(haystack: &str, byte: usize) -> usize {
    haystack[..byte].chars().count()
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

fn string_method(
    interp: &mut Interpreter,
    s: &Rc<str>,
    name: &str,
    args: Vec<Value>,
) -> NativeResult {
    let s: &str = s;
    let len = s.chars().count();
    let chars = || s.chars();
    let text = |index: usize| match args.get(index) {
        None | Some(Value::Undefined) => None,
        Some(value) => Some(value.to_js_string()),
    };
    Ok(match name {
        "charAt" => {
            let i = int_arg(&args, 0, 0.0);
            let c = (i >= 0.0).then(|| chars().nth(i as usize)).flatten();
            Value::string(c.map(String::from).unwrap_or_default())
        }
        "charCodeAt" => {
            let i = int_arg(&args, 0, 0.0);
            let units: Vec<u16> = s.encode_utf16().collect();
            let unit = (i >= 0.0).then(|| units.get(i as usize)).flatten();
            Value::Number(unit.map_or(f64::NAN, |u| f64::from(*u)))
        }
        "at" => {
            let i = int_arg(&args, 0, 0.0);
            let index = if i < 0.0 { len as f64 + i } else { i };
            let c = (index >= 0.0).then(|| chars().nth(index as usize)).flatten();
            c.map_or(Value::Undefined, |c| Value::string(c.to_string()))
        }
        "indexOf" | "includes" => {
            let needle = text(0).unwrap_or_else(|| "undefined".to_string());
            let from = byte_offset(s, relative(int_arg(&args, 1, 0.0).max(0.0), len));
            let found = s[from..].find(&needle).map(|i| char_index(s, from + i));
            if name == "includes" {
                Value::Bool(found.is_some())
            } else {
                Value::Number(found.map_or(-1.0, |i| i as f64))
            }
        }
        "lastIndexOf" => {
            let needle = text(0).unwrap_or_else(|| "undefined".to_string());
            Value::Number(s.rfind(&needle).map_or(-1.0, |i| char_index(s, i) as f64))
        }
        "startsWith" => {
            let needle = text(0).unwrap_or_else(|| "undefined".to_string());
            let from = byte_offset(s, relative(int_arg(&args, 1, 0.0).max(0.0), len));
            Value::Bool(s[from..].starts_with(&needle))
        }
        "endsWith" => {
            let needle = text(0).unwrap_or_else(|| "undefined".to_string());
            let end = byte_offset(s, relative(int_arg(&args, 1, len as f64).max(0.0), len));
            Value::Bool(s[..end].ends_with(&needle))
        }
        "slice" => {
            let start = relative(int_arg(&args, 0, 0.0), len);
            let end = relative(int_arg(&args, 1, len as f64), len);
            Value::string(chars().skip(start).take(end.saturating_sub(start)).collect::<String>())
        }
        "substring" => {
            let clamp = |n: f64| n.clamp(0.0, len as f64) as usize;
            let a = clamp(int_arg(&args, 0, 0.0));
            let b = clamp(int_arg(&args, 1, len as f64));
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            Value::string(chars().skip(start).take(end - start).collect::<String>())
        }
        "substr" => {
            let start = relative(int_arg(&args, 0, 0.0), len);
            let count = int_arg(&args, 1, len as f64).max(0.0) as usize;
            Value::string(chars().skip(start).take(count).collect::<String>())
        }
        "toUpperCase" => interp.new_string(s.to_uppercase())?,
        "toLowerCase" => interp.new_string(s.to_lowercase())?,
        "trim" => Value::string(s.trim()),
        "trimStart" => Value::string(s.trim_start()),
        "trimEnd" => Value::string(s.trim_end()),
        "split" => {
            let limit = match args.get(1) {
                None | Some(Value::Undefined) => usize::MAX,
                Some(value) => to_uint32(value.to_number()) as usize,
            };
            let parts: Vec<Value> = match text(0) {
                None => vec![Value::string(s)],
                Some(sep) if sep.is_empty() => {
                    chars().take(limit).map(|c| Value::string(c.to_string())).collect()
                }
                Some(sep) => s.split(sep.as_str()).take(limit).map(Value::string).collect(),
            };
            interp.new_array(parts)?
        }
        "replace" | "replaceAll" => {
            let pattern = text(0).unwrap_or_else(|| "undefined".to_string());
            let replacement = arg(&args, 1);
            let mut out = String::new();
            let mut last = 0;
            for (offset, matched) in s.match_indices(pattern.as_str()) {
                out.push_str(&s[last..offset]);
                let piece = match &replacement {
                    Value::Function(_) => interp
                        .call_value(&replacement, Value::Undefined, vec![
                            Value::string(matched),
                            Value::Number(char_index(s, offset) as f64),
                            Value::string(s),
                        ])?
                        .to_js_string(),
                    other => other.to_js_string().replace("$&", matched),
                };
                out.push_str(&piece);
                last = offset + matched.len();
                interp.check_string_len(out.len())?;
                if name == "replace" {
                    break;
                }
            }
            out.push_str(&s[last..]);
            interp.new_string(out)?
        }
        "repeat" => {
            let count = int_arg(&args, 0, 0.0);
            if count < 0.0 || count.is_infinite() {
                return Err(range_error(format!("Invalid count value: {count}")));
            }
            let total = (s.len() as f64) * count;
            if total > usize::MAX as f64 {
                return Err(range_error(format!("Invalid count value: {count}")));
            }
            interp.check_string_len(total as usize)?;
            Value::string(s.repeat(count as usize))
        }
        "padStart" | "padEnd" => {
            let target = int_arg(&args, 0, 0.0).max(0.0) as usize;
            let fill = text(1).unwrap_or_else(|| " ".to_string());
            if target <= len || fill.is_empty() {
                Value::string(s)
            } else {
                interp.check_string_len(target.saturating_mul(4))?;
                let pad: String = fill.chars().cycle().take(target - len).collect();
                if name == "padStart" {
                    Value::string(format!("{pad}{s}"))
                } else {
                    Value::string(format!("{s}{pad}"))
                }
            }
        }
        "concat" => {
            let mut out = s.to_string();
            for value in &args {
                out.push_str(&value.to_js_string());
            }
            interp.new_string(out)?
        }
        _ => Value::string(s),
    })
}

// Array methods

/// SameValueZero, used by `includes`.
fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => strict_equals(a, b),
    }
}

fn callback(args: &[Value], method: &str) -> Result<Value, Interrupt> {
    match args.first() {
        Some(f @ Value::Function(_)) => Ok(f.clone()),
        Some(other) => Err(type_error(format!("{} is not a function", other.inspect()))),
        None => Err(type_error(format!("undefined is not a function ({method})"))),
    }
}

fn flatten_into(
    interp: &Interpreter,
    items: &[Value],
    depth: f64,
    out: &mut Vec<Value>,
) -> Result<(), Interrupt> {
    for item in items {
        match item {
            Value::Array(inner) if depth >= 1.0 => {
                let inner = inner.borrow().clone();
                flatten_into(interp, &inner, depth - 1.0, out)?;
            }
            other => out.push(other.clone()),
        }
        interp.check_len(out.len())?;
    }
    Ok(())
}

fn compare_items(
    interp: &mut Interpreter,
    comparator: &Value,
    a: &Value,
    b: &Value,
) -> Result<Ordering, Interrupt> {
    // `undefined` always sorts last.
    match (a, b) {
        (Value::Undefined, Value::Undefined) => return Ok(Ordering::Equal),
        (Value::Undefined, _) => return Ok(Ordering::Greater),
        (_, Value::Undefined) => return Ok(Ordering::Less),
        _ => {}
    }
    if comparator.is_nullish() {
        return Ok(a.to_js_string().cmp(&b.to_js_string()));
    }
    let result = interp
        .call_value(comparator, Value::Undefined, vec![a.clone(), b.clone()])?
        .to_number();
    Ok(if result > 0.0 {
        Ordering::Greater
    } else if result < 0.0 {
        Ordering::Less
    } else {
        Ordering::Equal
    })
}

/// Stable merge sort with a comparator that may throw.
fn merge_sort(
    interp: &mut Interpreter,
    comparator: &Value,
    mut items: Vec<Value>,
) -> Result<Vec<Value>, Interrupt> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(interp, comparator, items)?;
    let right = merge_sort(interp, comparator, right)?;
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(a), Some(b)) => compare_items(interp, comparator, a, b)? == Ordering::Greater,
            _ => break,
        };
        if take_right {
            merged.extend(right.next());
        } else {
            merged.extend(left.next());
        }
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

fn array_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
) -> NativeResult {
    let Value::Array(array) = receiver else {
        return Ok(Value::Undefined);
    };
    let snapshot = || array.borrow().clone();
    let len = array.borrow().len();

    Ok(match name {
        "push" => {
            interp.check_len(len + args.len())?;
            let mut items = array.borrow_mut();
            items.extend(args);
            Value::Number(items.len() as f64)
        }
        "pop" => array.borrow_mut().pop().unwrap_or(Value::Undefined),
        "shift" => {
            let mut items = array.borrow_mut();
            if items.is_empty() {
                Value::Undefined
            } else {
                items.remove(0)
            }
        }
        "unshift" => {
            interp.check_len(len + args.len())?;
            let mut items = array.borrow_mut();
            items.splice(0..0, args);
            Value::Number(items.len() as f64)
        }
        "slice" => {
            let start = relative(int_arg(&args, 0, 0.0), len);
            let end = relative(int_arg(&args, 1, len as f64), len);
            let items = array.borrow();
            Value::array(items.get(start..end.max(start)).unwrap_or_default().to_vec())
        }
        "splice" => {
            let start = relative(int_arg(&args, 0, 0.0), len);
            let count = match args.get(1) {
                None => len - start,
                Some(_) => (int_arg(&args, 1, 0.0).max(0.0) as usize).min(len - start),
            };
            let inserted: Vec<Value> = args.into_iter().skip(2).collect();
            interp.check_len(len - count + inserted.len())?;
            let removed: Vec<Value> = array
                .borrow_mut()
                .splice(start..start + count, inserted)
                .collect();
            Value::array(removed)
        }
        "concat" => {
            let mut items = snapshot();
            for value in args {
                match value {
                    Value::Array(other) => items.extend(other.borrow().iter().cloned()),
                    other => items.push(other),
                }
                interp.check_len(items.len())?;
            }
            Value::array(items)
        }
        "join" | "toString" => {
            let separator = match args.first() {
                Some(value) if name == "join" && !matches!(value, Value::Undefined) => {
                    value.to_js_string()
                }
                _ => ",".to_string(),
            };
            let mut out = String::new();
            for (i, item) in snapshot().iter().enumerate() {
                if i > 0 {
                    out.push_str(&separator);
                }
                if !item.is_nullish() {
                    out.push_str(&item.to_js_string());
                }
                interp.check_string_len(out.len())?;
            }
            Value::string(out)
        }
        "reverse" => {
            array.borrow_mut().reverse();
            receiver.clone()
        }
        "indexOf" => {
            let needle = arg(&args, 0);
            let from = relative(int_arg(&args, 1, 0.0), len);
            let items = array.borrow();
            let found = items
                .iter()
                .skip(from)
                .position(|item| strict_equals(item, &needle));
            Value::Number(found.map_or(-1.0, |i| (i + from) as f64))
        }
        "lastIndexOf" => {
            let needle = arg(&args, 0);
            let items = array.borrow();
            let found = items.iter().rposition(|item| strict_equals(item, &needle));
            Value::Number(found.map_or(-1.0, |i| i as f64))
        }
        "includes" => {
            let needle = arg(&args, 0);
            Value::Bool(array.borrow().iter().any(|item| same_value_zero(item, &needle)))
        }
        "at" => {
            let i = int_arg(&args, 0, 0.0);
            let index = if i < 0.0 { len as f64 + i } else { i };
            let items = array.borrow();
            (index >= 0.0)
                .then(|| items.get(index as usize).cloned())
                .flatten()
                .unwrap_or(Value::Undefined)
        }
        "keys" => Value::array((0..len).map(|i| Value::Number(i as f64)).collect()),
        "entries" => Value::array(
            snapshot()
                .into_iter()
                .enumerate()
                .map(|(i, item)| Value::array(vec![Value::Number(i as f64), item]))
                .collect(),
        ),
        "fill" => {
            let value = arg(&args, 0);
            let start = relative(int_arg(&args, 1, 0.0), len);
            let end = relative(int_arg(&args, 2, len as f64), len);
            let mut items = array.borrow_mut();
            for slot in items.iter_mut().take(end).skip(start) {
                *slot = value.clone();
            }
            receiver.clone()
        }
        "flat" => {
            let depth = int_arg(&args, 0, 1.0);
            let mut out = Vec::new();
            flatten_into(interp, &snapshot(), depth, &mut out)?;
            Value::array(out)
        }
        "sort" => {
            let comparator = arg(&args, 0);
            if !comparator.is_nullish() && !matches!(comparator, Value::Function(_)) {
                return Err(type_error(
                    "The comparison function must be either a function or undefined",
                ));
            }
            let sorted = merge_sort(interp, &comparator, snapshot())?;
            *array.borrow_mut() = sorted;
            receiver.clone()
        }
        "reduce" | "reduceRight" => {
            let f = callback(&args, name)?;
            let mut indices: Vec<usize> = (0..len).collect();
            if name == "reduceRight" {
                indices.reverse();
            }
            let mut indices = indices.into_iter();
            let mut acc = match args.get(1) {
                Some(initial) => initial.clone(),
                None => {
                    let first = indices.next().ok_or_else(|| {
                        type_error("Reduce of empty array with no initial value")
                    })?;
                    array.borrow().get(first).cloned().unwrap_or(Value::Undefined)
                }
            };
            for i in indices {
                let item = array.borrow().get(i).cloned().unwrap_or(Value::Undefined);
                acc = interp.call_value(&f, Value::Undefined, vec![
                    acc,
                    item,
                    Value::Number(i as f64),
                    receiver.clone(),
                ])?;
            }
            acc
        }
        _ => return iterate_with_callback(interp, receiver, array, name, &args),
    })
}

/// Array methods that call back once per element.
fn iterate_with_callback(
    interp: &mut Interpreter,
    receiver: &Value,
    array: &super::value::ArrayRef,
    name: &str,
    args: &[Value],
) -> NativeResult {
    let f = callback(args, name)?;
    let len = array.borrow().len();
    let indices: Vec<usize> = if name.starts_with("findLast") {
        (0..len).rev().collect()
    } else {
        (0..len).collect()
    };
    let mut collected = Vec::new();
    for i in indices {
        let item = array.borrow().get(i).cloned().unwrap_or(Value::Undefined);
        let result = interp.call_value(&f, Value::Undefined, vec![
            item.clone(),
            Value::Number(i as f64),
            receiver.clone(),
        ])?;
        match name {
            "map" => collected.push(result),
            "flatMap" => match result {
                Value::Array(inner) => collected.extend(inner.borrow().iter().cloned()),
                other => collected.push(other),
            },
            "filter" if result.truthy() => collected.push(item),
            "find" | "findLast" if result.truthy() => return Ok(item),
            "findIndex" | "findLastIndex" if result.truthy() => {
                return Ok(Value::Number(i as f64));
            }
            "some" if result.truthy() => return Ok(Value::Bool(true)),
            "every" if !result.truthy() => return Ok(Value::Bool(false)),
            _ => {}
        }
        interp.check_len(collected.len())?;
    }
    Ok(match name {
        "map" | "flatMap" | "filter" => Value::array(collected),
        "find" | "findLast" => Value::Undefined,
        "findIndex" | "findLastIndex" => Value::Number(-1.0),
        "some" => Value::Bool(false),
        "every" => Value::Bool(true),
        _ => Value::Undefined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_prefix() {
        assert_eq!(float_prefix("3.5kg"), 3.5);
        assert_eq!(float_prefix("  -2e3x"), -2000.0);
        assert_eq!(float_prefix("Infinity"), f64::INFINITY);
        assert_eq!(float_prefix("1e"), 1.0);
        assert!(float_prefix("abc").is_nan());
        assert!(float_prefix(".").is_nan());
    }

    #[test]
    fn test_to_radix_string() {
        assert_eq!(to_radix_string(255.0, 16), "ff");
        assert_eq!(to_radix_string(-5.0, 2), "-101");
        assert_eq!(to_radix_string(0.5, 2), "0.1");
        assert_eq!(to_radix_string(42.0, 10), "42");
    }

    #[test]
    fn test_relative_index() {
        assert_eq!(relative(-1.0, 5), 4);
        assert_eq!(relative(-10.0, 5), 0);
        assert_eq!(relative(7.0, 5), 5);
    }

    #[test]
    fn test_method_lookup() {
        assert!(method(&Value::array(vec![]), "map").is_some());
        assert!(method(&Value::string("x"), "toUpperCase").is_some());
        assert!(method(&Value::string("x"), "map").is_none());
        assert!(method(&Value::Null, "toString").is_none());
    }

    #[test]
    fn test_keys_of() {
        assert_eq!(keys_of(&Value::string("ab")), vec!["0", "1"]);
        assert!(keys_of(&Value::Number(1.0)).is_empty());
    }
}
