//! Runtime values and conversions to and from JSON.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use super::ast::FunctionDef;
use super::capability::Capability;
use super::interpreter::{Interpreter, Interrupt, Scope};

/// Nesting beyond which conversions stop descending.
const MAX_CONVERT_DEPTH: usize = 64;

/// Values visited by one conversion. Shared sub-structures are visited
/// once per reference, so the count bounds the work, not the heap size.
const MAX_CONVERT_NODES: usize = 1_000_000;

/// Rendering stops growing past this many bytes.
const MAX_INSPECT_BYTES: usize = 1 << 20;

/// Integral numbers below this magnitude fit an `i64`.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

pub(crate) type ArrayRef = Rc<RefCell<Vec<Value>>>;
pub(crate) type ObjectRef = Rc<RefCell<IndexMap<String, Value>>>;

/// Host function: interpreter, `this`, arguments.
pub(crate) type NativeFn = fn(&mut Interpreter, Value, Vec<Value>) -> Result<Value, Interrupt>;

#[derive(Clone)]
pub(crate) enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
    Function(Rc<Function>),
}

pub(crate) enum Function {
    Closure {
        def: Rc<FunctionDef>,
        env: Rc<Scope>,
    },
    Native {
        name: &'static str,
        call: NativeFn,
    },
    /// Built-in method bound to a string, number or array receiver
    Method {
        receiver: Value,
        name: &'static str,
    },
    /// Method of a capability handed in by the caller
    Capability {
        binding: String,
        method: String,
        capability: Arc<dyn Capability>,
    },
}

impl Function {
    pub(crate) fn name(&self) -> &str {
        match self {
            Function::Closure { def, .. } => def.name.as_deref().unwrap_or("anonymous"),
            Function::Native { name, .. } | Function::Method { name, .. } => name,
            Function::Capability { method, .. } => method,
        }
    }
}

impl Value {
    pub(crate) fn string(s: impl Into<Rc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub(crate) fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub(crate) fn object(entries: IndexMap<String, Value>) -> Self {
        Value::Object(Rc::new(RefCell::new(entries)))
    }

    pub(crate) fn native(name: &'static str, call: NativeFn) -> Self {
        Value::Function(Rc::new(Function::Native { name, call }))
    }

    pub(crate) fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub(crate) fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) => true,
        }
    }

    pub(crate) fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Array(_) | Value::Object(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
        }
    }

    pub(crate) fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => string_to_number(s),
            Value::Array(items) => {
                let items = items.borrow();
                match items.as_slice() {
                    [] => 0.0,
                    [only] => only.to_number(),
                    _ => f64::NAN,
                }
            }
            Value::Object(_) | Value::Function(_) => f64::NAN,
        }
    }

    /// String conversion as done by `String(value)` and concatenation.
    pub(crate) fn to_js_string(&self) -> String {
        let mut budget = MAX_CONVERT_NODES;
        self.to_js_string_at(0, &mut budget)
    }

    fn to_js_string_at(&self, depth: usize, budget: &mut usize) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => {
                if depth > MAX_CONVERT_DEPTH || *budget == 0 {
                    return String::new();
                }
                *budget -= 1;
                items
                    .borrow()
                    .iter()
                    .map(|item| match item {
                        Value::Undefined | Value::Null => String::new(),
                        other => other.to_js_string_at(depth + 1, budget),
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Object(entries) => match error_parts(&entries.borrow()) {
                Some((name, message)) if message.is_empty() => name,
                Some((name, message)) => format!("{name}: {message}"),
                None => "[object Object]".to_string(),
            },
            Value::Function(f) => format!("function {}() {{ [native code] }}", f.name()),
        }
    }

    /// Rendering used by `console.*`.
    pub(crate) fn inspect(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => {
                let mut out = String::new();
                other.inspect_into(&mut out, 0);
                out
            }
        }
    }

    fn inspect_into(&self, out: &mut String, depth: usize) {
        if out.len() > MAX_INSPECT_BYTES {
            return;
        }
        match self {
            Value::Str(s) => {
                let _ = write!(out, "'{}'", s.replace('\'', "\\'"));
            }
            Value::Array(items) => {
                let items = items.borrow();
                if items.is_empty() {
                    out.push_str("[]");
                } else if depth >= 3 {
                    out.push_str("[Array]");
                } else {
                    out.push_str("[ ");
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        item.inspect_into(out, depth + 1);
                    }
                    out.push_str(" ]");
                }
            }
            Value::Object(entries) => {
                let entries = entries.borrow();
                if let Some((name, message)) = error_parts(&entries) {
                    let _ = write!(out, "{name}: {message}");
                } else if entries.is_empty() {
                    out.push_str("{}");
                } else if depth >= 3 {
                    out.push_str("[Object]");
                } else {
                    out.push_str("{ ");
                    for (i, (key, value)) in entries.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        let _ = write!(out, "{key}: ");
                        value.inspect_into(out, depth + 1);
                    }
                    out.push_str(" }");
                }
            }
            Value::Function(f) => {
                let _ = write!(out, "[Function: {}]", f.name());
            }
            other => out.push_str(&other.to_js_string()),
        }
    }

    /// JSON form of the value, as `JSON.stringify` sees it.
    pub(crate) fn to_json(&self) -> Result<Json, Circular> {
        let mut budget = MAX_CONVERT_NODES;
        self.to_json_at(&mut Vec::new(), &mut budget)
    }

    fn to_json_at(
        &self,
        ancestors: &mut Vec<*const ()>,
        budget: &mut usize,
    ) -> Result<Json, Circular> {
        if ancestors.len() > MAX_CONVERT_DEPTH || *budget == 0 {
            return Ok(Json::Null);
        }
        *budget -= 1;
        let json = match self {
            Value::Undefined | Value::Null | Value::Function(_) => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::Str(s) => Json::String(s.to_string()),
            Value::Array(items) => {
                enter(ancestors, Rc::as_ptr(items).cast())?;
                let converted = items
                    .borrow()
                    .iter()
                    .map(|item| item.to_json_at(ancestors, budget))
                    .collect::<Result<Vec<_>, Circular>>();
                ancestors.pop();
                Json::Array(converted?)
            }
            Value::Object(entries) => {
                enter(ancestors, Rc::as_ptr(entries).cast())?;
                let converted = entries
                    .borrow()
                    .iter()
                    .filter(|(_, v)| !matches!(v, Value::Undefined | Value::Function(_)))
                    .map(|(k, v)| Ok((k.clone(), v.to_json_at(ancestors, budget)?)))
                    .collect::<Result<serde_json::Map<_, _>, Circular>>();
                ancestors.pop();
                Json::Object(converted?)
            }
        };
        Ok(json)
    }

    pub(crate) fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::string(s.as_str()),
            Json::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            Json::Object(entries) => Value::object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// A container reached itself while converting to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Circular;

impl std::fmt::Display for Circular {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Converting circular structure to JSON")
    }
}

fn enter(ancestors: &mut Vec<*const ()>, container: *const ()) -> Result<(), Circular> {
    if ancestors.contains(&container) {
        return Err(Circular);
    }
    ancestors.push(container);
    Ok(())
}

/// `===`
pub(crate) fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// `==`
pub(crate) fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (x, y) if x.is_nullish() || y.is_nullish() => x.is_nullish() && y.is_nullish(),
        (Value::Bool(_), _) | (_, Value::Bool(_)) => a.to_number() == b.to_number(),
        (Value::Number(x), Value::Str(_) | Value::Array(_)) => *x == b.to_number(),
        (Value::Str(_) | Value::Array(_), Value::Number(y)) => a.to_number() == *y,
        (Value::Str(x), Value::Array(_)) => x.as_ref() == b.to_js_string().as_str(),
        (Value::Array(_), Value::Str(y)) => a.to_js_string().as_str() == y.as_ref(),
        _ => strict_equals(a, b),
    }
}

/// `{ name, message }` of an error-shaped object.
fn error_parts(entries: &IndexMap<String, Value>) -> Option<(String, String)> {
    match (entries.get("name"), entries.get("message")) {
        (Some(Value::Str(name)), Some(Value::Str(message))) if name.ends_with("Error") => {
            Some((name.to_string(), message.to_string()))
        }
        _ => None,
    }
}

pub(crate) fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let lower = trimmed.to_ascii_lowercase();
    let radix = |digits: &str, radix: u32| {
        u64::from_str_radix(digits, radix)
            .map(|v| v as f64)
            .unwrap_or(f64::NAN)
    };
    if let Some(hex) = lower.strip_prefix("0x") {
        return radix(hex, 16);
    }
    if let Some(oct) = lower.strip_prefix("0o") {
        return radix(oct, 8);
    }
    if let Some(bin) = lower.strip_prefix("0b") {
        return radix(bin, 2);
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if lower.contains("inf") || lower.contains("nan") => f64::NAN,
        _ => trimmed.parse().unwrap_or(f64::NAN),
    }
}

/// Number formatting as done by `String(number)`.
pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("{sign}Infinity")
    } else if n == 0.0 {
        "0".to_string()
    } else if n.abs() >= 1e21 || n.abs() < 1e-6 {
        let formatted = format!("{n:e}");
        match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => formatted,
        }
    } else {
        format!("{n}")
    }
}

/// JSON form of a number: integral values become JSON integers.
pub(crate) fn number_to_json(n: f64) -> Json {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < I64_BOUND {
        Json::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_to_string() {
        assert_eq!(number_to_string(2.0), "2");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(123456789012345680000.0), "123456789012345680000");
        assert_eq!(number_to_string(2f64.powi(53) + 1.0), "9007199254740992");
        assert_eq!(number_to_string(1e-7), "1e-7");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_number_to_json() {
        assert_eq!(number_to_json(2.0), json!(2));
        assert_eq!(number_to_json(0.5), json!(0.5));
        assert_eq!(number_to_json(f64::NAN), Json::Null);
        assert_eq!(number_to_json(2f64.powi(53) + 1.0).to_string(), "9007199254740992");
    }

    #[test]
    fn test_string_to_number() {
        assert_eq!(string_to_number(" 42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x10"), 16.0);
        assert!(string_to_number("abc").is_nan());
        assert!(string_to_number("nan").is_nan());
    }

    #[test]
    fn test_equality() {
        let one = Value::Number(1.0);
        let one_str = Value::string("1");
        assert!(!strict_equals(&one, &one_str));
        assert!(loose_equals(&one, &one_str));
        assert!(loose_equals(&Value::Null, &Value::Undefined));
        assert!(!loose_equals(&Value::Null, &Value::Number(0.0)));
        assert!(loose_equals(&Value::Bool(true), &one));

        let arr = Value::array(vec![]);
        assert!(strict_equals(&arr, &arr.clone()));
        assert!(!strict_equals(&arr, &Value::array(vec![])));
    }

    #[test]
    fn test_json_round_trip_keeps_structure() {
        let json = json!({"a": [1, "two", null, true], "b": {"c": 1.5}});
        assert_eq!(Value::from_json(&json).to_json(), Ok(json));
    }

    #[test]
    fn test_json_drops_undefined_properties() {
        let mut entries = IndexMap::new();
        entries.insert("kept".to_string(), Value::Number(1.0));
        entries.insert("dropped".to_string(), Value::Undefined);
        assert_eq!(Value::object(entries).to_json(), Ok(json!({"kept": 1})));
    }

    #[test]
    fn test_json_rejects_cycles_but_not_sharing() {
        let shared = Value::array(vec![Value::Number(1.0)]);
        let pair = Value::array(vec![shared.clone(), shared]);
        assert_eq!(pair.to_json(), Ok(json!([[1], [1]])));

        let object = Value::object(IndexMap::new());
        if let Value::Object(entries) = &object {
            entries.borrow_mut().insert("self".to_string(), object.clone());
        }
        assert_eq!(object.to_json(), Err(Circular));
        // Break the cycle so the test does not leak
        if let Value::Object(entries) = &object {
            entries.borrow_mut().clear();
        }
    }

    #[test]
    fn test_to_js_string() {
        let arr = Value::array(vec![Value::Number(1.0), Value::Null, Value::string("x")]);
        assert_eq!(arr.to_js_string(), "1,,x");

        let mut entries = IndexMap::new();
        entries.insert("name".to_string(), Value::string("TypeError"));
        entries.insert("message".to_string(), Value::string("bad"));
        assert_eq!(Value::object(entries).to_js_string(), "TypeError: bad");
    }

    #[test]
    fn test_inspect() {
        let mut entries = IndexMap::new();
        entries.insert("a".to_string(), Value::Number(1.0));
        entries.insert("b".to_string(), Value::string("x"));
        assert_eq!(Value::object(entries).inspect(), "{ a: 1, b: 'x' }");
        assert_eq!(Value::string("plain").inspect(), "plain");
        assert_eq!(
            Value::array(vec![Value::Number(1.0), Value::Bool(true)]).inspect(),
            "[ 1, true ]"
        );
    }
}
