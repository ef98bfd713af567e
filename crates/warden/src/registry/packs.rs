//! Function packs and the built-in packs.

use std::fmt;

use serde_json::Value;

use super::{Callable, FunctionError, FunctionMetadata, FunctionRegistry, RegistryError, callable};
use crate::sandbox::number_to_json;

/// One function inside a [`FunctionPack`].
#[derive(Clone)]
pub struct PackFunction {
    /// Registry name
    pub name: String,
    /// One-line documentation
    pub description: String,
    /// The callable
    pub callable: Callable,
}

impl fmt::Debug for PackFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackFunction")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A named bundle of functions registered together.
#[derive(Debug, Clone)]
pub struct FunctionPack {
    /// Pack name, recorded in each function's metadata
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Functions in registration order
    pub functions: Vec<PackFunction>,
}

impl FunctionPack {
    /// Create an empty pack.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            functions: Vec::new(),
        }
    }

    /// Add a function to the pack.
    pub fn function<F>(mut self, name: &str, description: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, FunctionError> + Send + Sync + 'static,
    {
        self.functions.push(PackFunction {
            name: name.to_string(),
            description: description.to_string(),
            callable: callable(f),
        });
        self
    }
}

/// Register every function of `pack`, tagging metadata with the pack name.
///
/// Functions are registered in order; a duplicate name stops loading at that
/// function and returns the error. Functions registered before it stay.
///
/// # Errors
///
/// Returns [`RegistryError::DuplicateName`] if any name is already taken.
pub fn load_pack(registry: &FunctionRegistry, pack: &FunctionPack) -> Result<(), RegistryError> {
    registry
        .log()
        .info(format!("Loading function pack: {}", pack.name));
    for function in &pack.functions {
        registry.register(
            function.name.clone(),
            function.callable.clone(),
            FunctionMetadata::from_pack(&pack.name).with_description(&function.description),
        )?;
    }
    registry
        .log()
        .info(format!("Function pack {} loaded successfully", pack.name));
    Ok(())
}

/// Load several packs in order.
///
/// # Errors
///
/// Stops at the first pack that fails to load.
pub fn load_packs<'a>(
    registry: &FunctionRegistry,
    packs: impl IntoIterator<Item = &'a FunctionPack>,
) -> Result<(), RegistryError> {
    packs.into_iter().try_for_each(|pack| load_pack(registry, pack))
}

/// The packs every CLI registry starts with.
pub fn builtin_packs() -> Vec<FunctionPack> {
    vec![math_pack(), string_pack()]
}

/// Basic arithmetic: `add`, `subtract`, `multiply`, `divide`.
pub fn math_pack() -> FunctionPack {
    FunctionPack::new("Math Pack", "Basic mathematical operations")
        .function("add", "Adds two numbers.", |args| {
            let (a, b) = two_numbers("add", args)?;
            Ok(number_to_json(a + b))
        })
        .function(
            "subtract",
            "Subtracts the second number from the first.",
            |args| {
                let (a, b) = two_numbers("subtract", args)?;
                Ok(number_to_json(a - b))
            },
        )
        .function("multiply", "Multiplies two numbers.", |args| {
            let (a, b) = two_numbers("multiply", args)?;
            Ok(number_to_json(a * b))
        })
        .function(
            "divide",
            "Divides the first number by the second. Fails on division by zero.",
            |args| {
                let (a, b) = two_numbers("divide", args)?;
                if b == 0.0 {
                    return Err(FunctionError::new("Division by zero"));
                }
                Ok(number_to_json(a / b))
            },
        )
}

/// String helpers: `reverse`, `capitalize`, `countWords`.
pub fn string_pack() -> FunctionPack {
    FunctionPack::new("String Pack", "String manipulation functions")
        .function("reverse", "Reverses a string.", |args| {
            let s = string_arg("reverse", args)?;
            Ok(Value::String(s.chars().rev().collect()))
        })
        .function(
            "capitalize",
            "Capitalizes the first letter of a string.",
            |args| {
                let s = string_arg("capitalize", args)?;
                let mut chars = s.chars();
                let capitalized = match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                };
                Ok(Value::String(capitalized))
            },
        )
        .function(
            "countWords",
            "Counts the number of whitespace-separated words in a string.",
            |args| {
                let s = string_arg("countWords", args)?;
                // An empty string still counts as one (empty) word.
                let count = s.split_whitespace().count().max(1);
                Ok(Value::from(count))
            },
        )
}

fn two_numbers(name: &str, args: &[Value]) -> Result<(f64, f64), FunctionError> {
    match args {
        [a, b, ..] => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(FunctionError::new(format!(
                "{name} expects two numbers, got {a} and {b}"
            ))),
        },
        _ => Err(FunctionError::new(format!(
            "{name} expects two arguments, got {}",
            args.len()
        ))),
    }
}

fn string_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, FunctionError> {
    args.first()
        .and_then(Value::as_str)
        .ok_or_else(|| FunctionError::new(format!("{name} expects a string argument")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loaded() -> FunctionRegistry {
        let registry = FunctionRegistry::new();
        load_packs(&registry, &builtin_packs()).unwrap();
        registry
    }

    #[test]
    fn test_builtin_packs_register_in_order() {
        let registry = loaded();
        assert_eq!(
            registry.list(),
            vec![
                "add",
                "subtract",
                "multiply",
                "divide",
                "reverse",
                "capitalize",
                "countWords"
            ]
        );
        let add = registry.get("add").unwrap();
        assert_eq!(add.metadata.pack.as_deref(), Some("Math Pack"));
        assert_eq!(add.metadata.description.as_deref(), Some("Adds two numbers."));
    }

    #[test]
    fn test_math_pack() {
        let registry = loaded();
        assert_eq!(registry.execute("add", &[json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(
            registry.execute("subtract", &[json!(2), json!(3)]).unwrap(),
            json!(-1)
        );
        assert_eq!(
            registry.execute("multiply", &[json!(1.5), json!(2)]).unwrap(),
            json!(3)
        );
        assert_eq!(
            registry.execute("divide", &[json!(1), json!(4)]).unwrap(),
            json!(0.25)
        );
    }

    #[test]
    fn test_divide_by_zero() {
        let registry = loaded();
        let err = registry
            .execute("divide", &[json!(1), json!(0)])
            .unwrap_err();
        assert_eq!(err.to_string(), "Division by zero");
    }

    #[test]
    fn test_math_argument_errors() {
        let registry = loaded();
        assert!(registry.execute("add", &[json!(1)]).is_err());
        assert!(registry.execute("add", &[json!("1"), json!(2)]).is_err());
    }

    #[test]
    fn test_string_pack() {
        let registry = loaded();
        assert_eq!(
            registry.execute("reverse", &[json!("abc")]).unwrap(),
            json!("cba")
        );
        assert_eq!(
            registry.execute("capitalize", &[json!("hello world")]).unwrap(),
            json!("Hello world")
        );
        assert_eq!(registry.execute("capitalize", &[json!("")]).unwrap(), json!(""));
        assert_eq!(
            registry
                .execute("countWords", &[json!("  the quick  brown fox ")])
                .unwrap(),
            json!(4)
        );
        assert_eq!(registry.execute("countWords", &[json!("")]).unwrap(), json!(1));
    }

    #[test]
    fn test_duplicate_across_packs_fails() {
        let registry = loaded();
        let clash = FunctionPack::new("Clash", "").function("add", "", |_| Ok(Value::Null));
        let err = load_pack(&registry, &clash).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(ref n) if n == "add"));
        assert_eq!(
            registry.get("add").unwrap().metadata.pack.as_deref(),
            Some("Math Pack")
        );
    }
}
