//! Function registry.
//!
//! The registry is a write-once name → callable store. Functions arrive from
//! [`FunctionPack`]s or are saved by the user from generated code; they live
//! for the lifetime of the registry and are never replaced.
//!
//! This module provides:
//!
//! - [`FunctionRegistry`] - Registration, lookup and logged execution
//! - [`FunctionPack`] - A named bundle of functions loaded in one go
//! - [`math_pack`] / [`string_pack`] - The built-in packs
//! - [`save_script_function`] - Register a sandboxed script as a function
//! - [`generate_function`] - Ask a text generator for a function to save

mod generate;
mod packs;
mod script;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::log::ExecutionLog;

pub use packs::{
    FunctionPack, PackFunction, builtin_packs, load_pack, load_packs, math_pack, string_pack,
};
pub use generate::generate_function;
pub use script::{SaveError, save_script_function};

/// Failure raised by a registered callable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct FunctionError {
    /// The failure message, surfaced unchanged to callers
    pub message: String,
}

impl FunctionError {
    /// Create a new function error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A registered callable: JSON arguments in, JSON value out.
pub type Callable = Arc<dyn Fn(&[Value]) -> Result<Value, FunctionError> + Send + Sync>;

/// Wrap a closure as a [`Callable`].
pub fn callable<F>(f: F) -> Callable
where
    F: Fn(&[Value]) -> Result<Value, FunctionError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A function with this name is already registered
    #[error("function \"{0}\" already exists in the registry")]
    DuplicateName(String),
    /// No function with this name is registered
    #[error("function \"{0}\" not found in registry")]
    NotFound(String),
    /// The callable itself failed
    #[error(transparent)]
    Function(#[from] FunctionError),
}

/// Descriptive metadata stored alongside a callable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    /// Name of the pack the function was loaded from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pack: Option<String>,
    /// One-line documentation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Modules the function expects to import
    #[serde(default)]
    pub imports: Vec<String>,
    /// Other registered functions this one calls
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// The subset of dependencies the function cannot work without
    #[serde(default)]
    pub key_dependencies: Vec<String>,
}

impl FunctionMetadata {
    /// Metadata tagging a function with its pack.
    pub fn from_pack(pack: impl Into<String>) -> Self {
        Self {
            pack: Some(pack.into()),
            ..Self::default()
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A stored registry entry.
#[derive(Clone)]
pub struct RegisteredFunction {
    /// Unique registry key
    pub name: String,
    /// The callable
    pub callable: Callable,
    /// Descriptive metadata
    pub metadata: FunctionMetadata,
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Write-once store of named callables with logged execution.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use warden::registry::{FunctionMetadata, FunctionRegistry, callable};
///
/// let registry = FunctionRegistry::new();
/// let double = callable(|args| Ok(json!(args[0].as_f64().unwrap_or(0.0) * 2.0)));
/// registry
///     .register("double", double, FunctionMetadata::default())
///     .unwrap();
/// assert_eq!(registry.execute("double", &[json!(4)]).unwrap(), json!(8.0));
/// ```
pub struct FunctionRegistry {
    functions: RwLock<IndexMap<String, RegisteredFunction>>,
    log: Arc<ExecutionLog>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.list())
            .finish_non_exhaustive()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    /// Create an empty registry with its own log.
    pub fn new() -> Self {
        Self::with_log(Arc::new(ExecutionLog::new()))
    }

    /// Create an empty registry writing to a shared log.
    pub fn with_log(log: Arc<ExecutionLog>) -> Self {
        Self {
            functions: RwLock::new(IndexMap::new()),
            log,
        }
    }

    /// The log this registry writes to.
    pub fn log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    /// Register a callable under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] if the name is taken; the
    /// existing entry is left untouched.
    pub fn register(
        &self,
        name: impl Into<String>,
        callable: Callable,
        metadata: FunctionMetadata,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        {
            let mut functions = self
                .functions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if functions.contains_key(&name) {
                drop(functions);
                self.log
                    .error(format!("Function \"{name}\" already exists in the registry"));
                return Err(RegistryError::DuplicateName(name));
            }
            functions.insert(
                name.clone(),
                RegisteredFunction {
                    name: name.clone(),
                    callable,
                    metadata,
                },
            );
        }
        self.log
            .info(format!("Function \"{name}\" registered successfully"));
        Ok(())
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<RegisteredFunction> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Invoke the function registered under `name`.
    ///
    /// Logs the attempt and the outcome. A failure from the callable is
    /// returned as-is inside [`RegistryError::Function`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown names.
    pub fn execute(&self, name: &str, args: &[Value]) -> Result<Value, RegistryError> {
        // Clone out of the lock: callables may call back into the registry.
        let Some(entry) = self.get(name) else {
            self.log
                .error(format!("Function \"{name}\" not found in registry"));
            return Err(RegistryError::NotFound(name.to_string()));
        };

        self.log.info(format!("Executing function \"{name}\""));
        match (entry.callable)(args) {
            Ok(value) => {
                self.log
                    .info(format!("Function \"{name}\" executed successfully"));
                Ok(value)
            }
            Err(err) => {
                self.log
                    .error(format!("Error executing function \"{name}\": {err}"));
                Err(RegistryError::Function(err))
            }
        }
    }

    /// All registered names in registration order.
    pub fn list(&self) -> Vec<String> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Name → description for every function, in registration order.
    ///
    /// Functions registered without a description map to an empty string.
    pub fn docs(&self) -> IndexMap<String, String> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|f| {
                (
                    f.name.clone(),
                    f.metadata.description.clone().unwrap_or_default(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(value: Value) -> Callable {
        callable(move |_| Ok(value.clone()))
    }

    #[test]
    fn test_register_and_list_in_order() {
        let registry = FunctionRegistry::new();
        registry
            .register("b", constant(json!(1)), FunctionMetadata::default())
            .unwrap();
        registry
            .register("a", constant(json!(2)), FunctionMetadata::default())
            .unwrap();
        assert_eq!(registry.list(), vec!["b", "a"]);
        assert!(registry.contains("a"));
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = FunctionRegistry::new();
        registry
            .register("f", constant(json!("first")), FunctionMetadata::default())
            .unwrap();
        let err = registry
            .register("f", constant(json!("second")), FunctionMetadata::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(ref n) if n == "f"));

        // Never silently overwritten
        assert_eq!(registry.execute("f", &[]).unwrap(), json!("first"));
    }

    #[test]
    fn test_execute_unknown_name() {
        let registry = FunctionRegistry::new();
        let err = registry.execute("missing", &[]).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(ref n) if n == "missing"));
        assert_eq!(err.to_string(), "function \"missing\" not found in registry");
    }

    #[test]
    fn test_successful_execute_appends_two_log_entries() {
        let registry = FunctionRegistry::new();
        registry
            .register("one", constant(json!(1)), FunctionMetadata::default())
            .unwrap();

        let before = registry.log().len();
        registry.execute("one", &[]).unwrap();
        let entries = registry.log().entries();
        assert_eq!(entries.len(), before + 2);
        assert_eq!(entries[before].message, "Executing function \"one\"");
        assert_eq!(
            entries[before + 1].message,
            "Function \"one\" executed successfully"
        );
    }

    #[test]
    fn test_callable_failure_propagates_unchanged() {
        let registry = FunctionRegistry::new();
        registry
            .register(
                "fail",
                callable(|_| Err(FunctionError::new("Division by zero"))),
                FunctionMetadata::default(),
            )
            .unwrap();

        let err = registry.execute("fail", &[]).unwrap_err();
        match err {
            RegistryError::Function(inner) => assert_eq!(inner.message, "Division by zero"),
            other => panic!("unexpected error: {other:?}"),
        }
        let last = registry.log().entries().pop().unwrap();
        assert_eq!(last.level, crate::log::LogLevel::Error);
    }

    #[test]
    fn test_docs_and_metadata() {
        let registry = FunctionRegistry::new();
        registry
            .register(
                "f",
                constant(Value::Null),
                FunctionMetadata::from_pack("Test Pack").with_description("does f"),
            )
            .unwrap();
        registry
            .register("g", constant(Value::Null), FunctionMetadata::default())
            .unwrap();

        let docs = registry.docs();
        assert_eq!(docs["f"], "does f");
        assert_eq!(docs["g"], "");
        assert_eq!(
            registry.get("f").unwrap().metadata.pack.as_deref(),
            Some("Test Pack")
        );
    }

    #[test]
    fn test_shared_log() {
        let log = Arc::new(ExecutionLog::new());
        let registry = FunctionRegistry::with_log(Arc::clone(&log));
        registry
            .register("f", constant(Value::Null), FunctionMetadata::default())
            .unwrap();
        assert_eq!(log.len(), 1);
    }
}
