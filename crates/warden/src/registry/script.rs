//! Registering sandboxed scripts as registry functions.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;

use super::{FunctionError, FunctionMetadata, FunctionRegistry, RegistryError, callable};
use crate::sandbox::{Sandbox, SandboxContext, SandboxError};

/// Errors from [`save_script_function`].
#[derive(Debug, Error)]
pub enum SaveError {
    /// The source was rejected or failed while being evaluated
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    /// The source evaluated to something other than a function
    #[error("source of \"{0}\" does not evaluate to a function")]
    NotAFunction(String),
    /// Registration failed
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Register a function expression as `name`.
///
/// `source` must be a function expression such as `(a, b) => a + b`. It is
/// checked once at save time; every call re-runs it in `sandbox` with the
/// call's JSON arguments and no capabilities.
///
/// # Errors
///
/// Fails if the source is rejected by the sandbox, does not evaluate to a
/// function, or the name is taken.
pub fn save_script_function(
    registry: &FunctionRegistry,
    sandbox: Arc<Sandbox>,
    name: &str,
    source: &str,
) -> Result<(), SaveError> {
    let kind = sandbox.execute(&format!("return typeof ({source});"), &SandboxContext::new())?;
    if kind.value != json!("function") {
        return Err(SaveError::NotAFunction(name.to_string()));
    }

    let code = format!("return ({source});");
    let function = callable(move |args| {
        sandbox
            .call(&code, args, &SandboxContext::new())
            .map(|result| result.value)
            .map_err(|err| match err {
                SandboxError::Execution { message } => FunctionError::new(message),
                other => FunctionError::new(other.to_string()),
            })
    });

    let metadata = FunctionMetadata {
        description: Some("User-saved script function".to_string()),
        ..FunctionMetadata::default()
    };
    registry.register(name, function, metadata)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_function_runs_in_sandbox() {
        let registry = FunctionRegistry::new();
        let sandbox = Arc::new(Sandbox::default());
        let source = "(a, b) => Math.sqrt(a * a + b * b)";
        save_script_function(&registry, sandbox, "hypot", source).unwrap();

        assert_eq!(registry.execute("hypot", &[json!(3), json!(4)]).unwrap(), json!(5));
        assert_eq!(
            registry.get("hypot").unwrap().metadata.description.as_deref(),
            Some("User-saved script function")
        );
    }

    #[test]
    fn test_saved_function_errors_surface_unchanged() {
        let registry = FunctionRegistry::new();
        let sandbox = Arc::new(Sandbox::default());
        let source = "function (x) { if (x < 0) throw new Error('negative'); return x; }";
        save_script_function(&registry, sandbox, "positive", source).unwrap();

        let err = registry.execute("positive", &[json!(-1)]).unwrap_err();
        assert_eq!(err.to_string(), "negative");
    }

    #[test]
    fn test_rejects_non_functions_and_unsafe_code() {
        let registry = FunctionRegistry::new();
        let sandbox = Arc::new(Sandbox::default());

        let err = save_script_function(&registry, sandbox.clone(), "n", "42").unwrap_err();
        assert!(matches!(err, SaveError::NotAFunction(_)));

        let err =
            save_script_function(&registry, sandbox, "bad", "() => eval('1')").unwrap_err();
        assert!(matches!(err, SaveError::Sandbox(SandboxError::Unsafe { .. })));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_duplicate_name() {
        let registry = FunctionRegistry::new();
        let sandbox = Arc::new(Sandbox::default());
        save_script_function(&registry, sandbox.clone(), "id", "x => x").unwrap();
        let err = save_script_function(&registry, sandbox, "id", "y => y").unwrap_err();
        assert!(matches!(err, SaveError::Registry(RegistryError::DuplicateName(_))));
    }
}
