//! Capabilities handed into sandboxed code.
//!
//! A capability is the only way a script reaches anything outside its own
//! heap. Calls cross the boundary as JSON: arguments are converted from
//! interpreter values, results are converted back, and a
//! [`CapabilityError`] surfaces inside the script as a thrown `Error`.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Value, json};
use thiserror::Error;

use crate::permission::{Permission, PermissionSystem};
use crate::registry::FunctionRegistry;
use crate::vfs::VirtualFs;

/// Errors raised by a capability call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// The capability has no such method
    #[error("{capability}.{method} is not a function")]
    UnknownMethod {
        /// Capability name
        capability: String,
        /// Requested method
        method: String,
    },
    /// An argument was missing or had the wrong type
    #[error("{method}: {message}")]
    InvalidArgument {
        /// Method being called
        method: String,
        /// What was wrong
        message: String,
    },
    /// The underlying operation failed
    #[error("{0}")]
    Failed(String),
}

impl CapabilityError {
    fn invalid(method: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

/// A host object exposed to sandboxed code.
///
/// Implementations must be thread-safe: a run executes on its own thread and
/// several runs may share one capability.
pub trait Capability: Send + Sync {
    /// Default binding name inside the sandbox.
    fn name(&self) -> &str;

    /// Methods the sandbox exposes on the binding.
    fn methods(&self) -> &[&'static str];

    /// Invoke `method` with JSON arguments.
    fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, CapabilityError>;
}

/// Named capabilities visible to one run. Nothing else is in scope besides
/// the built-in safe globals.
#[derive(Clone, Default)]
pub struct SandboxContext {
    bindings: IndexMap<String, Arc<dyn Capability>>,
}

impl fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxContext")
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SandboxContext {
    /// A context with no capabilities.
    pub fn new() -> Self {
        Self::default()
    }

    /// The executor's context: `fileSystem`, `permissionSystem` and `functions`.
    pub fn standard(
        fs: Arc<VirtualFs>,
        permissions: Arc<PermissionSystem>,
        registry: Arc<FunctionRegistry>,
    ) -> Self {
        Self::new().with(fs).with(permissions).with(registry)
    }

    /// Bind a capability under its own name.
    pub fn with(self, capability: Arc<dyn Capability>) -> Self {
        let name = capability.name().to_string();
        self.bind(name, capability)
    }

    /// Bind a capability under `name`, replacing any previous binding.
    pub fn bind(mut self, name: impl Into<String>, capability: Arc<dyn Capability>) -> Self {
        self.bindings.insert(name.into(), capability);
        self
    }

    /// Look up a binding.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.bindings.get(name)
    }

    /// Binding names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Capability>)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn str_arg<'a>(method: &str, args: &'a [Value], index: usize) -> Result<&'a str, CapabilityError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(CapabilityError::invalid(
            method,
            format!("argument {} must be a string, got {other}", index + 1),
        )),
        None => Err(CapabilityError::invalid(
            method,
            format!("missing argument {}", index + 1),
        )),
    }
}

/// Text argument; scalars are converted the way string concatenation would.
fn text_arg(method: &str, args: &[Value], index: usize) -> Result<String, CapabilityError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(other @ (Value::Array(_) | Value::Object(_))) => Ok(other.to_string()),
        Some(Value::Null) => Ok("null".to_string()),
        None => Err(CapabilityError::invalid(
            method,
            format!("missing argument {}", index + 1),
        )),
    }
}

fn strings(items: Option<Vec<String>>) -> Value {
    items.map_or(Value::Null, |items| json!(items))
}

const FS_METHODS: &[&str] = &[
    "mkdir",
    "writeFile",
    "readFile",
    "listFiles",
    "deleteFile",
    "moveFile",
    "searchInFile",
    "exists",
];

impl Capability for VirtualFs {
    fn name(&self) -> &str {
        "fileSystem"
    }

    fn methods(&self) -> &[&'static str] {
        FS_METHODS
    }

    fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, CapabilityError> {
        Ok(match method {
            "mkdir" => json!(self.mkdir(str_arg(method, args, 0)?)),
            "writeFile" => {
                let content = text_arg(method, args, 1)?;
                json!(self.write_file(str_arg(method, args, 0)?, &content))
            }
            "readFile" => self
                .read_file(str_arg(method, args, 0)?)
                .map_or(Value::Null, Value::String),
            "listFiles" => strings(self.list_files(str_arg(method, args, 0)?)),
            "deleteFile" => json!(self.delete_file(str_arg(method, args, 0)?)),
            "moveFile" => {
                let destination = str_arg(method, args, 1)?;
                json!(self.move_file(str_arg(method, args, 0)?, destination))
            }
            "searchInFile" => {
                let term = text_arg(method, args, 1)?;
                strings(self.search_in_file(str_arg(method, args, 0)?, &term))
            }
            "exists" => json!(self.exists(str_arg(method, args, 0)?)),
            _ => {
                return Err(CapabilityError::UnknownMethod {
                    capability: self.name().to_string(),
                    method: method.to_string(),
                });
            }
        })
    }
}

impl Capability for PermissionSystem {
    fn name(&self) -> &str {
        "permissionSystem"
    }

    // Sandboxed code may ask, never grant.
    fn methods(&self) -> &[&'static str] {
        &["checkPermission"]
    }

    fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, CapabilityError> {
        match method {
            "checkPermission" => {
                let path = str_arg(method, args, 0)?;
                let op: Permission = str_arg(method, args, 1)?
                    .parse()
                    .map_err(|e| CapabilityError::invalid(method, format!("{e}")))?;
                Ok(json!(self.check_permission(path, op)))
            }
            _ => Err(CapabilityError::UnknownMethod {
                capability: self.name().to_string(),
                method: method.to_string(),
            }),
        }
    }
}

impl Capability for FunctionRegistry {
    fn name(&self) -> &str {
        "functions"
    }

    fn methods(&self) -> &[&'static str] {
        &["call", "list", "has"]
    }

    fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, CapabilityError> {
        match method {
            "call" => {
                let name = str_arg(method, args, 0)?;
                self.execute(name, &args[1..])
                    .map_err(|e| CapabilityError::Failed(e.to_string()))
            }
            "list" => Ok(json!(self.list())),
            "has" => Ok(json!(self.contains(str_arg(method, args, 0)?))),
            _ => Err(CapabilityError::UnknownMethod {
                capability: self.name().to_string(),
                method: method.to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::{load_pack, math_pack};

    #[test]
    fn test_standard_context_bindings() {
        let context = SandboxContext::standard(
            Arc::new(VirtualFs::new()),
            Arc::new(PermissionSystem::with_default_rules()),
            Arc::new(FunctionRegistry::new()),
        );
        assert_eq!(
            context.names().collect::<Vec<_>>(),
            vec!["fileSystem", "permissionSystem", "functions"]
        );
        assert!(context.get("fileSystem").is_some());
        assert!(context.get("process").is_none());
    }

    #[test]
    fn test_file_system_capability() {
        let fs = VirtualFs::new();
        assert_eq!(
            fs.invoke("writeFile", &[json!("/tmp/a.txt"), json!("hi")]).unwrap(),
            json!(true)
        );
        assert_eq!(fs.invoke("readFile", &[json!("/tmp/a.txt")]).unwrap(), json!("hi"));
        assert_eq!(fs.invoke("readFile", &[json!("/tmp/none")]).unwrap(), Value::Null);
        assert_eq!(fs.invoke("listFiles", &[json!("/tmp")]).unwrap(), json!(["a.txt"]));
        assert_eq!(
            fs.invoke("writeFile", &[json!("/tmp/n.txt"), json!(42)]).unwrap(),
            json!(true)
        );
        assert_eq!(fs.read_file("/tmp/n.txt").as_deref(), Some("42"));
    }

    #[test]
    fn test_file_system_argument_errors() {
        let fs = VirtualFs::new();
        let err = fs.invoke("readFile", &[]).unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidArgument { .. }));

        let err = fs.invoke("format", &[]).unwrap_err();
        assert_eq!(err.to_string(), "fileSystem.format is not a function");
    }

    #[test]
    fn test_permission_capability_is_read_only() {
        let permissions = PermissionSystem::with_default_rules();
        assert_eq!(
            permissions
                .invoke("checkPermission", &[json!("/tmp/x"), json!("write")])
                .unwrap(),
            json!(true)
        );
        assert_eq!(
            permissions
                .invoke("checkPermission", &[json!("/etc/passwd"), json!("read")])
                .unwrap(),
            json!(false)
        );
        assert!(permissions.invoke("addRule", &[json!("/"), json!(["write"])]).is_err());
        assert!(!permissions.check_permission("/etc", Permission::Write));
    }

    #[test]
    fn test_registry_capability() {
        let registry = FunctionRegistry::new();
        load_pack(&registry, &math_pack()).unwrap();
        assert_eq!(
            registry.invoke("call", &[json!("add"), json!(2), json!(3)]).unwrap(),
            json!(5)
        );
        assert_eq!(registry.invoke("has", &[json!("add")]).unwrap(), json!(true));
        let err = registry
            .invoke("call", &[json!("divide"), json!(1), json!(0)])
            .unwrap_err();
        assert_eq!(err.to_string(), "Division by zero");
    }
}
