//! Warden: plan, write, review and run generated code in a sandbox
//!
//! A request in natural language goes through five agents. The planner splits
//! it into tasks, the coder writes JavaScript for them, the reviewer approves
//! or sends it back, and the executor runs approved code in a sandbox whose
//! only reach into the world is an in-memory filesystem, a permission system
//! and a function registry, all handed in as explicit capabilities.

pub mod config;
pub mod limits;
pub mod log;
pub mod permission;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod sandbox;
pub mod vfs;

pub use config::{ConfigError, PipelineConfig, ProviderConfig};
pub use limits::ResourceLimits;
pub use log::{ExecutionLog, LogEntry, LogLevel};
pub use permission::{Permission, PermissionRule, PermissionSystem};
pub use pipeline::{Outcome, Pipeline, PipelineContext, PipelineError, RunReport};
pub use provider::{OfflineGenerator, OpenAiGenerator, ProviderError, TextGenerator};
pub use registry::{FunctionRegistry, RegistryError};
pub use sandbox::{ExecutionResult, Sandbox, SandboxContext, SandboxError, safe_exec};
pub use vfs::VirtualFs;
