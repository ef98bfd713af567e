//! Sandboxed execution of untrusted JavaScript.
//!
//! A run goes through four stages, and nothing executes until all of the
//! static ones pass:
//!
//! 1. parse with tree-sitter; any error node is a [`SandboxError::Syntax`]
//! 2. walk the full syntax tree against a denylist ([`SandboxError::Unsafe`])
//! 3. lower into an owned AST ([`SandboxError::Unsupported`] for constructs
//!    the interpreter does not implement)
//! 4. interpret under a [`ResourceLimits`] budget on a dedicated thread
//!
//! The only bindings a script can reach besides the safe built-ins are the
//! capabilities in its [`SandboxContext`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden::sandbox::{Sandbox, SandboxContext};
//! use warden::vfs::VirtualFs;
//!
//! let context = SandboxContext::new().with(Arc::new(VirtualFs::new()));
//! let result = Sandbox::default()
//!     .execute("return fileSystem.listFiles('/home');", &context)
//!     .unwrap();
//! assert_eq!(result.value, serde_json::json!(["project"]));
//! ```

mod ast;
mod builtins;
mod capability;
mod interpreter;
mod parser;
mod safety;
mod value;

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capability::{Capability, CapabilityError, SandboxContext};
pub(crate) use value::number_to_json;

use crate::limits::ResourceLimits;
use interpreter::{Interpreter, Interrupt, thrown_message};

/// Console method that produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    /// `console.log` and `console.debug`
    Log,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

/// One captured console line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    /// Console method used
    pub level: ConsoleLevel,
    /// Arguments rendered and joined with spaces
    pub text: String,
}

impl fmt::Display for ConsoleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            ConsoleLevel::Log => write!(f, "{}", self.text),
            ConsoleLevel::Info => write!(f, "[info] {}", self.text),
            ConsoleLevel::Warn => write!(f, "[warn] {}", self.text),
            ConsoleLevel::Error => write!(f, "[error] {}", self.text),
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Evaluation steps consumed
    pub operations: u64,
    /// Wall time including parsing, in milliseconds
    pub wall_time_ms: u64,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The value of the top-level `return`, or `null`
    pub value: serde_json::Value,
    /// Captured console output
    pub console: Vec<ConsoleLine>,
    /// Whether console output hit the byte limit
    pub truncated: bool,
    /// Run counters
    pub stats: ExecutionStats,
}

impl ExecutionResult {
    /// Console output as plain text, one line per entry.
    pub fn console_text(&self) -> String {
        self.console
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The budget that ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    /// Evaluation step count
    Operations,
    /// Wall-clock deadline
    Timeout,
    /// Nested call depth
    CallDepth,
    /// Size of a single string
    StringLength,
    /// Size of a single array or object
    CollectionLength,
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Limit::Operations => "operation count",
            Limit::Timeout => "wall-clock timeout",
            Limit::CallDepth => "call depth",
            Limit::StringLength => "string length",
            Limit::CollectionLength => "collection length",
        })
    }
}

/// Errors from the sandbox.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    /// The code does not parse
    #[error("syntax error on line {line}: {message}")]
    Syntax {
        /// Parser diagnostic
        message: String,
        /// 1-based line
        line: usize,
    },
    /// The code contains a denylisted construct
    #[error("unsafe code on line {line}: {construct}")]
    Unsafe {
        /// What was found
        construct: String,
        /// 1-based line
        line: usize,
    },
    /// The code uses a construct the interpreter does not implement
    #[error("unsupported construct on line {line}: {construct}")]
    Unsupported {
        /// What was found
        construct: String,
        /// 1-based line
        line: usize,
    },
    /// The script threw
    #[error("execution error: {message}")]
    Execution {
        /// The thrown error's message
        message: String,
    },
    /// A resource budget ran out
    #[error("resource limit exceeded: {0}")]
    LimitExceeded(Limit),
    /// Failure of the sandbox itself
    #[error("internal sandbox error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Whether the code ran and failed at runtime, as opposed to being
    /// rejected before execution.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::Execution { .. } | Self::LimitExceeded(_))
    }
}

/// Executes code under a fixed set of limits.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: ResourceLimits,
}

impl Sandbox {
    /// Create a sandbox with the given limits.
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    /// Limits applied to every run.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Run the static checks without executing anything.
    pub fn check(&self, code: &str) -> Result<(), SandboxError> {
        self.isolated(|| {
            let tree = parser::parse(code)?;
            safety::check(&tree, code)?;
            parser::lower(&tree, code)?;
            Ok(())
        })
    }

    /// Execute `code` with the capabilities in `context`.
    pub fn execute(
        &self,
        code: &str,
        context: &SandboxContext,
    ) -> Result<ExecutionResult, SandboxError> {
        self.isolated(|| run_program(&self.limits, code, context, None))
    }

    /// Execute `code`, which must `return` a function, then call that
    /// function with `args`.
    pub fn call(
        &self,
        code: &str,
        args: &[serde_json::Value],
        context: &SandboxContext,
    ) -> Result<ExecutionResult, SandboxError> {
        self.isolated(|| run_program(&self.limits, code, context, Some(args)))
    }

    /// Run `job` on a scoped thread with the configured stack size.
    fn isolated<T, F>(&self, job: F) -> Result<T, SandboxError>
    where
        T: Send,
        F: FnOnce() -> Result<T, SandboxError> + Send,
    {
        std::thread::scope(|scope| {
            let handle = std::thread::Builder::new()
                .name("warden-sandbox".to_string())
                .stack_size(self.limits.stack_size_bytes)
                .spawn_scoped(scope, job)
                .map_err(|e| SandboxError::Internal(format!("failed to spawn thread: {e}")))?;
            handle
                .join()
                .map_err(|_| SandboxError::Internal("execution thread panicked".to_string()))?
        })
    }
}

/// Execute `code` with default limits.
pub fn safe_exec(code: &str, context: &SandboxContext) -> Result<ExecutionResult, SandboxError> {
    Sandbox::default().execute(code, context)
}

fn run_program(
    limits: &ResourceLimits,
    code: &str,
    context: &SandboxContext,
    args: Option<&[serde_json::Value]>,
) -> Result<ExecutionResult, SandboxError> {
    let started = Instant::now();
    let tree = parser::parse(code)?;
    safety::check(&tree, code)?;
    let program = parser::lower(&tree, code)?;
    drop(tree);

    let mut interpreter = Interpreter::new(limits, context);
    let outcome = match interpreter.run(&program) {
        Ok(value) => match args {
            Some(args) => interpreter.invoke(&value, args),
            None => Ok(value),
        },
        Err(interrupt) => Err(interrupt),
    };

    let operations = interpreter.operations();
    let wall_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::debug!(operations, wall_time_ms, "sandbox run finished");

    let value = match outcome {
        Ok(value) => value
            .to_json()
            .map_err(|circular| SandboxError::Execution {
                message: circular.to_string(),
            })?,
        Err(Interrupt::Throw(thrown)) => {
            return Err(SandboxError::Execution {
                message: thrown_message(&thrown),
            });
        }
        Err(Interrupt::Abort(limit)) => {
            tracing::debug!(%limit, "sandbox budget exhausted");
            return Err(SandboxError::LimitExceeded(limit));
        }
    };
    let (console, truncated) = interpreter.take_console();

    Ok(ExecutionResult {
        value,
        console,
        truncated,
        stats: ExecutionStats {
            operations,
            wall_time_ms,
        },
    })
}
