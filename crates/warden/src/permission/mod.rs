//! Path-prefix permission system.
//!
//! Rules grant a set of [`Permission`]s to every path that starts with a
//! given prefix. Evaluation walks the rules in insertion order and the first
//! rule whose prefix matches *and* whose grant includes the requested
//! operation allows it. Anything else is denied.
//!
//! ## Design Philosophy
//!
//! The permission system answers questions; it does not enforce them. The
//! virtual filesystem is unaware of permissions, and sandboxed code is handed
//! a `permissionSystem` capability that it must consult itself before
//! mutating anything:
//!
//! - **Denial is a value**: `check_permission` returns `false`, never an error
//! - **No explicit deny**: a path is denied simply by not being granted
//! - **Shared**: the rule set is internally locked so one instance can be
//!   handed to the pipeline, the sandbox and the CLI at once
//!
//! ## Example
//!
//! ```rust
//! use warden::permission::{Permission, PermissionSystem};
//!
//! let permissions = PermissionSystem::builder()
//!     .allow_read("/home")
//!     .allow_write("/home/project")
//!     .build();
//!
//! assert!(permissions.check_permission("/home/project/a.txt", Permission::Write));
//! assert!(!permissions.check_permission("/etc/passwd", Permission::Read));
//! ```

mod rules;

pub use rules::{
    ParsePermissionError, Permission, PermissionBuilder, PermissionRule, PermissionSystem,
};
