//! Permission rules and the shared rule set.

use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An operation that can be granted on a path prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Reading file contents or listing directories
    Read,
    /// Creating, overwriting, moving or deleting
    Write,
    /// Running a file as code
    Execute,
}

impl Permission {
    /// All operations, in declaration order.
    pub const ALL: [Permission; 3] = [
        Permission::Read,
        Permission::Write,
        Permission::Execute,
    ];

    /// The lowercase name used by sandboxed code (`"read"`, `"write"`, `"execute"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Execute => "execute",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a [`Permission`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown permission: {0:?} (expected read, write or execute)")]
pub struct ParsePermissionError(pub String);

impl FromStr for Permission {
    type Err = ParsePermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "execute" => Ok(Permission::Execute),
            _ => Err(ParsePermissionError(s.to_string())),
        }
    }
}

/// A grant of operations on every path starting with `path_prefix`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Plain string prefix (not a glob, not segment-aware)
    pub path_prefix: String,
    /// Operations this rule grants
    pub operations: Vec<Permission>,
}

impl PermissionRule {
    /// Create a new rule.
    pub fn new(
        path_prefix: impl Into<String>,
        operations: impl IntoIterator<Item = Permission>,
    ) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            operations: operations.into_iter().collect(),
        }
    }

    fn matches(&self, path: &str, operation: Permission) -> bool {
        path.starts_with(&self.path_prefix) && self.operations.contains(&operation)
    }
}

/// Process-wide, default-deny access control list.
///
/// Rules are evaluated in insertion order; the first rule matching both the
/// path prefix and the operation grants access. With no matching rule the
/// answer is `false`.
#[derive(Debug, Default)]
pub struct PermissionSystem {
    rules: RwLock<Vec<PermissionRule>>,
}

impl PermissionSystem {
    /// Create an empty permission system that denies everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a permission system with the default workspace grants.
    ///
    /// - `/home/project`: read, write
    /// - `/tmp`: read, write
    pub fn with_default_rules() -> Self {
        PermissionBuilder::new()
            .grant("/home/project", [Permission::Read, Permission::Write])
            .grant("/tmp", [Permission::Read, Permission::Write])
            .build()
    }

    /// Create a builder for a custom rule set.
    pub fn builder() -> PermissionBuilder {
        PermissionBuilder::new()
    }

    /// Return true iff some rule grants `operation` on `path`.
    pub fn check_permission(&self, path: &str, operation: Permission) -> bool {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let allowed = rules.iter().any(|rule| rule.matches(path, operation));
        if !allowed {
            tracing::debug!(path = %path, operation = %operation, "permission denied");
        }
        allowed
    }

    /// Append a rule granting `operations` on `path_prefix`.
    pub fn add_rule(
        &self,
        path_prefix: impl Into<String>,
        operations: impl IntoIterator<Item = Permission>,
    ) {
        let rule = PermissionRule::new(path_prefix, operations);
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        rules.push(rule);
    }

    /// Remove every rule whose prefix equals `path_prefix` exactly.
    ///
    /// Returns the number of rules removed.
    pub fn remove_rule(&self, path_prefix: &str) -> usize {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|rule| rule.path_prefix != path_prefix);
        before - rules.len()
    }

    /// Snapshot of the current rules in evaluation order.
    pub fn rules(&self) -> Vec<PermissionRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Builder for creating a [`PermissionSystem`] with a fluent API.
///
/// # Example
///
/// ```rust
/// use warden::permission::{Permission, PermissionSystem};
///
/// let permissions = PermissionSystem::builder()
///     .allow_read("/home")
///     .grant("/tmp", Permission::ALL)
///     .build();
/// assert!(permissions.check_permission("/tmp/run.js", Permission::Execute));
/// ```
#[derive(Clone, Debug, Default)]
pub struct PermissionBuilder {
    rules: Vec<PermissionRule>,
}

impl PermissionBuilder {
    /// Create a new builder with no rules.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Grant the given operations on a path prefix.
    pub fn grant(
        mut self,
        path_prefix: &str,
        operations: impl IntoIterator<Item = Permission>,
    ) -> Self {
        self.rules.push(PermissionRule::new(path_prefix, operations));
        self
    }

    /// Grant read access on a path prefix.
    pub fn allow_read(self, path_prefix: &str) -> Self {
        self.grant(path_prefix, [Permission::Read])
    }

    /// Grant write access on a path prefix.
    pub fn allow_write(self, path_prefix: &str) -> Self {
        self.grant(path_prefix, [Permission::Write])
    }

    /// Grant execute access on a path prefix.
    pub fn allow_execute(self, path_prefix: &str) -> Self {
        self.grant(path_prefix, [Permission::Execute])
    }

    /// Build the permission system.
    pub fn build(self) -> PermissionSystem {
        PermissionSystem {
            rules: RwLock::new(self.rules),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_system_denies_everything() {
        let permissions = PermissionSystem::new();
        for op in Permission::ALL {
            assert!(!permissions.check_permission("/", op));
            assert!(!permissions.check_permission("/home/project/a.txt", op));
        }
    }

    #[test]
    fn test_default_rules() {
        let permissions = PermissionSystem::with_default_rules();

        assert!(
            permissions.check_permission("/home/project/example.txt", Permission::Read)
        );
        assert!(permissions.check_permission("/home/project", Permission::Write));
        assert!(permissions.check_permission("/tmp/scratch.txt", Permission::Write));

        // Nothing grants execute
        assert!(!permissions.check_permission("/tmp/run.js", Permission::Execute));
        // Outside every prefix
        assert!(!permissions.check_permission("/root", Permission::Read));
        assert!(!permissions.check_permission("/home", Permission::Read));
    }

    #[test]
    fn test_ungranted_paths_denied_for_every_operation() {
        let permissions = PermissionSystem::with_default_rules();
        for path in ["/", "/etc/passwd", "/home/other", "/var/tmp", "tmp/x"] {
            for op in Permission::ALL {
                assert!(
                    !permissions.check_permission(path, op),
                    "{path} should be denied for {op}"
                );
            }
        }
    }

    #[test]
    fn test_prefix_is_plain_string_prefix() {
        let permissions = PermissionSystem::builder().allow_read("/tmp").build();
        // Not segment-aware: "/tmpfoo" starts with "/tmp"
        assert!(permissions.check_permission("/tmpfoo", Permission::Read));
    }

    #[test]
    fn test_operation_must_be_granted_by_matching_rule() {
        let permissions = PermissionSystem::builder()
            .allow_read("/data")
            .allow_write("/data/out")
            .build();

        assert!(permissions.check_permission("/data/in.txt", Permission::Read));
        assert!(!permissions.check_permission("/data/in.txt", Permission::Write));
        assert!(permissions.check_permission("/data/out/r.txt", Permission::Write));
        // First rule also matches /data/out for reads
        assert!(permissions.check_permission("/data/out/r.txt", Permission::Read));
    }

    #[test]
    fn test_add_and_remove_rule() {
        let permissions = PermissionSystem::new();
        permissions.add_rule("/work", [Permission::Read]);
        permissions.add_rule("/work", [Permission::Write]);
        permissions.add_rule("/work/sub", [Permission::Execute]);

        assert!(permissions.check_permission("/work/a", Permission::Write));
        assert_eq!(permissions.rules().len(), 3);

        // Exact prefix only
        assert_eq!(permissions.remove_rule("/work"), 2);
        assert!(!permissions.check_permission("/work/a", Permission::Read));
        assert!(permissions.check_permission("/work/sub/x", Permission::Execute));

        assert_eq!(permissions.remove_rule("/missing"), 0);
    }

    #[test]
    fn test_rules_keep_insertion_order() {
        let permissions = PermissionSystem::builder()
            .allow_read("/b")
            .allow_read("/a")
            .build();
        let prefixes: Vec<_> = permissions
            .rules()
            .into_iter()
            .map(|r| r.path_prefix)
            .collect();
        assert_eq!(prefixes, vec!["/b", "/a"]);
    }

    #[test]
    fn test_permission_parsing() {
        assert_eq!("read".parse::<Permission>().unwrap(), Permission::Read);
        assert_eq!("WRITE".parse::<Permission>().unwrap(), Permission::Write);
        assert_eq!(" execute ".parse::<Permission>().unwrap(), Permission::Execute);
        assert!("delete".parse::<Permission>().is_err());
        assert_eq!(Permission::Write.to_string(), "write");
    }
}
