//! Integration tests for sandboxed execution against the real capabilities.
//!
//! These tests verify:
//! - Filesystem access gated by the script's own permission checks
//! - Static rejection happening before any side effect
//! - Registry functions reachable through the `functions` capability
//! - Capabilities exposing no more than their declared methods

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use serde_json::json;
use warden::registry::{builtin_packs, load_packs};
use warden::sandbox::Limit;
use warden::{
    FunctionRegistry, PermissionSystem, ResourceLimits, Sandbox, SandboxContext, SandboxError,
    VirtualFs,
};

struct Fixture {
    fs: Arc<VirtualFs>,
    permissions: Arc<PermissionSystem>,
    context: SandboxContext,
}

fn fixture() -> Fixture {
    let fs = Arc::new(VirtualFs::new());
    let permissions = Arc::new(PermissionSystem::with_default_rules());
    let registry = FunctionRegistry::new();
    load_packs(&registry, &builtin_packs()).expect("load packs");
    let context =
        SandboxContext::standard(Arc::clone(&fs), Arc::clone(&permissions), Arc::new(registry));
    Fixture {
        fs,
        permissions,
        context,
    }
}

const GUARDED_WRITE: &str = r#"
function save(path, content) {
  if (!permissionSystem.checkPermission(path, 'write')) {
    throw new Error(`PermissionDenied: ${path}`);
  }
  return fileSystem.writeFile(path, content);
}
"#;

// =============================================================================
// Filesystem and permissions
// =============================================================================

mod filesystem {
    use super::*;

    #[test]
    fn test_guarded_write_inside_project() {
        let f = fixture();
        let code = format!(
            "{GUARDED_WRITE}
            save('/home/project/notes.txt', 'first');
            save('/home/project/notes.txt', 'second');
            return fileSystem.listFiles('/home/project');"
        );
        let result = Sandbox::default().execute(&code, &f.context).expect("execute");

        assert_eq!(result.value, json!(["example.txt", "notes.txt"]));
        assert_eq!(f.fs.read_file("/home/project/notes.txt").unwrap(), "second");
    }

    #[test]
    fn test_guarded_write_outside_grant_fails() {
        let f = fixture();
        let code = format!("{GUARDED_WRITE} save('/etc/passwd', 'x'); return 'unreachable';");
        let err = Sandbox::default().execute(&code, &f.context).unwrap_err();

        assert_eq!(
            err,
            SandboxError::Execution {
                message: "PermissionDenied: /etc/passwd".to_string()
            }
        );
        assert!(!f.fs.exists("/etc"));
    }

    #[test]
    fn test_move_and_search() {
        let f = fixture();
        let code = r#"
            fileSystem.writeFile('/tmp/log.txt', 'ok 1\nfail 2\nok 3');
            const moved = fileSystem.moveFile('/tmp/log.txt', '/home/project/log.txt');
            return {
              moved,
              old: fileSystem.readFile('/tmp/log.txt'),
              hits: fileSystem.searchInFile('/home/project/log.txt', 'ok'),
            };
        "#;
        let result = Sandbox::default().execute(code, &f.context).expect("execute");
        assert_eq!(
            result.value,
            json!({"moved": true, "old": null, "hits": ["ok 1", "ok 3"]})
        );
    }

    #[test]
    fn test_script_cannot_grant_itself_permissions() {
        let f = fixture();
        let code = "permissionSystem.addRule('/', ['write']); return true;";
        let err = Sandbox::default().execute(code, &f.context).unwrap_err();

        assert!(matches!(err, SandboxError::Execution { .. }), "got {err:?}");
        assert!(!f.permissions.check_permission("/etc", "write".parse().unwrap()));
    }

    #[test]
    fn test_bad_capability_arguments_are_catchable() {
        let f = fixture();
        let code = r#"
            try {
              fileSystem.readFile(42);
              return 'no error';
            } catch (e) {
              return e.message;
            }
        "#;
        let result = Sandbox::default().execute(code, &f.context).expect("execute");
        assert_eq!(result.value, json!("readFile: argument 1 must be a string, got 42"));
    }
}

// =============================================================================
// Static rejection
// =============================================================================

mod rejection {
    use super::*;

    #[test]
    fn test_eval_rejected_before_side_effects() {
        let f = fixture();
        let code = "fileSystem.writeFile('/tmp/marker', 'x');\neval('1');";
        let err = Sandbox::default().execute(code, &f.context).unwrap_err();

        assert!(matches!(err, SandboxError::Unsafe { line: 2, .. }), "got {err:?}");
        assert!(!f.fs.exists("/tmp/marker"));
    }

    #[test]
    fn test_window_and_timers_rejected() {
        let f = fixture();
        for code in [
            "return window.location;",
            "window.name = 'x';",
            "setTimeout(() => 1, 0);",
            "return process.env;",
            "return new Function('return 1')();",
        ] {
            let err = Sandbox::default().execute(code, &f.context).unwrap_err();
            assert!(matches!(err, SandboxError::Unsafe { .. }), "{code}: {err:?}");
        }
    }

    #[test]
    fn test_plain_arithmetic_runs() {
        let result = Sandbox::default()
            .execute("return 1+1", &SandboxContext::new())
            .expect("execute");
        assert_eq!(result.value, json!(2));
    }
}

// =============================================================================
// Registry and limits
// =============================================================================

mod registry_and_limits {
    use super::*;

    #[test]
    fn test_registry_functions_callable() {
        let f = fixture();
        let code = r#"
            const sum = functions.call('add', 2, 3);
            let error = null;
            try {
              functions.call('divide', 1, 0);
            } catch (e) {
              error = e.message;
            }
            return { sum, error, has: functions.has('reverse'), missing: functions.has('nope') };
        "#;
        let result = Sandbox::default().execute(code, &f.context).expect("execute");
        assert_eq!(
            result.value,
            json!({"sum": 5, "error": "Division by zero", "has": true, "missing": false})
        );
    }

    #[test]
    fn test_runaway_loop_hits_operation_budget() {
        let f = fixture();
        let sandbox = Sandbox::new(ResourceLimits {
            max_operations: 10_000,
            ..ResourceLimits::default()
        });
        let err = sandbox
            .execute("let i = 0; while (true) { i++; }", &f.context)
            .unwrap_err();
        assert_eq!(err, SandboxError::LimitExceeded(Limit::Operations));
        assert!(err.is_runtime());
    }
}
