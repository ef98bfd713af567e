//! Static denylist over the concrete syntax tree.
//!
//! Runs after parsing and before anything is lowered or executed. The walk
//! is iterative so adversarially deep input cannot overflow the stack.

use tree_sitter::{Node, Tree};

use super::SandboxError;
use super::parser::{decode_string_literal, node_text};

/// Dynamic evaluation and code construction primitives.
const EVAL: &[&str] = &["eval", "Function", "AsyncFunction", "GeneratorFunction"];

/// Deferred and timer scheduling primitives.
const TIMERS: &[&str] = &[
    "setTimeout",
    "setInterval",
    "setImmediate",
    "clearTimeout",
    "clearInterval",
    "queueMicrotask",
    "requestAnimationFrame",
    "requestIdleCallback",
];

/// Browser globals whose members must not be touched.
const BROWSER: &[&str] = &["window", "document"];

/// Process, global and module-loader objects.
const HOST: &[&str] = &["process", "global", "globalThis", "require", "module", "exports"];

/// Properties that reach the function constructor.
const PROTO: &[&str] = &["constructor", "__proto__"];

/// Reject the first denylisted construct in `tree`.
pub(crate) fn check(tree: &Tree, source: &str) -> Result<(), SandboxError> {
    let mut cursor = tree.walk();
    loop {
        let node = cursor.node();
        if let Some(construct) = violation(node, source) {
            return Err(SandboxError::Unsafe {
                construct,
                line: node.start_position().row + 1,
            });
        }
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return Ok(());
            }
        }
    }
}

fn violation(node: Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "import_statement" => Some("import statement".to_string()),
        "export_statement" => Some("export statement".to_string()),
        "call_expression" => {
            let callee = node.child_by_field_name("function")?;
            (callee.kind() == "import").then(|| "dynamic import()".to_string())
        }
        "assignment_expression" | "augmented_assignment_expression" => {
            let left = node.child_by_field_name("left")?;
            if !is_member(left) {
                return None;
            }
            let name = identifier_name(left.child_by_field_name("object")?, source)?;
            BROWSER
                .contains(&name)
                .then(|| format!("assignment to a {name} property"))
        }
        "member_expression" => {
            if let Some(object) = node.child_by_field_name("object")
                && let Some(name) = identifier_name(object, source)
                && BROWSER.contains(&name)
            {
                return Some(format!("member access on {name}"));
            }
            let property = node.child_by_field_name("property")?;
            let name = node_text(property, source)?;
            PROTO
                .contains(&name)
                .then(|| format!("access to the {name} property"))
        }
        "subscript_expression" => {
            if let Some(object) = node.child_by_field_name("object")
                && let Some(name) = identifier_name(object, source)
                && BROWSER.contains(&name)
            {
                return Some(format!("member access on {name}"));
            }
            let index = node.child_by_field_name("index")?;
            if index.kind() != "string" {
                return None;
            }
            let key = decode_string_literal(node_text(index, source)?);
            PROTO
                .contains(&key.as_str())
                .then(|| format!("access to the {key} property"))
        }
        "identifier"
        | "shorthand_property_identifier"
        | "shorthand_property_identifier_pattern" => {
            let name = node_text(node, source)?;
            if EVAL.contains(&name) {
                Some(format!("dynamic code evaluation via {name}"))
            } else if TIMERS.contains(&name) {
                Some(format!("deferred scheduling via {name}"))
            } else if BROWSER.contains(&name) {
                Some(format!("reference to {name}"))
            } else if HOST.contains(&name) {
                Some(format!("reference to the {name} object"))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_member(node: Node<'_>) -> bool {
    matches!(node.kind(), "member_expression" | "subscript_expression")
}

fn identifier_name<'s>(node: Node<'_>, source: &'s str) -> Option<&'s str> {
    (node.kind() == "identifier")
        .then(|| node_text(node, source))
        .flatten()
}
