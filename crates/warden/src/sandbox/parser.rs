//! Parsing with the tree-sitter JavaScript grammar and lowering into [`ast`].
//!
//! Parsing fails on any `ERROR` or `MISSING` node. Lowering turns the
//! accepted concrete tree into owned [`Stmt`]s and rejects constructs the
//! interpreter does not implement.
//!
//! [`ast`]: super::ast

use std::rc::Rc;

use tree_sitter::{Language, Node, Parser, Tree};

use super::SandboxError;
use super::ast::{
    AssignOp, BinaryOp, DeclKind, Element, Expr, ForEachKind, FunctionBody, FunctionDef,
    LogicalOp, Pattern, Prop, PropKey, Stmt, SwitchCase, TemplatePart, UnaryOp,
};
use super::value::number_to_string;

/// Deepest statement/expression nesting the lowering accepts.
const MAX_NESTING: usize = 256;

/// Parse `source`, failing with [`SandboxError::Syntax`] on malformed input.
pub(crate) fn parse(source: &str) -> Result<Tree, SandboxError> {
    let mut parser = Parser::new();
    let language: Language = tree_sitter_javascript::LANGUAGE.into();
    parser
        .set_language(&language)
        .map_err(|e| SandboxError::Internal(format!("failed to load JavaScript grammar: {e}")))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| SandboxError::Internal("parser produced no tree".to_string()))?;

    if tree.root_node().has_error() {
        return Err(syntax_error(&tree, source));
    }
    Ok(tree)
}

/// Locate the first error node in pre-order.
fn syntax_error(tree: &Tree, source: &str) -> SandboxError {
    let mut cursor = tree.walk();
    loop {
        let node = cursor.node();
        let line = node.start_position().row + 1;
        if node.is_missing() {
            return SandboxError::Syntax {
                message: format!("missing `{}`", node.kind()),
                line,
            };
        }
        if node.is_error() {
            let snippet: String = node_text(node, source)
                .unwrap_or_default()
                .chars()
                .take(40)
                .collect();
            let snippet = snippet.trim();
            let message = if snippet.is_empty() {
                "unexpected end of input".to_string()
            } else {
                format!("unexpected `{snippet}`")
            };
            return SandboxError::Syntax { message, line };
        }
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return SandboxError::Syntax {
                    message: "invalid syntax".to_string(),
                    line: 1,
                };
            }
        }
    }
}

/// Lower a parsed program into statements.
pub(crate) fn lower(tree: &Tree, source: &str) -> Result<Vec<Stmt>, SandboxError> {
    let mut lowerer = Lowerer { source, depth: 0 };
    lowerer.statements(tree.root_node())
}

pub(crate) fn node_text<'s>(node: Node<'_>, source: &'s str) -> Option<&'s str> {
    source.get(node.byte_range())
}

/// Decode a quoted string literal, quotes included.
pub(crate) fn decode_string_literal(raw: &str) -> String {
    let inner = raw.get(1..raw.len().saturating_sub(1)).unwrap_or_default();
    decode_escapes(inner)
}

fn decode_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(escaped) = chars.next() else {
            break;
        };
        match escaped {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' => out.push('\0'),
            'x' => {
                let code = take_hex(&mut chars, 2);
                out.push(code.and_then(char::from_u32).unwrap_or('\u{fffd}'));
            }
            'u' => {
                let code = if chars.peek() == Some(&'{') {
                    chars.next();
                    let mut digits = String::new();
                    for d in chars.by_ref() {
                        if d == '}' {
                            break;
                        }
                        digits.push(d);
                    }
                    u32::from_str_radix(&digits, 16).ok()
                } else {
                    take_hex(&mut chars, 4)
                };
                let code = match code {
                    Some(high @ 0xD800..=0xDBFF) => {
                        // Combine with a following low surrogate escape.
                        let mut lookahead = chars.clone();
                        let low = (lookahead.next() == Some('\\') && lookahead.next() == Some('u'))
                            .then(|| take_hex(&mut lookahead, 4))
                            .flatten()
                            .filter(|low| (0xDC00..=0xDFFF).contains(low));
                        match low {
                            Some(low) => {
                                chars = lookahead;
                                Some(0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00))
                            }
                            None => None,
                        }
                    }
                    other => other,
                };
                out.push(code.and_then(char::from_u32).unwrap_or('\u{fffd}'));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            '\n' | '\u{2028}' | '\u{2029}' => {}
            other => out.push(other),
        }
    }
    out
}

fn take_hex(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, n: usize) -> Option<u32> {
    let mut value = 0u32;
    for _ in 0..n {
        let digit = chars.peek()?.to_digit(16)?;
        chars.next();
        value = value * 16 + digit;
    }
    Some(value)
}

fn parse_number(text: &str) -> Option<f64> {
    let cleaned = text.replace('_', "");
    if cleaned.ends_with('n') {
        return None;
    }
    let lower = cleaned.to_ascii_lowercase();
    let radix = |digits: &str, radix: u32| {
        u128::from_str_radix(digits, radix).ok().map(|v| v as f64)
    };
    if let Some(hex) = lower.strip_prefix("0x") {
        radix(hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        radix(oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        radix(bin, 2)
    } else {
        lower.parse().ok()
    }
}

/// Named children, comments excluded.
fn named(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|n| !matches!(n.kind(), "comment" | "html_comment"))
        .collect()
}

fn children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn line(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

fn unsupported(node: Node<'_>, construct: impl Into<String>) -> SandboxError {
    SandboxError::Unsupported {
        construct: construct.into(),
        line: line(node),
    }
}

fn has_optional_chain(node: Node<'_>) -> bool {
    children(node).iter().any(|c| c.kind() == "optional_chain")
}

struct Lowerer<'s> {
    source: &'s str,
    depth: usize,
}

impl<'s> Lowerer<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        node_text(node, self.source).unwrap_or_default()
    }

    fn field<'t>(&self, node: Node<'t>, name: &str) -> Result<Node<'t>, SandboxError> {
        node.child_by_field_name(name)
            .ok_or_else(|| SandboxError::Syntax {
                message: format!("{} is missing its {name}", node.kind()),
                line: line(node),
            })
    }

    fn first_named<'t>(&self, node: Node<'t>) -> Result<Node<'t>, SandboxError> {
        named(node).into_iter().next().ok_or_else(|| SandboxError::Syntax {
            message: format!("empty {}", node.kind()),
            line: line(node),
        })
    }

    /// Text of an operator field, or the first anonymous child.
    fn operator(&self, node: Node<'_>) -> &'s str {
        if let Some(op) = node.child_by_field_name("operator") {
            return self.text(op);
        }
        children(node)
            .into_iter()
            .find(|c| !c.is_named())
            .map(|c| self.text(c))
            .unwrap_or_default()
    }

    fn nest(&mut self, node: Node<'_>) -> Result<(), SandboxError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(unsupported(
                node,
                format!("nesting deeper than {MAX_NESTING} levels"),
            ));
        }
        Ok(())
    }

    fn statements(&mut self, node: Node<'_>) -> Result<Vec<Stmt>, SandboxError> {
        named(node)
            .into_iter()
            .filter(|n| n.kind() != "hash_bang_line")
            .map(|n| self.statement(n))
            .collect()
    }

    fn statement(&mut self, node: Node<'_>) -> Result<Stmt, SandboxError> {
        self.nest(node)?;
        let stmt = self.statement_inner(node);
        self.depth -= 1;
        stmt
    }

    fn statement_inner(&mut self, node: Node<'_>) -> Result<Stmt, SandboxError> {
        Ok(match node.kind() {
            "expression_statement" => Stmt::Expr(self.expression(self.first_named(node)?)?),
            "lexical_declaration" | "variable_declaration" => self.declaration(node)?,
            "function_declaration" => Stmt::Function(self.function(node, false)?),
            "statement_block" => Stmt::Block(self.statements(node)?),
            "if_statement" => {
                let test = self.expression(self.field(node, "condition")?)?;
                let consequent = Box::new(self.statement(self.field(node, "consequence")?)?);
                let alternate = match node.child_by_field_name("alternative") {
                    Some(clause) => Some(Box::new(self.statement(self.first_named(clause)?)?)),
                    None => None,
                };
                Stmt::If {
                    test,
                    consequent,
                    alternate,
                }
            }
            "for_statement" => self.for_statement(node)?,
            "for_in_statement" => self.for_in_statement(node)?,
            "while_statement" => Stmt::While {
                test: self.expression(self.field(node, "condition")?)?,
                body: Box::new(self.statement(self.field(node, "body")?)?),
            },
            "do_statement" => Stmt::DoWhile {
                body: Box::new(self.statement(self.field(node, "body")?)?),
                test: self.expression(self.field(node, "condition")?)?,
            },
            "switch_statement" => self.switch_statement(node)?,
            "break_statement" | "continue_statement" => {
                if node.child_by_field_name("label").is_some() {
                    return Err(unsupported(node, "labeled break/continue"));
                }
                if node.kind() == "break_statement" {
                    Stmt::Break
                } else {
                    Stmt::Continue
                }
            }
            "return_statement" => match named(node).into_iter().next() {
                Some(value) => Stmt::Return(Some(self.expression(value)?)),
                None => Stmt::Return(None),
            },
            "throw_statement" => Stmt::Throw(self.expression(self.first_named(node)?)?),
            "try_statement" => self.try_statement(node)?,
            "empty_statement" | "debugger_statement" => Stmt::Empty,
            "class_declaration" => return Err(unsupported(node, "class declaration")),
            "generator_function_declaration" => {
                return Err(unsupported(node, "generator function"));
            }
            "labeled_statement" => return Err(unsupported(node, "labeled statement")),
            "with_statement" => return Err(unsupported(node, "with statement")),
            other => return Err(unsupported(node, format!("statement `{other}`"))),
        })
    }

    fn declaration(&mut self, node: Node<'_>) -> Result<Stmt, SandboxError> {
        let kind = if node.kind() == "variable_declaration" {
            DeclKind::Var
        } else {
            let keyword = match node.child_by_field_name("kind") {
                Some(kind) => self.text(kind),
                None => children(node)
                    .first()
                    .map(|c| self.text(*c))
                    .unwrap_or_default(),
            };
            if keyword == "const" {
                DeclKind::Const
            } else {
                DeclKind::Let
            }
        };

        let mut declarators = Vec::new();
        for declarator in named(node) {
            if declarator.kind() != "variable_declarator" {
                continue;
            }
            let target = self.pattern(self.field(declarator, "name")?)?;
            let value = match declarator.child_by_field_name("value") {
                Some(value) => Some(self.expression(value)?),
                None => None,
            };
            declarators.push((target, value));
        }
        Ok(Stmt::Decl { kind, declarators })
    }

    /// First named, non-empty node of a `for` header field.
    fn for_clause<'t>(&self, node: Node<'t>, field: &str) -> Option<Node<'t>> {
        let mut cursor = node.walk();
        node.children_by_field_name(field, &mut cursor)
            .find(|n| n.is_named() && !matches!(n.kind(), "empty_statement" | "comment"))
    }

    fn for_statement(&mut self, node: Node<'_>) -> Result<Stmt, SandboxError> {
        let init = match self.for_clause(node, "initializer") {
            Some(init) => Some(Box::new(match init.kind() {
                "lexical_declaration" | "variable_declaration" => self.declaration(init)?,
                "expression_statement" => Stmt::Expr(self.expression(self.first_named(init)?)?),
                _ => Stmt::Expr(self.expression(init)?),
            })),
            None => None,
        };
        let test = match self.for_clause(node, "condition") {
            Some(cond) if cond.kind() == "expression_statement" => {
                Some(self.expression(self.first_named(cond)?)?)
            }
            Some(cond) => Some(self.expression(cond)?),
            None => None,
        };
        let update = match self.for_clause(node, "increment") {
            Some(update) => Some(self.expression(update)?),
            None => None,
        };
        let body = Box::new(self.statement(self.field(node, "body")?)?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn for_in_statement(&mut self, node: Node<'_>) -> Result<Stmt, SandboxError> {
        let decl = node
            .child_by_field_name("kind")
            .map(|k| match self.text(k) {
                "var" => DeclKind::Var,
                "const" => DeclKind::Const,
                _ => DeclKind::Let,
            });
        let operator = match node.child_by_field_name("operator") {
            Some(op) => self.text(op),
            None => children(node)
                .into_iter()
                .map(|c| self.text(c))
                .find(|t| matches!(*t, "of" | "in"))
                .unwrap_or_default(),
        };
        let kind = match operator {
            "of" => ForEachKind::Of,
            "in" => ForEachKind::In,
            _ => return Err(unsupported(node, "for loop header")),
        };
        let target = self.pattern(self.field(node, "left")?)?;
        let iterable = self.expression(self.field(node, "right")?)?;
        let body = Box::new(self.statement(self.field(node, "body")?)?);
        Ok(Stmt::ForEach {
            kind,
            decl,
            target,
            iterable,
            body,
        })
    }

    fn switch_statement(&mut self, node: Node<'_>) -> Result<Stmt, SandboxError> {
        let discriminant = self.expression(self.field(node, "value")?)?;
        let mut cases = Vec::new();
        for case in named(self.field(node, "body")?) {
            let value = case.child_by_field_name("value");
            let test = match value {
                Some(value) if case.kind() == "switch_case" => Some(self.expression(value)?),
                _ => None,
            };
            let body = named(case)
                .into_iter()
                .filter(|n| Some(n.id()) != value.map(|v| v.id()))
                .map(|n| self.statement(n))
                .collect::<Result<_, _>>()?;
            cases.push(SwitchCase { test, body });
        }
        Ok(Stmt::Switch {
            discriminant,
            cases,
        })
    }

    fn try_statement(&mut self, node: Node<'_>) -> Result<Stmt, SandboxError> {
        let block = self.statements(self.field(node, "body")?)?;
        let (param, handler) = match node.child_by_field_name("handler") {
            Some(clause) => {
                let param = match clause.child_by_field_name("parameter") {
                    Some(p) => Some(self.pattern(p)?),
                    None => None,
                };
                (param, Some(self.statements(self.field(clause, "body")?)?))
            }
            None => (None, None),
        };
        let finalizer = match node.child_by_field_name("finalizer") {
            Some(clause) => Some(self.statements(self.field(clause, "body")?)?),
            None => None,
        };
        Ok(Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    fn function(
        &mut self,
        node: Node<'_>,
        is_arrow: bool,
    ) -> Result<Rc<FunctionDef>, SandboxError> {
        let name = node
            .child_by_field_name("name")
            .map(|n| self.text(n).to_string());

        let mut params = Vec::new();
        let mut rest = None;
        if let Some(param) = node.child_by_field_name("parameter") {
            params.push(Pattern::Ident(self.text(param).to_string()));
        } else {
            for param in named(self.field(node, "parameters")?) {
                if param.kind() == "rest_pattern" {
                    rest = Some(self.pattern(self.first_named(param)?)?);
                } else {
                    params.push(self.pattern(param)?);
                }
            }
        }

        let body = self.field(node, "body")?;
        let body = if body.kind() == "statement_block" {
            FunctionBody::Block(self.statements(body)?)
        } else {
            FunctionBody::Expr(Box::new(self.expression(body)?))
        };

        Ok(Rc::new(FunctionDef {
            name,
            params,
            rest,
            body,
            is_arrow,
        }))
    }

    fn pattern(&mut self, node: Node<'_>) -> Result<Pattern, SandboxError> {
        self.nest(node)?;
        let pattern = self.pattern_inner(node);
        self.depth -= 1;
        pattern
    }

    fn pattern_inner(&mut self, node: Node<'_>) -> Result<Pattern, SandboxError> {
        Ok(match node.kind() {
            "identifier" | "shorthand_property_identifier_pattern" => {
                Pattern::Ident(self.text(node).to_string())
            }
            "parenthesized_expression" => self.pattern(self.first_named(node)?)?,
            "member_expression" | "subscript_expression" => {
                Pattern::Member(Box::new(self.expression(node)?))
            }
            "assignment_pattern" => Pattern::Default {
                target: Box::new(self.pattern(self.field(node, "left")?)?),
                value: Box::new(self.expression(self.field(node, "right")?)?),
            },
            "object_pattern" => {
                let mut props = Vec::new();
                let mut rest = None;
                for prop in named(node) {
                    match prop.kind() {
                        "shorthand_property_identifier_pattern" => {
                            let name = self.text(prop).to_string();
                            props.push((PropKey::Static(name.clone()), Pattern::Ident(name)));
                        }
                        "pair_pattern" => {
                            let key = self.prop_key(self.field(prop, "key")?)?;
                            props.push((key, self.pattern(self.field(prop, "value")?)?));
                        }
                        "object_assignment_pattern" => {
                            let left = self.field(prop, "left")?;
                            let value = Box::new(self.expression(self.field(prop, "right")?)?);
                            let name = self.text(left).to_string();
                            props.push((
                                PropKey::Static(name.clone()),
                                Pattern::Default {
                                    target: Box::new(Pattern::Ident(name)),
                                    value,
                                },
                            ));
                        }
                        "rest_pattern" => {
                            rest = Some(Box::new(self.pattern(self.first_named(prop)?)?));
                        }
                        other => return Err(unsupported(prop, format!("pattern `{other}`"))),
                    }
                }
                Pattern::Object { props, rest }
            }
            "array_pattern" => {
                let mut elements = Vec::new();
                let mut rest = None;
                let mut expecting = true;
                for child in children(node) {
                    match child.kind() {
                        "[" | "]" | "comment" => {}
                        "," => {
                            if expecting {
                                elements.push(None);
                            }
                            expecting = true;
                        }
                        "rest_pattern" => {
                            rest = Some(Box::new(self.pattern(self.first_named(child)?)?));
                            expecting = false;
                        }
                        _ => {
                            elements.push(Some(self.pattern(child)?));
                            expecting = false;
                        }
                    }
                }
                Pattern::Array { elements, rest }
            }
            other => return Err(unsupported(node, format!("pattern `{other}`"))),
        })
    }

    fn prop_key(&mut self, node: Node<'_>) -> Result<PropKey, SandboxError> {
        Ok(match node.kind() {
            "property_identifier" | "identifier" | "shorthand_property_identifier_pattern" => {
                PropKey::Static(self.text(node).to_string())
            }
            "string" => PropKey::Static(decode_string_literal(self.text(node))),
            "number" => {
                let n = parse_number(self.text(node))
                    .ok_or_else(|| unsupported(node, "numeric literal"))?;
                PropKey::Static(number_to_string(n))
            }
            "computed_property_name" => {
                PropKey::Computed(Box::new(self.expression(self.first_named(node)?)?))
            }
            other => return Err(unsupported(node, format!("property key `{other}`"))),
        })
    }

    /// Array elements or call arguments, holes included.
    fn elements(&mut self, node: Node<'_>) -> Result<Vec<Element>, SandboxError> {
        let mut elements = Vec::new();
        let mut expecting = true;
        for child in children(node) {
            match child.kind() {
                "[" | "]" | "(" | ")" | "comment" => {}
                "," => {
                    if expecting {
                        elements.push(Element::Hole);
                    }
                    expecting = true;
                }
                "spread_element" => {
                    elements.push(Element::Spread(self.expression(self.first_named(child)?)?));
                    expecting = false;
                }
                _ if child.is_named() => {
                    elements.push(Element::Expr(self.expression(child)?));
                    expecting = false;
                }
                _ => {}
            }
        }
        Ok(elements)
    }

    fn object(&mut self, node: Node<'_>) -> Result<Vec<Prop>, SandboxError> {
        let mut props = Vec::new();
        for prop in named(node) {
            match prop.kind() {
                "pair" => {
                    let key = self.prop_key(self.field(prop, "key")?)?;
                    props.push(Prop::KeyValue(key, self.expression(self.field(prop, "value")?)?));
                }
                "shorthand_property_identifier" => {
                    let name = self.text(prop).to_string();
                    props.push(Prop::KeyValue(
                        PropKey::Static(name.clone()),
                        Expr::Ident(name),
                    ));
                }
                "spread_element" => {
                    props.push(Prop::Spread(self.expression(self.first_named(prop)?)?));
                }
                "method_definition" => {
                    let name = self.field(prop, "name")?;
                    let accessor = children(prop)
                        .into_iter()
                        .take_while(|c| c.id() != name.id())
                        .any(|c| matches!(c.kind(), "get" | "set" | "*"));
                    if accessor {
                        return Err(unsupported(prop, "getter, setter or generator method"));
                    }
                    let key = self.prop_key(name)?;
                    props.push(Prop::KeyValue(key, Expr::Function(self.function(prop, false)?)));
                }
                other => return Err(unsupported(prop, format!("object member `{other}`"))),
            }
        }
        Ok(props)
    }

    fn template(&mut self, node: Node<'_>) -> Result<Vec<TemplatePart>, SandboxError> {
        let end = node.end_byte().saturating_sub(1);
        let mut pos = node.start_byte() + 1;
        let mut parts = Vec::new();
        for child in named(node) {
            if child.kind() != "template_substitution" {
                continue;
            }
            let literal = self.source.get(pos..child.start_byte()).unwrap_or_default();
            if !literal.is_empty() {
                parts.push(TemplatePart::Str(decode_escapes(literal)));
            }
            parts.push(TemplatePart::Expr(self.expression(self.first_named(child)?)?));
            pos = child.end_byte();
        }
        let literal = self.source.get(pos..end).unwrap_or_default();
        if !literal.is_empty() {
            parts.push(TemplatePart::Str(decode_escapes(literal)));
        }
        Ok(parts)
    }

    fn expression(&mut self, node: Node<'_>) -> Result<Expr, SandboxError> {
        self.nest(node)?;
        let expr = self.expression_inner(node);
        self.depth -= 1;
        expr
    }

    fn expression_inner(&mut self, node: Node<'_>) -> Result<Expr, SandboxError> {
        Ok(match node.kind() {
            "parenthesized_expression" | "await_expression" => {
                self.expression(self.first_named(node)?)?
            }
            "sequence_expression" => Expr::Sequence(
                named(node)
                    .into_iter()
                    .map(|n| self.expression(n))
                    .collect::<Result<_, _>>()?,
            ),
            "identifier" => Expr::Ident(self.text(node).to_string()),
            "undefined" => Expr::Undefined,
            "null" => Expr::Null,
            "true" => Expr::Bool(true),
            "false" => Expr::Bool(false),
            "this" => Expr::This,
            "number" => Expr::Number(
                parse_number(self.text(node)).ok_or_else(|| unsupported(node, "numeric literal"))?,
            ),
            "string" => Expr::Str(decode_string_literal(self.text(node))),
            "template_string" => Expr::Template(self.template(node)?),
            "array" => Expr::Array(self.elements(node)?),
            "object" => Expr::Object(self.object(node)?),
            "function_expression" | "function" => Expr::Function(self.function(node, false)?),
            "arrow_function" => Expr::Function(self.function(node, true)?),
            "call_expression" => {
                let args = self.field(node, "arguments")?;
                if args.kind() == "template_string" {
                    return Err(unsupported(node, "tagged template"));
                }
                Expr::Call {
                    callee: Box::new(self.expression(self.field(node, "function")?)?),
                    args: self.elements(args)?,
                    optional: has_optional_chain(node),
                }
            }
            "new_expression" => Expr::New {
                callee: Box::new(self.expression(self.field(node, "constructor")?)?),
                args: match node.child_by_field_name("arguments") {
                    Some(args) => self.elements(args)?,
                    None => Vec::new(),
                },
            },
            "member_expression" => {
                let property = self.field(node, "property")?;
                if property.kind() == "private_property_identifier" {
                    return Err(unsupported(node, "private field"));
                }
                Expr::Member {
                    object: Box::new(self.expression(self.field(node, "object")?)?),
                    property: PropKey::Static(self.text(property).to_string()),
                    optional: has_optional_chain(node),
                }
            }
            "subscript_expression" => Expr::Member {
                object: Box::new(self.expression(self.field(node, "object")?)?),
                property: PropKey::Computed(Box::new(
                    self.expression(self.field(node, "index")?)?,
                )),
                optional: has_optional_chain(node),
            },
            "assignment_expression" => Expr::Assign {
                op: AssignOp::Assign,
                target: self.pattern(self.field(node, "left")?)?,
                value: Box::new(self.expression(self.field(node, "right")?)?),
            },
            "augmented_assignment_expression" => {
                let op = AssignOp::from_token(self.operator(node))
                    .ok_or_else(|| unsupported(node, "assignment operator"))?;
                let target = self.pattern(self.field(node, "left")?)?;
                if !matches!(target, Pattern::Ident(_) | Pattern::Member(_)) {
                    return Err(unsupported(node, "compound assignment to a pattern"));
                }
                Expr::Assign {
                    op,
                    target,
                    value: Box::new(self.expression(self.field(node, "right")?)?),
                }
            }
            "unary_expression" => {
                let op = match self.operator(node) {
                    "!" => UnaryOp::Not,
                    "-" => UnaryOp::Neg,
                    "+" => UnaryOp::Plus,
                    "~" => UnaryOp::BitNot,
                    "typeof" => UnaryOp::Typeof,
                    "void" => UnaryOp::Void,
                    "delete" => UnaryOp::Delete,
                    other => return Err(unsupported(node, format!("unary operator `{other}`"))),
                };
                Expr::Unary(op, Box::new(self.expression(self.field(node, "argument")?)?))
            }
            "binary_expression" => {
                let token = self.operator(node);
                let left = Box::new(self.expression(self.field(node, "left")?)?);
                let right = Box::new(self.expression(self.field(node, "right")?)?);
                if let Some(op) = LogicalOp::from_token(token) {
                    Expr::Logical(op, left, right)
                } else {
                    let op = BinaryOp::from_token(token)
                        .ok_or_else(|| unsupported(node, format!("operator `{token}`")))?;
                    Expr::Binary(op, left, right)
                }
            }
            "update_expression" => {
                let increment = self.operator(node) == "++";
                let prefix = children(node)
                    .first()
                    .is_some_and(|c| matches!(c.kind(), "++" | "--"));
                let target = self.expression(self.field(node, "argument")?)?;
                if !matches!(target, Expr::Ident(_) | Expr::Member { .. }) {
                    return Err(unsupported(node, "update of a non-reference"));
                }
                Expr::Update {
                    increment,
                    prefix,
                    target: Box::new(target),
                }
            }
            "ternary_expression" => Expr::Conditional(
                Box::new(self.expression(self.field(node, "condition")?)?),
                Box::new(self.expression(self.field(node, "consequence")?)?),
                Box::new(self.expression(self.field(node, "alternative")?)?),
            ),
            "regex" => return Err(unsupported(node, "regular expression literal")),
            "class" => return Err(unsupported(node, "class expression")),
            "generator_function" | "yield_expression" => {
                return Err(unsupported(node, "generator"));
            }
            "super" | "meta_property" => return Err(unsupported(node, node.kind())),
            other => return Err(unsupported(node, format!("expression `{other}`"))),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn program(source: &str) -> Vec<Stmt> {
        let tree = parse(source).unwrap();
        lower(&tree, source).unwrap()
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = parse("let a = 1;\nlet = ;").unwrap_err();
        match err {
            SandboxError::Syntax { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unbalanced_braces_is_syntax_error() {
        assert!(matches!(
            parse("function f() {"),
            Err(SandboxError::Syntax { .. })
        ));
    }

    #[test]
    fn test_lower_top_level_return() {
        let stmts = program("return 1 + 1;");
        assert!(matches!(
            stmts.as_slice(),
            [Stmt::Return(Some(Expr::Binary(BinaryOp::Add, _, _)))]
        ));
    }

    #[test]
    fn test_comments_are_skipped() {
        let stmts = program("// leading\nconst x = /* inline */ 1; // trailing\n");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn test_for_statement_clauses() {
        let stmts = program("for (let i = 0; i < 3; i++) {}");
        match &stmts[0] {
            Stmt::For {
                init, test, update, ..
            } => {
                assert!(matches!(init.as_deref(), Some(Stmt::Decl { .. })));
                assert!(test.is_some());
                assert!(update.is_some());
            }
            other => panic!("unexpected statement: {other:?}"),
        }

        let stmts = program("for (;;) { break; }");
        assert!(matches!(
            &stmts[0],
            Stmt::For {
                init: None,
                test: None,
                update: None,
                ..
            }
        ));
    }

    #[test]
    fn test_for_of_and_in() {
        let stmts = program("for (const x of xs) {} for (k in obj) {}");
        assert!(matches!(
            &stmts[0],
            Stmt::ForEach {
                kind: ForEachKind::Of,
                decl: Some(DeclKind::Const),
                ..
            }
        ));
        assert!(matches!(
            &stmts[1],
            Stmt::ForEach {
                kind: ForEachKind::In,
                decl: None,
                ..
            }
        ));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(decode_string_literal(r#""a\nb""#), "a\nb");
        assert_eq!(decode_string_literal(r"'it\'s'"), "it's");
        assert_eq!(decode_string_literal(r#""\x41B\u{43}""#), "ABC");
        assert_eq!(decode_string_literal(r#""😀""#), "😀");
    }

    #[test]
    fn test_template_parts() {
        let stmts = program("`a${x}b`;");
        match &stmts[0] {
            Stmt::Expr(Expr::Template(parts)) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(&parts[0], TemplatePart::Str(s) if s == "a"));
                assert!(matches!(&parts[1], TemplatePart::Expr(Expr::Ident(x)) if x == "x"));
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse_number("0xff"), Some(255.0));
        assert_eq!(parse_number("1_000"), Some(1000.0));
        assert_eq!(parse_number("1.5e3"), Some(1500.0));
        assert_eq!(parse_number(".5"), Some(0.5));
        assert_eq!(parse_number("10n"), None);
    }

    #[test]
    fn test_unsupported_constructs() {
        for source in ["class A {}", "const r = /a+/;", "function* g() {}", "outer: for (;;) {}"] {
            let tree = parse(source).unwrap();
            assert!(
                matches!(lower(&tree, source), Err(SandboxError::Unsupported { .. })),
                "{source} should be unsupported"
            );
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let source = format!("return {}1{};", "(".repeat(400), ")".repeat(400));
        let tree = parse(&source).unwrap();
        assert!(matches!(
            lower(&tree, &source),
            Err(SandboxError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_array_holes() {
        let stmts = program("[1, , 2];");
        match &stmts[0] {
            Stmt::Expr(Expr::Array(elements)) => {
                assert_eq!(elements.len(), 3);
                assert!(matches!(elements[1], Element::Hole));
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }
}
