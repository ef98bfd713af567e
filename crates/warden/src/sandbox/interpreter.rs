//! Tree-walking interpreter over [`ast`](super::ast).
//!
//! Every statement and expression evaluation is one step against the run's
//! budget. Budget exhaustion aborts the run with an [`Interrupt::Abort`],
//! which sandboxed `try`/`catch` never sees.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::Value as Json;

use super::ast::{
    AssignOp, BinaryOp, DeclKind, Element, Expr, ForEachKind, FunctionBody, FunctionDef,
    LogicalOp, Pattern, Prop, PropKey, Stmt, TemplatePart, UnaryOp,
};
use super::builtins;
use super::capability::{Capability, SandboxContext};
use super::value::{Function, Value, loose_equals, number_to_string, strict_equals};
use super::{ConsoleLevel, ConsoleLine, Limit};
use crate::limits::{LimitedBuffer, ResourceLimits};

/// How often the wall clock is consulted, in steps.
const CLOCK_CHECK_INTERVAL: u64 = 1024;

/// Tracked closure scopes before dead entries are swept.
const CLOSURE_ENV_PRUNE_AT: usize = 4096;

/// Non-local exit from evaluation.
pub(crate) enum Interrupt {
    /// A script-level exception, catchable by `try`
    Throw(Value),
    /// A resource limit was hit; unwinds the whole run
    Abort(Limit),
}

/// Statement completion.
pub(crate) enum Completion {
    Normal,
    Return(Value),
    Break,
    Continue,
}

struct Binding {
    value: Value,
    mutable: bool,
}

enum AssignFailure {
    Undeclared,
    Constant,
}

/// Lexical environment.
pub(crate) struct Scope {
    vars: RefCell<HashMap<String, Binding>>,
    parent: Option<Rc<Scope>>,
    is_function: bool,
}

impl Scope {
    fn root() -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent: None,
            is_function: true,
        })
    }

    fn child(parent: &Rc<Scope>, is_function: bool) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
            is_function,
        })
    }

    pub(crate) fn declare(&self, name: &str, value: Value, mutable: bool) {
        self.vars
            .borrow_mut()
            .insert(name.to_string(), Binding { value, mutable });
    }

    fn has_local(&self, name: &str) -> bool {
        self.vars.borrow().contains_key(name)
    }

    fn local(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).map(|b| b.value.clone())
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = self;
        loop {
            if let Some(binding) = scope.vars.borrow().get(name) {
                return Some(binding.value.clone());
            }
            scope = scope.parent.as_deref()?;
        }
    }

    fn assign(&self, name: &str, value: Value) -> Result<(), AssignFailure> {
        let mut scope = self;
        loop {
            if let Some(binding) = scope.vars.borrow_mut().get_mut(name) {
                if !binding.mutable {
                    return Err(AssignFailure::Constant);
                }
                binding.value = value;
                return Ok(());
            }
            scope = scope.parent.as_deref().ok_or(AssignFailure::Undeclared)?;
        }
    }

    fn function_scope(self: &Rc<Self>) -> Rc<Scope> {
        let mut scope = self;
        while !scope.is_function {
            match &scope.parent {
                Some(parent) => scope = parent,
                None => break,
            }
        }
        Rc::clone(scope)
    }

    /// Drop all bindings, breaking closure reference cycles.
    fn clear(&self) {
        let vars = std::mem::take(&mut *self.vars.borrow_mut());
        drop(vars);
    }
}

#[derive(Clone, Copy)]
enum BindMode {
    Declare { mutable: bool },
    Assign,
}

/// A resolved assignment target.
enum Place {
    Name(String),
    Property(Value, Value),
}

pub(crate) fn error_value(name: &str, message: impl Into<String>) -> Value {
    let mut entries = IndexMap::new();
    entries.insert("name".to_string(), Value::string(name));
    entries.insert("message".to_string(), Value::string(message.into()));
    Value::object(entries)
}

pub(crate) fn type_error(message: impl Into<String>) -> Interrupt {
    Interrupt::Throw(error_value("TypeError", message))
}

pub(crate) fn range_error(message: impl Into<String>) -> Interrupt {
    Interrupt::Throw(error_value("RangeError", message))
}

fn reference_error(message: impl Into<String>) -> Interrupt {
    Interrupt::Throw(error_value("ReferenceError", message))
}

/// Canonical property key of a value.
pub(crate) fn property_key(key: &Value) -> String {
    match key {
        Value::Str(s) => s.to_string(),
        other => other.to_js_string(),
    }
}

/// Array index named by `key`, if it is one.
pub(crate) fn array_index(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n < 4_294_967_295.0 => {
            Some(*n as usize)
        }
        Value::Str(s) => s
            .parse::<usize>()
            .ok()
            .filter(|i| i.to_string() == **s),
        _ => None,
    }
}

pub(crate) fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32 as i32
}

pub(crate) fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::This => "this".to_string(),
        Expr::Member {
            object,
            property: PropKey::Static(name),
            ..
        } => format!("{}.{name}", describe(object)),
        Expr::Member { object, .. } => format!("{}[...]", describe(object)),
        Expr::Call { callee, .. } => format!("{}(...)", describe(callee)),
        _ => "expression".to_string(),
    }
}

/// Names bound by a pattern.
fn pattern_names(pattern: &Pattern, out: &mut Vec<String>) {
    match pattern {
        Pattern::Ident(name) => out.push(name.clone()),
        Pattern::Member(_) => {}
        Pattern::Array { elements, rest } => {
            for element in elements.iter().flatten() {
                pattern_names(element, out);
            }
            if let Some(rest) = rest {
                pattern_names(rest, out);
            }
        }
        Pattern::Object { props, rest } => {
            for (_, target) in props {
                pattern_names(target, out);
            }
            if let Some(rest) = rest {
                pattern_names(rest, out);
            }
        }
        Pattern::Default { target, .. } => pattern_names(target, out),
    }
}

/// `var` names declared anywhere in `stmts`, nested functions excluded.
fn var_names(stmts: &[Stmt], out: &mut Vec<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Decl {
                kind: DeclKind::Var,
                declarators,
            } => {
                for (pattern, _) in declarators {
                    pattern_names(pattern, out);
                }
            }
            Stmt::If {
                consequent,
                alternate,
                ..
            } => {
                var_names(std::slice::from_ref(&**consequent), out);
                if let Some(alternate) = alternate {
                    var_names(std::slice::from_ref(&**alternate), out);
                }
            }
            Stmt::Block(body) => var_names(body, out),
            Stmt::For { init, body, .. } => {
                if let Some(init) = init {
                    var_names(std::slice::from_ref(&**init), out);
                }
                var_names(std::slice::from_ref(&**body), out);
            }
            Stmt::ForEach {
                decl, target, body, ..
            } => {
                if *decl == Some(DeclKind::Var) {
                    pattern_names(target, out);
                }
                var_names(std::slice::from_ref(&**body), out);
            }
            Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => {
                var_names(std::slice::from_ref(&**body), out);
            }
            Stmt::Switch { cases, .. } => {
                for case in cases {
                    var_names(&case.body, out);
                }
            }
            Stmt::Try {
                block,
                handler,
                finalizer,
                ..
            } => {
                var_names(block, out);
                if let Some(handler) = handler {
                    var_names(handler, out);
                }
                if let Some(finalizer) = finalizer {
                    var_names(finalizer, out);
                }
            }
            _ => {}
        }
    }
}

/// Budgeted evaluator for one run.
pub(crate) struct Interpreter {
    limits: ResourceLimits,
    operations: u64,
    deadline: Instant,
    depth: usize,
    console: LimitedBuffer,
    globals: Rc<Scope>,
    closure_envs: Vec<Weak<Scope>>,
    rng: SmallRng,
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        for env in self.closure_envs.drain(..) {
            if let Some(scope) = env.upgrade() {
                scope.clear();
            }
        }
        self.globals.clear();
    }
}

impl Interpreter {
    pub(crate) fn new(limits: &ResourceLimits, context: &SandboxContext) -> Self {
        let globals = Scope::root();
        builtins::install(&globals);
        for (name, capability) in context.iter() {
            globals.declare(name, capability_object(name, capability), false);
        }
        globals.declare("this", Value::Undefined, false);

        Self {
            limits: limits.clone(),
            operations: 0,
            deadline: Instant::now() + limits.timeout,
            depth: 0,
            console: LimitedBuffer::new(limits.max_output_bytes),
            globals,
            closure_envs: Vec::new(),
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Run a program; a top-level `return` provides the result.
    pub(crate) fn run(&mut self, program: &[Stmt]) -> Result<Value, Interrupt> {
        let scope = Scope::child(&self.globals, true);
        self.hoist_vars(program, &scope);
        match self.exec_block(program, &scope)? {
            Completion::Return(value) => Ok(value),
            _ => Ok(Value::Undefined),
        }
    }

    /// Call `callee` with JSON arguments.
    pub(crate) fn invoke(&mut self, callee: &Value, args: &[Json]) -> Result<Value, Interrupt> {
        let Value::Function(function) = callee else {
            return Err(type_error(format!(
                "script evaluated to {}, not a function",
                callee.type_of()
            )));
        };
        let args = args.iter().map(Value::from_json).collect();
        self.call_function(function, Value::Undefined, args)
    }

    pub(crate) fn operations(&self) -> u64 {
        self.operations
    }

    pub(crate) fn take_console(&mut self) -> (Vec<ConsoleLine>, bool) {
        let console = std::mem::replace(&mut self.console, LimitedBuffer::new(0));
        let truncated = console.was_truncated();
        (console.into_lines(), truncated)
    }

    pub(crate) fn console(&mut self, level: ConsoleLevel, args: &[Value]) {
        let text = args
            .iter()
            .map(Value::inspect)
            .collect::<Vec<_>>()
            .join(" ");
        tracing::trace!(target: "warden::sandbox::console", ?level, "{text}");
        self.console.push(level, text);
    }

    /// Uniform in `[0, 1)`.
    pub(crate) fn next_random(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    fn tick(&mut self) -> Result<(), Interrupt> {
        self.operations += 1;
        if self.operations > self.limits.max_operations {
            return Err(Interrupt::Abort(Limit::Operations));
        }
        if self.operations % CLOCK_CHECK_INTERVAL == 0 && Instant::now() >= self.deadline {
            return Err(Interrupt::Abort(Limit::Timeout));
        }
        Ok(())
    }

    pub(crate) fn check_len(&self, len: usize) -> Result<(), Interrupt> {
        if len > self.limits.max_collection_len {
            return Err(Interrupt::Abort(Limit::CollectionLength));
        }
        Ok(())
    }

    pub(crate) fn check_string_len(&self, len: usize) -> Result<(), Interrupt> {
        if len > self.limits.max_string_bytes {
            return Err(Interrupt::Abort(Limit::StringLength));
        }
        Ok(())
    }

    pub(crate) fn new_string(&self, s: String) -> Result<Value, Interrupt> {
        self.check_string_len(s.len())?;
        Ok(Value::string(s))
    }

    pub(crate) fn new_array(&self, items: Vec<Value>) -> Result<Value, Interrupt> {
        self.check_len(items.len())?;
        Ok(Value::array(items))
    }

    fn make_closure(&mut self, def: &Rc<FunctionDef>, scope: &Rc<Scope>) -> Value {
        let already_tracked = self
            .closure_envs
            .last()
            .is_some_and(|last| std::ptr::eq(last.as_ptr(), Rc::as_ptr(scope)));
        if !already_tracked {
            if self.closure_envs.len() >= CLOSURE_ENV_PRUNE_AT {
                self.closure_envs.retain(|env| env.strong_count() > 0);
            }
            self.closure_envs.push(Rc::downgrade(scope));
        }
        Value::Function(Rc::new(Function::Closure {
            def: Rc::clone(def),
            env: Rc::clone(scope),
        }))
    }

    fn hoist_vars(&self, stmts: &[Stmt], scope: &Rc<Scope>) {
        let mut names = Vec::new();
        var_names(stmts, &mut names);
        for name in names {
            if !scope.has_local(&name) {
                scope.declare(&name, Value::Undefined, true);
            }
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt], scope: &Rc<Scope>) -> Result<Completion, Interrupt> {
        for stmt in stmts {
            if let Stmt::Function(def) = stmt
                && let Some(name) = &def.name
            {
                let function = self.make_closure(def, scope);
                scope.declare(name, function, true);
            }
        }
        for stmt in stmts {
            match self.exec(stmt, scope)? {
                Completion::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Completion::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> Result<Completion, Interrupt> {
        self.tick()?;
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            Stmt::Decl { kind, declarators } => {
                for (pattern, init) in declarators {
                    if *kind == DeclKind::Var {
                        let Some(init) = init else {
                            continue;
                        };
                        let value = self.eval(init, scope)?;
                        let target = scope.function_scope();
                        self.bind(pattern, value, &target, BindMode::Declare { mutable: true })?;
                    } else {
                        let value = match init {
                            Some(init) => self.eval(init, scope)?,
                            None => Value::Undefined,
                        };
                        let mutable = *kind != DeclKind::Const;
                        self.bind(pattern, value, scope, BindMode::Declare { mutable })?;
                    }
                }
            }
            Stmt::Function(_) | Stmt::Empty => {}
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Undefined,
                };
                return Ok(Completion::Return(value));
            }
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, scope)?.truthy() {
                    return self.exec(consequent, scope);
                } else if let Some(alternate) = alternate {
                    return self.exec(alternate, scope);
                }
            }
            Stmt::Block(body) => {
                let inner = Scope::child(scope, false);
                return self.exec_block(body, &inner);
            }
            Stmt::For {
                init,
                test,
                update,
                body,
            } => {
                return self.exec_for(init.as_deref(), test.as_ref(), update.as_ref(), body, scope);
            }
            Stmt::ForEach {
                kind,
                decl,
                target,
                iterable,
                body,
            } => {
                let iterable = self.eval(iterable, scope)?;
                let items = match kind {
                    ForEachKind::Of => self.iterate(&iterable)?,
                    ForEachKind::In => builtins::keys_of(&iterable)
                        .into_iter()
                        .map(Value::string)
                        .collect(),
                };
                for item in items {
                    self.tick()?;
                    let iteration = Scope::child(scope, false);
                    match decl {
                        Some(DeclKind::Var) => {
                            let target_scope = scope.function_scope();
                            self.bind(target, item, &target_scope, BindMode::Declare {
                                mutable: true,
                            })?;
                        }
                        Some(kind) => {
                            let mutable = *kind != DeclKind::Const;
                            self.bind(target, item, &iteration, BindMode::Declare { mutable })?;
                        }
                        None => self.bind(target, item, &iteration, BindMode::Assign)?,
                    }
                    match self.exec(body, &iteration)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                }
            }
            Stmt::While { test, body } => loop {
                self.tick()?;
                if !self.eval(test, scope)?.truthy() {
                    break;
                }
                match self.exec(body, scope)? {
                    Completion::Break => break,
                    Completion::Return(value) => return Ok(Completion::Return(value)),
                    Completion::Normal | Completion::Continue => {}
                }
            },
            Stmt::DoWhile { body, test } => loop {
                self.tick()?;
                match self.exec(body, scope)? {
                    Completion::Break => break,
                    Completion::Return(value) => return Ok(Completion::Return(value)),
                    Completion::Normal | Completion::Continue => {}
                }
                if !self.eval(test, scope)?.truthy() {
                    break;
                }
            },
            Stmt::Switch {
                discriminant,
                cases,
            } => {
                let value = self.eval(discriminant, scope)?;
                let inner = Scope::child(scope, false);
                let mut start = None;
                for (i, case) in cases.iter().enumerate() {
                    if let Some(test) = &case.test
                        && strict_equals(&self.eval(test, &inner)?, &value)
                    {
                        start = Some(i);
                        break;
                    }
                }
                let start = start.or_else(|| cases.iter().position(|c| c.test.is_none()));
                if let Some(start) = start {
                    for case in &cases[start..] {
                        for stmt in &case.body {
                            match self.exec(stmt, &inner)? {
                                Completion::Normal => {}
                                Completion::Break => return Ok(Completion::Normal),
                                other => return Ok(other),
                            }
                        }
                    }
                }
            }
            Stmt::Break => return Ok(Completion::Break),
            Stmt::Continue => return Ok(Completion::Continue),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, scope)?;
                return Err(Interrupt::Throw(value));
            }
            Stmt::Try {
                block,
                param,
                handler,
                finalizer,
            } => {
                let mut result = self.exec_block(block, &Scope::child(scope, false));
                if let Some(handler) = handler
                    && let Err(Interrupt::Throw(thrown)) = result
                {
                    let catch_scope = Scope::child(scope, false);
                    result = match param {
                        Some(param) => self
                            .bind(param, thrown, &catch_scope, BindMode::Declare {
                                mutable: true,
                            })
                            .and_then(|()| self.exec_block(handler, &catch_scope)),
                        None => self.exec_block(handler, &catch_scope),
                    };
                }
                if let Some(finalizer) = finalizer {
                    if matches!(result, Err(Interrupt::Abort(_))) {
                        return result;
                    }
                    match self.exec_block(finalizer, &Scope::child(scope, false))? {
                        Completion::Normal => {}
                        other => return Ok(other),
                    }
                }
                return result;
            }
        }
        Ok(Completion::Normal)
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
        scope: &Rc<Scope>,
    ) -> Result<Completion, Interrupt> {
        let loop_scope = Scope::child(scope, false);
        // `let` loop variables get a fresh binding per iteration.
        let mut per_iteration = Vec::new();
        if let Some(init) = init {
            if let Stmt::Decl {
                kind: DeclKind::Let | DeclKind::Const,
                declarators,
            } = init
            {
                for (pattern, _) in declarators {
                    pattern_names(pattern, &mut per_iteration);
                }
            }
            self.exec(init, &loop_scope)?;
        }

        loop {
            self.tick()?;
            if let Some(test) = test
                && !self.eval(test, &loop_scope)?.truthy()
            {
                break;
            }

            let body_scope = if per_iteration.is_empty() {
                Rc::clone(&loop_scope)
            } else {
                let iteration = Scope::child(&loop_scope, false);
                for name in &per_iteration {
                    let value = loop_scope.local(name).unwrap_or(Value::Undefined);
                    iteration.declare(name, value, true);
                }
                iteration
            };

            let completion = self.exec(body, &body_scope)?;

            for name in &per_iteration {
                if let Some(value) = body_scope.local(name) {
                    loop_scope.declare(name, value, true);
                }
            }

            match completion {
                Completion::Break => break,
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Normal | Completion::Continue => {}
            }

            if let Some(update) = update {
                self.eval(update, &loop_scope)?;
            }
        }
        Ok(Completion::Normal)
    }

    fn bind(
        &mut self,
        pattern: &Pattern,
        value: Value,
        scope: &Rc<Scope>,
        mode: BindMode,
    ) -> Result<(), Interrupt> {
        match pattern {
            Pattern::Ident(name) => match mode {
                BindMode::Declare { mutable } => {
                    scope.declare(name, value, mutable);
                    Ok(())
                }
                BindMode::Assign => self.assign_name(name, value, scope),
            },
            Pattern::Member(expr) => {
                let place = self.resolve_place(expr, scope)?;
                self.write_place(place, value, scope)
            }
            Pattern::Default {
                target,
                value: default,
            } => {
                let value = match value {
                    Value::Undefined => self.eval(default, scope)?,
                    other => other,
                };
                self.bind(target, value, scope, mode)
            }
            Pattern::Array { elements, rest } => {
                let items = self.iterate(&value)?;
                for (i, element) in elements.iter().enumerate() {
                    if let Some(element) = element {
                        let item = items.get(i).cloned().unwrap_or(Value::Undefined);
                        self.bind(element, item, scope, mode)?;
                    }
                }
                if let Some(rest) = rest {
                    let remaining = items.get(elements.len()..).unwrap_or_default().to_vec();
                    self.bind(rest, Value::array(remaining), scope, mode)?;
                }
                Ok(())
            }
            Pattern::Object { props, rest } => {
                if value.is_nullish() {
                    return Err(type_error(format!(
                        "Cannot destructure '{}' as it is {}.",
                        value.to_js_string(),
                        value.to_js_string()
                    )));
                }
                let mut used = Vec::new();
                for (key, target) in props {
                    let key = self.prop_key(key, scope)?;
                    let item = self.get_property(&value, &key)?;
                    used.push(property_key(&key));
                    self.bind(target, item, scope, mode)?;
                }
                if let Some(rest) = rest {
                    let remaining = match &value {
                        Value::Object(entries) => entries
                            .borrow()
                            .iter()
                            .filter(|(k, _)| !used.contains(k))
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                        _ => IndexMap::new(),
                    };
                    self.bind(rest, Value::object(remaining), scope, mode)?;
                }
                Ok(())
            }
        }
    }

    fn assign_name(&self, name: &str, value: Value, scope: &Rc<Scope>) -> Result<(), Interrupt> {
        scope.assign(name, value).map_err(|failure| match failure {
            AssignFailure::Constant => type_error("Assignment to constant variable."),
            AssignFailure::Undeclared => reference_error(format!("{name} is not defined")),
        })
    }

    fn resolve_place(&mut self, target: &Expr, scope: &Rc<Scope>) -> Result<Place, Interrupt> {
        match target {
            Expr::Ident(name) => Ok(Place::Name(name.clone())),
            Expr::Member {
                object, property, ..
            } => {
                let object = self.eval(object, scope)?;
                let key = self.prop_key(property, scope)?;
                Ok(Place::Property(object, key))
            }
            other => Err(reference_error(format!(
                "Invalid assignment target: {}",
                describe(other)
            ))),
        }
    }

    fn read_place(&mut self, place: &Place, scope: &Rc<Scope>) -> Result<Value, Interrupt> {
        match place {
            Place::Name(name) => scope
                .lookup(name)
                .ok_or_else(|| reference_error(format!("{name} is not defined"))),
            Place::Property(object, key) => self.get_property(object, key),
        }
    }

    fn write_place(
        &mut self,
        place: Place,
        value: Value,
        scope: &Rc<Scope>,
    ) -> Result<(), Interrupt> {
        match place {
            Place::Name(name) => self.assign_name(&name, value, scope),
            Place::Property(object, key) => self.set_property(&object, &key, value),
        }
    }

    fn target_place(&mut self, target: &Pattern, scope: &Rc<Scope>) -> Result<Place, Interrupt> {
        match target {
            Pattern::Ident(name) => Ok(Place::Name(name.clone())),
            Pattern::Member(expr) => self.resolve_place(expr, scope),
            _ => Err(reference_error("Invalid compound assignment target")),
        }
    }

    pub(crate) fn get_property(&mut self, target: &Value, key: &Value) -> Result<Value, Interrupt> {
        let name = property_key(key);
        Ok(match target {
            Value::Undefined | Value::Null => {
                return Err(type_error(format!(
                    "Cannot read properties of {} (reading '{name}')",
                    target.to_js_string()
                )));
            }
            Value::Object(entries) => {
                let found = entries.borrow().get(&name).cloned();
                match found {
                    Some(value) => value,
                    None => builtins::method(target, &name).unwrap_or(Value::Undefined),
                }
            }
            Value::Array(items) => {
                if name == "length" {
                    Value::Number(items.borrow().len() as f64)
                } else if let Some(index) = array_index(key) {
                    items.borrow().get(index).cloned().unwrap_or(Value::Undefined)
                } else {
                    builtins::method(target, &name).unwrap_or(Value::Undefined)
                }
            }
            Value::Str(s) => {
                if name == "length" {
                    Value::Number(s.chars().count() as f64)
                } else if let Some(index) = array_index(key) {
                    s.chars()
                        .nth(index)
                        .map_or(Value::Undefined, |c| Value::string(c.to_string()))
                } else {
                    builtins::method(target, &name).unwrap_or(Value::Undefined)
                }
            }
            Value::Function(function) => {
                if name == "name" {
                    Value::string(function.name())
                } else {
                    builtins::static_member(function, &name).unwrap_or(Value::Undefined)
                }
            }
            Value::Number(_) | Value::Bool(_) => {
                builtins::method(target, &name).unwrap_or(Value::Undefined)
            }
        })
    }

    pub(crate) fn set_property(
        &mut self,
        target: &Value,
        key: &Value,
        value: Value,
    ) -> Result<(), Interrupt> {
        match target {
            Value::Undefined | Value::Null => Err(type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                target.to_js_string(),
                property_key(key)
            ))),
            Value::Object(entries) => {
                let name = property_key(key);
                let len = entries.borrow().len();
                if !entries.borrow().contains_key(&name) {
                    self.check_len(len + 1)?;
                }
                entries.borrow_mut().insert(name, value);
                Ok(())
            }
            Value::Array(items) => {
                if property_key(key) == "length" {
                    let len = value.to_number();
                    if len < 0.0 || len.fract() != 0.0 || !len.is_finite() {
                        return Err(range_error("Invalid array length"));
                    }
                    let len = len as usize;
                    self.check_len(len)?;
                    items.borrow_mut().resize(len, Value::Undefined);
                } else if let Some(index) = array_index(key) {
                    let len = items.borrow().len();
                    if index >= len {
                        self.check_len(index + 1)?;
                        items.borrow_mut().resize(index + 1, Value::Undefined);
                    }
                    items.borrow_mut()[index] = value;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn prop_key(&mut self, key: &PropKey, scope: &Rc<Scope>) -> Result<Value, Interrupt> {
        match key {
            PropKey::Static(name) => Ok(Value::string(name.as_str())),
            PropKey::Computed(expr) => self.eval(expr, scope),
        }
    }

    /// Items produced by `for..of` and spread.
    pub(crate) fn iterate(&self, value: &Value) -> Result<Vec<Value>, Interrupt> {
        match value {
            Value::Array(items) => Ok(items.borrow().clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::string(c.to_string())).collect()),
            other => Err(type_error(format!(
                "{} is not iterable",
                if other.is_nullish() {
                    other.to_js_string()
                } else {
                    other.type_of().to_string()
                }
            ))),
        }
    }

    fn eval_elements(
        &mut self,
        elements: &[Element],
        scope: &Rc<Scope>,
    ) -> Result<Vec<Value>, Interrupt> {
        let mut values = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                Element::Expr(expr) => values.push(self.eval(expr, scope)?),
                Element::Spread(expr) => {
                    let spread = self.eval(expr, scope)?;
                    values.extend(self.iterate(&spread)?);
                }
                Element::Hole => values.push(Value::Undefined),
            }
            self.check_len(values.len())?;
        }
        Ok(values)
    }

    pub(crate) fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Result<Value, Interrupt> {
        self.tick()?;
        Ok(match expr {
            Expr::Undefined => Value::Undefined,
            Expr::Null => Value::Null,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Number(n) => Value::Number(*n),
            Expr::Str(s) => Value::string(s.as_str()),
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Str(s) => out.push_str(s),
                        TemplatePart::Expr(expr) => {
                            out.push_str(&self.eval(expr, scope)?.to_js_string());
                        }
                    }
                    self.check_string_len(out.len())?;
                }
                Value::string(out)
            }
            Expr::Ident(name) => scope
                .lookup(name)
                .ok_or_else(|| reference_error(format!("{name} is not defined")))?,
            Expr::This => scope.lookup("this").unwrap_or(Value::Undefined),
            Expr::Array(elements) => Value::array(self.eval_elements(elements, scope)?),
            Expr::Object(props) => self.eval_object(props, scope)?,
            Expr::Function(def) => self.make_closure(def, scope),
            Expr::Unary(op, argument) => self.eval_unary(*op, argument, scope)?,
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                self.binary(*op, &left, &right)?
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(left, scope)?;
                let short_circuit = match op {
                    LogicalOp::And => !left.truthy(),
                    LogicalOp::Or => left.truthy(),
                    LogicalOp::Nullish => !left.is_nullish(),
                };
                if short_circuit {
                    left
                } else {
                    self.eval(right, scope)?
                }
            }
            Expr::Assign { op, target, value } => self.eval_assign(*op, target, value, scope)?,
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let place = self.resolve_place(target, scope)?;
                let old = self.read_place(&place, scope)?.to_number();
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write_place(place, Value::Number(new), scope)?;
                Value::Number(if *prefix { new } else { old })
            }
            Expr::Conditional(test, consequent, alternate) => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(consequent, scope)?
                } else {
                    self.eval(alternate, scope)?
                }
            }
            Expr::Member { .. } | Expr::Call { .. } => {
                self.eval_chain(expr, scope)?.unwrap_or(Value::Undefined)
            }
            Expr::New { callee, args } => {
                let constructor = self.eval(callee, scope)?;
                let args = self.eval_elements(args, scope)?;
                self.construct(&constructor, args, callee)?
            }
            Expr::Sequence(exprs) => {
                let mut last = Value::Undefined;
                for expr in exprs {
                    last = self.eval(expr, scope)?;
                }
                last
            }
        })
    }

    fn eval_object(&mut self, props: &[Prop], scope: &Rc<Scope>) -> Result<Value, Interrupt> {
        let mut entries = IndexMap::new();
        for prop in props {
            match prop {
                Prop::KeyValue(key, value) => {
                    let key = property_key(&self.prop_key(key, scope)?);
                    let value = self.eval(value, scope)?;
                    entries.insert(key, value);
                }
                Prop::Spread(expr) => match self.eval(expr, scope)? {
                    Value::Object(source) => {
                        for (k, v) in source.borrow().iter() {
                            entries.insert(k.clone(), v.clone());
                        }
                    }
                    Value::Array(items) => {
                        for (i, v) in items.borrow().iter().enumerate() {
                            entries.insert(i.to_string(), v.clone());
                        }
                    }
                    Value::Str(s) => {
                        for (i, c) in s.chars().enumerate() {
                            entries.insert(i.to_string(), Value::string(c.to_string()));
                        }
                    }
                    _ => {}
                },
            }
            self.check_len(entries.len())?;
        }
        Ok(Value::object(entries))
    }

    fn eval_unary(
        &mut self,
        op: UnaryOp,
        argument: &Expr,
        scope: &Rc<Scope>,
    ) -> Result<Value, Interrupt> {
        match op {
            UnaryOp::Typeof => {
                // `typeof undeclared` is not an error.
                if let Expr::Ident(name) = argument
                    && scope.lookup(name).is_none()
                {
                    return Ok(Value::string("undefined"));
                }
                let value = self.eval(argument, scope)?;
                Ok(Value::string(value.type_of()))
            }
            UnaryOp::Delete => {
                if let Expr::Member { .. } = argument
                    && let Place::Property(object, key) = self.resolve_place(argument, scope)?
                {
                    match &object {
                        Value::Object(entries) => {
                            entries.borrow_mut().shift_remove(&property_key(&key));
                        }
                        Value::Array(items) => {
                            if let Some(index) = array_index(&key)
                                && let Some(slot) = items.borrow_mut().get_mut(index)
                            {
                                *slot = Value::Undefined;
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Value::Bool(true))
            }
            _ => {
                let value = self.eval(argument, scope)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    UnaryOp::BitNot => Value::Number(f64::from(!to_int32(value.to_number()))),
                    _ => Value::Undefined,
                })
            }
        }
    }

    fn eval_assign(
        &mut self,
        op: AssignOp,
        target: &Pattern,
        value: &Expr,
        scope: &Rc<Scope>,
    ) -> Result<Value, Interrupt> {
        match op {
            AssignOp::Assign => {
                let value = self.eval(value, scope)?;
                self.bind(target, value.clone(), scope, BindMode::Assign)?;
                Ok(value)
            }
            AssignOp::Compound(op) => {
                let place = self.target_place(target, scope)?;
                let current = self.read_place(&place, scope)?;
                let rhs = self.eval(value, scope)?;
                let result = self.binary(op, &current, &rhs)?;
                self.write_place(place, result.clone(), scope)?;
                Ok(result)
            }
            AssignOp::Logical(op) => {
                let place = self.target_place(target, scope)?;
                let current = self.read_place(&place, scope)?;
                let keep = match op {
                    LogicalOp::And => !current.truthy(),
                    LogicalOp::Or => current.truthy(),
                    LogicalOp::Nullish => !current.is_nullish(),
                };
                if keep {
                    return Ok(current);
                }
                let value = self.eval(value, scope)?;
                self.write_place(place, value.clone(), scope)?;
                Ok(value)
            }
        }
    }

    /// Evaluate a member/call chain; `None` means an optional link
    /// short-circuited.
    fn eval_chain(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Result<Option<Value>, Interrupt> {
        match expr {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let Some(object) = self.eval_link(object, scope)? else {
                    return Ok(None);
                };
                if *optional && object.is_nullish() {
                    return Ok(None);
                }
                let key = self.prop_key(property, scope)?;
                Ok(Some(self.get_property(&object, &key)?))
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => {
                let (this, function) = match callee.as_ref() {
                    Expr::Member {
                        object,
                        property,
                        optional: member_optional,
                    } => {
                        let Some(object) = self.eval_link(object, scope)? else {
                            return Ok(None);
                        };
                        if *member_optional && object.is_nullish() {
                            return Ok(None);
                        }
                        let key = self.prop_key(property, scope)?;
                        let function = self.get_property(&object, &key)?;
                        (object, function)
                    }
                    other => {
                        let Some(function) = self.eval_link(other, scope)? else {
                            return Ok(None);
                        };
                        (Value::Undefined, function)
                    }
                };
                if *optional && function.is_nullish() {
                    return Ok(None);
                }
                let Value::Function(function) = function else {
                    return Err(type_error(format!("{} is not a function", describe(callee))));
                };
                let args = self.eval_elements(args, scope)?;
                Ok(Some(self.call_function(&function, this, args)?))
            }
            other => Ok(Some(self.eval(other, scope)?)),
        }
    }

    fn eval_link(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Result<Option<Value>, Interrupt> {
        match expr {
            Expr::Member { .. } | Expr::Call { .. } => self.eval_chain(expr, scope),
            other => Ok(Some(self.eval(other, scope)?)),
        }
    }

    fn construct(
        &mut self,
        constructor: &Value,
        args: Vec<Value>,
        callee: &Expr,
    ) -> Result<Value, Interrupt> {
        let Value::Function(function) = constructor else {
            return Err(type_error(format!("{} is not a constructor", describe(callee))));
        };
        match function.as_ref() {
            Function::Closure { def, .. } if !def.is_arrow => {
                let instance = Value::object(IndexMap::new());
                let result = self.call_function(function, instance.clone(), args)?;
                Ok(match result {
                    Value::Object(_) | Value::Array(_) => result,
                    _ => instance,
                })
            }
            Function::Native { .. } => self.call_function(function, Value::Undefined, args),
            _ => Err(type_error(format!("{} is not a constructor", describe(callee)))),
        }
    }

    pub(crate) fn call_function(
        &mut self,
        function: &Rc<Function>,
        this: Value,
        args: Vec<Value>,
    ) -> Result<Value, Interrupt> {
        if self.depth >= self.limits.max_call_depth {
            return Err(Interrupt::Abort(Limit::CallDepth));
        }
        self.depth += 1;
        let result = match function.as_ref() {
            Function::Closure { def, env } => self.call_closure(function, def, env, this, args),
            Function::Native { call, .. } => call(self, this, args),
            Function::Method { receiver, name } => {
                builtins::call_method(self, receiver.clone(), name, args)
            }
            Function::Capability {
                binding,
                method,
                capability,
            } => call_capability(binding, method, capability, &args),
        };
        self.depth -= 1;
        result
    }

    fn call_closure(
        &mut self,
        function: &Rc<Function>,
        def: &Rc<FunctionDef>,
        env: &Rc<Scope>,
        this: Value,
        args: Vec<Value>,
    ) -> Result<Value, Interrupt> {
        let scope = Scope::child(env, true);
        if !def.is_arrow {
            scope.declare("this", this, false);
            if let Some(name) = &def.name {
                scope.declare(name, Value::Function(Rc::clone(function)), true);
            }
        }
        for (i, param) in def.params.iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or(Value::Undefined);
            self.bind(param, value, &scope, BindMode::Declare { mutable: true })?;
        }
        if let Some(rest) = &def.rest {
            let extra = args.get(def.params.len()..).unwrap_or_default().to_vec();
            self.bind(rest, Value::array(extra), &scope, BindMode::Declare { mutable: true })?;
        }
        match &def.body {
            FunctionBody::Expr(expr) => self.eval(expr, &scope),
            FunctionBody::Block(body) => {
                self.hoist_vars(body, &scope);
                match self.exec_block(body, &scope)? {
                    Completion::Return(value) => Ok(value),
                    _ => Ok(Value::Undefined),
                }
            }
        }
    }

    /// Call a script function value from host code.
    pub(crate) fn call_value(
        &mut self,
        function: &Value,
        this: Value,
        args: Vec<Value>,
    ) -> Result<Value, Interrupt> {
        match function {
            Value::Function(function) => self.call_function(function, this, args),
            other => Err(type_error(format!("{} is not a function", other.inspect()))),
        }
    }

    pub(crate) fn binary(
        &mut self,
        op: BinaryOp,
        a: &Value,
        b: &Value,
    ) -> Result<Value, Interrupt> {
        let numeric = |f: fn(f64, f64) -> f64| Value::Number(f(a.to_number(), b.to_number()));
        let int32 = |f: fn(i32, i32) -> i32| {
            Value::Number(f64::from(f(to_int32(a.to_number()), to_int32(b.to_number()))))
        };
        Ok(match op {
            BinaryOp::Add => {
                let stringy = |v: &Value| {
                    matches!(
                        v,
                        Value::Str(_) | Value::Array(_) | Value::Object(_) | Value::Function(_)
                    )
                };
                if stringy(a) || stringy(b) {
                    let mut s = a.to_js_string();
                    s.push_str(&b.to_js_string());
                    self.new_string(s)?
                } else {
                    numeric(|x, y| x + y)
                }
            }
            BinaryOp::Sub => numeric(|x, y| x - y),
            BinaryOp::Mul => numeric(|x, y| x * y),
            BinaryOp::Div => numeric(|x, y| x / y),
            BinaryOp::Rem => numeric(|x, y| x % y),
            BinaryOp::Exp => numeric(f64::powf),
            BinaryOp::Eq => Value::Bool(loose_equals(a, b)),
            BinaryOp::NotEq => Value::Bool(!loose_equals(a, b)),
            BinaryOp::StrictEq => Value::Bool(strict_equals(a, b)),
            BinaryOp::StrictNotEq => Value::Bool(!strict_equals(a, b)),
            BinaryOp::Lt => Value::Bool(compare(a, b) == Some(Ordering::Less)),
            BinaryOp::Gt => Value::Bool(compare(a, b) == Some(Ordering::Greater)),
            BinaryOp::LtEq => Value::Bool(matches!(
                compare(a, b),
                Some(Ordering::Less | Ordering::Equal)
            )),
            BinaryOp::GtEq => Value::Bool(matches!(
                compare(a, b),
                Some(Ordering::Greater | Ordering::Equal)
            )),
            BinaryOp::BitAnd => int32(|x, y| x & y),
            BinaryOp::BitOr => int32(|x, y| x | y),
            BinaryOp::BitXor => int32(|x, y| x ^ y),
            BinaryOp::Shl => int32(|x, y| x.wrapping_shl(y as u32 & 31)),
            BinaryOp::Shr => int32(|x, y| x.wrapping_shr(y as u32 & 31)),
            BinaryOp::UShr => {
                let shift = to_uint32(b.to_number()) & 31;
                Value::Number(f64::from(to_uint32(a.to_number()) >> shift))
            }
            BinaryOp::In => {
                let key = property_key(a);
                match b {
                    Value::Object(entries) => Value::Bool(entries.borrow().contains_key(&key)),
                    Value::Array(items) => Value::Bool(
                        key == "length"
                            || array_index(a).is_some_and(|i| i < items.borrow().len()),
                    ),
                    other => {
                        return Err(type_error(format!(
                            "Cannot use 'in' operator to search for '{key}' in {}",
                            other.to_js_string()
                        )));
                    }
                }
            }
            BinaryOp::InstanceOf => {
                let Value::Function(function) = b else {
                    return Err(type_error("Right-hand side of 'instanceof' is not callable"));
                };
                Value::Bool(builtins::instance_of(a, function))
            }
        })
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => a.to_number().partial_cmp(&b.to_number()),
    }
}

fn capability_object(name: &str, capability: &Arc<dyn Capability>) -> Value {
    let methods = capability
        .methods()
        .iter()
        .map(|method| {
            let function = Function::Capability {
                binding: name.to_string(),
                method: (*method).to_string(),
                capability: Arc::clone(capability),
            };
            ((*method).to_string(), Value::Function(Rc::new(function)))
        })
        .collect();
    Value::object(methods)
}

fn call_capability(
    binding: &str,
    method: &str,
    capability: &Arc<dyn Capability>,
    args: &[Value],
) -> Result<Value, Interrupt> {
    let args: Vec<Json> = args.iter().map(Value::to_json).collect();
    tracing::debug!(capability = binding, method, "sandbox capability call");
    capability
        .invoke(method, &args)
        .map(|result| Value::from_json(&result))
        .map_err(|err| Interrupt::Throw(error_value("Error", err.to_string())))
}

/// Message of an uncaught exception.
pub(crate) fn thrown_message(thrown: &Value) -> String {
    if let Value::Object(entries) = thrown {
        let entries = entries.borrow();
        if let Some(Value::Str(message)) = entries.get("message") {
            return message.to_string();
        }
    }
    match thrown {
        Value::Number(n) => number_to_string(*n),
        other => other.to_js_string(),
    }
}
