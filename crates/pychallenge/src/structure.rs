//! Static checks: structural facts read from the learner's syntax tree.
//!
//! [`SourceFacts::parse`] parses the source once and walks every node with an
//! explicit visitor. The matches below are exhaustive over the statement,
//! expression and pattern enums of `rustpython_parser::ast`, so a node kind
//! added by the parser is a compile error here rather than a silently skipped
//! subtree.
//!
//! Sources are bounded before anything compiles them: at most
//! [`MAX_SOURCE_BYTES`] long and at most [`MAX_NESTING_DEPTH`] nodes deep.
//! The sandbox applies the same bounds through `check_shape` on its worker.

use std::collections::HashSet;
use std::panic;
use std::str::FromStr;
use std::thread;

use rustpython_parser::ast::{self, Ranged};
use rustpython_parser::Parse;

use crate::error::CheckError;
use crate::types::ExecutionError;

/// Deepest nesting of statements, expressions and patterns accepted for
/// parsing or execution. Matches CPython's limit on nested brackets.
pub const MAX_NESTING_DEPTH: usize = 200;

/// Largest learner source accepted for parsing or execution.
pub const MAX_SOURCE_BYTES: usize = 64 * 1024;

/// Stack of the thread [`SourceFacts::parse`] runs on. Syntax trees are
/// dropped recursively, one frame per level.
const PARSE_STACK_BYTES: usize = 64 * 1024 * 1024;

/// Assertions understood by the static evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticAssertion {
    IdentifierExists,
    FunctionExists,
    LiteralIncludes,
}

impl FromStr for StaticAssertion {
    type Err = CheckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identifier_exists" => Ok(Self::IdentifierExists),
            "function_exists" => Ok(Self::FunctionExists),
            "literal_includes" => Ok(Self::LiteralIncludes),
            other => Err(CheckError::UnknownStaticAssertion(other.to_string())),
        }
    }
}

/// Why learner source could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub message: String,
}

/// Names collected from one parsed source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFacts {
    identifiers: HashSet<String>,
    defined_functions: HashSet<String>,
    called_functions: HashSet<String>,
}

impl SourceFacts {
    /// Parses `source` on a dedicated large-stack thread and collects its facts.
    ///
    /// Oversized or too deeply nested sources are parse failures.
    pub fn parse(source: &str) -> Result<Self, ParseFailure> {
        if source.len() > MAX_SOURCE_BYTES {
            return Err(ParseFailure {
                message: too_large_message(),
            });
        }
        on_parse_stack(|| {
            let suite = ast::Suite::parse(source, "<learner>").map_err(|e| ParseFailure {
                message: e.to_string(),
            })?;
            let collector = FactCollector::walk(&suite);
            match collector.too_deep {
                Some(_) => Err(ParseFailure {
                    message: too_deep_message(),
                }),
                None => Ok(collector.facts),
            }
        })
    }

    /// Any name-bearing node spells exactly `name`: variable references and
    /// targets, def/class names, parameters, attributes, keyword arguments,
    /// import bindings, `global`/`nonlocal`, `except ... as`, match captures
    /// and type parameters.
    pub fn has_identifier(&self, name: &str) -> bool {
        self.identifiers.contains(name)
    }

    /// A `def`/`async def` named `name` exists, or `name(...)` is called.
    pub fn has_function(&self, name: &str) -> bool {
        self.defined_functions.contains(name) || self.called_functions.contains(name)
    }
}

/// Evaluates a static assertion.
///
/// `parsed` is checked first: a parse failure yields [`CheckError::ParseError`]
/// whatever the assertion, including `literal_includes`.
pub fn evaluate(
    parsed: &Result<impl AsRef<SourceFacts>, ParseFailure>,
    source: &str,
    assertion: &str,
    expected: &str,
) -> Result<bool, CheckError> {
    let facts = match parsed {
        Ok(facts) => facts.as_ref(),
        Err(_) => return Err(CheckError::ParseError),
    };
    Ok(match assertion.parse::<StaticAssertion>()? {
        StaticAssertion::IdentifierExists => facts.has_identifier(expected),
        StaticAssertion::FunctionExists => facts.has_function(expected),
        StaticAssertion::LiteralIncludes => source.contains(expected),
    })
}

impl AsRef<SourceFacts> for SourceFacts {
    fn as_ref(&self) -> &SourceFacts {
        self
    }
}

/// Refuses sources the sandbox must not hand to the compiler.
///
/// Sources that do not parse pass: the compiler reports those with its own
/// message and position.
pub(crate) fn check_shape(source: &str) -> Result<(), ExecutionError> {
    if source.len() > MAX_SOURCE_BYTES {
        return Err(ExecutionError::SourceTooLarge {
            limit_bytes: MAX_SOURCE_BYTES,
        });
    }
    let too_deep = on_parse_stack(|| {
        Ok(match ast::Suite::parse(source, "<learner>") {
            Ok(suite) => FactCollector::walk(&suite).too_deep,
            Err(_) => None,
        })
    });
    match too_deep {
        Ok(None) => Ok(()),
        Ok(Some(offset)) => {
            let (line, col) = position(source, offset);
            Err(ExecutionError::SyntaxError {
                message: too_deep_message(),
                line,
                col,
            })
        }
        Err(failure) => Err(ExecutionError::RuntimeError {
            message: failure.message,
            traceback: String::new(),
        }),
    }
}

fn too_deep_message() -> String {
    format!("too many nested blocks or expressions (limit {MAX_NESTING_DEPTH})")
}

fn too_large_message() -> String {
    format!("source exceeds {MAX_SOURCE_BYTES} bytes")
}

/// 1-based line and column of a byte offset.
fn position(source: &str, offset: usize) -> (u32, u32) {
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    (line as u32, (before.len() - line_start + 1) as u32)
}

/// Runs `parse` on a scoped thread with [`PARSE_STACK_BYTES`] of stack.
///
/// A panic on that thread is resumed on the caller's.
fn on_parse_stack<T, F>(parse: F) -> Result<T, ParseFailure>
where
    T: Send,
    F: FnOnce() -> Result<T, ParseFailure> + Send,
{
    thread::scope(|scope| {
        let handle = thread::Builder::new()
            .name("pychallenge-parse".to_string())
            .stack_size(PARSE_STACK_BYTES)
            .spawn_scoped(scope, parse)
            .map_err(|e| ParseFailure {
                message: format!("failed to start parser thread: {e}"),
            })?;
        handle.join().unwrap_or_else(|payload| panic::resume_unwind(payload))
    })
}

#[derive(Default)]
struct FactCollector {
    facts: SourceFacts,
    depth: usize,
    /// Byte offset of the first node past [`MAX_NESTING_DEPTH`].
    too_deep: Option<usize>,
}

impl FactCollector {
    fn walk(body: &[ast::Stmt]) -> Self {
        let mut collector = Self::default();
        collector.visit_body(body);
        collector
    }

    /// Descends one level, or records the node and refuses once the limit is hit.
    fn enter(&mut self, node: &impl Ranged) -> bool {
        if self.depth >= MAX_NESTING_DEPTH {
            self.too_deep.get_or_insert(usize::from(node.start()));
            return false;
        }
        self.depth += 1;
        true
    }

    fn name(&mut self, name: &ast::Identifier) {
        self.facts.identifiers.insert(name.as_str().to_owned());
    }

    fn opt_name(&mut self, name: &Option<ast::Identifier>) {
        if let Some(name) = name {
            self.name(name);
        }
    }

    fn visit_body(&mut self, body: &[ast::Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_exprs(&mut self, exprs: &[ast::Expr]) {
        for expr in exprs {
            self.visit_expr(expr);
        }
    }

    fn visit_opt_expr(&mut self, expr: &Option<Box<ast::Expr>>) {
        if let Some(expr) = expr {
            self.visit_expr(expr);
        }
    }

    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        if self.enter(stmt) {
            self.walk_stmt(stmt);
            self.depth -= 1;
        }
    }

    fn walk_stmt(&mut self, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::FunctionDef(def) => {
                self.facts.defined_functions.insert(def.name.as_str().to_owned());
                self.name(&def.name);
                self.visit_exprs(&def.decorator_list);
                self.visit_type_params(&def.type_params);
                self.visit_arguments(&def.args);
                self.visit_opt_expr(&def.returns);
                self.visit_body(&def.body);
            }
            ast::Stmt::AsyncFunctionDef(def) => {
                self.facts.defined_functions.insert(def.name.as_str().to_owned());
                self.name(&def.name);
                self.visit_exprs(&def.decorator_list);
                self.visit_type_params(&def.type_params);
                self.visit_arguments(&def.args);
                self.visit_opt_expr(&def.returns);
                self.visit_body(&def.body);
            }
            ast::Stmt::ClassDef(def) => {
                self.name(&def.name);
                self.visit_exprs(&def.decorator_list);
                self.visit_type_params(&def.type_params);
                self.visit_exprs(&def.bases);
                self.visit_keywords(&def.keywords);
                self.visit_body(&def.body);
            }
            ast::Stmt::Return(s) => self.visit_opt_expr(&s.value),
            ast::Stmt::Delete(s) => self.visit_exprs(&s.targets),
            ast::Stmt::Assign(s) => {
                self.visit_exprs(&s.targets);
                self.visit_expr(&s.value);
            }
            ast::Stmt::TypeAlias(s) => {
                self.visit_expr(&s.name);
                self.visit_type_params(&s.type_params);
                self.visit_expr(&s.value);
            }
            ast::Stmt::AugAssign(s) => {
                self.visit_expr(&s.target);
                self.visit_expr(&s.value);
            }
            ast::Stmt::AnnAssign(s) => {
                self.visit_expr(&s.target);
                self.visit_expr(&s.annotation);
                self.visit_opt_expr(&s.value);
            }
            ast::Stmt::For(s) => {
                self.visit_expr(&s.target);
                self.visit_expr(&s.iter);
                self.visit_body(&s.body);
                self.visit_body(&s.orelse);
            }
            ast::Stmt::AsyncFor(s) => {
                self.visit_expr(&s.target);
                self.visit_expr(&s.iter);
                self.visit_body(&s.body);
                self.visit_body(&s.orelse);
            }
            ast::Stmt::While(s) => {
                self.visit_expr(&s.test);
                self.visit_body(&s.body);
                self.visit_body(&s.orelse);
            }
            ast::Stmt::If(s) => {
                self.visit_expr(&s.test);
                self.visit_body(&s.body);
                self.visit_body(&s.orelse);
            }
            ast::Stmt::With(s) => {
                self.visit_with_items(&s.items);
                self.visit_body(&s.body);
            }
            ast::Stmt::AsyncWith(s) => {
                self.visit_with_items(&s.items);
                self.visit_body(&s.body);
            }
            ast::Stmt::Match(s) => {
                self.visit_expr(&s.subject);
                for case in &s.cases {
                    self.visit_pattern(&case.pattern);
                    self.visit_opt_expr(&case.guard);
                    self.visit_body(&case.body);
                }
            }
            ast::Stmt::Raise(s) => {
                self.visit_opt_expr(&s.exc);
                self.visit_opt_expr(&s.cause);
            }
            ast::Stmt::Try(s) => {
                self.visit_body(&s.body);
                self.visit_handlers(&s.handlers);
                self.visit_body(&s.orelse);
                self.visit_body(&s.finalbody);
            }
            ast::Stmt::TryStar(s) => {
                self.visit_body(&s.body);
                self.visit_handlers(&s.handlers);
                self.visit_body(&s.orelse);
                self.visit_body(&s.finalbody);
            }
            ast::Stmt::Assert(s) => {
                self.visit_expr(&s.test);
                self.visit_opt_expr(&s.msg);
            }
            ast::Stmt::Import(s) => self.visit_aliases(&s.names),
            ast::Stmt::ImportFrom(s) => self.visit_aliases(&s.names),
            ast::Stmt::Global(s) => {
                for name in &s.names {
                    self.name(name);
                }
            }
            ast::Stmt::Nonlocal(s) => {
                for name in &s.names {
                    self.name(name);
                }
            }
            ast::Stmt::Expr(s) => self.visit_expr(&s.value),
            ast::Stmt::Pass(_) | ast::Stmt::Break(_) | ast::Stmt::Continue(_) => {}
        }
    }

    fn visit_expr(&mut self, expr: &ast::Expr) {
        if self.enter(expr) {
            self.walk_expr(expr);
            self.depth -= 1;
        }
    }

    fn walk_expr(&mut self, expr: &ast::Expr) {
        match expr {
            ast::Expr::BoolOp(e) => self.visit_exprs(&e.values),
            ast::Expr::NamedExpr(e) => {
                self.visit_expr(&e.target);
                self.visit_expr(&e.value);
            }
            ast::Expr::BinOp(e) => {
                self.visit_expr(&e.left);
                self.visit_expr(&e.right);
            }
            ast::Expr::UnaryOp(e) => self.visit_expr(&e.operand),
            ast::Expr::Lambda(e) => {
                self.visit_arguments(&e.args);
                self.visit_expr(&e.body);
            }
            ast::Expr::IfExp(e) => {
                self.visit_expr(&e.test);
                self.visit_expr(&e.body);
                self.visit_expr(&e.orelse);
            }
            ast::Expr::Dict(e) => {
                for key in e.keys.iter().flatten() {
                    self.visit_expr(key);
                }
                self.visit_exprs(&e.values);
            }
            ast::Expr::Set(e) => self.visit_exprs(&e.elts),
            ast::Expr::ListComp(e) => {
                self.visit_expr(&e.elt);
                self.visit_comprehensions(&e.generators);
            }
            ast::Expr::SetComp(e) => {
                self.visit_expr(&e.elt);
                self.visit_comprehensions(&e.generators);
            }
            ast::Expr::DictComp(e) => {
                self.visit_expr(&e.key);
                self.visit_expr(&e.value);
                self.visit_comprehensions(&e.generators);
            }
            ast::Expr::GeneratorExp(e) => {
                self.visit_expr(&e.elt);
                self.visit_comprehensions(&e.generators);
            }
            ast::Expr::Await(e) => self.visit_expr(&e.value),
            ast::Expr::Yield(e) => self.visit_opt_expr(&e.value),
            ast::Expr::YieldFrom(e) => self.visit_expr(&e.value),
            ast::Expr::Compare(e) => {
                self.visit_expr(&e.left);
                self.visit_exprs(&e.comparators);
            }
            ast::Expr::Call(e) => {
                if let ast::Expr::Name(callee) = e.func.as_ref() {
                    self.facts.called_functions.insert(callee.id.as_str().to_owned());
                }
                self.visit_expr(&e.func);
                self.visit_exprs(&e.args);
                self.visit_keywords(&e.keywords);
            }
            ast::Expr::FormattedValue(e) => {
                self.visit_expr(&e.value);
                self.visit_opt_expr(&e.format_spec);
            }
            ast::Expr::JoinedStr(e) => self.visit_exprs(&e.values),
            ast::Expr::Constant(_) => {}
            ast::Expr::Attribute(e) => {
                self.visit_expr(&e.value);
                self.name(&e.attr);
            }
            ast::Expr::Subscript(e) => {
                self.visit_expr(&e.value);
                self.visit_expr(&e.slice);
            }
            ast::Expr::Starred(e) => self.visit_expr(&e.value),
            ast::Expr::Name(e) => self.name(&e.id),
            ast::Expr::List(e) => self.visit_exprs(&e.elts),
            ast::Expr::Tuple(e) => self.visit_exprs(&e.elts),
            ast::Expr::Slice(e) => {
                self.visit_opt_expr(&e.lower);
                self.visit_opt_expr(&e.upper);
                self.visit_opt_expr(&e.step);
            }
        }
    }

    fn visit_pattern(&mut self, pattern: &ast::Pattern) {
        if self.enter(pattern) {
            self.walk_pattern(pattern);
            self.depth -= 1;
        }
    }

    fn walk_pattern(&mut self, pattern: &ast::Pattern) {
        match pattern {
            ast::Pattern::MatchValue(p) => self.visit_expr(&p.value),
            ast::Pattern::MatchSingleton(_) => {}
            ast::Pattern::MatchSequence(p) => self.visit_patterns(&p.patterns),
            ast::Pattern::MatchMapping(p) => {
                self.visit_exprs(&p.keys);
                self.visit_patterns(&p.patterns);
                self.opt_name(&p.rest);
            }
            ast::Pattern::MatchClass(p) => {
                self.visit_expr(&p.cls);
                self.visit_patterns(&p.patterns);
                for attr in &p.kwd_attrs {
                    self.name(attr);
                }
                self.visit_patterns(&p.kwd_patterns);
            }
            ast::Pattern::MatchStar(p) => self.opt_name(&p.name),
            ast::Pattern::MatchAs(p) => {
                if let Some(inner) = &p.pattern {
                    self.visit_pattern(inner);
                }
                self.opt_name(&p.name);
            }
            ast::Pattern::MatchOr(p) => self.visit_patterns(&p.patterns),
        }
    }

    fn visit_patterns(&mut self, patterns: &[ast::Pattern]) {
        for pattern in patterns {
            self.visit_pattern(pattern);
        }
    }

    fn visit_arguments(&mut self, args: &ast::Arguments) {
        for arg in args
            .posonlyargs
            .iter()
            .chain(&args.args)
            .chain(&args.kwonlyargs)
        {
            self.visit_arg(&arg.def);
            self.visit_opt_expr(&arg.default);
        }
        if let Some(arg) = &args.vararg {
            self.visit_arg(arg);
        }
        if let Some(arg) = &args.kwarg {
            self.visit_arg(arg);
        }
    }

    fn visit_arg(&mut self, arg: &ast::Arg) {
        self.name(&arg.arg);
        self.visit_opt_expr(&arg.annotation);
    }

    fn visit_keywords(&mut self, keywords: &[ast::Keyword]) {
        for keyword in keywords {
            self.opt_name(&keyword.arg);
            self.visit_expr(&keyword.value);
        }
    }

    fn visit_comprehensions(&mut self, generators: &[ast::Comprehension]) {
        for generator in generators {
            self.visit_expr(&generator.target);
            self.visit_expr(&generator.iter);
            self.visit_exprs(&generator.ifs);
        }
    }

    fn visit_with_items(&mut self, items: &[ast::WithItem]) {
        for item in items {
            self.visit_expr(&item.context_expr);
            self.visit_opt_expr(&item.optional_vars);
        }
    }

    fn visit_handlers(&mut self, handlers: &[ast::ExceptHandler]) {
        for handler in handlers {
            let ast::ExceptHandler::ExceptHandler(handler) = handler;
            self.visit_opt_expr(&handler.type_);
            self.opt_name(&handler.name);
            self.visit_body(&handler.body);
        }
    }

    /// `import a.b` binds `a`; `import a as b` and `from m import a as b` bind `b`.
    fn visit_aliases(&mut self, aliases: &[ast::Alias]) {
        for alias in aliases {
            match &alias.asname {
                Some(asname) => self.name(asname),
                None => {
                    let bound = alias.name.as_str().split('.').next().unwrap_or_default();
                    self.facts.identifiers.insert(bound.to_owned());
                }
            }
        }
    }

    fn visit_type_params(&mut self, params: &[ast::TypeParam]) {
        for param in params {
            match param {
                ast::TypeParam::TypeVar(p) => {
                    self.name(&p.name);
                    self.visit_opt_expr(&p.bound);
                }
                ast::TypeParam::ParamSpec(p) => self.name(&p.name),
                ast::TypeParam::TypeVarTuple(p) => self.name(&p.name),
            }
        }
    }
}
