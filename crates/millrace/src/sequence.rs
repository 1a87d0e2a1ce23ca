//! Sequence-marker (`!`) analysis.
//!
//! Validates every marker site at compile time and computes its normalized
//! lock key. Two marker forms exist, in distinct key spaces:
//!
//! - object-path sequencing `r.a.b!.m(...)` — key `"r.a.b"`; serializes any
//!   call whose resolution passes through that path prefix.
//! - method-specific sequencing `r.a.m!(...)` — key `"r.a::m"`; serializes
//!   only that method on that path.
//!
//! The root of a sequenced path must be a *context variable*: a name the
//! caller supplies at render time (or one declared `extern`). Names bound by
//! the template itself — `set`/`var` targets, loop variables, macro
//! parameters, imports — cannot anchor a sequence, and a template binding
//! that shadows a context variable disqualifies the name entirely.

use ahash::AHashSet;

use crate::{
    ast::{AssignSource, Expr, ExprLoc, LookupKey, NodeList, PathSeg, Root, Stmt},
    error::{CodeLoc, Exception},
};

/// Validates all `!` sites in the template and fills in each guarded call's
/// lock key. `source` is the (possibly transpiled) template text used to
/// quote offending lines in error messages.
pub(crate) fn analyze(root: &mut Root, source: &str) -> Result<(), Exception> {
    let mut scopes = ScopeStack::default();
    collect_bindings(&root.body, &mut scopes);
    let mut pass = Analyzer { scopes, source, in_macro: false };
    pass.visit_nodes(&mut root.body)
}

/// Template-bound names, pre-collected over the whole template so shadowing
/// anywhere in a scope disqualifies the name.
#[derive(Debug, Default)]
struct ScopeStack {
    bound: AHashSet<String>,
}

impl ScopeStack {
    /// Whether `name` may anchor a sequence. Context variables are names the
    /// template never binds; `extern` declarations document intent but any
    /// unbound name qualifies, since the caller's context is unknown at
    /// compile time.
    fn is_context_root(&self, name: &str) -> bool {
        !self.bound.contains(name)
    }
}

/// Records every name the template binds anywhere, plus extern declarations.
fn collect_bindings(nodes: &NodeList, scopes: &mut ScopeStack) {
    for node in nodes {
        match &node.stmt {
            Stmt::Assign { targets, value, .. } => {
                scopes.bound.extend(targets.iter().cloned());
                if let AssignSource::Capture { body, .. } = value {
                    collect_bindings(body, scopes);
                }
            }
            Stmt::SetPath { root, .. } => {
                scopes.bound.insert(root.clone());
            }
            Stmt::For { targets, body, otherwise, .. } => {
                scopes.bound.extend(targets.iter().cloned());
                scopes.bound.insert("loop".to_owned());
                collect_bindings(body, scopes);
                if let Some(arm) = otherwise {
                    collect_bindings(arm, scopes);
                }
            }
            Stmt::While { body, .. } => collect_bindings(body, scopes),
            Stmt::If { then, otherwise, .. } => {
                collect_bindings(then, scopes);
                if let Some(arm) = otherwise {
                    collect_bindings(arm, scopes);
                }
            }
            Stmt::Switch { cases, default, .. } => {
                for (_, body) in cases {
                    collect_bindings(body, scopes);
                }
                if let Some(arm) = default {
                    collect_bindings(arm, scopes);
                }
            }
            Stmt::Macro { name, params, body } => {
                scopes.bound.insert(name.clone());
                scopes.bound.extend(params.iter().map(|(p, _)| p.clone()));
                collect_bindings(body, scopes);
            }
            Stmt::CallBlock { body, .. }
            | Stmt::FilterBlock { body, .. }
            | Stmt::Block { body, .. }
            | Stmt::Guard { body, .. } => collect_bindings(body, scopes),
            Stmt::Import { target, .. } => {
                scopes.bound.insert(target.clone());
            }
            Stmt::FromImport { names, .. } => {
                for (name, alias) in names {
                    scopes.bound.insert(alias.clone().unwrap_or_else(|| name.clone()));
                }
            }
            Stmt::Extern { .. } => {}
            Stmt::CallExtension { body: Some(body), .. } => collect_bindings(body, scopes),
            _ => {}
        }
        if let Stmt::Guard { recover, .. } = &node.stmt {
            collect_bindings(recover, scopes);
        }
    }
}

struct Analyzer<'a> {
    scopes: ScopeStack,
    source: &'a str,
    in_macro: bool,
}

impl Analyzer<'_> {
    fn err(&self, message: String, loc: CodeLoc) -> Exception {
        let line_text = self
            .source
            .lines()
            .nth(loc.line.saturating_sub(1) as usize)
            .map(str::trim)
            .unwrap_or("");
        let message = if line_text.is_empty() {
            message
        } else {
            format!("{message} in `{line_text}`")
        };
        Exception::sequence(message, loc.line, loc.column)
    }

    fn visit_nodes(&mut self, nodes: &mut NodeList) -> Result<(), Exception> {
        for node in nodes {
            self.visit_stmt(&mut node.stmt)?;
        }
        Ok(())
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) -> Result<(), Exception> {
        match stmt {
            Stmt::Output(expr) | Stmt::Do(expr) | Stmt::Extends(expr) => self.visit_expr(expr),
            Stmt::If { cond, then, otherwise } => {
                self.visit_expr(cond)?;
                self.visit_nodes(then)?;
                if let Some(arm) = otherwise {
                    self.visit_nodes(arm)?;
                }
                Ok(())
            }
            Stmt::For { iter, body, otherwise, .. } => {
                self.visit_expr(iter)?;
                self.visit_nodes(body)?;
                if let Some(arm) = otherwise {
                    self.visit_nodes(arm)?;
                }
                Ok(())
            }
            Stmt::While { cond, body } => {
                self.visit_expr(cond)?;
                self.visit_nodes(body)
            }
            Stmt::Switch { subject, cases, default } => {
                self.visit_expr(subject)?;
                for (exprs, body) in cases {
                    for expr in exprs {
                        self.visit_expr(expr)?;
                    }
                    self.visit_nodes(body)?;
                }
                if let Some(arm) = default {
                    self.visit_nodes(arm)?;
                }
                Ok(())
            }
            Stmt::Macro { body, params, .. } => {
                for (_, default) in params.iter_mut() {
                    if let Some(expr) = default {
                        self.visit_expr(expr)?;
                    }
                }
                let was = std::mem::replace(&mut self.in_macro, true);
                let result = self.visit_nodes(body);
                self.in_macro = was;
                result
            }
            Stmt::CallBlock { call, body } => {
                self.visit_expr(call)?;
                self.visit_nodes(body)
            }
            Stmt::FilterBlock { args, body, .. } => {
                for expr in args {
                    self.visit_expr(expr)?;
                }
                self.visit_nodes(body)
            }
            Stmt::Block { body, .. } => self.visit_nodes(body),
            Stmt::Guard { body, recover } => {
                self.visit_nodes(body)?;
                self.visit_nodes(recover)
            }
            Stmt::Include { template, .. } => self.visit_expr(template),
            Stmt::Import { template, .. } | Stmt::FromImport { template, .. } => self.visit_expr(template),
            Stmt::Assign { value, .. } => match value {
                AssignSource::Expr(expr) => self.visit_expr(expr),
                AssignSource::Capture { body, .. } => self.visit_nodes(body),
            },
            Stmt::SetPath { path, value, .. } => {
                for seg in path {
                    if let PathSeg::Expr(expr) = seg {
                        self.visit_expr(expr)?;
                    }
                }
                self.visit_expr(value)
            }
            Stmt::OutputCommand { path, args, .. } => {
                for seg in path.iter_mut() {
                    if let PathSeg::Expr(expr) = seg {
                        self.visit_expr(expr)?;
                    }
                }
                for expr in args {
                    self.visit_expr(expr)?;
                }
                Ok(())
            }
            Stmt::CallExtension { args, body, .. } => {
                for expr in args {
                    self.visit_expr(expr)?;
                }
                if let Some(body) = body {
                    self.visit_nodes(body)?;
                }
                Ok(())
            }
            Stmt::TemplateData(_) | Stmt::Extern { .. } | Stmt::Option { .. } => Ok(()),
        }
    }

    fn visit_expr(&mut self, expr: &mut ExprLoc) -> Result<(), Exception> {
        let loc = expr.loc;
        match &mut expr.expr {
            Expr::FunCall { callee, args, kwargs, seq_method, lock_key } => {
                let key = self.analyze_callee(callee, *seq_method, loc)?;
                *lock_key = key;
                self.visit_expr(callee)?;
                for arg in args {
                    self.visit_expr(arg)?;
                }
                for (_, value) in kwargs {
                    self.visit_expr(value)?;
                }
                Ok(())
            }
            Expr::SeqMarker(inner) => {
                // a marker that survives to here is not part of a call's
                // callee chain, so it guards a property read
                Err(self.err(format!("`!` on a property read is not allowed: `{}`", path_repr(inner)), loc))
            }
            Expr::LookupVal { target, key } => {
                self.visit_expr(target)?;
                if let LookupKey::Index(index) = key {
                    self.visit_expr(index)?;
                }
                Ok(())
            }
            Expr::Filter { value, args, kwargs, .. } => {
                self.visit_expr(value)?;
                for arg in args {
                    self.visit_expr(arg)?;
                }
                for (_, kw) in kwargs {
                    self.visit_expr(kw)?;
                }
                Ok(())
            }
            Expr::InlineIf { then, cond, otherwise } => {
                self.visit_expr(then)?;
                self.visit_expr(cond)?;
                if let Some(arm) = otherwise {
                    self.visit_expr(arm)?;
                }
                Ok(())
            }
            Expr::UnaryOp { operand, .. } => self.visit_expr(operand),
            Expr::BinOp { lhs, rhs, .. } => {
                self.visit_expr(lhs)?;
                self.visit_expr(rhs)
            }
            Expr::Compare { first, rest } => {
                self.visit_expr(first)?;
                for (_, operand) in rest {
                    self.visit_expr(operand)?;
                }
                Ok(())
            }
            Expr::Is { value, args, .. } => {
                self.visit_expr(value)?;
                for arg in args {
                    self.visit_expr(arg)?;
                }
                Ok(())
            }
            Expr::Group(items) | Expr::Array(items) => {
                for item in items {
                    self.visit_expr(item)?;
                }
                Ok(())
            }
            Expr::Dict(pairs) => {
                for (key, value) in pairs {
                    self.visit_expr(key)?;
                    self.visit_expr(value)?;
                }
                Ok(())
            }
            Expr::Spread(inner) | Expr::KeywordSpread(inner) => self.visit_expr(inner),
            Expr::Literal(_) | Expr::Symbol(_) => Ok(()),
        }
    }

    /// Validates the callee chain of a call and computes the lock key, if
    /// either marker form is present. Consumes `SeqMarker` wrappers by
    /// validating them in place; `visit_expr` later treats any survivor as a
    /// property-read violation.
    fn analyze_callee(&mut self, callee: &mut ExprLoc, seq_method: bool, loc: CodeLoc) -> Result<Option<String>, Exception> {
        // walk the chain collecting segments root-first
        let mut segments: Vec<String> = Vec::new();
        let mut marker_depth: Option<usize> = None; // segments remaining below the marker
        let mut marker_count = usize::from(seq_method);
        let mut cursor: &mut ExprLoc = callee;
        let mut dynamic_below_marker = false;
        let mut trailing: Vec<String> = Vec::new(); // segments above the marker, method last

        loop {
            if matches!(cursor.expr, Expr::SeqMarker(_)) {
                marker_count += 1;
                if marker_count > 1 {
                    return Err(self.err("multiple `!` markers in one path".to_owned(), loc));
                }
                marker_depth = Some(trailing.len());
                // unwrap the marker now that it is accounted for
                let Expr::SeqMarker(inner) =
                    std::mem::replace(&mut cursor.expr, Expr::Literal(crate::ast::Literal::Null))
                else {
                    unreachable!("matched SeqMarker above");
                };
                cursor.expr = inner.expr;
                continue;
            }
            match &mut cursor.expr {
                Expr::LookupVal { target, key } => {
                    match key {
                        LookupKey::Attr(name) => trailing.push(name.clone()),
                        LookupKey::Index(index) => {
                            if let Expr::Literal(crate::ast::Literal::Str(name)) = &index.expr {
                                trailing.push(name.clone());
                            } else {
                                dynamic_below_marker = true;
                                trailing.push(String::new());
                            }
                        }
                    }
                    cursor = target;
                }
                Expr::Symbol(name) => {
                    segments.push(name.clone());
                    break;
                }
                _ => {
                    if marker_count > 0 {
                        return Err(self.err("`!` requires a path rooted in a context variable".to_owned(), loc));
                    }
                    return Ok(None);
                }
            }
        }
        if marker_count == 0 {
            return Ok(None);
        }

        trailing.reverse();
        segments.extend(trailing);
        // segments: root..=method, root-first. marker_depth counts segments
        // recorded *after* (above) the marker during the walk.
        let root = segments.first().expect("chain has a root").clone();
        if self.in_macro {
            return Err(self.err(format!("`!` is not allowed inside macro bodies: `{}`", segments.join(".")), loc));
        }
        if !self.scopes.is_context_root(&root) {
            return Err(self.err(
                format!("`!` requires a context variable root, but `{root}` is bound by the template"),
                loc,
            ));
        }

        let key = if seq_method {
            // method-specific: everything below the method is the path
            let Some((method, path)) = segments.split_last() else {
                return Err(self.err("`!` requires an object path".to_owned(), loc));
            };
            if path.is_empty() {
                return Err(self.err("`!` requires an object path before the method".to_owned(), loc));
            }
            if path.iter().any(String::is_empty) || dynamic_below_marker {
                return Err(self.err("`!` paths must use static property names".to_owned(), loc));
            }
            format!("{}::{method}", path.join("."))
        } else {
            let below = segments.len() - marker_depth.expect("object-path marker recorded");
            let path = &segments[..below];
            if path.iter().any(String::is_empty) {
                return Err(self.err("`!` paths must use static property names".to_owned(), loc));
            }
            path.join(".")
        };
        Ok(Some(key))
    }
}

/// Best-effort textual form of a path expression for error messages.
fn path_repr(expr: &ExprLoc) -> String {
    match &expr.expr {
        Expr::Symbol(name) => name.clone(),
        Expr::LookupVal { target, key } => match key {
            LookupKey::Attr(name) => format!("{}.{name}", path_repr(target)),
            LookupKey::Index(_) => format!("{}[...]", path_repr(target)),
        },
        Expr::SeqMarker(inner) => format!("{}!", path_repr(inner)),
        _ => "<expression>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use ahash::AHashMap;

    fn analyze_src(src: &str) -> Result<Root, Exception> {
        let mut root = parse(src, &AHashMap::new())?;
        analyze(&mut root, src)?;
        Ok(root)
    }

    fn first_lock_key(root: &Root) -> Option<String> {
        fn from_expr(expr: &Expr) -> Option<String> {
            match expr {
                Expr::FunCall { lock_key, callee, args, .. } => lock_key.clone().or_else(|| {
                    from_expr(&callee.expr).or_else(|| args.iter().find_map(|a| from_expr(&a.expr)))
                }),
                Expr::BinOp { lhs, rhs, .. } => from_expr(&lhs.expr).or_else(|| from_expr(&rhs.expr)),
                Expr::LookupVal { target, .. } => from_expr(&target.expr),
                _ => None,
            }
        }
        root.body.iter().find_map(|n| match &n.stmt {
            Stmt::Output(e) | Stmt::Do(e) => from_expr(&e.expr),
            _ => None,
        })
    }

    #[test]
    fn object_path_key_stops_at_marker() {
        let root = analyze_src("{{ s.a.b!.op(1) }}").unwrap();
        assert_eq!(first_lock_key(&root).as_deref(), Some("s.a.b"));
    }

    #[test]
    fn root_marker_key_is_the_root() {
        let root = analyze_src("{{ s!.op(1) }}").unwrap();
        assert_eq!(first_lock_key(&root).as_deref(), Some("s"));
    }

    #[test]
    fn method_key_uses_distinct_space() {
        let root = analyze_src("{{ s.a.op!(1) }}").unwrap();
        assert_eq!(first_lock_key(&root).as_deref(), Some("s.a::op"));
    }

    #[test]
    fn marker_on_property_read_is_rejected() {
        let err = analyze_src("{{ s!.value }}").unwrap_err();
        assert!(err.message.contains("property read"), "{}", err.message);
    }

    #[test]
    fn double_marker_is_rejected() {
        let err = analyze_src("{{ s!.a!.op(1) }}").unwrap_err();
        assert!(err.message.contains("multiple"), "{}", err.message);
    }

    #[test]
    fn dynamic_segment_is_rejected() {
        let err = analyze_src("{{ s[key].op!(1) }}").unwrap_err();
        assert!(err.message.contains("static"), "{}", err.message);
    }

    #[test]
    fn template_bound_roots_are_rejected() {
        let err = analyze_src("{% set s = 1 %}{{ s!.op(1) }}").unwrap_err();
        assert!(err.message.contains("bound by the template"), "{}", err.message);

        let err = analyze_src("{% for s in items %}{{ s!.op(1) }}{% endfor %}").unwrap_err();
        assert!(err.message.contains("bound by the template"), "{}", err.message);
    }

    #[test]
    fn extern_allows_sequencing_unless_shadowed() {
        assert!(analyze_src("{% extern svc %}{{ svc!.op(1) }}").is_ok());
        let err = analyze_src("{% extern svc %}{% set svc = 1 %}{{ svc!.op(1) }}").unwrap_err();
        assert!(err.message.contains("bound by the template"));
    }

    #[test]
    fn markers_in_macros_are_rejected() {
        let err = analyze_src("{% macro m() %}{{ s!.op(1) }}{% endmacro %}").unwrap_err();
        assert!(err.message.contains("macro"), "{}", err.message);
    }

    #[test]
    fn bare_function_method_marker_is_rejected() {
        let err = analyze_src("{{ f!(1) }}").unwrap_err();
        assert!(err.message.contains("object path"), "{}", err.message);
    }

    #[test]
    fn error_quotes_the_offending_line() {
        let err = analyze_src("{{ s!.value }}").unwrap_err();
        assert!(err.message.contains("{{ s!.value }}"), "{}", err.message);
    }
}
