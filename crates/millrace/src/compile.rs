//! Compilation: transpile (scripts), parse, analyze, and annotate.
//!
//! The compiler's analyses drive the runtime's scheduling discipline:
//!
//! - the sequence pass ([`crate::sequence`]) validates `!` sites and fixes
//!   their lock keys;
//! - the write-set analysis below tells the evaluator which names each
//!   statement assigns in its enclosing frame, so the statement sweep can
//!   pre-bind a fresh slot per written name (downstream reads wait on the
//!   slot instead of on the whole statement);
//! - concurrent loops are checked not to assign outer variables, which would
//!   make iteration interleaving observable;
//! - filters registered as asynchronous are marked so dispatch pauses to the
//!   host.

use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

use crate::{
    ast::{AssignSource, Expr, ExprLoc, LookupKey, NodeList, PathSeg, Root, Stmt},
    error::Exception,
    parser, script, sequence,
};

/// Environment facts the compiler needs.
#[derive(Debug, Default)]
pub(crate) struct CompileEnv {
    /// Filters registered with the asynchronous shape.
    pub async_filters: AHashSet<String>,
    /// Extension tag names and whether they take a body.
    pub custom_tags: AHashMap<String, bool>,
}

/// A parsed, analyzed template ready to render.
#[derive(Debug)]
pub(crate) struct CompiledTemplate {
    pub root: Root,
    pub name: Option<String>,
    /// Transpiled from the script surface; switches the text handler's
    /// coercion rules.
    pub script_mode: bool,
}

/// Compiles template source.
pub(crate) fn compile(
    source: &str,
    name: Option<&str>,
    env: &CompileEnv,
) -> Result<Rc<CompiledTemplate>, Exception> {
    compile_inner(source, name, false, env)
}

/// Transpiles script source, then compiles the resulting template.
pub(crate) fn compile_script(
    source: &str,
    name: Option<&str>,
    env: &CompileEnv,
) -> Result<Rc<CompiledTemplate>, Exception> {
    compile_inner(source, name, true, env)
}

fn compile_inner(
    source: &str,
    name: Option<&str>,
    script_mode: bool,
    env: &CompileEnv,
) -> Result<Rc<CompiledTemplate>, Exception> {
    let decorate = |err: Exception| match name {
        Some(n) => err.in_template(n),
        None => err,
    };
    let template_src;
    let source = if script_mode {
        template_src = script::transpile(source).map_err(decorate)?;
        template_src.as_str()
    } else {
        source
    };
    let mut root = parser::parse(source, &env.custom_tags).map_err(decorate)?;
    sequence::analyze(&mut root, source).map_err(decorate)?;
    mark_async_filters(&mut root.body, &env.async_filters);
    validate_concurrent_loops(&root.body).map_err(decorate)?;
    Ok(Rc::new(CompiledTemplate {
        root,
        name: name.map(str::to_owned),
        script_mode,
    }))
}

/// Names a statement assigns in its *enclosing* frame. Transparent bodies
/// (`if`, `switch`, `guard`) pass writes through; loop bodies contribute
/// only writes that escape the loop's own scope; isolating bodies (macros,
/// blocks, captures, call/filter blocks) contribute nothing.
pub(crate) fn phi_writes(stmt: &Stmt) -> Vec<String> {
    let mut out = Vec::new();
    collect_phi(stmt, &mut out);
    dedup_preserving(out)
}

fn collect_phi(stmt: &Stmt, out: &mut Vec<String>) {
    match stmt {
        Stmt::Assign { targets, .. } => out.extend(targets.iter().cloned()),
        Stmt::SetPath { root, .. } => out.push(root.clone()),
        Stmt::Macro { name, .. } => out.push(name.clone()),
        Stmt::Import { target, .. } => out.push(target.clone()),
        Stmt::FromImport { names, .. } => {
            out.extend(names.iter().map(|(n, alias)| alias.clone().unwrap_or_else(|| n.clone())));
        }
        Stmt::If { then, otherwise, .. } => {
            for node in then {
                collect_phi(&node.stmt, out);
            }
            if let Some(arm) = otherwise {
                for node in arm {
                    collect_phi(&node.stmt, out);
                }
            }
        }
        Stmt::Switch { cases, default, .. } => {
            for (_, body) in cases {
                for node in body {
                    collect_phi(&node.stmt, out);
                }
            }
            if let Some(arm) = default {
                for node in arm {
                    collect_phi(&node.stmt, out);
                }
            }
        }
        Stmt::Guard { body, recover } => {
            for node in body.iter().chain(recover) {
                collect_phi(&node.stmt, out);
            }
        }
        Stmt::For { mode, targets, body, otherwise, .. } => {
            if *mode == crate::ast::LoopMode::Sequential {
                let mut declared: AHashSet<String> = targets.iter().cloned().collect();
                declared.insert("loop".to_owned());
                out.extend(escaping_writes(body, &mut declared));
                if let Some(arm) = otherwise {
                    for node in arm {
                        collect_phi(&node.stmt, out);
                    }
                }
            }
            // concurrent loops are validated to have no escaping writes
        }
        Stmt::While { body, .. } => {
            let mut declared = AHashSet::new();
            out.extend(escaping_writes(body, &mut declared));
        }
        Stmt::CallExtension { body: Some(body), .. } => {
            for node in body {
                collect_phi(&node.stmt, out);
            }
        }
        _ => {}
    }
}

/// Writes within `nodes` that target a frame *outside* the scope that owns
/// `nodes`. `declared` seeds the scope's own names (loop targets etc.) and
/// accumulates declarations made along the way.
pub(crate) fn escaping_writes(nodes: &NodeList, declared: &mut AHashSet<String>) -> Vec<String> {
    let mut out = Vec::new();
    for node in nodes {
        for name in phi_writes(&node.stmt) {
            if !declared.contains(&name) {
                out.push(name);
            }
        }
        // `var` declarations (and transparent declarations below them) stop
        // later `set`s on the same name from escaping
        for name in declared_names(&node.stmt) {
            declared.insert(name);
        }
    }
    dedup_preserving(out)
}

/// Names a statement *declares* at its own frame level.
fn declared_names(stmt: &Stmt) -> Vec<String> {
    let mut out = Vec::new();
    match stmt {
        Stmt::Assign { declare: true, targets, .. } => out.extend(targets.iter().cloned()),
        Stmt::Macro { name, .. } => out.push(name.clone()),
        Stmt::Import { target, .. } => out.push(target.clone()),
        Stmt::FromImport { names, .. } => {
            out.extend(names.iter().map(|(n, alias)| alias.clone().unwrap_or_else(|| n.clone())));
        }
        Stmt::If { then, otherwise, .. } => {
            for node in then {
                out.extend(declared_names(&node.stmt));
            }
            if let Some(arm) = otherwise {
                for node in arm {
                    out.extend(declared_names(&node.stmt));
                }
            }
        }
        Stmt::Switch { cases, default, .. } => {
            for (_, body) in cases {
                for node in body {
                    out.extend(declared_names(&node.stmt));
                }
            }
            if let Some(arm) = default {
                for node in arm {
                    out.extend(declared_names(&node.stmt));
                }
            }
        }
        Stmt::Guard { body, recover } => {
            for node in body.iter().chain(recover) {
                out.extend(declared_names(&node.stmt));
            }
        }
        _ => {}
    }
    out
}

fn dedup_preserving(names: Vec<String>) -> Vec<String> {
    let mut seen = AHashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

/// Concurrent loop bodies may not assign variables of enclosing frames:
/// iterations run in parallel, so such writes would have no defined order.
fn validate_concurrent_loops(nodes: &NodeList) -> Result<(), Exception> {
    for node in nodes {
        match &node.stmt {
            Stmt::For { mode, targets, body, otherwise, .. } => {
                if *mode == crate::ast::LoopMode::Concurrent {
                    let mut declared: AHashSet<String> = targets.iter().cloned().collect();
                    declared.insert("loop".to_owned());
                    let escaping = escaping_writes(body, &mut declared);
                    if let Some(name) = escaping.first() {
                        return Err(Exception::syntax(
                            format!("cannot assign outer variable `{name}` from a concurrent loop body"),
                            node.loc.line,
                            node.loc.column,
                        ));
                    }
                }
                validate_concurrent_loops(body)?;
                if let Some(arm) = otherwise {
                    validate_concurrent_loops(arm)?;
                }
            }
            Stmt::If { then, otherwise, .. } => {
                validate_concurrent_loops(then)?;
                if let Some(arm) = otherwise {
                    validate_concurrent_loops(arm)?;
                }
            }
            Stmt::While { body, .. }
            | Stmt::Block { body, .. }
            | Stmt::Macro { body, .. }
            | Stmt::CallBlock { body, .. }
            | Stmt::FilterBlock { body, .. } => validate_concurrent_loops(body)?,
            Stmt::Switch { cases, default, .. } => {
                for (_, body) in cases {
                    validate_concurrent_loops(body)?;
                }
                if let Some(arm) = default {
                    validate_concurrent_loops(arm)?;
                }
            }
            Stmt::Guard { body, recover } => {
                validate_concurrent_loops(body)?;
                validate_concurrent_loops(recover)?;
            }
            Stmt::Assign { value: AssignSource::Capture { body, .. }, .. } => validate_concurrent_loops(body)?,
            Stmt::CallExtension { body: Some(body), .. } => validate_concurrent_loops(body)?,
            _ => {}
        }
    }
    Ok(())
}

/// Rewrites `Filter` nodes whose name the environment registered as
/// asynchronous.
fn mark_async_filters(nodes: &mut NodeList, async_filters: &AHashSet<String>) {
    for node in nodes {
        visit_stmt_exprs(&mut node.stmt, &mut |expr| {
            if let Expr::Filter { name, is_async, .. } = expr
                && async_filters.contains(name.as_str())
            {
                *is_async = true;
            }
        });
    }
}

/// Calls `f` on every expression node in a statement subtree.
fn visit_stmt_exprs(stmt: &mut Stmt, f: &mut impl FnMut(&mut Expr)) {
    match stmt {
        Stmt::Output(e) | Stmt::Do(e) | Stmt::Extends(e) => visit_expr(e, f),
        Stmt::If { cond, then, otherwise } => {
            visit_expr(cond, f);
            for node in then {
                visit_stmt_exprs(&mut node.stmt, f);
            }
            if let Some(arm) = otherwise {
                for node in arm {
                    visit_stmt_exprs(&mut node.stmt, f);
                }
            }
        }
        Stmt::For { iter, body, otherwise, .. } => {
            visit_expr(iter, f);
            for node in body {
                visit_stmt_exprs(&mut node.stmt, f);
            }
            if let Some(arm) = otherwise {
                for node in arm {
                    visit_stmt_exprs(&mut node.stmt, f);
                }
            }
        }
        Stmt::While { cond, body } => {
            visit_expr(cond, f);
            for node in body {
                visit_stmt_exprs(&mut node.stmt, f);
            }
        }
        Stmt::Switch { subject, cases, default } => {
            visit_expr(subject, f);
            for (exprs, body) in cases {
                for e in exprs {
                    visit_expr(e, f);
                }
                for node in body {
                    visit_stmt_exprs(&mut node.stmt, f);
                }
            }
            if let Some(arm) = default {
                for node in arm {
                    visit_stmt_exprs(&mut node.stmt, f);
                }
            }
        }
        Stmt::Macro { params, body, .. } => {
            for (_, default) in params {
                if let Some(e) = default {
                    visit_expr(e, f);
                }
            }
            for node in body {
                visit_stmt_exprs(&mut node.stmt, f);
            }
        }
        Stmt::CallBlock { call, body } => {
            visit_expr(call, f);
            for node in body {
                visit_stmt_exprs(&mut node.stmt, f);
            }
        }
        Stmt::FilterBlock { args, body, .. } => {
            for e in args {
                visit_expr(e, f);
            }
            for node in body {
                visit_stmt_exprs(&mut node.stmt, f);
            }
        }
        Stmt::Block { body, .. } => {
            for node in body {
                visit_stmt_exprs(&mut node.stmt, f);
            }
        }
        Stmt::Guard { body, recover } => {
            for node in body.iter_mut().chain(recover.iter_mut()) {
                visit_stmt_exprs(&mut node.stmt, f);
            }
        }
        Stmt::Include { template, .. } => visit_expr(template, f),
        Stmt::Import { template, .. } | Stmt::FromImport { template, .. } => visit_expr(template, f),
        Stmt::Assign { value, .. } => match value {
            AssignSource::Expr(e) => visit_expr(e, f),
            AssignSource::Capture { body, .. } => {
                for node in body {
                    visit_stmt_exprs(&mut node.stmt, f);
                }
            }
        },
        Stmt::SetPath { path, value, .. } => {
            for seg in path {
                if let PathSeg::Expr(e) = seg {
                    visit_expr(e, f);
                }
            }
            visit_expr(value, f);
        }
        Stmt::OutputCommand { path, args, .. } => {
            for seg in path {
                if let PathSeg::Expr(e) = seg {
                    visit_expr(e, f);
                }
            }
            for e in args {
                visit_expr(e, f);
            }
        }
        Stmt::CallExtension { args, body, .. } => {
            for e in args {
                visit_expr(e, f);
            }
            if let Some(body) = body {
                for node in body {
                    visit_stmt_exprs(&mut node.stmt, f);
                }
            }
        }
        Stmt::TemplateData(_) | Stmt::Extern { .. } | Stmt::Option { .. } => {}
    }
}

fn visit_expr(expr: &mut ExprLoc, f: &mut dyn FnMut(&mut Expr)) {
    f(&mut expr.expr);
    match &mut expr.expr {
        Expr::LookupVal { target, key } => {
            visit_expr(target, f);
            if let LookupKey::Index(index) = key {
                visit_expr(index, f);
            }
        }
        Expr::SeqMarker(inner) => visit_expr(inner, f),
        Expr::FunCall { callee, args, kwargs, .. } => {
            visit_expr(callee, f);
            for a in args {
                visit_expr(a, f);
            }
            for (_, v) in kwargs {
                visit_expr(v, f);
            }
        }
        Expr::Filter { value, args, kwargs, .. } => {
            visit_expr(value, f);
            for a in args {
                visit_expr(a, f);
            }
            for (_, v) in kwargs {
                visit_expr(v, f);
            }
        }
        Expr::InlineIf { then, cond, otherwise } => {
            visit_expr(then, f);
            visit_expr(cond, f);
            if let Some(arm) = otherwise {
                visit_expr(arm, f);
            }
        }
        Expr::UnaryOp { operand, .. } => visit_expr(operand, f),
        Expr::BinOp { lhs, rhs, .. } => {
            visit_expr(lhs, f);
            visit_expr(rhs, f);
        }
        Expr::Compare { first, rest } => {
            visit_expr(first, f);
            for (_, operand) in rest {
                visit_expr(operand, f);
            }
        }
        Expr::Is { value, args, .. } => {
            visit_expr(value, f);
            for a in args {
                visit_expr(a, f);
            }
        }
        Expr::Group(items) | Expr::Array(items) => {
            for item in items {
                visit_expr(item, f);
            }
        }
        Expr::Dict(pairs) => {
            for (k, v) in pairs {
                visit_expr(k, f);
                visit_expr(v, f);
            }
        }
        Expr::Spread(inner) | Expr::KeywordSpread(inner) => visit_expr(inner, f),
        Expr::Literal(_) | Expr::Symbol(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(src: &str) -> Rc<CompiledTemplate> {
        compile(src, Some("t.njk"), &CompileEnv::default()).unwrap()
    }

    #[test]
    fn phi_writes_cross_transparent_bodies() {
        let tpl = compiled("{% if c %}{% set x = 1 %}{% var y = 2 %}{% endif %}");
        let writes = phi_writes(&tpl.root.body[0].stmt);
        assert_eq!(writes, ["x", "y"]);
    }

    #[test]
    fn loop_local_declarations_do_not_escape() {
        let tpl = compiled("{% for i in xs %}{% var t = i %}{% set t = t %}{% set total = i %}{% endfor %}");
        let writes = phi_writes(&tpl.root.body[0].stmt);
        assert_eq!(writes, ["total"]);
    }

    #[test]
    fn concurrent_loops_reject_outer_writes() {
        let err = compile(
            "{% var total = 0 %}{% each i in xs %}{% set total = i %}{% endeach %}",
            None,
            &CompileEnv::default(),
        )
        .unwrap_err();
        assert!(err.message.contains("total"), "{}", err.message);
    }

    #[test]
    fn async_filters_are_marked() {
        let mut env = CompileEnv::default();
        env.async_filters.insert("fetchy".to_owned());
        let tpl = compile("{{ x | fetchy | upper }}", None, &env).unwrap();
        let Stmt::Output(expr) = &tpl.root.body[0].stmt else { panic!("expected output") };
        let Expr::Filter { name, is_async, value, .. } = &expr.expr else { panic!("expected filter") };
        assert_eq!(name, "upper");
        assert!(!is_async);
        let Expr::Filter { name, is_async, .. } = &value.expr else { panic!("expected inner filter") };
        assert_eq!(name, "fetchy");
        assert!(is_async);
    }

    #[test]
    fn script_compilation_reports_script_mode() {
        let tpl = compile_script(":data\n@data.x = 1", Some("job.csc"), &CompileEnv::default()).unwrap();
        assert!(tpl.script_mode);
        assert_eq!(tpl.name.as_deref(), Some("job.csc"));
    }

    #[test]
    fn compile_errors_carry_template_name() {
        let err = compile("{% if x %}", Some("broken.njk"), &CompileEnv::default()).unwrap_err();
        assert_eq!(err.template.as_deref(), Some("broken.njk"));
    }
}
