//! The asynchronous evaluator.
//!
//! Evaluation has two phases per statement list. The *sweep* is synchronous:
//! it walks statements in lexical order, journals output positions, creates
//! value slots, rebinds frames, and spawns one task per effectful statement.
//! The *drive* then polls every spawned task, in spawn order, to completion.
//!
//! Because the sweep runs in lexical order and tasks get their first poll in
//! spawn order, the first-poll traversal of the whole template is a
//! depth-first lexical walk. Sequence locks are acquired on first poll,
//! before argument evaluation, which is what makes lock acquisition order
//! equal source order. Output order is independent of completion order
//! because journal positions are claimed during the sweep.

use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use ahash::AHashMap;
use async_recursion::async_recursion;

use crate::{
    ast::{
        AssignSource, BinOpKind, CmpOp, Expr, ExprLoc, Literal, LookupKey, LoopMode, MacroDef, NodeList, PathSeg,
        Stmt, StmtLoc, UnaryOpKind,
    },
    compile::{CompiledTemplate, compile, phi_writes},
    environment::RenderEnv,
    error::{CodeLoc, Exception, Poison, RunResult},
    filters,
    frame::{FrameHandle, context_bindings},
    handlers::{
        HandlerInstance, HandlerInstances, OutSink, Output, PathPart, ResolvedSeg, SegPath, apply_command,
        flush_scope,
    },
    resource::ResourceTracker,
    schedule::{CallKind, Schedule, Slot},
    tracer::{RenderTracer, TraceEvent},
    value::{FuncValue, MacroValue, Value, ValueMap},
};

pub(crate) type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Polls every task until all are complete. First polls happen in
/// submission order, which the scheduling discipline relies on.
struct DriveAll<'a> {
    tasks: Vec<Option<LocalBoxFuture<'a, ()>>>,
}

impl<'a> DriveAll<'a> {
    fn new(tasks: Vec<LocalBoxFuture<'a, ()>>) -> Self {
        Self { tasks: tasks.into_iter().map(Some).collect() }
    }
}

impl Future for DriveAll<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut done = true;
        for slot in &mut self.tasks {
            if let Some(task) = slot {
                match task.as_mut().poll(cx) {
                    Poll::Ready(()) => *slot = None,
                    Poll::Pending => done = false,
                }
            }
        }
        if done { Poll::Ready(()) } else { Poll::Pending }
    }
}

/// Joins value futures, preserving result order. Used for parallel
/// sub-expression evaluation (call arguments, operands, array elements).
struct JoinValues<'a> {
    futs: Vec<Option<LocalBoxFuture<'a, RunResult<Value>>>>,
    out: Vec<Option<RunResult<Value>>>,
}

impl<'a> JoinValues<'a> {
    fn new(futs: Vec<LocalBoxFuture<'a, RunResult<Value>>>) -> Self {
        let len = futs.len();
        Self { futs: futs.into_iter().map(Some).collect(), out: (0..len).map(|_| None).collect() }
    }
}

impl Future for JoinValues<'_> {
    type Output = Vec<RunResult<Value>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut done = true;
        for (i, slot) in this.futs.iter_mut().enumerate() {
            if let Some(fut) = slot {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(result) => {
                        this.out[i] = Some(result);
                        *slot = None;
                    }
                    Poll::Pending => done = false,
                }
            }
        }
        if done {
            Poll::Ready(this.out.iter_mut().map(|r| r.take().expect("all results set")).collect())
        } else {
            Poll::Pending
        }
    }
}

/// Per-output-scope context: the focus directive target.
#[derive(Clone, Default)]
pub(crate) struct ScopeCtx {
    pub focus: Rc<RefCell<Option<String>>>,
}

/// A registered block override: the block body and the frame it closes
/// over. Chains accumulate child-first across an extends chain.
#[derive(Clone)]
struct BlockClosure {
    body: Rc<NodeList>,
    frame: FrameHandle,
}

/// Extends/blocks bookkeeping for one template chain.
#[derive(Default)]
pub(crate) struct RenderFlow {
    parent: RefCell<Option<String>>,
    blocks: RefCell<AHashMap<String, Vec<BlockClosure>>>,
}

/// Context threaded through one template unit's evaluation.
#[derive(Clone)]
pub(crate) struct Unit {
    pub name: Option<Rc<str>>,
    pub scope: ScopeCtx,
    flow: Rc<RenderFlow>,
    depth: usize,
}

/// Context for expression evaluation: the lexical frame, the journal region
/// nested output goes to, and the owning unit.
#[derive(Clone)]
pub(crate) struct EvalCtx {
    pub unit: Unit,
    pub frame: FrameHandle,
    pub sink: Rc<OutSink>,
}

/// A registered macro: definition plus closure frame. Values reference
/// entries by index, keeping the frame graph acyclic.
#[derive(Clone)]
struct MacroEntry {
    def: Rc<MacroDef>,
    closure: FrameHandle,
}

/// One render's interpreter state.
pub(crate) struct Interp {
    pub env: Rc<RenderEnv>,
    pub schedule: Rc<Schedule>,
    pub script_mode: bool,
    pub instances: HandlerInstances,
    pub tracer: Option<Rc<RefCell<dyn RenderTracer>>>,
    pub tracker: Rc<RefCell<dyn ResourceTracker>>,
    templates: RefCell<AHashMap<String, Rc<CompiledTemplate>>>,
    macros: RefCell<Vec<MacroEntry>>,
    base_frame: RefCell<Option<FrameHandle>>,
}

impl Interp {
    pub fn new(
        env: Rc<RenderEnv>,
        schedule: Rc<Schedule>,
        script_mode: bool,
        tracer: Option<Rc<RefCell<dyn RenderTracer>>>,
        tracker: Rc<RefCell<dyn ResourceTracker>>,
    ) -> Rc<Self> {
        let instances = env
            .handlers
            .iter()
            .map(|(name, reg)| (name.clone(), HandlerInstance::from_reg(reg)))
            .collect();
        Rc::new(Self {
            env,
            schedule,
            script_mode,
            instances,
            tracer,
            tracker,
            templates: RefCell::new(AHashMap::new()),
            macros: RefCell::new(Vec::new()),
            base_frame: RefCell::new(None),
        })
    }

    fn trace(&self, event: TraceEvent) {
        if let Some(tracer) = &self.tracer {
            tracer.borrow_mut().event(event);
        }
    }

    fn op(&self) -> RunResult<()> {
        self.tracker
            .borrow_mut()
            .on_operation()
            .map_err(|e| Poison::new(Exception::runtime(e.to_string())))
    }

    fn poison(&self, exc: Exception, loc: CodeLoc, unit: &Unit) -> Poison {
        let mut exc = exc.at(loc);
        if let Some(name) = &unit.name {
            exc = exc.in_template(name);
        }
        self.trace(TraceEvent::PoisonCreated { message: exc.message.clone() });
        Poison::new(exc)
    }

    /// The whole render: context frame, root scope, template unit chain,
    /// final flush.
    pub async fn render_root(
        self: Rc<Self>,
        compiled: Rc<CompiledTemplate>,
        ctx: Vec<(String, Value)>,
    ) -> Result<Output, Exception> {
        let base = FrameHandle::root(context_bindings(&self.schedule, ctx));
        *self.base_frame.borrow_mut() = Some(base.clone());

        let sink = OutSink::new();
        let scope = ScopeCtx::default();
        let unit = Unit {
            name: compiled.name.as_deref().map(Rc::from),
            scope: scope.clone(),
            flow: Rc::new(RenderFlow::default()),
            depth: 0,
        };
        let result = self.render_template_unit(&compiled, unit, base, Rc::clone(&sink)).await;
        self.trace(TraceEvent::RenderSettled);

        let decorate = |mut exc: Exception| {
            if exc.template.is_none()
                && let Some(name) = &compiled.name
            {
                exc = exc.in_template(name);
            }
            exc
        };
        if let Err(poison) = result {
            return Err(decorate(poison.into_exception()));
        }
        if self.schedule.is_cancelled() {
            return Err(decorate(Exception::cancelled()));
        }
        let focus = scope.focus.borrow().clone();
        flush_scope(&sink, self.script_mode, focus.as_deref(), &self.env.data_methods, &self.instances)
            .map_err(decorate)
    }

    /// Renders one template body, then follows its `extends` decision: when
    /// a parent is set, the child's buffered output is discarded and the
    /// parent renders with the accumulated block overrides.
    #[async_recursion(?Send)]
    async fn render_template_unit(
        &self,
        compiled: &CompiledTemplate,
        unit: Unit,
        frame: FrameHandle,
        sink: Rc<OutSink>,
    ) -> RunResult<FrameHandle> {
        let candidate = sink.nested();
        let final_frame = self.run_nodes(&compiled.root.body, unit.clone(), frame, Rc::clone(&candidate)).await;

        let parent_name = unit.flow.parent.borrow_mut().take();
        let Some(parent_name) = parent_name else {
            return Ok(final_frame);
        };
        // the child pass was only for block collection and side-effect
        // journaling that the parent layout supersedes
        candidate.clear();
        let Some(parent) = self.load_template(&parent_name, unit.depth + 1, &unit).await? else {
            return Err(self.poison(
                Exception::template_error(format!("template not found: {parent_name}")),
                CodeLoc::default(),
                &unit,
            ));
        };
        let parent_unit = Unit {
            name: parent.name.as_deref().map(Rc::from),
            scope: unit.scope.clone(),
            flow: Rc::clone(&unit.flow),
            depth: unit.depth + 1,
        };
        self.render_template_unit(&parent, parent_unit, final_frame, sink).await
    }

    /// Loads and compiles a template by name through the host capability,
    /// caching per render. `Ok(None)` is "not found".
    async fn load_template(
        &self,
        name: &str,
        depth: usize,
        unit: &Unit,
    ) -> RunResult<Option<Rc<CompiledTemplate>>> {
        self.tracker
            .borrow_mut()
            .on_template_load(depth)
            .map_err(|e| Poison::new(Exception::runtime(e.to_string())))?;
        if let Some(cached) = self.templates.borrow().get(name) {
            return Ok(Some(Rc::clone(cached)));
        }
        let (_, slot) = self.schedule.push_call(CallKind::Load { name: name.to_owned() });
        let loaded = slot.get().await?;
        if loaded.is_nullish() {
            return Ok(None);
        }
        let source = loaded.get_attr("source");
        let path = loaded.get_attr("path");
        let Value::Str(source) = source else {
            return Err(self.poison(
                Exception::runtime(format!("loader returned no source for `{name}`")),
                CodeLoc::default(),
                unit,
            ));
        };
        let path_str = path.coerce_str();
        let reported = if path_str.is_empty() { name } else { path_str.as_str() };
        let compiled = compile(&source, Some(reported), &self.env.compile_env).map_err(Poison::new)?;
        self.templates.borrow_mut().insert(name.to_owned(), Rc::clone(&compiled));
        Ok(Some(compiled))
    }

    /// Sweep then drive one statement list; returns the final frame (with
    /// every rebinding applied) for write extraction by the caller.
    async fn run_nodes<'a>(
        &'a self,
        nodes: &'a [StmtLoc],
        unit: Unit,
        frame: FrameHandle,
        sink: Rc<OutSink>,
    ) -> FrameHandle {
        let mut tasks = Vec::new();
        let final_frame = self.sweep(nodes, &unit, frame, &sink, &mut tasks);
        DriveAll::new(tasks).await;
        final_frame
    }

    fn spawn<'a>(
        &self,
        tasks: &mut Vec<LocalBoxFuture<'a, ()>>,
        loc: CodeLoc,
        fut: impl Future<Output = ()> + 'a,
    ) {
        self.trace(TraceEvent::TaskSpawned { label: "stmt".to_owned(), line: loc.line });
        tasks.push(Box::pin(fut));
    }

    fn phi_bind(&self, frame: &FrameHandle, writes: &[String]) -> (FrameHandle, Vec<(String, Rc<Slot>)>) {
        let phis: Vec<(String, Rc<Slot>)> =
            writes.iter().map(|name| (name.clone(), self.schedule.new_slot())).collect();
        let bound = frame.bind_many(phis.iter().map(|(n, s)| (n.clone(), Rc::clone(s))));
        (bound, phis)
    }

    /// Resolves write slots from a region's final frame: the value each
    /// written name ended up with (`Undefined` for a never-bound name).
    async fn resolve_phis(&self, phis: &[(String, Rc<Slot>)], final_frame: &FrameHandle) {
        for (name, slot) in phis {
            match final_frame.lookup(name) {
                Some(src) => {
                    let result = src.get().await;
                    slot.complete(result);
                }
                None => slot.resolve(Value::Undefined),
            }
        }
    }

    fn poison_phis(&self, phis: &[(String, Rc<Slot>)], poison: &Poison) {
        for (_, slot) in phis {
            if slot.try_get().is_none() {
                slot.poison(poison.clone());
            }
        }
    }

    /// The synchronous statement sweep. Journals output positions, rebinds
    /// frames, and spawns statement tasks, all in lexical order.
    fn sweep<'a>(
        &'a self,
        nodes: &'a [StmtLoc],
        unit: &Unit,
        frame: FrameHandle,
        sink: &Rc<OutSink>,
        tasks: &mut Vec<LocalBoxFuture<'a, ()>>,
    ) -> FrameHandle {
        let mut cur = frame;
        for node in nodes {
            let loc = node.loc;
            match &node.stmt {
                Stmt::TemplateData(text) => sink.push_literal(text.clone()),
                Stmt::Option { key, value } => {
                    if key == "focus" {
                        *unit.scope.focus.borrow_mut() = Some(value.clone());
                    }
                }
                Stmt::Extern { .. } => {}
                Stmt::Output(expr) => {
                    // chunk first, then the region any macro-issued commands
                    // land in: both claim their journal position now
                    let slot = self.schedule.new_slot();
                    sink.push_chunk(Rc::clone(&slot));
                    let ctx = self.ctx(unit, &cur, &sink.nested());
                    self.spawn(tasks, loc, async move {
                        let value = self.eval_located(expr, &ctx).await;
                        slot.complete(value);
                    });
                }
                Stmt::Do(expr) => {
                    let region = sink.nested();
                    let ctx = self.ctx(unit, &cur, &region);
                    self.spawn(tasks, loc, async move {
                        if let Err(poison) = self.eval_located(expr, &ctx).await {
                            region.record_error(poison);
                        }
                    });
                }
                Stmt::OutputCommand { handler, method, path, args, .. } => {
                    self.sweep_output_command(handler, method, path, args, unit, &cur, sink, tasks, loc);
                }
                Stmt::Assign { targets, value, .. } => {
                    cur = self.sweep_assign(targets, value, unit, cur, sink, tasks, loc);
                }
                Stmt::SetPath { root, path, value } => {
                    cur = self.sweep_set_path(root, path, value, unit, cur, sink, tasks, loc);
                }
                Stmt::Macro { name, params, body } => {
                    let def = Rc::new(MacroDef { name: name.clone(), params: params.clone(), body: body.clone() });
                    let slot = self.schedule.new_slot();
                    cur = cur.bind(name, Rc::clone(&slot));
                    let index = self.register_macro(def, cur.clone());
                    slot.resolve(Value::Func(FuncValue::Macro(Rc::new(MacroValue { index, caller: None }))));
                }
                Stmt::If { cond, then, otherwise } => {
                    let writes = phi_writes(&node.stmt);
                    let (bound, phis) = self.phi_bind(&cur, &writes);
                    let before = std::mem::replace(&mut cur, bound);
                    let region = sink.nested();
                    let unit2 = unit.clone();
                    self.spawn(tasks, loc, async move {
                        let ctx = EvalCtx { unit: unit2.clone(), frame: before.clone(), sink: Rc::clone(&region) };
                        match self.eval_located(cond, &ctx).await {
                            Ok(value) => {
                                let arm: Option<&'a [StmtLoc]> =
                                    if value.is_truthy() { Some(then.as_slice()) } else { otherwise.as_deref() };
                                let final_frame = match arm {
                                    Some(body) => {
                                        self.run_nodes(body, unit2, before.clone(), Rc::clone(&region)).await
                                    }
                                    None => before.clone(),
                                };
                                self.resolve_phis(&phis, &final_frame).await;
                            }
                            Err(poison) => {
                                self.poison_phis(&phis, &poison);
                                region.record_error(poison);
                            }
                        }
                    });
                }
                Stmt::Switch { subject, cases, default } => {
                    let writes = phi_writes(&node.stmt);
                    let (bound, phis) = self.phi_bind(&cur, &writes);
                    let before = std::mem::replace(&mut cur, bound);
                    let region = sink.nested();
                    let unit2 = unit.clone();
                    self.spawn(tasks, loc, async move {
                        let ctx = EvalCtx { unit: unit2.clone(), frame: before.clone(), sink: Rc::clone(&region) };
                        let arm = async {
                            let subject_value = self.eval_located(subject, &ctx).await?;
                            for (exprs, body) in cases {
                                for expr in exprs {
                                    let case_value = self.eval_located(expr, &ctx).await?;
                                    if subject_value.deep_eq(&case_value) {
                                        return Ok(Some(body.as_slice()));
                                    }
                                }
                            }
                            Ok(default.as_deref())
                        }
                        .await;
                        match arm {
                            Ok(arm) => {
                                let final_frame = match arm {
                                    Some(body) => {
                                        self.run_nodes(body, unit2, before.clone(), Rc::clone(&region)).await
                                    }
                                    None => before.clone(),
                                };
                                self.resolve_phis(&phis, &final_frame).await;
                            }
                            Err(poison) => {
                                self.poison_phis(&phis, &poison);
                                region.record_error(poison);
                            }
                        }
                    });
                }
                Stmt::For { mode, limit, targets, iter, body, otherwise } => {
                    cur = self.sweep_loop(
                        *mode,
                        *limit,
                        targets,
                        iter,
                        body,
                        otherwise.as_deref(),
                        &node.stmt,
                        unit,
                        cur,
                        sink,
                        tasks,
                        loc,
                    );
                }
                Stmt::While { cond, body } => {
                    cur = self.sweep_while(cond, body, &node.stmt, unit, cur, sink, tasks, loc);
                }
                Stmt::Guard { body, recover } => {
                    cur = self.sweep_guard(body, recover, &node.stmt, unit, cur, sink, tasks, loc);
                }
                Stmt::Block { name, body } => {
                    let region = sink.nested();
                    let unit2 = unit.clone();
                    let frame2 = cur.clone();
                    self.spawn(tasks, loc, async move {
                        self.render_block(name, body, unit2, frame2, region).await;
                    });
                }
                Stmt::Extends(expr) => {
                    let ctx = self.ctx(unit, &cur, sink);
                    let region = sink.nested();
                    let unit2 = unit.clone();
                    self.spawn(tasks, loc, async move {
                        match self.eval_located(expr, &ctx).await {
                            Ok(value) => {
                                let mut parent = unit2.flow.parent.borrow_mut();
                                if parent.is_none() {
                                    *parent = Some(value.coerce_str());
                                }
                            }
                            Err(poison) => region.record_error(poison),
                        }
                    });
                }
                Stmt::Include { template, ignore_missing } => {
                    let ctx = self.ctx(unit, &cur, sink);
                    let region = sink.nested();
                    let unit2 = unit.clone();
                    let ignore = *ignore_missing;
                    self.spawn(tasks, loc, async move {
                        if let Err(poison) =
                            self.run_include(template, ignore, &ctx, unit2, Rc::clone(&region), loc).await
                        {
                            region.record_error(poison);
                        }
                    });
                }
                Stmt::Import { template, target, with_context } => {
                    let slot = self.schedule.new_slot();
                    let before = cur.clone();
                    cur = cur.bind(target, Rc::clone(&slot));
                    let ctx = self.ctx(unit, &before, sink);
                    let region = sink.nested();
                    let unit2 = unit.clone();
                    let with_ctx = *with_context;
                    self.spawn(tasks, loc, async move {
                        match self.run_import(template, with_ctx, &ctx, &unit2, loc).await {
                            Ok(exports) => {
                                let map: ValueMap = exports.into_iter().collect();
                                slot.resolve(Value::dict(map));
                            }
                            Err(poison) => {
                                slot.poison(poison.clone());
                                region.record_error(poison);
                            }
                        }
                    });
                }
                Stmt::FromImport { template, names, with_context } => {
                    let mut slots = Vec::new();
                    let before = cur.clone();
                    for (name, alias) in names {
                        let slot = self.schedule.new_slot();
                        cur = cur.bind(alias.as_deref().unwrap_or(name), Rc::clone(&slot));
                        slots.push((name.clone(), slot));
                    }
                    let ctx = self.ctx(unit, &before, sink);
                    let region = sink.nested();
                    let unit2 = unit.clone();
                    let with_ctx = *with_context;
                    self.spawn(tasks, loc, async move {
                        match self.run_import(template, with_ctx, &ctx, &unit2, loc).await {
                            Ok(exports) => {
                                for (name, slot) in slots {
                                    match exports.iter().find(|(n, _)| *n == name) {
                                        Some((_, value)) => slot.resolve(value.clone()),
                                        None => {
                                            let poison = self.poison(
                                                Exception::template_error(format!("cannot import name `{name}`")),
                                                loc,
                                                &unit2,
                                            );
                                            slot.poison(poison.clone());
                                            region.record_error(poison);
                                        }
                                    }
                                }
                            }
                            Err(poison) => {
                                for (_, slot) in slots {
                                    slot.poison(poison.clone());
                                }
                                region.record_error(poison);
                            }
                        }
                    });
                }
                Stmt::CallBlock { call, body } => {
                    let caller_def =
                        Rc::new(MacroDef { name: "caller".to_owned(), params: Vec::new(), body: body.clone() });
                    let caller_index = self.register_macro(caller_def, cur.clone());
                    let slot = self.schedule.new_slot();
                    sink.push_chunk(Rc::clone(&slot));
                    let ctx = self.ctx(unit, &cur, &sink.nested());
                    self.spawn(tasks, loc, async move {
                        let value = self.eval_call_block(call, caller_index, &ctx).await;
                        slot.complete(value);
                    });
                }
                Stmt::FilterBlock { name, args, body } => {
                    let slot = self.schedule.new_slot();
                    sink.push_chunk(Rc::clone(&slot));
                    let ctx = self.ctx(unit, &cur, &sink.nested());
                    self.spawn(tasks, loc, async move {
                        let value = self.eval_filter_block(name, args, body, &ctx, loc).await;
                        slot.complete(value);
                    });
                }
                Stmt::CallExtension { name, args, body } => {
                    let slot = self.schedule.new_slot();
                    sink.push_chunk(Rc::clone(&slot));
                    let ctx = self.ctx(unit, &cur, &sink.nested());
                    self.spawn(tasks, loc, async move {
                        let value = self.eval_extension(name, args, body.as_deref(), &ctx, loc).await;
                        slot.complete(value);
                    });
                }
            }
        }
        cur
    }

    fn ctx(&self, unit: &Unit, frame: &FrameHandle, sink: &Rc<OutSink>) -> EvalCtx {
        EvalCtx { unit: unit.clone(), frame: frame.clone(), sink: Rc::clone(sink) }
    }

    fn register_macro(&self, def: Rc<MacroDef>, closure: FrameHandle) -> usize {
        let mut macros = self.macros.borrow_mut();
        macros.push(MacroEntry { def, closure });
        macros.len() - 1
    }

    #[expect(clippy::too_many_arguments, reason = "sweep helpers thread the full statement context")]
    fn sweep_output_command<'a>(
        &'a self,
        handler: &'a str,
        method: &'a str,
        path: &'a [PathSeg],
        args: &'a [ExprLoc],
        unit: &Unit,
        cur: &FrameHandle,
        sink: &Rc<OutSink>,
        tasks: &mut Vec<LocalBoxFuture<'a, ()>>,
        loc: CodeLoc,
    ) {
        if method == "_revert" {
            if handler == "_" {
                sink.push_revert(None);
            } else {
                sink.push_revert(Some(handler.to_owned()));
            }
            return;
        }
        if handler != "data" && !self.instances.contains_key(handler) {
            let region = sink.nested();
            region.record_error(self.poison(
                Exception::runtime(format!("unknown output handler `{handler}`")),
                loc,
                unit,
            ));
            return;
        }
        self.trace(TraceEvent::CommandJournaled { handler: handler.to_owned(), method: method.to_owned() });

        let mut parts = Vec::with_capacity(path.len());
        let mut pending: Vec<(&'a ExprLoc, Rc<Slot>)> = Vec::new();
        for seg in path {
            match seg {
                PathSeg::Key(key) => parts.push(PathPart::Key(key.clone())),
                PathSeg::Last => parts.push(PathPart::Last),
                PathSeg::Expr(expr) => {
                    let slot = self.schedule.new_slot();
                    parts.push(PathPart::Slot(Rc::clone(&slot)));
                    pending.push((expr, slot));
                }
            }
        }
        let mut arg_slots = Vec::with_capacity(args.len());
        for arg in args {
            let slot = self.schedule.new_slot();
            arg_slots.push(Rc::clone(&slot));
            pending.push((arg, slot));
        }
        sink.push_command(handler.to_owned(), method.to_owned(), parts, arg_slots, loc);

        let ctx = self.ctx(unit, cur, &sink.nested());
        self.spawn(tasks, loc, async move {
            let exprs: Vec<&'a ExprLoc> = pending.iter().map(|(expr, _)| *expr).collect();
            let results = self.eval_parallel(&exprs, &ctx).await;
            for ((_, slot), result) in pending.into_iter().zip(results) {
                slot.complete(result);
            }
        });
    }

    #[expect(clippy::too_many_arguments, reason = "sweep helpers thread the full statement context")]
    fn sweep_assign<'a>(
        &'a self,
        targets: &'a [String],
        value: &'a AssignSource,
        unit: &Unit,
        cur: FrameHandle,
        sink: &Rc<OutSink>,
        tasks: &mut Vec<LocalBoxFuture<'a, ()>>,
        loc: CodeLoc,
    ) -> FrameHandle {
        let slots: Vec<Rc<Slot>> = targets.iter().map(|_| self.schedule.new_slot()).collect();
        let before = cur.clone();
        let bound = cur.bind_many(targets.iter().cloned().zip(slots.iter().map(Rc::clone)));
        let region = sink.nested();
        let unit2 = unit.clone();
        let targets_len = targets.len();
        match value {
            AssignSource::Expr(expr) => {
                let ctx = EvalCtx { unit: unit2.clone(), frame: before, sink: Rc::clone(&region) };
                self.spawn(tasks, loc, async move {
                    let result = self.eval_located(expr, &ctx).await;
                    if let Err(poison) = self.finish_assign(result, &slots, targets_len, loc, &unit2) {
                        region.record_error(poison);
                    }
                });
            }
            AssignSource::Capture { body, focus } => {
                self.spawn(tasks, loc, async move {
                    let result = self.eval_capture(body, focus.as_deref(), &unit2, &before).await;
                    if let Err(poison) = self.finish_assign(result, &slots, targets_len, loc, &unit2) {
                        region.record_error(poison);
                    }
                });
            }
        }
        bound
    }

    /// Distributes an assignment result over its target slots, unpacking
    /// multi-target forms.
    fn finish_assign(
        &self,
        result: RunResult<Value>,
        slots: &[Rc<Slot>],
        targets_len: usize,
        loc: CodeLoc,
        unit: &Unit,
    ) -> RunResult<()> {
        match result {
            Ok(value) => {
                if targets_len <= 1 {
                    if let Some(slot) = slots.first() {
                        slot.resolve(value);
                    }
                    return Ok(());
                }
                let items: Vec<Value> = match &value {
                    Value::Array(items) => items.as_ref().clone(),
                    _ => {
                        let poison = self.poison(
                            Exception::runtime(format!(
                                "cannot unpack {} into {targets_len} targets",
                                value.type_name()
                            )),
                            loc,
                            unit,
                        );
                        self.poison_slots(slots, &poison);
                        return Err(poison);
                    }
                };
                if items.len() != targets_len {
                    let poison = self.poison(
                        Exception::runtime(format!(
                            "cannot unpack {} values into {targets_len} targets",
                            items.len()
                        )),
                        loc,
                        unit,
                    );
                    self.poison_slots(slots, &poison);
                    return Err(poison);
                }
                for (slot, item) in slots.iter().zip(items) {
                    slot.resolve(item);
                }
                Ok(())
            }
            Err(poison) => {
                self.poison_slots(slots, &poison);
                Err(poison)
            }
        }
    }

    fn poison_slots(&self, slots: &[Rc<Slot>], poison: &Poison) {
        for slot in slots {
            if slot.try_get().is_none() {
                slot.poison(poison.clone());
            }
        }
    }

    /// Renders a capture body in its own scope and projects its output.
    async fn eval_capture(
        &self,
        body: &NodeList,
        focus: Option<&str>,
        unit: &Unit,
        frame: &FrameHandle,
    ) -> RunResult<Value> {
        let cap_sink = OutSink::new();
        let cap_scope = ScopeCtx::default();
        let cap_unit = Unit {
            name: unit.name.clone(),
            scope: cap_scope.clone(),
            flow: Rc::new(RenderFlow::default()),
            depth: unit.depth,
        };
        self.run_nodes(body, cap_unit, frame.child(), Rc::clone(&cap_sink)).await;
        let scope_focus = cap_scope.focus.borrow().clone();
        let effective = focus.map(str::to_owned).or(scope_focus);
        let output = flush_scope(
            &cap_sink,
            self.script_mode,
            effective.as_deref(),
            &self.env.data_methods,
            &self.instances,
        )
        .map_err(Poison::new)?;
        Ok(output.into_value())
    }

    #[expect(clippy::too_many_arguments, reason = "sweep helpers thread the full statement context")]
    fn sweep_set_path<'a>(
        &'a self,
        root: &'a str,
        path: &'a [PathSeg],
        value: &'a ExprLoc,
        unit: &Unit,
        cur: FrameHandle,
        sink: &Rc<OutSink>,
        tasks: &mut Vec<LocalBoxFuture<'a, ()>>,
        loc: CodeLoc,
    ) -> FrameHandle {
        let slot = self.schedule.new_slot();
        let before = cur.clone();
        let bound = cur.bind(root, Rc::clone(&slot));
        let region = sink.nested();
        let unit2 = unit.clone();
        self.spawn(tasks, loc, async move {
            let ctx = EvalCtx { unit: unit2, frame: before, sink: Rc::clone(&region) };
            match self.apply_set_path(root, path, value, &ctx, loc).await {
                Ok(new_root) => slot.resolve(new_root),
                Err(poison) => {
                    slot.poison(poison.clone());
                    region.record_error(poison);
                }
            }
        });
        bound
    }

    async fn apply_set_path(
        &self,
        root: &str,
        path: &[PathSeg],
        value: &ExprLoc,
        ctx: &EvalCtx,
        loc: CodeLoc,
    ) -> RunResult<Value> {
        let mut base = match ctx.frame.lookup(root) {
            Some(slot) => slot.get().await?,
            None => Value::Undefined,
        };
        let mut segs = SegPath::with_capacity(path.len());
        for seg in path {
            match seg {
                PathSeg::Key(key) => segs.push(ResolvedSeg::Key(key.clone())),
                PathSeg::Last => segs.push(ResolvedSeg::Last),
                PathSeg::Expr(expr) => {
                    let v = self.eval_located(expr, ctx).await?;
                    match v {
                        Value::Int(i) => segs.push(ResolvedSeg::Index(i)),
                        Value::Str(s) => segs.push(ResolvedSeg::Key(s.to_string())),
                        other => {
                            return Err(self.poison(
                                Exception::runtime(format!(
                                    "path segment must be a string or integer, found {}",
                                    other.type_name()
                                )),
                                loc,
                                &ctx.unit,
                            ));
                        }
                    }
                }
            }
        }
        let new_value = self.eval_located(value, ctx).await?;
        apply_command(&mut base, "set", &segs, &[new_value], &self.env.data_methods)
            .map_err(|exc| self.poison(exc, loc, &ctx.unit))?;
        Ok(base)
    }

    #[expect(clippy::too_many_arguments, reason = "sweep helpers thread the full statement context")]
    fn sweep_loop<'a>(
        &'a self,
        mode: LoopMode,
        limit: Option<usize>,
        targets: &'a [String],
        iter: &'a ExprLoc,
        body: &'a NodeList,
        otherwise: Option<&'a [StmtLoc]>,
        stmt: &Stmt,
        unit: &Unit,
        cur: FrameHandle,
        sink: &Rc<OutSink>,
        tasks: &mut Vec<LocalBoxFuture<'a, ()>>,
        loc: CodeLoc,
    ) -> FrameHandle {
        let writes = phi_writes(stmt);
        let (bound, phis) = self.phi_bind(&cur, &writes);
        let before = cur;
        let region = sink.nested();
        let unit2 = unit.clone();
        self.spawn(tasks, loc, async move {
            let ctx = EvalCtx { unit: unit2.clone(), frame: before.clone(), sink: Rc::clone(&region) };
            let setup = async {
                let iter_value = self.eval_located(iter, &ctx).await?;
                self.iter_entries(&iter_value, loc, &unit2)
            }
            .await;
            let entries = match setup {
                Ok(entries) => entries,
                Err(poison) => {
                    self.poison_phis(&phis, &poison);
                    region.record_error(poison);
                    return;
                }
            };

            if entries.is_empty() {
                let final_frame = match otherwise {
                    Some(arm) => self.run_nodes(arm, unit2, before.clone(), Rc::clone(&region)).await,
                    None => before.clone(),
                };
                self.resolve_phis(&phis, &final_frame).await;
                return;
            }

            let len = entries.len();
            match mode {
                LoopMode::Sequential => {
                    let mut carried = before.clone();
                    for (i, (key, item)) in entries.into_iter().enumerate() {
                        if let Err(poison) = self.op() {
                            self.poison_phis(&phis, &poison);
                            region.record_error(poison);
                            return;
                        }
                        let iter_sink = region.nested();
                        let body_frame = match self.loop_frame(&carried, targets, key, item, i, len, loc, &unit2) {
                            Ok(frame) => frame,
                            Err(poison) => {
                                self.poison_phis(&phis, &poison);
                                region.record_error(poison);
                                return;
                            }
                        };
                        let final_frame = self.run_nodes(body, unit2.clone(), body_frame, iter_sink).await;
                        for name in &writes {
                            if let Some(slot) = final_frame.lookup(name) {
                                carried = carried.bind(name, slot);
                            }
                        }
                    }
                    self.resolve_phis(&phis, &carried).await;
                }
                LoopMode::Concurrent => {
                    let mut iteration_tasks: Vec<LocalBoxFuture<'_, ()>> = Vec::with_capacity(len);
                    for (i, (key, item)) in entries.into_iter().enumerate() {
                        if let Err(poison) = self.op() {
                            region.record_error(poison);
                            break;
                        }
                        let iter_sink = region.nested();
                        let body_frame = match self.loop_frame(&before, targets, key, item, i, len, loc, &unit2) {
                            Ok(frame) => frame,
                            Err(poison) => {
                                region.record_error(poison);
                                continue;
                            }
                        };
                        let unit3 = unit2.clone();
                        iteration_tasks.push(Box::pin(async move {
                            self.run_nodes(body, unit3, body_frame, iter_sink).await;
                        }));
                    }
                    match limit {
                        None => DriveAll::new(iteration_tasks).await,
                        Some(n) => {
                            let n = n.max(1);
                            let mut remaining = iteration_tasks;
                            while !remaining.is_empty() {
                                let wave: Vec<_> = remaining.drain(..n.min(remaining.len())).collect();
                                DriveAll::new(wave).await;
                            }
                        }
                    }
                    self.resolve_phis(&phis, &before).await;
                }
            }
        });
        bound
    }

    /// The child frame for one loop iteration: targets plus the `loop`
    /// variable.
    #[expect(clippy::too_many_arguments, reason = "sweep helpers thread the full statement context")]
    fn loop_frame(
        &self,
        base: &FrameHandle,
        targets: &[String],
        key: Option<Value>,
        item: Value,
        index: usize,
        len: usize,
        loc: CodeLoc,
        unit: &Unit,
    ) -> RunResult<FrameHandle> {
        let mut frame = base.child();
        match (targets.len(), key) {
            (1, Some(k)) => frame = frame.bind(&targets[0], self.schedule.resolved_slot(k)),
            (1, None) => frame = frame.bind(&targets[0], self.schedule.resolved_slot(item.clone())),
            (2, Some(k)) => {
                frame = frame.bind(&targets[0], self.schedule.resolved_slot(k));
                frame = frame.bind(&targets[1], self.schedule.resolved_slot(item.clone()));
            }
            (n, None) => {
                let Value::Array(items) = &item else {
                    return Err(self.poison(
                        Exception::runtime(format!("cannot unpack loop item into {n} variables")),
                        loc,
                        unit,
                    ));
                };
                if items.len() != n {
                    return Err(self.poison(
                        Exception::runtime(format!("cannot unpack loop item into {n} variables")),
                        loc,
                        unit,
                    ));
                }
                for (target, part) in targets.iter().zip(items.iter()) {
                    frame = frame.bind(target, self.schedule.resolved_slot(part.clone()));
                }
            }
            (n, Some(_)) => {
                return Err(self.poison(
                    Exception::runtime(format!("cannot unpack a key/value pair into {n} variables")),
                    loc,
                    unit,
                ));
            }
        }
        let mut loop_map = ValueMap::new();
        loop_map.insert("index".to_owned(), Value::Int(index as i64 + 1));
        loop_map.insert("index0".to_owned(), Value::Int(index as i64));
        loop_map.insert("first".to_owned(), Value::Bool(index == 0));
        loop_map.insert("last".to_owned(), Value::Bool(index + 1 == len));
        loop_map.insert("length".to_owned(), Value::Int(len as i64));
        loop_map.insert("revindex".to_owned(), Value::Int((len - index) as i64));
        loop_map.insert("revindex0".to_owned(), Value::Int((len - index - 1) as i64));
        Ok(frame.bind("loop", self.schedule.resolved_slot(Value::dict(loop_map))))
    }

    fn iter_entries(&self, value: &Value, loc: CodeLoc, unit: &Unit) -> RunResult<Vec<(Option<Value>, Value)>> {
        match value {
            Value::Array(items) => Ok(items.iter().map(|v| (None, v.clone())).collect()),
            Value::Dict(map) => Ok(map.iter().map(|(k, v)| (Some(Value::str(k)), v.clone())).collect()),
            Value::Str(s) => Ok(s.chars().map(|c| (None, Value::from(c.to_string()))).collect()),
            Value::Undefined | Value::Null => Ok(Vec::new()),
            other => Err(self.poison(
                Exception::runtime(format!("{} is not iterable", other.type_name())),
                loc,
                unit,
            )),
        }
    }

    #[expect(clippy::too_many_arguments, reason = "sweep helpers thread the full statement context")]
    fn sweep_while<'a>(
        &'a self,
        cond: &'a ExprLoc,
        body: &'a NodeList,
        stmt: &Stmt,
        unit: &Unit,
        cur: FrameHandle,
        sink: &Rc<OutSink>,
        tasks: &mut Vec<LocalBoxFuture<'a, ()>>,
        loc: CodeLoc,
    ) -> FrameHandle {
        let writes = phi_writes(stmt);
        let (bound, phis) = self.phi_bind(&cur, &writes);
        let before = cur;
        let region = sink.nested();
        let unit2 = unit.clone();
        self.spawn(tasks, loc, async move {
            let mut carried = before;
            loop {
                if let Err(poison) = self.op() {
                    self.poison_phis(&phis, &poison);
                    region.record_error(poison);
                    return;
                }
                let ctx = EvalCtx { unit: unit2.clone(), frame: carried.clone(), sink: Rc::clone(&region) };
                match self.eval_located(cond, &ctx).await {
                    Ok(value) if value.is_truthy() => {}
                    Ok(_) => break,
                    Err(poison) => {
                        self.poison_phis(&phis, &poison);
                        region.record_error(poison);
                        return;
                    }
                }
                let iter_sink = region.nested();
                let final_frame = self.run_nodes(body, unit2.clone(), carried.child(), iter_sink).await;
                for name in &writes {
                    if let Some(slot) = final_frame.lookup(name) {
                        carried = carried.bind(name, slot);
                    }
                }
            }
            self.resolve_phis(&phis, &carried).await;
        });
        bound
    }

    #[expect(clippy::too_many_arguments, reason = "sweep helpers thread the full statement context")]
    fn sweep_guard<'a>(
        &'a self,
        body: &'a NodeList,
        recover: &'a NodeList,
        stmt: &Stmt,
        unit: &Unit,
        cur: FrameHandle,
        sink: &Rc<OutSink>,
        tasks: &mut Vec<LocalBoxFuture<'a, ()>>,
        loc: CodeLoc,
    ) -> FrameHandle {
        let writes = phi_writes(stmt);
        let (bound, phis) = self.phi_bind(&cur, &writes);
        let before = cur;
        let region = sink.nested();
        region.set_revert_barrier();
        let unit2 = unit.clone();
        self.spawn(tasks, loc, async move {
            let body_sink = region.nested();
            let final_frame = self.run_nodes(body, unit2.clone(), before.clone(), Rc::clone(&body_sink)).await;

            // any poisoned write in the protected body transfers control
            let mut failure = body_sink.find_poison();
            if failure.is_none() {
                for (name, _) in &phis {
                    if let Some(slot) = final_frame.lookup(name)
                        && let Some(Err(poison)) = slot.try_get()
                    {
                        failure = Some(poison);
                        break;
                    }
                }
            }

            match failure {
                None => self.resolve_phis(&phis, &final_frame).await,
                Some(poison) => {
                    body_sink.absorb();
                    let error_value = Value::from(poison.cause().message.clone());
                    let recover_frame = before.bind("error", self.schedule.resolved_slot(error_value));
                    let recover_sink = region.nested();
                    let recover_final = self.run_nodes(recover, unit2, recover_frame, recover_sink).await;
                    self.resolve_phis(&phis, &recover_final).await;
                }
            }
        });
        bound
    }

    /// Renders a block site: the override chain renders child-first, with
    /// `super` bound to the next link.
    async fn render_block(
        &self,
        name: &str,
        own_body: &NodeList,
        unit: Unit,
        frame: FrameHandle,
        sink: Rc<OutSink>,
    ) {
        let chain = {
            let mut blocks = unit.flow.blocks.borrow_mut();
            let chain = blocks.entry(name.to_owned()).or_default();
            chain.push(BlockClosure { body: Rc::new(own_body.clone()), frame });
            chain.clone()
        };
        // wire `super` bottom-up: each link's frame exposes the next link as
        // a callable
        let mut super_value: Option<Value> = None;
        let mut head_frame = None;
        for link in chain.iter().rev() {
            let mut link_frame = link.frame.child();
            if let Some(value) = &super_value {
                link_frame = link_frame.bind("super", self.schedule.resolved_slot(value.clone()));
            }
            let index = self.register_macro(
                Rc::new(MacroDef {
                    name: format!("block {name}"),
                    params: Vec::new(),
                    body: (*link.body).clone(),
                }),
                link_frame.clone(),
            );
            super_value = Some(Value::Func(FuncValue::Macro(Rc::new(MacroValue { index, caller: None }))));
            head_frame = Some(link_frame);
        }
        let head = chain.first().expect("chain contains at least the own body");
        let head_frame = head_frame.expect("chain is non-empty");
        let body = Rc::clone(&head.body);
        self.run_nodes(body.as_slice(), unit, head_frame, sink).await;
    }

    async fn run_include(
        &self,
        template: &ExprLoc,
        ignore_missing: bool,
        ctx: &EvalCtx,
        unit: Unit,
        sink: Rc<OutSink>,
        loc: CodeLoc,
    ) -> RunResult<()> {
        let name = self.eval_located(template, ctx).await?.coerce_str();
        let Some(compiled) = self.load_template(&name, unit.depth + 1, &unit).await? else {
            if ignore_missing {
                return Ok(());
            }
            return Err(self.poison(
                Exception::template_error(format!("template not found: {name}")),
                loc,
                &unit,
            ));
        };
        let inc_unit = Unit {
            name: compiled.name.as_deref().map(Rc::from),
            scope: unit.scope.clone(),
            flow: Rc::new(RenderFlow::default()),
            depth: unit.depth + 1,
        };
        self.render_template_unit(&compiled, inc_unit, ctx.frame.child(), sink).await?;
        Ok(())
    }

    /// Loads and executes a template for import, returning its exported
    /// bindings (macros and top-level assignments).
    async fn run_import(
        &self,
        template: &ExprLoc,
        with_context: bool,
        ctx: &EvalCtx,
        unit: &Unit,
        loc: CodeLoc,
    ) -> RunResult<Vec<(String, Value)>> {
        let name = self.eval_located(template, ctx).await?.coerce_str();
        let Some(compiled) = self.load_template(&name, unit.depth + 1, unit).await? else {
            return Err(self.poison(
                Exception::template_error(format!("template not found: {name}")),
                loc,
                unit,
            ));
        };
        let base = if with_context {
            ctx.frame.child()
        } else {
            let base = self.base_frame.borrow().clone().expect("base frame set at render start");
            base.child()
        };
        let imp_unit = Unit {
            name: compiled.name.as_deref().map(Rc::from),
            scope: ScopeCtx::default(),
            flow: Rc::new(RenderFlow::default()),
            depth: unit.depth + 1,
        };
        // imported output is discarded; only bindings escape
        let dump = OutSink::new();
        let final_frame = self.render_template_unit(&compiled, imp_unit, base, dump).await?;
        let mut exports = Vec::new();
        for (export_name, slot) in final_frame.local_bindings() {
            let value = slot.get().await?;
            exports.push((export_name, value));
        }
        Ok(exports)
    }

    async fn eval_call_block(&self, call: &ExprLoc, caller_index: usize, ctx: &EvalCtx) -> RunResult<Value> {
        let caller = Value::Func(FuncValue::Macro(Rc::new(MacroValue { index: caller_index, caller: None })));
        let Expr::FunCall { callee, args, kwargs, lock_key, .. } = &call.expr else {
            return Err(self.poison(Exception::runtime("`call` requires a macro invocation"), call.loc, &ctx.unit));
        };
        self.eval_call(callee, args, kwargs, lock_key.as_deref(), Some(caller), ctx, call.loc).await
    }

    async fn eval_filter_block(
        &self,
        name: &str,
        args: &[ExprLoc],
        body: &NodeList,
        ctx: &EvalCtx,
        loc: CodeLoc,
    ) -> RunResult<Value> {
        let body_sink = ctx.sink.nested();
        self.run_nodes(body, ctx.unit.clone(), ctx.frame.child(), Rc::clone(&body_sink)).await;
        let text = body_sink.extract_text(self.script_mode)?;
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval_located(arg, ctx).await?);
        }
        self.apply_filter(name, &Value::from(text), &arg_values, false, ctx, loc).await
    }

    async fn eval_extension(
        &self,
        name: &str,
        args: &[ExprLoc],
        body: Option<&[StmtLoc]>,
        ctx: &EvalCtx,
        loc: CodeLoc,
    ) -> RunResult<Value> {
        let Some(ext) = self.env.extensions.get(name).cloned() else {
            return Err(self.poison(
                Exception::template_error(format!("unknown extension `{name}`")),
                loc,
                &ctx.unit,
            ));
        };
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval_located(arg, ctx).await?);
        }
        let body_text = match body {
            Some(body) => {
                let body_sink = ctx.sink.nested();
                self.run_nodes(body, ctx.unit.clone(), ctx.frame.child(), Rc::clone(&body_sink)).await;
                Some(body_sink.extract_text(self.script_mode)?)
            }
            None => None,
        };
        if ext.is_async() {
            self.op()?;
            let mut call_args = arg_values;
            if let Some(text) = body_text {
                call_args.push(Value::from(text));
            }
            let path = vec!["extensions".to_owned(), name.to_owned()];
            let (call_id, slot) = self.schedule.push_call(CallKind::Function { path: path.clone(), args: call_args });
            self.trace(TraceEvent::ExternalCall { call_id, path });
            return slot.get().await;
        }
        ext.run(&arg_values, body_text.as_deref())
            .map_err(|exc| self.poison(exc, loc, &ctx.unit))
    }

    /// Evaluates an expression, attaching the owning template name to any
    /// failure that lacks one.
    async fn eval_located(&self, expr: &ExprLoc, ctx: &EvalCtx) -> RunResult<Value> {
        match self.eval_expr(expr, ctx).await {
            Ok(value) => Ok(value),
            Err(poison) => {
                if poison.cause().template.is_none()
                    && let Some(name) = &ctx.unit.name
                {
                    return Err(Poison::new(poison.into_exception().in_template(name)));
                }
                Err(poison)
            }
        }
    }

    #[async_recursion(?Send)]
    async fn eval_expr(&self, expr: &ExprLoc, ctx: &EvalCtx) -> RunResult<Value> {
        let loc = expr.loc;
        match &expr.expr {
            Expr::Literal(lit) => Ok(match lit {
                Literal::Null => Value::Null,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(i) => Value::Int(*i),
                Literal::Float(f) => Value::Float(*f),
                Literal::Str(s) => Value::str(s),
            }),
            Expr::Symbol(name) => match ctx.frame.lookup(name) {
                Some(slot) => slot.get().await,
                None => {
                    if self.env.throw_on_undefined {
                        Err(self.poison(
                            Exception::template_error(format!("undefined variable `{name}`")),
                            loc,
                            &ctx.unit,
                        ))
                    } else {
                        Ok(Value::Undefined)
                    }
                }
            },
            Expr::Group(items) | Expr::Array(items) => {
                let refs: Vec<&ExprLoc> = items.iter().collect();
                let results = self.eval_parallel(&refs, ctx).await;
                let mut values = Vec::with_capacity(results.len());
                for result in results {
                    values.push(result?);
                }
                Ok(Value::array(values))
            }
            Expr::Dict(pairs) => {
                let mut map = ValueMap::new();
                for (key, value) in pairs {
                    let key = self.eval_expr(key, ctx).await?.coerce_str();
                    let value = self.eval_expr(value, ctx).await?;
                    map.insert(key, value);
                }
                Ok(Value::dict(map))
            }
            Expr::LookupVal { target, key } => {
                let base = self.eval_expr(target, ctx).await?;
                match key {
                    LookupKey::Attr(name) => Ok(base.get_attr(name)),
                    LookupKey::Index(index) => {
                        let index = self.eval_expr(index, ctx).await?;
                        Ok(base.get_item(&index))
                    }
                }
            }
            Expr::SeqMarker(inner) => self.eval_expr(inner, ctx).await,
            Expr::FunCall { callee, args, kwargs, lock_key, .. } => {
                self.eval_call(callee, args, kwargs, lock_key.as_deref(), None, ctx, loc).await
            }
            Expr::Filter { value, name, args, is_async, .. } => {
                let piped = self.eval_expr(value, ctx).await?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval_expr(arg, ctx).await?);
                }
                self.apply_filter(name, &piped, &arg_values, *is_async, ctx, loc).await
            }
            Expr::InlineIf { then, cond, otherwise } => {
                let cond = self.eval_expr(cond, ctx).await?;
                if cond.is_truthy() {
                    self.eval_expr(then, ctx).await
                } else {
                    match otherwise {
                        Some(arm) => self.eval_expr(arm, ctx).await,
                        None => Ok(Value::Undefined),
                    }
                }
            }
            Expr::UnaryOp { op, operand } => {
                let value = self.eval_expr(operand, ctx).await?;
                match op {
                    UnaryOpKind::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOpKind::Neg => match value {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(self.poison(
                            Exception::runtime(format!("cannot negate {}", other.type_name())),
                            loc,
                            &ctx.unit,
                        )),
                    },
                    UnaryOpKind::Pos => match value {
                        Value::Int(_) | Value::Float(_) => Ok(value),
                        other => Err(self.poison(
                            Exception::runtime(format!("cannot apply unary `+` to {}", other.type_name())),
                            loc,
                            &ctx.unit,
                        )),
                    },
                }
            }
            Expr::BinOp { op, lhs, rhs } => match op {
                BinOpKind::And => {
                    let left = self.eval_expr(lhs, ctx).await?;
                    if left.is_truthy() { self.eval_expr(rhs, ctx).await } else { Ok(left) }
                }
                BinOpKind::Or => {
                    let left = self.eval_expr(lhs, ctx).await?;
                    if left.is_truthy() { Ok(left) } else { self.eval_expr(rhs, ctx).await }
                }
                _ => {
                    let refs = [lhs.as_ref(), rhs.as_ref()];
                    let mut results = self.eval_parallel(&refs, ctx).await.into_iter();
                    let left = results.next().expect("two operands")?;
                    let right = results.next().expect("two operands")?;
                    apply_binop(*op, &left, &right)
                        .map_err(|message| self.poison(Exception::runtime(message), loc, &ctx.unit))
                }
            },
            Expr::Compare { first, rest } => {
                let refs: Vec<&ExprLoc> =
                    std::iter::once(first.as_ref()).chain(rest.iter().map(|(_, e)| e)).collect();
                let results = self.eval_parallel(&refs, ctx).await;
                let mut values = Vec::with_capacity(results.len());
                for result in results {
                    values.push(result?);
                }
                let mut left = &values[0];
                for ((op, _), right) in rest.iter().zip(values.iter().skip(1)) {
                    let holds = compare_with(*op, left, right)
                        .map_err(|message| self.poison(Exception::runtime(message), loc, &ctx.unit))?;
                    if !holds {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Is { value, negate, test, args } => {
                let subject = self.eval_expr(value, ctx).await?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval_expr(arg, ctx).await?);
                }
                let result = filters::run_test(test, &subject, &arg_values)
                    .map_err(|exc| self.poison(exc, loc, &ctx.unit))?;
                Ok(Value::Bool(result != *negate))
            }
            Expr::Spread(inner) | Expr::KeywordSpread(inner) => self.eval_expr(inner, ctx).await,
        }
    }

    /// Evaluates expressions concurrently, preserving result order.
    async fn eval_parallel(&self, exprs: &[&ExprLoc], ctx: &EvalCtx) -> Vec<RunResult<Value>> {
        let futs: Vec<LocalBoxFuture<'_, RunResult<Value>>> = exprs
            .iter()
            .map(|expr| {
                let ctx = ctx.clone();
                let expr = *expr;
                Box::pin(async move { self.eval_expr(expr, &ctx).await }) as LocalBoxFuture<'_, RunResult<Value>>
            })
            .collect();
        JoinValues::new(futs).await
    }

    async fn apply_filter(
        &self,
        name: &str,
        value: &Value,
        args: &[Value],
        is_async: bool,
        ctx: &EvalCtx,
        loc: CodeLoc,
    ) -> RunResult<Value> {
        if is_async {
            self.op()?;
            let mut call_args = vec![value.clone()];
            call_args.extend_from_slice(args);
            let path = vec!["filters".to_owned(), name.to_owned()];
            let (call_id, slot) = self.schedule.push_call(CallKind::Function { path: path.clone(), args: call_args });
            self.trace(TraceEvent::ExternalCall { call_id, path });
            return slot.get().await;
        }
        let Some(filter) = self.env.filters.get(name) else {
            return Err(self.poison(
                Exception::template_error(format!("unknown filter `{name}`")),
                loc,
                &ctx.unit,
            ));
        };
        filter(value, args).map_err(|exc| self.poison(exc, loc, &ctx.unit))
    }

    /// Call dispatch: sequence lock first, then callee resolution, then the
    /// template-callable or host path.
    #[expect(clippy::too_many_arguments, reason = "sweep helpers thread the full statement context")]
    async fn eval_call(
        &self,
        callee: &ExprLoc,
        args: &[ExprLoc],
        kwargs: &[(String, ExprLoc)],
        lock_key: Option<&str>,
        caller: Option<Value>,
        ctx: &EvalCtx,
        loc: CodeLoc,
    ) -> RunResult<Value> {
        // the lock is acquired before any evaluation, so acquisition order
        // is first-poll (lexical) order, not completion order
        let guard = match lock_key {
            Some(key) => {
                let key_id = self.schedule.lock_key(key);
                let guard = crate::schedule::acquire(&self.schedule, key_id).await?;
                let key = self.schedule.interner.resolve(key_id);
                self.trace(TraceEvent::LockAcquired { key: key.clone() });
                Some((guard, key))
            }
            None => None,
        };
        let result = self.eval_call_inner(callee, args, kwargs, caller, ctx, loc).await;
        if let Some((guard, key)) = guard {
            guard.release();
            self.trace(TraceEvent::LockReleased { key });
        }
        result
    }

    async fn eval_call_inner(
        &self,
        callee: &ExprLoc,
        args: &[ExprLoc],
        kwargs: &[(String, ExprLoc)],
        caller: Option<Value>,
        ctx: &EvalCtx,
        loc: CodeLoc,
    ) -> RunResult<Value> {
        let (arg_values, kwarg_values) = self.eval_args(args, kwargs, ctx).await?;

        // flatten the callee chain root-first
        let mut segs: Vec<&LookupKey> = Vec::new();
        let mut cursor = callee;
        loop {
            match &cursor.expr {
                Expr::LookupVal { target, key } => {
                    segs.push(key);
                    cursor = target;
                }
                Expr::SeqMarker(inner) => cursor = inner,
                _ => break,
            }
        }
        segs.reverse();

        if let Expr::Symbol(root) = &cursor.expr {
            let host_ok = self.host_eligible(&ctx.frame, root);
            match ctx.frame.lookup(root) {
                None if host_ok => {
                    let path = self.host_path(root, &segs, ctx).await?;
                    return self.host_call(path, arg_values).await;
                }
                None => {}
                Some(slot) => {
                    let mut value = slot.get().await?;
                    for seg in &segs {
                        if value.is_nullish() {
                            break;
                        }
                        value = match seg {
                            LookupKey::Attr(name) => value.get_attr(name),
                            LookupKey::Index(index) => {
                                let index = self.eval_expr(index, ctx).await?;
                                value.get_item(&index)
                            }
                        };
                    }
                    match value {
                        Value::Func(FuncValue::Macro(m)) => {
                            let call = match caller {
                                Some(caller_value) => {
                                    Rc::new(MacroValue { index: m.index, caller: Some(Box::new(caller_value)) })
                                }
                                None => m,
                            };
                            return self.call_macro(&call, &arg_values, &kwarg_values, ctx, loc).await;
                        }
                        Value::Undefined if host_ok => {
                            let path = self.host_path(root, &segs, ctx).await?;
                            return self.host_call(path, arg_values).await;
                        }
                        other => {
                            return Err(self.poison(
                                Exception::runtime(format!(
                                    "`{root}` call target is not callable (found {})",
                                    other.type_name()
                                )),
                                loc,
                                &ctx.unit,
                            ));
                        }
                    }
                }
            }
            return Err(self.poison(Exception::runtime(format!("`{root}` is not callable")), loc, &ctx.unit));
        }

        // non-symbol root: evaluate it and require a template callable
        let mut value = self.eval_expr(cursor, ctx).await?;
        for seg in &segs {
            value = match seg {
                LookupKey::Attr(name) => value.get_attr(name),
                LookupKey::Index(index) => {
                    let index = self.eval_expr(index, ctx).await?;
                    value.get_item(&index)
                }
            };
        }
        match value {
            Value::Func(FuncValue::Macro(m)) => self.call_macro(&m, &arg_values, &kwarg_values, ctx, loc).await,
            other => Err(self.poison(
                Exception::runtime(format!("{} is not callable", other.type_name())),
                loc,
                &ctx.unit,
            )),
        }
    }

    /// Whether calls rooted at `name` may dispatch to the host: the name is
    /// unbound, or still bound to the caller-supplied context value.
    fn host_eligible(&self, frame: &FrameHandle, name: &str) -> bool {
        match frame.lookup(name) {
            None => true,
            Some(slot) => {
                let base = self.base_frame.borrow();
                base.as_ref().and_then(|b| b.lookup(name)).is_some_and(|b| Rc::ptr_eq(&b, &slot))
            }
        }
    }

    /// The call path for host dispatch: root plus static segment names;
    /// dynamic segments contribute their coerced string value.
    async fn host_path(&self, root: &str, segs: &[&LookupKey], ctx: &EvalCtx) -> RunResult<Vec<String>> {
        let mut path = vec![root.to_owned()];
        for seg in segs {
            match seg {
                LookupKey::Attr(name) => path.push(name.clone()),
                LookupKey::Index(index) => {
                    let value = self.eval_expr(index, ctx).await?;
                    path.push(value.coerce_str());
                }
            }
        }
        Ok(path)
    }

    async fn host_call(&self, path: Vec<String>, args: Vec<Value>) -> RunResult<Value> {
        self.op()?;
        let (call_id, slot) = self.schedule.push_call(CallKind::Function { path: path.clone(), args });
        self.trace(TraceEvent::ExternalCall { call_id, path });
        slot.get().await
    }

    /// Evaluates call arguments in parallel, expanding `*` and `**` spreads.
    async fn eval_args(
        &self,
        args: &[ExprLoc],
        kwargs: &[(String, ExprLoc)],
        ctx: &EvalCtx,
    ) -> RunResult<(Vec<Value>, Vec<(String, Value)>)> {
        let refs: Vec<&ExprLoc> = args.iter().collect();
        let results = self.eval_parallel(&refs, ctx).await;
        let mut arg_values = Vec::with_capacity(args.len());
        let mut kwarg_values = Vec::with_capacity(kwargs.len());
        for (expr, result) in args.iter().zip(results) {
            let value = result?;
            match &expr.expr {
                Expr::Spread(_) => match value {
                    Value::Array(items) => arg_values.extend(items.iter().cloned()),
                    other => arg_values.push(other),
                },
                Expr::KeywordSpread(_) => match value {
                    Value::Dict(map) => {
                        kwarg_values.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    other => arg_values.push(other),
                },
                _ => arg_values.push(value),
            }
        }
        for (name, expr) in kwargs {
            let value = self.eval_expr(expr, ctx).await?;
            kwarg_values.push((name.clone(), value));
        }
        Ok((arg_values, kwarg_values))
    }

    /// Invokes a macro: fresh scope over the closure frame, parameter
    /// binding, body rendering. The body's text is the return value; its
    /// handler commands flow to the call site's scope.
    #[async_recursion(?Send)]
    async fn call_macro(
        &self,
        m: &MacroValue,
        args: &[Value],
        kwargs: &[(String, Value)],
        ctx: &EvalCtx,
        loc: CodeLoc,
    ) -> RunResult<Value> {
        self.op()?;
        let entry = self.macros.borrow()[m.index].clone();
        let def = entry.def;

        let mut frame = entry.closure.child();
        for (i, (param, default)) in def.params.iter().enumerate() {
            let value = if let Some(positional) = args.get(i) {
                positional.clone()
            } else if let Some((_, kw)) = kwargs.iter().find(|(name, _)| name == param) {
                kw.clone()
            } else if let Some(default) = default {
                let def_ctx = EvalCtx { unit: ctx.unit.clone(), frame: frame.clone(), sink: Rc::clone(&ctx.sink) };
                self.eval_expr(default, &def_ctx).await?
            } else {
                Value::Undefined
            };
            frame = frame.bind(param, self.schedule.resolved_slot(value));
        }
        if let Some(caller) = &m.caller {
            frame = frame.bind("caller", self.schedule.resolved_slot((**caller).clone()));
        }

        let body_sink = ctx.sink.nested();
        self.run_nodes(&def.body, ctx.unit.clone(), frame, Rc::clone(&body_sink)).await;
        let text = body_sink
            .extract_text(self.script_mode)
            .map_err(|poison| Poison::new(poison.into_exception().at(loc)))?;
        Ok(Value::from(text))
    }
}

/// Binary operators over resolved operands; errors are plain messages the
/// caller wraps with location.
fn apply_binop(op: BinOpKind, left: &Value, right: &Value) -> Result<Value, String> {
    use BinOpKind::{Add, Concat, Div, FloorDiv, In, Mod, Mul, NotIn, Pow, Sub};
    match op {
        Concat => Ok(Value::from(format!("{}{}", left.coerce_str(), right.coerce_str()))),
        In => Ok(Value::Bool(right.contains(left))),
        NotIn => Ok(Value::Bool(!right.contains(left))),
        Add => {
            if let (Value::Str(a), Value::Str(b)) = (left, right) {
                return Ok(Value::from(format!("{a}{b}")));
            }
            numeric_binop(left, right, "+", i64::checked_add, |a, b| a + b)
        }
        Sub => numeric_binop(left, right, "-", i64::checked_sub, |a, b| a - b),
        Mul => numeric_binop(left, right, "*", i64::checked_mul, |a, b| a * b),
        Div => {
            let (a, b) = both_numbers(left, right, "/")?;
            if b == 0.0 {
                return Err("division by zero".to_owned());
            }
            Ok(Value::Float(a / b))
        }
        FloorDiv => {
            let (a, b) = both_numbers(left, right, "//")?;
            if b == 0.0 {
                return Err("division by zero".to_owned());
            }
            Ok(Value::Int((a / b).floor() as i64))
        }
        Mod => {
            let (a, b) = both_numbers(left, right, "%")?;
            if b == 0.0 {
                return Err("modulo by zero".to_owned());
            }
            let result = a % b;
            match (left, right) {
                (Value::Int(_), Value::Int(_)) => Ok(Value::Int(result as i64)),
                _ => Ok(Value::Float(result)),
            }
        }
        Pow => {
            let (a, b) = both_numbers(left, right, "**")?;
            let result = a.powf(b);
            match (left, right) {
                (Value::Int(_), Value::Int(_)) if b >= 0.0 && result.abs() < i64::MAX as f64 => {
                    Ok(Value::Int(result as i64))
                }
                _ => Ok(Value::Float(result)),
            }
        }
        BinOpKind::And | BinOpKind::Or => unreachable!("short-circuit operators evaluated by caller"),
    }
}

fn numeric_binop(
    left: &Value,
    right: &Value,
    op: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, String> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => match int_op(*a, *b) {
            Some(result) => Ok(Value::Int(result)),
            None => Ok(Value::Float(float_op(*a as f64, *b as f64))),
        },
        _ => {
            let (a, b) = both_numbers(left, right, op)?;
            Ok(Value::Float(float_op(a, b)))
        }
    }
}

fn both_numbers(left: &Value, right: &Value, op: &str) -> Result<(f64, f64), String> {
    let a = match left {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        other => return Err(format!("cannot apply `{op}` to {}", other.type_name())),
    };
    let b = match right {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        other => return Err(format!("cannot apply `{op}` to {}", other.type_name())),
    };
    Ok((a, b))
}

fn compare_with(op: CmpOp, left: &Value, right: &Value) -> Result<bool, String> {
    match op {
        CmpOp::Eq => Ok(left.deep_eq(right)),
        CmpOp::Ne => Ok(!left.deep_eq(right)),
        _ => {
            let Some(ordering) = left.compare(right) else {
                return Err(format!("cannot compare {} with {}", left.type_name(), right.type_name()));
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            })
        }
    }
}
