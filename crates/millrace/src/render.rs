//! The render driving API.
//!
//! The host acts as the event loop. [`Template::start`] begins a render and
//! returns a [`RenderProgress`]: the render pauses whenever it needs an
//! external effect — a context function call, an async filter, a template
//! load — and the host resumes it with results, immediately
//! ([`RenderState::resume_call`]) or later in any order
//! ([`RenderState::run_pending`] then [`RenderState::resume`]). Between
//! pauses the engine keeps evaluating everything not data- or
//! lock-dependent on the deferred calls.

use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Wake, Waker},
};

use crate::{
    compile::CompiledTemplate,
    environment::RenderEnv,
    error::{Exception, Poison},
    eval::Interp,
    handlers::Output,
    loader::{Loader, TemplateSource},
    resource::{NoLimitTracker, ResourceTracker},
    schedule::{CallId, CallKind, PendingCall, Schedule},
    tracer::RenderTracer,
    value::{Value, ValueMap},
};

/// Per-render options.
#[derive(Default)]
pub struct RenderOptions {
    /// Observer for scheduling events.
    pub tracer: Option<Rc<RefCell<dyn RenderTracer>>>,
    /// Resource limiter; defaults to [`NoLimitTracker`].
    pub tracker: Option<Rc<RefCell<dyn ResourceTracker>>>,
}

impl RenderOptions {
    #[must_use]
    pub fn with_tracer(mut self, tracer: Rc<RefCell<dyn RenderTracer>>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: Rc<RefCell<dyn ResourceTracker>>) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

/// How the host answers a function call.
#[derive(Debug, Clone)]
pub enum CallResult {
    /// The call succeeded with this value.
    Return(Value),
    /// The call failed; the message becomes a runtime poison at the call
    /// site.
    Raise(String),
}

/// A compiled template bound to its environment snapshot.
pub struct Template {
    compiled: Rc<CompiledTemplate>,
    env: Rc<RenderEnv>,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template").field("compiled", &self.compiled).finish_non_exhaustive()
    }
}

impl Template {
    pub(crate) fn new(compiled: Rc<CompiledTemplate>, env: Rc<RenderEnv>) -> Self {
        Self { compiled, env }
    }

    /// The template's reported name, if it has one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.compiled.name.as_deref()
    }

    /// Begins a render over the given context bindings.
    ///
    /// # Errors
    /// Returns `Exception` when the render fails before its first pause.
    pub fn start(&self, ctx: Vec<(String, Value)>, opts: RenderOptions) -> Result<RenderProgress, Exception> {
        let schedule = Schedule::new();
        let tracker: Rc<RefCell<dyn ResourceTracker>> = match opts.tracker {
            Some(tracker) => tracker,
            None => Rc::new(RefCell::new(NoLimitTracker)),
        };
        let interp = Interp::new(
            Rc::clone(&self.env),
            Rc::clone(&schedule),
            self.compiled.script_mode,
            opts.tracer,
            tracker,
        );
        let root: Pin<Box<dyn Future<Output = Result<Output, Exception>>>> =
            Box::pin(interp.render_root(Rc::clone(&self.compiled), ctx));
        let flag = Arc::new(WakeFlag::default());
        let waker = Waker::from(Arc::clone(&flag));
        RenderState { schedule, root, flag, waker }.drive()
    }
}

/// Wakes by flagging the driver loop to poll again.
#[derive(Default)]
struct WakeFlag(AtomicBool);

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// One step of a paused render.
pub enum RenderProgress {
    /// The evaluator called a context function (or async filter/extension;
    /// see the path prefix). Resolve now with
    /// [`RenderState::resume_call`], or defer with
    /// [`RenderState::run_pending`] and answer later.
    FunctionCall {
        call_id: CallId,
        path: Vec<String>,
        args: Vec<Value>,
        state: RenderState,
    },
    /// `include`/`extends`/`import` needs a template body; answer with
    /// [`RenderState::resume_load`].
    LoadTemplate {
        call_id: CallId,
        name: String,
        state: RenderState,
    },
    /// No task can advance until at least one deferred call resolves.
    ResolveFutures(RenderState),
    /// The render finished.
    Complete(Output),
}

impl RenderProgress {
    /// Unwraps `Complete`, for hosts that resolve everything synchronously.
    pub fn into_complete(self) -> Result<Output, Self> {
        match self {
            Self::Complete(output) => Ok(output),
            other => Err(other),
        }
    }
}

impl std::fmt::Debug for RenderProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FunctionCall { call_id, path, .. } => {
                write!(f, "FunctionCall({call_id:?}, {})", path.join("."))
            }
            Self::LoadTemplate { call_id, name, .. } => write!(f, "LoadTemplate({call_id:?}, {name})"),
            Self::ResolveFutures(state) => write!(f, "ResolveFutures({} pending)", state.pending_call_ids().len()),
            Self::Complete(output) => write!(f, "Complete({output:?})"),
        }
    }
}

/// A paused render. Every resume method consumes the state and drives to
/// the next pause or completion.
pub struct RenderState {
    schedule: Rc<Schedule>,
    root: Pin<Box<dyn Future<Output = Result<Output, Exception>>>>,
    flag: Arc<WakeFlag>,
    waker: Waker,
}

impl RenderState {
    /// Call ids of every deferred call still awaiting a result.
    #[must_use]
    pub fn pending_call_ids(&self) -> Vec<CallId> {
        self.schedule.outstanding_calls()
    }

    /// Continues without resolving the just-surfaced call; it stays pending
    /// and unrelated work proceeds.
    pub fn run_pending(self) -> Result<RenderProgress, Exception> {
        self.drive()
    }

    /// Resolves one deferred call and continues.
    pub fn resume_call(self, call_id: CallId, result: CallResult) -> Result<RenderProgress, Exception> {
        self.schedule.resolve_call(call_id, call_result_to_run(result))?;
        self.drive()
    }

    /// Resolves a batch of deferred calls, in any order, and continues.
    pub fn resume(self, results: Vec<(CallId, CallResult)>) -> Result<RenderProgress, Exception> {
        for (call_id, result) in results {
            self.schedule.resolve_call(call_id, call_result_to_run(result))?;
        }
        self.drive()
    }

    /// Answers a template load; `None` means not found (`include ignore
    /// missing` tolerates it, everything else fails).
    pub fn resume_load(self, call_id: CallId, source: Option<TemplateSource>) -> Result<RenderProgress, Exception> {
        let value = match source {
            Some(TemplateSource { source, path }) => {
                let mut map = ValueMap::new();
                map.insert("source".to_owned(), Value::from(source));
                map.insert("path".to_owned(), Value::from(path));
                Value::dict(map)
            }
            None => Value::Undefined,
        };
        self.schedule.resolve_call(call_id, Ok(value))?;
        self.drive()
    }

    /// Aborts the render: every pending slot poisons with a cancellation
    /// error and held sequence locks are released. Returns the surfaced
    /// cancellation.
    pub fn cancel(mut self) -> Exception {
        self.schedule.cancel();
        // drain the root future so tasks observe the cancellation
        let mut cx = Context::from_waker(&self.waker);
        match self.root.as_mut().poll(&mut cx) {
            Poll::Ready(Err(exc)) => exc,
            Poll::Ready(Ok(_)) | Poll::Pending => Exception::cancelled(),
        }
    }

    /// Polls the root future until it completes or genuinely needs the
    /// host: the next unreported external call is surfaced as a pause, and
    /// when only deferred calls remain the state is returned as
    /// `ResolveFutures`.
    fn drive(mut self) -> Result<RenderProgress, Exception> {
        loop {
            self.flag.0.store(false, Ordering::Relaxed);
            let mut cx = Context::from_waker(&self.waker);
            match self.root.as_mut().poll(&mut cx) {
                Poll::Ready(Ok(output)) => return Ok(RenderProgress::Complete(output)),
                Poll::Ready(Err(exc)) => return Err(exc),
                Poll::Pending => {
                    if let Some(call) = self.schedule.take_unreported() {
                        let PendingCall { call_id, kind, slot } = call;
                        self.schedule.defer(PendingCall { call_id, kind: kind.clone(), slot });
                        return Ok(match kind {
                            CallKind::Function { path, args } => {
                                RenderProgress::FunctionCall { call_id, path, args, state: self }
                            }
                            CallKind::Load { name } => RenderProgress::LoadTemplate { call_id, name, state: self },
                        });
                    }
                    if self.flag.0.load(Ordering::Relaxed) {
                        continue;
                    }
                    if !self.pending_call_ids().is_empty() {
                        return Ok(RenderProgress::ResolveFutures(self));
                    }
                    return Err(Exception::runtime(
                        "render stalled: no runnable task and no pending external call",
                    ));
                }
            }
        }
    }
}

fn call_result_to_run(result: CallResult) -> Result<Value, Poison> {
    match result {
        CallResult::Return(value) => Ok(value),
        CallResult::Raise(message) => Err(Poison::new(Exception::runtime(message))),
    }
}

/// A view of one surfaced function call, for [`FnHost`] callbacks.
pub struct HostCall<'a> {
    path: &'a [String],
    args: &'a [Value],
}

impl HostCall<'_> {
    #[must_use]
    pub fn path(&self) -> &[String] {
        self.path
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        self.args
    }
}

/// Answers the external effects of a render driven by the convenience entry
/// points.
pub trait RenderHost {
    /// Answer a context function call (or async filter/extension dispatch).
    fn call(&mut self, path: &[String], args: &[Value]) -> CallResult;

    /// Answer a template load. The default defers to the environment's
    /// loader.
    fn load(&mut self, name: &str) -> Option<TemplateSource> {
        let _ = name;
        None
    }
}

/// The simplest host: a single callback for function calls.
pub struct FnHost<F> {
    func: F,
}

impl<F> FnHost<F>
where
    F: FnMut(&HostCall<'_>) -> Result<Value, Exception>,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> RenderHost for FnHost<F>
where
    F: FnMut(&HostCall<'_>) -> Result<Value, Exception>,
{
    fn call(&mut self, path: &[String], args: &[Value]) -> CallResult {
        match (self.func)(&HostCall { path, args }) {
            Ok(value) => CallResult::Return(value),
            Err(exc) => CallResult::Raise(exc.message),
        }
    }
}

/// A host that rejects every call; for templates with no external effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallsHost;

impl RenderHost for NoCallsHost {
    fn call(&mut self, path: &[String], _args: &[Value]) -> CallResult {
        CallResult::Raise(format!("no host function registered for `{}`", path.join(".")))
    }
}

/// Drives a render to completion with a synchronous host, using `loader`
/// for any loads the host declines.
pub(crate) fn drive_with_host(
    template: &Template,
    ctx: Vec<(String, Value)>,
    opts: RenderOptions,
    host: &mut dyn RenderHost,
    loader: Option<&dyn Loader>,
) -> Result<Output, Exception> {
    let mut progress = template.start(ctx, opts)?;
    loop {
        progress = match progress {
            RenderProgress::Complete(output) => return Ok(output),
            RenderProgress::FunctionCall { call_id, path, args, state } => {
                let result = host.call(&path, &args);
                state.resume_call(call_id, result)?
            }
            RenderProgress::LoadTemplate { call_id, name, state } => {
                let found = host.load(&name).or_else(|| loader.and_then(|l| l.load(&name)));
                state.resume_load(call_id, found)?
            }
            RenderProgress::ResolveFutures(_) => {
                return Err(Exception::runtime("synchronous host left calls unresolved"));
            }
        };
    }
}
