#![doc = include_str!("../../../README.md")]

mod ast;
mod compile;
mod environment;
mod error;
mod eval;
mod extension;
mod filters;
mod frame;
mod handlers;
mod intern;
mod lexer;
mod loader;
mod parser;
mod render;
mod resource;
mod schedule;
mod script;
mod sequence;
mod tracer;
mod value;

pub use crate::{
    environment::Environment,
    error::{CodeLoc, ErrorKind, Exception},
    extension::Extension,
    handlers::{CommandHandler, DataMethodFn, Output},
    loader::{ChainLoader, Loader, MemoryLoader, TemplateSource},
    render::{
        CallResult, FnHost, HostCall, NoCallsHost, RenderHost, RenderOptions, RenderProgress, RenderState, Template,
    },
    resource::{
        DEFAULT_MAX_INCLUDE_DEPTH, LimitedTracker, NoLimitTracker, RenderLimits, ResourceError, ResourceTracker,
    },
    schedule::CallId,
    script::transpile,
    tracer::{NoopTracer, RecordingTracer, RenderTracer, StderrTracer, TraceEvent},
    value::{FuncValue, MacroValue, Value, ValueMap},
};
