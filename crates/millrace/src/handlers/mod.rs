//! The output handler subsystem.
//!
//! Handlers are named recipients of output commands. Two are built in — the
//! `text` stream and the `data` assembler — and users register their own in
//! three shapes: a shared object, a per-render factory, or a plain callable.
//! Every output scope journals its commands and applies them in lexical
//! order at scope flush, which is also what makes `_revert` a pure journal
//! operation.

mod data;
mod scope;

pub use data::DataMethodFn;
pub(crate) use data::{ResolvedSeg, SegPath, apply_command, empty_methods};
pub(crate) use scope::{OutSink, PathPart, flush_scope};

use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;

use crate::{
    error::Exception,
    value::{Value, ValueMap},
};

/// A user-registered command handler.
///
/// `path` carries the property segments between the handler name and the
/// method (`@handler.prop.method(x)` dispatches `method` with path
/// `["prop"]`); `method` is empty for the callable form (`@handler(x)`).
///
/// Reverts are journal-level: a `_revert` drops this handler's journaled
/// commands for the scope before they are ever dispatched. A handler that
/// performs external side effects per command cannot have those rolled back
/// and should buffer internally if it needs revert fidelity.
pub trait CommandHandler {
    fn command(&mut self, method: &str, path: &[Value], args: &[Value]) -> Result<(), Exception>;

    /// The artifact contributed to the render output under this handler's
    /// name; `None` contributes nothing.
    fn return_value(&self) -> Option<Value> {
        None
    }
}

/// How a handler was registered on the environment.
#[derive(Clone)]
pub(crate) enum HandlerReg {
    /// A shared object; all renders dispatch into the same instance.
    Object(Rc<RefCell<dyn CommandHandler>>),
    /// A factory; each render constructs a fresh instance.
    Factory(Rc<dyn Fn() -> Box<dyn CommandHandler>>),
    /// A callable; `@name(args)` invokes it, and the values it returns are
    /// collected in order as the handler's artifact.
    Callable(Rc<dyn Fn(&[Value]) -> Result<Value, Exception>>),
}

impl std::fmt::Debug for HandlerReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Object(_) => "Object",
            Self::Factory(_) => "Factory",
            Self::Callable(_) => "Callable",
        };
        f.write_str(label)
    }
}

/// A handler's per-render incarnation.
pub(crate) enum HandlerInstance {
    Shared(Rc<RefCell<dyn CommandHandler>>),
    Owned(RefCell<Box<dyn CommandHandler>>),
    Callable {
        func: Rc<dyn Fn(&[Value]) -> Result<Value, Exception>>,
        results: RefCell<Vec<Value>>,
    },
}

impl HandlerInstance {
    pub(crate) fn from_reg(reg: &HandlerReg) -> Self {
        match reg {
            HandlerReg::Object(obj) => Self::Shared(Rc::clone(obj)),
            HandlerReg::Factory(factory) => Self::Owned(RefCell::new(factory())),
            HandlerReg::Callable(func) => Self::Callable { func: Rc::clone(func), results: RefCell::new(Vec::new()) },
        }
    }

    pub(crate) fn dispatch(&self, method: &str, path: &[Value], args: &[Value]) -> Result<(), Exception> {
        match self {
            Self::Shared(obj) => obj.borrow_mut().command(method, path, args),
            Self::Owned(obj) => obj.borrow_mut().command(method, path, args),
            Self::Callable { func, results } => {
                if !method.is_empty() || !path.is_empty() {
                    return Err(Exception::runtime(format!(
                        "callable handler does not support method dispatch (`{method}`)"
                    )));
                }
                let value = func(args)?;
                results.borrow_mut().push(value);
                Ok(())
            }
        }
    }

    pub(crate) fn return_value(&self) -> Option<Value> {
        match self {
            Self::Shared(obj) => obj.borrow().return_value(),
            Self::Owned(obj) => obj.borrow().return_value(),
            Self::Callable { results, .. } => {
                let results = results.borrow();
                match results.len() {
                    0 => None,
                    1 => Some(results[0].clone()),
                    _ => Some(Value::array(results.clone())),
                }
            }
        }
    }
}

/// Per-render user handler instances, in registration order.
pub(crate) type HandlerInstances = IndexMap<String, HandlerInstance>;

/// The frozen result of a render (or of one capture scope).
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// The concatenated text stream: produced when the render used no
    /// handler beyond `text`, or under `focus="text"`.
    Text(String),
    /// A single handler's artifact, projected by a focus directive.
    Focused(Value),
    /// The full container mapping handler names to artifacts.
    Container(ValueMap),
}

impl Output {
    /// The text artifact, if any.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Focused(Value::Str(s)) => Some(s.as_ref()),
            Self::Container(map) => match map.get("text") {
                Some(Value::Str(s)) => Some(s.as_ref()),
                _ => None,
            },
            Self::Focused(_) => None,
        }
    }

    /// The data assembler's root, if any.
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Focused(value) => Some(value),
            Self::Container(map) => map.get("data"),
            Self::Text(_) => None,
        }
    }

    /// A named handler's artifact from the container form.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Container(map) => map.get(name),
            _ => None,
        }
    }

    /// Collapses into a plain value: capture assignments bind this.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Text(s) => Value::from(s),
            Self::Focused(value) => value,
            Self::Container(map) => Value::dict(map),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Focused(value) => value.to_json(),
            Self::Container(map) => {
                serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }
}
