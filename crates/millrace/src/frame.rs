//! Lexical frames.
//!
//! A frame maps names to value slots. Frames are *persistent*: rebinding a
//! name produces a new frame head sharing the parent chain, so a task
//! spawned at one lexical position keeps seeing exactly the bindings that
//! were visible there, no matter how much later statements rebind. This is
//! what makes assignment visibility follow lexical order while statements
//! evaluate concurrently.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{schedule::Slot, value::Value};

#[derive(Debug)]
struct FrameData {
    vars: AHashMap<String, Rc<Slot>>,
    parent: Option<FrameHandle>,
}

/// A shared, immutable view of one frame chain position.
#[derive(Debug, Clone)]
pub struct FrameHandle(Rc<FrameData>);

impl FrameHandle {
    /// The root frame over resolved context bindings.
    pub(crate) fn root(bindings: impl IntoIterator<Item = (String, Rc<Slot>)>) -> Self {
        Self(Rc::new(FrameData {
            vars: bindings.into_iter().collect(),
            parent: None,
        }))
    }

    /// An empty child scope (loop body, macro body, capture body).
    pub(crate) fn child(&self) -> Self {
        Self(Rc::new(FrameData {
            vars: AHashMap::new(),
            parent: Some(self.clone()),
        }))
    }

    /// Rebinds `name` at the head, returning the new frame. The old frame is
    /// untouched; earlier captures keep reading the old slot.
    #[must_use]
    pub(crate) fn bind(&self, name: &str, slot: Rc<Slot>) -> Self {
        let mut vars = self.0.vars.clone();
        vars.insert(name.to_owned(), slot);
        Self(Rc::new(FrameData { vars, parent: self.0.parent.clone() }))
    }

    /// Rebinds several names at once.
    #[must_use]
    pub(crate) fn bind_many(&self, bindings: impl IntoIterator<Item = (String, Rc<Slot>)>) -> Self {
        let mut vars = self.0.vars.clone();
        for (name, slot) in bindings {
            vars.insert(name, slot);
        }
        Self(Rc::new(FrameData { vars, parent: self.0.parent.clone() }))
    }

    /// Resolves a name through the frame chain.
    pub(crate) fn lookup(&self, name: &str) -> Option<Rc<Slot>> {
        let mut frame = self;
        loop {
            if let Some(slot) = frame.0.vars.get(name) {
                return Some(Rc::clone(slot));
            }
            frame = frame.0.parent.as_ref()?;
        }
    }

    /// The head frame's own bindings; imports export these.
    pub(crate) fn local_bindings(&self) -> Vec<(String, Rc<Slot>)> {
        self.0.vars.iter().map(|(name, slot)| (name.clone(), Rc::clone(slot))).collect()
    }
}

/// Convenience for building root frames from plain values.
pub(crate) fn context_bindings(
    schedule: &crate::schedule::Schedule,
    ctx: Vec<(String, Value)>,
) -> Vec<(String, Rc<Slot>)> {
    ctx.into_iter().map(|(name, value)| (name, schedule.resolved_slot(value))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;

    #[test]
    fn rebinding_preserves_earlier_views() {
        let schedule = Schedule::new();
        let root = FrameHandle::root(context_bindings(&schedule, vec![("x".into(), Value::Int(1))]));
        let before = root.clone();
        let after = root.bind("x", schedule.resolved_slot(Value::Int(2)));

        let old = before.lookup("x").unwrap().try_get().unwrap().unwrap();
        let new = after.lookup("x").unwrap().try_get().unwrap().unwrap();
        assert!(old.deep_eq(&Value::Int(1)));
        assert!(new.deep_eq(&Value::Int(2)));
    }

    #[test]
    fn child_scopes_shadow_and_fall_through() {
        let schedule = Schedule::new();
        let root = FrameHandle::root(context_bindings(&schedule, vec![("x".into(), Value::Int(1))]));
        let child = root.child().bind("x", schedule.resolved_slot(Value::Int(9)));
        assert!(child.lookup("x").unwrap().try_get().unwrap().unwrap().deep_eq(&Value::Int(9)));
        assert_eq!(child.local_bindings().len(), 1);
        let grandchild = child.child();
        assert!(grandchild.local_bindings().is_empty());
        assert!(grandchild.lookup("x").unwrap().try_get().unwrap().unwrap().deep_eq(&Value::Int(9)));
    }
}
