//! Output scopes: per-scope command journals and the flush that assembles
//! the final artifacts.
//!
//! Every write — text chunk, data command, user-handler command — is
//! journaled in lexical order during evaluation, with pending argument slots
//! in place of values. Flush happens after the scope's tasks have settled:
//! it walks the journal in order, drops reverted writes, surfaces the first
//! un-absorbed poison, and only then applies commands. That gives the data
//! tree its program-order guarantee and makes `_revert` exact.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use ahash::AHashMap;

use crate::{
    error::{CodeLoc, Exception, Poison},
    handlers::{
        HandlerInstances, Output,
        data::{DataMethodFn, ResolvedSeg, SegPath, apply_command},
    },
    schedule::Slot,
    value::{Value, ValueMap},
};

/// One journaled path segment; dynamic segments hold their value slot.
#[derive(Debug, Clone)]
pub(crate) enum PathPart {
    Key(String),
    Last,
    Slot(Rc<Slot>),
}

#[derive(Debug)]
pub(crate) enum Entry {
    /// Literal template text.
    Literal(String),
    /// A `{{ expr }}` text chunk, resolved by its own task.
    Chunk(Rc<Slot>),
    /// A handler command with pending path/argument slots.
    Command {
        handler: String,
        method: String,
        path: Vec<PathPart>,
        args: Vec<Rc<Slot>>,
        loc: CodeLoc,
    },
    /// A child ordering region (branch body, loop iteration, statement
    /// task). Keeps lexical order while regions fill in concurrently.
    Nested(Rc<OutSink>),
    /// `_revert`: drops this scope's earlier writes for one handler, or for
    /// all when `handler` is `None`.
    Revert { handler: Option<String> },
}

/// The journal for one ordering region of an output scope.
#[derive(Debug, Default)]
pub(crate) struct OutSink {
    entries: RefCell<Vec<Entry>>,
    /// Set when a guard recovered over this region: poisoned writes inside
    /// are dropped instead of failing the render.
    absorbed: Cell<bool>,
    /// Reverts inside this region only drop writes journaled inside it.
    /// Guard regions set this so `_revert` in a recover arm restores the
    /// pre-guard handler state exactly.
    revert_barrier: Cell<bool>,
    /// Failures of tasks that produce no write (`do` statements and other
    /// effect-only regions).
    errors: RefCell<Vec<Poison>>,
}

impl OutSink {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn push_literal(&self, text: impl Into<String>) {
        self.entries.borrow_mut().push(Entry::Literal(text.into()));
    }

    pub fn push_chunk(&self, slot: Rc<Slot>) {
        self.entries.borrow_mut().push(Entry::Chunk(slot));
    }

    pub fn push_command(&self, handler: String, method: String, path: Vec<PathPart>, args: Vec<Rc<Slot>>, loc: CodeLoc) {
        self.entries.borrow_mut().push(Entry::Command { handler, method, path, args, loc });
    }

    pub fn push_revert(&self, handler: Option<String>) {
        self.entries.borrow_mut().push(Entry::Revert { handler });
    }

    /// Opens a child ordering region at the current journal position.
    pub fn nested(&self) -> Rc<Self> {
        let child = Self::new();
        self.entries.borrow_mut().push(Entry::Nested(Rc::clone(&child)));
        child
    }

    /// Marks this region recovered: poisoned writes inside no longer fail
    /// the render.
    pub fn absorb(&self) {
        self.absorbed.set(true);
    }

    /// Bounds reverts journaled inside this region to the region itself.
    pub fn set_revert_barrier(&self) {
        self.revert_barrier.set(true);
    }

    pub fn record_error(&self, poison: Poison) {
        self.errors.borrow_mut().push(poison);
    }

    /// Discards everything journaled in this region. Used when a child
    /// template's buffered output is superseded by `extends`.
    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
        self.errors.borrow_mut().clear();
    }

    /// Takes the region's text out as a string, leaving commands and reverts
    /// journaled in place. Macro bodies and filter blocks use this: their
    /// text becomes the call's value while their handler commands keep
    /// flowing to the enclosing scope.
    ///
    /// All chunks must be settled. A revert covering the text stream clears
    /// the text collected so far, mirroring flush semantics.
    pub fn extract_text(&self, script_mode: bool) -> Result<String, Poison> {
        let mut text = String::new();
        self.extract_text_into(script_mode, &mut text)?;
        Ok(text)
    }

    fn extract_text_into(&self, script_mode: bool, text: &mut String) -> Result<(), Poison> {
        let mut entries = self.entries.borrow_mut();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            match entry {
                Entry::Literal(chunk) => text.push_str(&chunk),
                Entry::Chunk(slot) => match slot.try_get() {
                    Some(Ok(value)) => {
                        if let Some(chunk) = value.coerce_text(script_mode) {
                            text.push_str(&chunk);
                        }
                    }
                    Some(Err(poison)) => {
                        if !self.absorbed.get() {
                            return Err(poison);
                        }
                    }
                    None => debug_assert!(false, "text chunk still pending at extraction"),
                },
                Entry::Nested(child) => {
                    child.extract_text_into(script_mode, text)?;
                    kept.push(Entry::Nested(child));
                }
                Entry::Revert { handler } => {
                    if matches!(handler.as_deref(), None | Some("text")) {
                        text.clear();
                    }
                    kept.push(Entry::Revert { handler });
                }
                other => kept.push(other),
            }
        }
        *entries = kept;
        Ok(())
    }

    /// First poison in this region, in journal order. Used by `guard` to
    /// decide whether to transfer to the recover arm.
    pub fn find_poison(&self) -> Option<Poison> {
        for entry in self.entries.borrow().iter() {
            match entry {
                Entry::Chunk(slot) => {
                    if let Some(Err(poison)) = slot.try_get() {
                        return Some(poison);
                    }
                }
                Entry::Command { path, args, .. } => {
                    for part in path {
                        if let PathPart::Slot(slot) = part
                            && let Some(Err(poison)) = slot.try_get()
                        {
                            return Some(poison);
                        }
                    }
                    for slot in args {
                        if let Some(Err(poison)) = slot.try_get() {
                            return Some(poison);
                        }
                    }
                }
                Entry::Nested(child) => {
                    if let Some(poison) = child.find_poison() {
                        return Some(poison);
                    }
                }
                Entry::Literal(_) | Entry::Revert { .. } => {}
            }
        }
        self.errors.borrow().first().cloned()
    }
}

/// A linearized journal item, after reverts and absorption.
enum Item {
    Text(String),
    /// A write whose value poisoned; removable by a later revert of its
    /// handler, fatal otherwise.
    PoisonedWrite { handler: String, poison: Poison },
    Command {
        handler: String,
        method: String,
        path: SegPath,
        args: Vec<Value>,
        loc: CodeLoc,
    },
    /// A task failure with no associated write; only guard absorption can
    /// drop it.
    Error(Poison),
}

/// Flushes one output scope into its [`Output`].
///
/// All of the scope's tasks must have settled; any slot still pending is an
/// engine bug.
pub(crate) fn flush_scope(
    sink: &OutSink,
    script_mode: bool,
    focus: Option<&str>,
    data_methods: &AHashMap<String, DataMethodFn>,
    instances: &HandlerInstances,
) -> Result<Output, Exception> {
    let mut items = Vec::new();
    linearize(sink, false, script_mode, &mut items);

    // surface the first surviving failure, in journal order
    for item in &items {
        match item {
            Item::PoisonedWrite { poison, .. } | Item::Error(poison) => {
                return Err(poison.cause().clone());
            }
            _ => {}
        }
    }

    let mut text = String::new();
    let mut data_root: Option<Value> = None;
    let mut commanded: Vec<String> = Vec::new();
    for item in items {
        match item {
            Item::Text(chunk) => text.push_str(&chunk),
            Item::Command { handler, method, path, args, loc } => {
                if handler == "data" {
                    let root = data_root.get_or_insert(Value::Undefined);
                    apply_command(root, &method, &path, &args, data_methods)
                        .map_err(|err| err.at(loc))?;
                } else {
                    let Some(instance) = instances.get(&handler) else {
                        return Err(Exception::runtime(format!("unknown output handler `{handler}`")).at(loc));
                    };
                    let path_values: Vec<Value> = path
                        .iter()
                        .map(|seg| match seg {
                            ResolvedSeg::Key(k) => Value::str(k),
                            ResolvedSeg::Index(i) => Value::Int(*i),
                            ResolvedSeg::Last => Value::str("[]"),
                        })
                        .collect();
                    instance.dispatch(&method, &path_values, &args).map_err(|err| err.at(loc))?;
                    if !commanded.contains(&handler) {
                        commanded.push(handler);
                    }
                }
            }
            Item::PoisonedWrite { .. } | Item::Error(_) => unreachable!("failures surfaced above"),
        }
    }

    match focus {
        Some("text") => Ok(Output::Text(text)),
        Some("data") => Ok(Output::Focused(data_root.unwrap_or_default())),
        Some(name) => {
            let Some(instance) = instances.get(name) else {
                return Err(Exception::runtime(format!("focus target `{name}` is not a registered handler")));
            };
            Ok(Output::Focused(instance.return_value().unwrap_or_default()))
        }
        None => {
            if data_root.is_none() && commanded.is_empty() {
                return Ok(Output::Text(text));
            }
            let mut container = ValueMap::new();
            container.insert("text".to_owned(), Value::from(text));
            if let Some(root) = data_root {
                container.insert("data".to_owned(), root);
            }
            for name in commanded {
                if let Some(value) = instances.get(&name).and_then(|instance| instance.return_value()) {
                    container.insert(name, value);
                }
            }
            Ok(Output::Container(container))
        }
    }
}

/// Walks the journal in order, resolving slots, applying reverts, and
/// dropping absorbed poisons.
fn linearize(sink: &OutSink, absorbed: bool, script_mode: bool, items: &mut Vec<Item>) {
    let absorbed = absorbed || sink.absorbed.get();
    for entry in sink.entries.borrow().iter() {
        match entry {
            Entry::Literal(text) => items.push(Item::Text(text.clone())),
            Entry::Chunk(slot) => match slot.try_get() {
                Some(Ok(value)) => {
                    // script mode drops plain dictionaries entirely
                    if let Some(text) = value.coerce_text(script_mode) {
                        items.push(Item::Text(text));
                    }
                }
                Some(Err(poison)) => {
                    if !absorbed {
                        items.push(Item::PoisonedWrite { handler: "text".to_owned(), poison });
                    }
                }
                None => debug_assert!(false, "text chunk still pending at flush"),
            },
            Entry::Command { handler, method, path, args, loc } => {
                match resolve_command(path, args) {
                    Ok((path, args)) => items.push(Item::Command {
                        handler: handler.clone(),
                        method: method.clone(),
                        path,
                        args,
                        loc: *loc,
                    }),
                    Err(poison) => {
                        if !absorbed {
                            items.push(Item::PoisonedWrite { handler: handler.clone(), poison });
                        }
                    }
                }
            }
            Entry::Nested(child) => {
                if child.revert_barrier.get() {
                    let mut local = Vec::new();
                    linearize(child, absorbed, script_mode, &mut local);
                    items.append(&mut local);
                } else {
                    linearize(child, absorbed, script_mode, items);
                }
            }
            Entry::Revert { handler } => {
                items.retain(|item| match item {
                    Item::Text(_) => !matches!(handler.as_deref(), None | Some("text")),
                    Item::Command { handler: h, .. } | Item::PoisonedWrite { handler: h, .. } => {
                        !(handler.is_none() || handler.as_deref() == Some(h))
                    }
                    Item::Error(_) => true,
                });
            }
        }
    }
    if !absorbed {
        for poison in sink.errors.borrow().iter() {
            items.push(Item::Error(poison.clone()));
        }
    }
}

/// Resolves a command's path and argument slots; the first poison wins.
fn resolve_command(path: &[PathPart], args: &[Rc<Slot>]) -> Result<(SegPath, Vec<Value>), Poison> {
    let mut segs = SegPath::with_capacity(path.len());
    for part in path {
        match part {
            PathPart::Key(key) => segs.push(ResolvedSeg::Key(key.clone())),
            PathPart::Last => segs.push(ResolvedSeg::Last),
            PathPart::Slot(slot) => {
                let value = slot.try_get().expect("path segment still pending at flush")?;
                match value {
                    Value::Int(i) => segs.push(ResolvedSeg::Index(i)),
                    Value::Str(s) => segs.push(ResolvedSeg::Key(s.to_string())),
                    other => {
                        return Err(Poison::new(Exception::runtime(format!(
                            "path segment must be a string or integer, found {}",
                            other.type_name()
                        ))));
                    }
                }
            }
        }
    }
    let mut values = Vec::with_capacity(args.len());
    for slot in args {
        values.push(slot.try_get().expect("command argument still pending at flush")?);
    }
    Ok((segs, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;

    fn flush(sink: &OutSink, focus: Option<&str>) -> Result<Output, Exception> {
        flush_scope(sink, false, focus, &crate::handlers::empty_methods(), &HandlerInstances::new())
    }

    #[test]
    fn text_chunks_concatenate_in_journal_order() {
        let schedule = Schedule::new();
        let sink = OutSink::new();
        sink.push_literal("a");
        let slot = schedule.new_slot();
        sink.push_chunk(Rc::clone(&slot));
        sink.push_literal("c");
        // resolution order does not matter, journal order does
        slot.resolve(Value::str("b"));
        let out = flush(&sink, None).unwrap();
        assert_eq!(out, Output::Text("abc".to_owned()));
    }

    #[test]
    fn nested_regions_keep_their_position() {
        let schedule = Schedule::new();
        let sink = OutSink::new();
        sink.push_literal("1");
        let inner = sink.nested();
        sink.push_literal("3");
        inner.push_chunk(schedule.resolved_slot(Value::str("2")));
        let out = flush(&sink, None).unwrap();
        assert_eq!(out, Output::Text("123".to_owned()));
    }

    #[test]
    fn revert_drops_prior_writes_only() {
        let schedule = Schedule::new();
        let sink = OutSink::new();
        sink.push_chunk(schedule.resolved_slot(Value::str("DROP")));
        sink.push_revert(Some("text".to_owned()));
        sink.push_chunk(schedule.resolved_slot(Value::str("KEEP")));
        let out = flush(&sink, None).unwrap();
        assert_eq!(out, Output::Text("KEEP".to_owned()));
    }

    #[test]
    fn revert_drops_poisoned_writes_too() {
        let schedule = Schedule::new();
        let sink = OutSink::new();
        let bad = schedule.new_slot();
        bad.poison(Poison::new(Exception::runtime("boom")));
        sink.push_chunk(bad);
        sink.push_revert(None);
        sink.push_literal("ok");
        let out = flush(&sink, None).unwrap();
        assert_eq!(out, Output::Text("ok".to_owned()));
    }

    #[test]
    fn unreverted_poison_fails_the_flush() {
        let schedule = Schedule::new();
        let sink = OutSink::new();
        let bad = schedule.new_slot();
        bad.poison(Poison::new(Exception::runtime("boom")));
        sink.push_chunk(bad);
        let err = flush(&sink, None).unwrap_err();
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn absorbed_regions_drop_poisons() {
        let schedule = Schedule::new();
        let sink = OutSink::new();
        let region = sink.nested();
        let bad = schedule.new_slot();
        bad.poison(Poison::new(Exception::runtime("boom")));
        region.push_chunk(bad);
        region.push_literal("kept");
        region.absorb();
        let out = flush(&sink, None).unwrap();
        assert_eq!(out, Output::Text("kept".to_owned()));
    }

    #[test]
    fn data_commands_apply_in_order_at_flush() {
        let schedule = Schedule::new();
        let sink = OutSink::new();
        sink.push_command(
            "data".to_owned(),
            "push".to_owned(),
            vec![PathPart::Key("log".to_owned())],
            vec![schedule.resolved_slot(Value::str("first"))],
            CodeLoc::new(1, 0),
        );
        sink.push_command(
            "data".to_owned(),
            "push".to_owned(),
            vec![PathPart::Key("log".to_owned())],
            vec![schedule.resolved_slot(Value::str("second"))],
            CodeLoc::new(2, 0),
        );
        let out = flush(&sink, Some("data")).unwrap();
        assert_eq!(out.to_json(), serde_json::json!({"log": ["first", "second"]}));
    }

    #[test]
    fn focus_text_projects_to_string() {
        let sink = OutSink::new();
        sink.push_literal("hello");
        sink.push_command(
            "data".to_owned(),
            "set".to_owned(),
            vec![PathPart::Key("x".to_owned())],
            vec![Schedule::new().resolved_slot(Value::Int(1))],
            CodeLoc::new(1, 0),
        );
        let out = flush(&sink, Some("text")).unwrap();
        assert_eq!(out, Output::Text("hello".to_owned()));
    }
}
