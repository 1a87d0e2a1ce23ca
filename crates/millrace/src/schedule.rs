//! Per-render scheduling state: value slots, external calls, and sequence
//! locks.
//!
//! The runtime is single-threaded cooperative. Tasks suspend only by parking
//! on a *slot* (a shared future cell), on an external call the host has not
//! resolved yet, or on a sequence lock held by an earlier acquirer. Waking
//! pushes the render's root future back into the driver's poll loop.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use ahash::AHashMap;

use crate::{
    error::{Exception, Poison, RunResult},
    intern::{Interner, KeyId},
    value::Value,
};

/// Identifier of a value slot, for debug assertions and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub(crate) struct SlotId(u32);

/// Unique identifier for external calls (context functions, async filters,
/// template loads).
///
/// Sequential integers allocated by the scheduler; the host uses them to
/// correlate deferred calls with the results it later supplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CallId(u32);

impl CallId {
    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Resolved(Value),
    Poisoned(Poison),
}

/// A pending | resolved | poisoned value cell. Terminal once resolved or
/// poisoned; double resolution is a bug and panics in debug builds.
#[derive(Debug)]
pub(crate) struct Slot {
    id: SlotId,
    state: RefCell<SlotState>,
    wakers: RefCell<Vec<Waker>>,
}

impl Slot {
    fn resolve_state(&self, state: SlotState) {
        {
            let mut cur = self.state.borrow_mut();
            if !matches!(*cur, SlotState::Pending) {
                debug_assert!(false, "slot {:?} resolved twice", self.id);
                return;
            }
            *cur = state;
        }
        for waker in self.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    pub fn resolve(&self, value: Value) {
        self.resolve_state(SlotState::Resolved(value));
    }

    pub fn poison(&self, poison: Poison) {
        self.resolve_state(SlotState::Poisoned(poison));
    }

    pub fn complete(&self, result: RunResult<Value>) {
        match result {
            Ok(value) => self.resolve(value),
            Err(poison) => self.poison(poison),
        }
    }

    /// Non-blocking read; `None` while pending.
    pub fn try_get(&self) -> Option<RunResult<Value>> {
        match &*self.state.borrow() {
            SlotState::Pending => None,
            SlotState::Resolved(value) => Some(Ok(value.clone())),
            SlotState::Poisoned(poison) => Some(Err(poison.clone())),
        }
    }

    /// Awaits resolution. Poison propagates to the reader.
    pub fn get(self: Rc<Self>) -> SlotFuture {
        SlotFuture { slot: self }
    }
}

pub(crate) struct SlotFuture {
    slot: Rc<Slot>,
}

impl Future for SlotFuture {
    type Output = RunResult<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.slot.try_get() {
            return Poll::Ready(result);
        }
        self.slot.wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

/// What an external call asks of the host.
#[derive(Debug, Clone)]
pub(crate) enum CallKind {
    /// Call a context function at `path` with resolved arguments.
    Function { path: Vec<String>, args: Vec<Value> },
    /// Load a template body by name.
    Load { name: String },
}

/// An external call the evaluator has issued but the driver has not yet
/// surfaced to the host.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub call_id: CallId,
    pub kind: CallKind,
    pub slot: Rc<Slot>,
}

/// One FIFO ticket queue per lock key. The front ticket holds the lock.
#[derive(Debug, Default)]
struct LockQueue {
    tickets: VecDeque<Rc<Ticket>>,
}

#[derive(Debug, Default)]
struct Ticket {
    ready: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Ticket {
    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// Owned by one render; never shared across renders or environments.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    next_slot: Cell<u32>,
    next_call: Cell<u32>,
    /// Every live slot, for cancellation.
    slots: RefCell<Vec<Weak<Slot>>>,
    /// External calls not yet surfaced to the host.
    unreported: RefCell<VecDeque<PendingCall>>,
    /// External calls surfaced and deferred; resolved via `resolve_call`.
    outstanding: RefCell<AHashMap<u32, Rc<Slot>>>,
    locks: RefCell<AHashMap<KeyId, LockQueue>>,
    pub interner: Interner,
    cancelled: Cell<bool>,
}

impl Schedule {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Creates a pending slot registered for cancellation.
    pub fn new_slot(&self) -> Rc<Slot> {
        let id = SlotId(self.next_slot.get());
        self.next_slot.set(id.0 + 1);
        let slot = Rc::new(Slot {
            id,
            state: RefCell::new(SlotState::Pending),
            wakers: RefCell::new(Vec::new()),
        });
        self.slots.borrow_mut().push(Rc::downgrade(&slot));
        slot
    }

    /// Creates an already-resolved slot (context bindings, literals).
    pub fn resolved_slot(&self, value: Value) -> Rc<Slot> {
        let slot = self.new_slot();
        slot.resolve(value);
        slot
    }

    /// Issues an external call: the returned slot resolves when the host
    /// answers.
    pub fn push_call(&self, kind: CallKind) -> (CallId, Rc<Slot>) {
        let call_id = CallId(self.next_call.get());
        self.next_call.set(call_id.0 + 1);
        let slot = self.new_slot();
        self.unreported.borrow_mut().push_back(PendingCall { call_id, kind, slot: Rc::clone(&slot) });
        (call_id, slot)
    }

    /// Takes the oldest unreported call for the driver to surface.
    pub fn take_unreported(&self) -> Option<PendingCall> {
        self.unreported.borrow_mut().pop_front()
    }

    /// Marks a surfaced call as deferred; it now awaits `resolve_call`.
    pub fn defer(&self, call: PendingCall) {
        self.outstanding.borrow_mut().insert(call.call_id.0, call.slot);
    }

    /// Call ids of every deferred call still awaiting a result.
    pub fn outstanding_calls(&self) -> Vec<CallId> {
        let mut ids: Vec<u32> = self.outstanding.borrow().keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(CallId).collect()
    }

    /// Resolves a deferred call with the host-provided result.
    pub fn resolve_call(&self, call_id: CallId, result: RunResult<Value>) -> Result<(), Exception> {
        let Some(slot) = self.outstanding.borrow_mut().remove(&call_id.0) else {
            return Err(Exception::runtime(format!("unknown or already-resolved call id {}", call_id.0)));
        };
        slot.complete(result);
        Ok(())
    }

    /// Interns a lock key string.
    pub fn lock_key(&self, key: &str) -> KeyId {
        self.interner.intern(key)
    }

    fn enqueue_ticket(&self, key: KeyId) -> Rc<Ticket> {
        let mut locks = self.locks.borrow_mut();
        let queue = locks.entry(key).or_default();
        let ticket = Rc::new(Ticket::default());
        if queue.tickets.is_empty() {
            ticket.ready.set(true);
        }
        queue.tickets.push_back(Rc::clone(&ticket));
        ticket
    }

    fn release_lock(&self, key: KeyId) {
        let mut locks = self.locks.borrow_mut();
        let Some(queue) = locks.get_mut(&key) else { return };
        queue.tickets.pop_front();
        if let Some(next) = queue.tickets.front() {
            next.ready.set(true);
            next.wake();
        }
    }

    /// Aborts the render: every pending slot poisons with a cancellation
    /// error, held locks are released, and queued acquirers wake to observe
    /// the cancellation.
    pub fn cancel(&self) {
        if self.cancelled.replace(true) {
            return;
        }
        for weak in self.slots.borrow_mut().drain(..) {
            if let Some(slot) = weak.upgrade()
                && slot.try_get().is_none()
            {
                slot.poison(Poison::new(Exception::cancelled()));
            }
        }
        for (_, queue) in self.locks.borrow_mut().drain() {
            for ticket in queue.tickets {
                ticket.ready.set(true);
                ticket.wake();
            }
        }
        self.outstanding.borrow_mut().clear();
        self.unreported.borrow_mut().clear();
    }
}

/// Acquires the FIFO lock for `key`. The returned future enqueues its
/// ticket on first poll, so acquisition order equals first-poll order —
/// which the evaluator keeps equal to lexical order.
pub(crate) fn acquire(schedule: &Rc<Schedule>, key: KeyId) -> LockAcquire {
    LockAcquire { schedule: Rc::clone(schedule), key, ticket: None }
}

/// Future returned by [`acquire`].
pub(crate) struct LockAcquire {
    schedule: Rc<Schedule>,
    key: KeyId,
    ticket: Option<Rc<Ticket>>,
}

impl Future for LockAcquire {
    type Output = RunResult<LockGuard>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.schedule.is_cancelled() {
            return Poll::Ready(Err(Poison::new(Exception::cancelled())));
        }
        let ticket = match &self.ticket {
            Some(t) => Rc::clone(t),
            None => {
                let t = self.schedule.enqueue_ticket(self.key);
                self.ticket = Some(Rc::clone(&t));
                t
            }
        };
        if ticket.ready.get() {
            Poll::Ready(Ok(LockGuard {
                schedule: Rc::clone(&self.schedule),
                key: self.key,
                released: Cell::new(false),
            }))
        } else {
            *ticket.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// A held sequence lock. Must be released exactly once; dropping unreleased
/// releases as a safety net so a poisoned call site cannot wedge the queue.
pub(crate) struct LockGuard {
    schedule: Rc<Schedule>,
    key: KeyId,
    released: Cell<bool>,
}

impl LockGuard {
    pub fn release(self) {
        // Drop performs the actual release
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released.replace(true) && !self.schedule.is_cancelled() {
            self.schedule.release_lock(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Waker;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn slot_resolution_is_terminal() {
        let schedule = Schedule::new();
        let slot = schedule.new_slot();
        assert!(slot.try_get().is_none());
        slot.resolve(Value::Int(1));
        assert!(matches!(slot.try_get(), Some(Ok(Value::Int(1)))));
    }

    #[test]
    fn lock_is_fifo_in_first_poll_order() {
        let schedule = Schedule::new();
        let key = schedule.lock_key("s.op");

        let mut first = acquire(&schedule, key);
        let mut second = acquire(&schedule, key);

        let Poll::Ready(Ok(guard)) = poll_once(&mut first) else {
            panic!("first acquire should succeed immediately");
        };
        assert!(poll_once(&mut second).is_pending(), "second acquire must wait");

        guard.release();
        match poll_once(&mut second) {
            Poll::Ready(Ok(_)) => {}
            _ => panic!("second acquire should succeed after release"),
        }
    }

    #[test]
    fn independent_keys_do_not_serialize() {
        let schedule = Schedule::new();
        let a = schedule.lock_key("a");
        let b = schedule.lock_key("b");
        let mut first = acquire(&schedule, a);
        let mut second = acquire(&schedule, b);
        assert!(poll_once(&mut first).is_ready());
        assert!(poll_once(&mut second).is_ready());
    }

    #[test]
    fn cancellation_poisons_pending_slots_and_wakes_waiters() {
        let schedule = Schedule::new();
        let slot = schedule.new_slot();
        let key = schedule.lock_key("k");
        let mut held = acquire(&schedule, key);
        let Poll::Ready(Ok(_guard)) = poll_once(&mut held) else {
            panic!("acquire should succeed");
        };
        let mut waiting = acquire(&schedule, key);
        assert!(poll_once(&mut waiting).is_pending());

        schedule.cancel();
        match slot.try_get() {
            Some(Err(poison)) => assert!(poison.is_cancelled()),
            other => panic!("expected cancellation poison, got {other:?}"),
        }
        match poll_once(&mut waiting) {
            Poll::Ready(Err(poison)) => assert!(poison.is_cancelled()),
            _ => panic!("waiter should observe cancellation"),
        }
    }
}
