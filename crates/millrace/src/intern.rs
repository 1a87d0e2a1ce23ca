//! Lock-key interning.
//!
//! Sequence-lock keys are normalized path strings computed at compile time.
//! Interning them per render gives O(1) key equality and compact lock-table
//! indices.

use ahash::AHashMap;
use std::cell::RefCell;

/// Index of an interned lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct KeyId(u32);

impl KeyId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-render string interner for lock keys.
#[derive(Debug, Default)]
pub(crate) struct Interner {
    map: RefCell<AHashMap<String, u32>>,
    keys: RefCell<Vec<String>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `key`, returning the existing id when already present.
    pub fn intern(&self, key: &str) -> KeyId {
        if let Some(&id) = self.map.borrow().get(key) {
            return KeyId(id);
        }
        let mut keys = self.keys.borrow_mut();
        let id = u32::try_from(keys.len()).expect("lock key count fits u32");
        keys.push(key.to_owned());
        self.map.borrow_mut().insert(key.to_owned(), id);
        KeyId(id)
    }

    /// The interned string, for tracing and error messages.
    pub fn resolve(&self, id: KeyId) -> String {
        self.keys.borrow()[id.index()].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let interner = Interner::new();
        let a = interner.intern("s.op");
        let b = interner.intern("s.op");
        let c = interner.intern("s::op");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.resolve(a), "s.op");
        assert_eq!(interner.resolve(c), "s::op");
    }
}
