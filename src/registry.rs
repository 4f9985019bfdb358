// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A registry mapping opaque correlation tokens to live wait contexts.
//!
//! Native callback APIs that only carry a pointer-sized value across the FFI
//! boundary get a token instead of a pointer. A callback that arrives after
//! its wait was torn down, or that carries a token whose slot has since been
//! reused, simply misses the lookup rather than touching freed or unrelated
//! state.

use parking_lot::Mutex;
use std::sync::Arc;

const INDEX_BITS: u32 = usize::BITS / 2;
const HALF_MASK: usize = (1 << INDEX_BITS) - 1;

/// An opaque token identifying a registered wait context.
///
/// Pointer-sized, so it survives the round trip through FFI fields such as
/// `sigev_value` on any target: the slot index lives in the low half and the
/// slot's generation in the high half, and a token whose slot has been
/// reused misses the lookup instead of aliasing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WaitToken(usize);

impl WaitToken {
    /// The token as a pointer-sized value, for squeezing through FFI fields
    /// such as `sigev_value`.
    pub fn to_raw(self) -> usize {
        self.0
    }

    /// Reconstitutes a token previously flattened with
    /// [`to_raw`](Self::to_raw).
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    fn index(&self) -> usize {
        self.0 & HALF_MASK
    }

    fn generation(&self) -> usize {
        self.0 >> INDEX_BITS
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: usize,
    value: Option<Arc<T>>,
}

/// A concurrency-safe slot map of live wait contexts.
#[derive(Debug)]
pub struct WaitRegistry<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> WaitRegistry<T> {
    /// Returns an empty registry, usable as a `static`.
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Registers `value`, returning the token that maps back to it.
    pub fn insert(&self, value: Arc<T>) -> WaitToken {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|slot| slot.value.is_none())
            .unwrap_or_else(|| {
                slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                slots.len() - 1
            });

        assert!(index <= HALF_MASK);
        let slot = &mut slots[index];
        slot.generation = (slot.generation + 1) & HALF_MASK;
        slot.value = Some(value);
        WaitToken((slot.generation << INDEX_BITS) | index)
    }

    /// Returns the context `token` maps to, if it is still registered.
    pub fn get(&self, token: WaitToken) -> Option<Arc<T>> {
        let slots = self.slots.lock();
        let slot = slots.get(token.index())?;
        if slot.generation != token.generation() {
            return None;
        }
        slot.value.clone()
    }

    /// Removes and returns the context `token` maps to, leaving the slot
    /// free for reuse under a new generation.
    pub fn remove(&self, token: WaitToken) -> Option<Arc<T>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(token.index())?;
        if slot.generation != token.generation() {
            return None;
        }
        slot.value.take()
    }
}

#[cfg(test)]
mod tests {
    use super::WaitRegistry;
    use super::WaitToken;
    use std::sync::Arc;

    #[test]
    fn insert_get_remove() {
        let registry = WaitRegistry::new();
        let token = registry.insert(Arc::new(5));
        assert_eq!(*registry.get(token).unwrap(), 5);
        assert_eq!(*registry.remove(token).unwrap(), 5);
        assert!(registry.get(token).is_none());
        assert!(registry.remove(token).is_none());
    }

    #[test]
    fn stale_token_misses_after_slot_reuse() {
        let registry = WaitRegistry::new();
        let first = registry.insert(Arc::new(1));
        registry.remove(first);

        // Same slot, new generation.
        let second = registry.insert(Arc::new(2));
        assert_ne!(first, second);
        assert!(registry.get(first).is_none());
        assert_eq!(*registry.get(second).unwrap(), 2);
    }

    #[test]
    fn round_trips_through_raw() {
        let registry = WaitRegistry::new();
        let token = registry.insert(Arc::new(()));
        let raw = token.to_raw();
        assert_eq!(WaitToken::from_raw(raw), token);
    }

    #[test]
    fn raw_form_preserves_generation_bits() {
        // The raw form is what actually crosses the FFI boundary, so the
        // generation half must survive it: a reconstituted stale token must
        // still miss while the live one still hits.
        let registry = WaitRegistry::new();
        let first = registry.insert(Arc::new(1));
        registry.remove(first);
        let second = registry.insert(Arc::new(2));

        let stale = WaitToken::from_raw(first.to_raw());
        let live = WaitToken::from_raw(second.to_raw());
        assert!(registry.get(stale).is_none());
        assert_eq!(*registry.get(live).unwrap(), 2);
    }

    #[test]
    fn concurrent_entries_are_distinct() {
        let registry = WaitRegistry::new();
        let a = registry.insert(Arc::new('a'));
        let b = registry.insert(Arc::new('b'));
        assert_ne!(a, b);
        assert_eq!(*registry.get(a).unwrap(), 'a');
        assert_eq!(*registry.get(b).unwrap(), 'b');
    }
}
