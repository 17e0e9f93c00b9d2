//! SSRC → endpoint lookup with a small fast path.
//!
//! Forwarding loops touch the same few SSRCs back to back; three slots in
//! front of the hash map measurably shortens the hot path.

use std::collections::HashMap;

const FAST_SLOTS: usize = 3;

pub struct FastSsrcMap<V> {
    fast: [Option<(u32, V)>; FAST_SLOTS],
    /// Round-robin victim for fast-slot replacement.
    victim: usize,
    map: HashMap<u32, V>,
}

impl<V: Clone> Default for FastSsrcMap<V> {
    fn default() -> Self {
        Self {
            fast: [None, None, None],
            victim: 0,
            map: HashMap::new(),
        }
    }
}

impl<V: Clone> FastSsrcMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ssrc: u32, value: V) {
        self.invalidate_fast(ssrc);
        self.map.insert(ssrc, value);
    }

    pub fn remove(&mut self, ssrc: u32) -> Option<V> {
        self.invalidate_fast(ssrc);
        self.map.remove(&ssrc)
    }

    pub fn get(&mut self, ssrc: u32) -> Option<V> {
        for slot in self.fast.iter().flatten() {
            if slot.0 == ssrc {
                return Some(slot.1.clone());
            }
        }
        let value = self.map.get(&ssrc)?.clone();
        self.fast[self.victim] = Some((ssrc, value.clone()));
        self.victim = (self.victim + 1) % FAST_SLOTS;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn ssrcs(&self) -> Vec<u32> {
        self.map.keys().copied().collect()
    }

    fn invalidate_fast(&mut self, ssrc: u32) {
        for slot in self.fast.iter_mut() {
            if matches!(slot, Some((s, _)) if *s == ssrc) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_promotes_to_fast_slot() {
        let mut m = FastSsrcMap::new();
        m.insert(1, "a");
        m.insert(2, "b");
        assert_eq!(m.get(1), Some("a"));
        assert_eq!(m.get(1), Some("a")); // second hit comes from the slot
        assert_eq!(m.get(2), Some("b"));
        assert_eq!(m.get(3), None);
    }

    #[test]
    fn test_remove_invalidates_fast_slot() {
        let mut m = FastSsrcMap::new();
        m.insert(7, 70);
        assert_eq!(m.get(7), Some(70));
        m.remove(7);
        assert_eq!(m.get(7), None);
    }

    #[test]
    fn test_insert_overwrites_stale_slot() {
        let mut m = FastSsrcMap::new();
        m.insert(7, 70);
        assert_eq!(m.get(7), Some(70));
        m.insert(7, 71);
        assert_eq!(m.get(7), Some(71));
    }

    #[test]
    fn test_more_ssrcs_than_slots() {
        let mut m = FastSsrcMap::new();
        for i in 0..10u32 {
            m.insert(i, i * 10);
        }
        for i in 0..10u32 {
            assert_eq!(m.get(i), Some(i * 10));
        }
        assert_eq!(m.len(), 10);
    }
}
