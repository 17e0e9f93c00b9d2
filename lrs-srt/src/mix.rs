//! DTS-ordered interleave queue for mix-correct mode.
//!
//! SRT ingests can deliver audio and video bursts out of interleave;
//! ordering by DTS behind a small readiness window fixes the mix before
//! the tags reach RTMP.

use std::collections::BTreeMap;

use crate::bridge::FlvTag;

/// Default readiness window in milliseconds.
pub const QUEUE_TIMEOUT_MS: i64 = 500;
/// Hard cap after which tags drain regardless of the window.
pub const QUEUE_MAX_LEN: usize = 100;

pub struct MixCorrectQueue {
    /// (dts, insert counter) keeps duplicate-DTS tags ordered by arrival.
    queue: BTreeMap<(u32, u64), FlvTag>,
    counter: u64,
    timeout_ms: i64,
    max_len: usize,
    mix_correct: bool,
    first_packet_dts: Option<i64>,
    first_local_ms: i64,
}

impl MixCorrectQueue {
    pub fn new(mix_correct: bool) -> Self {
        Self {
            queue: BTreeMap::new(),
            counter: 0,
            timeout_ms: QUEUE_TIMEOUT_MS,
            max_len: QUEUE_MAX_LEN,
            mix_correct,
            first_packet_dts: None,
            first_local_ms: 0,
        }
    }

    pub fn insert(&mut self, tag: FlvTag, now_ms: i64) {
        if self.first_packet_dts.is_none() {
            self.first_packet_dts = Some(tag.dts as i64);
            self.first_local_ms = now_ms;
        }
        let key = (tag.dts, self.counter);
        self.counter += 1;
        self.queue.insert(key, tag);
    }

    fn is_ready(&self, now_ms: i64) -> bool {
        if !self.mix_correct {
            return !self.queue.is_empty();
        }
        if self.queue.len() < 2 {
            return false;
        }
        if self.queue.len() >= self.max_len {
            return true;
        }
        let first_dts = match self.queue.keys().next() {
            Some(&(dts, _)) => dts as i64,
            None => return false,
        };
        let base = self.first_packet_dts.unwrap_or(first_dts);
        // Media time the head has aged relative to wall clock.
        let diff = (now_ms - self.first_local_ms) - (first_dts - base);
        diff >= self.timeout_ms
    }

    /// Pops the next tag in DTS order once the window allows.
    pub fn pop(&mut self, now_ms: i64) -> Option<FlvTag> {
        if !self.is_ready(now_ms) {
            return None;
        }
        let key = *self.queue.keys().next()?;
        self.queue.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains everything, window or not; used at teardown.
    pub fn flush(&mut self) -> Vec<FlvTag> {
        let drained = std::mem::take(&mut self.queue);
        drained.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::TagKind;
    use bytes::Bytes;

    fn tag(kind: TagKind, dts: u32) -> FlvTag {
        FlvTag {
            kind,
            dts,
            payload: Bytes::from_static(&[0]),
        }
    }

    #[test]
    fn test_passthrough_when_disabled() {
        let mut q = MixCorrectQueue::new(false);
        q.insert(tag(TagKind::Video, 100), 0);
        assert_eq!(q.pop(0).unwrap().dts, 100);
        assert!(q.pop(0).is_none());
    }

    #[test]
    fn test_orders_by_dts() {
        let mut q = MixCorrectQueue::new(true);
        q.insert(tag(TagKind::Video, 120), 0);
        q.insert(tag(TagKind::Audio, 100), 1);
        q.insert(tag(TagKind::Audio, 110), 2);

        // Window not elapsed yet.
        assert!(q.pop(10).is_none());

        // After the window, tags come out in DTS order.
        let mut dts = Vec::new();
        while let Some(t) = q.pop(2_000) {
            dts.push(t.dts);
        }
        // The final tag stays queued (size < 2 keeps the mixer primed).
        assert_eq!(dts, vec![100, 110]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_duplicate_dts_keeps_arrival_order() {
        let mut q = MixCorrectQueue::new(true);
        q.insert(tag(TagKind::Video, 100), 0);
        q.insert(tag(TagKind::Audio, 100), 0);
        q.insert(tag(TagKind::Audio, 200), 0);
        let first = q.pop(10_000).unwrap();
        let second = q.pop(10_000).unwrap();
        assert_eq!(first.kind, TagKind::Video);
        assert_eq!(second.kind, TagKind::Audio);
    }

    #[test]
    fn test_cap_forces_drain() {
        let mut q = MixCorrectQueue::new(true);
        for i in 0..QUEUE_MAX_LEN as u32 {
            q.insert(tag(TagKind::Audio, i), 0);
        }
        // Same instant, but the cap is hit.
        assert!(q.pop(0).is_some());
    }

    #[test]
    fn test_flush_drains_everything() {
        let mut q = MixCorrectQueue::new(true);
        q.insert(tag(TagKind::Audio, 2), 0);
        q.insert(tag(TagKind::Video, 1), 0);
        let all = q.flush();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].dts, 1);
        assert!(q.is_empty());
    }
}
