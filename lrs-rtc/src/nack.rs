//! Receiver-side loss tracking and sender-side retransmit buffering.

use std::collections::BTreeMap;

use rtp::sequence::{seq_distance, seq_newer};

/// Cap on how far one gap may open the list; larger jumps are treated as
/// a stream discontinuity.
const MAX_GAP: i32 = 512;
/// Entries never outlive this many microseconds.
pub const DEFAULT_MAX_AGE_US: i64 = 1_000_000;
pub const DEFAULT_MAX_TRIES: u8 = 5;

#[derive(Debug, Clone, Copy)]
struct LostEntry {
    first_seen_us: i64,
    last_sent_us: i64,
    tries: u8,
}

/// Receiver NACK list: sequence numbers declared lost, with retry
/// bookkeeping.
///
/// An entry leaves the list when the packet arrives, when `max_tries`
/// emissions happened, or when it exceeds `max_age`.
#[derive(Debug)]
pub struct NackList {
    lost: BTreeMap<u16, LostEntry>,
    highest: u16,
    started: bool,
    pub max_tries: u8,
    pub max_age_us: i64,
    /// Retransmits observed, for RR loss accounting.
    pub recovered: u64,
}

impl Default for NackList {
    fn default() -> Self {
        Self {
            lost: BTreeMap::new(),
            highest: 0,
            started: false,
            max_tries: DEFAULT_MAX_TRIES,
            max_age_us: DEFAULT_MAX_AGE_US,
            recovered: 0,
        }
    }
}

impl NackList {
    pub fn new(max_tries: u8, max_age_us: i64) -> Self {
        Self {
            max_tries,
            max_age_us,
            ..Default::default()
        }
    }

    /// Records an arrival; opens gap entries for skipped sequences.
    pub fn on_packet(&mut self, seq: u16, now_us: i64) {
        if !self.started {
            self.started = true;
            self.highest = seq;
            return;
        }
        if seq_newer(seq, self.highest) {
            let gap = seq_distance(seq, self.highest);
            if gap > MAX_GAP {
                // Discontinuity: resync rather than NACK half the space.
                self.lost.clear();
                self.highest = seq;
                return;
            }
            let mut missing = self.highest.wrapping_add(1);
            while missing != seq {
                self.lost.insert(
                    missing,
                    LostEntry {
                        first_seen_us: now_us,
                        last_sent_us: 0,
                        tries: 0,
                    },
                );
                missing = missing.wrapping_add(1);
            }
            self.highest = seq;
        } else if self.lost.remove(&seq).is_some() {
            self.recovered += 1;
        }
    }

    /// Collects sequences due for (re)transmission of a NACK. Called from
    /// the 20 ms tick; `rtt_us / 2` spaces retries.
    pub fn poll(&mut self, now_us: i64, rtt_us: i64) -> Vec<u16> {
        let spacing = (rtt_us / 2).max(20_000);
        let max_age = self.max_age_us;
        let max_tries = self.max_tries;

        let mut due = Vec::new();
        self.lost.retain(|&seq, e| {
            if now_us - e.first_seen_us > max_age {
                return false;
            }
            if e.tries >= max_tries {
                return false;
            }
            let since = if e.last_sent_us == 0 {
                now_us - e.first_seen_us
            } else {
                now_us - e.last_sent_us
            };
            if since >= spacing {
                e.tries += 1;
                e.last_sent_us = now_us;
                due.push(seq);
            }
            true
        });
        due
    }

    pub fn len(&self) -> usize {
        self.lost.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lost.is_empty()
    }

    pub fn clear(&mut self) {
        self.lost.clear();
    }
}

/// Sender-side ring of recently sent packets, indexed by sequence number.
pub struct SendBuffer {
    packets: Vec<Option<rtp::Packet>>,
    size: u16,
    highest_added: u16,
    started: bool,
}

impl SendBuffer {
    /// Size must be a power of 2 up to 32768.
    pub fn new(size: u16) -> Option<Self> {
        let is_valid = (0..=15).any(|i| size == 1 << i);
        if !is_valid {
            return None;
        }
        Some(Self {
            packets: vec![None; size as usize],
            size,
            highest_added: 0,
            started: false,
        })
    }

    pub fn add(&mut self, packet: rtp::Packet) {
        let seq = packet.header.sequence_number;
        if !self.started {
            self.packets[(seq % self.size) as usize] = Some(packet);
            self.highest_added = seq;
            self.started = true;
            return;
        }
        let diff = seq.wrapping_sub(self.highest_added);
        if diff == 0 {
            return;
        } else if diff < 0x8000 {
            // Clear slots skipped over so stale packets can't alias.
            let mut i = self.highest_added.wrapping_add(1);
            while i != seq {
                self.packets[(i % self.size) as usize] = None;
                i = i.wrapping_add(1);
            }
            self.highest_added = seq;
        }
        self.packets[(seq % self.size) as usize] = Some(packet);
    }

    /// A requested sequence no longer in the ring returns `None`; the
    /// caller drops the request silently.
    pub fn get(&self, seq: u16) -> Option<&rtp::Packet> {
        if !self.started {
            return None;
        }
        let diff = self.highest_added.wrapping_sub(seq);
        if diff >= 0x8000 || diff >= self.size {
            return None;
        }
        let packet = self.packets[(seq % self.size) as usize].as_ref()?;
        if packet.header.sequence_number != seq {
            return None;
        }
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_gap_opens_entries_and_arrival_closes() {
        let mut list = NackList::default();
        list.on_packet(100, 0);
        list.on_packet(101, 10);
        list.on_packet(103, 20); // 102 missing
        assert_eq!(list.len(), 1);
        list.on_packet(102, 30);
        assert!(list.is_empty());
        assert_eq!(list.recovered, 1);
    }

    #[test]
    fn test_poll_respects_rtt_spacing() {
        let mut list = NackList::default();
        list.on_packet(100, 0);
        list.on_packet(104, 0); // 101-103 missing
        // Too early: nothing due.
        assert!(list.poll(10_000, 40_000).is_empty());
        // Past rtt/2: all due.
        let due = list.poll(25_000, 40_000);
        assert_eq!(due, vec![101, 102, 103]);
        // Immediately again: nothing (retry spacing).
        assert!(list.poll(26_000, 40_000).is_empty());
    }

    #[test]
    fn test_max_tries_bounds_emissions() {
        let mut list = NackList::new(2, 60_000_000);
        list.on_packet(10, 0);
        list.on_packet(12, 0); // 11 missing
        let mut emissions = 0;
        let mut now = 0;
        for _ in 0..10 {
            now += 100_000;
            emissions += list.poll(now, 40_000).len();
        }
        assert_eq!(emissions, 2);
        assert!(list.is_empty());
    }

    #[test]
    fn test_max_age_expires_entries() {
        let mut list = NackList::new(200, 500_000);
        list.on_packet(10, 0);
        list.on_packet(12, 0);
        assert_eq!(list.poll(400_000, 40_000), vec![11]);
        assert!(list.poll(600_000, 40_000).is_empty());
        assert!(list.is_empty());
    }

    #[test]
    fn test_discontinuity_resync() {
        let mut list = NackList::default();
        list.on_packet(100, 0);
        list.on_packet(5000, 0);
        assert!(list.is_empty());
    }

    fn pkt(seq: u16) -> rtp::Packet {
        rtp::Packet {
            header: rtp::Header {
                sequence_number: seq,
                ..Default::default()
            },
            payload: Bytes::from(vec![seq as u8]),
        }
    }

    #[test]
    fn test_send_buffer_roundtrip_and_eviction() {
        let mut buf = SendBuffer::new(8).unwrap();
        for i in 0..8 {
            buf.add(pkt(i));
        }
        for i in 0..8 {
            assert!(buf.get(i).is_some());
        }
        buf.add(pkt(8));
        assert!(buf.get(0).is_none());
        assert!(buf.get(8).is_some());
    }

    #[test]
    fn test_send_buffer_invalid_size() {
        assert!(SendBuffer::new(0).is_none());
        assert!(SendBuffer::new(100).is_none());
        assert!(SendBuffer::new(1024).is_some());
    }

    #[test]
    fn test_send_buffer_wraparound() {
        let mut buf = SendBuffer::new(8).unwrap();
        buf.add(pkt(65534));
        buf.add(pkt(65535));
        buf.add(pkt(0));
        assert!(buf.get(65534).is_some());
        assert!(buf.get(0).is_some());
    }
}
