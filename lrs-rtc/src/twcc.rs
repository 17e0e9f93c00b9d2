//! Transport-wide congestion control recorder (receive side).
//!
//! Every RTP arrival carrying the TWCC extension is recorded; the 100 ms
//! tick turns the accumulated arrivals into one or more feedback packets.

use std::collections::BTreeMap;

use rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, RecvDelta, RunLengthChunk, StatusVectorChunk, SymbolSizeTypeTcc,
    SymbolTypeTcc, TransportLayerCc, TYPE_TCC_DELTA_SCALE_FACTOR,
};
use rtcp::RtcpPacket;

/// Limit statuses per feedback packet; more arrivals roll into the next
/// packet in the same batch.
pub const MAX_STATUSES_PER_FEEDBACK: usize = 1024;

/// Small deltas fit one unsigned byte in 250us units.
const MAX_SMALL_DELTA_US: i64 = 255 * TYPE_TCC_DELTA_SCALE_FACTOR;

#[derive(Debug)]
struct SequenceUnwrapper {
    last_unwrapped: Option<i64>,
}

impl SequenceUnwrapper {
    fn new() -> Self {
        Self {
            last_unwrapped: None,
        }
    }

    fn unwrap(&mut self, seq: u16) -> i64 {
        match self.last_unwrapped {
            None => {
                self.last_unwrapped = Some(seq as i64);
                seq as i64
            }
            Some(last) => {
                let mut diff = seq as i64 - (last & 0xFFFF);
                if diff > 0x8000 {
                    diff -= 0x10000;
                } else if diff < -0x8000 {
                    diff += 0x10000;
                }
                let unwrapped = last + diff;
                self.last_unwrapped = Some(unwrapped);
                unwrapped
            }
        }
    }
}

/// Records (twcc_seq, arrival) pairs and builds feedback.
#[derive(Debug)]
pub struct TwccRecorder {
    sender_ssrc: u32,
    media_ssrc: u32,
    unwrapper: SequenceUnwrapper,
    arrivals: BTreeMap<i64, i64>,
    next_report_seq: Option<i64>,
    fb_pkt_count: u8,
}

impl TwccRecorder {
    pub fn new(sender_ssrc: u32) -> Self {
        Self {
            sender_ssrc,
            media_ssrc: 0,
            unwrapper: SequenceUnwrapper::new(),
            arrivals: BTreeMap::new(),
            next_report_seq: None,
            fb_pkt_count: 0,
        }
    }

    /// Records one arrival. Only the first observation of a sequence
    /// counts; duplicates (our own retransmits echoed back) are dropped.
    pub fn record(&mut self, media_ssrc: u32, twcc_seq: u16, now_us: i64) {
        self.media_ssrc = media_ssrc;
        let seq = self.unwrapper.unwrap(twcc_seq);
        self.arrivals.entry(seq).or_insert(now_us);
        if self.next_report_seq.is_none() {
            self.next_report_seq = Some(seq);
        }
    }

    /// Builds feedback for everything recorded since the last call.
    pub fn build_feedback(&mut self) -> Vec<RtcpPacket> {
        let Some(mut start) = self.next_report_seq else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let end = match self.arrivals.keys().next_back() {
            Some(&last) => last + 1,
            None => return Vec::new(),
        };

        while start < end {
            let Some(fb) = self.build_one(&mut start, end) else {
                break;
            };
            out.push(RtcpPacket::TransportLayerCc(fb));
        }

        self.next_report_seq = Some(end);
        self.arrivals.clear();
        out
    }

    fn build_one(&mut self, start: &mut i64, end: i64) -> Option<TransportLayerCc> {
        // Base at the first received packet at or after start.
        let (&base_seq, &base_arrival) = self.arrivals.range(*start..).next()?;

        let reference_time_64ms = base_arrival / 64_000;
        let mut last_arrival_us = reference_time_64ms * 64_000;

        let mut symbols: Vec<SymbolTypeTcc> = Vec::new();
        let mut deltas: Vec<RecvDelta> = Vec::new();
        let mut seq = base_seq;
        while seq < end && symbols.len() < MAX_STATUSES_PER_FEEDBACK {
            match self.arrivals.get(&seq) {
                Some(&arrival) => {
                    let delta = arrival - last_arrival_us;
                    let symbol = if (0..=MAX_SMALL_DELTA_US).contains(&delta) {
                        SymbolTypeTcc::PacketReceivedSmallDelta
                    } else {
                        SymbolTypeTcc::PacketReceivedLargeDelta
                    };
                    symbols.push(symbol);
                    deltas.push(RecvDelta {
                        type_tcc_packet: symbol,
                        delta: (delta / TYPE_TCC_DELTA_SCALE_FACTOR) * TYPE_TCC_DELTA_SCALE_FACTOR,
                    });
                    last_arrival_us = arrival;
                }
                None => symbols.push(SymbolTypeTcc::PacketNotReceived),
            }
            seq += 1;
        }
        *start = seq;

        let fb = TransportLayerCc {
            sender_ssrc: self.sender_ssrc,
            media_ssrc: self.media_ssrc,
            base_sequence_number: (base_seq & 0xFFFF) as u16,
            packet_status_count: symbols.len() as u16,
            reference_time: reference_time_64ms as u32 & 0xFF_FFFF,
            fb_pkt_count: self.fb_pkt_count,
            packet_chunks: chunk_symbols(&symbols),
            recv_deltas: deltas,
        };
        self.fb_pkt_count = self.fb_pkt_count.wrapping_add(1);
        Some(fb)
    }
}

/// Packs symbols into run-length chunks where uniform, two-bit status
/// vectors otherwise.
fn chunk_symbols(symbols: &[SymbolTypeTcc]) -> Vec<PacketStatusChunk> {
    let mut chunks = Vec::new();
    let mut pos = 0;
    while pos < symbols.len() {
        // Length of the uniform run at pos.
        let sym = symbols[pos];
        let mut run = 1;
        while pos + run < symbols.len() && symbols[pos + run] == sym && run < 0x1FFF {
            run += 1;
        }
        if run >= 7 {
            chunks.push(PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                packet_status_symbol: sym,
                run_length: run as u16,
            }));
            pos += run;
        } else {
            let take = (symbols.len() - pos).min(7);
            let mut list = symbols[pos..pos + take].to_vec();
            // Short final vectors pad with not-received; the status count
            // in the header keeps the receiver from over-reading.
            while list.len() < 7 {
                list.push(SymbolTypeTcc::PacketNotReceived);
            }
            chunks.push(PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                symbol_size: SymbolSizeTypeTcc::TwoBit,
                symbol_list: list,
            }));
            pos += take;
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedbacks(recorder: &mut TwccRecorder) -> Vec<TransportLayerCc> {
        recorder
            .build_feedback()
            .into_iter()
            .map(|p| match p {
                RtcpPacket::TransportLayerCc(cc) => cc,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_contiguous_arrivals_one_feedback() {
        let mut rec = TwccRecorder::new(1);
        for i in 0..10u16 {
            rec.record(42, i, 1_000_000 + i as i64 * 1000);
        }
        let fbs = feedbacks(&mut rec);
        assert_eq!(fbs.len(), 1);
        let fb = &fbs[0];
        assert_eq!(fb.media_ssrc, 42);
        assert_eq!(fb.base_sequence_number, 0);
        assert_eq!(fb.packet_status_count, 10);
        assert_eq!(fb.recv_deltas.len(), 10);
    }

    #[test]
    fn test_loss_is_reported_not_received() {
        let mut rec = TwccRecorder::new(1);
        rec.record(42, 0, 1_000_000);
        rec.record(42, 2, 1_002_000); // 1 missing
        let fbs = feedbacks(&mut rec);
        assert_eq!(fbs.len(), 1);
        assert_eq!(fbs[0].packet_status_count, 3);
        assert_eq!(fbs[0].recv_deltas.len(), 2);
    }

    #[test]
    fn test_duplicate_arrival_ignored() {
        let mut rec = TwccRecorder::new(1);
        rec.record(42, 5, 1_000_000);
        rec.record(42, 5, 2_000_000);
        let fbs = feedbacks(&mut rec);
        assert_eq!(fbs[0].packet_status_count, 1);
    }

    #[test]
    fn test_more_than_1024_statuses_split() {
        let mut rec = TwccRecorder::new(1);
        for i in 0..1500u16 {
            rec.record(42, i, 1_000_000 + i as i64 * 100);
        }
        let fbs = feedbacks(&mut rec);
        assert_eq!(fbs.len(), 2);
        assert_eq!(fbs[0].packet_status_count, 1024);
        assert_eq!(fbs[1].packet_status_count as usize, 1500 - 1024);
        assert_eq!(fbs[0].fb_pkt_count, 0);
        assert_eq!(fbs[1].fb_pkt_count, 1);
    }

    #[test]
    fn test_feedback_counter_increments_across_batches() {
        let mut rec = TwccRecorder::new(1);
        rec.record(42, 0, 64_000);
        let _ = feedbacks(&mut rec);
        rec.record(42, 1, 128_000);
        let fbs = feedbacks(&mut rec);
        assert_eq!(fbs[0].fb_pkt_count, 1);
    }

    #[test]
    fn test_empty_recorder_builds_nothing() {
        let mut rec = TwccRecorder::new(1);
        assert!(rec.build_feedback().is_empty());
    }

    #[test]
    fn test_sequence_wrap() {
        let mut rec = TwccRecorder::new(1);
        rec.record(42, 65534, 1_000_000);
        rec.record(42, 65535, 1_001_000);
        rec.record(42, 0, 1_002_000);
        let fbs = feedbacks(&mut rec);
        assert_eq!(fbs.len(), 1);
        assert_eq!(fbs[0].base_sequence_number, 65534);
        assert_eq!(fbs[0].packet_status_count, 3);
    }
}
