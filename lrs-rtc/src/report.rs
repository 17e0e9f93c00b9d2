//! SR/RR/XR bookkeeping and RTT estimation.

use std::time::Instant;

use rtcp::extended_report::{DlrrReport, ExtendedReport, ReportBlock, RrtrBlock};
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use shared::time::{compact_ntp, SystemInstant};

/// Receive-side statistics for one SSRC, feeding RR blocks.
#[derive(Debug, Default)]
pub struct RecvStats {
    pub ssrc: u32,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
    highest_seq: u16,
    cycles: u32,
    base_seq: u16,
    started: bool,
    jitter_q4: u32,
    last_transit: i64,
    /// (middle 32 NTP bits, arrival monotonic us) of the last SR.
    last_sr: Option<(u32, i64)>,
}

impl RecvStats {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    pub fn on_packet(&mut self, seq: u16, rtp_ts: u32, clock_rate: u32, now_us: i64) {
        if !self.started {
            self.started = true;
            self.base_seq = seq;
            self.highest_seq = seq;
        } else if seq != self.highest_seq && seq.wrapping_sub(self.highest_seq) < 0x8000 {
            if seq < self.highest_seq {
                self.cycles += 1;
            }
            self.highest_seq = seq;
        }
        self.received += 1;

        // Interarrival jitter per RFC 3550 A.8, in 1/16 units.
        if clock_rate > 0 {
            let transit = now_us * clock_rate as i64 / 1_000_000 - rtp_ts as i64;
            let d = (transit - self.last_transit).unsigned_abs().min(u32::MAX as u64) as u32;
            if self.last_transit != 0 {
                self.jitter_q4 = self.jitter_q4 + d.saturating_sub(self.jitter_q4 / 16);
            }
            self.last_transit = transit;
        }
    }

    pub fn on_sender_report(&mut self, ntp_time: u64, now_us: i64) {
        self.last_sr = Some((compact_ntp(ntp_time), now_us));
    }

    /// Builds the RR block, resetting the interval counters.
    pub fn report_block(&mut self, now_us: i64) -> ReceptionReport {
        let extended_highest = ((self.cycles as u64) << 16) | self.highest_seq as u64;
        let expected = extended_highest.wrapping_sub(self.base_seq as u64) + 1;
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval * 256) / expected_interval).min(255) as u8
        };
        self.expected_prior = expected;
        self.received_prior = self.received;

        let total_lost = expected.saturating_sub(self.received).min(0xFF_FFFF) as u32;
        let (last_sender_report, delay) = match self.last_sr {
            Some((ntp, arrival)) => {
                let delay_us = (now_us - arrival).max(0);
                (ntp, (delay_us * 65536 / 1_000_000) as u32)
            }
            None => (0, 0),
        };

        ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            total_lost,
            last_sequence_number: extended_highest as u32,
            jitter: self.jitter_q4 / 16,
            last_sender_report,
            delay,
        }
    }
}

/// Send-side statistics for one SSRC, feeding SRs.
#[derive(Default)]
pub struct SendStats {
    pub ssrc: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub clock_rate: u32,
    last_rtp_ts: u32,
}

impl SendStats {
    pub fn new(ssrc: u32, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate,
            ..Default::default()
        }
    }

    pub fn on_packet(&mut self, rtp_ts: u32, payload_len: usize) {
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload_len as u32);
        self.last_rtp_ts = rtp_ts;
    }

    pub fn build_sr(&self, epoch: &SystemInstant, now: Instant) -> SenderReport {
        SenderReport {
            ssrc: self.ssrc,
            ntp_time: epoch.ntp(now),
            rtp_time: self.last_rtp_ts,
            packet_count: self.packet_count,
            octet_count: self.octet_count,
            reports: Vec::new(),
            profile_extensions: bytes::Bytes::new(),
        }
    }
}

/// Smoothed RTT from RR/DLRR responses.
#[derive(Debug, Default)]
pub struct RttEstimator {
    srtt_us: Option<i64>,
}

impl RttEstimator {
    /// `last_sr`/`delay` echoed by the peer against our compact NTP now.
    pub fn on_report(&mut self, now_compact_ntp: u32, last_sr: u32, delay_1_65536s: u32) {
        if last_sr == 0 {
            return;
        }
        let total = now_compact_ntp.wrapping_sub(last_sr);
        let rtt_compact = total.saturating_sub(delay_1_65536s);
        // 1/65536s units to microseconds.
        let rtt_us = rtt_compact as i64 * 1_000_000 / 65_536;
        self.srtt_us = Some(match self.srtt_us {
            Some(prev) => (prev * 7 + rtt_us) / 8,
            None => rtt_us,
        });
    }

    pub fn rtt_us(&self) -> i64 {
        self.srtt_us.unwrap_or(100_000)
    }
}

/// Builds the RR for a set of receive tracks, with an RRTR block so the
/// peer can answer with DLRR.
pub fn build_rr(
    sender_ssrc: u32,
    stats: &mut [&mut RecvStats],
    epoch: &SystemInstant,
    now: Instant,
    now_us: i64,
) -> (ReceiverReport, ExtendedReport) {
    let reports = stats.iter_mut().map(|s| s.report_block(now_us)).collect();
    let rr = ReceiverReport {
        ssrc: sender_ssrc,
        reports,
        profile_extensions: bytes::Bytes::new(),
    };
    let xr = ExtendedReport {
        ssrc: sender_ssrc,
        blocks: vec![ReportBlock::Rrtr(RrtrBlock {
            ntp_time: epoch.ntp(now),
        })],
    };
    (rr, xr)
}

/// Answers a peer RRTR with a DLRR block.
pub fn build_dlrr(sender_ssrc: u32, peer_ssrc: u32, rrtr_ntp: u64, delay_us: i64) -> ExtendedReport {
    ExtendedReport {
        ssrc: sender_ssrc,
        blocks: vec![ReportBlock::Dlrr(vec![DlrrReport {
            ssrc: peer_ssrc,
            last_rr: compact_ntp(rrtr_ntp),
            dlrr: (delay_us * 65536 / 1_000_000) as u32,
        }])],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_fraction() {
        let mut s = RecvStats::new(5);
        for seq in [0u16, 1, 2, 3, 5, 6, 7, 9] {
            s.on_packet(seq, seq as u32 * 3000, 90_000, seq as i64 * 10_000);
        }
        let block = s.report_block(100_000);
        // expected 10 (0..=9), received 8
        assert_eq!(block.total_lost, 2);
        assert!(block.fraction_lost > 0);
        assert_eq!(block.last_sequence_number, 9);

        // Second interval with no loss resets the fraction.
        for seq in 10u16..20 {
            s.on_packet(seq, seq as u32 * 3000, 90_000, seq as i64 * 10_000);
        }
        let block = s.report_block(300_000);
        assert_eq!(block.fraction_lost, 0);
    }

    #[test]
    fn test_sr_echo_fields() {
        let mut s = RecvStats::new(5);
        s.on_sender_report(0x11223344_55667788, 1_000_000);
        let block = s.report_block(1_500_000);
        assert_eq!(block.last_sender_report, 0x33445566);
        // 0.5s in 1/65536 units
        assert_eq!(block.delay, 32768);
    }

    #[test]
    fn test_rtt_estimator() {
        let mut rtt = RttEstimator::default();
        // peer echoes our SR from 0.5s (32768 compact units) ago after
        // holding it for 0.25s.
        rtt.on_report(100_000, 100_000 - 32768, 16384);
        let got = rtt.rtt_us();
        assert!((240_000..=260_000).contains(&got), "rtt {got}");
    }

    #[test]
    fn test_sequence_cycle_tracking() {
        let mut s = RecvStats::new(1);
        s.on_packet(65534, 0, 90_000, 0);
        s.on_packet(65535, 0, 90_000, 0);
        s.on_packet(0, 0, 90_000, 0);
        let block = s.report_block(0);
        assert_eq!(block.last_sequence_number, 1 << 16);
    }
}
