//! Publisher endpoint: the receive path of one published WebRTC stream.

use std::collections::HashMap;
use std::time::Instant;

use log::{debug, warn};

use rtcp::transport_feedbacks::transport_layer_nack::{
    nack_pairs_from_sequence_numbers, TransportLayerNack,
};
use rtcp::RtcpPacket;
use sdp::MediaTrackDesc;
use shared::error::{Error, Result};
use shared::time::SystemInstant;

use crate::nack::NackList;
use crate::report::{RecvStats, RttEstimator};
use crate::twcc::TwccRecorder;

/// Publisher-side session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishState {
    #[default]
    Idle,
    Negotiating,
    Receiving,
    Stopped,
}

#[derive(Debug)]
struct RecvTrack {
    desc: MediaTrackDesc,
    stats: RecvStats,
    nack: NackList,
}

/// Receives one peer's published tracks: loss tracking, NACK generation,
/// TWCC recording, RR/XR production.
#[derive(Debug)]
pub struct RtcPublisher {
    pub url: String,
    pub state: PublishState,
    tracks: HashMap<u32, RecvTrack>,
    twcc: TwccRecorder,
    rtt: RttEstimator,
    sender_ssrc: u32,
    nack_enabled: bool,
    twcc_enabled: bool,
    twcc_ext_id: Option<u8>,
    drop_for_pt: u8,
    /// Circuit breaker: NACK/TWCC suppressed while critical.
    load_critical: bool,
}

impl RtcPublisher {
    pub fn new(url: String, tracks: Vec<MediaTrackDesc>, drop_for_pt: u8) -> Result<Self> {
        let sender_ssrc: u32 = rand::random();
        let mut map = HashMap::new();
        let mut nack_enabled = false;
        let mut twcc_enabled = false;
        let mut twcc_ext_id = None;
        for desc in tracks {
            nack_enabled |= desc.nack;
            twcc_enabled |= desc.twcc;
            twcc_ext_id = twcc_ext_id.or(desc.twcc_ext_id);
            for &ssrc in &desc.remote_ssrcs {
                if map.contains_key(&ssrc) {
                    return Err(Error::DuplicateSsrc(ssrc));
                }
                map.insert(
                    ssrc,
                    RecvTrack {
                        desc: desc.clone(),
                        stats: RecvStats::new(ssrc),
                        nack: NackList::default(),
                    },
                );
            }
        }
        Ok(Self {
            url,
            state: PublishState::Negotiating,
            tracks: map,
            twcc: TwccRecorder::new(sender_ssrc),
            rtt: RttEstimator::default(),
            sender_ssrc,
            nack_enabled,
            twcc_enabled,
            twcc_ext_id,
            drop_for_pt,
            load_critical: false,
        })
    }

    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.tracks.contains_key(&ssrc)
    }

    pub fn ssrcs(&self) -> Vec<u32> {
        self.tracks.keys().copied().collect()
    }

    pub fn video_ssrcs(&self) -> Vec<u32> {
        self.tracks
            .iter()
            .filter(|(_, t)| t.desc.is_video)
            .map(|(&ssrc, _)| ssrc)
            .collect()
    }

    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }

    pub fn set_load_critical(&mut self, critical: bool) {
        self.load_critical = critical;
    }

    /// TWCC extension peek on the still-protected datagram. Runs before
    /// SRTP unprotect so padding probes and duplicated retransmits are
    /// still counted.
    pub fn on_rtp_prepass(&mut self, buf: &[u8], media_ssrc: u32, now_us: i64) {
        if !self.twcc_enabled || self.load_critical {
            return;
        }
        if let Some(ext_id) = self.twcc_ext_id {
            if let Some(seq) = rtp::extension::peek_twcc_sequence(buf, ext_id) {
                self.twcc.record(media_ssrc, seq, now_us);
            }
        }
    }

    /// One unprotected RTP packet. Returns false when the packet must be
    /// dropped instead of forwarded.
    pub fn on_rtp(&mut self, packet: &rtp::Packet, now_us: i64) -> Result<bool> {
        if self.drop_for_pt != 0 && packet.header.payload_type == self.drop_for_pt {
            return Ok(false);
        }
        let track = self
            .tracks
            .get_mut(&packet.header.ssrc)
            .ok_or(Error::UnknownSsrc(packet.header.ssrc))?;
        if self.state == PublishState::Negotiating {
            self.state = PublishState::Receiving;
            debug!("rtc: publisher {} receiving", self.url);
        }
        track.stats.on_packet(
            packet.header.sequence_number,
            packet.header.timestamp,
            track.desc.clock_rate,
            now_us,
        );
        if track.desc.nack && !self.load_critical {
            track
                .nack
                .on_packet(packet.header.sequence_number, now_us);
        }
        Ok(true)
    }

    /// Feedback and reports from the publishing peer.
    pub fn on_rtcp(&mut self, packet: &RtcpPacket, now_us: i64) {
        match packet {
            RtcpPacket::SenderReport(sr) => {
                if let Some(track) = self.tracks.get_mut(&sr.ssrc) {
                    track.stats.on_sender_report(sr.ntp_time, now_us);
                }
            }
            RtcpPacket::Goodbye(bye) => {
                if bye.sources.iter().any(|s| self.tracks.contains_key(s)) {
                    debug!("rtc: publisher {} got BYE", self.url);
                    self.state = PublishState::Stopped;
                }
            }
            RtcpPacket::SourceDescription(_) | RtcpPacket::Raw { .. } => {}
            other => {
                debug!("rtc: publisher ignoring {other:?}");
            }
        }
    }

    /// 20 ms tick: emit NACKs for overdue gaps.
    pub fn on_tick_20ms(&mut self, now_us: i64) -> Vec<RtcpPacket> {
        if !self.nack_enabled || self.load_critical {
            return Vec::new();
        }
        let rtt_us = self.rtt.rtt_us();
        let mut out = Vec::new();
        for (ssrc, track) in self.tracks.iter_mut() {
            if !track.desc.nack {
                continue;
            }
            let due = track.nack.poll(now_us, rtt_us);
            if due.is_empty() {
                continue;
            }
            out.push(RtcpPacket::TransportLayerNack(TransportLayerNack {
                sender_ssrc: self.sender_ssrc,
                media_ssrc: *ssrc,
                nacks: nack_pairs_from_sequence_numbers(&due),
            }));
        }
        out
    }

    /// 100 ms tick: TWCC feedback.
    pub fn on_tick_100ms(&mut self) -> Vec<RtcpPacket> {
        if !self.twcc_enabled || self.load_critical {
            return Vec::new();
        }
        self.twcc.build_feedback()
    }

    /// 1 s tick: RR + XR(RRTR).
    pub fn on_tick_1s(
        &mut self,
        epoch: &SystemInstant,
        now: Instant,
        now_us: i64,
    ) -> Vec<RtcpPacket> {
        if self.tracks.is_empty() {
            return Vec::new();
        }
        let mut stats: Vec<&mut RecvStats> =
            self.tracks.values_mut().map(|t| &mut t.stats).collect();
        let (rr, xr) = crate::report::build_rr(self.sender_ssrc, &mut stats, epoch, now, now_us);
        vec![
            RtcpPacket::ReceiverReport(rr),
            RtcpPacket::ExtendedReport(xr),
        ]
    }

    pub fn stop(&mut self) {
        if self.state != PublishState::Stopped {
            self.state = PublishState::Stopped;
        } else {
            warn!("rtc: publisher {} stopped twice", self.url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdp::{Direction, TrackCodec};

    fn video_track(ssrc: u32) -> MediaTrackDesc {
        MediaTrackDesc {
            mid: "1".into(),
            is_video: true,
            codec: TrackCodec::H264,
            payload_type: 97,
            clock_rate: 90_000,
            remote_ssrcs: vec![ssrc],
            local_ssrc: 0,
            nack: true,
            pli: true,
            twcc: true,
            twcc_ext_id: Some(3),
            direction: Direction::RecvOnly,
            ssrc_groups: Vec::new(),
        }
    }

    fn rtp_at(ssrc: u32, seq: u16) -> rtp::Packet {
        rtp::Packet {
            header: rtp::Header {
                version: 2,
                ssrc,
                sequence_number: seq,
                timestamp: seq as u32 * 3000,
                payload_type: 97,
                ..Default::default()
            },
            payload: bytes::Bytes::from_static(&[0u8; 100]),
        }
    }

    #[test]
    fn test_nack_emitted_once_after_rtt() {
        let mut p = RtcPublisher::new("live/feed".into(), vec![video_track(42)], 0).unwrap();
        for seq in [100u16, 101, 103, 104] {
            p.on_rtp(&rtp_at(42, seq), 0).unwrap();
        }
        // Default RTT estimate is 100 ms; nothing due immediately.
        assert!(p.on_tick_20ms(10_000).is_empty());
        let out = p.on_tick_20ms(60_000);
        assert_eq!(out.len(), 1);
        match &out[0] {
            RtcpPacket::TransportLayerNack(nack) => {
                assert_eq!(nack.media_ssrc, 42);
                assert_eq!(nack.lost_sequences(), vec![102]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_arrival_before_retry_stops_nack() {
        let mut p = RtcPublisher::new("live/feed".into(), vec![video_track(42)], 0).unwrap();
        for seq in [100u16, 101, 103, 104] {
            p.on_rtp(&rtp_at(42, seq), 0).unwrap();
        }
        p.on_rtp(&rtp_at(42, 102), 5_000).unwrap();
        assert!(p.on_tick_20ms(60_000).is_empty());
    }

    #[test]
    fn test_unknown_ssrc_rejected() {
        let mut p = RtcPublisher::new("live/feed".into(), vec![video_track(42)], 0).unwrap();
        assert_eq!(
            p.on_rtp(&rtp_at(7, 1), 0),
            Err(Error::UnknownSsrc(7))
        );
    }

    #[test]
    fn test_duplicate_ssrc_in_tracks() {
        let err = RtcPublisher::new(
            "live/feed".into(),
            vec![video_track(42), video_track(42)],
            0,
        )
        .unwrap_err();
        assert_eq!(err, Error::DuplicateSsrc(42));
    }

    #[test]
    fn test_circuit_breaker_disables_nack_and_twcc() {
        let mut p = RtcPublisher::new("live/feed".into(), vec![video_track(42)], 0).unwrap();
        p.set_load_critical(true);
        for seq in [100u16, 103] {
            p.on_rtp(&rtp_at(42, seq), 0).unwrap();
        }
        assert!(p.on_tick_20ms(1_000_000).is_empty());
        assert!(p.on_tick_100ms().is_empty());
    }

    #[test]
    fn test_drop_for_pt() {
        let mut p = RtcPublisher::new("live/feed".into(), vec![video_track(42)], 97).unwrap();
        assert!(!p.on_rtp(&rtp_at(42, 1), 0).unwrap());
    }

    #[test]
    fn test_bye_stops() {
        let mut p = RtcPublisher::new("live/feed".into(), vec![video_track(42)], 0).unwrap();
        p.on_rtp(&rtp_at(42, 1), 0).unwrap();
        assert_eq!(p.state, PublishState::Receiving);
        p.on_rtcp(
            &RtcpPacket::Goodbye(rtcp::goodbye::Goodbye { sources: vec![42] }),
            0,
        );
        assert_eq!(p.state, PublishState::Stopped);
    }

    #[test]
    fn test_rr_built_on_1s_tick() {
        let mut p = RtcPublisher::new("live/feed".into(), vec![video_track(42)], 0).unwrap();
        p.on_rtp(&rtp_at(42, 1), 0).unwrap();
        let epoch = SystemInstant::now();
        let out = p.on_tick_1s(&epoch, Instant::now(), 1_000_000);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], RtcpPacket::ReceiverReport(_)));
        assert!(matches!(out[1], RtcpPacket::ExtendedReport(_)));
    }
}
