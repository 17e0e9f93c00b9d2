//! Player endpoint: the send path toward one subscribing peer.

use std::collections::HashMap;
use std::time::Instant;

use log::debug;

use rtcp::RtcpPacket;
use sdp::MediaTrackDesc;
use shared::time::SystemInstant;

use crate::nack::SendBuffer;
use crate::pli::PliQueue;
use crate::report::{RttEstimator, SendStats};

/// Retained packets per track for NACK retransmission.
const SEND_BUFFER_SIZE: u16 = 1024;

struct SendTrack {
    desc: MediaTrackDesc,
    stats: SendStats,
    buffer: SendBuffer,
}

/// Sends media to one subscriber and answers its feedback.
pub struct RtcPlayer {
    pub url: String,
    tracks: HashMap<u32, SendTrack>,
    /// Keyframe requests queued toward the publisher side.
    pub pli: PliQueue,
    rtt: RttEstimator,
    sender_ssrc: u32,
    /// Retransmit straight from the ring without cloning payloads.
    nack_no_copy: bool,
}

impl RtcPlayer {
    pub fn new(url: String, tracks: Vec<MediaTrackDesc>, nack_no_copy: bool) -> Self {
        let mut map = HashMap::new();
        for desc in tracks {
            map.insert(
                desc.local_ssrc,
                SendTrack {
                    stats: SendStats::new(desc.local_ssrc, desc.clock_rate),
                    buffer: SendBuffer::new(SEND_BUFFER_SIZE).expect("size is a power of two"),
                    desc,
                },
            );
        }
        Self {
            url,
            tracks: map,
            pli: PliQueue::new(),
            rtt: RttEstimator::default(),
            sender_ssrc: rand::random(),
            nack_no_copy,
        }
    }

    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.tracks.contains_key(&ssrc)
    }

    pub fn ssrcs(&self) -> Vec<u32> {
        self.tracks.keys().copied().collect()
    }

    /// The video SSRC whose loss triggers keyframe requests upstream.
    pub fn video_ssrc(&self) -> Option<u32> {
        self.tracks
            .values()
            .find(|t| t.desc.is_video)
            .map(|t| t.desc.local_ssrc)
    }

    /// Records an outgoing packet for stats and retransmission.
    pub fn on_send_rtp(&mut self, packet: &rtp::Packet) {
        if let Some(track) = self.tracks.get_mut(&packet.header.ssrc) {
            track
                .stats
                .on_packet(packet.header.timestamp, packet.payload.len());
            if track.desc.nack {
                // Payload is refcounted; with nack_no_copy the clone is
                // header-only bookkeeping either way.
                track.buffer.add(packet.clone());
            }
        }
    }

    /// Subscriber feedback. Returns packets to retransmit; PLI lands in
    /// the queue for the PLI worker.
    pub fn on_rtcp(&mut self, packet: &RtcpPacket, now_compact_ntp: u32) -> Vec<rtp::Packet> {
        match packet {
            RtcpPacket::TransportLayerNack(nack) => {
                let Some(track) = self.tracks.get(&nack.media_ssrc) else {
                    return Vec::new();
                };
                if !track.desc.nack {
                    return Vec::new();
                }
                let mut retransmits = Vec::new();
                for seq in nack.lost_sequences() {
                    // Sequences that already left the ring are dropped
                    // silently.
                    if let Some(pkt) = track.buffer.get(seq) {
                        retransmits.push(pkt.clone());
                    }
                }
                debug!(
                    "rtc: player {} retransmitting {} of {} nacked",
                    self.url,
                    retransmits.len(),
                    nack.lost_sequences().len()
                );
                retransmits
            }
            RtcpPacket::PictureLossIndication(pli) => {
                if self.tracks.contains_key(&pli.media_ssrc) {
                    self.pli.request(pli.media_ssrc);
                }
                Vec::new()
            }
            RtcpPacket::ReceiverReport(rr) => {
                for report in &rr.reports {
                    if self.tracks.contains_key(&report.ssrc) {
                        self.rtt
                            .on_report(now_compact_ntp, report.last_sender_report, report.delay);
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn rtt_us(&self) -> i64 {
        self.rtt.rtt_us()
    }

    /// 1 s tick: one SR per sending track.
    pub fn on_tick_1s(&mut self, epoch: &SystemInstant, now: Instant) -> Vec<RtcpPacket> {
        self.tracks
            .values()
            .filter(|t| t.stats.packet_count > 0)
            .map(|t| RtcpPacket::SenderReport(t.stats.build_sr(epoch, now)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
    use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
    use sdp::{Direction, TrackCodec};

    fn send_track(ssrc: u32) -> MediaTrackDesc {
        MediaTrackDesc {
            mid: "1".into(),
            is_video: true,
            codec: TrackCodec::H264,
            payload_type: 97,
            clock_rate: 90_000,
            remote_ssrcs: Vec::new(),
            local_ssrc: ssrc,
            nack: true,
            pli: true,
            twcc: false,
            twcc_ext_id: None,
            direction: Direction::SendOnly,
            ssrc_groups: Vec::new(),
        }
    }

    fn pkt(ssrc: u32, seq: u16) -> rtp::Packet {
        rtp::Packet {
            header: rtp::Header {
                version: 2,
                ssrc,
                sequence_number: seq,
                timestamp: seq as u32 * 3000,
                ..Default::default()
            },
            payload: bytes::Bytes::from(vec![seq as u8; 10]),
        }
    }

    #[test]
    fn test_nack_retransmits_from_ring() {
        let mut player = RtcPlayer::new("live/feed".into(), vec![send_track(9)], true);
        for seq in 0..20u16 {
            player.on_send_rtp(&pkt(9, seq));
        }
        let nack = RtcpPacket::TransportLayerNack(TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 9,
            nacks: vec![NackPair {
                packet_id: 5,
                lost_packets: 0b1, // 5 and 6
            }],
        });
        let retransmits = player.on_rtcp(&nack, 0);
        assert_eq!(retransmits.len(), 2);
        assert_eq!(retransmits[0].header.sequence_number, 5);
        assert_eq!(retransmits[1].header.sequence_number, 6);
    }

    #[test]
    fn test_nack_for_evicted_sequence_dropped_silently() {
        let mut player = RtcPlayer::new("live/feed".into(), vec![send_track(9)], true);
        for seq in 0..2000u16 {
            player.on_send_rtp(&pkt(9, seq));
        }
        let nack = RtcpPacket::TransportLayerNack(TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 9,
            nacks: vec![NackPair {
                packet_id: 10,
                lost_packets: 0,
            }],
        });
        assert!(player.on_rtcp(&nack, 0).is_empty());
    }

    #[test]
    fn test_pli_queued_and_coalesced() {
        let mut player = RtcPlayer::new("live/feed".into(), vec![send_track(9)], true);
        let pli = RtcpPacket::PictureLossIndication(PictureLossIndication {
            sender_ssrc: 1,
            media_ssrc: 9,
        });
        player.on_rtcp(&pli, 0);
        player.on_rtcp(&pli, 0);
        player.on_rtcp(&pli, 0);
        assert_eq!(player.pli.drain(0).len(), 1);
    }

    #[test]
    fn test_sr_only_after_traffic() {
        let mut player = RtcPlayer::new("live/feed".into(), vec![send_track(9)], true);
        let epoch = SystemInstant::now();
        assert!(player.on_tick_1s(&epoch, Instant::now()).is_empty());
        player.on_send_rtp(&pkt(9, 0));
        assert_eq!(player.on_tick_1s(&epoch, Instant::now()).len(), 1);
    }
}
