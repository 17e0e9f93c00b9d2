//! Cross-protocol media bridging: FLV tag bodies to RTP packets for
//! WebRTC egress, and depacketized RTP back to FLV for WebRTC publishers
//! feeding RTMP/HLS consumers.

use bytes::Bytes;
use log::{debug, warn};

use hub::{MediaCodec, MediaPacket, PacketKind};
use rtmp::flv;
use rtp::packetizer::{FuaAssembler, Packetizer, DEFAULT_MTU};
use shared::error::Result;

/// FLV → RTP: the send-side bridge for one player connection.
pub struct Flv2RtpBridge {
    video: Packetizer,
    audio: Packetizer,
    sps: Vec<Bytes>,
    pps: Vec<Bytes>,
}

impl Flv2RtpBridge {
    pub fn new(video_ssrc: u32, video_pt: u8, audio_ssrc: u32, audio_pt: u8) -> Self {
        Self {
            video: Packetizer::new(video_ssrc, video_pt, DEFAULT_MTU),
            audio: Packetizer::new(audio_ssrc, audio_pt, DEFAULT_MTU),
            sps: Vec::new(),
            pps: Vec::new(),
        }
    }

    /// Converts one hub packet into RTP packets toward the peer.
    pub fn on_media(&mut self, packet: &MediaPacket) -> Result<Vec<rtp::Packet>> {
        match packet.kind {
            PacketKind::Video => self.on_video(packet),
            PacketKind::Audio => Ok(self.on_audio(packet)),
            PacketKind::Metadata => Ok(Vec::new()),
        }
    }

    fn on_video(&mut self, packet: &MediaPacket) -> Result<Vec<rtp::Packet>> {
        let tag = flv::VideoTagBody::parse(&packet.payload)?;
        if tag.packet_type == flv::AVC_SEQUENCE_HEADER {
            let (sps, pps) = flv::parse_avc_decoder_configuration(&tag.data)?;
            self.sps = sps;
            self.pps = pps;
            return Ok(Vec::new());
        }

        // 90 kHz presentation clock.
        let ts = packet
            .dts
            .wrapping_add(tag.cts as u32)
            .wrapping_mul(90);

        let mut nalus: Vec<Bytes> = Vec::new();
        if tag.keyframe {
            // Parameter sets precede every IDR so late joiners can decode.
            nalus.extend(self.sps.iter().cloned());
            nalus.extend(self.pps.iter().cloned());
        }
        nalus.extend(flv::avcc_to_nalus(&tag.data)?);
        self.video.packetize_h264(ts, &nalus)
    }

    fn on_audio(&mut self, packet: &MediaPacket) -> Vec<rtp::Packet> {
        // Opus rides a 48 kHz clock; AAC passes through only when the
        // peer negotiated it. Sequence headers have no RTP form.
        if packet.sequence_header {
            return Vec::new();
        }
        let ts = packet.dts.wrapping_mul(48);
        let payload = match packet.codec {
            MediaCodec::Opus => packet.payload.clone(),
            MediaCodec::Aac => match flv::AudioTagBody::parse(&packet.payload) {
                Ok(tag) => tag.data,
                Err(_) => return Vec::new(),
            },
            other => {
                debug!("bridge: no rtp mapping for audio codec {other:?}");
                return Vec::new();
            }
        };
        vec![self.audio.packetize_audio(ts, payload)]
    }
}

/// RTP → FLV: depacketizes one WebRTC publisher's H.264 track into hub
/// packets (the rtc_to_rtmp path).
pub struct Rtp2FlvBridge {
    assembler: FuaAssembler,
    /// NALUs of the in-progress access unit.
    au: Vec<Bytes>,
    au_timestamp: u32,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    header_dirty: bool,
}

impl Default for Rtp2FlvBridge {
    fn default() -> Self {
        Self {
            assembler: FuaAssembler::default(),
            au: Vec::new(),
            au_timestamp: 0,
            sps: None,
            pps: None,
            header_dirty: false,
        }
    }
}

impl Rtp2FlvBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one video RTP packet; a completed access unit comes back as
    /// FLV-bodied hub packets.
    pub fn on_rtp(&mut self, packet: &rtp::Packet) -> Vec<MediaPacket> {
        if packet.header.timestamp != self.au_timestamp && !self.au.is_empty() {
            // Timestamp moved without a marker; close the unit anyway.
            warn!("bridge: access unit closed by timestamp change");
            let done = self.finish_au();
            self.push_payload(packet);
            return done;
        }
        self.au_timestamp = packet.header.timestamp;
        self.push_payload(packet);
        if packet.header.marker {
            self.finish_au()
        } else {
            Vec::new()
        }
    }

    fn push_payload(&mut self, packet: &rtp::Packet) {
        self.au_timestamp = packet.header.timestamp;
        if let Some(nalu) = self.assembler.push(&packet.payload) {
            self.au.push(nalu);
        }
    }

    fn finish_au(&mut self) -> Vec<MediaPacket> {
        let nalus = std::mem::take(&mut self.au);
        if nalus.is_empty() {
            return Vec::new();
        }
        let dts = self.au_timestamp / 90;
        let mut frames: Vec<Bytes> = Vec::new();
        let mut keyframe = false;

        for nalu in nalus {
            match nalu.first().map(|b| b & 0x1F) {
                Some(7) => {
                    if self.sps.as_ref() != Some(&nalu) {
                        self.sps = Some(nalu);
                        self.header_dirty = true;
                    }
                }
                Some(8) => {
                    if self.pps.as_ref() != Some(&nalu) {
                        self.pps = Some(nalu);
                        self.header_dirty = true;
                    }
                }
                Some(5) => {
                    keyframe = true;
                    frames.push(nalu);
                }
                Some(9) | Some(12) => {} // AUD/filler never reach FLV
                Some(_) => frames.push(nalu),
                None => {}
            }
        }

        let mut out = Vec::new();
        if self.header_dirty {
            if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                let record = flv::avc_decoder_configuration(sps, pps);
                let body = flv::VideoTagBody {
                    keyframe: true,
                    codec_id: flv::CODEC_AVC,
                    packet_type: flv::AVC_SEQUENCE_HEADER,
                    cts: 0,
                    data: record,
                }
                .encode();
                out.push(
                    MediaPacket::video(MediaCodec::H264, dts, 0, true, body)
                        .into_sequence_header(),
                );
                self.header_dirty = false;
            }
        }

        if !frames.is_empty() {
            let body = flv::VideoTagBody {
                keyframe,
                codec_id: flv::CODEC_AVC,
                packet_type: flv::AVC_NALU,
                cts: 0,
                data: flv::nalus_to_avcc(&frames),
            }
            .encode();
            out.push(MediaPacket::video(MediaCodec::H264, dts, 0, keyframe, body));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0xE0, 0x1F];
    const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

    fn sequence_header_packet() -> MediaPacket {
        let record = flv::avc_decoder_configuration(SPS, PPS);
        let body = flv::VideoTagBody {
            keyframe: true,
            codec_id: flv::CODEC_AVC,
            packet_type: flv::AVC_SEQUENCE_HEADER,
            cts: 0,
            data: record,
        }
        .encode();
        MediaPacket::video(MediaCodec::H264, 0, 0, true, body).into_sequence_header()
    }

    fn keyframe_packet(dts: u32, size: usize) -> MediaPacket {
        let idr = {
            let mut v = vec![0x65u8];
            v.extend(std::iter::repeat(0xAB).take(size));
            Bytes::from(v)
        };
        let body = flv::VideoTagBody {
            keyframe: true,
            codec_id: flv::CODEC_AVC,
            packet_type: flv::AVC_NALU,
            cts: 0,
            data: flv::nalus_to_avcc(&[idr]),
        }
        .encode();
        MediaPacket::video(MediaCodec::H264, dts, 0, true, body)
    }

    #[test]
    fn test_flv_to_rtp_keyframe_carries_parameter_sets() {
        let mut bridge = Flv2RtpBridge::new(1, 97, 2, 111);
        assert!(bridge.on_media(&sequence_header_packet()).unwrap().is_empty());

        let pkts = bridge.on_media(&keyframe_packet(1000, 100)).unwrap();
        // SPS, PPS, IDR: three small NALUs, one packet each.
        assert_eq!(pkts.len(), 3);
        assert_eq!(pkts[0].payload[0] & 0x1F, 7);
        assert_eq!(pkts[1].payload[0] & 0x1F, 8);
        assert_eq!(pkts[2].payload[0] & 0x1F, 5);
        assert!(pkts[2].header.marker);
        assert_eq!(pkts[0].header.timestamp, 90_000);
    }

    #[test]
    fn test_flv_to_rtp_large_frame_fragments() {
        let mut bridge = Flv2RtpBridge::new(1, 97, 2, 111);
        bridge.on_media(&sequence_header_packet()).unwrap();
        let pkts = bridge.on_media(&keyframe_packet(0, 5_000)).unwrap();
        assert!(pkts.len() > 4);
        assert!(pkts.iter().all(|p| p.payload.len() <= DEFAULT_MTU));
        assert!(pkts.last().unwrap().header.marker);
    }

    #[test]
    fn test_round_trip_rtp_back_to_flv() {
        let mut egress = Flv2RtpBridge::new(1, 97, 2, 111);
        egress.on_media(&sequence_header_packet()).unwrap();
        let rtp_packets = egress.on_media(&keyframe_packet(40, 3_000)).unwrap();

        let mut ingress = Rtp2FlvBridge::new();
        let mut media = Vec::new();
        for pkt in &rtp_packets {
            media.extend(ingress.on_rtp(pkt));
        }
        // Sequence header rebuilt from in-band SPS/PPS, then the frame.
        assert_eq!(media.len(), 2);
        assert!(media[0].sequence_header);
        assert!(media[1].keyframe);
        assert_eq!(media[1].dts, 40);

        let frame = flv::VideoTagBody::parse(&media[1].payload).unwrap();
        let nalus = flv::avcc_to_nalus(&frame.data).unwrap();
        assert_eq!(nalus.len(), 1);
        assert_eq!(nalus[0].len(), 3_001);
    }

    #[test]
    fn test_opus_audio_single_packet() {
        let mut bridge = Flv2RtpBridge::new(1, 97, 2, 111);
        let packet = MediaPacket::audio(MediaCodec::Opus, 20, Bytes::from_static(&[1, 2, 3]));
        let pkts = bridge.on_media(&packet).unwrap();
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].header.timestamp, 960);
        assert_eq!(pkts[0].header.payload_type, 111);
    }
}
