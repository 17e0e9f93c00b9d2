//! Repackages demultiplexed TS elementary streams into FLV tag bodies for
//! the internal RTMP publish path.

use bytes::Bytes;
use log::debug;

use codec::adts;
use codec::annexb::{H264NaluType, NaluCodec, NaluScanner};
use mpegts::{TsCodec, TsEvent};
use rtmp::flv;
use shared::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Audio,
    Video,
}

/// One FLV tag body with its millisecond DTS, ready for an RTMP message.
#[derive(Debug, Clone, PartialEq)]
pub struct FlvTag {
    pub kind: TagKind,
    pub dts: u32,
    pub payload: Bytes,
}

/// Stateful TS→FLV converter for one SRT ingest.
pub struct Ts2FlvBridge {
    scanner: NaluScanner,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    video_header_sent: bool,
    audio_header: Option<[u8; 2]>,
}

impl Ts2FlvBridge {
    pub fn new(sei_filter: bool) -> Self {
        Self {
            scanner: NaluScanner::new(NaluCodec::H264, sei_filter),
            sps: None,
            pps: None,
            video_header_sent: false,
            audio_header: None,
        }
    }

    /// Converts one demux event into zero or more tags.
    pub fn on_ts_event(&mut self, event: &TsEvent) -> Result<Vec<FlvTag>> {
        match event {
            TsEvent::Pes {
                codec: Some(TsCodec::H264),
                dts,
                pts,
                payload,
                ..
            } => self.on_video(*dts, *pts, payload),
            TsEvent::Pes {
                codec: Some(TsCodec::Aac),
                dts,
                payload,
                ..
            } => self.on_audio(*dts, payload),
            TsEvent::Pes { codec, .. } => {
                debug!("srt: ignoring pes for codec {codec:?}");
                Ok(Vec::new())
            }
            TsEvent::ProgramMapped { .. } => Ok(Vec::new()),
        }
    }

    fn on_video(&mut self, dts90k: u64, pts90k: u64, payload: &Bytes) -> Result<Vec<FlvTag>> {
        let dts = (dts90k / 90) as u32;
        let cts = (pts90k.wrapping_sub(dts90k) as i64 / 90) as i32;
        let mut tags = Vec::new();

        let nalus = self.scanner.split(payload);
        let mut frame_nalus: Vec<Bytes> = Vec::new();
        let mut keyframe = false;

        for nalu in &nalus {
            match nalu.h264_type() {
                H264NaluType::Sps => {
                    if self.sps.as_ref() != Some(&nalu.data) {
                        self.sps = Some(nalu.data.clone());
                        self.video_header_sent = false;
                    }
                }
                H264NaluType::Pps => {
                    if self.pps.as_ref() != Some(&nalu.data) {
                        self.pps = Some(nalu.data.clone());
                        self.video_header_sent = false;
                    }
                }
                H264NaluType::CodedSliceIdr => {
                    keyframe = true;
                    frame_nalus.push(nalu.data.clone());
                }
                _ => frame_nalus.push(nalu.data.clone()),
            }
        }

        // Sequence header precedes the first frame after any SPS/PPS
        // change.
        if !self.video_header_sent {
            if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                let record = flv::avc_decoder_configuration(sps, pps);
                tags.push(FlvTag {
                    kind: TagKind::Video,
                    dts,
                    payload: flv::VideoTagBody {
                        keyframe: true,
                        codec_id: flv::CODEC_AVC,
                        packet_type: flv::AVC_SEQUENCE_HEADER,
                        cts: 0,
                        data: record,
                    }
                    .encode(),
                });
                self.video_header_sent = true;
            }
        }

        if !frame_nalus.is_empty() && self.video_header_sent {
            tags.push(FlvTag {
                kind: TagKind::Video,
                dts,
                payload: flv::VideoTagBody {
                    keyframe,
                    codec_id: flv::CODEC_AVC,
                    packet_type: flv::AVC_NALU,
                    cts,
                    data: flv::nalus_to_avcc(&frame_nalus),
                }
                .encode(),
            });
        }

        Ok(tags)
    }

    fn on_audio(&mut self, dts90k: u64, payload: &Bytes) -> Result<Vec<FlvTag>> {
        let dts = (dts90k / 90) as u32;
        let mut tags = Vec::new();

        for frame in adts::split_frames(payload)? {
            let asc = frame.header.audio_specific_config();
            if self.audio_header != Some(asc) {
                self.audio_header = Some(asc);
                tags.push(FlvTag {
                    kind: TagKind::Audio,
                    dts,
                    payload: flv::AudioTagBody::encode_aac(
                        flv::AAC_SEQUENCE_HEADER,
                        &Bytes::copy_from_slice(&asc),
                    ),
                });
            }
            tags.push(FlvTag {
                kind: TagKind::Audio,
                dts,
                payload: flv::AudioTagBody::encode_aac(flv::AAC_RAW, &frame.payload),
            });
        }
        Ok(tags)
    }
}
