//! Transport stream multiplexer.
//!
//! PAT and PMT are synthesized before the first media packet and again,
//! with a bumped version, whenever the observed codecs change. PES packets
//! are split into 188-byte transport packets; the first chunk carries a
//! PCR when the frame is a keyframe or when the stream is audio-only, and
//! the final chunk is padded to 188 with adaptation-field stuffing.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;

use shared::error::Result;

use crate::packet::{AdaptationControl, AdaptationField, TsHeader, TS_PACKET_SIZE};
use crate::pes::{PesHeader, STREAM_ID_AUDIO, STREAM_ID_VIDEO};
use crate::psi::{Pat, Pmt, PmtStream};
use crate::{pids, TsCodec};

const PROGRAM_NUMBER: u16 = 1;

#[derive(Default)]
pub struct TsMuxer {
    video: Option<TsCodec>,
    audio: Option<TsCodec>,
    table_version: u8,
    tables_dirty: bool,
    continuity: std::collections::HashMap<u16, u8>,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the elementary codecs. Emitting tables is deferred to the
    /// next `write_frame`.
    pub fn set_codecs(&mut self, video: Option<TsCodec>, audio: Option<TsCodec>) {
        if self.video != video || self.audio != audio {
            if self.video.is_some() || self.audio.is_some() {
                self.table_version = (self.table_version + 1) & 0x1F;
                debug!(
                    "ts: codec change, pat/pmt version now {}",
                    self.table_version
                );
            }
            self.video = video;
            self.audio = audio;
            self.tables_dirty = true;
        }
    }

    fn pid_for(codec: TsCodec) -> u16 {
        match codec {
            TsCodec::H264 | TsCodec::H265 => pids::VIDEO,
            TsCodec::Aac => pids::AUDIO,
            TsCodec::Mp3 => pids::MP3,
        }
    }

    fn pcr_pid(&self) -> u16 {
        // Video carries the PCR when present, otherwise audio does.
        match (self.video, self.audio) {
            (Some(v), _) => Self::pid_for(v),
            (None, Some(a)) => Self::pid_for(a),
            (None, None) => pids::VIDEO,
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0);
        let v = *cc;
        *cc = (*cc + 1) & 0x0F;
        v
    }

    /// Encodes one frame into transport packets, preceded by PAT+PMT when
    /// tables changed.
    pub fn write_frame(
        &mut self,
        codec: TsCodec,
        keyframe: bool,
        dts: u64,
        pts: u64,
        payload: Bytes,
    ) -> Result<Bytes> {
        // Learn codecs from traffic when not declared up front.
        if codec.is_video() {
            if self.video != Some(codec) {
                self.set_codecs(Some(codec), self.audio);
            }
        } else if self.audio != Some(codec) {
            self.set_codecs(self.video, Some(codec));
        }

        let mut out = BytesMut::new();
        if self.tables_dirty {
            self.write_tables(&mut out);
            self.tables_dirty = false;
        }

        let pid = Self::pid_for(codec);
        let stream_id = if codec.is_video() {
            STREAM_ID_VIDEO
        } else {
            STREAM_ID_AUDIO
        };

        let mut pes = PesHeader::encode(stream_id, dts, pts, payload.len());
        pes.extend_from_slice(&payload);
        let pes = pes.freeze();

        let audio_only = self.video.is_none();
        let write_pcr = (keyframe || audio_only) && pid == self.pcr_pid();

        let mut pos = 0;
        let mut first = true;
        while pos < pes.len() {
            let mut pkt = [0u8; TS_PACKET_SIZE];
            let remaining = pes.len() - pos;

            let af = if first && write_pcr {
                Some(AdaptationField {
                    random_access: keyframe,
                    pcr: Some(dts),
                    ..Default::default()
                })
            } else {
                None
            };

            let af_base = af.as_ref().map_or(0, AdaptationField::base_len);
            let mut af_total = af_base;
            let capacity = TS_PACKET_SIZE - 4 - af_base;
            let take = remaining.min(capacity);
            if take < capacity {
                // Grow (or create) the adaptation field to absorb the slack.
                af_total = TS_PACKET_SIZE - 4 - take;
            }

            let header = TsHeader {
                transport_error: false,
                payload_unit_start: first,
                transport_priority: false,
                pid,
                adaptation_control: if af_total > 0 {
                    AdaptationControl::AdaptationAndPayload
                } else {
                    AdaptationControl::PayloadOnly
                },
                continuity_counter: self.next_cc(pid),
            };
            header.encode(&mut pkt[..4]);
            if af_total > 0 {
                af.unwrap_or_default().encode(&mut pkt[4..], af_total);
            }
            pkt[4 + af_total..].copy_from_slice(&pes[pos..pos + take]);
            out.put_slice(&pkt);

            pos += take;
            first = false;
        }

        Ok(out.freeze())
    }

    fn write_tables(&mut self, out: &mut BytesMut) {
        let pat = Pat {
            transport_stream_id: 1,
            version: self.table_version,
            programs: vec![(PROGRAM_NUMBER, pids::PMT)],
        };
        self.write_section(out, pids::PAT, &pat.encode());

        let mut streams = Vec::new();
        if let Some(v) = self.video {
            streams.push(PmtStream {
                stream_type: v.stream_type(),
                pid: Self::pid_for(v),
            });
        }
        if let Some(a) = self.audio {
            streams.push(PmtStream {
                stream_type: a.stream_type(),
                pid: Self::pid_for(a),
            });
        }
        let pmt = Pmt {
            program_number: PROGRAM_NUMBER,
            version: self.table_version,
            pcr_pid: self.pcr_pid(),
            streams,
        };
        self.write_section(out, pids::PMT, &pmt.encode());
    }

    fn write_section(&mut self, out: &mut BytesMut, pid: u16, section: &[u8]) {
        let mut pkt = [0xFFu8; TS_PACKET_SIZE];
        let header = TsHeader {
            transport_error: false,
            payload_unit_start: true,
            transport_priority: false,
            pid,
            adaptation_control: AdaptationControl::PayloadOnly,
            continuity_counter: self.next_cc(pid),
        };
        header.encode(&mut pkt[..4]);
        pkt[4..4 + section.len()].copy_from_slice(section);
        out.put_slice(&pkt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TsHeader;

    fn packets(buf: &[u8]) -> Vec<&[u8]> {
        buf.chunks_exact(TS_PACKET_SIZE).collect()
    }

    #[test]
    fn test_idr_segmentation() {
        // A 10000-byte IDR at 10s: one PAT+PMT pair then ceil(10000/184)
        // packets of PID 0x100 with PCR on the first.
        let mut mux = TsMuxer::new();
        let payload = Bytes::from(vec![0x00u8; 10_000]);
        let out = mux
            .write_frame(TsCodec::H264, true, 900_000, 900_000, payload)
            .unwrap();

        let pkts = packets(&out);
        assert_eq!(pkts.len(), 2 + 55);

        let pat = TsHeader::decode(pkts[0]).unwrap();
        assert_eq!(pat.pid, pids::PAT);
        let pmt = TsHeader::decode(pkts[1]).unwrap();
        assert_eq!(pmt.pid, pids::PMT);

        for (i, pkt) in pkts[2..].iter().enumerate() {
            let h = TsHeader::decode(pkt).unwrap();
            assert_eq!(h.pid, pids::VIDEO);
            assert_eq!(h.continuity_counter, (i as u8) & 0x0F);
            assert_eq!(h.payload_unit_start, i == 0);
        }

        // First media packet carries the PCR.
        let h = TsHeader::decode(pkts[2]).unwrap();
        assert!(h.adaptation_control.has_adaptation());
        let af = AdaptationField::decode(&pkts[2][4..]).unwrap();
        assert_eq!(af.pcr, Some(900_000));
        assert!(af.random_access);
    }

    #[test]
    fn test_tables_not_repeated_without_change() {
        let mut mux = TsMuxer::new();
        let out1 = mux
            .write_frame(TsCodec::H264, true, 0, 0, Bytes::from_static(&[0; 100]))
            .unwrap();
        let out2 = mux
            .write_frame(TsCodec::H264, false, 3600, 3600, Bytes::from_static(&[0; 100]))
            .unwrap();
        assert_eq!(packets(&out1).len(), 3);
        assert_eq!(packets(&out2).len(), 1);
    }

    #[test]
    fn test_codec_change_bumps_version() {
        let mut mux = TsMuxer::new();
        let _ = mux
            .write_frame(TsCodec::H264, true, 0, 0, Bytes::from_static(&[0; 10]))
            .unwrap();
        let out = mux
            .write_frame(TsCodec::Aac, false, 0, 0, Bytes::from_static(&[0; 10]))
            .unwrap();
        // New PAT + PMT precede the audio frame.
        let pkts = packets(&out);
        assert_eq!(pkts.len(), 3);
        let section = &pkts[0][4..];
        let pat = Pat::decode(section).unwrap();
        assert_eq!(pat.version, 1);
    }

    #[test]
    fn test_audio_only_pcr_every_frame() {
        let mut mux = TsMuxer::new();
        mux.set_codecs(None, Some(TsCodec::Aac));
        for i in 0..3u64 {
            let out = mux
                .write_frame(TsCodec::Aac, false, i * 1920, i * 1920, Bytes::from_static(&[0; 64]))
                .unwrap();
            let pkts = packets(&out);
            let media = pkts.last().unwrap();
            let h = TsHeader::decode(media).unwrap();
            assert!(h.adaptation_control.has_adaptation());
            let af = AdaptationField::decode(&media[4..]).unwrap();
            assert_eq!(af.pcr, Some(i * 1920));
        }
    }
}
