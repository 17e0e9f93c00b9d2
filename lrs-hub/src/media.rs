//! The shared media packet flowing between ingest and egress.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCodec {
    H264,
    H265,
    Aac,
    Mp3,
    Opus,
}

/// One media unit.
///
/// Created once by the ingest path and shared read-only among all
/// consumers; the payload is refcounted, headers are copied per clone.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPacket {
    pub kind: PacketKind,
    pub codec: MediaCodec,
    /// Decode timestamp, milliseconds, wrapping u32.
    pub dts: u32,
    /// Composition offset (pts - dts) in milliseconds.
    pub cts: i32,
    pub keyframe: bool,
    /// Codec configuration (AVC DCR / AudioSpecificConfig / Opus config).
    pub sequence_header: bool,
    pub payload: Bytes,
}

impl MediaPacket {
    pub fn pts(&self) -> u32 {
        self.dts.wrapping_add(self.cts as u32)
    }

    pub fn audio(codec: MediaCodec, dts: u32, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Audio,
            codec,
            dts,
            cts: 0,
            keyframe: false,
            sequence_header: false,
            payload,
        }
    }

    pub fn video(codec: MediaCodec, dts: u32, cts: i32, keyframe: bool, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Video,
            codec,
            dts,
            cts,
            keyframe,
            sequence_header: false,
            payload,
        }
    }

    pub fn into_sequence_header(mut self) -> Self {
        self.sequence_header = true;
        self
    }
}
