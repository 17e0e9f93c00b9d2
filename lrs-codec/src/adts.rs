//! ADTS framing for AAC elementary streams.

use bytes::Bytes;
use shared::error::{Error, Result};

/// Sample rates by ADTS `sampling_frequency_index`.
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Parsed 7-byte ADTS header (the CRC-protected 9-byte form is accepted;
/// the CRC itself is not verified, matching the original ingest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type (1 = AAC Main, 2 = AAC LC, ...).
    pub aac_object_type: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
    /// Total frame length including the ADTS header itself.
    pub frame_length: usize,
    /// Header size in bytes: 7, or 9 with CRC.
    pub header_len: usize,
}

impl AdtsHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 7 {
            return Err(Error::AdtsHeaderTooShort);
        }
        if buf[0] != 0xFF || (buf[1] & 0xF0) != 0xF0 {
            return Err(Error::AdtsBadSyncword);
        }
        let protection_absent = buf[1] & 0x01 != 0;
        let profile = (buf[2] >> 6) & 0x03;
        let sample_rate_index = (buf[2] >> 2) & 0x0F;
        let channel_config = ((buf[2] & 0x01) << 2) | ((buf[3] >> 6) & 0x03);
        let frame_length = (((buf[3] & 0x03) as usize) << 11)
            | ((buf[4] as usize) << 3)
            | ((buf[5] as usize) >> 5);
        let header_len = if protection_absent { 7 } else { 9 };
        if frame_length < header_len {
            return Err(Error::AdtsHeaderTooShort);
        }
        Ok(Self {
            aac_object_type: profile + 1,
            sample_rate_index,
            channel_config,
            frame_length,
            header_len,
        })
    }

    pub fn sample_rate(&self) -> Option<u32> {
        SAMPLE_RATES.get(self.sample_rate_index as usize).copied()
    }

    /// Builds a 7-byte protection-absent header for a raw frame of
    /// `payload_len` bytes.
    pub fn build(&self, payload_len: usize) -> [u8; 7] {
        let frame_length = payload_len + 7;
        let profile = self.aac_object_type - 1;
        [
            0xFF,
            0xF1,
            (profile << 6) | (self.sample_rate_index << 2) | (self.channel_config >> 2),
            ((self.channel_config & 0x03) << 6) | ((frame_length >> 11) as u8 & 0x03),
            (frame_length >> 3) as u8,
            (((frame_length & 0x07) as u8) << 5) | 0x1F,
            0xFC,
        ]
    }

    /// MPEG-4 AudioSpecificConfig for the parsed parameters, as carried in
    /// AAC sequence headers.
    pub fn audio_specific_config(&self) -> [u8; 2] {
        [
            (self.aac_object_type << 3) | (self.sample_rate_index >> 1),
            ((self.sample_rate_index & 0x01) << 7) | (self.channel_config << 3),
        ]
    }
}

/// One de-framed AAC frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AacFrame {
    pub header: AdtsHeader,
    /// Raw AAC without the ADTS prefix.
    pub payload: Bytes,
}

/// Splits a buffer of back-to-back ADTS frames into raw AAC frames.
pub fn split_frames(buf: &Bytes) -> Result<Vec<AacFrame>> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + 7 <= buf.len() {
        let header = AdtsHeader::parse(&buf[pos..])?;
        let end = pos + header.frame_length;
        if end > buf.len() {
            return Err(Error::AdtsFrameTruncated(header.frame_length));
        }
        frames.push(AacFrame {
            header,
            payload: buf.slice(pos + header.header_len..end),
        });
        pos = end;
    }
    if pos != buf.len() {
        return Err(Error::AdtsHeaderTooShort);
    }
    Ok(frames)
}
