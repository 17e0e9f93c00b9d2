//! FLV tag bodies, as carried in RTMP audio/video messages.

use bytes::{BufMut, Bytes, BytesMut};

use shared::error::{Error, Result};

pub const FRAME_KEY: u8 = 1;
pub const FRAME_INTER: u8 = 2;

pub const CODEC_AVC: u8 = 7;
pub const CODEC_HEVC: u8 = 12;

pub const AVC_SEQUENCE_HEADER: u8 = 0;
pub const AVC_NALU: u8 = 1;

pub const SOUND_AAC: u8 = 10;
pub const SOUND_MP3: u8 = 2;

pub const AAC_SEQUENCE_HEADER: u8 = 0;
pub const AAC_RAW: u8 = 1;

/// Classification helpers over raw RTMP media payloads; cheap enough for
/// the hub's hot path.
pub fn is_video_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 2
        && (payload[0] >> 4) == FRAME_KEY
        && matches!(payload[0] & 0x0F, CODEC_AVC | CODEC_HEVC)
        && payload[1] == AVC_SEQUENCE_HEADER
}

pub fn is_audio_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 2 && (payload[0] >> 4) == SOUND_AAC && payload[1] == AAC_SEQUENCE_HEADER
}

pub fn is_video_keyframe(payload: &[u8]) -> bool {
    !payload.is_empty() && (payload[0] >> 4) == FRAME_KEY
}

/// Body of an AVC/HEVC video tag.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTagBody {
    pub keyframe: bool,
    pub codec_id: u8,
    pub packet_type: u8,
    /// Composition time offset (pts - dts) in milliseconds, signed 24-bit.
    pub cts: i32,
    pub data: Bytes,
}

impl VideoTagBody {
    pub fn parse(payload: &Bytes) -> Result<Self> {
        if payload.len() < 5 {
            return Err(Error::ErrShortBuffer);
        }
        let frame_type = payload[0] >> 4;
        let codec_id = payload[0] & 0x0F;
        let packet_type = payload[1];
        let raw = ((payload[2] as u32) << 16) | ((payload[3] as u32) << 8) | payload[4] as u32;
        // sign-extend 24 bits
        let cts = if raw & 0x80_0000 != 0 {
            (raw | 0xFF00_0000) as i32
        } else {
            raw as i32
        };
        Ok(Self {
            keyframe: frame_type == FRAME_KEY,
            codec_id,
            packet_type,
            cts,
            data: payload.slice(5..),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(5 + self.data.len());
        let frame_type = if self.keyframe { FRAME_KEY } else { FRAME_INTER };
        out.put_u8((frame_type << 4) | (self.codec_id & 0x0F));
        out.put_u8(self.packet_type);
        out.put_uint((self.cts as u32 & 0xFF_FFFF) as u64, 3);
        out.put_slice(&self.data);
        out.freeze()
    }
}

/// Body of an AAC audio tag.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTagBody {
    pub sound_format: u8,
    pub packet_type: u8,
    pub data: Bytes,
}

impl AudioTagBody {
    pub fn parse(payload: &Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::ErrShortBuffer);
        }
        let sound_format = payload[0] >> 4;
        if sound_format == SOUND_AAC {
            if payload.len() < 2 {
                return Err(Error::ErrShortBuffer);
            }
            Ok(Self {
                sound_format,
                packet_type: payload[1],
                data: payload.slice(2..),
            })
        } else {
            Ok(Self {
                sound_format,
                packet_type: AAC_RAW,
                data: payload.slice(1..),
            })
        }
    }

    /// Encodes an AAC tag; flags byte is 44.1kHz/16-bit/stereo, which
    /// players ignore for AAC in favor of the AudioSpecificConfig.
    pub fn encode_aac(packet_type: u8, data: &Bytes) -> Bytes {
        let mut out = BytesMut::with_capacity(2 + data.len());
        out.put_u8((SOUND_AAC << 4) | 0x0F);
        out.put_u8(packet_type);
        out.put_slice(data);
        out.freeze()
    }
}

pub const TAG_TYPE_AUDIO: u8 = 8;
pub const TAG_TYPE_VIDEO: u8 = 9;
pub const TAG_TYPE_SCRIPT: u8 = 18;

pub const FLV_FILE_HEADER: [u8; 13] = [
    b'F', b'L', b'V', 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

/// Frames one tag for file egress: 11-byte tag header, body, and the
/// trailing previous-tag-size.
pub fn encode_file_tag(tag_type: u8, timestamp: u32, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(11 + body.len() + 4);
    out.put_u8(tag_type);
    out.put_uint(body.len() as u64, 3);
    out.put_uint((timestamp & 0xFF_FFFF) as u64, 3);
    out.put_u8((timestamp >> 24) as u8);
    out.put_uint(0, 3); // stream id
    out.put_slice(body);
    out.put_u32(11 + body.len() as u32);
    out.freeze()
}

/// Parses one file tag at the start of `buf`; returns
/// `(tag_type, timestamp, body, total_consumed)`.
pub fn parse_file_tag(buf: &Bytes) -> Result<(u8, u32, Bytes, usize)> {
    if buf.len() < 11 {
        return Err(Error::ErrShortBuffer);
    }
    let tag_type = buf[0];
    let data_size = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
    let timestamp = ((buf[7] as u32) << 24)
        | ((buf[4] as u32) << 16)
        | ((buf[5] as u32) << 8)
        | buf[6] as u32;
    let total = 11 + data_size + 4;
    if buf.len() < total {
        return Err(Error::ErrShortBuffer);
    }
    Ok((tag_type, timestamp, buf.slice(11..11 + data_size), total))
}

/// Builds an AVCDecoderConfigurationRecord from the first SPS/PPS pair.
pub fn avc_decoder_configuration(sps: &[u8], pps: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(11 + sps.len() + pps.len());
    out.put_u8(0x01); // configurationVersion
    out.put_u8(sps.get(1).copied().unwrap_or(0)); // AVCProfileIndication
    out.put_u8(sps.get(2).copied().unwrap_or(0)); // profile_compatibility
    out.put_u8(sps.get(3).copied().unwrap_or(0)); // AVCLevelIndication
    out.put_u8(0xFF); // lengthSizeMinusOne = 3
    out.put_u8(0xE1); // one SPS
    out.put_u16(sps.len() as u16);
    out.put_slice(sps);
    out.put_u8(0x01); // one PPS
    out.put_u16(pps.len() as u16);
    out.put_slice(pps);
    out.freeze()
}

/// Prefixes each NALU with a 4-byte length (AVCC framing).
pub fn nalus_to_avcc(nalus: &[Bytes]) -> Bytes {
    let total: usize = nalus.iter().map(|n| 4 + n.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for nalu in nalus {
        out.put_u32(nalu.len() as u32);
        out.put_slice(nalu);
    }
    out.freeze()
}

/// Splits AVCC-framed data back into NALUs.
pub fn avcc_to_nalus(data: &Bytes) -> Result<Vec<Bytes>> {
    let mut nalus = Vec::new();
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += 4;
        if pos + len > data.len() {
            return Err(Error::ErrShortBuffer);
        }
        nalus.push(data.slice(pos..pos + len));
        pos += len;
    }
    if pos != data.len() {
        return Err(Error::ErrShortBuffer);
    }
    Ok(nalus)
}

/// Extracts SPS and PPS NALUs from an AVCDecoderConfigurationRecord.
pub fn parse_avc_decoder_configuration(data: &Bytes) -> Result<(Vec<Bytes>, Vec<Bytes>)> {
    if data.len() < 7 {
        return Err(Error::ErrShortBuffer);
    }
    let mut pos = 5;
    let num_sps = (data[pos] & 0x1F) as usize;
    pos += 1;
    let mut sps = Vec::with_capacity(num_sps);
    for _ in 0..num_sps {
        if pos + 2 > data.len() {
            return Err(Error::ErrShortBuffer);
        }
        let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2;
        if pos + len > data.len() {
            return Err(Error::ErrShortBuffer);
        }
        sps.push(data.slice(pos..pos + len));
        pos += len;
    }
    if pos >= data.len() {
        return Err(Error::ErrShortBuffer);
    }
    let num_pps = data[pos] as usize;
    pos += 1;
    let mut pps = Vec::with_capacity(num_pps);
    for _ in 0..num_pps {
        if pos + 2 > data.len() {
            return Err(Error::ErrShortBuffer);
        }
        let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2;
        if pos + len > data.len() {
            return Err(Error::ErrShortBuffer);
        }
        pps.push(data.slice(pos..pos + len));
        pos += len;
    }
    Ok((sps, pps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_tag_round_trip() {
        let tag = VideoTagBody {
            keyframe: true,
            codec_id: CODEC_AVC,
            packet_type: AVC_NALU,
            cts: 33,
            data: Bytes::from_static(&[0, 0, 0, 2, 0x65, 0x88]),
        };
        let enc = tag.encode();
        assert!(is_video_keyframe(&enc));
        assert!(!is_video_sequence_header(&enc));
        assert_eq!(VideoTagBody::parse(&enc).unwrap(), tag);
    }

    #[test]
    fn test_negative_cts() {
        let tag = VideoTagBody {
            keyframe: false,
            codec_id: CODEC_AVC,
            packet_type: AVC_NALU,
            cts: -5,
            data: Bytes::new(),
        };
        let got = VideoTagBody::parse(&tag.encode()).unwrap();
        assert_eq!(got.cts, -5);
        assert!(!got.keyframe);
    }

    #[test]
    fn test_sequence_header_classification() {
        let avc_sh = VideoTagBody {
            keyframe: true,
            codec_id: CODEC_AVC,
            packet_type: AVC_SEQUENCE_HEADER,
            cts: 0,
            data: Bytes::from_static(&[0x01, 0x42, 0xE0, 0x1F]),
        }
        .encode();
        assert!(is_video_sequence_header(&avc_sh));

        let aac_sh = AudioTagBody::encode_aac(AAC_SEQUENCE_HEADER, &Bytes::from_static(&[0x12, 0x10]));
        assert!(is_audio_sequence_header(&aac_sh));
        let aac_raw = AudioTagBody::encode_aac(AAC_RAW, &Bytes::from_static(&[1, 2, 3]));
        assert!(!is_audio_sequence_header(&aac_raw));
    }

    #[test]
    fn test_avcc_round_trip() {
        let nalus = vec![
            Bytes::from_static(&[0x67, 0x42]),
            Bytes::from_static(&[0x68, 0xCE]),
            Bytes::from_static(&[0x65, 0x88, 0x84]),
        ];
        let avcc = nalus_to_avcc(&nalus);
        assert_eq!(avcc_to_nalus(&avcc).unwrap(), nalus);
    }

    #[test]
    fn test_decoder_configuration_round_trip() {
        let sps = [0x67u8, 0x42, 0xE0, 0x1F, 0xD9];
        let pps = [0x68u8, 0xCE, 0x38, 0x80];
        let record = avc_decoder_configuration(&sps, &pps);
        assert_eq!(record[1], 0x42);
        assert_eq!(record[3], 0x1F);
        let (got_sps, got_pps) = parse_avc_decoder_configuration(&record).unwrap();
        assert_eq!(&got_sps[0][..], &sps[..]);
        assert_eq!(&got_pps[0][..], &pps[..]);
    }

    #[test]
    fn test_truncated_avcc() {
        let avcc = Bytes::from_static(&[0, 0, 0, 9, 0x65]);
        assert!(avcc_to_nalus(&avcc).is_err());
    }

    #[test]
    fn test_file_tag_round_trip() {
        // Timestamps past 24 bits use the extension byte.
        let body = [0xAAu8, 0xBB, 0xCC];
        let wire = encode_file_tag(TAG_TYPE_VIDEO, 0x0100_0040, &body);
        assert_eq!(wire.len(), 11 + 3 + 4);
        let (tag_type, timestamp, got, consumed) = parse_file_tag(&wire).unwrap();
        assert_eq!(tag_type, TAG_TYPE_VIDEO);
        assert_eq!(timestamp, 0x0100_0040);
        assert_eq!(&got[..], &body[..]);
        assert_eq!(consumed, wire.len());
        // previous-tag-size covers header + body.
        assert_eq!(&wire[wire.len() - 4..], &14u32.to_be_bytes());
    }
}
