//! Packetized Elementary Stream header codec.

use bytes::{BufMut, BytesMut};
use shared::error::{Error, Result};

pub const STREAM_ID_VIDEO: u8 = 0xE0;
pub const STREAM_ID_AUDIO: u8 = 0xC0;

/// Parsed PES header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    /// 0 is legal for video and means "until next PUSI".
    pub packet_length: usize,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    /// Bytes consumed by the whole header.
    pub header_len: usize,
}

impl PesHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(Error::PesHeaderTooShort);
        }
        if buf[0] != 0 || buf[1] != 0 || buf[2] != 1 {
            return Err(Error::BadPesStartCode);
        }
        let stream_id = buf[3];
        let packet_length = ((buf[4] as usize) << 8) | buf[5] as usize;

        // Stream ids without the optional header (padding, private_stream_2
        // and friends) carry payload immediately.
        if matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF) {
            return Ok(Self {
                stream_id,
                packet_length,
                pts: None,
                dts: None,
                header_len: 6,
            });
        }

        if buf.len() < 9 {
            return Err(Error::PesHeaderTooShort);
        }
        let pts_dts_flags = (buf[7] & 0xC0) >> 6;
        let header_data_length = buf[8] as usize;
        let header_len = 9 + header_data_length;
        if buf.len() < header_len {
            return Err(Error::PesHeaderTooShort);
        }

        let mut pts = None;
        let mut dts = None;
        if pts_dts_flags == 2 {
            pts = Some(decode_ts(&buf[9..14])?);
        } else if pts_dts_flags == 3 {
            if header_data_length < 10 {
                return Err(Error::PesHeaderTooShort);
            }
            pts = Some(decode_ts(&buf[9..14])?);
            dts = Some(decode_ts(&buf[14..19])?);
        }

        Ok(Self {
            stream_id,
            packet_length,
            pts,
            dts,
            header_len,
        })
    }

    /// Encodes a full PES header for a payload of `payload_len` bytes.
    ///
    /// PTS is always written; DTS only when it differs from PTS, matching
    /// what the TS muxer in the original emits.
    pub fn encode(stream_id: u8, dts: u64, pts: u64, payload_len: usize) -> BytesMut {
        let write_dts = dts != pts;
        let header_data_length: usize = if write_dts { 10 } else { 5 };
        // flags byte + extension flags byte + header_data_length byte
        let after_length = 3 + header_data_length + payload_len;
        let packet_length: u16 = if after_length > 0xFFFF {
            0
        } else {
            after_length as u16
        };

        let mut buf = BytesMut::with_capacity(9 + header_data_length);
        buf.put_slice(&[0x00, 0x00, 0x01, stream_id]);
        buf.put_u16(packet_length);
        buf.put_u8(0x80); // '10', no scrambling, no priority
        buf.put_u8(if write_dts { 0xC0 } else { 0x80 });
        buf.put_u8(header_data_length as u8);
        encode_ts(&mut buf, if write_dts { 0b0011 } else { 0b0010 }, pts);
        if write_dts {
            encode_ts(&mut buf, 0b0001, dts);
        }
        buf
    }
}

fn decode_ts(b: &[u8]) -> Result<u64> {
    if b.len() < 5 {
        return Err(Error::PesHeaderTooShort);
    }
    Ok((((b[0] >> 1) & 0x07) as u64) << 30
        | (b[1] as u64) << 22
        | (((b[2] >> 1) & 0x7F) as u64) << 15
        | (b[3] as u64) << 7
        | ((b[4] >> 1) & 0x7F) as u64)
}

fn encode_ts(buf: &mut BytesMut, prefix: u8, ts: u64) {
    let ts = ts & 0x1_FFFF_FFFF;
    buf.put_u8((prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 0x01);
    buf.put_u8((ts >> 22) as u8);
    buf.put_u8((((ts >> 15) as u8 & 0x7F) << 1) | 0x01);
    buf.put_u8((ts >> 7) as u8);
    buf.put_u8((((ts & 0x7F) as u8) << 1) | 0x01);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip_with_dts() {
        let enc = PesHeader::encode(STREAM_ID_VIDEO, 900_000, 903_000, 1000);
        let h = PesHeader::parse(&enc).unwrap();
        assert_eq!(h.stream_id, STREAM_ID_VIDEO);
        assert_eq!(h.pts, Some(903_000));
        assert_eq!(h.dts, Some(900_000));
        assert_eq!(h.header_len, 19);
        assert_eq!(h.packet_length, 3 + 10 + 1000);
    }

    #[test]
    fn test_header_pts_only() {
        let enc = PesHeader::encode(STREAM_ID_AUDIO, 90_000, 90_000, 10);
        let h = PesHeader::parse(&enc).unwrap();
        assert_eq!(h.pts, Some(90_000));
        assert_eq!(h.dts, None);
        assert_eq!(h.header_len, 14);
    }

    #[test]
    fn test_zero_length_for_large_video() {
        let enc = PesHeader::encode(STREAM_ID_VIDEO, 0, 0, 70_000);
        let h = PesHeader::parse(&enc).unwrap();
        assert_eq!(h.packet_length, 0);
    }

    #[test]
    fn test_33bit_wrap() {
        let ts = 0x1_FFFF_FFFFu64;
        let enc = PesHeader::encode(STREAM_ID_VIDEO, ts, ts, 1);
        let h = PesHeader::parse(&enc).unwrap();
        assert_eq!(h.pts, Some(ts));
    }

    #[test]
    fn test_bad_start_code() {
        assert_eq!(
            PesHeader::parse(&[0, 0, 2, 0xE0, 0, 0]),
            Err(Error::BadPesStartCode)
        );
    }
}
