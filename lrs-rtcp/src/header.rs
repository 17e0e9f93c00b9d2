//! The common RTCP packet header.

use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LENGTH: usize = 4;
pub const VERSION: u8 = 2;

/// RTCP packet types.
pub mod packet_type {
    pub const SENDER_REPORT: u8 = 200;
    pub const RECEIVER_REPORT: u8 = 201;
    pub const SOURCE_DESCRIPTION: u8 = 202;
    pub const GOODBYE: u8 = 203;
    pub const APP: u8 = 204;
    pub const TRANSPORT_FEEDBACK: u8 = 205;
    pub const PAYLOAD_FEEDBACK: u8 = 206;
    pub const EXTENDED_REPORT: u8 = 207;
}

/// FMT values inside feedback packets.
pub const FORMAT_NACK: u8 = 1;
pub const FORMAT_TWCC: u8 = 15;
pub const FORMAT_PLI: u8 = 1;
pub const FORMAT_REMB: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub padding: bool,
    /// Reception report count or feedback format, depending on type.
    pub count: u8,
    pub packet_type: u8,
    /// Length of the packet body in 32-bit words, excluding this header.
    pub length: u16,
}

impl Header {
    pub fn body_len(&self) -> usize {
        self.length as usize * 4
    }
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH
    }
}

impl Marshal for Header {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::ErrShortBuffer);
        }
        buf[0] = (VERSION << 6) | ((self.padding as u8) << 5) | (self.count & 0x1F);
        buf[1] = self.packet_type;
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        Ok(HEADER_LENGTH)
    }
}

impl Unmarshal for Header {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if raw.remaining() < HEADER_LENGTH {
            return Err(Error::BadRtcpLength);
        }
        let b0 = raw.get_u8();
        let version = b0 >> 6;
        if version != VERSION {
            return Err(Error::BadRtcpVersion(version));
        }
        Ok(Header {
            padding: (b0 >> 5) & 0x01 != 0,
            count: b0 & 0x1F,
            packet_type: raw.get_u8(),
            length: raw.get_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let h = Header {
            padding: false,
            count: 1,
            packet_type: packet_type::SENDER_REPORT,
            length: 7,
        };
        let raw = h.marshal().unwrap();
        let mut buf = raw.clone();
        assert_eq!(Header::unmarshal(&mut buf).unwrap(), h);
    }

    #[test]
    fn test_bad_version() {
        let mut buf = bytes::Bytes::from_static(&[0x00, 200, 0, 0]);
        assert_eq!(Header::unmarshal(&mut buf), Err(Error::BadRtcpVersion(0)));
    }
}
