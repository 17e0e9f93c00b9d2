use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, Header, FORMAT_PLI, HEADER_LENGTH};

/// RTCP picture loss indication (PT=206, FMT=1): a keyframe request for
/// the media SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PictureLossIndication {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl PictureLossIndication {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_PLI,
            packet_type: packet_type::PAYLOAD_FEEDBACK,
            length: 2,
        }
    }
}

impl MarshalSize for PictureLossIndication {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + 8
    }
}

impl Marshal for PictureLossIndication {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrShortBuffer);
        }
        let pos = self.header().marshal_to(buf)?;
        buf[pos..pos + 4].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[pos + 4..pos + 8].copy_from_slice(&self.media_ssrc.to_be_bytes());
        Ok(pos + 8)
    }
}

impl Unmarshal for PictureLossIndication {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        if header.packet_type != packet_type::PAYLOAD_FEEDBACK || header.count != FORMAT_PLI {
            return Err(Error::BadRtcpLength);
        }
        Self::unmarshal_body(raw, header)
    }
}

impl PictureLossIndication {
    pub(crate) fn unmarshal_body<B: Buf>(raw: &mut B, header: Header) -> Result<Self> {
        if raw.remaining() < header.body_len() || header.body_len() < 8 {
            return Err(Error::BadRtcpLength);
        }
        let pli = PictureLossIndication {
            sender_ssrc: raw.get_u32(),
            media_ssrc: raw.get_u32(),
        };
        raw.advance(header.body_len() - 8);
        Ok(pli)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let pli = PictureLossIndication {
            sender_ssrc: 0x1111,
            media_ssrc: 0x2222,
        };
        let raw = pli.marshal().unwrap();
        let mut buf = raw.clone();
        assert_eq!(PictureLossIndication::unmarshal(&mut buf).unwrap(), pli);
    }
}
