use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, Header, HEADER_LENGTH};

/// RTCP BYE (PT=203). The reason string is dropped on decode, which is
/// all the relay needs to stop a publisher.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Goodbye {
    pub sources: Vec<u32>,
}

impl Goodbye {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.sources.len() as u8,
            packet_type: packet_type::GOODBYE,
            length: self.sources.len() as u16,
        }
    }
}

impl MarshalSize for Goodbye {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + 4 * self.sources.len()
    }
}

impl Marshal for Goodbye {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrShortBuffer);
        }
        let mut pos = self.header().marshal_to(buf)?;
        for ssrc in &self.sources {
            buf[pos..pos + 4].copy_from_slice(&ssrc.to_be_bytes());
            pos += 4;
        }
        Ok(pos)
    }
}

impl Unmarshal for Goodbye {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        if header.packet_type != packet_type::GOODBYE {
            return Err(Error::BadRtcpLength);
        }
        Self::unmarshal_body(raw, header)
    }
}

impl Goodbye {
    pub(crate) fn unmarshal_body<B: Buf>(raw: &mut B, header: Header) -> Result<Self> {
        if raw.remaining() < header.body_len() || header.body_len() < 4 * header.count as usize {
            return Err(Error::BadRtcpLength);
        }
        let mut sources = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            sources.push(raw.get_u32());
        }
        // reason string + padding
        let rest = header.body_len() - 4 * header.count as usize;
        raw.advance(rest);
        Ok(Goodbye { sources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let bye = Goodbye {
            sources: vec![1, 2, 3],
        };
        let raw = bye.marshal().unwrap();
        let mut buf = raw.clone();
        assert_eq!(Goodbye::unmarshal(&mut buf).unwrap(), bye);
    }
}
