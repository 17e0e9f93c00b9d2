use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{padding_to_word, Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, Header, HEADER_LENGTH};

/// SDES item types; only CNAME is meaningful to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdesType {
    Cname = 1,
    Name = 2,
    Email = 3,
    Other = 0,
}

impl From<u8> for SdesType {
    fn from(v: u8) -> Self {
        match v {
            1 => SdesType::Cname,
            2 => SdesType::Name,
            3 => SdesType::Email,
            _ => SdesType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdesItem {
    pub sdes_type: SdesType,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdesChunk {
    pub source: u32,
    pub items: Vec<SdesItem>,
}

/// RTCP source description (PT=202); decoded for logging, ignored upstream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

impl SourceDescription {
    fn chunk_len(chunk: &SdesChunk) -> usize {
        let items: usize = chunk.items.iter().map(|i| 2 + i.text.len()).sum();
        // terminating null plus pad to word
        let raw = 4 + items + 1;
        raw + padding_to_word(raw)
    }

    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.chunks.len() as u8,
            packet_type: packet_type::SOURCE_DESCRIPTION,
            length: ((self.marshal_size() - HEADER_LENGTH) / 4) as u16,
        }
    }
}

impl MarshalSize for SourceDescription {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + self.chunks.iter().map(Self::chunk_len).sum::<usize>()
    }
}

impl Marshal for SourceDescription {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrShortBuffer);
        }
        let mut pos = self.header().marshal_to(buf)?;
        for chunk in &self.chunks {
            let start = pos;
            buf[pos..pos + 4].copy_from_slice(&chunk.source.to_be_bytes());
            pos += 4;
            for item in &chunk.items {
                buf[pos] = item.sdes_type as u8;
                buf[pos + 1] = item.text.len() as u8;
                pos += 2;
                buf[pos..pos + item.text.len()].copy_from_slice(item.text.as_bytes());
                pos += item.text.len();
            }
            buf[pos] = 0; // end of items
            pos += 1;
            while (pos - start) % 4 != 0 {
                buf[pos] = 0;
                pos += 1;
            }
        }
        Ok(pos)
    }
}

impl Unmarshal for SourceDescription {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        if header.packet_type != packet_type::SOURCE_DESCRIPTION {
            return Err(Error::BadRtcpLength);
        }
        Self::unmarshal_body(raw, header)
    }
}

impl SourceDescription {
    pub(crate) fn unmarshal_body<B: Buf>(raw: &mut B, header: Header) -> Result<Self> {
        if raw.remaining() < header.body_len() {
            return Err(Error::BadRtcpLength);
        }
        let mut body = vec![0u8; header.body_len()];
        raw.copy_to_slice(&mut body);

        let mut chunks = Vec::with_capacity(header.count as usize);
        let mut pos = 0;
        for _ in 0..header.count {
            if pos + 4 > body.len() {
                return Err(Error::BadRtcpLength);
            }
            let source = u32::from_be_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]]);
            pos += 4;
            let mut items = Vec::new();
            loop {
                if pos >= body.len() {
                    return Err(Error::BadRtcpLength);
                }
                let t = body[pos];
                pos += 1;
                if t == 0 {
                    break;
                }
                if pos >= body.len() {
                    return Err(Error::BadRtcpLength);
                }
                let len = body[pos] as usize;
                pos += 1;
                if pos + len > body.len() {
                    return Err(Error::BadRtcpLength);
                }
                let text = String::from_utf8_lossy(&body[pos..pos + len]).into_owned();
                pos += len;
                items.push(SdesItem {
                    sdes_type: SdesType::from(t),
                    text,
                });
            }
            while pos % 4 != 0 {
                pos += 1;
            }
            chunks.push(SdesChunk { source, items });
        }
        Ok(SourceDescription { chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let sdes = SourceDescription {
            chunks: vec![SdesChunk {
                source: 0xCAFE,
                items: vec![SdesItem {
                    sdes_type: SdesType::Cname,
                    text: "relay@example".into(),
                }],
            }],
        };
        let raw = sdes.marshal().unwrap();
        assert_eq!(raw.len() % 4, 0);
        let mut buf = raw.clone();
        assert_eq!(SourceDescription::unmarshal(&mut buf).unwrap(), sdes);
    }
}
