use bytes::{Buf, Bytes};
use std::fmt;

use shared::error::Result;
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::Header;

/// A full RTP packet. The payload is shared-ownership so retransmit
/// buffers and fanout paths clone cheaply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RTP pt={} seq={} ts={} ssrc={:#x} len={}",
            self.header.payload_type,
            self.header.sequence_number,
            self.header.timestamp,
            self.header.ssrc,
            self.payload.len()
        )
    }
}

impl MarshalSize for Packet {
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len()
    }
}

impl Marshal for Packet {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.header.marshal_to(buf)?;
        buf[n..n + self.payload.len()].copy_from_slice(&self.payload);
        Ok(n + self.payload.len())
    }
}

impl Unmarshal for Packet {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        let payload = raw.copy_to_bytes(raw.remaining());
        Ok(Packet { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_round_trip() {
        let pkt = Packet {
            header: Header {
                payload_type: 96,
                sequence_number: 1234,
                timestamp: 90000,
                ssrc: 0xCAFE,
                marker: true,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x65, 0x88, 0x84, 0x00]),
        };
        let raw = pkt.marshal().unwrap();
        let mut buf = raw.clone();
        let got = Packet::unmarshal(&mut buf).unwrap();
        assert_eq!(got, pkt);
    }

    #[test]
    fn test_empty_payload() {
        let pkt = Packet::default();
        // version is filled by marshal
        let raw = pkt.marshal().unwrap();
        let mut buf = raw.clone();
        let got = Packet::unmarshal(&mut buf).unwrap();
        assert!(got.payload.is_empty());
    }
}
