//! MTU-aware payloaders feeding the RTP send path.

use bytes::{BufMut, Bytes, BytesMut};

use shared::error::{Error, Result};

use crate::header::Header;
use crate::packet::Packet;
use crate::sequence::Sequencer;

/// Payload budget per packet; leaves room for SRTP auth tags under a
/// 1500-byte path MTU.
pub const DEFAULT_MTU: usize = 1200;

const FUA_HEADER_SIZE: usize = 2;
const NALU_TYPE_FUA: u8 = 28;

/// Splits one H.264 NALU into RTP payloads: single-NALU when it fits,
/// FU-A fragments otherwise.
pub fn payload_h264(mtu: usize, nalu: &Bytes) -> Result<Vec<Bytes>> {
    if nalu.is_empty() {
        return Ok(Vec::new());
    }
    if nalu.len() <= mtu {
        return Ok(vec![nalu.clone()]);
    }
    if mtu <= FUA_HEADER_SIZE {
        return Err(Error::PayloadNotFragmentable);
    }

    let nri = nalu[0] & 0x60;
    let nalu_type = nalu[0] & 0x1F;
    let fu_indicator = nri | NALU_TYPE_FUA;

    let body = &nalu[1..];
    let chunk = mtu - FUA_HEADER_SIZE;
    let mut out = Vec::with_capacity(body.len() / chunk + 1);
    let mut pos = 0;
    while pos < body.len() {
        let take = (body.len() - pos).min(chunk);
        let start = pos == 0;
        let end = pos + take == body.len();
        let fu_header =
            ((start as u8) << 7) | ((end as u8) << 6) | nalu_type;
        let mut payload = BytesMut::with_capacity(FUA_HEADER_SIZE + take);
        payload.put_u8(fu_indicator);
        payload.put_u8(fu_header);
        payload.put_slice(&body[pos..pos + take]);
        out.push(payload.freeze());
        pos += take;
    }
    Ok(out)
}

/// Stamps payloads into packets on a media clock.
pub struct Packetizer {
    pub ssrc: u32,
    pub payload_type: u8,
    pub mtu: usize,
    sequencer: Sequencer,
}

impl Packetizer {
    pub fn new(ssrc: u32, payload_type: u8, mtu: usize) -> Self {
        Self {
            ssrc,
            payload_type,
            mtu,
            sequencer: Sequencer::new(),
        }
    }

    /// Packetizes one H.264 access unit; the marker bit is set on the last
    /// packet of the unit.
    pub fn packetize_h264(&mut self, timestamp: u32, nalus: &[Bytes]) -> Result<Vec<Packet>> {
        let mut payloads = Vec::new();
        for nalu in nalus {
            payloads.extend(payload_h264(self.mtu, nalu)?);
        }
        let count = payloads.len();
        Ok(payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Packet {
                header: Header {
                    version: 2,
                    marker: i + 1 == count,
                    payload_type: self.payload_type,
                    sequence_number: self.sequencer.next_sequence_number(),
                    timestamp,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload,
            })
            .collect())
    }

    /// One packet per audio frame; Opus and AAC frames fit any sane MTU.
    pub fn packetize_audio(&mut self, timestamp: u32, frame: Bytes) -> Packet {
        Packet {
            header: Header {
                version: 2,
                marker: true,
                payload_type: self.payload_type,
                sequence_number: self.sequencer.next_sequence_number(),
                timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload: frame,
        }
    }
}

/// Reassembles FU-A fragments back into a NALU; used by tests and by the
/// WebRTC ingest path.
#[derive(Default)]
pub struct FuaAssembler {
    buffer: BytesMut,
    active: bool,
}

impl FuaAssembler {
    /// Feeds one RTP payload; returns a complete NALU when one finishes.
    pub fn push(&mut self, payload: &Bytes) -> Option<Bytes> {
        if payload.len() < 2 {
            return None;
        }
        let nalu_type = payload[0] & 0x1F;
        if nalu_type != NALU_TYPE_FUA {
            // Plain single-NALU payload passes through.
            return Some(payload.clone());
        }
        let start = payload[1] & 0x80 != 0;
        let end = payload[1] & 0x40 != 0;
        if start {
            self.buffer.clear();
            let reconstructed = (payload[0] & 0x60) | (payload[1] & 0x1F);
            self.buffer.put_u8(reconstructed);
            self.active = true;
        }
        if !self.active {
            return None; // missed the start fragment
        }
        self.buffer.extend_from_slice(&payload[2..]);
        if end {
            self.active = false;
            return Some(self.buffer.split().freeze());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_nalu_single_packet() {
        let nalu = Bytes::from_static(&[0x65, 1, 2, 3]);
        let payloads = payload_h264(1200, &nalu).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], nalu);
    }

    #[test]
    fn test_fua_fragmentation_and_reassembly() {
        let mut nalu = vec![0x65u8]; // IDR, nri 3
        nalu.extend(std::iter::repeat(0xAB).take(3000));
        let nalu = Bytes::from(nalu);

        let payloads = payload_h264(1200, &nalu).unwrap();
        assert!(payloads.len() >= 3);
        // First fragment has S bit, last has E bit.
        assert_eq!(payloads[0][1] & 0x80, 0x80);
        assert_eq!(payloads.last().unwrap()[1] & 0x40, 0x40);
        for p in &payloads {
            assert!(p.len() <= 1200);
            assert_eq!(p[0] & 0x1F, NALU_TYPE_FUA);
        }

        let mut asm = FuaAssembler::default();
        let mut got = None;
        for p in &payloads {
            got = asm.push(p);
        }
        assert_eq!(got.unwrap(), nalu);
    }

    #[test]
    fn test_marker_on_last_packet_of_unit() {
        let mut p = Packetizer::new(1, 96, 1200);
        let nalus = vec![
            Bytes::from_static(&[0x67, 0x42]),
            Bytes::from_static(&[0x68, 0xCE]),
            Bytes::from(vec![0x65u8; 2000]),
        ];
        let pkts = p.packetize_h264(90_000, &nalus).unwrap();
        let markers: Vec<bool> = pkts.iter().map(|p| p.header.marker).collect();
        assert!(markers[..markers.len() - 1].iter().all(|m| !m));
        assert!(*markers.last().unwrap());
        // Sequence numbers are consecutive.
        let base = pkts[0].header.sequence_number;
        for (i, pkt) in pkts.iter().enumerate() {
            assert_eq!(pkt.header.sequence_number, base.wrapping_add(i as u16));
        }
    }

    #[test]
    fn test_missed_start_produces_nothing() {
        let mut nalu = vec![0x65u8];
        nalu.extend(std::iter::repeat(1u8).take(3000));
        let payloads = payload_h264(1200, &Bytes::from(nalu)).unwrap();
        let mut asm = FuaAssembler::default();
        // Skip the first fragment.
        for p in &payloads[1..] {
            assert!(asm.push(p).is_none());
        }
    }
}
