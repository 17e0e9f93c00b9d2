use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, Header, FORMAT_NACK, HEADER_LENGTH};

/// One NACK entry: a base packet id plus a bitmap of the following 16
/// sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_packets: u16,
}

impl NackPair {
    /// Every sequence number this pair declares lost.
    pub fn packet_list(&self) -> Vec<u16> {
        let mut seqs = vec![self.packet_id];
        for i in 0..16 {
            if self.lost_packets & (1 << i) != 0 {
                seqs.push(self.packet_id.wrapping_add(i + 1));
            }
        }
        seqs
    }
}

/// Packs a sorted-or-not list of lost sequence numbers into pid+blp pairs.
pub fn nack_pairs_from_sequence_numbers(seqs: &[u16]) -> Vec<NackPair> {
    let mut pairs: Vec<NackPair> = Vec::new();
    for &seq in seqs {
        match pairs.last_mut() {
            Some(pair) => {
                let dist = seq.wrapping_sub(pair.packet_id);
                if dist > 0 && dist <= 16 {
                    pair.lost_packets |= 1 << (dist - 1);
                    continue;
                }
                pairs.push(NackPair {
                    packet_id: seq,
                    lost_packets: 0,
                });
            }
            None => pairs.push(NackPair {
                packet_id: seq,
                lost_packets: 0,
            }),
        }
    }
    pairs
}

/// RTCP transport-layer NACK (PT=205, FMT=1).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransportLayerNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub nacks: Vec<NackPair>,
}

impl TransportLayerNack {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_NACK,
            packet_type: packet_type::TRANSPORT_FEEDBACK,
            length: (2 + self.nacks.len()) as u16,
        }
    }

    /// Flattened list of all lost sequence numbers.
    pub fn lost_sequences(&self) -> Vec<u16> {
        self.nacks.iter().flat_map(|p| p.packet_list()).collect()
    }
}

impl MarshalSize for TransportLayerNack {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + 8 + 4 * self.nacks.len()
    }
}

impl Marshal for TransportLayerNack {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrShortBuffer);
        }
        let mut pos = self.header().marshal_to(buf)?;
        buf[pos..pos + 4].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[pos + 4..pos + 8].copy_from_slice(&self.media_ssrc.to_be_bytes());
        pos += 8;
        for pair in &self.nacks {
            buf[pos..pos + 2].copy_from_slice(&pair.packet_id.to_be_bytes());
            buf[pos + 2..pos + 4].copy_from_slice(&pair.lost_packets.to_be_bytes());
            pos += 4;
        }
        Ok(pos)
    }
}

impl Unmarshal for TransportLayerNack {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        if header.packet_type != packet_type::TRANSPORT_FEEDBACK || header.count != FORMAT_NACK {
            return Err(Error::BadRtcpLength);
        }
        Self::unmarshal_body(raw, header)
    }
}

impl TransportLayerNack {
    pub(crate) fn unmarshal_body<B: Buf>(raw: &mut B, header: Header) -> Result<Self> {
        if raw.remaining() < header.body_len() || header.body_len() < 8 {
            return Err(Error::BadRtcpLength);
        }
        let sender_ssrc = raw.get_u32();
        let media_ssrc = raw.get_u32();
        let n_pairs = (header.body_len() - 8) / 4;
        let mut nacks = Vec::with_capacity(n_pairs);
        for _ in 0..n_pairs {
            nacks.push(NackPair {
                packet_id: raw.get_u16(),
                lost_packets: raw.get_u16(),
            });
        }
        Ok(TransportLayerNack {
            sender_ssrc,
            media_ssrc,
            nacks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let nack = TransportLayerNack {
            sender_ssrc: 0x902f9e2e,
            media_ssrc: 0x902f9e2e,
            nacks: vec![NackPair {
                packet_id: 1,
                lost_packets: 0xAAAA,
            }],
        };
        let raw = nack.marshal().unwrap();
        let mut buf = raw.clone();
        assert_eq!(TransportLayerNack::unmarshal(&mut buf).unwrap(), nack);
    }

    #[test]
    fn test_pair_packing() {
        let pairs = nack_pairs_from_sequence_numbers(&[100, 101, 103, 120]);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].packet_id, 100);
        assert_eq!(pairs[0].lost_packets, 0b101); // 101 and 103
        assert_eq!(pairs[1].packet_id, 120);

        assert_eq!(pairs[0].packet_list(), vec![100, 101, 103]);
    }

    #[test]
    fn test_single_loss_bitmap_form() {
        // The canonical case: {102} lost out of {100,101,103,104}.
        let pairs = nack_pairs_from_sequence_numbers(&[102]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 102);
        assert_eq!(pairs[0].lost_packets, 0);
    }

    #[test]
    fn test_wraparound_packing() {
        let pairs = nack_pairs_from_sequence_numbers(&[65535, 0, 1]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 65535);
        assert_eq!(pairs[0].lost_packets, 0b11);
    }
}
