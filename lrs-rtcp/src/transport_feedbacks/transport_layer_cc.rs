//! Transport-wide congestion control feedback (PT=205, FMT=15).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|  FMT=15 |    PT=205     |           length              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     SSRC of packet sender                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      SSRC of media source                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      base sequence number     |      packet status count      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 reference time                | fb pkt. count |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          packet chunk         |         packet chunk          |
//! |                         ...                                   |
//! |         recv delta            |  recv delta   | zero padding  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{padding_to_word, Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, Header, FORMAT_TWCC, HEADER_LENGTH};

/// Scale factor for TWCC deltas (250 microseconds).
pub const TYPE_TCC_DELTA_SCALE_FACTOR: i64 = 250;

const BODY_FIXED: usize = 16;
const MAX_RUN_LENGTH: u16 = 0x1FFF;

/// Per-packet reception status symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolTypeTcc {
    #[default]
    PacketNotReceived = 0,
    PacketReceivedSmallDelta = 1,
    PacketReceivedLargeDelta = 2,
    PacketReceivedWithoutDelta = 3,
}

impl From<u8> for SymbolTypeTcc {
    fn from(v: u8) -> Self {
        match v & 0x03 {
            1 => SymbolTypeTcc::PacketReceivedSmallDelta,
            2 => SymbolTypeTcc::PacketReceivedLargeDelta,
            3 => SymbolTypeTcc::PacketReceivedWithoutDelta,
            _ => SymbolTypeTcc::PacketNotReceived,
        }
    }
}

impl SymbolTypeTcc {
    pub fn has_delta(&self) -> bool {
        matches!(
            self,
            SymbolTypeTcc::PacketReceivedSmallDelta | SymbolTypeTcc::PacketReceivedLargeDelta
        )
    }
}

/// Symbol width used by a status vector chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolSizeTypeTcc {
    #[default]
    OneBit = 0,
    TwoBit = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLengthChunk {
    pub packet_status_symbol: SymbolTypeTcc,
    pub run_length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusVectorChunk {
    pub symbol_size: SymbolSizeTypeTcc,
    pub symbol_list: Vec<SymbolTypeTcc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketStatusChunk {
    RunLengthChunk(RunLengthChunk),
    StatusVectorChunk(StatusVectorChunk),
}

impl PacketStatusChunk {
    pub fn symbols(&self) -> Vec<SymbolTypeTcc> {
        match self {
            PacketStatusChunk::RunLengthChunk(c) => {
                vec![c.packet_status_symbol; c.run_length as usize]
            }
            PacketStatusChunk::StatusVectorChunk(c) => c.symbol_list.clone(),
        }
    }

    fn encode(&self) -> u16 {
        match self {
            PacketStatusChunk::RunLengthChunk(c) => {
                ((c.packet_status_symbol as u16) << 13) | (c.run_length & MAX_RUN_LENGTH)
            }
            PacketStatusChunk::StatusVectorChunk(c) => {
                let mut v: u16 = 0x8000;
                match c.symbol_size {
                    SymbolSizeTypeTcc::OneBit => {
                        for (i, s) in c.symbol_list.iter().take(14).enumerate() {
                            if *s != SymbolTypeTcc::PacketNotReceived {
                                v |= 1 << (13 - i);
                            }
                        }
                    }
                    SymbolSizeTypeTcc::TwoBit => {
                        v |= 0x4000;
                        for (i, s) in c.symbol_list.iter().take(7).enumerate() {
                            v |= (*s as u16) << (12 - 2 * i);
                        }
                    }
                }
                v
            }
        }
    }

    fn decode(v: u16) -> Self {
        if v & 0x8000 == 0 {
            PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                packet_status_symbol: SymbolTypeTcc::from((v >> 13) as u8),
                run_length: v & MAX_RUN_LENGTH,
            })
        } else if v & 0x4000 == 0 {
            let symbol_list = (0..14)
                .map(|i| {
                    if v & (1 << (13 - i)) != 0 {
                        SymbolTypeTcc::PacketReceivedSmallDelta
                    } else {
                        SymbolTypeTcc::PacketNotReceived
                    }
                })
                .collect();
            PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                symbol_size: SymbolSizeTypeTcc::OneBit,
                symbol_list,
            })
        } else {
            let symbol_list = (0..7)
                .map(|i| SymbolTypeTcc::from(((v >> (12 - 2 * i)) & 0x03) as u8))
                .collect();
            PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                symbol_size: SymbolSizeTypeTcc::TwoBit,
                symbol_list,
            })
        }
    }
}

/// One arrival-time delta, scaled by 250us on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvDelta {
    pub type_tcc_packet: SymbolTypeTcc,
    /// Microseconds.
    pub delta: i64,
}

/// The TWCC feedback packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportLayerCc {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub base_sequence_number: u16,
    pub packet_status_count: u16,
    /// In 64ms units.
    pub reference_time: u32,
    pub fb_pkt_count: u8,
    pub packet_chunks: Vec<PacketStatusChunk>,
    pub recv_deltas: Vec<RecvDelta>,
}

impl TransportLayerCc {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_TWCC,
            packet_type: packet_type::TRANSPORT_FEEDBACK,
            length: ((self.marshal_size() - HEADER_LENGTH) / 4) as u16,
        }
    }

    fn deltas_len(&self) -> usize {
        self.recv_deltas
            .iter()
            .map(|d| match d.type_tcc_packet {
                SymbolTypeTcc::PacketReceivedSmallDelta => 1,
                _ => 2,
            })
            .sum()
    }
}

impl MarshalSize for TransportLayerCc {
    fn marshal_size(&self) -> usize {
        let raw = HEADER_LENGTH + BODY_FIXED + 2 * self.packet_chunks.len() + self.deltas_len();
        raw + padding_to_word(raw)
    }
}

impl Marshal for TransportLayerCc {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::ErrShortBuffer);
        }
        let mut pos = self.header().marshal_to(buf)?;
        buf[pos..pos + 4].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[pos + 4..pos + 8].copy_from_slice(&self.media_ssrc.to_be_bytes());
        buf[pos + 8..pos + 10].copy_from_slice(&self.base_sequence_number.to_be_bytes());
        buf[pos + 10..pos + 12].copy_from_slice(&self.packet_status_count.to_be_bytes());
        buf[pos + 12..pos + 15].copy_from_slice(&self.reference_time.to_be_bytes()[1..]);
        buf[pos + 15] = self.fb_pkt_count;
        pos += BODY_FIXED;

        for chunk in &self.packet_chunks {
            buf[pos..pos + 2].copy_from_slice(&chunk.encode().to_be_bytes());
            pos += 2;
        }

        for delta in &self.recv_deltas {
            let scaled = delta.delta / TYPE_TCC_DELTA_SCALE_FACTOR;
            match delta.type_tcc_packet {
                SymbolTypeTcc::PacketReceivedSmallDelta => {
                    if !(0..=255).contains(&scaled) {
                        return Err(Error::TwccDeltaOverflow);
                    }
                    buf[pos] = scaled as u8;
                    pos += 1;
                }
                _ => {
                    if !(i16::MIN as i64..=i16::MAX as i64).contains(&scaled) {
                        return Err(Error::TwccDeltaOverflow);
                    }
                    buf[pos..pos + 2].copy_from_slice(&(scaled as i16).to_be_bytes());
                    pos += 2;
                }
            }
        }

        while pos < size {
            buf[pos] = 0;
            pos += 1;
        }
        Ok(pos)
    }
}

impl Unmarshal for TransportLayerCc {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        if header.packet_type != packet_type::TRANSPORT_FEEDBACK || header.count != FORMAT_TWCC {
            return Err(Error::BadRtcpLength);
        }
        Self::unmarshal_body(raw, header)
    }
}

impl TransportLayerCc {
    pub(crate) fn unmarshal_body<B: Buf>(raw: &mut B, header: Header) -> Result<Self> {
        let body_len = header.body_len();
        if raw.remaining() < body_len || body_len < BODY_FIXED {
            return Err(Error::BadRtcpLength);
        }
        let sender_ssrc = raw.get_u32();
        let media_ssrc = raw.get_u32();
        let base_sequence_number = raw.get_u16();
        let packet_status_count = raw.get_u16();
        let reference_time = raw.get_uint(3) as u32;
        let fb_pkt_count = raw.get_u8();
        let mut consumed = BODY_FIXED;

        let mut packet_chunks = Vec::new();
        let mut symbols: Vec<SymbolTypeTcc> = Vec::with_capacity(packet_status_count as usize);
        while symbols.len() < packet_status_count as usize {
            if consumed + 2 > body_len {
                return Err(Error::BadRtcpLength);
            }
            let chunk = PacketStatusChunk::decode(raw.get_u16());
            consumed += 2;
            symbols.extend(chunk.symbols());
            packet_chunks.push(chunk);
        }

        let mut recv_deltas = Vec::new();
        for symbol in symbols.iter().take(packet_status_count as usize) {
            match symbol {
                SymbolTypeTcc::PacketReceivedSmallDelta => {
                    if consumed + 1 > body_len {
                        return Err(Error::BadRtcpLength);
                    }
                    recv_deltas.push(RecvDelta {
                        type_tcc_packet: *symbol,
                        delta: raw.get_u8() as i64 * TYPE_TCC_DELTA_SCALE_FACTOR,
                    });
                    consumed += 1;
                }
                SymbolTypeTcc::PacketReceivedLargeDelta => {
                    if consumed + 2 > body_len {
                        return Err(Error::BadRtcpLength);
                    }
                    recv_deltas.push(RecvDelta {
                        type_tcc_packet: *symbol,
                        delta: raw.get_i16() as i64 * TYPE_TCC_DELTA_SCALE_FACTOR,
                    });
                    consumed += 2;
                }
                _ => {}
            }
        }

        raw.advance(body_len - consumed);
        Ok(TransportLayerCc {
            sender_ssrc,
            media_ssrc,
            base_sequence_number,
            packet_status_count,
            reference_time,
            fb_pkt_count,
            packet_chunks,
            recv_deltas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_length_chunk_round_trip() {
        let chunk = PacketStatusChunk::RunLengthChunk(RunLengthChunk {
            packet_status_symbol: SymbolTypeTcc::PacketReceivedSmallDelta,
            run_length: 200,
        });
        assert_eq!(PacketStatusChunk::decode(chunk.encode()), chunk);
    }

    #[test]
    fn test_two_bit_vector_round_trip() {
        let chunk = PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
            symbol_size: SymbolSizeTypeTcc::TwoBit,
            symbol_list: vec![
                SymbolTypeTcc::PacketReceivedSmallDelta,
                SymbolTypeTcc::PacketNotReceived,
                SymbolTypeTcc::PacketReceivedLargeDelta,
                SymbolTypeTcc::PacketNotReceived,
                SymbolTypeTcc::PacketNotReceived,
                SymbolTypeTcc::PacketNotReceived,
                SymbolTypeTcc::PacketNotReceived,
            ],
        });
        assert_eq!(PacketStatusChunk::decode(chunk.encode()), chunk);
    }

    #[test]
    fn test_feedback_round_trip() {
        let cc = TransportLayerCc {
            sender_ssrc: 0x11111111,
            media_ssrc: 0x22222222,
            base_sequence_number: 100,
            packet_status_count: 3,
            reference_time: 0x123456,
            fb_pkt_count: 1,
            packet_chunks: vec![PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                packet_status_symbol: SymbolTypeTcc::PacketReceivedSmallDelta,
                run_length: 3,
            })],
            recv_deltas: vec![
                RecvDelta {
                    type_tcc_packet: SymbolTypeTcc::PacketReceivedSmallDelta,
                    delta: 1000,
                },
                RecvDelta {
                    type_tcc_packet: SymbolTypeTcc::PacketReceivedSmallDelta,
                    delta: 250,
                },
                RecvDelta {
                    type_tcc_packet: SymbolTypeTcc::PacketReceivedSmallDelta,
                    delta: 0,
                },
            ],
        };
        let raw = cc.marshal().unwrap();
        assert_eq!(raw.len() % 4, 0);
        let mut buf = raw.clone();
        assert_eq!(TransportLayerCc::unmarshal(&mut buf).unwrap(), cc);
    }

    #[test]
    fn test_large_delta_and_loss() {
        let cc = TransportLayerCc {
            sender_ssrc: 1,
            media_ssrc: 2,
            base_sequence_number: 0,
            packet_status_count: 7,
            reference_time: 0,
            fb_pkt_count: 0,
            packet_chunks: vec![PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                symbol_size: SymbolSizeTypeTcc::TwoBit,
                symbol_list: vec![
                    SymbolTypeTcc::PacketReceivedSmallDelta,
                    SymbolTypeTcc::PacketNotReceived,
                    SymbolTypeTcc::PacketReceivedLargeDelta,
                    SymbolTypeTcc::PacketNotReceived,
                    SymbolTypeTcc::PacketNotReceived,
                    SymbolTypeTcc::PacketNotReceived,
                    SymbolTypeTcc::PacketNotReceived,
                ],
            })],
            recv_deltas: vec![
                RecvDelta {
                    type_tcc_packet: SymbolTypeTcc::PacketReceivedSmallDelta,
                    delta: 500,
                },
                RecvDelta {
                    type_tcc_packet: SymbolTypeTcc::PacketReceivedLargeDelta,
                    delta: -1000,
                },
            ],
        };
        let raw = cc.marshal().unwrap();
        let mut buf = raw.clone();
        assert_eq!(TransportLayerCc::unmarshal(&mut buf).unwrap(), cc);
    }

    #[test]
    fn test_small_delta_overflow() {
        let cc = TransportLayerCc {
            packet_status_count: 1,
            packet_chunks: vec![PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                packet_status_symbol: SymbolTypeTcc::PacketReceivedSmallDelta,
                run_length: 1,
            })],
            recv_deltas: vec![RecvDelta {
                type_tcc_packet: SymbolTypeTcc::PacketReceivedSmallDelta,
                delta: 64_000, // 256 * 250us
            }],
            ..Default::default()
        };
        assert_eq!(cc.marshal(), Err(Error::TwccDeltaOverflow));
    }
}
