//! RTCP extended reports (PT=207). RRTR (BT=4) and DLRR (BT=5) are typed;
//! other block types are retained raw.

use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, Header, HEADER_LENGTH};

pub const BLOCK_TYPE_RRTR: u8 = 4;
pub const BLOCK_TYPE_DLRR: u8 = 5;

/// Receiver reference time block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RrtrBlock {
    pub ntp_time: u64,
}

/// One DLRR sub-report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlrrReport {
    pub ssrc: u32,
    /// Middle 32 bits of the RRTR NTP time this answers.
    pub last_rr: u32,
    /// Delay since that RRTR in 1/65536 seconds.
    pub dlrr: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportBlock {
    Rrtr(RrtrBlock),
    Dlrr(Vec<DlrrReport>),
    Raw { block_type: u8, body: Bytes },
}

impl ReportBlock {
    fn body_len(&self) -> usize {
        match self {
            ReportBlock::Rrtr(_) => 8,
            ReportBlock::Dlrr(reports) => 12 * reports.len(),
            ReportBlock::Raw { body, .. } => body.len(),
        }
    }
}

/// An XR packet: originating SSRC plus report blocks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtendedReport {
    pub ssrc: u32,
    pub blocks: Vec<ReportBlock>,
}

impl ExtendedReport {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: 0,
            packet_type: packet_type::EXTENDED_REPORT,
            length: ((self.marshal_size() - HEADER_LENGTH) / 4) as u16,
        }
    }

    /// First DLRR block, if present.
    pub fn dlrr(&self) -> Option<&Vec<DlrrReport>> {
        self.blocks.iter().find_map(|b| match b {
            ReportBlock::Dlrr(r) => Some(r),
            _ => None,
        })
    }
}

impl MarshalSize for ExtendedReport {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + 4 + self.blocks.iter().map(|b| 4 + b.body_len()).sum::<usize>()
    }
}

impl Marshal for ExtendedReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrShortBuffer);
        }
        let mut pos = self.header().marshal_to(buf)?;
        buf[pos..pos + 4].copy_from_slice(&self.ssrc.to_be_bytes());
        pos += 4;
        for block in &self.blocks {
            let (bt, len_words) = match block {
                ReportBlock::Rrtr(_) => (BLOCK_TYPE_RRTR, 2u16),
                ReportBlock::Dlrr(reports) => (BLOCK_TYPE_DLRR, (3 * reports.len()) as u16),
                ReportBlock::Raw { block_type, body } => (*block_type, (body.len() / 4) as u16),
            };
            buf[pos] = bt;
            buf[pos + 1] = 0;
            buf[pos + 2..pos + 4].copy_from_slice(&len_words.to_be_bytes());
            pos += 4;
            match block {
                ReportBlock::Rrtr(rrtr) => {
                    buf[pos..pos + 8].copy_from_slice(&rrtr.ntp_time.to_be_bytes());
                    pos += 8;
                }
                ReportBlock::Dlrr(reports) => {
                    for r in reports {
                        buf[pos..pos + 4].copy_from_slice(&r.ssrc.to_be_bytes());
                        buf[pos + 4..pos + 8].copy_from_slice(&r.last_rr.to_be_bytes());
                        buf[pos + 8..pos + 12].copy_from_slice(&r.dlrr.to_be_bytes());
                        pos += 12;
                    }
                }
                ReportBlock::Raw { body, .. } => {
                    buf[pos..pos + body.len()].copy_from_slice(body);
                    pos += body.len();
                }
            }
        }
        Ok(pos)
    }
}

impl Unmarshal for ExtendedReport {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        if header.packet_type != packet_type::EXTENDED_REPORT {
            return Err(Error::BadRtcpLength);
        }
        Self::unmarshal_body(raw, header)
    }
}

impl ExtendedReport {
    pub(crate) fn unmarshal_body<B: Buf>(raw: &mut B, header: Header) -> Result<Self> {
        let body_len = header.body_len();
        if raw.remaining() < body_len || body_len < 4 {
            return Err(Error::BadRtcpLength);
        }
        let ssrc = raw.get_u32();
        let mut consumed = 4;
        let mut blocks = Vec::new();
        while consumed + 4 <= body_len {
            let block_type = raw.get_u8();
            let _reserved = raw.get_u8();
            let len = raw.get_u16() as usize * 4;
            consumed += 4;
            if consumed + len > body_len {
                return Err(Error::BadRtcpLength);
            }
            match block_type {
                BLOCK_TYPE_RRTR if len == 8 => {
                    blocks.push(ReportBlock::Rrtr(RrtrBlock {
                        ntp_time: raw.get_u64(),
                    }));
                }
                BLOCK_TYPE_DLRR if len % 12 == 0 => {
                    let mut reports = Vec::with_capacity(len / 12);
                    for _ in 0..len / 12 {
                        reports.push(DlrrReport {
                            ssrc: raw.get_u32(),
                            last_rr: raw.get_u32(),
                            dlrr: raw.get_u32(),
                        });
                    }
                    blocks.push(ReportBlock::Dlrr(reports));
                }
                _ => {
                    blocks.push(ReportBlock::Raw {
                        block_type,
                        body: raw.copy_to_bytes(len),
                    });
                }
            }
            consumed += len;
        }
        raw.advance(body_len - consumed);
        Ok(ExtendedReport { ssrc, blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rrtr_dlrr_round_trip() {
        let xr = ExtendedReport {
            ssrc: 0x1234,
            blocks: vec![
                ReportBlock::Rrtr(RrtrBlock {
                    ntp_time: 0xDA8BD1FC_DDDDA05A,
                }),
                ReportBlock::Dlrr(vec![DlrrReport {
                    ssrc: 0x5678,
                    last_rr: 0x9F36432,
                    dlrr: 65536,
                }]),
            ],
        };
        let raw = xr.marshal().unwrap();
        let mut buf = raw.clone();
        let got = ExtendedReport::unmarshal(&mut buf).unwrap();
        assert_eq!(got, xr);
        assert_eq!(got.dlrr().unwrap()[0].ssrc, 0x5678);
    }

    #[test]
    fn test_unknown_block_retained() {
        let xr = ExtendedReport {
            ssrc: 9,
            blocks: vec![ReportBlock::Raw {
                block_type: 7,
                body: Bytes::from_static(&[1, 2, 3, 4]),
            }],
        };
        let raw = xr.marshal().unwrap();
        let mut buf = raw.clone();
        assert_eq!(ExtendedReport::unmarshal(&mut buf).unwrap(), xr);
    }
}
