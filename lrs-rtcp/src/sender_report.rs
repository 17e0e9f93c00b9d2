use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, Header, HEADER_LENGTH};
use crate::reception_report::{ReceptionReport, RECEPTION_REPORT_LENGTH};

const SR_BODY_FIXED: usize = 24;

/// RTCP sender report (PT=200).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_time: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReceptionReport>,
    pub profile_extensions: Bytes,
}

impl SenderReport {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.reports.len() as u8,
            packet_type: packet_type::SENDER_REPORT,
            length: ((self.marshal_size() - HEADER_LENGTH) / 4) as u16,
        }
    }
}

impl MarshalSize for SenderReport {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH
            + SR_BODY_FIXED
            + self.reports.len() * RECEPTION_REPORT_LENGTH
            + self.profile_extensions.len()
    }
}

impl Marshal for SenderReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrShortBuffer);
        }
        let mut pos = self.header().marshal_to(buf)?;
        buf[pos..pos + 4].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[pos + 4..pos + 12].copy_from_slice(&self.ntp_time.to_be_bytes());
        buf[pos + 12..pos + 16].copy_from_slice(&self.rtp_time.to_be_bytes());
        buf[pos + 16..pos + 20].copy_from_slice(&self.packet_count.to_be_bytes());
        buf[pos + 20..pos + 24].copy_from_slice(&self.octet_count.to_be_bytes());
        pos += SR_BODY_FIXED;
        for report in &self.reports {
            pos += report.marshal_to(&mut buf[pos..])?;
        }
        buf[pos..pos + self.profile_extensions.len()].copy_from_slice(&self.profile_extensions);
        Ok(pos + self.profile_extensions.len())
    }
}

impl Unmarshal for SenderReport {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        if header.packet_type != packet_type::SENDER_REPORT {
            return Err(Error::BadRtcpLength);
        }
        Self::unmarshal_body(raw, header)
    }
}

impl SenderReport {
    pub(crate) fn unmarshal_body<B: Buf>(raw: &mut B, header: Header) -> Result<Self> {
        if raw.remaining() < header.body_len() || header.body_len() < SR_BODY_FIXED {
            return Err(Error::BadRtcpLength);
        }
        let ssrc = raw.get_u32();
        let ntp_time = raw.get_u64();
        let rtp_time = raw.get_u32();
        let packet_count = raw.get_u32();
        let octet_count = raw.get_u32();
        let mut reports = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            reports.push(ReceptionReport::unmarshal(raw)?);
        }
        let ext_len = header
            .body_len()
            .checked_sub(SR_BODY_FIXED + reports.len() * RECEPTION_REPORT_LENGTH)
            .ok_or(Error::BadRtcpLength)?;
        let profile_extensions = raw.copy_to_bytes(ext_len);
        Ok(SenderReport {
            ssrc,
            ntp_time,
            rtp_time,
            packet_count,
            octet_count,
            reports,
            profile_extensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_reports() {
        let sr = SenderReport {
            ssrc: 0x902f9e2e,
            ntp_time: 0xda8bd1fcdddda05a,
            rtp_time: 0xaaf4edd5,
            packet_count: 1000,
            octet_count: 50000,
            reports: vec![ReceptionReport {
                ssrc: 0xbc5e9a40,
                fraction_lost: 10,
                total_lost: 100,
                last_sequence_number: 0x46e1,
                jitter: 273,
                last_sender_report: 0x9f36432,
                delay: 150137,
            }],
            profile_extensions: Bytes::new(),
        };
        let raw = sr.marshal().unwrap();
        let mut buf = raw.clone();
        assert_eq!(SenderReport::unmarshal(&mut buf).unwrap(), sr);
    }

    #[test]
    fn test_truncated() {
        let sr = SenderReport::default();
        let raw = sr.marshal().unwrap();
        let mut buf = raw.slice(..raw.len() - 2);
        assert!(SenderReport::unmarshal(&mut buf).is_err());
    }
}
