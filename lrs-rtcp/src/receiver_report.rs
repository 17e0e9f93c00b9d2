use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, Header, HEADER_LENGTH};
use crate::reception_report::{ReceptionReport, RECEPTION_REPORT_LENGTH};

/// RTCP receiver report (PT=201).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReceptionReport>,
    pub profile_extensions: Bytes,
}

impl ReceiverReport {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.reports.len() as u8,
            packet_type: packet_type::RECEIVER_REPORT,
            length: ((self.marshal_size() - HEADER_LENGTH) / 4) as u16,
        }
    }
}

impl MarshalSize for ReceiverReport {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH
            + 4
            + self.reports.len() * RECEPTION_REPORT_LENGTH
            + self.profile_extensions.len()
    }
}

impl Marshal for ReceiverReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrShortBuffer);
        }
        let mut pos = self.header().marshal_to(buf)?;
        buf[pos..pos + 4].copy_from_slice(&self.ssrc.to_be_bytes());
        pos += 4;
        for report in &self.reports {
            pos += report.marshal_to(&mut buf[pos..])?;
        }
        buf[pos..pos + self.profile_extensions.len()].copy_from_slice(&self.profile_extensions);
        Ok(pos + self.profile_extensions.len())
    }
}

impl Unmarshal for ReceiverReport {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        if header.packet_type != packet_type::RECEIVER_REPORT {
            return Err(Error::BadRtcpLength);
        }
        Self::unmarshal_body(raw, header)
    }
}

impl ReceiverReport {
    pub(crate) fn unmarshal_body<B: Buf>(raw: &mut B, header: Header) -> Result<Self> {
        if raw.remaining() < header.body_len() || header.body_len() < 4 {
            return Err(Error::BadRtcpLength);
        }
        let ssrc = raw.get_u32();
        let mut reports = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            reports.push(ReceptionReport::unmarshal(raw)?);
        }
        let ext_len = header
            .body_len()
            .checked_sub(4 + reports.len() * RECEPTION_REPORT_LENGTH)
            .ok_or(Error::BadRtcpLength)?;
        let profile_extensions = raw.copy_to_bytes(ext_len);
        Ok(ReceiverReport {
            ssrc,
            reports,
            profile_extensions,
        })
    }
}
