//! Program-specific information: PAT and PMT sections.

use crc::{Crc, CRC_32_MPEG_2};
use shared::error::{Error, Result};

pub const CRC32_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_PMT: u8 = 0x02;

/// Program Association Table: program number → PMT pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pat {
    pub transport_stream_id: u16,
    pub version: u8,
    pub programs: Vec<(u16, u16)>,
}

/// One elementary stream declared by the PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: u16,
}

/// Program Map Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pmt {
    pub program_number: u16,
    pub version: u8,
    pub pcr_pid: u16,
    pub streams: Vec<PmtStream>,
}

/// Strips the pointer field and validates the section frame common to PAT
/// and PMT. Returns the version and the section body after the 5 fixed
/// bytes, exclusive of CRC.
fn open_section(payload: &[u8], expect_table: u8) -> Result<(u8, &[u8])> {
    if payload.is_empty() {
        return Err(Error::SectionTooShort);
    }
    let pointer = payload[0] as usize;
    let payload = payload
        .get(1 + pointer..)
        .ok_or(Error::SectionTooShort)?;
    if payload.len() < 8 {
        return Err(Error::SectionTooShort);
    }
    if payload[0] != expect_table {
        return Err(Error::SectionTooShort);
    }
    let section_length = (((payload[1] & 0x0F) as usize) << 8) | payload[2] as usize;
    let total = 3 + section_length;
    if payload.len() < total || section_length < 9 {
        return Err(Error::SectionTooShort);
    }
    let section = &payload[..total];
    let crc_pos = total - 4;
    let expected = u32::from_be_bytes([
        section[crc_pos],
        section[crc_pos + 1],
        section[crc_pos + 2],
        section[crc_pos + 3],
    ]);
    if CRC32_MPEG2.checksum(&section[..crc_pos]) != expected {
        return Err(Error::CrcMismatch);
    }
    let version = (section[5] & 0x3E) >> 1;
    Ok((version, &section[8..crc_pos]))
}

impl Pat {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (version, body) = open_section(payload, TABLE_ID_PAT)?;
        let pointer = payload[0] as usize;
        let section = &payload[1 + pointer..];
        let transport_stream_id = ((section[3] as u16) << 8) | section[4] as u16;

        let mut programs = Vec::new();
        for chunk in body.chunks_exact(4) {
            let program_number = ((chunk[0] as u16) << 8) | chunk[1] as u16;
            let pid = (((chunk[2] & 0x1F) as u16) << 8) | chunk[3] as u16;
            if program_number != 0 {
                programs.push((program_number, pid));
            }
        }
        Ok(Self {
            transport_stream_id,
            version,
            programs,
        })
    }

    /// Encodes the section including pointer field, ready to be the payload
    /// of a PUSI packet.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16);
        for &(program_number, pid) in &self.programs {
            body.extend_from_slice(&program_number.to_be_bytes());
            body.push(0xE0 | (pid >> 8) as u8);
            body.push((pid & 0xFF) as u8);
        }
        encode_section(
            TABLE_ID_PAT,
            self.transport_stream_id,
            self.version,
            &body,
        )
    }
}

impl Pmt {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (version, body) = open_section(payload, TABLE_ID_PMT)?;
        let pointer = payload[0] as usize;
        let section = &payload[1 + pointer..];
        let program_number = ((section[3] as u16) << 8) | section[4] as u16;

        if body.len() < 4 {
            return Err(Error::SectionTooShort);
        }
        let pcr_pid = (((body[0] & 0x1F) as u16) << 8) | body[1] as u16;
        let program_info_length = (((body[2] & 0x0F) as usize) << 8) | body[3] as usize;
        let mut pos = 4 + program_info_length;

        let mut streams = Vec::new();
        while pos + 5 <= body.len() {
            let stream_type = body[pos];
            let pid = (((body[pos + 1] & 0x1F) as u16) << 8) | body[pos + 2] as u16;
            let es_info_length = (((body[pos + 3] & 0x0F) as usize) << 8) | body[pos + 4] as usize;
            pos += 5 + es_info_length;
            if pos > body.len() {
                return Err(Error::SectionTooShort);
            }
            streams.push(PmtStream { stream_type, pid });
        }
        Ok(Self {
            program_number,
            version,
            pcr_pid,
            streams,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16);
        body.push(0xE0 | (self.pcr_pid >> 8) as u8);
        body.push((self.pcr_pid & 0xFF) as u8);
        body.extend_from_slice(&[0xF0, 0x00]); // program_info_length = 0
        for s in &self.streams {
            body.push(s.stream_type);
            body.push(0xE0 | (s.pid >> 8) as u8);
            body.push((s.pid & 0xFF) as u8);
            body.extend_from_slice(&[0xF0, 0x00]); // ES_info_length = 0
        }
        encode_section(TABLE_ID_PMT, self.program_number, self.version, &body)
    }
}

fn encode_section(table_id: u8, id_field: u16, version: u8, body: &[u8]) -> Vec<u8> {
    // 5 fixed bytes after section_length + body + CRC
    let section_length = 5 + body.len() + 4;
    let mut out = Vec::with_capacity(1 + 3 + section_length);
    out.push(0x00); // pointer field
    out.push(table_id);
    out.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    out.push((section_length & 0xFF) as u8);
    out.extend_from_slice(&id_field.to_be_bytes());
    out.push(0xC1 | ((version & 0x1F) << 1)); // current_next = 1
    out.push(0x00); // section_number
    out.push(0x00); // last_section_number
    out.extend_from_slice(body);
    let crc = CRC32_MPEG2.checksum(&out[1..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pat_round_trip() {
        let pat = Pat {
            transport_stream_id: 1,
            version: 3,
            programs: vec![(1, 0x1000)],
        };
        let enc = pat.encode();
        let got = Pat::decode(&enc).unwrap();
        assert_eq!(got, pat);
    }

    #[test]
    fn test_pmt_round_trip() {
        let pmt = Pmt {
            program_number: 1,
            version: 0,
            pcr_pid: 0x0100,
            streams: vec![
                PmtStream {
                    stream_type: 0x1B,
                    pid: 0x0100,
                },
                PmtStream {
                    stream_type: 0x0F,
                    pid: 0x0101,
                },
            ],
        };
        let enc = pmt.encode();
        let got = Pmt::decode(&enc).unwrap();
        assert_eq!(got, pmt);
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let pat = Pat {
            transport_stream_id: 1,
            version: 0,
            programs: vec![(1, 0x1000)],
        };
        let mut enc = pat.encode();
        let last = enc.len() - 1;
        enc[last] ^= 0xFF;
        assert_eq!(Pat::decode(&enc), Err(Error::CrcMismatch));
    }

    #[test]
    fn test_truncated_section() {
        let pat = Pat {
            transport_stream_id: 1,
            version: 0,
            programs: vec![(1, 0x1000)],
        };
        let enc = pat.encode();
        assert!(Pat::decode(&enc[..enc.len() - 5]).is_err());
    }
}
