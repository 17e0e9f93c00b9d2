//! RTP fixed header and one-byte header extensions.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! ```

use bytes::{Buf, Bytes, BytesMut};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LENGTH: usize = 12;
pub const VERSION: u8 = 2;

/// One-byte extension profile identifier (RFC 8285).
pub const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extension {
    pub id: u8,
    pub payload: Bytes,
}

/// RTP packet header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension_profile: u16,
    pub extensions: Vec<Extension>,
}

impl Header {
    /// Returns the payload of the extension with the given id.
    pub fn get_extension(&self, id: u8) -> Option<&Bytes> {
        self.extensions
            .iter()
            .find(|e| e.id == id)
            .map(|e| &e.payload)
    }

    pub fn set_extension(&mut self, id: u8, payload: Bytes) {
        self.extension = true;
        if self.extension_profile == 0 {
            self.extension_profile = EXTENSION_PROFILE_ONE_BYTE;
        }
        if let Some(e) = self.extensions.iter_mut().find(|e| e.id == id) {
            e.payload = payload;
        } else {
            self.extensions.push(Extension { id, payload });
        }
    }

    fn extensions_payload_len(&self) -> usize {
        let raw: usize = self
            .extensions
            .iter()
            .map(|e| 1 + e.payload.len())
            .sum();
        // padded to a word boundary
        (raw + 3) / 4 * 4
    }
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        let mut n = HEADER_LENGTH + 4 * self.csrc.len();
        if self.extension {
            n += 4 + self.extensions_payload_len();
        }
        n
    }
}

impl Marshal for Header {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::ErrShortBuffer);
        }

        buf[0] = (VERSION << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc.len() as u8 & 0x0F);
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        let mut pos = 12;
        for csrc in &self.csrc {
            buf[pos..pos + 4].copy_from_slice(&csrc.to_be_bytes());
            pos += 4;
        }

        if self.extension {
            let payload_len = self.extensions_payload_len();
            buf[pos..pos + 2].copy_from_slice(&self.extension_profile.to_be_bytes());
            buf[pos + 2..pos + 4].copy_from_slice(&((payload_len / 4) as u16).to_be_bytes());
            pos += 4;
            let ext_start = pos;
            for e in &self.extensions {
                // one-byte form: id in the high nibble, len-1 in the low
                buf[pos] = (e.id << 4) | ((e.payload.len() as u8).saturating_sub(1) & 0x0F);
                pos += 1;
                buf[pos..pos + e.payload.len()].copy_from_slice(&e.payload);
                pos += e.payload.len();
            }
            while pos < ext_start + payload_len {
                buf[pos] = 0; // padding
                pos += 1;
            }
        }

        Ok(pos)
    }
}

impl Unmarshal for Header {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if raw.remaining() < HEADER_LENGTH {
            return Err(Error::RtpHeaderTooShort);
        }

        let b0 = raw.get_u8();
        let version = b0 >> 6;
        if version != VERSION {
            return Err(Error::BadRtpVersion(version));
        }
        let padding = (b0 >> 5) & 0x01 != 0;
        let extension = (b0 >> 4) & 0x01 != 0;
        let csrc_count = (b0 & 0x0F) as usize;

        let b1 = raw.get_u8();
        let marker = b1 >> 7 != 0;
        let payload_type = b1 & 0x7F;

        let sequence_number = raw.get_u16();
        let timestamp = raw.get_u32();
        let ssrc = raw.get_u32();

        if raw.remaining() < 4 * csrc_count {
            return Err(Error::RtpHeaderTooShort);
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(raw.get_u32());
        }

        let mut extension_profile = 0;
        let mut extensions = Vec::new();
        if extension {
            if raw.remaining() < 4 {
                return Err(Error::RtpExtensionTruncated);
            }
            extension_profile = raw.get_u16();
            let ext_words = raw.get_u16() as usize;
            let ext_len = ext_words * 4;
            if raw.remaining() < ext_len {
                return Err(Error::RtpExtensionTruncated);
            }
            let mut ext = vec![0u8; ext_len];
            raw.copy_to_slice(&mut ext);

            if extension_profile == EXTENSION_PROFILE_ONE_BYTE {
                let mut pos = 0;
                while pos < ext.len() {
                    let b = ext[pos];
                    if b == 0 {
                        pos += 1; // padding
                        continue;
                    }
                    let id = b >> 4;
                    if id == 15 {
                        break; // reserved, stop processing
                    }
                    let len = (b & 0x0F) as usize + 1;
                    pos += 1;
                    if pos + len > ext.len() {
                        return Err(Error::RtpExtensionTruncated);
                    }
                    extensions.push(Extension {
                        id,
                        payload: Bytes::copy_from_slice(&ext[pos..pos + len]),
                    });
                    pos += len;
                }
            } else {
                // Unknown profile: retain opaquely under id 0.
                extensions.push(Extension {
                    id: 0,
                    payload: Bytes::from(ext),
                });
            }
        }

        Ok(Header {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_profile,
            extensions,
        })
    }
}

impl Header {
    pub fn marshal_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.marshal_size());
        buf.resize(self.marshal_size(), 0);
        let n = self.marshal_to(&mut buf)?;
        buf.truncate(n);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_round_trip() {
        let h = Header {
            version: 2,
            marker: true,
            payload_type: 96,
            sequence_number: 27023,
            timestamp: 3653407706,
            ssrc: 476325762,
            ..Default::default()
        };
        let raw = h.marshal().unwrap();
        assert_eq!(raw.len(), HEADER_LENGTH);
        let mut buf = raw.clone();
        let got = Header::unmarshal(&mut buf).unwrap();
        assert_eq!(got, h);
    }

    #[test]
    fn test_extension_round_trip() {
        let mut h = Header {
            payload_type: 111,
            sequence_number: 100,
            ssrc: 0xDEADBEEF,
            ..Default::default()
        };
        h.set_extension(5, Bytes::from_static(&[0x12, 0x34]));
        let raw = h.marshal().unwrap();
        let mut buf = raw.clone();
        let got = Header::unmarshal(&mut buf).unwrap();
        assert_eq!(got.extension_profile, EXTENSION_PROFILE_ONE_BYTE);
        assert_eq!(
            got.get_extension(5).unwrap(),
            &Bytes::from_static(&[0x12, 0x34])
        );
    }

    #[test]
    fn test_csrc_round_trip() {
        let h = Header {
            payload_type: 96,
            csrc: vec![1, 2, 3],
            ..Default::default()
        };
        let raw = h.marshal().unwrap();
        assert_eq!(raw.len(), HEADER_LENGTH + 12);
        let mut buf = raw.clone();
        assert_eq!(Header::unmarshal(&mut buf).unwrap().csrc, vec![1, 2, 3]);
    }

    #[test]
    fn test_bad_version() {
        let mut buf = Bytes::from_static(&[0x40u8; 12]);
        assert_eq!(Header::unmarshal(&mut buf), Err(Error::BadRtpVersion(1)));
    }

    #[test]
    fn test_truncated() {
        let mut buf = Bytes::from_static(&[0x80, 96, 0]);
        assert_eq!(Header::unmarshal(&mut buf), Err(Error::RtpHeaderTooShort));
    }
}
