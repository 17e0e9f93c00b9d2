//! Header-extension ids and the pre-decrypt TWCC fast path.

use bytes::Bytes;

use crate::header::{Header, EXTENSION_PROFILE_ONE_BYTE, HEADER_LENGTH};

/// URI for the transport-wide congestion control extension.
pub const TWCC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Reads the TWCC transport-wide sequence number out of a (possibly still
/// SRTP-protected) packet. The RTP header is cleartext under SRTP, so this
/// works before unprotect; padding probes whose auth fails and our own
/// looped-back retransmits still get counted for congestion feedback.
pub fn peek_twcc_sequence(buf: &[u8], ext_id: u8) -> Option<u16> {
    if buf.len() < HEADER_LENGTH || ext_id == 0 {
        return None;
    }
    let b0 = buf[0];
    if b0 >> 6 != 2 {
        return None;
    }
    let has_extension = (b0 >> 4) & 0x01 != 0;
    if !has_extension {
        return None;
    }
    let csrc_count = (b0 & 0x0F) as usize;
    let mut pos = HEADER_LENGTH + 4 * csrc_count;
    if buf.len() < pos + 4 {
        return None;
    }
    let profile = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    let ext_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize * 4;
    pos += 4;
    if profile != EXTENSION_PROFILE_ONE_BYTE || buf.len() < pos + ext_len {
        return None;
    }
    let end = pos + ext_len;
    while pos < end {
        let b = buf[pos];
        if b == 0 {
            pos += 1;
            continue;
        }
        let id = b >> 4;
        if id == 15 {
            return None;
        }
        let len = (b & 0x0F) as usize + 1;
        pos += 1;
        if pos + len > end {
            return None;
        }
        if id == ext_id && len == 2 {
            return Some(u16::from_be_bytes([buf[pos], buf[pos + 1]]));
        }
        pos += len;
    }
    None
}

/// Stamps a TWCC sequence number onto an outgoing header.
pub fn set_twcc_sequence(header: &mut Header, ext_id: u8, seq: u16) {
    header.set_extension(ext_id, Bytes::copy_from_slice(&seq.to_be_bytes()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::marshal::Marshal;

    #[test]
    fn test_peek_matches_full_parse() {
        let mut h = Header {
            payload_type: 96,
            sequence_number: 7,
            ssrc: 42,
            ..Default::default()
        };
        set_twcc_sequence(&mut h, 3, 0xABCD);
        let mut raw = h.marshal().unwrap().to_vec();
        raw.extend_from_slice(&[0xEE; 20]); // pretend-encrypted payload
        assert_eq!(peek_twcc_sequence(&raw, 3), Some(0xABCD));
        assert_eq!(peek_twcc_sequence(&raw, 4), None);
    }

    #[test]
    fn test_peek_without_extension() {
        let h = Header {
            payload_type: 96,
            ..Default::default()
        };
        let raw = h.marshal().unwrap();
        assert_eq!(peek_twcc_sequence(&raw, 3), None);
    }

    #[test]
    fn test_peek_rejects_short_input() {
        assert_eq!(peek_twcc_sequence(&[0x90, 0x60], 3), None);
    }
}
