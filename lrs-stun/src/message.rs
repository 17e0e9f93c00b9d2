//! STUN message codec, scoped to what an ICE-lite binding responder needs.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::SocketAddr;

use shared::error::{Error, Result};
use shared::marshal::padding_to_word;

type HmacSha1 = Hmac<Sha1>;

pub const MAGIC_COOKIE: u32 = 0x2112A442;
pub const HEADER_LENGTH: usize = 20;
const FINGERPRINT_XOR: u32 = 0x5354554e;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub mod attr {
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802A;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(&self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_type(message_type: u16) -> Self {
        let c = (((message_type >> 7) & 0x02) | ((message_type >> 4) & 0x01)) as u8;
        match c {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
}

pub const METHOD_BINDING: u16 = 0x0001;

pub type TransactionId = [u8; 12];

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub attr_type: u16,
    pub value: Bytes,
}

/// A decoded STUN message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub class: MessageClass,
    pub method: u16,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    pub fn binding_request() -> Self {
        Self {
            class: MessageClass::Request,
            method: METHOD_BINDING,
            transaction_id: rand::random(),
            attributes: Vec::new(),
        }
    }

    pub fn binding_success(transaction_id: TransactionId) -> Self {
        Self {
            class: MessageClass::SuccessResponse,
            method: METHOD_BINDING,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn is_binding_request(&self) -> bool {
        self.class == MessageClass::Request && self.method == METHOD_BINDING
    }

    pub fn get(&self, attr_type: u16) -> Option<&Bytes> {
        self.attributes
            .iter()
            .find(|a| a.attr_type == attr_type)
            .map(|a| &a.value)
    }

    /// USERNAME is `local:remote` ufrags on a binding request.
    pub fn username(&self) -> Option<String> {
        self.get(attr::USERNAME)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn add(&mut self, attr_type: u16, value: Bytes) {
        self.attributes.push(Attribute { attr_type, value });
    }

    pub fn add_xor_mapped_address(&mut self, addr: &SocketAddr) {
        let mut v = BytesMut::new();
        v.put_u8(0);
        match addr {
            SocketAddr::V4(a) => {
                v.put_u8(0x01);
                v.put_u16(addr.port() ^ (MAGIC_COOKIE >> 16) as u16);
                let cookie = MAGIC_COOKIE.to_be_bytes();
                for (i, o) in a.ip().octets().iter().enumerate() {
                    v.put_u8(o ^ cookie[i]);
                }
            }
            SocketAddr::V6(a) => {
                v.put_u8(0x02);
                v.put_u16(addr.port() ^ (MAGIC_COOKIE >> 16) as u16);
                let mut xor = [0u8; 16];
                xor[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                xor[4..].copy_from_slice(&self.transaction_id);
                for (i, o) in a.ip().octets().iter().enumerate() {
                    v.put_u8(o ^ xor[i]);
                }
            }
        }
        self.add(attr::XOR_MAPPED_ADDRESS, v.freeze());
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        let v = self.get(attr::XOR_MAPPED_ADDRESS)?;
        if v.len() < 8 {
            return None;
        }
        let family = v[1];
        let port = u16::from_be_bytes([v[2], v[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        match family {
            0x01 => {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                let mut ip = [0u8; 4];
                for i in 0..4 {
                    ip[i] = v[4 + i] ^ cookie[i];
                }
                Some(SocketAddr::from((ip, port)))
            }
            0x02 if v.len() >= 20 => {
                let mut xor = [0u8; 16];
                xor[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                xor[4..].copy_from_slice(&self.transaction_id);
                let mut ip = [0u8; 16];
                for i in 0..16 {
                    ip[i] = v[4 + i] ^ xor[i];
                }
                Some(SocketAddr::from((ip, port)))
            }
            _ => None,
        }
    }

    fn message_type(&self) -> u16 {
        let c = self.class.bits();
        // class bits interleave into the method field (RFC 5389 §6)
        let m = self.method;
        (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | ((c & 0x01) << 4) | ((c & 0x02) << 7)
    }

    /// Encodes without integrity or fingerprint.
    pub fn encode_plain(&self) -> Bytes {
        self.encode_inner(None, false)
    }

    /// Encodes appending MESSAGE-INTEGRITY (short-term credential) and
    /// FINGERPRINT, the shape ICE connectivity checks require.
    pub fn encode_with_integrity(&self, password: &str) -> Bytes {
        self.encode_inner(Some(password), true)
    }

    fn encode_inner(&self, password: Option<&str>, fingerprint: bool) -> Bytes {
        let mut body = BytesMut::new();
        for a in &self.attributes {
            body.put_u16(a.attr_type);
            body.put_u16(a.value.len() as u16);
            body.put_slice(&a.value);
            for _ in 0..padding_to_word(a.value.len()) {
                body.put_u8(0);
            }
        }

        let integrity_extra = if password.is_some() { 24 } else { 0 };
        let fingerprint_extra = if fingerprint { 8 } else { 0 };

        let mut out = BytesMut::with_capacity(HEADER_LENGTH + body.len() + 32);
        out.put_u16(self.message_type());
        out.put_u16((body.len() + integrity_extra + fingerprint_extra) as u16);
        out.put_u32(MAGIC_COOKIE);
        out.put_slice(&self.transaction_id);
        out.put_slice(&body);

        if let Some(password) = password {
            // Length must already cover the integrity attribute when the
            // HMAC is computed, which the length above does.
            let mut pre = out.clone();
            let len_with_integrity = (body.len() + integrity_extra) as u16;
            pre[2..4].copy_from_slice(&len_with_integrity.to_be_bytes());
            let mut mac = HmacSha1::new_from_slice(password.as_bytes())
                .expect("hmac accepts any key length");
            mac.update(&pre);
            let digest = mac.finalize().into_bytes();
            out.put_u16(attr::MESSAGE_INTEGRITY);
            out.put_u16(20);
            out.put_slice(&digest);
        }

        if fingerprint {
            let crc = CRC32.checksum(&out) ^ FINGERPRINT_XOR;
            out.put_u16(attr::FINGERPRINT);
            out.put_u16(4);
            out.put_u32(crc);
        }

        out.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Message> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::StunHeaderTooShort);
        }
        let message_type = u16::from_be_bytes([buf[0], buf[1]]);
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::BadMagicCookie(cookie));
        }
        if buf.len() < HEADER_LENGTH + length {
            return Err(Error::StunAttributeTruncated);
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..20]);

        let class = MessageClass::from_type(message_type);
        let m = message_type & !0x0110;
        let method = (m & 0x000F) | ((m >> 1) & 0x0070) | ((m >> 2) & 0x0F80);

        let mut attributes = Vec::new();
        let mut pos = HEADER_LENGTH;
        let end = HEADER_LENGTH + length;
        while pos + 4 <= end {
            let attr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            pos += 4;
            if pos + len > end {
                return Err(Error::StunAttributeTruncated);
            }
            attributes.push(Attribute {
                attr_type,
                value: Bytes::copy_from_slice(&buf[pos..pos + len]),
            });
            pos += len + padding_to_word(len);
        }

        Ok(Message {
            class,
            method,
            transaction_id,
            attributes,
        })
    }

    /// Verifies FINGERPRINT (when present) and MESSAGE-INTEGRITY over the
    /// original datagram.
    pub fn verify(buf: &[u8], password: &str) -> Result<()> {
        // Locate the attributes in the raw bytes.
        if buf.len() < HEADER_LENGTH {
            return Err(Error::StunHeaderTooShort);
        }
        let mut pos = HEADER_LENGTH;
        let mut integrity_pos = None;
        let mut fingerprint_pos = None;
        while pos + 4 <= buf.len() {
            let attr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            match attr_type {
                attr::MESSAGE_INTEGRITY => integrity_pos = Some(pos),
                attr::FINGERPRINT => fingerprint_pos = Some(pos),
                _ => {}
            }
            pos += 4 + len + padding_to_word(len);
        }

        if let Some(fp) = fingerprint_pos {
            let expected = CRC32.checksum(&buf[..fp]) ^ FINGERPRINT_XOR;
            let got = u32::from_be_bytes([buf[fp + 4], buf[fp + 5], buf[fp + 6], buf[fp + 7]]);
            if expected != got {
                return Err(Error::FingerprintMismatch);
            }
        }

        let ip = integrity_pos.ok_or(Error::IntegrityMismatch)?;
        if buf.len() < ip + 24 {
            return Err(Error::StunAttributeTruncated);
        }
        // Recompute with the length field adjusted to end at the
        // integrity attribute.
        let mut pre = buf[..ip].to_vec();
        let adjusted = (ip + 24 - HEADER_LENGTH) as u16;
        pre[2..4].copy_from_slice(&adjusted.to_be_bytes());
        let mut mac =
            HmacSha1::new_from_slice(password.as_bytes()).expect("hmac accepts any key length");
        mac.update(&pre);
        let digest = mac.finalize().into_bytes();
        if digest[..] != buf[ip + 4..ip + 24] {
            return Err(Error::IntegrityMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_request_round_trip() {
        let mut req = Message::binding_request();
        req.add(attr::USERNAME, Bytes::from_static(b"local:remote"));
        let wire = req.encode_plain();
        let got = Message::decode(&wire).unwrap();
        assert!(got.is_binding_request());
        assert_eq!(got.username().unwrap(), "local:remote");
        assert_eq!(got.transaction_id, req.transaction_id);
    }

    #[test]
    fn test_integrity_and_fingerprint_verify() {
        let mut req = Message::binding_request();
        req.add(attr::USERNAME, Bytes::from_static(b"a:b"));
        let wire = req.encode_with_integrity("swordfish");
        Message::verify(&wire, "swordfish").unwrap();
        assert_eq!(
            Message::verify(&wire, "wrong"),
            Err(Error::IntegrityMismatch)
        );

        let mut tampered = wire.to_vec();
        tampered[1] ^= 0x01;
        assert!(Message::verify(&tampered, "swordfish").is_err());
    }

    #[test]
    fn test_xor_mapped_address_v4() {
        let mut resp = Message::binding_success([7u8; 12]);
        let addr: SocketAddr = "203.0.113.7:50000".parse().unwrap();
        resp.add_xor_mapped_address(&addr);
        let wire = resp.encode_plain();
        let got = Message::decode(&wire).unwrap();
        assert_eq!(got.xor_mapped_address().unwrap(), addr);
    }

    #[test]
    fn test_xor_mapped_address_v6() {
        let mut resp = Message::binding_success([3u8; 12]);
        let addr: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        resp.add_xor_mapped_address(&addr);
        let wire = resp.encode_plain();
        let got = Message::decode(&wire).unwrap();
        assert_eq!(got.xor_mapped_address().unwrap(), addr);
    }

    #[test]
    fn test_bad_cookie() {
        let mut wire = Message::binding_request().encode_plain().to_vec();
        wire[4] = 0;
        assert!(matches!(
            Message::decode(&wire),
            Err(Error::BadMagicCookie(_))
        ));
    }

    #[test]
    fn test_truncated_attribute() {
        let mut req = Message::binding_request();
        req.add(attr::USERNAME, Bytes::from_static(b"abcd"));
        let wire = req.encode_plain();
        assert_eq!(
            Message::decode(&wire[..wire.len() - 2]),
            Err(Error::StunAttributeTruncated)
        );
    }
}
