//! RTMP simple handshake.
//!
//! C0 is one version byte (3), C1/S1/C2/S2 are 1536-byte blobs. The simple
//! scheme echoes the peer's 1536 bytes back; the complex (HMAC digest)
//! scheme is accepted implicitly because an echoing server satisfies any
//! client that falls back, which every mainstream encoder does.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use shared::error::{Error, Result};

pub const RTMP_VERSION: u8 = 3;
pub const HANDSHAKE_SIZE: usize = 1536;

fn random_block(time: u32) -> BytesMut {
    let mut blob = BytesMut::with_capacity(HANDSHAKE_SIZE);
    blob.put_u32(time);
    blob.put_u32(0); // zero per the simple scheme
    let mut rng = rand::rng();
    let mut rest = [0u8; HANDSHAKE_SIZE - 8];
    rng.fill(&mut rest[..]);
    blob.put_slice(&rest);
    blob
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    WaitC0C1,
    WaitC2,
    Done,
}

/// Server side of the simple handshake, fed raw bytes.
pub struct ServerSimpleHandshake {
    state: ServerState,
    buffer: BytesMut,
    response: Option<Bytes>,
}

impl Default for ServerSimpleHandshake {
    fn default() -> Self {
        Self {
            state: ServerState::WaitC0C1,
            buffer: BytesMut::new(),
            response: None,
        }
    }
}

impl ServerSimpleHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.state == ServerState::Done
    }

    /// Feeds bytes; surplus beyond the handshake is kept and returned by
    /// [`take_remaining`](Self::take_remaining) for the chunk decoder.
    pub fn handle_read(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        loop {
            match self.state {
                ServerState::WaitC0C1 => {
                    if self.buffer.len() < 1 + HANDSHAKE_SIZE {
                        return Ok(());
                    }
                    let version = self.buffer[0];
                    if version != RTMP_VERSION {
                        return Err(Error::HandshakeVersion(version));
                    }
                    let c0c1 = self.buffer.split_to(1 + HANDSHAKE_SIZE);
                    let c1 = &c0c1[1..];

                    let mut out = BytesMut::with_capacity(1 + 2 * HANDSHAKE_SIZE);
                    out.put_u8(RTMP_VERSION);
                    out.put_slice(&random_block(0)); // S1
                    out.put_slice(c1); // S2 echoes C1
                    self.response = Some(out.freeze());
                    self.state = ServerState::WaitC2;
                }
                ServerState::WaitC2 => {
                    if self.buffer.len() < HANDSHAKE_SIZE {
                        return Ok(());
                    }
                    let _ = self.buffer.split_to(HANDSHAKE_SIZE);
                    self.state = ServerState::Done;
                }
                ServerState::Done => return Ok(()),
            }
        }
    }

    /// Bytes to send to the peer, if any are pending.
    pub fn poll_write(&mut self) -> Option<Bytes> {
        self.response.take()
    }

    /// Surplus bytes that already belong to the chunk stream.
    pub fn take_remaining(&mut self) -> BytesMut {
        self.buffer.split()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Init,
    WaitS0S1S2,
    Done,
}

/// Client side, used by the in-process republish path.
pub struct ClientSimpleHandshake {
    state: ClientState,
    buffer: BytesMut,
    pending: Option<Bytes>,
}

impl Default for ClientSimpleHandshake {
    fn default() -> Self {
        let mut out = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        out.put_u8(RTMP_VERSION);
        out.put_slice(&random_block(0)); // C1
        Self {
            state: ClientState::Init,
            buffer: BytesMut::new(),
            pending: Some(out.freeze()),
        }
    }
}

impl ClientSimpleHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.state == ClientState::Done
    }

    pub fn handle_read(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        match self.state {
            ClientState::Init | ClientState::WaitS0S1S2 => {
                self.state = ClientState::WaitS0S1S2;
                if self.buffer.len() < 1 + 2 * HANDSHAKE_SIZE {
                    return Ok(());
                }
                let version = self.buffer[0];
                if version != RTMP_VERSION {
                    return Err(Error::HandshakeVersion(version));
                }
                let s0s1s2 = self.buffer.split_to(1 + 2 * HANDSHAKE_SIZE);
                // C2 echoes S1.
                let c2 = Bytes::copy_from_slice(&s0s1s2[1..1 + HANDSHAKE_SIZE]);
                self.pending = Some(c2);
                self.state = ClientState::Done;
                Ok(())
            }
            ClientState::Done => Ok(()),
        }
    }

    pub fn poll_write(&mut self) -> Option<Bytes> {
        self.pending.take()
    }

    pub fn take_remaining(&mut self) -> BytesMut {
        self.buffer.split()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_server_interop() {
        let mut client = ClientSimpleHandshake::new();
        let mut server = ServerSimpleHandshake::new();

        let c0c1 = client.poll_write().unwrap();
        assert_eq!(c0c1.len(), 1 + HANDSHAKE_SIZE);
        server.handle_read(&c0c1).unwrap();

        let s0s1s2 = server.poll_write().unwrap();
        assert_eq!(s0s1s2.len(), 1 + 2 * HANDSHAKE_SIZE);
        // S2 echoes C1.
        assert_eq!(&s0s1s2[1 + HANDSHAKE_SIZE..], &c0c1[1..]);
        client.handle_read(&s0s1s2).unwrap();
        assert!(client.is_done());

        let c2 = client.poll_write().unwrap();
        // C2 echoes S1.
        assert_eq!(&c2[..], &s0s1s2[1..1 + HANDSHAKE_SIZE]);
        server.handle_read(&c2).unwrap();
        assert!(server.is_done());
    }

    #[test]
    fn test_split_delivery_with_surplus() {
        let mut server = ServerSimpleHandshake::new();
        let mut c0c1 = vec![RTMP_VERSION];
        c0c1.extend_from_slice(&[7u8; HANDSHAKE_SIZE]);
        server.handle_read(&c0c1[..100]).unwrap();
        assert!(server.poll_write().is_none());
        server.handle_read(&c0c1[100..]).unwrap();
        assert!(server.poll_write().is_some());

        // C2 plus the first chunk bytes in one read.
        let mut tail = vec![0u8; HANDSHAKE_SIZE];
        tail.extend_from_slice(&[0x02, 0xAB, 0xCD]);
        server.handle_read(&tail).unwrap();
        assert!(server.is_done());
        assert_eq!(&server.take_remaining()[..], &[0x02, 0xAB, 0xCD]);
    }

    #[test]
    fn test_bad_version() {
        let mut server = ServerSimpleHandshake::new();
        let mut bad = vec![6u8];
        bad.extend_from_slice(&[0u8; HANDSHAKE_SIZE]);
        assert_eq!(server.handle_read(&bad), Err(Error::HandshakeVersion(6)));
    }
}
