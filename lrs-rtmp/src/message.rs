//! RTMP messages and the protocol-control subset.

use bytes::Bytes;
use codec::reader::{BytesReader, BytesWriter};
use shared::error::{Error, Result};

/// Message type ids.
pub mod msg_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACKNOWLEDGEMENT: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const AMF3_DATA: u8 = 15;
    pub const AMF3_COMMAND: u8 = 17;
    pub const AMF0_DATA: u8 = 18;
    pub const AMF0_COMMAND: u8 = 20;
    pub const AGGREGATE: u8 = 22;
}

/// Well-known chunk stream ids for outgoing messages.
pub mod cid {
    pub const PROTOCOL_CONTROL: u32 = 2;
    pub const OVER_CONNECTION: u32 = 3;
    pub const OVER_STREAM: u32 = 5;
    pub const VIDEO: u32 = 6;
    pub const AUDIO: u32 = 7;
}

/// Decoded message header, shared by every chunk of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Absolute timestamp in milliseconds, wrapping at 2^32.
    pub timestamp: u32,
    pub payload_length: u32,
    pub message_type: u8,
    pub stream_id: u32,
}

/// One reassembled RTMP message.
#[derive(Debug, Clone, PartialEq)]
pub struct RtmpMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(message_type: u8, timestamp: u32, stream_id: u32, payload: Bytes) -> Self {
        Self {
            header: MessageHeader {
                timestamp,
                payload_length: payload.len() as u32,
                message_type,
                stream_id,
            },
            payload,
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self.header.message_type, msg_type::AUDIO | msg_type::VIDEO)
    }
}

/// User Control event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
}

/// Parsed protocol-control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolControl {
    SetChunkSize(u32),
    Abort(u32),
    Acknowledgement(u32),
    UserControl(UserControlEvent),
    WindowAckSize(u32),
    SetPeerBandwidth { window: u32, limit_type: u8 },
}

impl ProtocolControl {
    /// Attempts to interpret a message as protocol control; `None` for
    /// anything that is not one.
    pub fn parse(msg: &RtmpMessage) -> Result<Option<Self>> {
        let mut r = BytesReader::new(&msg.payload);
        let pc = match msg.header.message_type {
            msg_type::SET_CHUNK_SIZE => {
                let v = r.read_u32()?;
                if (v as i32) <= 0 {
                    return Err(Error::ChunkSizeInvalid(v as i32));
                }
                ProtocolControl::SetChunkSize(v)
            }
            msg_type::ABORT => ProtocolControl::Abort(r.read_u32()?),
            msg_type::ACKNOWLEDGEMENT => ProtocolControl::Acknowledgement(r.read_u32()?),
            msg_type::WINDOW_ACK_SIZE => ProtocolControl::WindowAckSize(r.read_u32()?),
            msg_type::SET_PEER_BANDWIDTH => ProtocolControl::SetPeerBandwidth {
                window: r.read_u32()?,
                limit_type: r.read_u8()?,
            },
            msg_type::USER_CONTROL => {
                let event = match r.read_u16()? {
                    0 => UserControlEvent::StreamBegin(r.read_u32()?),
                    1 => UserControlEvent::StreamEof(r.read_u32()?),
                    2 => UserControlEvent::StreamDry(r.read_u32()?),
                    3 => UserControlEvent::SetBufferLength {
                        stream_id: r.read_u32()?,
                        buffer_ms: r.read_u32()?,
                    },
                    4 => UserControlEvent::StreamIsRecorded(r.read_u32()?),
                    6 => UserControlEvent::PingRequest(r.read_u32()?),
                    7 => UserControlEvent::PingResponse(r.read_u32()?),
                    other => {
                        return Err(Error::UnexpectedMessageType(other as u8));
                    }
                };
                ProtocolControl::UserControl(event)
            }
            _ => return Ok(None),
        };
        Ok(Some(pc))
    }

    pub fn to_message(&self) -> RtmpMessage {
        let mut w = BytesWriter::new();
        let message_type = match self {
            ProtocolControl::SetChunkSize(v) => {
                w.write_u32(*v);
                msg_type::SET_CHUNK_SIZE
            }
            ProtocolControl::Abort(v) => {
                w.write_u32(*v);
                msg_type::ABORT
            }
            ProtocolControl::Acknowledgement(v) => {
                w.write_u32(*v);
                msg_type::ACKNOWLEDGEMENT
            }
            ProtocolControl::WindowAckSize(v) => {
                w.write_u32(*v);
                msg_type::WINDOW_ACK_SIZE
            }
            ProtocolControl::SetPeerBandwidth { window, limit_type } => {
                w.write_u32(*window);
                w.write_u8(*limit_type);
                msg_type::SET_PEER_BANDWIDTH
            }
            ProtocolControl::UserControl(event) => {
                match event {
                    UserControlEvent::StreamBegin(sid) => {
                        w.write_u16(0);
                        w.write_u32(*sid);
                    }
                    UserControlEvent::StreamEof(sid) => {
                        w.write_u16(1);
                        w.write_u32(*sid);
                    }
                    UserControlEvent::StreamDry(sid) => {
                        w.write_u16(2);
                        w.write_u32(*sid);
                    }
                    UserControlEvent::SetBufferLength {
                        stream_id,
                        buffer_ms,
                    } => {
                        w.write_u16(3);
                        w.write_u32(*stream_id);
                        w.write_u32(*buffer_ms);
                    }
                    UserControlEvent::StreamIsRecorded(sid) => {
                        w.write_u16(4);
                        w.write_u32(*sid);
                    }
                    UserControlEvent::PingRequest(ts) => {
                        w.write_u16(6);
                        w.write_u32(*ts);
                    }
                    UserControlEvent::PingResponse(ts) => {
                        w.write_u16(7);
                        w.write_u32(*ts);
                    }
                }
                msg_type::USER_CONTROL
            }
        };
        RtmpMessage::new(message_type, 0, 0, w.finish())
    }
}

/// In-window acknowledgement bookkeeping for the receive side.
#[derive(Debug, Default)]
pub struct AckWindow {
    /// Peer-declared window; 0 disables acking.
    pub window: u32,
    pub received: u64,
    pub last_acked: u64,
}

impl AckWindow {
    /// Accounts for `n` received bytes; returns the sequence number to put
    /// in an Acknowledgement message when the window is exceeded.
    pub fn on_bytes(&mut self, n: usize) -> Option<u32> {
        self.received += n as u64;
        if self.window == 0 {
            return None;
        }
        if self.received - self.last_acked >= self.window as u64 {
            self.last_acked = self.received;
            Some(self.received as u32)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_control_round_trip() {
        let cases = [
            ProtocolControl::SetChunkSize(4096),
            ProtocolControl::Abort(3),
            ProtocolControl::Acknowledgement(123456),
            ProtocolControl::WindowAckSize(2500000),
            ProtocolControl::SetPeerBandwidth {
                window: 2500000,
                limit_type: 2,
            },
            ProtocolControl::UserControl(UserControlEvent::StreamBegin(1)),
            ProtocolControl::UserControl(UserControlEvent::PingRequest(99)),
        ];
        for pc in cases {
            let msg = pc.to_message();
            assert_eq!(ProtocolControl::parse(&msg).unwrap(), Some(pc));
        }
    }

    #[test]
    fn test_media_is_not_protocol_control() {
        let msg = RtmpMessage::new(msg_type::VIDEO, 0, 1, Bytes::from_static(&[0x17]));
        assert_eq!(ProtocolControl::parse(&msg).unwrap(), None);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let msg = RtmpMessage::new(
            msg_type::SET_CHUNK_SIZE,
            0,
            0,
            Bytes::from_static(&[0, 0, 0, 0]),
        );
        assert_eq!(
            ProtocolControl::parse(&msg),
            Err(Error::ChunkSizeInvalid(0))
        );
    }

    #[test]
    fn test_ack_window() {
        let mut ack = AckWindow {
            window: 1000,
            ..Default::default()
        };
        assert_eq!(ack.on_bytes(999), None);
        assert_eq!(ack.on_bytes(1), Some(1000));
        assert_eq!(ack.on_bytes(999), None);
        assert_eq!(ack.on_bytes(2), Some(2001));
    }

    #[test]
    fn test_ack_disabled_without_window() {
        let mut ack = AckWindow::default();
        assert_eq!(ack.on_bytes(1 << 20), None);
    }
}
