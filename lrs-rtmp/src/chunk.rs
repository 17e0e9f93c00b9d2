//! RTMP chunk stream codec.
//!
//! The decoder reassembles interleaved chunk streams into messages; the
//! encoder always emits a type-0 chunk followed by type-3 continuations,
//! repeating the extended timestamp on continuations the way Adobe
//! products do. Receiving tolerates peers that do either.

use bytes::{BufMut, Bytes, BytesMut};
use log::warn;
use std::collections::{HashMap, VecDeque};

use codec::reader::BytesReader;
use shared::error::{Error, Result};

use crate::message::{AckWindow, MessageHeader, RtmpMessage};

pub const DEFAULT_CHUNK_SIZE: usize = 128;
pub const MIN_CHUNK_SIZE: usize = 128;
pub const MAX_CHUNK_SIZE: usize = 65536;
const EXTENDED_TIMESTAMP: u32 = 0xFFFFFF;
/// Guard against absurd declared message lengths (24-bit field allows 16MB).
const MAX_MESSAGE_SIZE: usize = 0xFFFFFF;

#[derive(Default)]
struct ChunkStream {
    header: MessageHeader,
    timestamp_delta: u32,
    extended_timestamp: bool,
    /// Extended-timestamp value consumed for the in-flight message; used to
    /// detect whether a continuation chunk repeated it.
    last_extended: u32,
    accumulator: Option<BytesMut>,
    msg_count: u64,
}

/// Reassembles messages from an RTMP byte stream.
pub struct ChunkDecoder {
    buffer: BytesMut,
    chunk_size: usize,
    streams: HashMap<u32, ChunkStream>,
    out: VecDeque<RtmpMessage>,
    /// Receive-side acknowledgement bookkeeping.
    pub ack: AckWindow,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self {
            buffer: BytesMut::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            out: VecDeque::new(),
            ack: AckWindow::default(),
        }
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a peer SetChunkSize. Values outside the accepted range are
    /// warned about but applied, values that cannot work are rejected.
    pub fn set_chunk_size(&mut self, n: u32) -> Result<()> {
        if (n as i32) <= 0 {
            return Err(Error::ChunkSizeInvalid(n as i32));
        }
        let n = n as usize;
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&n) {
            warn!("rtmp: accepting out-of-range chunk size {n}");
        }
        self.chunk_size = n;
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Buffers incoming bytes and parses as many chunks as are complete.
    pub fn handle_read(&mut self, data: &[u8]) -> Result<()> {
        self.ack.received += data.len() as u64;
        self.buffer.extend_from_slice(data);
        loop {
            match self.parse_one() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Bytes received but not yet acknowledged trigger an Acknowledgement;
    /// the session sends it when this returns a sequence number.
    pub fn poll_ack(&mut self) -> Option<u32> {
        // handle_read already accounted the bytes; this only reads state.
        if self.ack.window > 0 && self.ack.received - self.ack.last_acked >= self.ack.window as u64
        {
            self.ack.last_acked = self.ack.received;
            Some(self.ack.received as u32)
        } else {
            None
        }
    }

    pub fn poll_message(&mut self) -> Option<RtmpMessage> {
        self.out.pop_front()
    }

    /// Tries to consume exactly one chunk from the buffer front.
    /// Returns Ok(false) when more bytes are needed.
    fn parse_one(&mut self) -> Result<bool> {
        let mut r = BytesReader::new(&self.buffer);

        let (fmt, cid) = match Self::read_basic_header(&mut r) {
            Ok(v) => v,
            Err(Error::ErrShortBuffer) => return Ok(false),
            Err(e) => return Err(e),
        };

        let cs = self.streams.entry(cid).or_default();
        let fresh = cs.msg_count == 0 && cs.accumulator.is_none();
        let continuing = cs.accumulator.is_some();

        // A fresh chunk stream must open with fmt 0; ping-only clients that
        // open cid 2 with fmt 1 are tolerated.
        if fresh && fmt != 0 && !(fmt == 1 && cid == 2) {
            return Err(Error::BadChunkStart(cid));
        }
        if continuing && fmt != 3 {
            return Err(if fmt == 0 {
                Error::ChunkRestart(cid)
            } else {
                Error::ChunkContinuationMismatch
            });
        }

        // Message header, 11/7/3/0 bytes by fmt.
        let mut header = cs.header;
        let mut delta = cs.timestamp_delta;
        let mut extended = cs.extended_timestamp;
        match fmt {
            0 => {
                let (ts, rest) = match (r.read_u24(), r.read_u24(), r.read_u8(), r.read_u32_le()) {
                    (Ok(ts), Ok(len), Ok(t), Ok(sid)) => (ts, (len, t, sid)),
                    _ => return Ok(false),
                };
                header.payload_length = rest.0;
                header.message_type = rest.1;
                header.stream_id = rest.2;
                extended = ts >= EXTENDED_TIMESTAMP;
                if !extended {
                    header.timestamp = ts;
                }
                delta = 0;
            }
            1 => {
                let (ts, len, t) = match (r.read_u24(), r.read_u24(), r.read_u8()) {
                    (Ok(a), Ok(b), Ok(c)) => (a, b, c),
                    _ => return Ok(false),
                };
                header.payload_length = len;
                header.message_type = t;
                extended = ts >= EXTENDED_TIMESTAMP;
                if !extended {
                    delta = ts;
                    header.timestamp = header.timestamp.wrapping_add(delta);
                }
            }
            2 => {
                let ts = match r.read_u24() {
                    Ok(v) => v,
                    Err(_) => return Ok(false),
                };
                extended = ts >= EXTENDED_TIMESTAMP;
                if !extended {
                    delta = ts;
                    header.timestamp = header.timestamp.wrapping_add(delta);
                }
            }
            _ => {
                // fmt 3: everything cached; a fresh message reuses the
                // previous delta.
                if !continuing && !extended {
                    header.timestamp = header.timestamp.wrapping_add(delta);
                }
            }
        }

        let mut ext_consumed = 0usize;
        if extended {
            let ext = match r.read_u32() {
                Ok(v) => v & 0x7FFF_FFFF, // some peers use the top bit
                Err(_) => return Ok(false),
            };
            // Continuation chunks may or may not repeat the field; if the
            // value differs from what this message established, the four
            // bytes belong to the payload.
            if continuing && ext != cs.last_extended {
                // unread: fall through with the reader rewound
                ext_consumed = 0;
            } else {
                ext_consumed = 4;
                match fmt {
                    0 => header.timestamp = ext,
                    1 | 2 => {
                        delta = ext;
                        header.timestamp = header.timestamp.wrapping_add(delta);
                    }
                    _ => {
                        // Fresh fmt-3 message repeating the extended field
                        // carries the absolute timestamp.
                        if !continuing {
                            header.timestamp = ext;
                        }
                    }
                }
            }
        }

        if header.payload_length as usize > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(header.payload_length as usize));
        }

        let accumulated = cs.accumulator.as_ref().map_or(0, |a| a.len());
        let remaining = (header.payload_length as usize).saturating_sub(accumulated);
        let take = remaining.min(self.chunk_size);

        // Compute consumed header size; the reader may have over-read the
        // optional extended timestamp.
        let header_end = if extended && ext_consumed == 0 {
            r.pos() - 4
        } else {
            r.pos()
        };
        if self.buffer.len() < header_end + take {
            return Ok(false);
        }

        let payload = &self.buffer[header_end..header_end + take];
        let mut acc = cs.accumulator.take().unwrap_or_default();
        acc.extend_from_slice(payload);

        cs.header = header;
        cs.timestamp_delta = delta;
        cs.extended_timestamp = extended;
        if extended && ext_consumed == 4 {
            cs.last_extended = match fmt {
                0 => header.timestamp,
                1 | 2 => delta,
                _ => cs.last_extended,
            };
        }

        if acc.len() >= header.payload_length as usize {
            cs.msg_count += 1;
            let msg = RtmpMessage {
                header,
                payload: acc.freeze(),
            };
            // SetChunkSize and Abort act at the chunk layer and must apply
            // before any later chunk in the same read is parsed.
            match (header.message_type, msg.payload.len()) {
                (1, n) if n >= 4 => {
                    let size = u32::from_be_bytes([
                        msg.payload[0],
                        msg.payload[1],
                        msg.payload[2],
                        msg.payload[3],
                    ]);
                    if (size as i32) <= 0 {
                        return Err(Error::ChunkSizeInvalid(size as i32));
                    }
                    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&(size as usize)) {
                        warn!("rtmp: accepting out-of-range chunk size {size}");
                    }
                    self.chunk_size = size as usize;
                }
                (2, n) if n >= 4 => {
                    let abort_cid = u32::from_be_bytes([
                        msg.payload[0],
                        msg.payload[1],
                        msg.payload[2],
                        msg.payload[3],
                    ]);
                    if let Some(stream) = self.streams.get_mut(&abort_cid) {
                        stream.accumulator = None;
                    }
                }
                _ => {}
            }
            self.out.push_back(msg);
        } else {
            cs.accumulator = Some(acc);
        }

        let _ = self.buffer.split_to(header_end + take);
        Ok(true)
    }

    fn read_basic_header(r: &mut BytesReader<'_>) -> Result<(u8, u32)> {
        let b0 = r.read_u8()?;
        let fmt = b0 >> 6;
        let cid = (b0 & 0x3F) as u32;
        let cid = match cid {
            0 => 64 + r.read_u8()? as u32,
            1 => {
                let b1 = r.read_u8()? as u32;
                let b2 = r.read_u8()? as u32;
                64 + b1 + (b2 << 8)
            }
            _ => cid,
        };
        Ok((fmt, cid))
    }
}

/// Encodes messages into chunked byte streams.
pub struct ChunkEncoder {
    chunk_size: usize,
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_chunk_size(&mut self, n: u32) -> Result<()> {
        if (n as i32) <= 0 {
            return Err(Error::ChunkSizeInvalid(n as i32));
        }
        let n = n as usize;
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&n) {
            warn!("rtmp: sending with out-of-range chunk size {n}");
        }
        self.chunk_size = n;
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Encodes one message as a fmt-0 chunk plus fmt-3 continuations.
    pub fn write_message(&self, cid: u32, msg: &RtmpMessage) -> Bytes {
        let mut out = BytesMut::with_capacity(msg.payload.len() + 18);
        self.write_into(&mut out, cid, msg);
        out.freeze()
    }

    /// Batches several messages into one buffer for a single write.
    pub fn write_messages(&self, batch: &[(u32, RtmpMessage)]) -> Bytes {
        let total: usize = batch.iter().map(|(_, m)| m.payload.len() + 18).sum();
        let mut out = BytesMut::with_capacity(total);
        for (cid, msg) in batch {
            self.write_into(&mut out, *cid, msg);
        }
        out.freeze()
    }

    fn write_into(&self, out: &mut BytesMut, cid: u32, msg: &RtmpMessage) {
        // cids below 2 are reserved; protocol control rides cid 2.
        let cid = if cid < 2 { 2 } else { cid };
        let ts = msg.header.timestamp;
        let extended = ts >= EXTENDED_TIMESTAMP;

        Self::write_basic_header(out, 0, cid);
        if extended {
            out.put_uint(EXTENDED_TIMESTAMP as u64, 3);
        } else {
            out.put_uint(ts as u64, 3);
        }
        out.put_uint(msg.payload.len() as u64, 3);
        out.put_u8(msg.header.message_type);
        out.put_u32_le(msg.header.stream_id);
        if extended {
            out.put_u32(ts);
        }

        let mut pos = 0;
        let first_take = msg.payload.len().min(self.chunk_size);
        out.put_slice(&msg.payload[..first_take]);
        pos += first_take;

        while pos < msg.payload.len() {
            Self::write_basic_header(out, 3, cid);
            if extended {
                // Adobe-style: continuations repeat the extended timestamp.
                out.put_u32(ts);
            }
            let take = (msg.payload.len() - pos).min(self.chunk_size);
            out.put_slice(&msg.payload[pos..pos + take]);
            pos += take;
        }
    }

    fn write_basic_header(out: &mut BytesMut, fmt: u8, cid: u32) {
        if cid < 64 {
            out.put_u8((fmt << 6) | cid as u8);
        } else if cid < 64 + 256 {
            out.put_u8(fmt << 6);
            out.put_u8((cid - 64) as u8);
        } else {
            out.put_u8((fmt << 6) | 1);
            let v = cid - 64;
            out.put_u8((v & 0xFF) as u8);
            out.put_u8((v >> 8) as u8);
        }
    }
}
