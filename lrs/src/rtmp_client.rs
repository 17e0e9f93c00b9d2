//! Minimal RTMP publish client for the in-process republish path
//! (SRT → TS → FLV tags → rtmp://127.0.0.1/...).

use bytes::{Bytes, BytesMut};
use std::time::Duration;

use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use rtmp::chunk::{ChunkDecoder, ChunkEncoder};
use rtmp::command::{self, Command, ExpectedResponse, PublishType, RequestTable};
use rtmp::handshake::ClientSimpleHandshake;
use rtmp::message::{cid, msg_type, ProtocolControl, RtmpMessage, UserControlEvent};
use shared::error::{Error, Result};
use shared::stream::StreamPath;
use srt::{FlvTag, TagKind};

const CLIENT_CHUNK_SIZE: u32 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Handshake,
    Connecting,
    CreatingStream,
    Publishing,
    Ready,
}

/// Byte-driven client core.
pub struct RtmpPublishClient {
    handshake: ClientSimpleHandshake,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    requests: RequestTable,
    stage: Stage,
    path: StreamPath,
    stream_id: u32,
}

impl RtmpPublishClient {
    pub fn new(path: StreamPath) -> Self {
        Self {
            handshake: ClientSimpleHandshake::new(),
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            requests: RequestTable::new(),
            stage: Stage::Handshake,
            path,
            stream_id: 1,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.stage == Stage::Ready
    }

    /// Initial bytes to put on the wire (C0C1).
    pub fn start(&mut self) -> Option<Bytes> {
        self.handshake.poll_write()
    }

    /// Feeds server bytes; returns bytes to send back.
    pub fn handle_bytes(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();

        if self.stage == Stage::Handshake {
            self.handshake.handle_read(data)?;
            if let Some(c2) = self.handshake.poll_write() {
                out.push(c2);
            }
            if !self.handshake.is_done() {
                return Ok(out);
            }
            self.stage = Stage::Connecting;

            // connect right behind C2.
            let tid = self.requests.begin(ExpectedResponse::Connect);
            let connect = Command::Connect {
                transaction_id: tid,
                app: self.path.app.clone(),
                tc_url: Some(format!(
                    "rtmp://127.0.0.1/{}?vhost={}",
                    self.path.app, self.path.vhost
                )),
                object_encoding: 0.0,
            };
            out.push(self.encoder.write_message(cid::OVER_CONNECTION, &connect.to_message(0)));
            out.push(
                self.encoder.write_message(
                    cid::PROTOCOL_CONTROL,
                    &ProtocolControl::SetChunkSize(CLIENT_CHUNK_SIZE).to_message(),
                ),
            );
            self.encoder.set_chunk_size(CLIENT_CHUNK_SIZE)?;

            let remaining = self.handshake.take_remaining();
            self.decoder.handle_read(&remaining)?;
        } else {
            self.decoder.handle_read(data)?;
        }

        while let Some(msg) = self.decoder.poll_message() {
            self.on_message(msg, &mut out)?;
        }
        Ok(out)
    }

    fn on_message(&mut self, msg: RtmpMessage, out: &mut Vec<Bytes>) -> Result<()> {
        if let Some(pc) = ProtocolControl::parse(&msg)? {
            match pc {
                ProtocolControl::SetChunkSize(size) => self.decoder.set_chunk_size(size)?,
                ProtocolControl::WindowAckSize(window) => self.decoder.ack.window = window,
                ProtocolControl::UserControl(UserControlEvent::PingRequest(ts)) => {
                    out.push(self.encoder.write_message(
                        cid::PROTOCOL_CONTROL,
                        &ProtocolControl::UserControl(UserControlEvent::PingResponse(ts))
                            .to_message(),
                    ));
                }
                _ => {}
            }
            return Ok(());
        }
        if msg.header.message_type != msg_type::AMF0_COMMAND {
            return Ok(());
        }
        match Command::parse(&msg.payload)? {
            Command::Response {
                transaction_id,
                success,
                values,
            } => {
                let expected = self.requests.complete(transaction_id)?;
                if !success {
                    return Err(Error::Other(format!(
                        "republish rejected at {expected:?}: {values:?}"
                    )));
                }
                match expected {
                    ExpectedResponse::Connect => {
                        let tid = self.requests.begin(ExpectedResponse::CreateStream);
                        out.push(self.encoder.write_message(
                            cid::OVER_CONNECTION,
                            &Command::CreateStream {
                                transaction_id: tid,
                            }
                            .to_message(0),
                        ));
                        self.stage = Stage::CreatingStream;
                    }
                    ExpectedResponse::CreateStream => {
                        if let Some(id) = values.get(1).and_then(|v| v.as_number().ok()) {
                            self.stream_id = id as u32;
                        }
                        out.push(self.encoder.write_message(
                            cid::OVER_STREAM,
                            &Command::Publish {
                                transaction_id: 0.0,
                                stream_name: self.path.stream.clone(),
                                publish_type: PublishType::Live,
                            }
                            .to_message(self.stream_id),
                        ));
                        self.stage = Stage::Publishing;
                    }
                    other => debug!("republish: unexpected result for {other:?}"),
                }
            }
            Command::OnStatus { info } => {
                let code = info
                    .get("code")
                    .and_then(|v| v.as_str().ok())
                    .unwrap_or_default();
                if code == "NetStream.Publish.Start" {
                    info!("republish: publishing {}", self.path);
                    self.stage = Stage::Ready;
                } else if code.starts_with("NetStream.Publish") {
                    return Err(Error::Other(format!("republish refused: {code}")));
                }
            }
            other => debug!("republish: ignoring {other:?}"),
        }
        Ok(())
    }

    /// Encodes one bridged tag for the wire; only valid when ready.
    pub fn encode_tag(&self, tag: &FlvTag) -> Bytes {
        let (message_type, out_cid) = match tag.kind {
            TagKind::Audio => (msg_type::AUDIO, cid::AUDIO),
            TagKind::Video => (msg_type::VIDEO, cid::VIDEO),
        };
        let msg = RtmpMessage::new(message_type, tag.dts, self.stream_id, tag.payload.clone());
        self.encoder.write_message(out_cid, &msg)
    }
}

/// A connected, publishing client over TCP.
pub struct ConnectedPublisher {
    stream: TcpStream,
    client: RtmpPublishClient,
}

impl ConnectedPublisher {
    /// Dials the local server and completes the publish ladder.
    pub async fn connect(port: u16, path: StreamPath) -> Result<Self> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let mut client = RtmpPublishClient::new(path);
        if let Some(c0c1) = client.start() {
            stream.write_all(&c0c1).await?;
        }
        let mut buf = BytesMut::with_capacity(16 * 1024);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !client.is_ready() {
            buf.clear();
            let n = tokio::time::timeout_at(deadline, stream.read_buf(&mut buf))
                .await
                .map_err(|_| Error::Timeout)??;
            if n == 0 {
                return Err(Error::TransportClosed);
            }
            for reply in client.handle_bytes(&buf[..n])? {
                stream.write_all(&reply).await?;
            }
        }
        Ok(Self { stream, client })
    }

    pub async fn send_tag(&mut self, tag: &FlvTag) -> Result<()> {
        let wire = self.client.encode_tag(tag);
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    /// Drains any server chatter (acks, pings) without blocking.
    pub async fn pump(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => return Err(Error::TransportClosed),
                Ok(n) => {
                    for reply in self.client.handle_bytes(&buf[..n])? {
                        self.stream.write_all(&reply).await?;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
