//! AMF0 command messages and the outgoing-request transaction table.

use bytes::Bytes;
use std::collections::HashMap;

use codec::amf0::{self, Amf0Value};
use shared::error::{Error, Result};

use crate::message::{msg_type, RtmpMessage};

/// publish() stream disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishType {
    Live,
    Record,
    Append,
}

impl PublishType {
    fn parse(s: &str) -> Self {
        match s {
            "record" => PublishType::Record,
            "append" => PublishType::Append,
            _ => PublishType::Live,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            PublishType::Live => "live",
            PublishType::Record => "record",
            PublishType::Append => "append",
        }
    }
}

/// A decoded command message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect {
        transaction_id: f64,
        app: String,
        tc_url: Option<String>,
        object_encoding: f64,
    },
    ReleaseStream {
        transaction_id: f64,
        stream_name: String,
    },
    FcPublish {
        transaction_id: f64,
        stream_name: String,
    },
    FcUnpublish {
        transaction_id: f64,
        stream_name: String,
    },
    CreateStream {
        transaction_id: f64,
    },
    Publish {
        transaction_id: f64,
        stream_name: String,
        publish_type: PublishType,
    },
    Play {
        transaction_id: f64,
        stream_name: String,
        start: f64,
        duration: f64,
        reset: bool,
    },
    Pause {
        transaction_id: f64,
        paused: bool,
        position: f64,
    },
    CloseStream {
        transaction_id: f64,
    },
    DeleteStream {
        transaction_id: f64,
        stream_id: f64,
    },
    /// `_result` / `_error`; interpretation needs the request table.
    Response {
        transaction_id: f64,
        success: bool,
        values: Vec<Amf0Value>,
    },
    OnStatus {
        info: Amf0Value,
    },
}

impl Command {
    pub fn parse(payload: &[u8]) -> Result<Command> {
        let values = amf0::read_all(payload)?;
        let mut it = values.into_iter();
        let name = match it.next() {
            Some(Amf0Value::String(s)) => s,
            _ => return Err(Error::AmfUnexpectedType("command name")),
        };
        let transaction_id = match it.next() {
            Some(Amf0Value::Number(n)) => n,
            _ => 0.0,
        };
        let rest: Vec<Amf0Value> = it.collect();

        let cmd = match name.as_str() {
            "connect" => {
                let obj = rest.first().ok_or(Error::AmfTruncated)?;
                let app = obj
                    .get("app")
                    .and_then(|v| v.as_str().ok())
                    .unwrap_or_default()
                    .trim_matches('/')
                    .to_string();
                let tc_url = obj
                    .get("tcUrl")
                    .and_then(|v| v.as_str().ok())
                    .map(str::to_string);
                let object_encoding = obj
                    .get("objectEncoding")
                    .and_then(|v| v.as_number().ok())
                    .unwrap_or(0.0);
                Command::Connect {
                    transaction_id,
                    app,
                    tc_url,
                    object_encoding,
                }
            }
            "releaseStream" => Command::ReleaseStream {
                transaction_id,
                stream_name: second_string(&rest)?,
            },
            "FCPublish" => Command::FcPublish {
                transaction_id,
                stream_name: second_string(&rest)?,
            },
            "FCUnpublish" => Command::FcUnpublish {
                transaction_id,
                stream_name: second_string(&rest)?,
            },
            "createStream" => Command::CreateStream { transaction_id },
            "publish" => {
                let stream_name = second_string(&rest)?;
                let publish_type = rest
                    .get(2)
                    .and_then(|v| v.as_str().ok())
                    .map(PublishType::parse)
                    .unwrap_or(PublishType::Live);
                Command::Publish {
                    transaction_id,
                    stream_name,
                    publish_type,
                }
            }
            "play" => {
                let stream_name = second_string(&rest)?;
                let start = rest.get(2).and_then(|v| v.as_number().ok()).unwrap_or(-2.0);
                let duration = rest.get(3).and_then(|v| v.as_number().ok()).unwrap_or(-1.0);
                let reset = match rest.get(4) {
                    Some(Amf0Value::Boolean(b)) => *b,
                    _ => true,
                };
                Command::Play {
                    transaction_id,
                    stream_name,
                    start,
                    duration,
                    reset,
                }
            }
            "pause" => {
                let paused = match rest.get(1) {
                    Some(Amf0Value::Boolean(b)) => *b,
                    _ => true,
                };
                let position = rest.get(2).and_then(|v| v.as_number().ok()).unwrap_or(0.0);
                Command::Pause {
                    transaction_id,
                    paused,
                    position,
                }
            }
            "closeStream" => Command::CloseStream { transaction_id },
            "deleteStream" => Command::DeleteStream {
                transaction_id,
                stream_id: rest.get(1).and_then(|v| v.as_number().ok()).unwrap_or(0.0),
            },
            "_result" | "_error" => Command::Response {
                transaction_id,
                success: name == "_result",
                values: rest,
            },
            "onStatus" => Command::OnStatus {
                info: rest.into_iter().nth(1).unwrap_or(Amf0Value::Null),
            },
            other => return Err(Error::UnknownCommand(other.to_string())),
        };
        Ok(cmd)
    }

    /// Encodes this command into an AMF0 command message.
    pub fn to_message(&self, stream_id: u32) -> RtmpMessage {
        let values = self.to_values();
        RtmpMessage::new(msg_type::AMF0_COMMAND, 0, stream_id, amf0::write_all(&values))
    }

    fn to_values(&self) -> Vec<Amf0Value> {
        match self {
            Command::Connect {
                transaction_id,
                app,
                tc_url,
                object_encoding,
            } => {
                let mut props = vec![("app", Amf0Value::String(app.clone()))];
                if let Some(url) = tc_url {
                    props.push(("tcUrl", Amf0Value::String(url.clone())));
                }
                props.push(("objectEncoding", Amf0Value::Number(*object_encoding)));
                vec![
                    Amf0Value::String("connect".into()),
                    Amf0Value::Number(*transaction_id),
                    Amf0Value::object(props),
                ]
            }
            Command::ReleaseStream {
                transaction_id,
                stream_name,
            } => named_with_stream("releaseStream", *transaction_id, stream_name),
            Command::FcPublish {
                transaction_id,
                stream_name,
            } => named_with_stream("FCPublish", *transaction_id, stream_name),
            Command::FcUnpublish {
                transaction_id,
                stream_name,
            } => named_with_stream("FCUnpublish", *transaction_id, stream_name),
            Command::CreateStream { transaction_id } => vec![
                Amf0Value::String("createStream".into()),
                Amf0Value::Number(*transaction_id),
                Amf0Value::Null,
            ],
            Command::Publish {
                transaction_id,
                stream_name,
                publish_type,
            } => vec![
                Amf0Value::String("publish".into()),
                Amf0Value::Number(*transaction_id),
                Amf0Value::Null,
                Amf0Value::String(stream_name.clone()),
                Amf0Value::String(publish_type.as_str().into()),
            ],
            Command::Play {
                transaction_id,
                stream_name,
                start,
                duration,
                reset,
            } => vec![
                Amf0Value::String("play".into()),
                Amf0Value::Number(*transaction_id),
                Amf0Value::Null,
                Amf0Value::String(stream_name.clone()),
                Amf0Value::Number(*start),
                Amf0Value::Number(*duration),
                Amf0Value::Boolean(*reset),
            ],
            Command::Pause {
                transaction_id,
                paused,
                position,
            } => vec![
                Amf0Value::String("pause".into()),
                Amf0Value::Number(*transaction_id),
                Amf0Value::Null,
                Amf0Value::Boolean(*paused),
                Amf0Value::Number(*position),
            ],
            Command::CloseStream { transaction_id } => vec![
                Amf0Value::String("closeStream".into()),
                Amf0Value::Number(*transaction_id),
                Amf0Value::Null,
            ],
            Command::DeleteStream {
                transaction_id,
                stream_id,
            } => vec![
                Amf0Value::String("deleteStream".into()),
                Amf0Value::Number(*transaction_id),
                Amf0Value::Null,
                Amf0Value::Number(*stream_id),
            ],
            Command::Response {
                transaction_id,
                success,
                values,
            } => {
                let mut v = vec![
                    Amf0Value::String(if *success { "_result" } else { "_error" }.into()),
                    Amf0Value::Number(*transaction_id),
                ];
                v.extend(values.iter().cloned());
                v
            }
            Command::OnStatus { info } => vec![
                Amf0Value::String("onStatus".into()),
                Amf0Value::Number(0.0),
                Amf0Value::Null,
                info.clone(),
            ],
        }
    }
}

fn second_string(rest: &[Amf0Value]) -> Result<String> {
    match rest.get(1) {
        Some(Amf0Value::String(s)) => Ok(s.clone()),
        _ => Err(Error::AmfUnexpectedType("stream name")),
    }
}

fn named_with_stream(name: &str, transaction_id: f64, stream_name: &str) -> Vec<Amf0Value> {
    vec![
        Amf0Value::String(name.into()),
        Amf0Value::Number(transaction_id),
        Amf0Value::Null,
        Amf0Value::String(stream_name.into()),
    ]
}

/// Builds the `_result` for connect the way FMS-compatible servers do.
pub fn connect_result(transaction_id: f64) -> Command {
    Command::Response {
        transaction_id,
        success: true,
        values: vec![
            Amf0Value::object(vec![
                ("fmsVer", Amf0Value::String("FMS/3,5,3,888".into())),
                ("capabilities", Amf0Value::Number(127.0)),
                ("mode", Amf0Value::Number(1.0)),
            ]),
            Amf0Value::object(vec![
                ("level", Amf0Value::String("status".into())),
                ("code", Amf0Value::String("NetConnection.Connect.Success".into())),
                ("description", Amf0Value::String("Connection succeeded".into())),
                ("objectEncoding", Amf0Value::Number(0.0)),
            ]),
        ],
    }
}

pub fn create_stream_result(transaction_id: f64, stream_id: f64) -> Command {
    Command::Response {
        transaction_id,
        success: true,
        values: vec![Amf0Value::Null, Amf0Value::Number(stream_id)],
    }
}

pub fn on_status(level: &str, code: &str, description: &str) -> Command {
    Command::OnStatus {
        info: Amf0Value::object(vec![
            ("level", Amf0Value::String(level.into())),
            ("code", Amf0Value::String(code.into())),
            ("description", Amf0Value::String(description.into())),
        ]),
    }
}

/// Expected response shape for an outgoing request, keyed by transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedResponse {
    Connect,
    CreateStream,
    ReleaseStream,
    FcPublish,
}

/// Tracks outgoing transaction ids so `_result`/`_error` can be typed.
#[derive(Default)]
pub struct RequestTable {
    next_id: u64,
    outstanding: HashMap<u64, ExpectedResponse>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self { next_id: 1, ..Default::default() }
    }

    /// Allocates a transaction id for a request.
    pub fn begin(&mut self, expect: ExpectedResponse) -> f64 {
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.insert(id, expect);
        id as f64
    }

    /// Resolves a response's transaction id to what was asked.
    pub fn complete(&mut self, transaction_id: f64) -> Result<ExpectedResponse> {
        let key = transaction_id as u64;
        self.outstanding
            .remove(&key)
            .ok_or(Error::UnknownTransaction(key))
    }
}

/// Decodes a command payload, mapping protocol faults to the AMF error
/// kind the session logs and drops.
pub fn parse_command(payload: &Bytes) -> Result<Command> {
    Command::parse(payload)
}
