#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod chunk;
pub mod command;
pub mod flv;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder};
pub use command::{Command, RequestTable};
pub use handshake::{ClientSimpleHandshake, ServerSimpleHandshake};
pub use message::{MessageHeader, ProtocolControl, RtmpMessage, UserControlEvent};
