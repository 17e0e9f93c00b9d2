#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod connection;
pub mod demux;
pub mod dtls;
pub mod nack;
pub mod player;
pub mod pli;
pub mod publisher;
pub mod report;
pub mod ssrc_cache;
pub mod twcc;

pub use connection::{RtcConnection, SessionState};
pub use demux::{classify, PacketClass};
pub use dtls::DtlsTransport;
