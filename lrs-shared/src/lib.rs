#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod config;
pub mod error;
pub mod hooks;
pub mod marshal;
pub mod stream;
pub mod time;
pub mod transport;
pub mod util;

pub use stream::StreamPath;
pub use transport::{TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol};
