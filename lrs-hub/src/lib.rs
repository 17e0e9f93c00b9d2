#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod media;
pub mod registry;
pub mod source;

pub use media::{MediaCodec, MediaPacket, PacketKind};
pub use registry::Hub;
pub use source::{Consumer, GopCachePolicy, Source, SourceEvent};
