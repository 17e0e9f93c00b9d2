#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod bridge;
pub mod interrupt;
pub mod rtc_endpoint;
pub mod rtmp_client;
pub mod rtmp_session;
pub mod server;
pub mod srt2rtmp;
pub mod ticker;

pub use interrupt::Interrupt;
pub use server::Server;
pub use ticker::Tickers;
