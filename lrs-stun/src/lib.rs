#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod message;

pub use message::{Message, MessageClass, TransactionId, MAGIC_COOKIE};
