#![doc = include_str!("../README.md")]

pub mod client;
pub mod codec;
pub mod endpoint;
pub mod engine;
pub mod feedback;
pub mod message;
pub mod queue;
pub mod result;
pub mod transport;

pub use client::*;
pub use endpoint::*;
pub use message::*;
pub use result::*;
