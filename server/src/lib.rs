//! Screenwatch server library: frame registry, live multiplexer, transcode
//! cache, recording catalog and the HTTP surface tying them together.

pub mod catalog;
pub mod decode;
pub mod error;
pub mod live;
pub mod registry;
pub mod server;
pub mod transcode;
