pub mod config;
pub mod jpeg;
pub mod naming;
pub mod protocol;
