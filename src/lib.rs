//! eotb-echo: an EOTB-framed TCP echo service.
//!
//! - `protocol`: message framing on a single terminator byte (23)
//! - `runtime`: single-threaded mio event loop serving any number of clients
//! - `client`: console client speaking the same framing
//! - `config`: CLI and TOML configuration

pub mod client;
pub mod config;
pub mod protocol;
pub mod runtime;
