//! eotb-echo server
//!
//! Echoes every EOTB-terminated message back to the client that sent it.
//! A message equal to the termination keyword closes the connection instead.
//!
//! Features:
//! - Any number of concurrent connections on a single thread
//! - Messages reassembled across any number of partial reads
//! - Per-connection fault isolation
//! - Configuration via CLI arguments or TOML file

use eotb_echo::config::Config;
use eotb_echo::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        termination_keyword = %config.termination_keyword,
        read_buffer_size = config.read_buffer_size,
        max_message_size = config.max_message_size,
        "Starting eotb-echo server"
    );

    runtime::run(&config)?;
    Ok(())
}
