//! eotb-client: console client for the eotb-echo server.
//!
//! Reads lines from standard input, sends each as one message and prints the
//! server's reply. Sending the termination keyword ends the session.

use clap::Parser;
use eotb_echo::client::{self, ClientConfig};
use eotb_echo::config::ClientArgs;
use tokio::io::{self, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::from_args(ClientArgs::parse())?;

    // Logs go to stderr so they never mix with echoed replies
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    println!("Connecting to server: {}", config.addr);

    let stdin = BufReader::new(io::stdin());
    let replies = client::run(&config, stdin, io::stdout()).await?;

    info!(replies, "Session finished");
    Ok(())
}
