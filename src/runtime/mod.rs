//! Single-threaded readiness runtime.
//!
//! Built on mio (epoll on Linux, kqueue on macOS). One thread owns the
//! poller, the listener and every connection, so nothing here is shared
//! or locked.
//!
//! - `Connection`: per-socket state machine and buffers
//! - `ConnectionRegistry`: slab of open connections keyed by mio token
//! - `Server`: the accept/read/echo loop

mod connection;
mod event_loop;

pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use event_loop::Server;

use crate::config::Config;

/// Bind to the configured port and serve until the process is killed.
pub fn run(config: &Config) -> std::io::Result<()> {
    Server::bind(config)?.run()
}
