//! Connection state machine for managing TCP connections.
//!
//! Each connection tracks its current state and the bytes buffered in
//! each direction.

use bytes::BytesMut;
use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered for readable, no partial message buffered.
    AwaitingData,
    /// Part of a message has arrived, terminator not seen yet.
    Assembling,
    /// A reply is queued and the socket could not take all of it.
    Echoing,
    /// Peer stopped sending; queued replies are flushed before closing.
    Draining,
    /// Terminal. The connection is about to be dropped.
    Closing,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    /// Remote address, kept for diagnostics.
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Accumulation buffer for the message being assembled.
    pub inbound: BytesMut,
    /// Framed replies not yet accepted by the socket.
    pub outbound: BytesMut,
}

impl Connection {
    /// Create a new connection awaiting its first message.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::AwaitingData,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
        }
    }

    /// Recompute the state from buffered bytes after a read or write pass.
    ///
    /// `Draining` and `Closing` are sticky.
    pub fn settle(&mut self) {
        if matches!(self.state, ConnState::Draining | ConnState::Closing) {
            return;
        }
        self.state = if !self.outbound.is_empty() {
            ConnState::Echoing
        } else if !self.inbound.is_empty() {
            ConnState::Assembling
        } else {
            ConnState::AwaitingData
        };
    }

    /// Stop reading and only write out what is already queued.
    pub fn drain(&mut self) {
        if self.state != ConnState::Closing {
            self.state = ConnState::Draining;
        }
    }

    pub fn is_draining(&self) -> bool {
        self.state == ConnState::Draining
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnState::Closing
    }
}

/// Registry of active connections using slab allocation.
///
/// Slab keys double as mio tokens. There is no capacity limit.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
        }
    }

    /// Reserve the id the next inserted connection will get.
    ///
    /// Used to register the socket with the poller before it is moved in.
    pub fn next_id(&self) -> usize {
        self.connections.vacant_key()
    }

    pub fn insert(&mut self, conn: Connection) -> usize {
        self.connections.insert(conn)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    // Paired with `len` for clippy::len_without_is_empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
