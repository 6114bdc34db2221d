//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on the calling thread. `Poll::poll` is the only place the
//! loop blocks; accept, read, framing and write all run to completion.
//!
//! mio readiness is edge-triggered, so every readable event drains its socket
//! until `WouldBlock` and the listener accepts until `WouldBlock`.

use crate::config::Config;
use crate::protocol::{encode, find_terminator, next_frame, Frame};
use crate::runtime::{ConnState, Connection, ConnectionRegistry};
use bytes::Buf;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Result of draining a readable socket.
#[derive(Debug, PartialEq, Eq)]
enum ReadStatus {
    /// Socket returned `WouldBlock`, or the peer asked to terminate.
    Drained,
    /// Peer closed its write half.
    Eof,
}

/// Single-threaded echo server.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    connections: ConnectionRegistry,
    /// Transfer buffer shared by every read on this loop.
    scratch: Vec<u8>,
    events_capacity: usize,
    termination_keyword: String,
    max_message_size: usize,
}

impl Server {
    /// Bind the listening socket and register it with a fresh poller.
    ///
    /// Fails if the address cannot be resolved or bound, or if the
    /// readiness mechanism cannot be opened.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("could not resolve '{}'", config.host),
                )
            })?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(addr = %listener.local_addr()?, "Starting server");

        Ok(Self {
            poll,
            listener,
            connections: ConnectionRegistry::new(),
            scratch: vec![0u8; config.read_buffer_size.max(1)],
            events_capacity: config.events_capacity.max(1),
            termination_keyword: config.termination_keyword.clone(),
            max_message_size: config.max_message_size,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections forever.
    ///
    /// Only returns if polling itself fails.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);

        info!("Waiting for connections");

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => {
                        let readable =
                            event.is_readable() || event.is_read_closed() || event.is_error();
                        self.handle_connection_event(conn_id, readable, event.is_writable());
                    }
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let conn_id = self.connections.next_id();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }
                    self.connections.insert(Connection::new(stream, peer));

                    info!(
                        conn_id,
                        peer = %peer,
                        open = self.connections.len(),
                        "New connection"
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::ConnectionAborted =>
                {
                    continue
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, readable: bool, writable: bool) {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        let result = service_connection(
            conn,
            conn_id,
            registry,
            &mut self.scratch,
            &self.termination_keyword,
            self.max_message_size,
            readable,
            writable,
        );

        match result {
            Ok(()) if conn.is_closing() => self.close_connection(conn_id),
            Ok(()) => {}
            Err(e) => {
                warn!(conn_id, peer = %conn.peer, error = %e, "Connection fault");
                self.close_connection(conn_id);
            }
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                debug!(conn_id, peer = %conn.peer, error = %e, "Deregister failed");
            }
            debug!(
                conn_id,
                peer = %conn.peer,
                discarded = conn.inbound.len(),
                open = self.connections.len(),
                "Connection closed"
            );
        }
    }
}

/// Run one readiness event for a connection and fix up its interest set.
///
/// On return with `Ok`, a connection in `Closing` state must be torn down by
/// the caller.
///
/// When the peer half-closes while replies are still queued, the connection
/// switches to `Draining`: reads stop, interest becomes WRITABLE only, and it
/// closes once the queue is empty.
#[allow(clippy::too_many_arguments)]
fn service_connection(
    conn: &mut Connection,
    conn_id: usize,
    registry: &Registry,
    scratch: &mut [u8],
    keyword: &str,
    max_message_size: usize,
    readable: bool,
    writable: bool,
) -> io::Result<()> {
    let was_echoing = conn.state == ConnState::Echoing;

    if readable
        && !conn.is_draining()
        && read_messages(conn, scratch, keyword, max_message_size)? == ReadStatus::Eof
    {
        debug!(
            conn_id,
            peer = %conn.peer,
            pending = conn.outbound.len(),
            "Peer closed connection"
        );
        if conn.outbound.is_empty() {
            conn.close();
        } else {
            conn.drain();
            registry.reregister(&mut conn.stream, Token(conn_id), Interest::WRITABLE)?;
        }
    }

    if conn.is_closing() {
        return Ok(());
    }

    // A draining socket may report only an error or hangup; the write surfaces it
    if (writable || conn.is_draining()) && !conn.outbound.is_empty() {
        flush(conn)?;
    }

    if conn.is_draining() {
        if conn.outbound.is_empty() {
            conn.close();
        }
        return Ok(());
    }

    conn.settle();
    let is_echoing = conn.state == ConnState::Echoing;
    if is_echoing != was_echoing {
        let interest = if is_echoing {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut conn.stream, Token(conn_id), interest)?;
    }

    Ok(())
}

/// Drain the socket into the accumulation buffer, dispatching each message
/// as its terminator arrives.
///
/// On `Eof`, bytes left in `inbound` are an unterminated message. They are
/// never echoed; the caller discards them with the connection.
fn read_messages(
    conn: &mut Connection,
    scratch: &mut [u8],
    keyword: &str,
    max_message_size: usize,
) -> io::Result<ReadStatus> {
    loop {
        let n = match conn.stream.read(scratch) {
            Ok(0) => return Ok(ReadStatus::Eof),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Drained),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let chunk = &scratch[..n];
        let complete = find_terminator(chunk).is_some();
        conn.inbound.extend_from_slice(chunk);

        if complete {
            dispatch_messages(conn, keyword, max_message_size)?;
            if conn.is_closing() {
                return Ok(ReadStatus::Drained);
            }
        }

        if exceeds(conn.inbound.len(), max_message_size) {
            return Err(too_large(conn.inbound.len(), max_message_size));
        }
    }
}

/// `max_message_size` of 0 means unbounded.
fn exceeds(len: usize, max_message_size: usize) -> bool {
    max_message_size > 0 && len > max_message_size
}

fn too_large(len: usize, max_message_size: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("message too large: {len} > {max_message_size}"),
    )
}

/// Handle every complete message in the accumulation buffer, in order.
fn dispatch_messages(
    conn: &mut Connection,
    keyword: &str,
    max_message_size: usize,
) -> io::Result<()> {
    while let Some(frame) = next_frame(&mut conn.inbound, keyword) {
        match frame {
            Frame::Terminate => {
                info!(peer = %conn.peer, "Client sent closing message");
                conn.close();
                break;
            }
            Frame::Echo(message) if exceeds(message.len(), max_message_size) => {
                return Err(too_large(message.len(), max_message_size));
            }
            Frame::Echo(message) => {
                debug!(
                    peer = %conn.peer,
                    len = message.len(),
                    message = %String::from_utf8_lossy(&message),
                    "Message read"
                );
                encode(&message, &mut conn.outbound);
            }
        }
    }

    flush(conn)
}

/// Write queued replies until the buffer is empty or the socket is full.
fn flush(conn: &mut Connection) -> io::Result<()> {
    while !conn.outbound.is_empty() {
        match conn.stream.write(&conn.outbound) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => conn.outbound.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EOTB;
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            // Small transfer buffer so most messages need several reads
            read_buffer_size: 4,
            ..Config::default()
        }
    }

    fn spawn_server(config: Config) -> SocketAddr {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let server = Server::bind(&config).unwrap();
            tx.send(server.local_addr().unwrap()).unwrap();
            let _ = server.run();
        });
        rx.recv().unwrap()
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn send(stream: &mut TcpStream, payload: &[u8]) {
        let mut framed = payload.to_vec();
        framed.push(EOTB);
        stream.write_all(&framed).unwrap();
    }

    /// Read one reply including its terminator.
    fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).unwrap();
            assert_eq!(n, 1, "connection closed mid-reply");
            reply.push(byte[0]);
            if byte[0] == EOTB {
                return reply;
            }
        }
    }

    fn assert_closed(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            other => panic!("expected closed connection, got {:?}", other),
        }
    }

    #[test]
    fn test_echo_round_trip() {
        let addr = spawn_server(test_config());
        let mut client = connect(addr);

        send(&mut client, b"hello");
        assert_eq!(read_reply(&mut client), b"hello\x17");

        send(&mut client, b"");
        assert_eq!(read_reply(&mut client), b"\x17");

        let binary = [0u8, 1, 0xff, 0x80, b'\n', 22, 24];
        send(&mut client, &binary);
        let mut expected = binary.to_vec();
        expected.push(EOTB);
        assert_eq!(read_reply(&mut client), expected);
    }

    #[test]
    fn test_termination_keyword_closes_without_reply() {
        let addr = spawn_server(test_config());
        let mut client = connect(addr);

        send(&mut client, b"  quit\r\n");
        assert_closed(&mut client);
    }

    #[test]
    fn test_keyword_is_case_sensitive() {
        let addr = spawn_server(test_config());
        let mut client = connect(addr);

        send(&mut client, b"QUIT");
        assert_eq!(read_reply(&mut client), b"QUIT\x17");
    }

    #[test]
    fn test_custom_termination_keyword() {
        let addr = spawn_server(Config {
            termination_keyword: "bye".to_string(),
            ..test_config()
        });
        let mut client = connect(addr);

        send(&mut client, b"quit");
        assert_eq!(read_reply(&mut client), b"quit\x17");
        send(&mut client, b"bye");
        assert_closed(&mut client);
    }

    #[test]
    fn test_no_cross_connection_leakage() {
        let addr = spawn_server(test_config());
        let mut a = connect(addr);
        let mut b = connect(addr);

        a.write_all(b"from-a-").unwrap();
        send(&mut b, b"from-b");
        a.write_all(b"again\x17").unwrap();

        assert_eq!(read_reply(&mut b), b"from-b\x17");
        assert_eq!(read_reply(&mut a), b"from-a-again\x17");
    }

    #[test]
    fn test_partial_reads_reassemble_once() {
        let addr = spawn_server(test_config());
        let mut client = connect(addr);

        for chunk in [&b"split "[..], b"across ", b"many", b" writes\x17"] {
            client.write_all(chunk).unwrap();
            client.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(read_reply(&mut client), b"split across many writes\x17");

        // The next reply must belong to the next message, not a duplicate
        send(&mut client, b"next");
        assert_eq!(read_reply(&mut client), b"next\x17");
    }

    #[test]
    fn test_pipelined_messages_in_one_write() {
        let addr = spawn_server(test_config());
        let mut client = connect(addr);

        client.write_all(b"one\x17two\x17three\x17").unwrap();
        assert_eq!(read_reply(&mut client), b"one\x17");
        assert_eq!(read_reply(&mut client), b"two\x17");
        assert_eq!(read_reply(&mut client), b"three\x17");
    }

    #[test]
    fn test_messages_before_keyword_are_echoed() {
        let addr = spawn_server(test_config());
        let mut client = connect(addr);

        client.write_all(b"last words\x17quit\x17").unwrap();
        assert_eq!(read_reply(&mut client), b"last words\x17");
        assert_closed(&mut client);
    }

    #[test]
    fn test_large_message_fully_written() {
        let addr = spawn_server(Config {
            read_buffer_size: 512,
            ..test_config()
        });
        let mut client = connect(addr);

        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 23) as u8 + 24).collect();
        let writer = {
            let mut stream = client.try_clone().unwrap();
            let payload = payload.clone();
            thread::spawn(move || send(&mut stream, &payload))
        };

        let mut reply = vec![0u8; payload.len() + 1];
        client.read_exact(&mut reply).unwrap();
        writer.join().unwrap();

        assert_eq!(&reply[..payload.len()], &payload[..]);
        assert_eq!(reply[payload.len()], EOTB);
    }

    #[test]
    fn test_half_close_flushes_queued_reply() {
        let addr = spawn_server(Config {
            read_buffer_size: 64 * 1024,
            max_message_size: 0,
            ..test_config()
        });
        let mut client = connect(addr);

        let payload: Vec<u8> = (0..32 * 1024 * 1024).map(|i| (i % 23) as u8 + 24).collect();
        let writer = {
            let mut stream = client.try_clone().unwrap();
            let payload = payload.clone();
            thread::spawn(move || {
                send(&mut stream, &payload);
                stream.shutdown(std::net::Shutdown::Write).unwrap();
            })
        };

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        writer.join().unwrap();

        assert_eq!(reply.len(), payload.len() + 1);
        assert_eq!(&reply[..payload.len()], &payload[..]);
        assert_eq!(reply[payload.len()], EOTB);
    }

    #[test]
    fn test_unbounded_message_size() {
        let addr = spawn_server(Config {
            read_buffer_size: 64 * 1024,
            max_message_size: 0,
            ..test_config()
        });
        let mut client = connect(addr);

        // Larger than the default 16 MB cap
        let payload: Vec<u8> = (0..20 * 1024 * 1024).map(|i| (i % 23) as u8 + 24).collect();
        let writer = {
            let mut stream = client.try_clone().unwrap();
            let payload = payload.clone();
            thread::spawn(move || send(&mut stream, &payload))
        };

        let mut reply = vec![0u8; payload.len() + 1];
        client.read_exact(&mut reply).unwrap();
        writer.join().unwrap();

        assert_eq!(&reply[..payload.len()], &payload[..]);
        assert_eq!(reply[payload.len()], EOTB);

        send(&mut client, b"still open");
        assert_eq!(read_reply(&mut client), b"still open\x17");
    }

    #[test]
    fn test_message_at_size_limit_is_echoed() {
        let addr = spawn_server(Config {
            max_message_size: 16,
            ..test_config()
        });
        let mut client = connect(addr);

        send(&mut client, b"0123456789abcdef");
        assert_eq!(read_reply(&mut client), b"0123456789abcdef\x17");

        send(&mut client, b"0123456789abcdefg");
        assert_closed(&mut client);
    }

    #[test]
    fn test_oversized_message_closes_connection() {
        let addr = spawn_server(Config {
            max_message_size: 16,
            ..test_config()
        });
        let mut greedy = connect(addr);
        let mut polite = connect(addr);

        greedy.write_all(&[b'x'; 64]).unwrap();
        assert_closed(&mut greedy);

        send(&mut polite, b"still here");
        assert_eq!(read_reply(&mut polite), b"still here\x17");
    }

    #[test]
    fn test_peer_reset_mid_message_isolated() {
        let addr = spawn_server(test_config());
        let mut bystander = connect(addr);
        send(&mut bystander, b"before");
        assert_eq!(read_reply(&mut bystander), b"before\x17");

        let mut victim = connect(addr);
        victim.write_all(b"never finish").unwrap();
        let socket = socket2::Socket::from(victim);
        socket.set_linger(Some(Duration::ZERO)).unwrap();
        drop(socket);
        thread::sleep(Duration::from_millis(50));

        send(&mut bystander, b"after");
        assert_eq!(read_reply(&mut bystander), b"after\x17");

        let mut newcomer = connect(addr);
        send(&mut newcomer, b"hi");
        assert_eq!(read_reply(&mut newcomer), b"hi\x17");
    }

    #[test]
    fn test_independent_session_lifecycle() {
        let addr = spawn_server(test_config());
        let mut a = connect(addr);
        let mut b = connect(addr);

        send(&mut a, b"hello");
        assert_eq!(read_reply(&mut a), b"hello\x17");

        send(&mut b, b"quit");
        assert_closed(&mut b);

        send(&mut a, b"hello");
        assert_eq!(read_reply(&mut a), b"hello\x17");
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = Server::bind(&Config {
            port,
            ..test_config()
        });
        assert!(result.is_err());
    }
}
