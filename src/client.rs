//! Console client for the echo server.
//!
//! Relays each input line as one EOTB-terminated message and prints the
//! echoed reply. Sending the termination keyword ends the session without
//! waiting for a reply.

use crate::config::{validate_ipv4, validate_port, ClientArgs, ConfigError};
use crate::protocol::{encode, is_termination, EOTB};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddrV4;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Validated client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addr: SocketAddrV4,
    pub termination_keyword: String,
}

impl ClientConfig {
    /// Validate a dotted-quad IPv4 host and a port in 0-65535.
    pub fn new(host: &str, port: i64, termination_keyword: &str) -> Result<Self, ConfigError> {
        let ip = validate_ipv4(host)?;
        let port = validate_port(port)?;
        if termination_keyword.trim().is_empty() {
            return Err(ConfigError::EmptyKeyword);
        }

        Ok(Self {
            addr: SocketAddrV4::new(ip, port),
            termination_keyword: termination_keyword.to_string(),
        })
    }

    pub fn from_args(args: ClientArgs) -> Result<Self, ConfigError> {
        Self::new(&args.host, args.port, &args.termination_keyword)
    }
}

/// Write `payload` followed by the terminator.
pub async fn send_message<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = BytesMut::with_capacity(payload.len() + 1);
    encode(payload, &mut framed);
    writer.write_all(&framed).await?;
    writer.flush().await
}

/// Read one reply, terminator stripped.
///
/// Returns `None` if the server closed the connection before sending
/// anything. A reply cut short by EOF is returned as-is.
pub async fn read_reply<R>(reader: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncBufRead + Unpin,
{
    let mut reply = Vec::new();
    if reader.read_until(EOTB, &mut reply).await? == 0 {
        return Ok(None);
    }
    if reply.last() == Some(&EOTB) {
        reply.pop();
    }
    Ok(Some(Bytes::from(reply)))
}

/// Exchange messages with the server until input runs out or the keyword is sent.
///
/// Returns the number of replies received.
pub async fn run_session<I, S, O>(
    input: I,
    stream: S,
    mut output: O,
    termination_keyword: &str,
) -> io::Result<usize>
where
    I: AsyncBufRead + Unpin,
    S: AsyncRead + AsyncWrite,
    O: AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut lines = input.lines();
    let mut replies = 0;

    while let Some(line) = lines.next_line().await? {
        output
            .write_all(format!("Sending:{line}\n").as_bytes())
            .await?;
        send_message(&mut writer, line.as_bytes()).await?;

        if is_termination(line.as_bytes(), termination_keyword) {
            debug!("Termination keyword sent");
            break;
        }

        let reply = read_reply(&mut reader).await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection")
        })?;
        output.write_all(b"response:").await?;
        output.write_all(&reply).await?;
        output.write_all(b"\n").await?;
        replies += 1;
    }

    output.flush().await?;
    Ok(replies)
}

/// Connect to the configured server and run a session over `input`/`output`.
pub async fn run<I, O>(config: &ClientConfig, input: I, output: O) -> io::Result<usize>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    info!(addr = %config.addr, "Connecting to server");
    let stream = TcpStream::connect(config.addr).await?;
    run_session(input, stream, output, &config.termination_keyword).await
}
