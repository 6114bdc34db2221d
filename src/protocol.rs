//! EOTB framing protocol.
//!
//! Every logical message on the wire is followed by a single end-of-transmission-block
//! byte (23). There is no length prefix: the receiver accumulates bytes until
//! it sees the terminator.
//!
//! ```text
//! Request:  <payload><EOTB>
//! Response: <payload><EOTB>
//!
//! Example:
//! Request:  hello\x17
//! Response: hello\x17
//! ```
//!
//! A payload whose trimmed content equals the termination keyword asks the
//! server to close the connection; it is never echoed.
//!
//! Payloads containing the EOTB byte cannot be represented.

use bytes::{BufMut, Bytes, BytesMut};

/// End-of-transmission-block byte.
pub const EOTB: u8 = 23;

/// A complete message split off an accumulation buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload to send back, terminator stripped.
    Echo(Bytes),
    /// Peer asked to end the session.
    Terminate,
}

/// Position of the first terminator in `buf`.
pub fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == EOTB)
}

/// Append `payload` followed by the terminator to `out`.
pub fn encode(payload: &[u8], out: &mut BytesMut) {
    out.reserve(payload.len() + 1);
    out.put_slice(payload);
    out.put_u8(EOTB);
}

/// Whether `payload` is the termination keyword once surrounding whitespace is removed.
///
/// Matching is exact and case-sensitive.
pub fn is_termination(payload: &[u8], keyword: &str) -> bool {
    payload.trim_ascii() == keyword.as_bytes()
}

/// Split the next complete message off the front of `accum`.
///
/// Returns `None` if no terminator has been buffered yet; `accum` is left
/// untouched in that case. Bytes after the terminator stay in `accum` for the
/// next call.
pub fn next_frame(accum: &mut BytesMut, keyword: &str) -> Option<Frame> {
    let end = find_terminator(accum)?;
    let mut message = accum.split_to(end + 1);
    message.truncate(end);

    if is_termination(&message, keyword) {
        Some(Frame::Terminate)
    } else {
        Some(Frame::Echo(message.freeze()))
    }
}
