//! Blocking byte-transfer primitives over a stream socket.
//!
//! Both directions loop until the requested count is transferred. A receive
//! at a frame boundary additionally distinguishes an orderly peer close
//! (zero bytes before anything arrived) from a close mid-transfer: the
//! former ends the session quietly, the latter is a hard error because the
//! stream can no longer be trusted.

use std::io::{ErrorKind, Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer closed the connection cleanly, before any byte of the transfer.
    #[error("peer disconnected")]
    Disconnected,
    /// Stream ended mid-transfer.
    #[error("connection broken mid-transfer")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Write the whole buffer or fail.
pub fn send_all<W: Write>(w: &mut W, buf: &[u8]) -> Result<()> {
    w.write_all(buf)?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. Any early close is an error.
pub fn recv_all<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    recv_loop(r, buf, false)
}

/// Like [`recv_all`], but a clean close before the first byte reports
/// [`TransportError::Disconnected`] rather than a hard error.
pub fn recv_all_or_close<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    recv_loop(r, buf, true)
}

fn recv_loop<R: Read>(r: &mut R, buf: &mut [u8], close_ok: bool) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(if close_ok && filled == 0 {
                    TransportError::Disconnected
                } else {
                    TransportError::Truncated
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
