//! Per-connection command loop.
//!
//! Reads newline-terminated lines, parses each one and applies valid
//! commands to the framebuffer. Malformed lines are dropped and nothing is
//! ever written back to the client.

use crate::framebuffer::Framebuffer;
use crate::protocol;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Errors that end a connection
#[derive(Debug)]
pub enum ConnectionError {
    /// Read failure other than a clean end-of-stream
    Io(std::io::Error),
    /// Client sent more than the configured maximum without a line break
    LineTooLong(usize),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectionError::LineTooLong(max) => {
                write!(f, "Line exceeds maximum length of {} bytes", max)
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::LineTooLong(_) => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// What a connection did before it closed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Commands applied to the framebuffer
    pub applied: u64,
    /// Lines dropped as malformed
    pub dropped: u64,
}

/// Why a connection loop returned without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    /// Client closed its side
    EndOfStream,
    /// Server is shutting down
    Shutdown,
}

/// Run a connection to completion and log how it ended.
pub async fn handle_connection<R>(
    stream: R,
    peer: SocketAddr,
    framebuffer: &Framebuffer,
    shutdown: watch::Receiver<bool>,
    max_line_length: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut summary = Summary::default();

    match serve(stream, framebuffer, shutdown, max_line_length, &mut summary).await {
        Ok(reason) => {
            debug!(
                peer = %peer,
                ?reason,
                applied = summary.applied,
                dropped = summary.dropped,
                "Connection closed"
            );
        }
        Err(e) => {
            warn!(
                peer = %peer,
                error = %e,
                applied = summary.applied,
                dropped = summary.dropped,
                "Connection terminated"
            );
        }
    }
}

/// The connection loop.
///
/// Returns once the client closes, shutdown is signalled, a read fails or a
/// line grows past `max_line_length`. A trailing unterminated fragment at
/// end-of-stream is discarded. Commands are applied in the order received.
pub async fn serve<R>(
    mut reader: R,
    framebuffer: &Framebuffer,
    mut shutdown: watch::Receiver<bool>,
    max_line_length: usize,
    summary: &mut Summary,
) -> Result<Closed, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    // Bytes at the front of `buffer` already known to contain no newline
    let mut scanned = 0;

    loop {
        while let Some(pos) = buffer[scanned..].iter().position(|&b| b == b'\n') {
            let end = scanned + pos;
            scanned = 0;

            let mut line = &buffer[..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.len() > max_line_length {
                return Err(ConnectionError::LineTooLong(max_line_length));
            }

            match protocol::parse(line) {
                Ok(cmd) => {
                    framebuffer.set(cmd.x, cmd.y, cmd.color);
                    summary.applied += 1;
                }
                Err(e) => {
                    trace!(error = %e, "Dropping malformed line");
                    summary.dropped += 1;
                }
            }

            buffer.advance(end + 1);
        }
        scanned = buffer.len();

        // A pending '\r' belongs to the terminator, not the line
        let pending = buffer.len() - usize::from(buffer.ends_with(b"\r"));
        if pending > max_line_length {
            return Err(ConnectionError::LineTooLong(max_line_length));
        }

        if *shutdown.borrow_and_update() {
            return Ok(Closed::Shutdown);
        }

        if buffer.capacity() - buffer.len() < BUFFER_SIZE / 4 {
            buffer.reserve(BUFFER_SIZE);
        }

        let n = tokio::select! {
            biased;
            _ = shutdown.changed() => return Ok(Closed::Shutdown),
            n = reader.read_buf(&mut buffer) => n?,
        };

        if n == 0 {
            if !buffer.is_empty() {
                trace!(bytes = buffer.len(), "Discarding unterminated line");
            }
            return Ok(Closed::EndOfStream);
        }
    }
}
