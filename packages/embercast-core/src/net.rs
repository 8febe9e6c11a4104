//! The socket seam between the core and its transport.
//!
//! The core never owns TCP details; it drives whatever implements [`Socket`].
//! Implementations must be non-blocking: reads and writes return
//! `WouldBlock` instead of stalling a worker, and `readable` is a
//! zero-timeout poll. The server binary implements this over `TcpStream`;
//! tests use an in-memory pipe.

use std::io;

/// Non-blocking byte transport for one client connection.
pub trait Socket: Send {
    /// Reads available bytes. `Ok(0)` means the peer closed.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes as many bytes as the transport accepts right now.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Zero-timeout readability poll.
    fn readable(&mut self) -> io::Result<bool>;
}

/// Returns true for errors that mean "try again later", not failure.
pub fn is_soft_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
