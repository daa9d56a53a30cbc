//! IO abstraction layer for the remote serial protocol
//!
//! The core trait [`GdbTransport`] lets the connection run over different
//! byte streams: a TCP socket accepted from a debugger, or an in-memory
//! channel pair in tests.
//!
//! # Examples
//!
//! ## Accepting a debugger over TCP
//!
//! ```no_run
//! use transport::io::GdbListener;
//! use transport::{Features, connect};
//!
//! let listener = GdbListener::bind("127.0.0.1", None)?;
//! println!("listening on port {}", listener.port()?);
//! let transport = listener.accept()?;
//! let connection = connect(transport, Features::default())?;
//! # Ok::<(), eyre::Error>(())
//! ```
//!
//! ## Using In-Memory Transport for Testing
//!
//! ```
//! use transport::io::InMemoryTransport;
//! use transport::{Features, connect};
//!
//! let (_debugger_side, server_side) = InMemoryTransport::pair();
//! let connection = connect(server_side, Features::default())?;
//! # Ok::<(), eyre::Error>(())
//! ```

use std::io::{BufRead, Write};

mod memory;
mod tcp;

#[cfg(test)]
mod tests;

pub use memory::InMemoryTransport;
pub use tcp::{GdbListener, TcpTransport};

/// Trait for a bidirectional byte transport to a debugger
///
/// Implementations split into a reader and a writer half. Unlike a polling
/// client, the server blocks on the reader until the debugger sends
/// something, so readers should block rather than time out.
pub trait GdbTransport: Send + 'static {
    /// The reader type that implements BufRead
    type Reader: BufRead + Send + 'static;

    /// The writer type that implements Write
    type Writer: Write + Send + 'static;

    /// Split the transport into separate reader and writer halves
    ///
    /// - For TCP: Creates cloned handles to the same underlying socket
    /// - For in-memory: Returns the two ends of a bidirectional channel
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be split (e.g., socket cloning fails)
    fn split(self) -> eyre::Result<(Self::Reader, Self::Writer)>;
}
