//! TCP-based transport implementation

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};

use eyre::{Context, Result};

use super::GdbTransport;

/// TCP-based transport to an attached debugger
///
/// Reads block indefinitely: an interactive debugger may sit idle at its
/// prompt for as long as the user likes.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Create a new TCP transport from an accepted stream
    ///
    /// # Errors
    ///
    /// Returns an error if the socket options cannot be set
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream
            .set_read_timeout(None)
            .context("clearing read timeout on TCP stream")?;
        stream
            .set_nodelay(true)
            .context("disabling Nagle on TCP stream")?;
        Ok(Self { stream })
    }
}

impl GdbTransport for TcpTransport {
    type Reader = BufReader<TcpStream>;
    type Writer = TcpStream;

    fn split(self) -> Result<(Self::Reader, Self::Writer)> {
        // Clone stream for reader, keep original for writer
        let input = self
            .stream
            .try_clone()
            .context("cloning TCP stream for reader")?;
        let output = self.stream;

        Ok((BufReader::new(input), output))
    }
}

/// Listening socket a debugger connects to
///
/// # Examples
///
/// ```no_run
/// use transport::io::GdbListener;
///
/// let listener = GdbListener::bind("127.0.0.1", Some(9999))?;
/// let transport = listener.accept()?;
/// # Ok::<(), eyre::Error>(())
/// ```
pub struct GdbListener {
    listener: TcpListener,
}

impl GdbListener {
    /// Bind to `host`, on `port` if given or any free port otherwise
    pub fn bind(host: &str, port: Option<u16>) -> Result<Self> {
        let port = port.unwrap_or(0);
        let listener = TcpListener::bind((host, port))
            .with_context(|| format!("binding debugger listener on {host}:{port}"))?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self
            .listener
            .local_addr()
            .context("reading listener address")?
            .port())
    }

    /// Block until a debugger connects from a loopback address
    ///
    /// Connections from other addresses are dropped and we keep waiting.
    pub fn accept(&self) -> Result<TcpTransport> {
        loop {
            let (stream, addr) = self
                .listener
                .accept()
                .context("accepting debugger connection")?;
            if !addr.ip().is_loopback() {
                tracing::warn!(%addr, "rejected debugger connection from non-loopback address");
                continue;
            }
            tracing::info!(%addr, "debugger connected");
            return TcpTransport::new(stream);
        }
    }
}
