//! GDB remote serial protocol transport
//!
//! This crate frames, decodes and encodes remote serial protocol packets, and
//! presents a debugger connection to the server as a stream of decoded
//! [`Request`]s.
mod connection;
pub mod error;
pub mod hex;
pub mod io;
pub mod packet;
pub mod requests;
pub mod responses;
pub mod types;

pub use connection::{DebuggerConnection, Features, GdbConnection, connect};
pub use error::{PacketError, ParseError};
pub use io::{GdbListener, GdbTransport, InMemoryTransport, TcpTransport};
pub use requests::Request;
pub use responses::{Reply, StopNotification};
