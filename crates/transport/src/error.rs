use thiserror::Error;

/// Errors reading packet frames off the wire
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream ended inside a packet")]
    UnexpectedEof,

    #[error("packet exceeds maximum size of {0} bytes")]
    TooLarge(usize),

    #[error("checksum is not two hex digits")]
    InvalidChecksum,

    #[error("escape character at end of binary data")]
    TruncatedEscape,
}

/// Errors decoding a packet payload into a request
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty packet")]
    Empty,

    #[error("malformed {packet} packet: {reason}")]
    Malformed {
        packet: &'static str,
        reason: String,
    },

    #[error("invalid hex in {0:?}")]
    InvalidHex(String),

    #[error("invalid thread id {0:?}")]
    InvalidThreadId(String),
}

impl ParseError {
    pub(crate) fn malformed(packet: &'static str, reason: impl Into<String>) -> Self {
        ParseError::Malformed {
            packet,
            reason: reason.into(),
        }
    }
}
