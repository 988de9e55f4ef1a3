//! Error types for the wire layer.

use thiserror::Error;

/// Errors produced while encoding, decoding, or exchanging frames.
#[derive(Error, Debug)]
pub enum WireError {
    /// IO error on the underlying connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The first byte of a frame is not a RESP2 type prefix.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// A length or integer line did not parse.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A bulk string or array declared a length below -1, or the
    /// payload was not terminated by CRLF.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i64),

    /// A simple string or error line was not UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The server answered with a frame of the wrong shape.
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    /// The peer closed the connection mid-reply.
    #[error("connection closed by {0}")]
    ConnectionClosed(String),

    /// Connecting did not finish in time.
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
}

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
