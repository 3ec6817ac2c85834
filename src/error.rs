use std::io;

use thiserror::Error;

use crate::record::Kind;

/// Errors raised while pulling a record off a byte stream.
///
/// Every variant is fatal to the connection it came from: once a frame is
/// rejected there is no way to find the start of the next one.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("socket error while reading record: {0}")]
    Io(#[from] io::Error),
    #[error("unknown record kind {0}")]
    UnknownKind(u32),
    #[error("{kind} record declares {declared} bytes, below its minimum of {minimum}")]
    Undersized {
        kind: Kind,
        declared: u64,
        minimum: usize,
    },
    #[error("record declares {declared} bytes, above the ceiling of {maximum}")]
    Oversized { declared: u64, maximum: usize },
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },
}

/// Errors raised by the dispatcher and the session handlers.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{kind} records are not handled by the {role}")]
    Unsupported { kind: Kind, role: &'static str },
    #[error("{0} record received before the handshake completed")]
    NotValidated(Kind),
    #[error("connection has already completed the handshake")]
    AlreadyValidated,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("your username cannot be empty")]
    InvalidName,
    #[error("the connection to the server is closed")]
    NotConnected,
    #[error("the server connection has closed unexpectedly")]
    ConnectionLost,
}

pub type Result<T> = std::result::Result<T, Error>;
