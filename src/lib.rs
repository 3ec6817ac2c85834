//! A small multi-user chat system over a length-prefixed binary protocol.
//!
//! One server accepts TCP clients; each client authenticates with a name and
//! protocol version, learns the current roster, then exchanges text messages
//! that the server fans out to everyone else.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod output;
pub mod reader;
pub mod record;
pub mod roster;
pub mod server;
pub mod session;
pub mod worker;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig, DEFAULT_PORT};
pub use error::{DecodeError, Error, Result, SessionError};
pub use handler::{ErrorAction, ErrorHandler, IgnoreErrors, LogErrors, Severity, TerminateOnError};
pub use output::{Console, MemorySink, OutputSink};
pub use record::{Kind, ProtocolVersion, Record, UserInfo};
pub use server::Server;
