//! A pipelined client for the RESP (REdis Serialization Protocol) wire
//! protocol, built on Tokio.
//!
//! The crate frames and decodes server responses from an ordered byte
//! stream, encodes command arguments into the wire format, and pipelines
//! multiple in-flight requests over a single connection, matching responses
//! to requests strictly in issue order.
//!
//! # Layout
//!
//! The major components are:
//!
//! * `frame`: the RESP value model, the command-argument union, and the pure
//!   command encoder. No I/O state lives here.
//!
//! * `connection`: buffered byte-stream primitives over the transport
//!   (`read_line`, `read_exact`, a raw `write`) and the recursive frame
//!   decoder driven by them.
//!
//! * `client`: the pipelined client. Owns the pending-request queue and the
//!   connection lifecycle, and runs the background task that reads responses
//!   and resolves requests FIFO.

pub mod client;
pub use client::{Client, ClientConfig};

pub mod connection;
pub use connection::{FrameReader, FrameWriter};

pub mod frame;
pub use frame::{Arg, Frame};

mod close_signal;

use std::io;
use std::sync::Arc;

/// Default port of a RESP server.
///
/// Used by the CLI when no port is specified.
pub const DEFAULT_PORT: u16 = 6379;

/// Error type for all operations in this crate.
///
/// Every variant except [`Error::Server`] is connection-fatal: once one is
/// raised, the connection transitions to closed and the same error is
/// broadcast to every request still pending. A server error frame, by
/// contrast, answers exactly one command and leaves the connection open.
///
/// The type is `Clone` because a single failure must resolve many pending
/// requests; transport errors are therefore carried behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The stream ended where a frame, or the remainder of one, was expected.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Malformed frame: a bad length or integer line, invalid UTF-8, or a
    /// structure inconsistent with its declared lengths.
    #[error("protocol decode error: {0}")]
    Decode(String),

    /// The server answered the command with a RESP error frame.
    #[error("server error {kind}: {message}")]
    Server { kind: String, message: String },

    /// A command argument list could not be encoded. Raised before any bytes
    /// reach the transport.
    #[error("invalid command argument: {0}")]
    InvalidArgument(String),

    /// A command was issued after close or abort began.
    #[error("client is closed")]
    Closed,

    /// A response arrived with no pending request to claim it.
    #[error("response received with no pending request")]
    ProtocolViolation,

    /// The connection was forcibly closed while the request was in flight.
    #[error("connection forcibly closed")]
    ForciblyClosed,

    /// Transport failure while reading or writing.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

/// A specialized `Result` type for RESP client operations.
pub type Result<T> = std::result::Result<T, Error>;
