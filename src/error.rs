//! Error types for the connection engine.
//!
//! Each component returns its own error enum so call sites can classify a
//! failure by variant instead of by message text.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Framing failures while decoding or encoding a message.
///
/// Every variant is connection-fatal when it surfaces in a pump.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended before a complete header or body was available.
    #[error("unexpected end of stream")]
    EndOfStream,

    /// The header announced a body larger than the configured ceiling.
    #[error("frame length {length} exceeds maximum of {max} bytes")]
    TooLarge { length: usize, max: usize },

    /// The header announced a negative body length.
    #[error("invalid frame length {0}")]
    InvalidLength(i32),

    /// A socket deadline elapsed while reading or writing.
    #[error("{0} deadline exceeded")]
    Timeout(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Folds short-read style I/O errors into [`FrameError::EndOfStream`].
    pub(crate) fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => FrameError::EndOfStream,
            io::ErrorKind::TimedOut => FrameError::Timeout("socket"),
            _ => FrameError::Io(e),
        }
    }
}

/// Message pool lookup failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("message pool has no kind '{0}'")]
    UnknownKind(String),
}

/// Failures when enqueueing on a connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnError {
    #[error("connection {0} is closed")]
    Closed(i32),

    #[error("outbound queue of connection {0} is full")]
    QueueFull(i32),
}

/// Connection manager failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("maximum connections reached ({0})")]
    MaxConnections(usize),

    #[error("connection id {0} is already in use")]
    IdInUse(i32),

    #[error("connection {0} not found")]
    NotFound(i32),

    #[error("connection {0} is no longer valid")]
    InvalidConnection(i32),
}

/// Error returned by a route handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error("{0}")]
    Message(String),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Message(message.into())
    }
}

/// Router table failures.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("route {0} already exists")]
    RouteExists(i32),

    #[error("handler not found for route {0}")]
    HandlerNotFound(i32),

    #[error("route {route_id} handler failed: {source}")]
    Handler {
        route_id: i32,
        #[source]
        source: HandlerError,
    },
}

/// Error returned by a lifecycle hook.
#[derive(Debug, Error)]
#[error("hook rejected connection: {0}")]
pub struct HookError(pub String);

/// Connection group failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("group '{0}' already exists")]
    Exists(String),

    #[error("group '{0}' does not exist")]
    NotFound(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .path.display(), .source)]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{}': {}", .path.display(), .source)]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid option {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            option,
            reason: reason.into(),
        }
    }
}
