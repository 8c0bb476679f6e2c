//! Error types shared by the client and server roles.
//!
//! Connection-scoped errors never leave the reactor: they are turned into a
//! connection teardown at the dispatch boundary. Only `ReactorError` reaches
//! the role's run loop, and it ends the process.

use crate::digest::DigestError;
use crate::runtime::TransferError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure confined to a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O failure during connect, accept, read or write.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer closed its side of the stream.
    #[error("stream closed by peer")]
    StreamClosed,

    /// The digest of a payload could not be computed.
    #[error("digest error: {0}")]
    Digest(#[from] DigestError),

    /// A response was produced while the connection's backlog was full.
    #[error("response backlog full ({0} outstanding)")]
    BacklogFull(usize),
}

impl From<TransferError> for ConnectionError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Closed => ConnectionError::StreamClosed,
            TransferError::Io(e) => ConnectionError::Transport(e),
        }
    }
}

/// Failure of the polling handle itself, or of setting it up. Fatal for the
/// whole reactor.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    /// The configured digest cannot size response frames.
    #[error("digest unavailable: {0}")]
    Digest(#[from] DigestError),

    #[error("failed to set up {what}: {source}")]
    Setup {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ReactorError {
    pub fn setup(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| ReactorError::Setup { what, source }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts_to_transport() {
        let err: ConnectionError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, ConnectionError::Transport(_)));
        assert!(err.to_string().starts_with("transport error"));
    }

    #[test]
    fn test_zero_read_converts_to_stream_closed() {
        let err: ConnectionError = TransferError::Closed.into();
        assert!(matches!(err, ConnectionError::StreamClosed));
    }

    #[test]
    fn test_setup_error_names_the_resource() {
        let err = ReactorError::setup("listener")(io::Error::new(
            io::ErrorKind::AddrInUse,
            "in use",
        ));
        assert_eq!(err.to_string(), "failed to set up listener: in use");
    }
}
