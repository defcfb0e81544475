//! Error types for presence-core operations.
//!
//! Nothing here is fatal to the embedding application: every variant is
//! recovered locally by the client or the controller. The only question a
//! caller needs answered is whether the channel survived, see
//! [`PresenceError::drops_connection`].

use presence_protocol::FrameError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    // ─────────────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("IPC channel {name} unavailable: {source}")]
    ChannelUnavailable {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not connect to the presence peer. Is it running?")]
    PeerUnavailable,

    #[error("Handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    #[error("Not connected to the presence peer")]
    NotConnected,

    // ─────────────────────────────────────────────────────────────────────
    // Channel I/O Errors (drop the connection)
    // ─────────────────────────────────────────────────────────────────────
    #[error("Timed out writing to the IPC channel")]
    WriteTimeout,

    #[error("Timed out reading from the IPC channel")]
    ReadTimeout,

    #[error("IPC channel I/O error: {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Lost connection to the presence peer")]
    PeerClosed,

    #[error("Peer closed the connection {code}: {message}")]
    PeerClosedWith { code: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    // ─────────────────────────────────────────────────────────────────────
    // Request Errors (connection stays up)
    // ─────────────────────────────────────────────────────────────────────
    #[error("Peer error {code}: {message}")]
    PeerReported { code: String, message: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration error: {path}: {details}")]
    Config { path: PathBuf, details: String },
}

impl PresenceError {
    /// Whether the channel must be closed after this error.
    ///
    /// Read/write level failures leave the stream in an unknown position, so
    /// the only safe recovery is a fresh connection. A structured error reply
    /// from the peer was fully consumed and leaves the channel usable.
    pub fn drops_connection(&self) -> bool {
        matches!(
            self,
            PresenceError::WriteTimeout
                | PresenceError::ReadTimeout
                | PresenceError::Io { .. }
                | PresenceError::PeerClosed
                | PresenceError::PeerClosedWith { .. }
                | PresenceError::Protocol(_)
        )
    }
}

/// Convenience type alias for Results using PresenceError.
pub type Result<T> = std::result::Result<T, PresenceError>;
