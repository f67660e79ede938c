//! Sync error handling
//!
//! Typed errors for the protocol engine and its transport, with a
//! classification of which ones the connection manager recovers from on
//! its own.

use thiserror::Error;

/// Errors that can occur while synchronizing documents
#[derive(Error, Debug)]
pub enum SyncError {
    /// An incremental update did not follow on from the local version
    #[error(
        "Lost updates for '{id}': local version is {local} but the update starts from {received}"
    )]
    VersionMismatch { id: String, local: u64, received: u64 },

    /// Inbound frame was not valid JSON or not a known message shape
    #[error("Malformed message: {0}")]
    MalformedMessage(#[source] serde_json::Error),

    /// A JSON patch could not be applied to the mirrored value
    #[error("Failed to apply patch to '{id}': {source}")]
    Patch {
        id: String,
        #[source]
        source: json_patch::PatchError,
    },

    /// Outbound message could not be serialized
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The transport failed to connect, send or receive
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connecting took longer than the liveness timeout
    #[error("Timed out connecting to '{url}'")]
    ConnectTimeout { url: String },

    /// No document is registered under the given pattern
    #[error("No document registered for '{0}'")]
    UnknownDocument(String),

    /// The connection task is no longer running
    #[error("Seapig client task has stopped")]
    Stopped,
}

impl SyncError {
    /// Check if the connection manager recovers from this error by itself
    ///
    /// A version mismatch or a failed patch counts as recoverable because the
    /// engine forces a full resubscription, but the application is still
    /// told about it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::VersionMismatch { .. }
                | SyncError::Patch { .. }
                | SyncError::Transport(_)
                | SyncError::ConnectTimeout { .. }
                | SyncError::MalformedMessage(_)
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::VersionMismatch { .. } | SyncError::Patch { .. } => {
                Some("The subscription was re-registered from version 0; a full snapshot will follow.")
            }
            SyncError::ConnectTimeout { .. } | SyncError::Transport(_) => {
                Some("Check that the Seapig server is running and reachable. The client keeps retrying.")
            }
            SyncError::UnknownDocument(_) => {
                Some("Subscribe to or register the pattern before publishing to it.")
            }
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(error.to_string())
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
