//! Error types for ipadump
//!
//! Domain failures are modeled as explicit variants so callers can tell
//! recoverable connection problems apart from fatal dump failures.

use std::io;
use thiserror::Error;

/// Main error type for ipadump operations
#[derive(Debug, Error)]
pub enum DumperError {
    /// The SSH endpoint rejected the supplied credentials
    #[error("SSH authentication failed for {username}@{host}:{port}")]
    AuthenticationFailed {
        host: String,
        port: u16,
        username: String,
    },

    /// No SSH server reachable at the endpoint
    #[error("No SSH server was found at {host}:{port}")]
    Unreachable { host: String, port: u16 },

    /// A remote-copy operation was attempted before a session existed
    #[error("SSH transport is not connected")]
    NotConnected,

    /// Target application could not be spawned or attached
    #[error("Unable to launch target app '{target}': {source}")]
    LaunchFailed {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// Scratch directory could not be recreated
    #[error("Failed to create download directory '{path}': {source}")]
    ScratchDir {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A remote fetch failed (idle timeout, dropped connection)
    #[error("Remote fetch of '{remote}' failed: {source}")]
    Fetch {
        remote: String,
        #[source]
        source: anyhow::Error,
    },

    /// The agent never announced the application bundle
    #[error("No application bundle record was collected; cannot assemble archive")]
    MissingAppRecord,

    /// The user interrupted the dump while it was waiting
    #[error("Dump interrupted by user")]
    Interrupted,

    /// A dump was requested in a state that does not allow it
    #[error("Invalid session state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Anything without a dedicated variant
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ipadump operations
pub type Result<T> = std::result::Result<T, DumperError>;

impl DumperError {
    /// True for failures the caller handles by reporting and retrying,
    /// rather than aborting the process.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DumperError::AuthenticationFailed { .. }
                | DumperError::Unreachable { .. }
                | DumperError::LaunchFailed { .. }
        )
    }

    /// Message shown to the user on the console
    pub fn user_message(&self) -> String {
        match self {
            DumperError::AuthenticationFailed { .. } => {
                "The specified SSH credentials are invalid.".to_string()
            }
            DumperError::Unreachable { host, port } => {
                format!("No SSH server was found at '{host}:{port}'.")
            }
            DumperError::MissingAppRecord => {
                "The agent finished without reporting the app bundle; nothing to assemble."
                    .to_string()
            }
            DumperError::Interrupted => "Dump aborted.".to_string(),
            _ => self.to_string(),
        }
    }
}
