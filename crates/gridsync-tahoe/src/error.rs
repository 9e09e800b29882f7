//! Error types for gateway, capability and magic-folder operations

use std::path::PathBuf;
use thiserror::Error;

/// Output suffix emitted by daemons that lack folder-scoped subcommands
pub const NOT_RECOGNIZED: &str = "not recognized";

/// Errors that can occur while driving a Tahoe-LAFS node
#[derive(Debug, Error)]
pub enum TahoeError {
    /// The node executable exited abnormally; carries the captured output
    #[error("Tahoe command failed: {0}")]
    Command(String),

    /// The node's web API returned a non-success status
    #[error("HTTP {status}: {body}")]
    Web { status: u16, body: String },

    /// Attempted to create a client over an existing node directory
    #[error("Node directory already exists: {}", .0.display())]
    NodedirExists(PathBuf),

    /// A rootcap file is already present and must not be overwritten
    #[error("Rootcap file already exists: {}", .0.display())]
    RootcapExists(PathBuf),

    /// The operation needs a running node (base URL and token)
    #[error("Tahoe node is not running")]
    NotRunning,

    /// No magic-folder with this name is registered on the gateway
    #[error("Unknown magic-folder: {0}")]
    UnknownFolder(String),

    /// A magic-folder with this name is already registered
    #[error("Magic-folder already exists: {0}")]
    FolderExists(String),

    /// A join code was not of the form `<collective>+<personal>`
    #[error("Invalid join code: {0}")]
    InvalidJoinCode(String),

    /// A write was requested through a read-only capability
    #[error("Capability is read-only: {0}")]
    ReadOnlyCapability(String),

    /// No usable `tahoe` executable could be located
    #[error("No tahoe executable found")]
    ExecutableNotFound,

    /// Node configuration is missing or malformed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl TahoeError {
    /// True when a command failed because the daemon does not know the
    /// subcommand or option (used to select the subclient fallback)
    pub fn is_not_recognized(&self) -> bool {
        matches!(self, TahoeError::Command(output) if output.trim_end().ends_with(NOT_RECOGNIZED))
    }

    /// True when the daemon could not be reached at all
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, TahoeError::Http(e) if e.is_connect())
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, TahoeError>;
