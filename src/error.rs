//! Errors surfaced by the host-facing convenience layer.
//!
//! The stack-level API reports failures through [`Status`] and leaves the
//! error text on the stack; these variants are what the `exec` helpers and
//! config loading turn that into.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::Status;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Load or call returned a failure status. The message is the error text
    /// the runtime left on the stack (already popped).
    #[error("{status}: {message}")]
    Runtime { status: Status, message: String },

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl BridgeError {
    /// Status of a runtime failure, if this is one.
    pub fn status(&self) -> Option<Status> {
        match self {
            BridgeError::Runtime { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
