//! Typed failures that callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error` with context attached. Record
//! mismatches and dropped workflow events are not errors at all.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeckitError {
    /// The tracker or agent process could not be reached or misbehaved.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// The session map could not be read or durably written.
    #[error("session store persistence failed at {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl SpeckitError {
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        SpeckitError::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SpeckitError::Config {
            message: message.into(),
        }
    }
}
