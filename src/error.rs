use std::time::Duration;

use thiserror::Error;

use crate::types::ErrorKind;

/// Failure of a single neighbor-table source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`{what}` did not finish within {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("privileged execution of `{command}` failed: {reason}")]
    PrivilegeDenied { command: String, reason: String },
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Spawn { .. } | SourceError::Read { .. } | SourceError::Exit { .. } => {
                ErrorKind::SourceUnavailable
            }
            SourceError::Timeout { .. } => ErrorKind::Timeout,
            SourceError::PrivilegeDenied { .. } => ErrorKind::PrivilegeDenied,
        }
    }

    /// Re-label a failure that happened while running through the escalation prefix.
    /// Timeouts keep their kind.
    pub fn into_privileged(self) -> Self {
        match self {
            SourceError::Timeout { .. } | SourceError::PrivilegeDenied { .. } => self,
            SourceError::Spawn { command, source } => SourceError::PrivilegeDenied {
                command,
                reason: source.to_string(),
            },
            SourceError::Read { path, source } => SourceError::PrivilegeDenied {
                command: path,
                reason: source.to_string(),
            },
            SourceError::Exit {
                command,
                status,
                stderr,
            } => SourceError::PrivilegeDenied {
                command,
                reason: if stderr.is_empty() {
                    status
                } else {
                    format!("{status}: {stderr}")
                },
            },
        }
    }
}
