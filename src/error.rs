//! Error types for baremetal-deploy

use std::time::Duration;

use thiserror::Error;

use crate::ironic::ProvisionState;

/// Main error type for deployment and config drive operations
///
/// Errors are recorded on the [`Deployment`](crate::deploy::Deployment) and
/// also returned to the caller, so every variant is cheap to clone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error("Transport error during {operation}: {message}")]
    Transport {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Node {node} reported unexpected provision state '{state}' while waiting for '{expected}'")]
    UnexpectedState {
        node: String,
        expected: ProvisionState,
        state: ProvisionState,
    },

    #[error("Config drive build failed: {0}")]
    Build(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout after {waited:?} waiting for node {node} to reach '{expected}'")]
    Timeout {
        node: String,
        expected: ProvisionState,
        waited: Duration,
    },

    #[error("Deployment of node {0} was cancelled")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DeployError {
    /// Create a transport error without an HTTP status
    pub fn transport(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            operation: operation.into(),
            status: None,
            message: message.to_string(),
        }
    }

    /// Create a build error from any underlying cause
    pub fn build(context: &str, cause: impl std::fmt::Display) -> Self {
        Self::Build(format!("{}: {}", context, cause))
    }

    /// HTTP status of a transport error, if the remote answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DeployError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for DeployError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            operation: err
                .url()
                .map(|u| u.path().to_string())
                .unwrap_or_else(|| "request".to_string()),
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
