//! Error types for fanout

use crate::cluster::NodeId;
use reqwest::Method;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Request validation ===
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cannot construct URI for node {node}: {reason}")]
    UriConstruction { node: NodeId, reason: String },

    // === Cluster state ===
    #[error("Received a mutable request [{method} {path}] while a node is disconnected from the cluster")]
    DisconnectedNodeRejection { method: Method, path: String },

    #[error("Received a mutable request [{method} {path}] while a node is trying to connect to the cluster")]
    ConnectingNodeRejection { method: Method, path: String },

    // === Capacity / lifecycle ===
    #[error("There are too many outstanding HTTP requests with a total {outstanding} outstanding requests")]
    Overloaded { outstanding: usize },

    #[error("Replicator is not running")]
    NotRunning,

    // === Two-phase commit ===
    #[error("Node {node} is unable to fulfill this request due to: {explanation}")]
    VerificationRejected { node: NodeId, explanation: String },

    // === Aggregation ===
    #[error("Request {0} is not yet complete")]
    Incomplete(String),

    #[error("Failed to merge node responses: {0}")]
    Merge(String),

    #[error("Response body could not be read: {0}")]
    Body(String),

    // === Network ===
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Map to the HTTP status a caller-facing API edge would emit.
    pub fn to_http_status(&self) -> reqwest::StatusCode {
        use reqwest::StatusCode;
        match self {
            Error::InvalidArgument(_) | Error::InvalidConfig(_) | Error::UriConstruction { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::DisconnectedNodeRejection { .. }
            | Error::ConnectingNodeRejection { .. }
            | Error::VerificationRejected { .. } => StatusCode::CONFLICT,
            Error::Overloaded { .. } | Error::NotRunning | Error::Http(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::InvalidArgument(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::InvalidArgument(s)
    }
}
