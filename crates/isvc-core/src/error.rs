//! Error types for the canary handler.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for handler operations.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Result type alias for cluster API calls.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by a start or finish phase.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(
        "invalid target reference {target_ref:?}; expected 'namespace/name' or 'v1alpha2/namespace/name'"
    )]
    InvalidTargetRef { target_ref: String },

    #[error("unable to fetch target {namespace}/{name} after {retries} retries: {last_error}")]
    FetchTimeout {
        namespace: String,
        name: String,
        retries: u32,
        last_error: String,
    },

    #[error("target {namespace}/{name} did not become ready after {retries} retries")]
    ReadinessTimeout {
        namespace: String,
        name: String,
        retries: u32,
    },

    #[error("patch of {resource} rejected: {source}")]
    Patch {
        resource: String,
        #[source]
        source: ClusterError,
    },

    #[error("unable to extract version info: target status is missing {field}")]
    IncompleteStatus { field: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("recommended baseline not found in experiment status")]
    MissingRecommendation,

    #[error("versionInfo not found in experiment spec")]
    MissingVersionInfo,

    #[error("unable to set canary traffic split; target has not been fetched")]
    UninitializedTarget,

    #[error("canary traffic percent {0} is outside 0..=100")]
    InvalidTrafficPercent(i64),

    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    #[error("cannot load experiment {namespace}/{name}: {reason}")]
    Experiment {
        namespace: String,
        name: String,
        reason: String,
    },
}

/// Errors returned by a cluster client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}
