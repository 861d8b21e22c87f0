//! isvc-core: shared types for the inference-service canary handler.
//!
//! - **`types`**: experiment resource, VersionInfo wire shapes, status conditions
//! - **`config`**: environment-driven handler configuration
//! - **`error`**: handler and cluster error taxonomy

pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigError, HandlerConfig, PollSchedule};
pub use error::{ClusterError, ClusterResult, HandlerError, HandlerResult};
pub use types::*;
