//! isvc-rollout: canary rollout control for inference services.
//!
//! Drives a single baseline/candidate pair through two phases:
//! `start` ramps the candidate to 1% and records version info in the
//! owning experiment; `finish` moves all traffic to the winner.
//!
//! # Components
//!
//! - **`cluster`**: `ClusterClient` seam and an in-memory cluster
//! - **`target_ref`**: target reference parsing and API variant selection
//! - **`experiment`**: read/write view over the experiment resource
//! - **`poller`**: fixed-interval bounded polling with cancellation
//! - **`target`**: InferenceService fetch / traffic patch / readiness state machine
//! - **`controller`**: start and finish phase orchestration

pub mod cluster;
pub mod controller;
pub mod experiment;
pub mod poller;
pub mod target;
pub mod target_ref;

pub use cluster::{ClusterClient, EXPERIMENT_KIND, MemoryCluster, ObjectKey, ResourceKind};
pub use controller::{Phase, PhaseOutcome, RolloutController};
pub use experiment::ExperimentView;
pub use poller::{PollOutcome, Poller};
pub use target::{InferenceServiceTarget, TargetState};
pub use target_ref::{TargetRef, TargetVariant, resolve};
