//! Rollout controller. Drives the start and finish phases.
//!
//! Start ramps the candidate to its initial share, waits for readiness,
//! and records baseline/candidate identities in the experiment. Finish
//! commits the winner by moving all traffic to it. Both phases are
//! forward-only: cluster mutations made before a failure are left in
//! place, and re-running a phase redoes the same steps.

use std::fmt;

use tokio::sync::watch;
use tracing::{info, warn};

use isvc_core::{
    CANDIDATE_NAME, HandlerConfig, HandlerError, HandlerResult, PollSchedule, VersionInfo,
};

use crate::cluster::ClusterClient;
use crate::experiment::ExperimentView;
use crate::target::{InferenceServiceTarget, winner_traffic_percent};
use crate::target_ref::{TargetRef, TargetVariant};

/// Which half of the experiment lifecycle to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Finish,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Start => f.write_str("start"),
            Phase::Finish => f.write_str("finish"),
        }
    }
}

/// What a successful phase did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Candidate ramped and version info committed.
    Started(VersionInfo),
    /// Winner committed with the resulting canary weight.
    Promoted { winner: String, traffic_percent: i64 },
    /// Single-version experiment; nothing to promote.
    Skipped,
}

/// Runs rollout phases against one cluster.
pub struct RolloutController<C> {
    cluster: C,
    schedule: PollSchedule,
    shutdown: watch::Receiver<bool>,
}

impl<C: ClusterClient> RolloutController<C> {
    pub fn new(cluster: C, schedule: PollSchedule, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            cluster,
            schedule,
            shutdown,
        }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    fn target(&self, variant: TargetVariant) -> InferenceServiceTarget<'_, C> {
        InferenceServiceTarget::new(&self.cluster, variant, self.schedule, self.shutdown.clone())
    }

    /// Load the configured experiment and run `phase` on it.
    pub async fn run(&self, phase: Phase, config: &HandlerConfig) -> HandlerResult<PhaseOutcome> {
        let mut experiment = ExperimentView::load(
            &self.cluster,
            &config.experiment_name,
            &config.experiment_namespace,
        )
        .await?;

        info!(
            %phase,
            experiment = %experiment.object_key(),
            target = %experiment.target_ref(),
            "running phase"
        );
        match phase {
            Phase::Start => self.start(&mut experiment).await.map(PhaseOutcome::Started),
            Phase::Finish => self.finish(&experiment).await,
        }
    }

    /// Ramp the candidate to 1%, wait for readiness, commit version info.
    pub async fn start(&self, experiment: &mut ExperimentView) -> HandlerResult<VersionInfo> {
        let target_ref = experiment.target_ref().to_string();
        let resolved = TargetRef::parse(&target_ref)?;

        let target = self
            .target(resolved.variant)
            .fetch(&target_ref)
            .await
            .initialize_traffic_split()
            .await
            .into_result()?;

        let version_info = target.extract_version_info(&target_ref)?;
        experiment
            .commit_version_info(&self.cluster, version_info.clone())
            .await?;

        info!(target = %resolved, "start phase complete");
        Ok(version_info)
    }

    /// Move all traffic to the winning version.
    ///
    /// The winner is the recommended baseline when the experiment has one,
    /// otherwise the current baseline stays the winner.
    pub async fn finish(&self, experiment: &ExperimentView) -> HandlerResult<PhaseOutcome> {
        if experiment.is_single_version() {
            info!(experiment = %experiment.object_key(), "single-version experiment; nothing to promote");
            return Ok(PhaseOutcome::Skipped);
        }

        let target_ref = experiment.target_ref();
        let resolved = TargetRef::parse(target_ref)?;

        let target = self
            .target(resolved.variant)
            .fetch(target_ref)
            .await
            .into_result()?;

        let winner = select_winner(experiment)?;
        let target = target
            .promote_winner(&winner, CANDIDATE_NAME)
            .await
            .into_result()?;

        let traffic_percent = target
            .traffic_percent()
            .unwrap_or_else(|| winner_traffic_percent(&winner, CANDIDATE_NAME));
        info!(target = %resolved, %winner, traffic_percent, "finish phase complete");
        Ok(PhaseOutcome::Promoted {
            winner,
            traffic_percent,
        })
    }
}

/// Recommended baseline if present, else the current baseline.
fn select_winner(experiment: &ExperimentView) -> HandlerResult<String> {
    match experiment.recommended_baseline() {
        Ok(recommended) => Ok(recommended.to_string()),
        Err(HandlerError::MissingRecommendation) => {
            let baseline = experiment.baseline()?;
            warn!(
                experiment = %experiment.object_key(),
                %baseline,
                "no recommended baseline; keeping current baseline"
            );
            Ok(baseline.to_string())
        }
        Err(e) => Err(e),
    }
}
