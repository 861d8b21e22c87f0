//! InferenceService target: fetch, traffic patch, readiness gate.
//!
//! A target is driven through a by-value chain:
//!
//! ```text
//! Unfetched ──fetch──▶ Fetched ──set_traffic_percent──▶ TrafficPatched ──ready──▶ Ready
//!     └──────────────────────┴─────────────── any failure ───────────────────────▶ Errored
//! ```
//!
//! The first error is sticky. Every later chained call on an errored
//! target returns it unchanged, so no further cluster mutation happens
//! once something has gone wrong.

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use isvc_core::{
    BASELINE_NAME, CANDIDATE_NAME, Condition, HandlerError, HandlerResult, PollSchedule,
    VersionDetail, VersionInfo, WeightObjectReference, condition_status,
};

use crate::cluster::{ClusterClient, ObjectKey, replace_patch};
use crate::poller::{PollOutcome, Poller};
use crate::target_ref::{INFERENCE_SERVICE_KIND, TargetRef, TargetVariant};

/// Initial canary share set at the start of an experiment.
pub const INITIAL_CANARY_PERCENT: i64 = 1;

const READY_CONDITION: &str = "Ready";

/// Lifecycle of a target. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TargetState {
    Unfetched,
    Fetched,
    /// Patch accepted, readiness not yet confirmed. Never observable by callers.
    TrafficPatched,
    Ready,
    Errored,
}

/// One InferenceService whose canary traffic split is being driven.
pub struct InferenceServiceTarget<'c, C> {
    cluster: &'c C,
    variant: TargetVariant,
    target: Option<TargetRef>,
    document: Option<Value>,
    state: TargetState,
    error: Option<HandlerError>,
    poller: Poller,
}

impl<'c, C: ClusterClient> InferenceServiceTarget<'c, C> {
    pub fn new(
        cluster: &'c C,
        variant: TargetVariant,
        schedule: PollSchedule,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cluster,
            variant,
            target: None,
            document: None,
            state: TargetState::Unfetched,
            error: None,
            poller: Poller::new(schedule, shutdown),
        }
    }

    pub fn variant(&self) -> TargetVariant {
        self.variant
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    /// Last fetched (or patched) document.
    pub fn document(&self) -> Option<&Value> {
        self.document.as_ref()
    }

    pub fn error(&self) -> Option<&HandlerError> {
        self.error.as_ref()
    }

    /// Convert the sticky error, if any, into a `Result`.
    pub fn into_result(self) -> HandlerResult<Self> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Canary weight in the last seen document.
    pub fn traffic_percent(&self) -> Option<i64> {
        self.document
            .as_ref()?
            .pointer(self.variant.traffic_field_path())?
            .as_i64()
    }

    fn advance(&mut self, to: TargetState) {
        if self.error.is_none() && to > self.state {
            debug!(from = ?self.state, ?to, "target state advanced");
            self.state = to;
        }
    }

    fn record_error(&mut self, err: HandlerError) {
        if self.error.is_none() {
            warn!(variant = %self.variant, error = %err, "target errored");
            self.error = Some(err);
            self.state = TargetState::Errored;
        }
    }

    fn fail(mut self, err: HandlerError) -> Self {
        self.record_error(err);
        self
    }

    /// Resolve `target_ref` and get the object, retrying while it materializes.
    pub async fn fetch(mut self, target_ref: &str) -> Self {
        if self.error.is_some() {
            return self;
        }

        let resolved = match TargetRef::parse(target_ref) {
            Ok(r) if r.variant == self.variant => r,
            _ => {
                return self.fail(HandlerError::InvalidTargetRef {
                    target_ref: target_ref.to_string(),
                });
            }
        };

        let key = resolved.object_key();
        let cluster = self.cluster;
        let retries = self.poller.schedule().retries;
        let outcome = {
            let key = &key;
            self.poller
                .run("target fetch", move |_| async move { cluster.get(key).await })
                .await
        };

        match outcome {
            PollOutcome::Ready(document) => {
                info!(
                    namespace = %resolved.namespace,
                    name = %resolved.name,
                    variant = %self.variant,
                    "target fetched"
                );
                self.document = Some(document);
                self.target = Some(resolved);
                self.advance(TargetState::Fetched);
                self
            }
            PollOutcome::Exhausted(last) => self.fail(HandlerError::FetchTimeout {
                namespace: resolved.namespace,
                name: resolved.name,
                retries,
                last_error: last.to_string(),
            }),
            PollOutcome::Cancelled => self.fail(HandlerError::Cancelled(key.to_string())),
        }
    }

    /// Patch the canary weight to `percent` and block until the target is ready.
    pub async fn set_traffic_percent(mut self, percent: i64) -> Self {
        if self.error.is_some() {
            return self;
        }
        if !(0..=100).contains(&percent) {
            return self.fail(HandlerError::InvalidTrafficPercent(percent));
        }
        let key = match self.object_key() {
            Some(key) if self.state >= TargetState::Fetched => key,
            _ => return self.fail(HandlerError::UninitializedTarget),
        };

        let patch = match replace_patch(self.variant.traffic_field_path(), &percent) {
            Ok(patch) => patch,
            Err(source) => {
                return self.fail(HandlerError::Patch {
                    resource: key.to_string(),
                    source,
                });
            }
        };

        match self.cluster.patch(&key, &patch).await {
            Ok(document) => {
                info!(%key, percent, "canary traffic patched");
                self.document = Some(document);
                self.advance(TargetState::TrafficPatched);
            }
            Err(source) => {
                return self.fail(HandlerError::Patch {
                    resource: key.to_string(),
                    source,
                });
            }
        }

        if self.ensure_readiness().await {
            self.advance(TargetState::Ready);
        } else if let Some(target) = &self.target {
            let err = HandlerError::ReadinessTimeout {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
                retries: self.poller.schedule().retries,
            };
            self.record_error(err);
        }
        self
    }

    /// Poll until the `Ready` condition is `True`, re-fetching every attempt.
    ///
    /// Returns false when the budget runs out. A cancelled poll records a
    /// sticky `Cancelled` error and also returns false.
    pub async fn ensure_readiness(&mut self) -> bool {
        if self.error.is_some() {
            return false;
        }
        let Some(key) = self.object_key() else {
            self.record_error(HandlerError::UninitializedTarget);
            return false;
        };

        let cluster = self.cluster;
        let outcome = {
            let key = &key;
            self.poller
                .run("target readiness", move |_| async move {
                    let document = cluster.get(key).await.map_err(|e| e.to_string())?;
                    if is_ready(&document) {
                        Ok(document)
                    } else {
                        Err(format!("{READY_CONDITION} condition is not True"))
                    }
                })
                .await
        };

        match outcome {
            PollOutcome::Ready(document) => {
                info!(%key, "target is ready");
                self.document = Some(document);
                true
            }
            PollOutcome::Exhausted(last) => {
                warn!(%key, reason = %last, "target never became ready");
                false
            }
            PollOutcome::Cancelled => {
                self.record_error(HandlerError::Cancelled(format!("readiness of {key}")));
                false
            }
        }
    }

    /// Build baseline/candidate VersionInfo from the fetched status.
    pub fn extract_version_info(&self, target_ref: &str) -> HandlerResult<VersionInfo> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let document = self.document.as_ref().ok_or(HandlerError::UninitializedTarget)?;

        let read = |path: &str| {
            document
                .pointer(path)
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::IncompleteStatus {
                    field: path.to_string(),
                })
        };
        let candidate_revision = read(self.variant.candidate_revision_path())?;
        let baseline_revision = read(self.variant.baseline_revision_path())?;

        let target = match TargetRef::parse(target_ref) {
            Ok(target) if target.variant == self.variant => target,
            _ => {
                return Err(HandlerError::InvalidTargetRef {
                    target_ref: target_ref.to_string(),
                });
            }
        };

        let mut candidate = VersionDetail::with_revision(CANDIDATE_NAME, candidate_revision);
        candidate.weight_object_reference = Some(WeightObjectReference {
            kind: INFERENCE_SERVICE_KIND.to_string(),
            namespace: target.namespace,
            name: target.name,
            api_version: target.variant.api_version(),
            field_path: target.variant.traffic_field_path().to_string(),
        });

        Ok(VersionInfo {
            baseline: VersionDetail::with_revision(BASELINE_NAME, baseline_revision),
            candidates: vec![candidate],
        })
    }

    /// Ramp the candidate to its fixed initial share.
    pub async fn initialize_traffic_split(self) -> Self {
        self.set_traffic_percent(INITIAL_CANARY_PERCENT).await
    }

    /// Send all traffic to the candidate if it won, otherwise none.
    pub async fn promote_winner(self, winner: &str, candidate: &str) -> Self {
        let percent = winner_traffic_percent(winner, candidate);
        if self.error.is_none() {
            info!(winner, candidate, percent, "promoting winner");
        }
        self.set_traffic_percent(percent).await
    }

    /// Key of the resolved target, once fetched.
    pub fn object_key(&self) -> Option<ObjectKey> {
        self.target.as_ref().map(TargetRef::object_key)
    }
}

/// Canary weight that makes `winner` the sole receiver of traffic.
pub fn winner_traffic_percent(winner: &str, candidate: &str) -> i64 {
    if winner == candidate { 100 } else { 0 }
}

/// Whether `status.conditions` carries `Ready=True`.
fn is_ready(document: &Value) -> bool {
    document
        .pointer("/status/conditions")
        .cloned()
        .and_then(|v| serde_json::from_value::<Vec<Condition>>(v).ok())
        .is_some_and(|conditions| condition_status(&conditions, READY_CONDITION) == Some("True"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use isvc_core::ClusterError;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::cluster::MemoryCluster;

    const TARGET_REF: &str = "default/my-model";

    fn fixture() -> Value {
        serde_json::from_str(include_str!("../tests/fixtures/canary_v1beta1.json")).unwrap()
    }

    fn v1alpha2_fixture() -> Value {
        serde_json::from_str(include_str!("../tests/fixtures/canary_v1alpha2.json")).unwrap()
    }

    fn key() -> ObjectKey {
        TargetRef::parse(TARGET_REF).unwrap().object_key()
    }

    fn cluster_with(document: Value) -> MemoryCluster {
        let cluster = MemoryCluster::new();
        cluster.insert(key(), document);
        cluster
    }

    fn target(cluster: &MemoryCluster) -> InferenceServiceTarget<'_, MemoryCluster> {
        let (_tx, rx) = watch::channel(false);
        InferenceServiceTarget::new(cluster, TargetVariant::V1beta1, PollSchedule::default(), rx)
    }

    fn set_ready(document: &mut Value, status: &str) {
        document["status"]["conditions"] = json!([{ "type": "Ready", "status": status }]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_existing_target() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster).fetch(TARGET_REF).await;

        assert!(targ.error().is_none());
        assert_eq!(targ.state(), TargetState::Fetched);
        assert_eq!(targ.document(), Some(&fixture()));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_rejects_bad_reference() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster).fetch("my-model").await;

        assert!(matches!(targ.error(), Some(HandlerError::InvalidTargetRef { .. })));
        assert_eq!(targ.state(), TargetState::Errored);
        assert_eq!(cluster.get_count(&key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_rejects_reference_for_other_variant() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster).fetch("v1alpha2/default/my-model").await;
        assert!(matches!(targ.error(), Some(HandlerError::InvalidTargetRef { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_waits_for_materializing_target() {
        let cluster = cluster_with(fixture());
        cluster.hide_for_gets(&key(), 4);
        let start = Instant::now();

        let targ = target(&cluster).fetch(TARGET_REF).await;

        assert!(targ.error().is_none());
        assert_eq!(cluster.get_count(&key()), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_timeout_after_exact_budget() {
        let cluster = MemoryCluster::new();
        let start = Instant::now();

        let targ = target(&cluster).fetch(TARGET_REF).await;

        match targ.error() {
            Some(HandlerError::FetchTimeout { retries, last_error, .. }) => {
                assert_eq!(*retries, 18);
                assert!(last_error.contains("not found"));
            }
            other => panic!("expected FetchTimeout, got {other:?}"),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(180));
        assert_eq!(cluster.get_count(&key()), 19);
    }

    #[tokio::test(start_paused = true)]
    async fn set_traffic_before_fetch_is_uninitialized() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster).set_traffic_percent(1).await;

        assert!(matches!(targ.error(), Some(HandlerError::UninitializedTarget)));
        assert!(cluster.patches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_traffic_rejects_out_of_range() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster).fetch(TARGET_REF).await.set_traffic_percent(101).await;

        assert!(matches!(targ.error(), Some(HandlerError::InvalidTrafficPercent(101))));
        assert!(cluster.patches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_traffic_split_sets_one_percent_and_becomes_ready() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster)
            .fetch(TARGET_REF)
            .await
            .initialize_traffic_split()
            .await;

        assert!(targ.error().is_none());
        assert_eq!(targ.state(), TargetState::Ready);
        assert_eq!(targ.traffic_percent(), Some(1));
        assert_eq!(
            cluster.object(&key()).unwrap()["spec"]["predictor"]["canaryTrafficPercent"],
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_traffic_patch_is_idempotent() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster)
            .fetch(TARGET_REF)
            .await
            .set_traffic_percent(40)
            .await
            .set_traffic_percent(40)
            .await;

        assert!(targ.error().is_none());
        assert_eq!(targ.state(), TargetState::Ready);
        assert_eq!(targ.traffic_percent(), Some(40));
        assert_eq!(cluster.patches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_waits_for_ready_condition() {
        let mut document = fixture();
        set_ready(&mut document, "False");
        let cluster = cluster_with(document);
        // First get is the fetch; readiness flips on the fourth get overall.
        cluster.on_get(&key(), |count, doc| {
            if count >= 4 {
                set_ready(doc, "True");
            }
        });
        let start = Instant::now();

        let targ = target(&cluster)
            .fetch(TARGET_REF)
            .await
            .initialize_traffic_split()
            .await;

        assert!(targ.error().is_none());
        assert_eq!(targ.state(), TargetState::Ready);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn get_errors_during_readiness_count_as_not_ready() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster).fetch(TARGET_REF).await;
        cluster.hide_for_gets(&key(), 3);
        let start = Instant::now();

        let targ = targ.set_traffic_percent(1).await;

        assert!(targ.error().is_none());
        assert_eq!(targ.state(), TargetState::Ready);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        // One fetch, three hidden readiness gets, one that succeeds.
        assert_eq!(cluster.get_count(&key()), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_is_sticky() {
        let mut document = fixture();
        set_ready(&mut document, "Unknown");
        let cluster = cluster_with(document);
        let start = Instant::now();

        let targ = target(&cluster)
            .fetch(TARGET_REF)
            .await
            .initialize_traffic_split()
            .await;

        assert!(matches!(targ.error(), Some(HandlerError::ReadinessTimeout { retries: 18, .. })));
        assert_eq!(targ.state(), TargetState::Errored);
        assert_eq!(start.elapsed(), Duration::from_secs(180));

        // Later links in the chain do nothing.
        let targ = targ.set_traffic_percent(100).await;
        assert!(matches!(targ.error(), Some(HandlerError::ReadinessTimeout { .. })));
        assert_eq!(cluster.patches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_conditions_count_as_not_ready() {
        let mut document = fixture();
        document["status"].as_object_mut().unwrap().remove("conditions");
        let cluster = cluster_with(document);

        let mut targ = target(&cluster).fetch(TARGET_REF).await;
        assert!(!targ.ensure_readiness().await);
        assert!(targ.error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_patch_is_patch_error() {
        let cluster = cluster_with(fixture());
        cluster.reject_patches(TargetVariant::V1beta1.resource());

        let targ = target(&cluster)
            .fetch(TARGET_REF)
            .await
            .initialize_traffic_split()
            .await;

        match targ.error() {
            Some(HandlerError::Patch { source, .. }) => {
                assert!(matches!(source, ClusterError::Api { code: 403, .. }));
            }
            other => panic!("expected Patch error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_readiness_is_sticky() {
        let mut document = fixture();
        set_ready(&mut document, "False");
        let cluster = cluster_with(document);
        let (tx, rx) = watch::channel(false);
        let targ = InferenceServiceTarget::new(
            &cluster,
            TargetVariant::V1beta1,
            PollSchedule::default(),
            rx,
        );

        let targ = targ.fetch(TARGET_REF).await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            let _ = tx.send(true);
        });
        let targ = targ.initialize_traffic_split().await;

        assert!(matches!(targ.error(), Some(HandlerError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn extract_version_info_from_status() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster).fetch(TARGET_REF).await;

        let vi = targ.extract_version_info(TARGET_REF).unwrap();

        assert_eq!(vi.baseline.name, "default");
        assert_eq!(
            vi.baseline.tags,
            BTreeMap::from([("revision".to_string(), "my-model-predictor-default-wl2cv".to_string())])
        );
        assert_eq!(vi.candidates.len(), 1);
        let candidate = &vi.candidates[0];
        assert_eq!(candidate.name, "canary");
        assert_eq!(candidate.revision(), Some("my-model-predictor-default-zwjbq"));
        assert_eq!(
            candidate.weight_object_reference,
            Some(WeightObjectReference {
                kind: "InferenceService".to_string(),
                namespace: "default".to_string(),
                name: "my-model".to_string(),
                api_version: "serving.kubeflow.org/v1beta1".to_string(),
                field_path: "/spec/predictor/canaryTrafficPercent".to_string(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn extract_version_info_needs_both_revisions() {
        let mut document = fixture();
        document["status"]["components"]["predictor"]
            .as_object_mut()
            .unwrap()
            .remove("latestRolledoutRevision");
        let cluster = cluster_with(document);
        let targ = target(&cluster).fetch(TARGET_REF).await;

        let err = targ.extract_version_info(TARGET_REF).unwrap_err();
        match err {
            HandlerError::IncompleteStatus { field } => {
                assert!(field.ends_with("latestRolledoutRevision"));
            }
            other => panic!("expected IncompleteStatus, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn extract_version_info_rejects_reference_for_other_variant() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster).fetch(TARGET_REF).await;

        let err = targ
            .extract_version_info("v1alpha2/default/my-model")
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidTargetRef { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn extract_version_info_before_fetch_is_uninitialized() {
        let cluster = MemoryCluster::new();
        let err = target(&cluster).extract_version_info(TARGET_REF).unwrap_err();
        assert!(matches!(err, HandlerError::UninitializedTarget));
    }

    #[tokio::test(start_paused = true)]
    async fn v1alpha2_target_uses_its_own_paths() {
        let target_ref = "v1alpha2/default/my-model";
        let key = TargetRef::parse(target_ref).unwrap().object_key();
        let cluster = MemoryCluster::new();
        cluster.insert(key.clone(), v1alpha2_fixture());
        let (_tx, rx) = watch::channel(false);

        let targ = InferenceServiceTarget::new(
            &cluster,
            TargetVariant::V1alpha2,
            PollSchedule::default(),
            rx,
        )
        .fetch(target_ref)
        .await
        .initialize_traffic_split()
        .await;

        assert!(targ.error().is_none());
        assert_eq!(cluster.object(&key).unwrap()["spec"]["canaryTrafficPercent"], 1);

        let vi = targ.extract_version_info(target_ref).unwrap();
        assert_eq!(vi.baseline.revision(), Some("my-model-predictor-default-7sb5c"));
        assert_eq!(vi.candidates[0].revision(), Some("my-model-predictor-canary-q2w8n"));
        let weight = vi.candidates[0].weight_object_reference.as_ref().unwrap();
        assert_eq!(weight.api_version, "serving.kubeflow.org/v1alpha2");
        assert_eq!(weight.field_path, "/spec/canaryTrafficPercent");
    }

    #[tokio::test(start_paused = true)]
    async fn promote_winner_percentages() {
        let cluster = cluster_with(fixture());
        let targ = target(&cluster)
            .fetch(TARGET_REF)
            .await
            .promote_winner("canary", "canary")
            .await;
        assert_eq!(targ.traffic_percent(), Some(100));

        let targ = targ.promote_winner("default", "canary").await;
        assert_eq!(targ.traffic_percent(), Some(0));
        assert!(targ.error().is_none());
    }

    #[test]
    fn winner_percent() {
        assert_eq!(winner_traffic_percent("canary", "canary"), 100);
        assert_eq!(winner_traffic_percent("default", "canary"), 0);
    }
}
