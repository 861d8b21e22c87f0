//! Read/write view over the experiment that owns a rollout.

use tracing::{debug, info};

use isvc_core::{ExperimentResource, HandlerError, HandlerResult, VersionInfo};

use crate::cluster::{ClusterClient, EXPERIMENT_KIND, ObjectKey, replace_patch};

const VERSION_INFO_PATH: &str = "/spec/versionInfo";

#[derive(Debug, Clone)]
pub struct ExperimentView {
    resource: ExperimentResource,
}

impl ExperimentView {
    pub fn new(resource: ExperimentResource) -> Self {
        Self { resource }
    }

    /// Get and decode the experiment from the cluster.
    pub async fn load<C: ClusterClient>(
        cluster: &C,
        name: &str,
        namespace: &str,
    ) -> HandlerResult<Self> {
        let load_error = |reason: String| HandlerError::Experiment {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason,
        };

        let key = ObjectKey::new(EXPERIMENT_KIND, namespace, name);
        let document = cluster
            .get(&key)
            .await
            .map_err(|e| load_error(e.to_string()))?;
        let mut resource: ExperimentResource =
            serde_json::from_value(document).map_err(|e| load_error(e.to_string()))?;

        // Trust the requested identity over possibly sparse metadata.
        resource.metadata.name = name.to_string();
        resource.metadata.namespace = namespace.to_string();

        debug!(%key, target = %resource.spec.target, "experiment loaded");
        Ok(Self::new(resource))
    }

    pub fn resource(&self) -> &ExperimentResource {
        &self.resource
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(
            EXPERIMENT_KIND,
            &self.resource.metadata.namespace,
            &self.resource.metadata.name,
        )
    }

    pub fn target_ref(&self) -> &str {
        &self.resource.spec.target
    }

    pub fn is_single_version(&self) -> bool {
        self.resource.spec.strategy.strategy_type.is_single_version()
    }

    pub fn version_info(&self) -> Option<&VersionInfo> {
        self.resource.spec.version_info.as_ref()
    }

    /// Name of the current baseline version.
    pub fn baseline(&self) -> HandlerResult<&str> {
        self.version_info()
            .map(|vi| vi.baseline.name.as_str())
            .ok_or(HandlerError::MissingVersionInfo)
    }

    /// Baseline recommended by the experiment's analysis, if it has decided.
    pub fn recommended_baseline(&self) -> HandlerResult<&str> {
        self.resource
            .status
            .recommended_baseline
            .as_deref()
            .ok_or(HandlerError::MissingRecommendation)
    }

    /// Replace `spec.versionInfo` in the cluster, then in this view.
    pub async fn commit_version_info<C: ClusterClient>(
        &mut self,
        cluster: &C,
        version_info: VersionInfo,
    ) -> HandlerResult<()> {
        if !self.is_single_version() && version_info.candidates.is_empty() {
            return Err(HandlerError::Validation(
                "expected baseline and candidate; version info has no candidates".to_string(),
            ));
        }

        let key = self.object_key();
        let patch = replace_patch(VERSION_INFO_PATH, &version_info).map_err(|source| {
            HandlerError::Patch {
                resource: key.to_string(),
                source,
            }
        })?;
        cluster
            .patch(&key, &patch)
            .await
            .map_err(|source| HandlerError::Patch {
                resource: key.to_string(),
                source,
            })?;

        info!(
            %key,
            baseline = %version_info.baseline.name,
            candidates = version_info.candidates.len(),
            "version info committed"
        );
        self.resource.spec.version_info = Some(version_info);
        Ok(())
    }
}
