//! `ClusterClient` backed by the Kubernetes API server.
//!
//! Resources are addressed dynamically by group/version/kind, so no
//! typed CRD definitions are needed for experiments or inference services.

use anyhow::Context;
use kube::Client;
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::Value;
use tracing::debug;

use isvc_core::{ClusterError, ClusterResult};
use isvc_rollout::{ClusterClient, ObjectKey};

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connect using in-cluster config, falling back to the local kubeconfig.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("failed to build Kubernetes client")?;
        Ok(Self { client })
    }

    fn api(&self, key: &ObjectKey) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(key.resource.group, key.resource.version, key.resource.kind);
        let resource = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), &key.namespace, &resource)
    }
}

fn to_cluster_error(key: &ObjectKey, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound {
            kind: key.resource.kind.to_string(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        },
        kube::Error::Api(response) => ClusterError::Api {
            code: response.code,
            message: response.message,
        },
        kube::Error::SerdeError(e) => ClusterError::Decode(e.to_string()),
        other => ClusterError::Transport(other.to_string()),
    }
}

fn to_document(object: DynamicObject) -> ClusterResult<Value> {
    serde_json::to_value(object).map_err(|e| ClusterError::Decode(e.to_string()))
}

impl ClusterClient for KubeCluster {
    async fn get(&self, key: &ObjectKey) -> ClusterResult<Value> {
        debug!(%key, "get");
        let object = self
            .api(key)
            .get(&key.name)
            .await
            .map_err(|e| to_cluster_error(key, e))?;
        to_document(object)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> ClusterResult<Value> {
        debug!(%key, %patch, "json patch");
        let operations: json_patch::Patch = serde_json::from_value(patch.clone())
            .map_err(|e| ClusterError::InvalidPatch(e.to_string()))?;
        let object = self
            .api(key)
            .patch(
                &key.name,
                &PatchParams::default(),
                &Patch::Json::<()>(operations),
            )
            .await
            .map_err(|e| to_cluster_error(key, e))?;
        to_document(object)
    }
}
