//! Cluster access seam.
//!
//! The rollout logic only ever gets a resource as a JSON document and
//! applies RFC 6902 JSON patches to it. `ClusterClient` captures exactly
//! that, so the production kube client and the in-memory cluster used in
//! tests are interchangeable.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use isvc_core::{ClusterError, ClusterResult};

/// Group, version, and kind of a namespaced resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
}

impl ResourceKind {
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

/// The experiment resource that owns a rollout.
pub const EXPERIMENT_KIND: ResourceKind = ResourceKind {
    group: "iter8.tools",
    version: "v2alpha1",
    kind: "Experiment",
};

/// Address of a single namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub resource: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(resource: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            resource,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn not_found(&self) -> ClusterError {
        ClusterError::NotFound {
            kind: self.resource.kind.to_string(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.resource.kind, self.namespace, self.name)
    }
}

/// Minimal cluster API used by the rollout logic.
///
/// Calls are issued strictly one at a time by the controller.
pub trait ClusterClient: Send + Sync {
    /// Fetch the full object as a JSON document.
    fn get(&self, key: &ObjectKey) -> impl Future<Output = ClusterResult<Value>> + Send;

    /// Apply a JSON patch document and return the patched object.
    fn patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> impl Future<Output = ClusterResult<Value>> + Send;
}

/// A one-operation `replace` JSON patch.
pub fn replace_patch<T: Serialize>(path: &str, value: &T) -> ClusterResult<Value> {
    let value = serde_json::to_value(value).map_err(|e| ClusterError::InvalidPatch(e.to_string()))?;
    Ok(json!([{ "op": "replace", "path": path, "value": value }]))
}

type GetHook = Box<dyn Fn(u32, &mut Value) + Send>;

#[derive(Default)]
struct MemoryInner {
    objects: HashMap<ObjectKey, Value>,
    /// Remaining gets that report NotFound for an existing object.
    hidden: HashMap<ObjectKey, u32>,
    rejected: HashSet<ResourceKind>,
    hooks: HashMap<ObjectKey, GetHook>,
    gets: HashMap<ObjectKey, u32>,
    patches: Vec<(ObjectKey, Value)>,
}

/// In-memory cluster for tests and dry runs.
///
/// Cloning shares the underlying store.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store (or replace) an object.
    pub fn insert(&self, key: ObjectKey, document: Value) {
        self.lock().objects.insert(key, document);
    }

    /// Current stored document, bypassing hooks and counters.
    pub fn object(&self, key: &ObjectKey) -> Option<Value> {
        self.lock().objects.get(key).cloned()
    }

    /// Make the next `gets` reads of `key` fail with NotFound.
    pub fn hide_for_gets(&self, key: &ObjectKey, gets: u32) {
        self.lock().hidden.insert(key.clone(), gets);
    }

    /// Reject every patch against resources of this kind.
    pub fn reject_patches(&self, resource: ResourceKind) {
        self.lock().rejected.insert(resource);
    }

    /// Run `hook` on the stored document before every successful get.
    ///
    /// The hook receives the 1-based count of gets issued for `key`.
    pub fn on_get<F>(&self, key: &ObjectKey, hook: F)
    where
        F: Fn(u32, &mut Value) + Send + 'static,
    {
        self.lock().hooks.insert(key.clone(), Box::new(hook));
    }

    /// Number of gets issued for `key`, including failed ones.
    pub fn get_count(&self, key: &ObjectKey) -> u32 {
        self.lock().gets.get(key).copied().unwrap_or(0)
    }

    /// Every patch accepted so far, in order.
    pub fn patches(&self) -> Vec<(ObjectKey, Value)> {
        self.lock().patches.clone()
    }
}

impl ClusterClient for MemoryCluster {
    async fn get(&self, key: &ObjectKey) -> ClusterResult<Value> {
        let mut inner = self.lock();
        let count = {
            let entry = inner.gets.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if let Some(remaining) = inner.hidden.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(key.not_found());
            }
        }

        let MemoryInner { objects, hooks, .. } = &mut *inner;
        let document = objects.get_mut(key).ok_or_else(|| key.not_found())?;
        if let Some(hook) = hooks.get(key) {
            hook(count, document);
        }
        Ok(document.clone())
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> ClusterResult<Value> {
        let mut inner = self.lock();
        if inner.rejected.contains(&key.resource) {
            return Err(ClusterError::Api {
                code: 403,
                message: format!("patch of {key} is forbidden"),
            });
        }

        let operations: json_patch::Patch = serde_json::from_value(patch.clone())
            .map_err(|e| ClusterError::InvalidPatch(e.to_string()))?;
        let current = inner.objects.get(key).ok_or_else(|| key.not_found())?;

        // Apply to a copy so a failing operation leaves the object untouched.
        let mut patched = current.clone();
        json_patch::patch(&mut patched, &operations.0).map_err(|e| ClusterError::Api {
            code: 422,
            message: e.to_string(),
        })?;

        debug!(%key, "memory cluster applied patch");
        inner.objects.insert(key.clone(), patched.clone());
        inner.patches.push((key.clone(), patch.clone()));
        Ok(patched)
    }
}
