//! Target reference parsing and API variant selection.
//!
//! A target reference is `[v1alpha2/]namespace/name`. Without a tag the
//! v1beta1 InferenceService API is addressed.

use std::fmt;
use std::str::FromStr;

use isvc_core::{HandlerError, HandlerResult};

use crate::cluster::{ObjectKey, ResourceKind};

/// Kind name shared by every InferenceService API version.
pub const INFERENCE_SERVICE_KIND: &str = "InferenceService";

const SERVING_GROUP: &str = "serving.kubeflow.org";

/// InferenceService API version a target lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetVariant {
    /// Default when the reference carries no tag.
    V1beta1,
    V1alpha2,
}

impl TargetVariant {
    /// Reference tag selecting the non-default variant.
    pub const ALTERNATE_TAG: &'static str = "v1alpha2";

    pub fn version(self) -> &'static str {
        match self {
            TargetVariant::V1beta1 => "v1beta1",
            TargetVariant::V1alpha2 => "v1alpha2",
        }
    }

    pub fn resource(self) -> ResourceKind {
        ResourceKind {
            group: SERVING_GROUP,
            version: self.version(),
            kind: INFERENCE_SERVICE_KIND,
        }
    }

    pub fn api_version(self) -> String {
        self.resource().api_version()
    }

    /// JSON pointer of the canary traffic weight.
    pub fn traffic_field_path(self) -> &'static str {
        match self {
            TargetVariant::V1beta1 => "/spec/predictor/canaryTrafficPercent",
            TargetVariant::V1alpha2 => "/spec/canaryTrafficPercent",
        }
    }

    /// JSON pointer of the most recently created revision (the candidate).
    pub fn candidate_revision_path(self) -> &'static str {
        match self {
            TargetVariant::V1beta1 => "/status/components/predictor/latestCreatedRevision",
            TargetVariant::V1alpha2 => "/status/canary/predictor/name",
        }
    }

    /// JSON pointer of the most recently rolled-out revision (the baseline).
    pub fn baseline_revision_path(self) -> &'static str {
        match self {
            TargetVariant::V1beta1 => "/status/components/predictor/latestRolledoutRevision",
            TargetVariant::V1alpha2 => "/status/default/predictor/name",
        }
    }
}

impl fmt::Display for TargetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.version())
    }
}

/// A parsed target reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub variant: TargetVariant,
    pub namespace: String,
    pub name: String,
}

impl TargetRef {
    pub fn parse(target_ref: &str) -> HandlerResult<Self> {
        let invalid = || HandlerError::InvalidTargetRef {
            target_ref: target_ref.to_string(),
        };

        let segments: Vec<&str> = target_ref.split('/').collect();
        let (variant, namespace, name) = match segments.as_slice() {
            [tag, namespace, name] if *tag == TargetVariant::ALTERNATE_TAG => {
                (TargetVariant::V1alpha2, *namespace, *name)
            }
            [namespace, name] => (TargetVariant::V1beta1, *namespace, *name),
            _ => return Err(invalid()),
        };

        if namespace.is_empty() || name.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            variant,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.variant.resource(), &self.namespace, &self.name)
    }
}

impl FromStr for TargetRef {
    type Err = HandlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant {
            TargetVariant::V1beta1 => write!(f, "{}/{}", self.namespace, self.name),
            TargetVariant::V1alpha2 => write!(
                f,
                "{}/{}/{}",
                TargetVariant::ALTERNATE_TAG,
                self.namespace,
                self.name
            ),
        }
    }
}

/// Resolve a reference into `(variant, namespace, name)` without any I/O.
pub fn resolve(target_ref: &str) -> HandlerResult<(TargetVariant, String, String)> {
    let parsed = TargetRef::parse(target_ref)?;
    Ok((parsed.variant, parsed.namespace, parsed.name))
}
