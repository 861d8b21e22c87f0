//! Experiment resource and VersionInfo types shared across handler crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Version name given to the candidate in committed VersionInfo.
pub const CANDIDATE_NAME: &str = "canary";

/// Version name given to the baseline in committed VersionInfo.
pub const BASELINE_NAME: &str = "default";

/// Tag key carrying the serving revision of a version.
pub const REVISION_TAG: &str = "revision";

/// Experiment strategy as declared in `spec.strategy.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyType {
    Canary,
    /// Single-version experiment; there is no candidate to promote.
    Performance,
    BlueGreen,
    #[serde(alias = "A/B")]
    AB,
}

impl StrategyType {
    pub fn is_single_version(self) -> bool {
        matches!(self, StrategyType::Performance)
    }
}

/// The slice of an experiment resource the handler reads.
///
/// Unknown fields are ignored on decode; the handler only ever writes
/// `spec.versionInfo`, and it does so through a JSON patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResource {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: ExperimentSpec,
    #[serde(default)]
    pub status: ExperimentStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Target reference, `[variant/]namespace/name`.
    pub target: String,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_info: Option<VersionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    /// Set by the analysis side of the experiment, never by this handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_baseline: Option<String>,
}

impl ExperimentResource {
    /// Build a minimal experiment resource.
    pub fn new(name: &str, namespace: &str, target: &str, strategy: StrategyType) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            spec: ExperimentSpec {
                target: target.to_string(),
                strategy: Strategy {
                    strategy_type: strategy,
                },
                version_info: None,
            },
            status: ExperimentStatus::default(),
        }
    }

    pub fn with_version_info(mut self, version_info: VersionInfo) -> Self {
        self.spec.version_info = Some(version_info);
        self
    }

    pub fn with_recommended_baseline(mut self, baseline: &str) -> Self {
        self.status.recommended_baseline = Some(baseline.to_string());
        self
    }
}

/// Baseline and candidate identities recorded in an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub baseline: VersionDetail,
    /// Empty only for single-version strategies.
    #[serde(default)]
    pub candidates: Vec<VersionDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDetail {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(
        rename = "weightObjRef",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub weight_object_reference: Option<WeightObjectReference>,
}

impl VersionDetail {
    /// A version tagged with its serving revision.
    pub fn with_revision(name: &str, revision: &str) -> Self {
        Self {
            name: name.to_string(),
            tags: BTreeMap::from([(REVISION_TAG.to_string(), revision.to_string())]),
            weight_object_reference: None,
        }
    }

    pub fn revision(&self) -> Option<&str> {
        self.tags.get(REVISION_TAG).map(String::as_str)
    }
}

/// Points at the field holding a version's traffic weight.
///
/// Missing fields decode as empty strings. Serialization writes all five.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WeightObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub api_version: String,
    pub field_path: String,
}

/// One entry of a resource's `status.conditions` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    /// One of `True`, `False`, `Unknown`.
    pub status: String,
}

/// Status of the named condition, if present.
pub fn condition_status<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
        .map(|c| c.status.as_str())
}
