//! Versioned model artifacts produced by completed rounds.
//!
//! Versions are `major.minor.patch`; each completed round bumps the patch of the model's
//! latest version. Only a `ModelSummary` is stored, never the full weights.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::federated_learning::{AggregationMetrics, ModelSummary};

pub const INITIAL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: Uuid,
    pub model_id: String,
    pub version: String,
    pub round_id: Uuid,
    pub metrics: AggregationMetrics,
    pub summary: ModelSummary,
    pub created_at: DateTime<Utc>,
}

impl ModelVersion {
    pub fn new(model_id: impl Into<String>, version: String, round_id: Uuid, metrics: AggregationMetrics, summary: ModelSummary) -> Self {
        Self { id: Uuid::new_v4(), model_id: model_id.into(), version, round_id, metrics, summary, created_at: Utc::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemVer { pub major: u64, pub minor: u64, pub patch: u64 }

impl SemVer {
    /// Parses `1.2.3`, tolerating a leading `v` and ignoring pre-release/build suffixes.
    pub fn parse(s: &str) -> Option<Self> {
        let core = s.trim().trim_start_matches('v').split(['-', '+']).next()?;
        let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
        let major = parts.next()??;
        let minor = parts.next().unwrap_or(Some(0))?;
        let patch = parts.next().unwrap_or(Some(0))?;
        if parts.next().is_some() { return None; }
        Some(Self { major, minor, patch })
    }

    pub fn bump_patch(self) -> Self { Self { patch: self.patch + 1, ..self } }
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}.{}.{}", self.major, self.minor, self.patch) }
}

/// Version string for the next round of a model whose latest version is `latest`.
pub fn next_version(latest: Option<&str>) -> String {
    match latest.and_then(SemVer::parse) {
        Some(v) => v.bump_patch().to_string(),
        None => {
            if let Some(raw) = latest { tracing::warn!(version = %raw, "unparseable model version; restarting at {}", INITIAL_VERSION); }
            INITIAL_VERSION.to_string()
        }
    }
}
