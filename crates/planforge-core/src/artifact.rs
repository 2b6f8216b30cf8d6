use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Kind of artifact produced by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Prd,
    Plan,
    FeatureTree,
    Architecture,
    Uiux,
    Development,
    Qa,
    Security,
    Documentation,
    Support,
    PmReview,
    Delivery,
    /// Untyped raw task output.
    Raw,
}

impl ArtifactKind {
    /// Stable string form, used in routes and persisted payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Prd => "prd",
            ArtifactKind::Plan => "plan",
            ArtifactKind::FeatureTree => "feature_tree",
            ArtifactKind::Architecture => "architecture",
            ArtifactKind::Uiux => "uiux",
            ArtifactKind::Development => "development",
            ArtifactKind::Qa => "qa",
            ArtifactKind::Security => "security",
            ArtifactKind::Documentation => "documentation",
            ArtifactKind::Support => "support",
            ArtifactKind::PmReview => "pm_review",
            ArtifactKind::Delivery => "delivery",
            ArtifactKind::Raw => "raw",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [ArtifactKind; 13] = [
            ArtifactKind::Prd,
            ArtifactKind::Plan,
            ArtifactKind::FeatureTree,
            ArtifactKind::Architecture,
            ArtifactKind::Uiux,
            ArtifactKind::Development,
            ArtifactKind::Qa,
            ArtifactKind::Security,
            ArtifactKind::Documentation,
            ArtifactKind::Support,
            ArtifactKind::PmReview,
            ArtifactKind::Delivery,
            ArtifactKind::Raw,
        ];
        ALL.iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown artifact kind '{s}'"))
    }
}

/// Hex-encoded SHA-256 of the serialized content.
///
/// This is the artifact's identity: two puts of identical content produce
/// the same hash and a single stored copy.
pub fn content_hash(content: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    // serde_json serialization is stable for a given Value, so the digest is
    // reproducible across processes.
    hasher.update(content.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of a raw string, used for requirements hashes.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// A content-addressed output of a task. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Content hash; the artifact's identity.
    pub hash: String,
    /// Artifact type.
    pub kind: ArtifactKind,
    /// The owning job.
    pub job_id: Uuid,
    /// The producing task.
    pub task_id: Uuid,
    /// The artifact body.
    pub content: serde_json::Value,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates an artifact, computing its content hash.
    pub fn new(kind: ArtifactKind, job_id: Uuid, task_id: Uuid, content: serde_json::Value) -> Self {
        Self {
            hash: content_hash(&content),
            kind,
            job_id,
            task_id,
            content,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let content = serde_json::json!({"title": "PRD", "sections": ["goals", "scope"]});
        assert_eq!(content_hash(&content), content_hash(&content.clone()));
    }

    #[test]
    fn test_content_hash_differs_for_different_content() {
        let a = serde_json::json!({"title": "PRD"});
        let b = serde_json::json!({"title": "Plan"});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_artifact_hash_matches_content() {
        let content = serde_json::json!({"x": 1});
        let artifact = Artifact::new(
            ArtifactKind::Prd,
            Uuid::new_v4(),
            Uuid::new_v4(),
            content.clone(),
        );
        assert_eq!(artifact.hash, content_hash(&content));
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        let kind: ArtifactKind = "feature_tree".parse().unwrap();
        assert_eq!(kind, ArtifactKind::FeatureTree);
        assert!("blueprint".parse::<ArtifactKind>().is_err());
    }
}
