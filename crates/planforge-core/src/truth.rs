use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The approved (requirements, PRD) pair for a job.
///
/// Written by the approval gate in a single store transaction and immutable
/// thereafter; all downstream tasks of the job read their contract from
/// here. Requesting changes replaces the record, which invalidates every
/// later artifact of the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruthRecord {
    /// The owning job.
    pub job_id: Uuid,
    /// Hash of the original requirements text.
    pub requirements_hash: String,
    /// Hash of the approved PRD artifact content.
    pub prd_hash: String,
    /// The approved PRD artifact id (its content hash).
    pub prd_artifact_id: String,
    /// When the approval was granted.
    pub approved_at: DateTime<Utc>,
    /// Reviewer notes attached to the approval.
    pub notes: Option<String>,
}
