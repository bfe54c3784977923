//! Core data models used throughout the engine.
//!
//! These types represent the concepts, sources, instances, and relationships
//! that make up the knowledge graph, plus the documents and jobs that flow
//! through the ingestion pipeline.
//!
//! Identifiers are content-hashed at creation and never change: a concept id
//! is derived from its label and ontology, a source id from its document hash
//! and chunk index, a document id from its raw content. Jobs use random
//! UUIDs because two submissions of the same content are distinct tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The semantic unit of the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    /// Content-hashed identifier, stable for the lifetime of the concept.
    pub id: String,
    /// Short display name.
    pub label: String,
    /// Prose description accumulated at creation; never overwritten by reuse.
    pub description: String,
    /// Ordered alternate phrasings, appended to on reuse.
    pub search_terms: Vec<String>,
    /// Embedding of label + description + search terms.
    pub embedding: Vec<f32>,
    /// Owning ontology tag.
    pub ontology: String,
    /// Creation epoch seconds.
    pub created_at: i64,
}

impl Concept {
    /// Derive the stable identifier for a concept from its label and ontology.
    pub fn make_id(label: &str, ontology: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ontology.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(label.trim().to_lowercase().as_bytes());
        format!("c_{:.32}", hex::encode(hasher.finalize()))
    }
}

/// An evidence chunk: verbatim text from an ingested document.
///
/// Immutable once stored; deleted only with its document or ontology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Content-hashed identifier derived from document id + chunk index.
    pub id: String,
    /// Full chunk text.
    pub text: String,
    /// Ordinal position within the document.
    pub chunk_index: i64,
    /// Owning document id.
    pub document_id: String,
    /// Object-store key for image-derived sources.
    pub object_key: Option<String>,
    /// Owning ontology tag.
    pub ontology: String,
}

impl Source {
    pub fn make_id(document_id: &str, chunk_index: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_bytes());
        hasher.update(chunk_index.to_le_bytes());
        format!("s_{:.32}", hex::encode(hasher.finalize()))
    }
}

/// An appearance of a concept in a source, with the verbatim quote.
///
/// `(concept_id, source_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub concept_id: String,
    pub source_id: String,
    pub quote: String,
}

/// A directed typed edge between two concepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    /// Name of a currently-active vocabulary type (or one later re-typed
    /// to an active type via consolidation).
    pub type_name: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Source ids supporting this edge, deduplicated.
    pub evidence: Vec<String>,
    pub created_at: i64,
}

impl Relationship {
    pub fn make_id(from_id: &str, to_id: &str, type_name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(from_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(to_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(type_name.as_bytes());
        format!("r_{:.32}", hex::encode(hasher.finalize()))
    }
}

/// A logical unit of ingested content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Content hash of the raw bytes; globally unique.
    pub id: String,
    pub filename: String,
    pub ontology: String,
    /// `text` or `image`.
    pub content_type: String,
    pub mime: String,
    pub size_bytes: i64,
    /// Object-store key holding the raw bytes, for image documents.
    pub object_key: Option<String>,
    pub ingested_at: i64,
}

impl Document {
    pub fn make_id(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        format!("d_{:.32}", hex::encode(hasher.finalize()))
    }
}

/// A relationship type owned by the vocabulary manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyType {
    /// UPPER_SNAKE identifier.
    pub name: String,
    pub active: bool,
    /// Builtin types are seeded at init and never deleted.
    pub builtin: bool,
    pub category: String,
    /// Set when auto-categorization could not pick a clear winner.
    pub ambiguous: bool,
    pub embedding: Option<Vec<f32>>,
    /// Number of edges carrying this type.
    pub usage_count: i64,
    /// Set when deactivated by a merge; names the surviving type.
    pub merged_into: Option<String>,
    pub created_at: i64,
}

/// Lifecycle of an asynchronous job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    AwaitingApproval,
    Approved,
    Running,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "approved" => Some(Self::Approved),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

/// Pre-flight token/cost estimate shown to the approver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CostEstimate {
    pub chunks: usize,
    pub est_tokens_in: u64,
    pub est_tokens_out: u64,
    pub est_cost_usd: f64,
}

/// Progress counters updated as a job runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobProgress {
    pub chunks_total: usize,
    pub chunks_done: usize,
    pub concepts_created: usize,
    pub concepts_reused: usize,
    pub instances_created: usize,
    pub edges_created: usize,
    pub new_types_created: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// A persistent record of an ingestion (or maintenance) task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Random UUID.
    pub id: String,
    /// `ingest_text`, `ingest_image`, ...
    pub job_type: String,
    pub status: JobStatus,
    /// Authenticated principal that submitted the job.
    pub principal: String,
    pub ontology: String,
    /// Submitted parameters, JSON.
    pub params: serde_json::Value,
    pub cost_estimate: Option<CostEstimate>,
    pub progress: JobProgress,
    /// Per-chunk error messages; a job can complete with a non-empty list.
    pub errors: Vec<String>,
    pub result: Option<serde_json::Value>,
    /// Exempt from retention sweeps.
    pub protected: bool,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Deadline for pending-approval jobs, after which they expire.
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concept_id_stable_and_case_insensitive() {
        let a = Concept::make_id("Meditation", "Philosophy");
        let b = Concept::make_id("meditation", "Philosophy");
        let c = Concept::make_id("Meditation", "Science");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("c_"));
    }

    #[test]
    fn source_id_depends_on_index() {
        let a = Source::make_id("d_abc", 0);
        let b = Source::make_id("d_abc", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn job_status_roundtrip() {
        for s in [
            JobStatus::Submitted,
            JobStatus::AwaitingApproval,
            JobStatus::Approved,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Expired,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
