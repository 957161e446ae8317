//! Job records, payload variants, and batch phase state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload carried by a job, keyed by `kind`
///
/// Each variant has a fixed schema and is validated when the row is decoded.
/// A payload that fails to decode is discarded rather than dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Draft one section of an article
    SectionDraft {
        article_id: Uuid,
        section_key: String,
    },

    /// Push a finished article to an outbound target
    ///
    /// Publication retries use the deferred `next_retry_at` backoff variant.
    Publish { article_id: Uuid, target: String },

    /// Fetch keyword data an article depends on
    ///
    /// Emitted as a dependency job when a draft finds no research to work
    /// from; the original job is released and retried later.
    KeywordResearch { article_id: Uuid, topic: String },
}

impl JobPayload {
    /// Stable kind discriminator, matching the serde tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SectionDraft { .. } => "section_draft",
            Self::Publish { .. } => "publish",
            Self::KeywordResearch { .. } => "keyword_research",
        }
    }
}

/// Pipeline phase of a batch
///
/// Transitions follow a fixed table: Drafting -> Assembling -> Publishing
/// -> Done. Anything else is rejected by [`BatchPhase::can_advance_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    /// Section jobs are being drained
    Drafting,

    /// Sections are assembled into an article
    Assembling,

    /// Publish jobs are being drained
    Publishing,

    /// Pipeline finished for this batch
    Done,
}

impl BatchPhase {
    /// The phase that follows this one, if any
    pub fn next(&self) -> Option<BatchPhase> {
        match self {
            Self::Drafting => Some(Self::Assembling),
            Self::Assembling => Some(Self::Publishing),
            Self::Publishing => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// Check the transition table
    pub fn can_advance_to(&self, to: BatchPhase) -> bool {
        self.next() == Some(to)
    }
}

impl std::fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drafting => write!(f, "drafting"),
            Self::Assembling => write!(f, "assembling"),
            Self::Publishing => write!(f, "publishing"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Parse a phase from its snake_case form
impl std::str::FromStr for BatchPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafting" => Ok(Self::Drafting),
            "assembling" => Ok(Self::Assembling),
            "publishing" => Ok(Self::Publishing),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown batch phase: {other}")),
        }
    }
}

/// A job row as stored
///
/// Rows are never physically deleted; a terminal job keeps `completed_at`
/// set with `error` populated for failed ones, so operators can inspect it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub batch_id: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Whether the job is in a terminal state (success or exhausted retries)
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Whether the job holds a lease that has expired
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until < now) && self.locked_by.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transition_table() {
        assert!(BatchPhase::Drafting.can_advance_to(BatchPhase::Assembling));
        assert!(BatchPhase::Assembling.can_advance_to(BatchPhase::Publishing));
        assert!(BatchPhase::Publishing.can_advance_to(BatchPhase::Done));

        // Skips and reversals are rejected
        assert!(!BatchPhase::Drafting.can_advance_to(BatchPhase::Publishing));
        assert!(!BatchPhase::Publishing.can_advance_to(BatchPhase::Drafting));
        assert!(!BatchPhase::Done.can_advance_to(BatchPhase::Done));
        assert_eq!(BatchPhase::Done.next(), None);
    }

    #[test]
    fn test_phase_roundtrip() {
        for phase in [
            BatchPhase::Drafting,
            BatchPhase::Assembling,
            BatchPhase::Publishing,
            BatchPhase::Done,
        ] {
            let parsed: BatchPhase = phase.to_string().parse().unwrap();
            assert_eq!(parsed, phase);
        }
        assert!("sideways".parse::<BatchPhase>().is_err());
    }

    #[test]
    fn test_payload_tagged_by_kind() {
        let payload = JobPayload::SectionDraft {
            article_id: Uuid::now_v7(),
            section_key: "intro".to_string(),
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "section_draft");

        let parsed: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_unknown_payload_kind_rejected() {
        let json = serde_json::json!({"kind": "mystery", "article_id": Uuid::now_v7()});
        assert!(serde_json::from_value::<JobPayload>(json).is_err());
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        let job = JobRecord {
            id: Uuid::now_v7(),
            batch_id: "b1".to_string(),
            payload: JobPayload::Publish {
                article_id: Uuid::now_v7(),
                target: "cms".to_string(),
            },
            priority: 0,
            locked_by: Some("w1".to_string()),
            locked_at: Some(now - chrono::Duration::minutes(10)),
            locked_until: Some(now - chrono::Duration::minutes(5)),
            completed_at: None,
            error: None,
            retry_count: 0,
            max_retries: 2,
            next_retry_at: None,
            created_at: now,
        };

        assert!(job.lock_expired(now));
        assert!(!job.is_terminal());
    }
}
