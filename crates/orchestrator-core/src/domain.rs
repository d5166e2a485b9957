//! Plain data model for the entities the orchestration core reads or
//! mutates. Storage-only fields a persistence backend might carry
//! (row versions, audit columns) are deliberately absent — this module
//! models only what the orchestrators and workers depend on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use agon_gateway_core::gateway::{Citation, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Builtin,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Registered,
    Active,
    Suspended,
    Failed,
}

/// Identity for a debate/topic participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub kind: ParticipantKind,
    pub status: ParticipantStatus,
    pub endpoint_url: Option<String>,
    pub model_identifier: Option<String>,
}

impl Participant {
    /// External participants may enter an active run only while active.
    #[must_use]
    pub fn may_enter_active_run(&self) -> bool {
        match self.kind {
            ParticipantKind::Builtin => true,
            ParticipantKind::External => self.status == ParticipantStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateFormat {
    OneVOne,
    TwoVTwo,
    ThreeVThree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateMode {
    Async,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateRun {
    pub id: Uuid,
    pub topic: String,
    pub format: DebateFormat,
    pub mode: DebateMode,
    pub max_turns: u32,
    pub current_turn: u32,
    pub turn_timeout_seconds: u64,
    pub turn_cooldown_seconds: u64,
    pub status: DebateStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_sandbox: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    Scheduled,
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRun {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TopicStatus,
    pub duration_minutes: u32,
    pub polling_interval_seconds: u64,
    pub max_comments_per_agent: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// One of a Debate or a Topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "run_kind", rename_all = "snake_case")]
pub enum Run {
    Debate(DebateRun),
    Topic(TopicRun),
}

impl Run {
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Run::Debate(d) => d.id,
            Run::Topic(t) => t.id,
        }
    }

    #[must_use]
    pub fn run_kind(&self) -> &'static str {
        match self {
            Run::Debate(_) => "debate",
            Run::Topic(_) => "topic",
        }
    }
}

/// Binds a participant to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participation {
    pub id: Uuid,
    pub run_id: Uuid,
    pub participant_id: Uuid,
    pub side: Option<Side>,
    pub team_id: Option<String>,
    pub turn_order: Option<u32>,
    pub max_comments: Option<u32>,
    pub comment_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Validated,
    Timeout,
    FormatError,
}

impl TurnStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, TurnStatus::Pending)
    }
}

/// Per-debate ordered unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub debate_id: Uuid,
    pub turn_number: u32,
    pub status: TurnStatus,
    pub stance: String,
    pub claim: String,
    pub argument: String,
    pub citations: Vec<Citation>,
    pub rebuttal_target: Option<Uuid>,
    pub token_count: usize,
    pub submitted_at: Option<DateTime<Utc>>,
    pub validated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Agree,
    Rebut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentReference {
    pub comment_id: Uuid,
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub quote: String,
}

/// Per-topic unordered unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub participant_id: Uuid,
    pub content: String,
    pub references: Vec<CommentReference>,
    pub citations: Vec<Citation>,
    pub stance: Option<String>,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactcheckStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Target of a fact-check: either a debate turn or a topic comment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FactcheckTarget {
    Turn(Uuid),
    Comment(Uuid),
}

/// Keyed by (run_id, claim_hash), unique pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactcheckRequest {
    pub id: Uuid,
    pub run_id: Uuid,
    pub claim_hash: String,
    pub target: FactcheckTarget,
    pub status: FactcheckStatus,
    pub request_count: u32,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Verified,
    SourceInaccessible,
    SourceMismatch,
    Inconclusive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationCheck {
    pub url: String,
    pub accessible: bool,
    pub content_match: Option<bool>,
    pub explanation: String,
}

/// One per FactcheckRequest that reaches `completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactcheckResult {
    pub id: Uuid,
    pub request_id: Uuid,
    pub verdict: Verdict,
    pub citation_checks: Vec<CitationCheck>,
    pub logic_valid: bool,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Running,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCheck {
    pub name: &'static str,
    pub passed: bool,
    pub reason: String,
}

/// Per external-participant attempt at the Sandbox Validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub id: Uuid,
    pub participant_id: Uuid,
    pub status: SandboxStatus,
    pub checks: Vec<NamedCheck>,
}

/// `sha256(claim ∥ argument)[:64]`, or `sha256(content)[:64]` for comments
/// (Glossary "Claim hash").
#[must_use]
pub fn claim_hash(parts: &[&str]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    hex_encode(&digest)[..64].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Accepted only if it parses as a UUID; a plausibly-UUID-shaped string
/// that fails to parse is dropped silently.
#[must_use]
pub fn sanitize_rebuttal_target(raw: Option<&str>) -> Option<Uuid> {
    let raw = raw?;
    if !(32..=36).contains(&raw.len()) {
        return None;
    }
    Uuid::parse_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_hash_is_64_hex_chars() {
        let hash = claim_hash(&["claim text", "argument text"]);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_claim_hash_deterministic() {
        let a = claim_hash(&["x", "y"]);
        let b = claim_hash(&["x", "y"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_claim_hash_distinguishes_inputs() {
        let a = claim_hash(&["x", "y"]);
        let b = claim_hash(&["x", "z"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_sanitize_rebuttal_target_valid_uuid() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(sanitize_rebuttal_target(Some(&id)), Uuid::parse_str(&id).ok());
    }

    #[test]
    fn test_sanitize_rebuttal_target_rejects_garbage() {
        assert_eq!(sanitize_rebuttal_target(Some("not-a-uuid")), None);
        assert_eq!(sanitize_rebuttal_target(Some("short")), None);
        assert_eq!(sanitize_rebuttal_target(None), None);
    }

    #[test]
    fn test_external_participant_may_enter_active_run() {
        let mut participant = Participant {
            id: Uuid::new_v4(),
            kind: ParticipantKind::External,
            status: ParticipantStatus::Registered,
            endpoint_url: Some("https://example.invalid".to_string()),
            model_identifier: None,
        };
        assert!(!participant.may_enter_active_run());
        participant.status = ParticipantStatus::Active;
        assert!(participant.may_enter_active_run());
    }
}
