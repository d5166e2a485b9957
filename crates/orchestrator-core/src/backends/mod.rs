//! Persistence backends for the entities the orchestration core mutates.
//!
//! Backends implement the `Store` trait. The core never holds a
//! transaction across a Gateway call — every method here is a single,
//! self-contained unit of work.

pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{
    Comment, DebateRun, FactcheckRequest, FactcheckResult, FactcheckStatus, Participant,
    Participation, SandboxResult, Turn, TopicRun,
};

/// Abstract persistence collaborator.
///
/// Implementations provide transactional create/update/read over the
/// entities in the data model, a row-level lock on a debate during start
/// (`try_start_debate`), and the dedup constraints fact-check enqueueing
/// relies on: uniqueness over `(run_id, claim_hash)` and over `(request_id)`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_participant(&self, id: Uuid) -> anyhow::Result<Option<Participant>>;
    async fn update_participant(&self, participant: &Participant) -> anyhow::Result<()>;

    async fn get_debate(&self, id: Uuid) -> anyhow::Result<Option<DebateRun>>;
    async fn update_debate(&self, debate: &DebateRun) -> anyhow::Result<()>;

    /// Transitions a debate from `scheduled` to `in_progress` exactly once,
    /// using a row-level lock so concurrent start requests cannot both win.
    async fn try_start_debate(&self, id: Uuid) -> anyhow::Result<bool>;

    async fn get_topic(&self, id: Uuid) -> anyhow::Result<Option<TopicRun>>;
    async fn update_topic(&self, topic: &TopicRun) -> anyhow::Result<()>;

    async fn list_participations(&self, run_id: Uuid) -> anyhow::Result<Vec<Participation>>;
    async fn update_participation(&self, participation: &Participation) -> anyhow::Result<()>;

    /// Count other in-progress debates (excluding `exclude_debate_id`) in
    /// which `participant_id` is a member, for the per-external concurrency
    /// check.
    async fn count_other_in_progress_debates(
        &self,
        participant_id: Uuid,
        exclude_debate_id: Uuid,
        include_sandbox: bool,
    ) -> anyhow::Result<usize>;

    async fn create_turn(&self, turn: &Turn) -> anyhow::Result<()>;
    async fn update_turn(&self, turn: &Turn) -> anyhow::Result<()>;
    async fn get_turn(&self, id: Uuid) -> anyhow::Result<Option<Turn>>;
    async fn list_turns(&self, debate_id: Uuid) -> anyhow::Result<Vec<Turn>>;

    async fn create_comment(&self, comment: &Comment) -> anyhow::Result<()>;
    async fn get_comment(&self, id: Uuid) -> anyhow::Result<Option<Comment>>;
    async fn list_comments(&self, topic_id: Uuid) -> anyhow::Result<Vec<Comment>>;

    /// Creates a new FactcheckRequest, or — if one already exists for
    /// `(run_id, claim_hash)` — increments its `request_count` and returns
    /// the existing row.
    async fn enqueue_factcheck(
        &self,
        request: FactcheckRequest,
    ) -> anyhow::Result<FactcheckRequest>;

    async fn update_factcheck_request(&self, request: &FactcheckRequest) -> anyhow::Result<()>;
    async fn get_factcheck_request(&self, id: Uuid) -> anyhow::Result<Option<FactcheckRequest>>;

    /// Number of FactcheckRequests already recorded for `run_id`, for the
    /// per-debate fact-check cap (`config.factcheck.max_per_debate`).
    async fn count_factchecks_for_run(&self, run_id: Uuid) -> anyhow::Result<usize>;

    /// All requests in a recoverable status, for crash-safe resumption.
    async fn list_recoverable_factchecks(&self) -> anyhow::Result<Vec<FactcheckRequest>>;

    async fn create_factcheck_result(&self, result: &FactcheckResult) -> anyhow::Result<()>;

    async fn create_sandbox_result(&self, result: &SandboxResult) -> anyhow::Result<()>;
    async fn update_sandbox_result(&self, result: &SandboxResult) -> anyhow::Result<()>;
}

/// In-memory `Store`, for tests and single-process demos.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    participants: parking_lot::RwLock<std::collections::HashMap<Uuid, Participant>>,
    debates: parking_lot::RwLock<std::collections::HashMap<Uuid, DebateRun>>,
    topics: parking_lot::RwLock<std::collections::HashMap<Uuid, TopicRun>>,
    participations: parking_lot::RwLock<std::collections::HashMap<Uuid, Vec<Participation>>>,
    turns: parking_lot::RwLock<std::collections::HashMap<Uuid, Vec<Turn>>>,
    comments: parking_lot::RwLock<std::collections::HashMap<Uuid, Vec<Comment>>>,
    factcheck_requests: parking_lot::RwLock<std::collections::HashMap<Uuid, FactcheckRequest>>,
    factcheck_results: parking_lot::RwLock<Vec<FactcheckResult>>,
    sandbox_results: parking_lot::RwLock<std::collections::HashMap<Uuid, SandboxResult>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_participant(&self, participant: Participant) {
        self.participants.write().insert(participant.id, participant);
    }

    pub fn insert_debate(&self, debate: DebateRun) {
        self.debates.write().insert(debate.id, debate);
    }

    pub fn insert_topic(&self, topic: TopicRun) {
        self.topics.write().insert(topic.id, topic);
    }

    pub fn insert_participation(&self, run_id: Uuid, participation: Participation) {
        self.participations.write().entry(run_id).or_default().push(participation);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_participant(&self, id: Uuid) -> anyhow::Result<Option<Participant>> {
        Ok(self.participants.read().get(&id).cloned())
    }

    async fn update_participant(&self, participant: &Participant) -> anyhow::Result<()> {
        self.participants.write().insert(participant.id, participant.clone());
        Ok(())
    }

    async fn get_debate(&self, id: Uuid) -> anyhow::Result<Option<DebateRun>> {
        Ok(self.debates.read().get(&id).cloned())
    }

    async fn update_debate(&self, debate: &DebateRun) -> anyhow::Result<()> {
        self.debates.write().insert(debate.id, debate.clone());
        Ok(())
    }

    async fn try_start_debate(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut debates = self.debates.write();
        match debates.get_mut(&id) {
            Some(debate) if debate.status == crate::domain::DebateStatus::Scheduled => {
                debate.status = crate::domain::DebateStatus::InProgress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_topic(&self, id: Uuid) -> anyhow::Result<Option<TopicRun>> {
        Ok(self.topics.read().get(&id).cloned())
    }

    async fn update_topic(&self, topic: &TopicRun) -> anyhow::Result<()> {
        self.topics.write().insert(topic.id, topic.clone());
        Ok(())
    }

    async fn list_participations(&self, run_id: Uuid) -> anyhow::Result<Vec<Participation>> {
        Ok(self.participations.read().get(&run_id).cloned().unwrap_or_default())
    }

    async fn update_participation(&self, participation: &Participation) -> anyhow::Result<()> {
        let mut participations = self.participations.write();
        let list = participations.entry(participation.run_id).or_default();
        if let Some(existing) = list.iter_mut().find(|p| p.id == participation.id) {
            *existing = participation.clone();
        } else {
            list.push(participation.clone());
        }
        Ok(())
    }

    async fn count_other_in_progress_debates(
        &self,
        participant_id: Uuid,
        exclude_debate_id: Uuid,
        include_sandbox: bool,
    ) -> anyhow::Result<usize> {
        let debates = self.debates.read();
        let participations = self.participations.read();

        let mut count = 0;
        for debate in debates.values() {
            if debate.id == exclude_debate_id {
                continue;
            }
            if debate.status != crate::domain::DebateStatus::InProgress {
                continue;
            }
            if debate.is_sandbox && !include_sandbox {
                continue;
            }
            let is_member = participations
                .get(&debate.id)
                .is_some_and(|ps| ps.iter().any(|p| p.participant_id == participant_id));
            if is_member {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn create_turn(&self, turn: &Turn) -> anyhow::Result<()> {
        self.turns.write().entry(turn.debate_id).or_default().push(turn.clone());
        Ok(())
    }

    async fn update_turn(&self, turn: &Turn) -> anyhow::Result<()> {
        let mut turns = self.turns.write();
        let list = turns.entry(turn.debate_id).or_default();
        if let Some(existing) = list.iter_mut().find(|t| t.id == turn.id) {
            *existing = turn.clone();
        }
        Ok(())
    }

    async fn get_turn(&self, id: Uuid) -> anyhow::Result<Option<Turn>> {
        Ok(self
            .turns
            .read()
            .values()
            .flatten()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn list_turns(&self, debate_id: Uuid) -> anyhow::Result<Vec<Turn>> {
        Ok(self.turns.read().get(&debate_id).cloned().unwrap_or_default())
    }

    async fn create_comment(&self, comment: &Comment) -> anyhow::Result<()> {
        self.comments.write().entry(comment.topic_id).or_default().push(comment.clone());
        Ok(())
    }

    async fn get_comment(&self, id: Uuid) -> anyhow::Result<Option<Comment>> {
        Ok(self
            .comments
            .read()
            .values()
            .flatten()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn list_comments(&self, topic_id: Uuid) -> anyhow::Result<Vec<Comment>> {
        Ok(self.comments.read().get(&topic_id).cloned().unwrap_or_default())
    }

    async fn enqueue_factcheck(
        &self,
        request: FactcheckRequest,
    ) -> anyhow::Result<FactcheckRequest> {
        let mut requests = self.factcheck_requests.write();
        let existing = requests.values_mut().find(|r| {
            r.run_id == request.run_id && r.claim_hash == request.claim_hash
        });

        if let Some(existing) = existing {
            existing.request_count += 1;
            return Ok(existing.clone());
        }

        requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn update_factcheck_request(&self, request: &FactcheckRequest) -> anyhow::Result<()> {
        self.factcheck_requests.write().insert(request.id, request.clone());
        Ok(())
    }

    async fn get_factcheck_request(&self, id: Uuid) -> anyhow::Result<Option<FactcheckRequest>> {
        Ok(self.factcheck_requests.read().get(&id).cloned())
    }

    async fn count_factchecks_for_run(&self, run_id: Uuid) -> anyhow::Result<usize> {
        Ok(self
            .factcheck_requests
            .read()
            .values()
            .filter(|r| r.run_id == run_id)
            .count())
    }

    async fn list_recoverable_factchecks(&self) -> anyhow::Result<Vec<FactcheckRequest>> {
        Ok(self
            .factcheck_requests
            .read()
            .values()
            .filter(|r| matches!(r.status, FactcheckStatus::Pending | FactcheckStatus::Processing))
            .cloned()
            .collect())
    }

    async fn create_factcheck_result(&self, result: &FactcheckResult) -> anyhow::Result<()> {
        let mut results = self.factcheck_results.write();
        if results.iter().any(|r| r.request_id == result.request_id) {
            anyhow::bail!("duplicate FactcheckResult for request {}", result.request_id);
        }
        results.push(result.clone());
        Ok(())
    }

    async fn create_sandbox_result(&self, result: &SandboxResult) -> anyhow::Result<()> {
        self.sandbox_results.write().insert(result.id, result.clone());
        Ok(())
    }

    async fn update_sandbox_result(&self, result: &SandboxResult) -> anyhow::Result<()> {
        self.sandbox_results.write().insert(result.id, result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DebateFormat, DebateMode, DebateStatus, FactcheckTarget};

    fn sample_debate(id: Uuid) -> DebateRun {
        DebateRun {
            id,
            topic: "t".to_string(),
            format: DebateFormat::OneVOne,
            mode: DebateMode::Async,
            max_turns: 4,
            current_turn: 0,
            turn_timeout_seconds: 30,
            turn_cooldown_seconds: 0,
            status: DebateStatus::Scheduled,
            started_at: None,
            completed_at: None,
            is_sandbox: false,
        }
    }

    #[tokio::test]
    async fn test_try_start_debate_only_succeeds_once() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.insert_debate(sample_debate(id));

        assert!(store.try_start_debate(id).await.unwrap());
        assert!(!store.try_start_debate(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_factcheck_dedups_and_increments() {
        let store = InMemoryStore::new();
        let run_id = Uuid::new_v4();
        let request = FactcheckRequest {
            id: Uuid::new_v4(),
            run_id,
            claim_hash: "abc".to_string(),
            target: FactcheckTarget::Turn(Uuid::new_v4()),
            status: FactcheckStatus::Pending,
            request_count: 1,
            session_id: Uuid::new_v4(),
        };

        let first = store.enqueue_factcheck(request.clone()).await.unwrap();
        let mut duplicate = request.clone();
        duplicate.id = Uuid::new_v4();
        let second = store.enqueue_factcheck(duplicate).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.request_count, 2);
    }

    #[tokio::test]
    async fn test_create_factcheck_result_rejects_duplicate() {
        let store = InMemoryStore::new();
        let request_id = Uuid::new_v4();
        let result = FactcheckResult {
            id: Uuid::new_v4(),
            request_id,
            verdict: crate::domain::Verdict::Verified,
            citation_checks: vec![],
            logic_valid: true,
            details: String::new(),
        };

        store.create_factcheck_result(&result).await.unwrap();
        let duplicate_err = store.create_factcheck_result(&result).await;
        assert!(duplicate_err.is_err());
    }

    #[tokio::test]
    async fn test_count_other_in_progress_debates_excludes_self_and_sandbox() {
        let store = InMemoryStore::new();
        let participant_id = Uuid::new_v4();

        let current = Uuid::new_v4();
        let mut current_debate = sample_debate(current);
        current_debate.status = DebateStatus::InProgress;
        store.insert_debate(current_debate);
        store.insert_participation(
            current,
            Participation {
                id: Uuid::new_v4(),
                run_id: current,
                participant_id,
                side: None,
                team_id: None,
                turn_order: Some(0),
                max_comments: None,
                comment_count: 0,
            },
        );

        let other = Uuid::new_v4();
        let mut other_debate = sample_debate(other);
        other_debate.status = DebateStatus::InProgress;
        store.insert_debate(other_debate);
        store.insert_participation(
            other,
            Participation {
                id: Uuid::new_v4(),
                run_id: other,
                participant_id,
                side: None,
                team_id: None,
                turn_order: Some(0),
                max_comments: None,
                comment_count: 0,
            },
        );

        let sandbox = Uuid::new_v4();
        let mut sandbox_debate = sample_debate(sandbox);
        sandbox_debate.status = DebateStatus::InProgress;
        sandbox_debate.is_sandbox = true;
        store.insert_debate(sandbox_debate);
        store.insert_participation(
            sandbox,
            Participation {
                id: Uuid::new_v4(),
                run_id: sandbox,
                participant_id,
                side: None,
                team_id: None,
                turn_order: Some(0),
                max_comments: None,
                comment_count: 0,
            },
        );

        let count = store
            .count_other_in_progress_debates(participant_id, current, false)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let count_with_sandbox = store
            .count_other_in_progress_debates(participant_id, current, true)
            .await
            .unwrap();
        assert_eq!(count_with_sandbox, 2);
    }
}
