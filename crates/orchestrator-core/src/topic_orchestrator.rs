//! Topic Orchestrator: drives a free-form discussion from `open` to
//! `closed`.
//!
//! Grounded on the original `comment_orchestrator.py` for the exact cycle
//! semantics (shuffle, per-agent quota, opt-out skips, closure conditions).

use std::sync::Arc;
use std::time::Duration;

use agon_gateway_core::config::Config;
use agon_gateway_core::content_filter::ContentFilter;
use agon_gateway_core::gateway::{CommentOutcome, CommentRequest, ExistingComment, Gateway};
use agon_gateway_core::metrics;
use anyhow::Result;
use chrono::Utc;
use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::backends::Store;
use crate::domain::{
    claim_hash, Comment, CommentReference, FactcheckRequest, FactcheckStatus, FactcheckTarget,
    Participation, ReferenceKind, TopicRun, TopicStatus,
};
use crate::event_bus::{LiveEvent, LiveEventBus};
use crate::factcheck_worker::FactcheckWorker;

/// Bounds each `generate_comment` call.
const COMMENT_TIMEOUT_SECS: u64 = 120;

/// Drives one topic discussion to `closed`. One instance is spawned per
/// active topic run.
pub struct TopicOrchestrator {
    store: Arc<dyn Store>,
    bus: Arc<LiveEventBus>,
    factcheck: Arc<FactcheckWorker>,
    content_filter: ContentFilter,
    config: Config,
    gateways: std::collections::HashMap<Uuid, Arc<Gateway>>,
}

impl TopicOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<LiveEventBus>,
        factcheck: Arc<FactcheckWorker>,
        config: Config,
        gateways: std::collections::HashMap<Uuid, Arc<Gateway>>,
    ) -> Self {
        Self {
            store,
            bus,
            factcheck,
            content_filter: ContentFilter::new(),
            config,
            gateways,
        }
    }

    /// Runs `topic_id` until it is closed. Contract: starts from
    /// `open`, exits by writing `closed`.
    pub async fn run(&self, topic_id: Uuid) -> Result<()> {
        loop {
            let Some(mut topic) = self.store.get_topic(topic_id).await? else {
                anyhow::bail!("topic {topic_id} not found");
            };

            if topic.status != TopicStatus::Open {
                return Ok(());
            }

            if Utc::now() >= topic.closes_at.unwrap_or_else(Utc::now) {
                self.close(&mut topic, "Time expired").await?;
                return Ok(());
            }

            let mut participations = self.store.list_participations(topic_id).await?;
            if participations
                .iter()
                .all(|p| p.comment_count >= p.max_comments.unwrap_or(topic.max_comments_per_agent))
            {
                self.close(&mut topic, "All agents reached comment limit").await?;
                return Ok(());
            }

            let mut existing_comments = self.store.list_comments(topic_id).await?;

            let mut rng = rand::rng();
            participations.shuffle(&mut rng);

            for participation in &mut participations {
                let quota = participation.max_comments.unwrap_or(topic.max_comments_per_agent);
                if participation.comment_count >= quota {
                    continue;
                }

                self.run_one_agent(&topic, participation, &mut existing_comments).await?;

                tokio::time::sleep(Duration::from_secs(self.config.topic.inter_agent_pause_secs)).await;
            }

            tokio::time::sleep(Duration::from_secs(topic.polling_interval_seconds)).await;
        }
    }

    /// One participant's turn within a cycle. Timeouts
    /// and exceptions are logged and skipped without consuming quota.
    async fn run_one_agent(
        &self,
        topic: &TopicRun,
        participation: &mut Participation,
        existing_comments: &mut Vec<Comment>,
    ) -> Result<()> {
        let Some(gateway) = self.gateways.get(&participation.participant_id).cloned() else {
            tracing::warn!(participant_id = %participation.participant_id, "no gateway configured, skipping");
            return Ok(());
        };

        let own_previous_comments: Vec<String> = existing_comments
            .iter()
            .filter(|c| c.participant_id == participation.participant_id)
            .map(|c| c.content.clone())
            .collect();

        let remaining_quota =
            participation.max_comments.unwrap_or(topic.max_comments_per_agent) - participation.comment_count;

        let request = CommentRequest {
            topic: topic.title.clone(),
            description: topic.description.clone(),
            existing_comments: existing_comments
                .iter()
                .map(|c| ExistingComment {
                    author: c.participant_id.to_string(),
                    content: c.content.clone(),
                })
                .collect(),
            own_previous_comments,
            remaining_quota,
        };

        let bound = Duration::from_secs(COMMENT_TIMEOUT_SECS);
        let outcome = match tokio::time::timeout(bound, gateway.generate_comment(&request)).await {
            Err(_elapsed) => {
                tracing::info!(participant_id = %participation.participant_id, "comment call timed out, skipping without consuming quota");
                if let Some(counter) = metrics::COMMENTS_TOTAL.get() {
                    counter.with_label_values(&["timeout"]).inc();
                }
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::warn!(participant_id = %participation.participant_id, error = %e, "comment call failed, skipping without consuming quota");
                if let Some(counter) = metrics::COMMENTS_TOTAL.get() {
                    counter.with_label_values(&["error"]).inc();
                }
                return Ok(());
            }
            Ok(Ok(outcome)) => outcome,
        };

        let generated = match outcome {
            CommentOutcome::Skip => {
                if let Some(counter) = metrics::COMMENTS_TOTAL.get() {
                    counter.with_label_values(&["skipped"]).inc();
                }
                tokio::time::sleep(Duration::from_secs(self.config.topic.skip_pause_secs)).await;
                return Ok(());
            }
            CommentOutcome::Posted(c) if c.content.trim().is_empty() => {
                if let Some(counter) = metrics::COMMENTS_TOTAL.get() {
                    counter.with_label_values(&["skipped"]).inc();
                }
                tokio::time::sleep(Duration::from_secs(self.config.topic.skip_pause_secs)).await;
                return Ok(());
            }
            CommentOutcome::Posted(c) => c,
        };

        if let Err(reason) = self.content_filter.check(&generated.content) {
            // No suspension at the topic level (DESIGN.md open question 2).
            tracing::warn!(participant_id = %participation.participant_id, reason, "comment rejected by content filter");
            if let Some(counter) = metrics::COMMENTS_TOTAL.get() {
                counter.with_label_values(&["violation"]).inc();
            }
            tokio::time::sleep(Duration::from_secs(self.config.topic.skip_pause_secs)).await;
            return Ok(());
        }

        let comment = Comment {
            id: Uuid::new_v4(),
            topic_id: topic.id,
            participant_id: participation.participant_id,
            content: generated.content,
            references: sanitize_references(generated.references),
            citations: generated.citations,
            stance: generated.stance,
            token_count: generated.token_count,
            created_at: Utc::now(),
        };
        self.store.create_comment(&comment).await?;
        if let Some(counter) = metrics::COMMENTS_TOTAL.get() {
            counter.with_label_values(&["posted"]).inc();
        }

        participation.comment_count += 1;
        self.store.update_participation(participation).await?;

        existing_comments.push(comment.clone());
        self.bus.publish(topic.id, LiveEvent::NewComment { comment_id: comment.id });

        self.enqueue_auto_factcheck(topic, &comment).await?;

        Ok(())
    }

    async fn enqueue_auto_factcheck(&self, topic: &TopicRun, comment: &Comment) -> Result<()> {
        let already = self.store.count_factchecks_for_run(topic.id).await?;
        if already >= self.config.factcheck.max_per_debate {
            tracing::warn!(topic_id = %topic.id, "per-run fact-check cap reached, skipping auto-dispatch");
            return Ok(());
        }

        let request = FactcheckRequest {
            id: Uuid::new_v4(),
            run_id: topic.id,
            claim_hash: claim_hash(&[&comment.content]),
            target: FactcheckTarget::Comment(comment.id),
            status: FactcheckStatus::Pending,
            request_count: 1,
            session_id: Uuid::new_v4(),
        };
        self.factcheck.enqueue(request).await?;
        Ok(())
    }

    async fn close(&self, topic: &mut TopicRun, reason: &str) -> Result<()> {
        topic.status = TopicStatus::Closed;
        topic.closed_at = Some(Utc::now());
        self.store.update_topic(topic).await?;
        self.bus.publish(
            topic.id,
            LiveEvent::TopicClosed {
                reason: reason.to_string(),
            },
        );
        Ok(())
    }
}

/// Drops a reference whose `comment_id` doesn't parse as a UUID or whose
/// `type` isn't `agree`/`rebut`, mirroring rebuttal-target sanitation (spec
/// §9 "Cycles in data").
fn sanitize_references(raw: Vec<agon_gateway_core::gateway::CommentReference>) -> Vec<CommentReference> {
    raw.into_iter()
        .filter_map(|r| {
            let comment_id = Uuid::parse_str(&r.comment_id).ok()?;
            let kind = match r.kind.as_str() {
                "agree" => ReferenceKind::Agree,
                "rebut" => ReferenceKind::Rebut,
                _ => return None,
            };
            Some(CommentReference {
                comment_id,
                kind,
                quote: r.quote,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use agon_gateway_core::gateway::BuiltinGateway;

    fn test_topic(id: Uuid) -> TopicRun {
        TopicRun {
            id,
            title: "Should tabs or spaces win?".to_string(),
            description: "An open debate about whitespace.".to_string(),
            status: TopicStatus::Open,
            duration_minutes: 60,
            polling_interval_seconds: 30,
            max_comments_per_agent: 3,
            started_at: Some(Utc::now()),
            closes_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            closed_at: None,
        }
    }

    fn harness() -> (Arc<InMemoryStore>, TopicOrchestrator) {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(LiveEventBus::new());
        let config = Config::default();
        let referee = Arc::new(BuiltinGateway::new(config.clone(), "referee").unwrap());
        let (factcheck, _handle) =
            FactcheckWorker::spawn(store.clone() as Arc<dyn Store>, referee, config.clone());

        let orchestrator = TopicOrchestrator::new(
            store.clone() as Arc<dyn Store>,
            bus,
            factcheck,
            config,
            std::collections::HashMap::new(),
        );
        (store, orchestrator)
    }

    #[tokio::test]
    async fn test_closes_immediately_when_expired() {
        let (store, orchestrator) = harness();
        let topic_id = Uuid::new_v4();
        store.insert_topic(test_topic(topic_id));

        orchestrator.run(topic_id).await.unwrap();

        let topic = store.get_topic(topic_id).await.unwrap().unwrap();
        assert_eq!(topic.status, TopicStatus::Closed);
        assert!(topic.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_exits_without_error_when_already_closed() {
        let (store, orchestrator) = harness();
        let topic_id = Uuid::new_v4();
        let mut topic = test_topic(topic_id);
        topic.status = TopicStatus::Closed;
        store.insert_topic(topic);

        orchestrator.run(topic_id).await.unwrap();
    }

    #[test]
    fn test_sanitize_references_drops_invalid() {
        let raw = vec![
            agon_gateway_core::gateway::CommentReference {
                comment_id: Uuid::new_v4().to_string(),
                kind: "agree".to_string(),
                quote: "q".to_string(),
            },
            agon_gateway_core::gateway::CommentReference {
                comment_id: "not-a-uuid".to_string(),
                kind: "agree".to_string(),
                quote: "q".to_string(),
            },
            agon_gateway_core::gateway::CommentReference {
                comment_id: Uuid::new_v4().to_string(),
                kind: "disagree".to_string(),
                quote: "q".to_string(),
            },
        ];
        let sanitized = sanitize_references(raw);
        assert_eq!(sanitized.len(), 1);
        assert_eq!(sanitized[0].kind, ReferenceKind::Agree);
    }
}
