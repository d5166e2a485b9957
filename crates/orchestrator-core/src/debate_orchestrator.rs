//! Debate Orchestrator: drives one debate from `in_progress` to a terminal
//! status.
//!
//! Grounded on `durable-shannon/src/worker/mod.rs`'s task-spawn-plus-state
//! tracking shape for the slot loop, and on the original `debate_manager.py`
//! for the exact per-turn semantics (dispatch order, timeout/violation
//! handling, auto-fact-check dispatch).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agon_gateway_core::config::Config;
use agon_gateway_core::content_filter::ContentFilter;
use agon_gateway_core::gateway::{Gateway, GeneratedTurn, PreviousTurn, Side, TurnRequest};
use agon_gateway_core::metrics::SlotTimer;
use agon_gateway_core::tokenizer;
use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crate::backends::Store;
use crate::domain::{
    claim_hash, sanitize_rebuttal_target, DebateMode, DebateRun, DebateStatus, FactcheckRequest,
    FactcheckStatus, FactcheckTarget, Participant, ParticipantKind, ParticipantStatus,
    Participation, Turn, TurnStatus,
};
use crate::event_bus::{LiveEvent, LiveEventBus};
use crate::factcheck_worker::FactcheckWorker;

/// Claim text substituted when a participant's turn call exceeds
/// `turn_timeout_seconds`.
const TIMEOUT_MARKER_CLAIM: &str = "[Agent timed out for this turn]";

/// Drives one debate to completion. One instance is spawned per active
/// debate run; the orchestrator owns all subsequent transitions on that
/// debate's row.
pub struct DebateOrchestrator {
    store: Arc<dyn Store>,
    bus: Arc<LiveEventBus>,
    factcheck: Arc<FactcheckWorker>,
    content_filter: ContentFilter,
    config: Config,
    gateways: HashMap<Uuid, Arc<Gateway>>,
}

impl DebateOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<LiveEventBus>,
        factcheck: Arc<FactcheckWorker>,
        config: Config,
        gateways: HashMap<Uuid, Arc<Gateway>>,
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

    /// Runs `debate_id` to a terminal status. Contract: the
    /// debate is already `in_progress` with `current_turn=0`; this returns
    /// only on completion, fatal error, or external cancellation, and a
    /// terminal status is always written before returning.
    pub async fn run(&self, debate_id: Uuid) -> Result<()> {
        match self.run_inner(debate_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(%debate_id, error = %e, "debate orchestrator exited with a fatal error");
                if let Ok(Some(mut debate)) = self.store.get_debate(debate_id).await {
                    debate.status = DebateStatus::Failed;
                    debate.completed_at = Some(Utc::now());
                    let _ = self.store.update_debate(&debate).await;
                }
                Err(e)
            }
        }
    }

    async fn run_inner(&self, debate_id: Uuid) -> Result<()> {
        let mut debate = self
            .store
            .get_debate(debate_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("debate {debate_id} not found"))?;

        let mut participations = self.store.list_participations(debate_id).await?;
        participations.sort_by_key(|p| p.turn_order.unwrap_or(u32::MAX));
        if participations.is_empty() {
            anyhow::bail!("debate {debate_id} has no participations to dispatch turns to");
        }

        while debate.current_turn < debate.max_turns {
            let turn_number = debate.current_turn + 1;
            let slot = (turn_number - 1) as usize % participations.len();
            // Interleaved round-robin: pro1, con1, pro2, con2, ...
            let participation = participations[slot].clone();

            self.run_slot(&debate, &participation, turn_number).await?;

            debate.current_turn = turn_number;
            self.store.update_debate(&debate).await?;

            if turn_number < debate.max_turns {
                if debate.mode == DebateMode::Live {
                    self.bus.publish(
                        debate_id,
                        LiveEvent::CooldownStart {
                            seconds: debate.turn_cooldown_seconds,
                            next_turn: turn_number + 1,
                        },
                    );
                }
                // Cooldown sleeps regardless of mode.
                tokio::time::sleep(Duration::from_secs(debate.turn_cooldown_seconds)).await;
            }
        }

        debate.status = DebateStatus::Completed;
        debate.completed_at = Some(Utc::now());
        self.store.update_debate(&debate).await?;
        if debate.mode == DebateMode::Live {
            self.bus.publish(debate_id, LiveEvent::DebateComplete);
        }

        Ok(())
    }

    /// One turn's processing window. Never propagates a Gateway or content-filter failure up to
    /// `run_inner` — every branch still advances `current_turn`.
    async fn run_slot(
        &self,
        debate: &DebateRun,
        participation: &Participation,
        turn_number: u32,
    ) -> Result<()> {
        let timer = SlotTimer::new("debate");
        let debate_id = debate.id;

        let mut turn = Turn {
            id: Uuid::new_v4(),
            debate_id,
            turn_number,
            status: TurnStatus::Pending,
            stance: String::new(),
            claim: String::new(),
            argument: String::new(),
            citations: vec![],
            rebuttal_target: None,
            token_count: 0,
            submitted_at: Some(Utc::now()),
            validated_at: None,
        };
        self.store.create_turn(&turn).await?;

        if debate.mode == DebateMode::Live {
            self.bus.publish(debate_id, LiveEvent::TurnStart { turn_number });
        }

        let Some(participant) = self.store.get_participant(participation.participant_id).await? else {
            self.finish_capacity_error(debate, &mut turn, "participant not found").await?;
            timer.complete("format_error");
            return Ok(());
        };

        // External concurrency ceiling. Sandbox debates are excluded from
        // both sides of the comparison (DESIGN.md open question 1).
        if participant.kind == ParticipantKind::External && !debate.is_sandbox {
            let concurrent = self
                .store
                .count_other_in_progress_debates(participant.id, debate_id, false)
                .await?;
            if concurrent >= self.config.debate.max_concurrent_debates_per_external {
                self.finish_capacity_error(debate, &mut turn, "concurrent debate limit exceeded").await?;
                timer.complete("format_error");
                return Ok(());
            }
        }

        let Some(gateway) = self.gateways.get(&participant.id).cloned() else {
            self.finish_capacity_error(debate, &mut turn, "no gateway configured for participant").await?;
            timer.complete("format_error");
            return Ok(());
        };

        let side = participation.side.unwrap_or(Side::Pro);
        let request = TurnRequest {
            topic: debate.topic.clone(),
            side,
            team_id: participation.team_id.clone(),
            turn_number,
            previous_turns: self.load_previous_turns(debate_id).await?,
        };

        let bound = Duration::from_secs(debate.turn_timeout_seconds);
        match tokio::time::timeout(bound, gateway.generate_turn(&request)).await {
            Err(_elapsed) => {
                turn.status = TurnStatus::Timeout;
                turn.claim = TIMEOUT_MARKER_CLAIM.to_string();
                turn.citations = vec![];
                turn.validated_at = Some(Utc::now());
                self.store.update_turn(&turn).await?;
                self.publish_turn_complete(debate, turn_number);
                timer.complete("timeout");
            }
            Ok(Err(e)) => {
                let message: String = e.to_string().chars().take(400).collect();
                turn.status = TurnStatus::FormatError;
                turn.claim = message;
                turn.validated_at = Some(Utc::now());
                self.store.update_turn(&turn).await?;
                self.publish_turn_complete(debate, turn_number);
                timer.complete("format_error");
            }
            Ok(Ok(generated)) => {
                let status_label = self
                    .handle_generated_turn(debate, &mut turn, generated, &participant)
                    .await?;
                self.publish_turn_complete(debate, turn_number);
                timer.complete(status_label);
            }
        }

        Ok(())
    }

    /// Content-filters and validates a successfully generated turn,
    /// suspending the participant on a policy violation, otherwise
    /// persisting it and enqueuing an auto-fact-check.
    async fn handle_generated_turn(
        &self,
        debate: &DebateRun,
        turn: &mut Turn,
        generated: GeneratedTurn,
        participant: &Participant,
    ) -> Result<&'static str> {
        if let Err(reason) = self.content_filter.check(&generated.argument) {
            turn.status = TurnStatus::FormatError;
            turn.claim = format!("[Content policy violation: {reason}]");
            turn.argument.clear();
            turn.validated_at = Some(Utc::now());
            self.store.update_turn(turn).await?;

            let mut suspended = participant.clone();
            suspended.status = ParticipantStatus::Suspended;
            self.store.update_participant(&suspended).await?;
            tracing::warn!(
                participant_id = %participant.id,
                reason,
                "participant suspended for a content-policy violation"
            );

            return Ok("format_error");
        }

        turn.stance = generated.stance;
        turn.claim = generated.claim;
        turn.argument = generated.argument;
        turn.citations = generated.citations;
        turn.rebuttal_target = sanitize_rebuttal_target(generated.rebuttal_target.as_deref());
        turn.token_count = generated.token_count;

        if turn.token_count > self.config.debate.default_token_limit {
            // Best-effort truncation; tokenizer failure keeps the original
            // argument unmodified.
            if let Some(truncated) =
                tokenizer::truncate_to_tokens(&turn.argument, self.config.debate.default_token_limit)
            {
                turn.argument = truncated;
                turn.token_count = tokenizer::estimate_tokens(&turn.argument);
            }
        }

        turn.status = TurnStatus::Validated;
        turn.validated_at = Some(Utc::now());
        self.store.update_turn(turn).await?;

        self.enqueue_auto_factcheck(debate, turn).await?;

        Ok("validated")
    }

    /// Capacity/missing-collaborator failures: skip with a user-visible
    /// marker, run continues.
    async fn finish_capacity_error(&self, debate: &DebateRun, turn: &mut Turn, reason: &str) -> Result<()> {
        turn.status = TurnStatus::FormatError;
        turn.claim = format!("[{reason}]");
        turn.validated_at = Some(Utc::now());
        self.store.update_turn(turn).await?;
        self.publish_turn_complete(debate, turn.turn_number);
        Ok(())
    }

    fn publish_turn_complete(&self, debate: &DebateRun, turn_number: u32) {
        if debate.mode == DebateMode::Live {
            self.bus.publish(debate.id, LiveEvent::TurnComplete { turn_number });
        }
    }

    /// Validated turns so far, oldest first, projected to what a participant
    /// is shown as prior transcript.
    async fn load_previous_turns(&self, debate_id: Uuid) -> Result<Vec<PreviousTurn>> {
        let mut turns = self.store.list_turns(debate_id).await?;
        turns.sort_by_key(|t| t.turn_number);

        Ok(turns
            .into_iter()
            .filter(|t| t.status == TurnStatus::Validated)
            .map(|t| PreviousTurn {
                turn_number: t.turn_number,
                side: side_from_stance(&t.stance),
                claim: t.claim,
                argument: t.argument,
            })
            .collect())
    }

    /// `sha256(claim ∥ argument)[:64]` dedup key, skipped once the per-debate
    /// fact-check cap is reached (`config.factcheck.max_per_debate`,
    /// default 20).
    async fn enqueue_auto_factcheck(&self, debate: &DebateRun, turn: &Turn) -> Result<()> {
        let already = self.store.count_factchecks_for_run(debate.id).await?;
        if already >= self.config.factcheck.max_per_debate {
            tracing::warn!(debate_id = %debate.id, "per-debate fact-check cap reached, skipping auto-dispatch");
            return Ok(());
        }

        let request = FactcheckRequest {
            id: Uuid::new_v4(),
            run_id: debate.id,
            claim_hash: claim_hash(&[&turn.claim, &turn.argument]),
            target: FactcheckTarget::Turn(turn.id),
            status: FactcheckStatus::Pending,
            request_count: 1,
            session_id: Uuid::new_v4(),
        };
        self.factcheck.enqueue(request).await?;
        Ok(())
    }
}

fn side_from_stance(stance: &str) -> Side {
    if stance.eq_ignore_ascii_case("con") {
        Side::Con
    } else {
        Side::Pro
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::domain::{DebateFormat, ParticipantKind, ParticipantStatus};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.debate.default_turn_cooldown_secs = 0;
        config
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        bus: Arc<LiveEventBus>,
        orchestrator: DebateOrchestrator,
    }

    fn harness_with(
        config: Config,
        gateways: HashMap<Uuid, Arc<Gateway>>,
    ) -> (Harness, Arc<FactcheckWorker>) {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let bus = Arc::new(LiveEventBus::new());
        let referee = Arc::new(
            agon_gateway_core::gateway::BuiltinGateway::new(config.clone(), "referee")
                .expect("client should build"),
        );
        let (factcheck, _handle) =
            FactcheckWorker::spawn(store.clone() as Arc<dyn Store>, referee, config.clone());

        let orchestrator = DebateOrchestrator::new(
            store.clone() as Arc<dyn Store>,
            bus.clone(),
            factcheck.clone(),
            config,
            gateways,
        );

        (
            Harness {
                store,
                bus,
                orchestrator,
            },
            factcheck,
        )
    }

    fn sample_debate(id: Uuid, max_turns: u32, mode: DebateMode) -> DebateRun {
        DebateRun {
            id,
            topic: "Is Rust better than C?".to_string(),
            format: DebateFormat::OneVOne,
            mode,
            max_turns,
            current_turn: 0,
            turn_timeout_seconds: 5,
            turn_cooldown_seconds: 0,
            status: DebateStatus::InProgress,
            started_at: Some(Utc::now()),
            completed_at: None,
            is_sandbox: false,
        }
    }

    fn builtin_participant() -> Participant {
        Participant {
            id: Uuid::new_v4(),
            kind: ParticipantKind::Builtin,
            status: ParticipantStatus::Active,
            endpoint_url: None,
            model_identifier: Some("test-model".to_string()),
        }
    }

    #[tokio::test]
    async fn test_missing_gateway_marks_format_error_and_continues() {
        let debate_id = Uuid::new_v4();
        let config = test_config();
        let (harness, _factcheck) = harness_with(config, HashMap::new());

        let debate = sample_debate(debate_id, 2, DebateMode::Async);
        harness.store.insert_debate(debate);

        let pro = builtin_participant();
        let con = builtin_participant();
        harness.store.insert_participant(pro.clone());
        harness.store.insert_participant(con.clone());
        harness.store.insert_participation(
            debate_id,
            Participation {
                id: Uuid::new_v4(),
                run_id: debate_id,
                participant_id: pro.id,
                side: Some(Side::Pro),
                team_id: None,
                turn_order: Some(0),
                max_comments: None,
                comment_count: 0,
            },
        );
        harness.store.insert_participation(
            debate_id,
            Participation {
                id: Uuid::new_v4(),
                run_id: debate_id,
                participant_id: con.id,
                side: Some(Side::Con),
                team_id: None,
                turn_order: Some(1),
                max_comments: None,
                comment_count: 0,
            },
        );

        harness.orchestrator.run(debate_id).await.unwrap();

        let debate = harness.store.get_debate(debate_id).await.unwrap().unwrap();
        assert_eq!(debate.status, DebateStatus::Completed);
        assert_eq!(debate.current_turn, 2);

        let turns = harness.store.list_turns(debate_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| t.status == TurnStatus::FormatError));
    }

    #[tokio::test]
    async fn test_no_live_events_published_in_async_mode() {
        let debate_id = Uuid::new_v4();
        let (harness, _factcheck) = harness_with(test_config(), HashMap::new());

        let debate = sample_debate(debate_id, 1, DebateMode::Async);
        harness.store.insert_debate(debate);

        let pro = builtin_participant();
        harness.store.insert_participant(pro.clone());
        harness.store.insert_participation(
            debate_id,
            Participation {
                id: Uuid::new_v4(),
                run_id: debate_id,
                participant_id: pro.id,
                side: Some(Side::Pro),
                team_id: None,
                turn_order: Some(0),
                max_comments: None,
                comment_count: 0,
            },
        );

        let (_sub, mut rx) = harness.bus.subscribe(debate_id);
        let subscribe_event = rx.try_recv().expect("subscribe itself publishes viewer_count");
        assert_eq!(subscribe_event.name(), "viewer_count");

        harness.orchestrator.run(debate_id).await.unwrap();

        assert!(rx.try_recv().is_err(), "async mode must not publish turn/debate events");
    }
}
