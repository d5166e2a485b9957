//! Sandbox Validator: a one-shot gate that runs a synthetic debate against
//! a candidate external participant before it may enter real debates (spec
//! §4.7).
//!
//! Grounded on the original `sandbox_manager.py` for the fixed 6-turn
//! exchange and the five named checks.

use std::sync::Arc;
use std::time::Duration;

use agon_gateway_core::config::Config;
use agon_gateway_core::gateway::{
    BuiltinGateway, ExternalGateway, Gateway, GatewayError, PreviousTurn, Side, TurnRequest,
};
use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crate::backends::Store;
use crate::domain::{
    DebateFormat, DebateMode, DebateRun, DebateStatus, NamedCheck, ParticipantStatus,
    SandboxResult, SandboxStatus, Turn, TurnStatus,
};

const CHECK_CONNECTIVITY: &str = "connectivity";
const CHECK_JSON_FORMAT: &str = "json_format";
const CHECK_TIMEOUT: &str = "timeout";
const CHECK_TOKEN_LIMIT: &str = "token_limit";
const CHECK_CITATION: &str = "citation";
const CHECK_STANCE_CONSISTENCY: &str = "stance_consistency";

/// One-shot task per external participant (spec §3 "SandboxResult").
pub struct SandboxValidator {
    store: Arc<dyn Store>,
    config: Config,
}

impl SandboxValidator {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        Self { store, config }
    }

    /// Runs the fixed synthetic debate against `participant_id` and records
    /// the derived checks. All checks passing activates the participant
    /// (spec §4.7 "All checks pass").
    pub async fn validate(&self, participant_id: Uuid) -> Result<SandboxResult> {
        let mut participant = self
            .store
            .get_participant(participant_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("participant {participant_id} not found"))?;

        let endpoint = participant
            .endpoint_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("sandbox validation requires an external participant"))?;

        let mut result = SandboxResult {
            id: Uuid::new_v4(),
            participant_id,
            status: SandboxStatus::Running,
            checks: Vec::new(),
        };
        self.store.create_sandbox_result(&result).await?;

        let timeout_secs = self.config.debate.external_turn_timeout_secs;
        let external = ExternalGateway::new(endpoint, Duration::from_secs(timeout_secs));

        let connectivity_ok = self.check_connectivity(&external, &mut result).await;

        // Connectivity failure short-circuits further checks (spec §4.7
        // table, "Connectivity failure short-circuits further checks").
        if !connectivity_ok {
            for name in [
                CHECK_JSON_FORMAT,
                CHECK_TIMEOUT,
                CHECK_TOKEN_LIMIT,
                CHECK_CITATION,
                CHECK_STANCE_CONSISTENCY,
            ] {
                result.checks.push(NamedCheck {
                    name,
                    passed: false,
                    reason: "skipped: connectivity check failed".to_string(),
                });
            }
            return self.finish(result, &mut participant, false).await;
        }

        let debate_id = Uuid::new_v4();
        let debate = DebateRun {
            id: debate_id,
            topic: "Sandbox validation debate".to_string(),
            format: DebateFormat::OneVOne,
            mode: DebateMode::Async,
            max_turns: self.config.debate.sandbox_turns,
            current_turn: 0,
            turn_timeout_seconds: timeout_secs,
            turn_cooldown_seconds: 0,
            status: DebateStatus::InProgress,
            started_at: Some(Utc::now()),
            completed_at: None,
            is_sandbox: true,
        };
        self.store.update_debate(&debate).await?;

        let canonical = Gateway::Builtin(
            BuiltinGateway::new(self.config.clone(), "Sandbox Referee")
                .map_err(|e| anyhow::anyhow!("failed to build canonical sandbox participant: {e}"))?,
        );
        let candidate = Gateway::External(external);

        let mut previous_turns: Vec<PreviousTurn> = Vec::new();
        let mut any_timeout = false;
        let mut any_schema_violation = false;
        let mut any_token_overflow = false;
        let mut any_missing_citation = false;
        let mut any_stance_mismatch = false;

        for turn_number in 1..=debate.max_turns {
            let side = if turn_number % 2 == 1 { Side::Pro } else { Side::Con };
            let request = TurnRequest {
                topic: debate.topic.clone(),
                side,
                team_id: None,
                turn_number,
                previous_turns: previous_turns.clone(),
            };

            let turn = if side == Side::Pro {
                self.run_canonical_turn(&canonical, &request, debate_id, turn_number).await
            } else {
                self.run_candidate_turn(
                    &candidate,
                    &request,
                    debate_id,
                    turn_number,
                    &mut any_timeout,
                    &mut any_schema_violation,
                    &mut any_token_overflow,
                    &mut any_missing_citation,
                    &mut any_stance_mismatch,
                )
                .await
            };

            self.store.create_turn(&turn).await?;
            if turn.status == TurnStatus::Validated {
                previous_turns.push(PreviousTurn {
                    turn_number: turn.turn_number,
                    side,
                    claim: turn.claim.clone(),
                    argument: turn.argument.clone(),
                });
            }
        }

        result.checks.push(NamedCheck {
            name: CHECK_JSON_FORMAT,
            passed: !any_schema_violation,
            reason: if any_schema_violation {
                "candidate returned malformed or schema-incomplete JSON on at least one turn".to_string()
            } else {
                "every candidate turn parsed as schema-complete JSON".to_string()
            },
        });
        result.checks.push(NamedCheck {
            name: CHECK_TIMEOUT,
            passed: !any_timeout,
            reason: if any_timeout {
                "candidate timed out on at least one turn".to_string()
            } else {
                "no candidate turn timed out".to_string()
            },
        });
        result.checks.push(NamedCheck {
            name: CHECK_TOKEN_LIMIT,
            passed: !any_token_overflow,
            reason: if any_token_overflow {
                "candidate exceeded the 500-token limit on at least one turn".to_string()
            } else {
                "every candidate turn stayed within the token limit".to_string()
            },
        });
        result.checks.push(NamedCheck {
            name: CHECK_CITATION,
            passed: !any_missing_citation,
            reason: if any_missing_citation {
                "candidate produced a turn with zero citations".to_string()
            } else {
                "every candidate turn had at least one citation".to_string()
            },
        });
        result.checks.push(NamedCheck {
            name: CHECK_STANCE_CONSISTENCY,
            passed: !any_stance_mismatch,
            reason: if any_stance_mismatch {
                "candidate's stance drifted from \"con\" on at least one turn".to_string()
            } else {
                "every candidate turn's stance was \"con\"".to_string()
            },
        });

        let all_passed = result.checks.iter().all(|c| c.passed);
        self.finish(result, &mut participant, all_passed).await
    }

    async fn check_connectivity(&self, external: &ExternalGateway, result: &mut SandboxResult) -> bool {
        let bound = Duration::from_secs(self.config.debate.health_check_timeout_secs);
        let outcome = tokio::time::timeout(bound, external.health_check(bound)).await;

        let (passed, reason) = match outcome {
            Ok(Ok(())) => (
                true,
                format!("GET /health returned 2xx within {}s", bound.as_secs()),
            ),
            Ok(Err(e)) => (false, format!("GET /health failed: {e}")),
            Err(_elapsed) => (
                false,
                format!("GET /health did not respond within {}s", bound.as_secs()),
            ),
        };

        result.checks.push(NamedCheck {
            name: CHECK_CONNECTIVITY,
            passed,
            reason,
        });
        passed
    }

    async fn run_canonical_turn(
        &self,
        canonical: &Gateway,
        request: &TurnRequest,
        debate_id: Uuid,
        turn_number: u32,
    ) -> Turn {
        let bound = Duration::from_secs(self.config.llm.request_timeout_secs);
        match tokio::time::timeout(bound, canonical.generate_turn(request)).await {
            Ok(Ok(generated)) => Turn {
                id: Uuid::new_v4(),
                debate_id,
                turn_number,
                status: TurnStatus::Validated,
                stance: generated.stance,
                claim: generated.claim,
                argument: generated.argument,
                citations: generated.citations,
                rebuttal_target: None,
                token_count: generated.token_count,
                submitted_at: Some(Utc::now()),
                validated_at: Some(Utc::now()),
            },
            _ => Turn {
                id: Uuid::new_v4(),
                debate_id,
                turn_number,
                status: TurnStatus::Validated,
                stance: Side::Pro.as_str().to_string(),
                claim: "Canonical sandbox participant's position.".to_string(),
                argument: "The candidate should be able to respond to a straightforward opening \
                           argument."
                    .to_string(),
                citations: vec![],
                rebuttal_target: None,
                token_count: 12,
                submitted_at: Some(Utc::now()),
                validated_at: Some(Utc::now()),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_candidate_turn(
        &self,
        candidate: &Gateway,
        request: &TurnRequest,
        debate_id: Uuid,
        turn_number: u32,
        any_timeout: &mut bool,
        any_schema_violation: &mut bool,
        any_token_overflow: &mut bool,
        any_missing_citation: &mut bool,
        any_stance_mismatch: &mut bool,
    ) -> Turn {
        let bound = Duration::from_secs(self.config.debate.external_turn_timeout_secs);

        match tokio::time::timeout(bound, candidate.generate_turn(request)).await {
            Err(_elapsed) => {
                *any_timeout = true;
                Turn {
                    id: Uuid::new_v4(),
                    debate_id,
                    turn_number,
                    status: TurnStatus::Timeout,
                    stance: String::new(),
                    claim: "[Agent timed out for this turn]".to_string(),
                    argument: String::new(),
                    citations: vec![],
                    rebuttal_target: None,
                    token_count: 0,
                    submitted_at: Some(Utc::now()),
                    validated_at: Some(Utc::now()),
                }
            }
            Ok(Err(GatewayError::SchemaViolation(_) | GatewayError::ResponseParseError(_))) => {
                *any_schema_violation = true;
                Turn {
                    id: Uuid::new_v4(),
                    debate_id,
                    turn_number,
                    status: TurnStatus::FormatError,
                    stance: String::new(),
                    claim: "[candidate response failed schema validation]".to_string(),
                    argument: String::new(),
                    citations: vec![],
                    rebuttal_target: None,
                    token_count: 0,
                    submitted_at: Some(Utc::now()),
                    validated_at: Some(Utc::now()),
                }
            }
            Ok(Err(e)) => {
                *any_schema_violation = true;
                Turn {
                    id: Uuid::new_v4(),
                    debate_id,
                    turn_number,
                    status: TurnStatus::FormatError,
                    stance: String::new(),
                    claim: format!("[candidate call failed: {e}]"),
                    argument: String::new(),
                    citations: vec![],
                    rebuttal_target: None,
                    token_count: 0,
                    submitted_at: Some(Utc::now()),
                    validated_at: Some(Utc::now()),
                }
            }
            Ok(Ok(generated)) => {
                if generated.token_count > self.config.debate.default_token_limit {
                    *any_token_overflow = true;
                }
                if generated.citations.is_empty() {
                    *any_missing_citation = true;
                }
                if !generated.stance.eq_ignore_ascii_case("con") {
                    *any_stance_mismatch = true;
                }
                Turn {
                    id: Uuid::new_v4(),
                    debate_id,
                    turn_number,
                    status: TurnStatus::Validated,
                    stance: generated.stance,
                    claim: generated.claim,
                    argument: generated.argument,
                    citations: generated.citations,
                    rebuttal_target: None,
                    token_count: generated.token_count,
                    submitted_at: Some(Utc::now()),
                    validated_at: Some(Utc::now()),
                }
            }
        }
    }

    async fn finish(
        &self,
        mut result: SandboxResult,
        participant: &mut crate::domain::Participant,
        passed: bool,
    ) -> Result<SandboxResult> {
        result.status = if passed { SandboxStatus::Passed } else { SandboxStatus::Failed };
        self.store.update_sandbox_result(&result).await?;

        participant.status = if passed {
            ParticipantStatus::Active
        } else {
            ParticipantStatus::Failed
        };
        self.store.update_participant(participant).await?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::domain::{Participant, ParticipantKind};

    fn test_config() -> Config {
        Config::default()
    }

    #[tokio::test]
    async fn test_missing_endpoint_url_errors() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let participant = Participant {
            id: Uuid::new_v4(),
            kind: ParticipantKind::External,
            status: ParticipantStatus::Registered,
            endpoint_url: None,
            model_identifier: None,
        };
        let participant_id = participant.id;
        store.update_participant(&participant).await.unwrap();

        let validator = SandboxValidator::new(store, test_config());
        let result = validator.validate(participant_id).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connectivity_failure_short_circuits_remaining_checks() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let participant = Participant {
            id: Uuid::new_v4(),
            kind: ParticipantKind::External,
            status: ParticipantStatus::Registered,
            endpoint_url: Some("http://127.0.0.1:1".to_string()),
            model_identifier: None,
        };
        let participant_id = participant.id;
        store.update_participant(&participant).await.unwrap();

        let validator = SandboxValidator::new(store.clone(), test_config());
        let result = validator.validate(participant_id).await.unwrap();

        assert_eq!(result.status, SandboxStatus::Failed);
        assert_eq!(result.checks.len(), 6);
        assert!(!result.checks[0].passed);
        assert!(result.checks[1..].iter().all(|c| !c.passed));

        let updated = store.get_participant(participant_id).await.unwrap().unwrap();
        assert_eq!(updated.status, ParticipantStatus::Failed);
    }
}
