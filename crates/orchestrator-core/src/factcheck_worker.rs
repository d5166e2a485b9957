//! Fact-check Worker: a durable, single-consumer FIFO queue of fact-check
//! requests (spec §4.5).
//!
//! The in-memory queue is a performance cache, not the system of record —
//! `recover_pending` re-enqueues every request the store still has in
//! `{pending, processing}` at process start (spec §9 "Queue durability").

use std::sync::Arc;
use std::time::Duration;

use agon_gateway_core::config::Config;
use agon_gateway_core::gateway::{BuiltinGateway, Citation};
use agon_gateway_core::metrics;
use anyhow::Result;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backends::Store;
use crate::domain::{
    CitationCheck, FactcheckRequest, FactcheckResult, FactcheckStatus, FactcheckTarget, Verdict,
};

/// Single in-process worker draining a FIFO queue of request ids.
pub struct FactcheckWorker {
    store: Arc<dyn Store>,
    referee: Arc<BuiltinGateway>,
    http_client: reqwest::Client,
    config: Config,
    sender: mpsc::UnboundedSender<Uuid>,
}

impl FactcheckWorker {
    /// Builds the worker and spawns its processing loop. Callers should
    /// follow with `recover_pending` before serving new traffic.
    pub fn spawn(
        store: Arc<dyn Store>,
        referee: Arc<BuiltinGateway>,
        config: Config,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.factcheck.url_fetch_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(2))
            .build()
            .unwrap_or_default();

        let worker = Arc::new(Self {
            store,
            referee,
            http_client,
            config,
            sender,
        });

        let loop_worker = Arc::clone(&worker);
        let handle = tokio::spawn(async move {
            loop_worker.run(receiver).await;
        });

        (worker, handle)
    }

    /// Re-enqueues every request still in `{pending, processing}` (spec
    /// §4.5 "Crash-safe resumption"). Processing is therefore at-least-once.
    pub async fn recover_pending(&self) -> Result<usize> {
        let recoverable = self.store.list_recoverable_factchecks().await?;
        let count = recoverable.len();
        for request in recoverable {
            let _ = self.sender.send(request.id);
        }
        Ok(count)
    }

    /// Inserts (or dedups) a FactcheckRequest and pushes it onto the FIFO
    /// queue only if it was genuinely new — a dedup hit just increments the
    /// existing row's counter without re-enqueuing (spec §4.5 "Enqueue").
    pub async fn enqueue(&self, request: FactcheckRequest) -> Result<FactcheckRequest> {
        let original_id = request.id;
        let stored = self.store.enqueue_factcheck(request).await?;
        if stored.id == original_id {
            let _ = self.sender.send(stored.id);
        }
        Ok(stored)
    }

    async fn run(&self, mut receiver: mpsc::UnboundedReceiver<Uuid>) {
        while let Some(request_id) = receiver.recv().await {
            if let Err(e) = self.process_one(request_id).await {
                tracing::error!(request_id = %request_id, error = %e, "fact-check processing failed");
            }
        }
    }

    async fn process_one(&self, request_id: Uuid) -> Result<()> {
        let Some(mut request) = self.store.get_factcheck_request(request_id).await? else {
            return Ok(());
        };

        request.status = FactcheckStatus::Processing;
        self.store.update_factcheck_request(&request).await?;

        match self.run_referee(&request).await {
            Ok(result) => {
                if let Some(counter) = metrics::FACTCHECK_VERDICTS.get() {
                    counter.with_label_values(&[verdict_label(result.verdict)]).inc();
                }
                // A duplicate result insertion is an expected, handled
                // failure under at-least-once processing (spec §4.5).
                if let Err(e) = self.store.create_factcheck_result(&result).await {
                    tracing::debug!(request_id = %request_id, error = %e, "result already recorded");
                }
                request.status = FactcheckStatus::Completed;
                self.store.update_factcheck_request(&request).await?;
            }
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "fact-check verification failed");
                request.status = FactcheckStatus::Failed;
                self.store.update_factcheck_request(&request).await?;
            }
        }

        Ok(())
    }

    async fn load_target(&self, request: &FactcheckRequest) -> Result<(String, Vec<Citation>)> {
        match request.target {
            FactcheckTarget::Turn(id) => {
                let turn = self
                    .store
                    .get_turn(id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("turn {id} not found"))?;
                Ok((turn.claim, turn.citations))
            }
            FactcheckTarget::Comment(id) => {
                let comment = self
                    .store
                    .get_comment(id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("comment {id} not found"))?;
                Ok((comment.content, comment.citations))
            }
        }
    }

    /// Referee verification: fetch + content-match per citation, then a
    /// logic check over all accessible evidence (spec §4.5).
    async fn run_referee(&self, request: &FactcheckRequest) -> Result<FactcheckResult> {
        let (claim, citations) = self.load_target(request).await?;

        if citations.is_empty() {
            return Ok(FactcheckResult {
                id: Uuid::new_v4(),
                request_id: request.id,
                verdict: Verdict::Inconclusive,
                citation_checks: vec![],
                logic_valid: false,
                details: "No citations to verify".to_string(),
            });
        }

        let mut citation_checks = Vec::with_capacity(citations.len());
        let mut any_inaccessible = false;
        let mut any_mismatch = false;
        let mut accessible_evidence = Vec::new();

        for citation in &citations {
            let check = self.check_citation(&claim, citation).await;
            if !check.accessible {
                any_inaccessible = true;
            } else {
                if check.content_match == Some(false) {
                    any_mismatch = true;
                }
                accessible_evidence.push(format!("{}: {}", citation.url, check.explanation));
            }
            citation_checks.push(check);
        }

        let logic_valid = if any_inaccessible || accessible_evidence.is_empty() {
            false
        } else {
            self.check_logic(&claim, &accessible_evidence).await
        };

        let verdict = if any_inaccessible {
            Verdict::SourceInaccessible
        } else if any_mismatch {
            Verdict::SourceMismatch
        } else if logic_valid {
            Verdict::Verified
        } else {
            Verdict::Inconclusive
        };

        Ok(FactcheckResult {
            id: Uuid::new_v4(),
            request_id: request.id,
            verdict,
            citation_checks,
            logic_valid,
            details: String::new(),
        })
    }

    async fn check_citation(&self, claim: &str, citation: &Citation) -> CitationCheck {
        let body = match self.fetch_citation_body(&citation.url).await {
            Some(body) => body,
            None => {
                return CitationCheck {
                    url: citation.url.clone(),
                    accessible: false,
                    content_match: None,
                    explanation: "citation URL was not reachable (non-200 or network error)"
                        .to_string(),
                }
            }
        };

        let excerpt: String = body
            .chars()
            .take(self.config.factcheck.content_match_limit_bytes)
            .collect();

        #[derive(Deserialize)]
        struct MatchResponse {
            #[serde(rename = "match")]
            matches: bool,
            explanation: String,
        }

        let system = "You verify whether a quoted claim is actually supported by a page's \
                      content. Respond with a single JSON object {\"match\": bool, \
                      \"explanation\": string}.";
        let user = format!(
            "Claim: {claim}\nQuote to verify: {}\nPage excerpt:\n{excerpt}",
            citation.quote
        );

        match self.referee.complete(system, &user).await {
            Ok(raw) => match serde_json::from_str::<MatchResponse>(raw.trim()) {
                Ok(parsed) => CitationCheck {
                    url: citation.url.clone(),
                    accessible: true,
                    content_match: Some(parsed.matches),
                    explanation: parsed.explanation,
                },
                Err(e) => CitationCheck {
                    url: citation.url.clone(),
                    accessible: true,
                    content_match: None,
                    explanation: format!("failed to parse content-match response: {e}"),
                },
            },
            Err(e) => CitationCheck {
                url: citation.url.clone(),
                accessible: true,
                content_match: None,
                explanation: format!("content-match LLM call failed: {e}"),
            },
        }
    }

    async fn fetch_citation_body(&self, url: &str) -> Option<String> {
        let resp = self.http_client.get(url).send().await.ok()?;
        if resp.status().as_u16() != 200 {
            return None;
        }
        let bytes = resp.bytes().await.ok()?;
        let limit = self.config.factcheck.citation_body_limit_bytes.min(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..limit]).to_string())
    }

    async fn check_logic(&self, claim: &str, evidence: &[String]) -> bool {
        #[derive(Deserialize)]
        struct LogicResponse {
            valid: bool,
            #[allow(dead_code)]
            explanation: String,
        }

        let system = "You judge whether a claim logically follows from the accessible evidence \
                      supplied. Respond with a single JSON object {\"valid\": bool, \
                      \"explanation\": string}.";
        let user = format!("Claim: {claim}\nEvidence:\n{}", evidence.join("\n"));

        match self.referee.complete(system, &user).await {
            Ok(raw) => serde_json::from_str::<LogicResponse>(raw.trim())
                .map(|parsed| parsed.valid)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn verdict_label(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Verified => "verified",
        Verdict::SourceInaccessible => "source_inaccessible",
        Verdict::SourceMismatch => "source_mismatch",
        Verdict::Inconclusive => "inconclusive",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;

    fn test_config() -> Config {
        Config::default()
    }

    fn test_referee() -> Arc<BuiltinGateway> {
        Arc::new(BuiltinGateway::new(test_config(), "referee").expect("client should build"))
    }

    #[tokio::test]
    async fn test_enqueue_skips_fifo_push_on_dedup() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let (worker, _handle) = FactcheckWorker::spawn(store, test_referee(), test_config());

        let run_id = Uuid::new_v4();
        let first = FactcheckRequest {
            id: Uuid::new_v4(),
            run_id,
            claim_hash: "h".to_string(),
            target: FactcheckTarget::Turn(Uuid::new_v4()),
            status: FactcheckStatus::Pending,
            request_count: 1,
            session_id: Uuid::new_v4(),
        };
        let mut duplicate = first.clone();
        duplicate.id = Uuid::new_v4();

        let stored_first = worker.enqueue(first.clone()).await.unwrap();
        let stored_second = worker.enqueue(duplicate).await.unwrap();

        assert_eq!(stored_first.id, stored_second.id);
        assert_eq!(stored_second.request_count, 2);
    }

    #[tokio::test]
    async fn test_no_citations_yields_inconclusive_without_network() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

        let topic_id = Uuid::new_v4();
        let comment_id = Uuid::new_v4();
        store
            .create_comment(&crate::domain::Comment {
                id: comment_id,
                topic_id,
                participant_id: Uuid::new_v4(),
                content: "unverifiable claim".to_string(),
                references: vec![],
                citations: vec![],
                stance: None,
                token_count: 4,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let (worker, _handle) = FactcheckWorker::spawn(Arc::clone(&store), test_referee(), test_config());
        let request = FactcheckRequest {
            id: Uuid::new_v4(),
            run_id: topic_id,
            claim_hash: "h".to_string(),
            target: FactcheckTarget::Comment(comment_id),
            status: FactcheckStatus::Pending,
            request_count: 1,
            session_id: Uuid::new_v4(),
        };

        let result = worker.run_referee(&request).await.unwrap();
        assert_eq!(result.verdict, Verdict::Inconclusive);
        assert_eq!(result.details, "No citations to verify");
    }

    #[tokio::test]
    async fn test_recover_pending_requeues_unfinished_requests() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let (worker, _handle) = FactcheckWorker::spawn(Arc::clone(&store), test_referee(), test_config());

        let pending = FactcheckRequest {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            claim_hash: "a".to_string(),
            target: FactcheckTarget::Turn(Uuid::new_v4()),
            status: FactcheckStatus::Pending,
            request_count: 1,
            session_id: Uuid::new_v4(),
        };
        store.enqueue_factcheck(pending).await.unwrap();

        let recovered = worker.recover_pending().await.unwrap();
        assert_eq!(recovered, 1);
    }
}
