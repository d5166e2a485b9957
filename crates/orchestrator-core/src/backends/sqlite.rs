//! `SQLite` backend for the orchestration core's persistence store.
//!
//! Provides durable storage for runs, participants, turns, comments, and
//! fact-check bookkeeping with:
//! - Write-Ahead Logging (WAL) for concurrent access
//! - Automatic schema migration
//! - A row-level lock on debate start via `BEGIN IMMEDIATE` + retry
//!
//! ```rust,ignore
//! let store = SqliteStore::new("./data/agon.db").await?;
//! store.insert_debate(debate).await?;
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;
use uuid::Uuid;

use crate::domain::{
    Comment, CommentReference, DebateRun, FactcheckRequest, FactcheckResult, FactcheckStatus,
    FactcheckTarget, NamedCheck, Participant, ParticipantKind, ParticipantStatus, Participation,
    SandboxResult, SandboxStatus, Side, Turn, TurnStatus, TopicRun, Verdict,
};

use super::Store;

/// `SQLite`-based persistence store.
///
/// Each operation opens its own connection on a blocking thread pool;
/// `SQLite`'s WAL mode handles concurrent access without shared in-process
/// locking beyond what `try_start_debate` needs.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub async fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let mut db_path = path.into();

        if db_path.to_str() == Some(":memory:") {
            db_path = PathBuf::from("file::memory:?cache=shared");
        }

        let store = Self { db_path };
        store.migrate_schema().await?;
        Ok(store)
    }

    async fn migrate_schema(&self) -> Result<()> {
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(&db_path).context("failed to open database for migration")?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("failed to enable WAL mode")?;

            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS participants (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL,
                    endpoint_url TEXT,
                    model_identifier TEXT
                );

                CREATE TABLE IF NOT EXISTS debates (
                    id TEXT PRIMARY KEY,
                    topic TEXT NOT NULL,
                    format TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    max_turns INTEGER NOT NULL,
                    current_turn INTEGER NOT NULL,
                    turn_timeout_seconds INTEGER NOT NULL,
                    turn_cooldown_seconds INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    is_sandbox INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS topics (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL,
                    status TEXT NOT NULL,
                    duration_minutes INTEGER NOT NULL,
                    polling_interval_seconds INTEGER NOT NULL,
                    max_comments_per_agent INTEGER NOT NULL,
                    started_at TEXT,
                    closes_at TEXT,
                    closed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS participations (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    participant_id TEXT NOT NULL,
                    side TEXT,
                    team_id TEXT,
                    turn_order INTEGER,
                    max_comments INTEGER,
                    comment_count INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_participations_run ON participations(run_id);

                CREATE TABLE IF NOT EXISTS turns (
                    id TEXT PRIMARY KEY,
                    debate_id TEXT NOT NULL,
                    turn_number INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    stance TEXT NOT NULL,
                    claim TEXT NOT NULL,
                    argument TEXT NOT NULL,
                    citations TEXT NOT NULL,
                    rebuttal_target TEXT,
                    token_count INTEGER NOT NULL,
                    submitted_at TEXT,
                    validated_at TEXT,
                    UNIQUE(debate_id, turn_number)
                );
                CREATE INDEX IF NOT EXISTS idx_turns_debate ON turns(debate_id);

                CREATE TABLE IF NOT EXISTS comments (
                    id TEXT PRIMARY KEY,
                    topic_id TEXT NOT NULL,
                    participant_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    references_json TEXT NOT NULL,
                    citations TEXT NOT NULL,
                    stance TEXT,
                    token_count INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_comments_topic ON comments(topic_id);

                CREATE TABLE IF NOT EXISTS factcheck_requests (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    claim_hash TEXT NOT NULL,
                    target_kind TEXT NOT NULL,
                    target_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    request_count INTEGER NOT NULL,
                    session_id TEXT NOT NULL,
                    UNIQUE(run_id, claim_hash)
                );

                CREATE TABLE IF NOT EXISTS factcheck_results (
                    id TEXT PRIMARY KEY,
                    request_id TEXT NOT NULL UNIQUE,
                    verdict TEXT NOT NULL,
                    citation_checks TEXT NOT NULL,
                    logic_valid INTEGER NOT NULL,
                    details TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sandbox_results (
                    id TEXT PRIMARY KEY,
                    participant_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    checks TEXT NOT NULL
                );
                ",
            )
            .context("failed to create schema")?;

            Ok(())
        })
        .await
        .context("failed to spawn blocking task")??;

        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).context("failed to open database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        Ok(conn)
    }
}

fn row_to_participant(row: &rusqlite::Row) -> rusqlite::Result<Participant> {
    let id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(Participant {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        kind: if kind == "external" {
            ParticipantKind::External
        } else {
            ParticipantKind::Builtin
        },
        status: match status.as_str() {
            "active" => ParticipantStatus::Active,
            "suspended" => ParticipantStatus::Suspended,
            "failed" => ParticipantStatus::Failed,
            _ => ParticipantStatus::Registered,
        },
        endpoint_url: row.get(3)?,
        model_identifier: row.get(4)?,
    })
}

fn participant_kind_str(kind: ParticipantKind) -> &'static str {
    match kind {
        ParticipantKind::Builtin => "builtin",
        ParticipantKind::External => "external",
    }
}

fn participant_status_str(status: ParticipantStatus) -> &'static str {
    match status {
        ParticipantStatus::Registered => "registered",
        ParticipantStatus::Active => "active",
        ParticipantStatus::Suspended => "suspended",
        ParticipantStatus::Failed => "failed",
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_participant(&self, id: Uuid) -> Result<Option<Participant>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Option<Participant>> {
            let conn = Connection::open(&db_path)?;
            conn.query_row(
                "SELECT id, kind, status, endpoint_url, model_identifier FROM participants WHERE id = ?1",
                params![id.to_string()],
                row_to_participant,
            )
            .optional()
            .context("failed to query participant")
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn update_participant(&self, participant: &Participant) -> Result<()> {
        let store = self.clone();
        let participant = participant.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            conn.execute(
                r"
                INSERT INTO participants (id, kind, status, endpoint_url, model_identifier)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET kind=excluded.kind, status=excluded.status,
                    endpoint_url=excluded.endpoint_url, model_identifier=excluded.model_identifier
                ",
                params![
                    participant.id.to_string(),
                    participant_kind_str(participant.kind),
                    participant_status_str(participant.status),
                    participant.endpoint_url,
                    participant.model_identifier,
                ],
            )
            .context("failed to upsert participant")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn get_debate(&self, id: Uuid) -> Result<Option<DebateRun>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Option<DebateRun>> {
            let conn = Connection::open(&db_path)?;
            conn.query_row(
                r"SELECT id, topic, format, mode, max_turns, current_turn, turn_timeout_seconds,
                         turn_cooldown_seconds, status, started_at, completed_at, is_sandbox
                  FROM debates WHERE id = ?1",
                params![id.to_string()],
                row_to_debate,
            )
            .optional()
            .context("failed to query debate")
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn update_debate(&self, debate: &DebateRun) -> Result<()> {
        let store = self.clone();
        let debate = debate.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            upsert_debate(&conn, &debate)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn try_start_debate(&self, id: Uuid) -> Result<bool> {
        let store = self.clone();
        task::spawn_blocking(move || -> Result<bool> {
            let conn = store.open()?;
            let mut attempts = 0;
            loop {
                attempts += 1;
                conn.execute("BEGIN IMMEDIATE", [])
                    .context("failed to begin transaction")?;

                let status: rusqlite::Result<String> = conn.query_row(
                    "SELECT status FROM debates WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                );

                match status {
                    Ok(status) if status == "scheduled" => {
                        if let Err(e) = conn.execute(
                            "UPDATE debates SET status = 'in_progress' WHERE id = ?1",
                            params![id.to_string()],
                        ) {
                            conn.execute("ROLLBACK", []).ok();
                            if e.to_string().contains("locked") && attempts < 3 {
                                std::thread::sleep(std::time::Duration::from_millis(10));
                                continue;
                            }
                            return Err(e).context("failed to start debate");
                        }
                        conn.execute("COMMIT", []).context("failed to commit")?;
                        return Ok(true);
                    }
                    Ok(_) => {
                        conn.execute("ROLLBACK", []).ok();
                        return Ok(false);
                    }
                    Err(_) => {
                        conn.execute("ROLLBACK", []).ok();
                        return Ok(false);
                    }
                }
            }
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn get_topic(&self, id: Uuid) -> Result<Option<TopicRun>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Option<TopicRun>> {
            let conn = Connection::open(&db_path)?;
            conn.query_row(
                r"SELECT id, title, description, status, duration_minutes,
                         polling_interval_seconds, max_comments_per_agent, started_at, closes_at, closed_at
                  FROM topics WHERE id = ?1",
                params![id.to_string()],
                row_to_topic,
            )
            .optional()
            .context("failed to query topic")
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn update_topic(&self, topic: &TopicRun) -> Result<()> {
        let store = self.clone();
        let topic = topic.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            conn.execute(
                r"
                INSERT INTO topics (id, title, description, status, duration_minutes,
                    polling_interval_seconds, max_comments_per_agent, started_at, closes_at, closed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET title=excluded.title, description=excluded.description,
                    status=excluded.status, duration_minutes=excluded.duration_minutes,
                    polling_interval_seconds=excluded.polling_interval_seconds,
                    max_comments_per_agent=excluded.max_comments_per_agent,
                    started_at=excluded.started_at, closes_at=excluded.closes_at, closed_at=excluded.closed_at
                ",
                params![
                    topic.id.to_string(),
                    topic.title,
                    topic.description,
                    topic_status_str(topic.status),
                    topic.duration_minutes,
                    topic.polling_interval_seconds,
                    topic.max_comments_per_agent,
                    topic.started_at.map(|t| t.to_rfc3339()),
                    topic.closes_at.map(|t| t.to_rfc3339()),
                    topic.closed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("failed to upsert topic")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn list_participations(&self, run_id: Uuid) -> Result<Vec<Participation>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Vec<Participation>> {
            let conn = Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                r"SELECT id, run_id, participant_id, side, team_id, turn_order, max_comments, comment_count
                  FROM participations WHERE run_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![run_id.to_string()], row_to_participation)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read participations")?;
            Ok(rows)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn update_participation(&self, participation: &Participation) -> Result<()> {
        let store = self.clone();
        let participation = participation.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            conn.execute(
                r"
                INSERT INTO participations (id, run_id, participant_id, side, team_id, turn_order, max_comments, comment_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET side=excluded.side, team_id=excluded.team_id,
                    turn_order=excluded.turn_order, max_comments=excluded.max_comments,
                    comment_count=excluded.comment_count
                ",
                params![
                    participation.id.to_string(),
                    participation.run_id.to_string(),
                    participation.participant_id.to_string(),
                    participation.side.map(|s| s.as_str()),
                    participation.team_id,
                    participation.turn_order,
                    participation.max_comments,
                    participation.comment_count,
                ],
            )
            .context("failed to upsert participation")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn count_other_in_progress_debates(
        &self,
        participant_id: Uuid,
        exclude_debate_id: Uuid,
        include_sandbox: bool,
    ) -> Result<usize> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<usize> {
            let conn = Connection::open(&db_path)?;
            let sandbox_clause = if include_sandbox { "" } else { "AND d.is_sandbox = 0" };
            let query = format!(
                r"SELECT COUNT(*) FROM debates d
                   JOIN participations p ON p.run_id = d.id
                   WHERE p.participant_id = ?1 AND d.id != ?2 AND d.status = 'in_progress' {sandbox_clause}"
            );
            let count: i64 = conn.query_row(
                &query,
                params![participant_id.to_string(), exclude_debate_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn create_turn(&self, turn: &Turn) -> Result<()> {
        let store = self.clone();
        let turn = turn.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            insert_turn(&conn, &turn)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn update_turn(&self, turn: &Turn) -> Result<()> {
        let store = self.clone();
        let turn = turn.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            conn.execute(
                r"
                UPDATE turns SET status=?2, stance=?3, claim=?4, argument=?5, citations=?6,
                    rebuttal_target=?7, token_count=?8, submitted_at=?9, validated_at=?10
                WHERE id=?1
                ",
                params![
                    turn.id.to_string(),
                    turn_status_str(turn.status),
                    turn.stance,
                    turn.claim,
                    turn.argument,
                    serde_json::to_string(&turn.citations)?,
                    turn.rebuttal_target.map(|u| u.to_string()),
                    turn.token_count,
                    turn.submitted_at.map(|t| t.to_rfc3339()),
                    turn.validated_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("failed to update turn")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn get_turn(&self, id: Uuid) -> Result<Option<Turn>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Option<Turn>> {
            let conn = Connection::open(&db_path)?;
            conn.query_row(
                r"SELECT id, debate_id, turn_number, status, stance, claim, argument, citations,
                         rebuttal_target, token_count, submitted_at, validated_at
                  FROM turns WHERE id = ?1",
                params![id.to_string()],
                row_to_turn,
            )
            .optional()
            .context("failed to query turn")
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn list_turns(&self, debate_id: Uuid) -> Result<Vec<Turn>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Vec<Turn>> {
            let conn = Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                r"SELECT id, debate_id, turn_number, status, stance, claim, argument, citations,
                         rebuttal_target, token_count, submitted_at, validated_at
                  FROM turns WHERE debate_id = ?1 ORDER BY turn_number ASC",
            )?;
            let rows: Vec<Turn> = stmt
                .query_map(params![debate_id.to_string()], row_to_turn)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read turns")?;
            Ok(rows)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn create_comment(&self, comment: &Comment) -> Result<()> {
        let store = self.clone();
        let comment = comment.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            conn.execute(
                r"
                INSERT INTO comments (id, topic_id, participant_id, content, references_json,
                    citations, stance, token_count, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ",
                params![
                    comment.id.to_string(),
                    comment.topic_id.to_string(),
                    comment.participant_id.to_string(),
                    comment.content,
                    serde_json::to_string(&comment.references)?,
                    serde_json::to_string(&comment.citations)?,
                    comment.stance,
                    comment.token_count,
                    comment.created_at.to_rfc3339(),
                ],
            )
            .context("failed to insert comment")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn get_comment(&self, id: Uuid) -> Result<Option<Comment>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Option<Comment>> {
            let conn = Connection::open(&db_path)?;
            conn.query_row(
                r"SELECT id, topic_id, participant_id, content, references_json, citations,
                         stance, token_count, created_at
                  FROM comments WHERE id = ?1",
                params![id.to_string()],
                row_to_comment,
            )
            .optional()
            .context("failed to query comment")
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn list_comments(&self, topic_id: Uuid) -> Result<Vec<Comment>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Vec<Comment>> {
            let conn = Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                r"SELECT id, topic_id, participant_id, content, references_json, citations,
                         stance, token_count, created_at
                  FROM comments WHERE topic_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows: Vec<Comment> = stmt
                .query_map(params![topic_id.to_string()], row_to_comment)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read comments")?;
            Ok(rows)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn enqueue_factcheck(&self, request: FactcheckRequest) -> Result<FactcheckRequest> {
        let store = self.clone();
        task::spawn_blocking(move || -> Result<FactcheckRequest> {
            let conn = store.open()?;
            let (target_kind, target_id) = target_columns(request.target);

            let mut attempts = 0;
            loop {
                attempts += 1;
                conn.execute("BEGIN IMMEDIATE", [])
                    .context("failed to begin transaction")?;

                let existing: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT id, request_count FROM factcheck_requests WHERE run_id = ?1 AND claim_hash = ?2",
                        params![request.run_id.to_string(), request.claim_hash],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .context("failed to query existing factcheck request")?;

                if let Some((id, count)) = existing {
                    let new_count = count + 1;
                    conn.execute(
                        "UPDATE factcheck_requests SET request_count = ?2 WHERE id = ?1",
                        params![id, new_count],
                    )
                    .context("failed to increment request_count")?;
                    conn.execute("COMMIT", []).context("failed to commit")?;

                    let mut updated = request;
                    updated.id = Uuid::parse_str(&id).unwrap_or(updated.id);
                    updated.request_count = new_count as u32;
                    return Ok(updated);
                }

                match conn.execute(
                    r"INSERT INTO factcheck_requests (id, run_id, claim_hash, target_kind, target_id, status, request_count, session_id)
                      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        request.id.to_string(),
                        request.run_id.to_string(),
                        request.claim_hash,
                        target_kind,
                        target_id,
                        factcheck_status_str(request.status),
                        request.request_count,
                        request.session_id.to_string(),
                    ],
                ) {
                    Ok(_) => {
                        conn.execute("COMMIT", []).context("failed to commit")?;
                        return Ok(request);
                    }
                    Err(e) => {
                        conn.execute("ROLLBACK", []).ok();
                        if e.to_string().contains("UNIQUE constraint") && attempts < 3 {
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            continue;
                        }
                        return Err(e).context("failed to insert factcheck request");
                    }
                }
            }
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn update_factcheck_request(&self, request: &FactcheckRequest) -> Result<()> {
        let store = self.clone();
        let request = request.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            conn.execute(
                "UPDATE factcheck_requests SET status = ?2, request_count = ?3 WHERE id = ?1",
                params![
                    request.id.to_string(),
                    factcheck_status_str(request.status),
                    request.request_count,
                ],
            )
            .context("failed to update factcheck request")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn get_factcheck_request(&self, id: Uuid) -> Result<Option<FactcheckRequest>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Option<FactcheckRequest>> {
            let conn = Connection::open(&db_path)?;
            conn.query_row(
                r"SELECT id, run_id, claim_hash, target_kind, target_id, status, request_count, session_id
                  FROM factcheck_requests WHERE id = ?1",
                params![id.to_string()],
                row_to_factcheck_request,
            )
            .optional()
            .context("failed to query factcheck request")
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn count_factchecks_for_run(&self, run_id: Uuid) -> Result<usize> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<usize> {
            let conn = Connection::open(&db_path)?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM factcheck_requests WHERE run_id = ?1",
                    params![run_id.to_string()],
                    |row| row.get(0),
                )
                .context("failed to count factcheck requests for run")?;
            Ok(count as usize)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn list_recoverable_factchecks(&self) -> Result<Vec<FactcheckRequest>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Vec<FactcheckRequest>> {
            let conn = Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                r"SELECT id, run_id, claim_hash, target_kind, target_id, status, request_count, session_id
                  FROM factcheck_requests WHERE status IN ('pending', 'processing')",
            )?;
            let rows: Vec<FactcheckRequest> = stmt
                .query_map([], row_to_factcheck_request)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read recoverable factcheck requests")?;
            Ok(rows)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn create_factcheck_result(&self, result: &FactcheckResult) -> Result<()> {
        let store = self.clone();
        let result = result.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            conn.execute(
                r"INSERT INTO factcheck_results (id, request_id, verdict, citation_checks, logic_valid, details)
                  VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    result.id.to_string(),
                    result.request_id.to_string(),
                    verdict_str(result.verdict),
                    serde_json::to_string(&result.citation_checks)?,
                    result.logic_valid,
                    result.details,
                ],
            )
            .context("failed to insert factcheck result (UNIQUE(request_id) prevents duplicates)")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn create_sandbox_result(&self, result: &SandboxResult) -> Result<()> {
        let store = self.clone();
        let result = result.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = store.open()?;
            upsert_sandbox_result(&conn, &result)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn update_sandbox_result(&self, result: &SandboxResult) -> Result<()> {
        self.create_sandbox_result(result).await
    }
}

fn upsert_debate(conn: &Connection, debate: &DebateRun) -> Result<()> {
    conn.execute(
        r"
        INSERT INTO debates (id, topic, format, mode, max_turns, current_turn, turn_timeout_seconds,
            turn_cooldown_seconds, status, started_at, completed_at, is_sandbox)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(id) DO UPDATE SET topic=excluded.topic, format=excluded.format, mode=excluded.mode,
            max_turns=excluded.max_turns, current_turn=excluded.current_turn,
            turn_timeout_seconds=excluded.turn_timeout_seconds, turn_cooldown_seconds=excluded.turn_cooldown_seconds,
            status=excluded.status, started_at=excluded.started_at, completed_at=excluded.completed_at,
            is_sandbox=excluded.is_sandbox
        ",
        params![
            debate.id.to_string(),
            debate.topic,
            debate_format_str(debate.format),
            debate_mode_str(debate.mode),
            debate.max_turns,
            debate.current_turn,
            debate.turn_timeout_seconds,
            debate.turn_cooldown_seconds,
            debate_status_str(debate.status),
            debate.started_at.map(|t| t.to_rfc3339()),
            debate.completed_at.map(|t| t.to_rfc3339()),
            debate.is_sandbox,
        ],
    )
    .context("failed to upsert debate")?;
    Ok(())
}

fn insert_turn(conn: &Connection, turn: &Turn) -> Result<()> {
    conn.execute(
        r"
        INSERT INTO turns (id, debate_id, turn_number, status, stance, claim, argument, citations,
            rebuttal_target, token_count, submitted_at, validated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ",
        params![
            turn.id.to_string(),
            turn.debate_id.to_string(),
            turn.turn_number,
            turn_status_str(turn.status),
            turn.stance,
            turn.claim,
            turn.argument,
            serde_json::to_string(&turn.citations)?,
            turn.rebuttal_target.map(|u| u.to_string()),
            turn.token_count,
            turn.submitted_at.map(|t| t.to_rfc3339()),
            turn.validated_at.map(|t| t.to_rfc3339()),
        ],
    )
    .context("failed to insert turn (UNIQUE(debate_id, turn_number) guards duplicates)")?;
    Ok(())
}

fn upsert_sandbox_result(conn: &Connection, result: &SandboxResult) -> Result<()> {
    conn.execute(
        r"
        INSERT INTO sandbox_results (id, participant_id, status, checks)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET status=excluded.status, checks=excluded.checks
        ",
        params![
            result.id.to_string(),
            result.participant_id.to_string(),
            sandbox_status_str(result.status),
            serde_json::to_string(&result.checks)?,
        ],
    )
    .context("failed to upsert sandbox result")?;
    Ok(())
}

fn row_to_debate(row: &rusqlite::Row) -> rusqlite::Result<DebateRun> {
    let id: String = row.get(0)?;
    let format: String = row.get(2)?;
    let mode: String = row.get(3)?;
    let status: String = row.get(8)?;
    let started_at: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;

    Ok(DebateRun {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        topic: row.get(1)?,
        format: match format.as_str() {
            "two_v_two" => crate::domain::DebateFormat::TwoVTwo,
            "three_v_three" => crate::domain::DebateFormat::ThreeVThree,
            _ => crate::domain::DebateFormat::OneVOne,
        },
        mode: if mode == "live" {
            crate::domain::DebateMode::Live
        } else {
            crate::domain::DebateMode::Async
        },
        max_turns: row.get(4)?,
        current_turn: row.get(5)?,
        turn_timeout_seconds: row.get(6)?,
        turn_cooldown_seconds: row.get(7)?,
        status: match status.as_str() {
            "in_progress" => crate::domain::DebateStatus::InProgress,
            "completed" => crate::domain::DebateStatus::Completed,
            "failed" => crate::domain::DebateStatus::Failed,
            _ => crate::domain::DebateStatus::Scheduled,
        },
        started_at: started_at.and_then(|s| s.parse().ok()),
        completed_at: completed_at.and_then(|s| s.parse().ok()),
        is_sandbox: row.get(11)?,
    })
}

fn row_to_topic(row: &rusqlite::Row) -> rusqlite::Result<TopicRun> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let started_at: Option<String> = row.get(7)?;
    let closes_at: Option<String> = row.get(8)?;
    let closed_at: Option<String> = row.get(9)?;

    Ok(TopicRun {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        title: row.get(1)?,
        description: row.get(2)?,
        status: match status.as_str() {
            "open" => crate::domain::TopicStatus::Open,
            "closed" => crate::domain::TopicStatus::Closed,
            _ => crate::domain::TopicStatus::Scheduled,
        },
        duration_minutes: row.get(4)?,
        polling_interval_seconds: row.get(5)?,
        max_comments_per_agent: row.get(6)?,
        started_at: started_at.and_then(|s| s.parse().ok()),
        closes_at: closes_at.and_then(|s| s.parse().ok()),
        closed_at: closed_at.and_then(|s| s.parse().ok()),
    })
}

fn row_to_participation(row: &rusqlite::Row) -> rusqlite::Result<Participation> {
    let id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let participant_id: String = row.get(2)?;
    let side: Option<String> = row.get(3)?;

    Ok(Participation {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        run_id: Uuid::parse_str(&run_id).unwrap_or_default(),
        participant_id: Uuid::parse_str(&participant_id).unwrap_or_default(),
        side: side.map(|s| if s == "con" { Side::Con } else { Side::Pro }),
        team_id: row.get(4)?,
        turn_order: row.get(5)?,
        max_comments: row.get(6)?,
        comment_count: row.get(7)?,
    })
}

fn row_to_turn(row: &rusqlite::Row) -> rusqlite::Result<Turn> {
    let id: String = row.get(0)?;
    let debate_id: String = row.get(1)?;
    let status: String = row.get(3)?;
    let citations_json: String = row.get(7)?;
    let rebuttal_target: Option<String> = row.get(8)?;
    let submitted_at: Option<String> = row.get(10)?;
    let validated_at: Option<String> = row.get(11)?;

    Ok(Turn {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        debate_id: Uuid::parse_str(&debate_id).unwrap_or_default(),
        turn_number: row.get(2)?,
        status: match status.as_str() {
            "validated" => TurnStatus::Validated,
            "timeout" => TurnStatus::Timeout,
            "format_error" => TurnStatus::FormatError,
            _ => TurnStatus::Pending,
        },
        stance: row.get(4)?,
        claim: row.get(5)?,
        argument: row.get(6)?,
        citations: serde_json::from_str(&citations_json).unwrap_or_default(),
        rebuttal_target: rebuttal_target.and_then(|s| Uuid::parse_str(&s).ok()),
        token_count: row.get(9)?,
        submitted_at: submitted_at.and_then(|s| s.parse().ok()),
        validated_at: validated_at.and_then(|s| s.parse().ok()),
    })
}

fn row_to_comment(row: &rusqlite::Row) -> rusqlite::Result<Comment> {
    let id: String = row.get(0)?;
    let topic_id: String = row.get(1)?;
    let participant_id: String = row.get(2)?;
    let references_json: String = row.get(4)?;
    let citations_json: String = row.get(5)?;
    let created_at: String = row.get(8)?;

    Ok(Comment {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        topic_id: Uuid::parse_str(&topic_id).unwrap_or_default(),
        participant_id: Uuid::parse_str(&participant_id).unwrap_or_default(),
        content: row.get(3)?,
        references: serde_json::from_str::<Vec<CommentReference>>(&references_json).unwrap_or_default(),
        citations: serde_json::from_str(&citations_json).unwrap_or_default(),
        stance: row.get(6)?,
        token_count: row.get(7)?,
        created_at: created_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn row_to_factcheck_request(row: &rusqlite::Row) -> rusqlite::Result<FactcheckRequest> {
    let id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let target_kind: String = row.get(3)?;
    let target_id: String = row.get(4)?;
    let status: String = row.get(5)?;
    let session_id: String = row.get(7)?;

    let target_uuid = Uuid::parse_str(&target_id).unwrap_or_default();
    let target = if target_kind == "comment" {
        FactcheckTarget::Comment(target_uuid)
    } else {
        FactcheckTarget::Turn(target_uuid)
    };

    Ok(FactcheckRequest {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        run_id: Uuid::parse_str(&run_id).unwrap_or_default(),
        claim_hash: row.get(2)?,
        target,
        status: match status.as_str() {
            "processing" => FactcheckStatus::Processing,
            "completed" => FactcheckStatus::Completed,
            "failed" => FactcheckStatus::Failed,
            _ => FactcheckStatus::Pending,
        },
        request_count: row.get(6)?,
        session_id: Uuid::parse_str(&session_id).unwrap_or_default(),
    })
}

fn target_columns(target: FactcheckTarget) -> (&'static str, String) {
    match target {
        FactcheckTarget::Turn(id) => ("turn", id.to_string()),
        FactcheckTarget::Comment(id) => ("comment", id.to_string()),
    }
}

fn debate_format_str(format: crate::domain::DebateFormat) -> &'static str {
    match format {
        crate::domain::DebateFormat::OneVOne => "one_v_one",
        crate::domain::DebateFormat::TwoVTwo => "two_v_two",
        crate::domain::DebateFormat::ThreeVThree => "three_v_three",
    }
}

fn debate_mode_str(mode: crate::domain::DebateMode) -> &'static str {
    match mode {
        crate::domain::DebateMode::Async => "async",
        crate::domain::DebateMode::Live => "live",
    }
}

fn debate_status_str(status: crate::domain::DebateStatus) -> &'static str {
    match status {
        crate::domain::DebateStatus::Scheduled => "scheduled",
        crate::domain::DebateStatus::InProgress => "in_progress",
        crate::domain::DebateStatus::Completed => "completed",
        crate::domain::DebateStatus::Failed => "failed",
    }
}

fn topic_status_str(status: crate::domain::TopicStatus) -> &'static str {
    match status {
        crate::domain::TopicStatus::Scheduled => "scheduled",
        crate::domain::TopicStatus::Open => "open",
        crate::domain::TopicStatus::Closed => "closed",
    }
}

fn turn_status_str(status: TurnStatus) -> &'static str {
    match status {
        TurnStatus::Pending => "pending",
        TurnStatus::Validated => "validated",
        TurnStatus::Timeout => "timeout",
        TurnStatus::FormatError => "format_error",
    }
}

fn factcheck_status_str(status: FactcheckStatus) -> &'static str {
    match status {
        FactcheckStatus::Pending => "pending",
        FactcheckStatus::Processing => "processing",
        FactcheckStatus::Completed => "completed",
        FactcheckStatus::Failed => "failed",
    }
}

fn verdict_str(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Verified => "verified",
        Verdict::SourceInaccessible => "source_inaccessible",
        Verdict::SourceMismatch => "source_mismatch",
        Verdict::Inconclusive => "inconclusive",
    }
}

fn sandbox_status_str(status: SandboxStatus) -> &'static str {
    match status {
        SandboxStatus::Running => "running",
        SandboxStatus::Passed => "passed",
        SandboxStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DebateFormat, DebateMode, DebateStatus};
    use tempfile::NamedTempFile;

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

    async fn create_test_store() -> (SqliteStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = SqliteStore::new(temp_file.path()).await.unwrap();
        (store, temp_file)
    }

    #[tokio::test]
    async fn test_debate_roundtrip() {
        let (store, _temp) = create_test_store().await;
        let id = Uuid::new_v4();
        store.update_debate(&sample_debate(id)).await.unwrap();

        let loaded = store.get_debate(id).await.unwrap().expect("debate should exist");
        assert_eq!(loaded.max_turns, 4);
        assert_eq!(loaded.status, DebateStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_try_start_debate_only_succeeds_once() {
        let (store, _temp) = create_test_store().await;
        let id = Uuid::new_v4();
        store.update_debate(&sample_debate(id)).await.unwrap();

        assert!(store.try_start_debate(id).await.unwrap());
        assert!(!store.try_start_debate(id).await.unwrap());

        let loaded = store.get_debate(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DebateStatus::InProgress);
    }

    #[tokio::test]
    async fn test_turn_unique_per_debate_and_number() {
        let (store, _temp) = create_test_store().await;
        let debate_id = Uuid::new_v4();
        store.update_debate(&sample_debate(debate_id)).await.unwrap();

        let turn = Turn {
            id: Uuid::new_v4(),
            debate_id,
            turn_number: 1,
            status: TurnStatus::Pending,
            stance: "pro".to_string(),
            claim: String::new(),
            argument: String::new(),
            citations: vec![],
            rebuttal_target: None,
            token_count: 0,
            submitted_at: None,
            validated_at: None,
        };
        store.create_turn(&turn).await.unwrap();

        let mut duplicate = turn.clone();
        duplicate.id = Uuid::new_v4();
        let result = store.create_turn(&duplicate).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_factcheck_dedups_and_increments() {
        let (store, _temp) = create_test_store().await;
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
    async fn test_factcheck_result_unique_per_request() {
        let (store, _temp) = create_test_store().await;
        let request_id = Uuid::new_v4();
        let result = FactcheckResult {
            id: Uuid::new_v4(),
            request_id,
            verdict: Verdict::Verified,
            citation_checks: vec![],
            logic_valid: true,
            details: String::new(),
        };

        store.create_factcheck_result(&result).await.unwrap();
        let duplicate = FactcheckResult { id: Uuid::new_v4(), ..result };
        assert!(store.create_factcheck_result(&duplicate).await.is_err());
    }

    #[tokio::test]
    async fn test_list_recoverable_factchecks() {
        let (store, _temp) = create_test_store().await;
        let run_id = Uuid::new_v4();

        let pending = FactcheckRequest {
            id: Uuid::new_v4(),
            run_id,
            claim_hash: "a".to_string(),
            target: FactcheckTarget::Turn(Uuid::new_v4()),
            status: FactcheckStatus::Pending,
            request_count: 1,
            session_id: Uuid::new_v4(),
        };
        let mut completed = pending.clone();
        completed.id = Uuid::new_v4();
        completed.claim_hash = "b".to_string();
        completed.status = FactcheckStatus::Completed;

        store.enqueue_factcheck(pending).await.unwrap();
        store.enqueue_factcheck(completed.clone()).await.unwrap();
        store.update_factcheck_request(&completed).await.unwrap();

        let recoverable = store.list_recoverable_factchecks().await.unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].claim_hash, "a");
    }
}
