// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite-backed repository for sessions, prompts, replies, and the audit
//! mirror. WAL mode; one connection behind a mutex — the single writer the
//! schema's guarded updates assume.
//!
//! `decide_prompt` is the system's race arbiter: every transition intent
//! (human reply, timeout default, cancel) goes through one conditional
//! UPDATE, and the first caller to satisfy the guard wins. Losers observe
//! zero affected rows, which is an expected outcome, not an error.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::prompt::{
    Choice, Confidence, Constraints, PromptEvent, PromptStatus, PromptType, Reply, SessionRecord,
    SessionStatus,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id    TEXT PRIMARY KEY,
    tool          TEXT NOT NULL,
    cwd           TEXT NOT NULL,
    label         TEXT,
    child_pid     INTEGER,
    status        TEXT NOT NULL,
    started_at_us INTEGER NOT NULL,
    ended_at_us   INTEGER,
    exit_code     INTEGER
);

CREATE TABLE IF NOT EXISTS prompts (
    prompt_id          TEXT PRIMARY KEY,
    session_id         TEXT NOT NULL REFERENCES sessions(session_id),
    kind               TEXT NOT NULL,
    confidence         TEXT NOT NULL,
    excerpt            TEXT NOT NULL,
    choices            TEXT NOT NULL,
    max_length         INTEGER,
    allowed_choices    TEXT,
    nonce              TEXT NOT NULL,
    nonce_used         INTEGER NOT NULL DEFAULT 0,
    safe_default       BLOB NOT NULL,
    status             TEXT NOT NULL,
    idempotency_key    TEXT NOT NULL UNIQUE,
    channel_message_id TEXT,
    responder          TEXT,
    created_at_us      INTEGER NOT NULL,
    expires_at_us      INTEGER NOT NULL,
    decided_at_us      INTEGER
);

CREATE INDEX IF NOT EXISTS idx_prompts_session ON prompts(session_id);
CREATE INDEX IF NOT EXISTS idx_prompts_status ON prompts(status);

CREATE TABLE IF NOT EXISTS replies (
    reply_id         TEXT PRIMARY KEY,
    prompt_id        TEXT NOT NULL REFERENCES prompts(prompt_id),
    session_id       TEXT NOT NULL,
    raw_value        TEXT NOT NULL,
    normalised_value BLOB NOT NULL,
    source           TEXT NOT NULL,
    responder        TEXT,
    injected_at_us   INTEGER
);

CREATE TABLE IF NOT EXISTS audit_events (
    seq        INTEGER PRIMARY KEY,
    ts_us      INTEGER NOT NULL,
    event      TEXT NOT NULL,
    session_id TEXT,
    prompt_id  TEXT,
    payload    TEXT NOT NULL,
    hash       TEXT NOT NULL
);
";

/// Live (non-terminal) statuses a reply or timeout may still claim.
const DECIDABLE: &str = "('routed','awaiting_reply')";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` in WAL mode.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database at {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA).context("applying schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ----- sessions --------------------------------------------------------

    pub fn create_session(
        &self,
        session_id: Uuid,
        tool: &str,
        cwd: &str,
        label: Option<&str>,
        now_us: u64,
    ) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "INSERT INTO sessions (session_id, tool, cwd, label, status, started_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id.to_string(),
                tool,
                cwd,
                label,
                SessionStatus::Starting.as_str(),
                now_us as i64,
            ],
        )?;
        Ok(())
    }

    pub fn set_session_child(&self, session_id: Uuid, pid: u32) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions SET child_pid = ?2 WHERE session_id = ?1",
            params![session_id.to_string(), pid],
        )?;
        Ok(())
    }

    pub fn set_session_status(
        &self,
        session_id: Uuid,
        status: SessionStatus,
    ) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions SET status = ?2 WHERE session_id = ?1",
            params![session_id.to_string(), status.as_str()],
        )?;
        Ok(())
    }

    pub fn end_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        exit_code: Option<i32>,
        now_us: u64,
    ) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions SET status = ?2, exit_code = ?3, ended_at_us = ?4
             WHERE session_id = ?1",
            params![session_id.to_string(), status.as_str(), exit_code, now_us as i64],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: Uuid) -> anyhow::Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT session_id, tool, cwd, label, child_pid, status,
                        started_at_us, ended_at_us, exit_code
                 FROM sessions WHERE session_id = ?1",
                params![session_id.to_string()],
                row_to_session,
            )
            .optional()?;
        Ok(record)
    }

    // ----- prompts ---------------------------------------------------------

    /// Insert a freshly-detected prompt. Returns `false` (and writes
    /// nothing) when a prompt with the same idempotency key already exists.
    pub fn insert_prompt(&self, prompt: &PromptEvent) -> anyhow::Result<bool> {
        let choices = serde_json::to_string(&prompt.choices)?;
        let allowed = prompt
            .constraints
            .allowed_choices
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let changed = self.conn.lock().execute(
            "INSERT INTO prompts (prompt_id, session_id, kind, confidence, excerpt, choices,
                                  max_length, allowed_choices, nonce, safe_default, status,
                                  idempotency_key, created_at_us, expires_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                prompt.prompt_id.to_string(),
                prompt.session_id.to_string(),
                prompt.kind.as_str(),
                prompt.confidence.as_str(),
                prompt.excerpt,
                choices,
                prompt.constraints.max_length.map(|v| v as i64),
                allowed,
                prompt.nonce,
                prompt.safe_default,
                prompt.status.as_str(),
                prompt.idempotency_key,
                prompt.created_at_us as i64,
                prompt.expires_at_us as i64,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Guarded status advance: `from` → `to`. Returns whether a row moved.
    pub fn advance_status(
        &self,
        prompt_id: Uuid,
        from: &[PromptStatus],
        to: PromptStatus,
    ) -> anyhow::Result<bool> {
        let from_list = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "UPDATE prompts SET status = ?2 WHERE prompt_id = ?1 AND status IN ({from_list})"
        );
        let changed = self
            .conn
            .lock()
            .execute(&sql, params![prompt_id.to_string(), to.as_str()])?;
        Ok(changed == 1)
    }

    pub fn set_channel_message(&self, prompt_id: Uuid, message_id: &str) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE prompts SET channel_message_id = ?2 WHERE prompt_id = ?1",
            params![prompt_id.to_string(), message_id],
        )?;
        Ok(())
    }

    /// The single atomic conditional update every transition intent goes
    /// through. Succeeds (1 row) only when the prompt is still decidable,
    /// the nonce matches and is unused, and the TTL has not lapsed.
    /// Replays and losers of the reply/timeout race observe 0 rows.
    pub fn decide_prompt(
        &self,
        prompt_id: Uuid,
        session_id: Uuid,
        nonce: &str,
        new_status: PromptStatus,
        responder: Option<&str>,
        now_us: u64,
    ) -> anyhow::Result<u64> {
        let changed = self.conn.lock().execute(
            &format!(
                "UPDATE prompts
                 SET status = ?4, responder = ?5, decided_at_us = ?6, nonce_used = 1
                 WHERE prompt_id = ?1 AND session_id = ?2 AND nonce = ?3
                   AND nonce_used = 0 AND status IN {DECIDABLE} AND expires_at_us > ?6"
            ),
            params![
                prompt_id.to_string(),
                session_id.to_string(),
                nonce,
                new_status.as_str(),
                responder,
                now_us as i64,
            ],
        )?;
        Ok(changed as u64)
    }

    /// Injection happened: reply_received/expired → injected.
    pub fn mark_injected(&self, prompt_id: Uuid, now_us: u64) -> anyhow::Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE prompts SET status = 'injected', decided_at_us = COALESCE(decided_at_us, ?2)
             WHERE prompt_id = ?1 AND status IN ('reply_received','expired')",
            params![prompt_id.to_string(), now_us as i64],
        )?;
        Ok(changed == 1)
    }

    /// Echo window elapsed: injected → resolved.
    pub fn mark_resolved(&self, prompt_id: Uuid) -> anyhow::Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE prompts SET status = 'resolved'
             WHERE prompt_id = ?1 AND status = 'injected'",
            params![prompt_id.to_string()],
        )?;
        Ok(changed == 1)
    }

    /// Child died with prompts still open: every non-terminal prompt of the
    /// session fails.
    pub fn fail_open_prompts(&self, session_id: Uuid) -> anyhow::Result<u64> {
        let changed = self.conn.lock().execute(
            "UPDATE prompts SET status = 'failed'
             WHERE session_id = ?1
               AND status IN ('created','routed','awaiting_reply','reply_received','injected')",
            params![session_id.to_string()],
        )?;
        Ok(changed as u64)
    }

    /// Sweep prompts whose TTL lapsed: routed/awaiting_reply → expired.
    /// Returns the expired records so the caller can inject safe defaults.
    pub fn expire_stale(&self, now_us: u64) -> anyhow::Result<Vec<PromptEvent>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT prompt_id FROM prompts
                 WHERE status IN {DECIDABLE} AND nonce_used = 0 AND expires_at_us <= ?1"
            ))?;
            let rows = stmt.query_map(params![now_us as i64], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut expired = Vec::with_capacity(ids.len());
        for id in ids {
            let changed = tx.execute(
                &format!(
                    "UPDATE prompts SET status = 'expired', nonce_used = 1, decided_at_us = ?2
                     WHERE prompt_id = ?1 AND status IN {DECIDABLE}
                       AND nonce_used = 0 AND expires_at_us <= ?2"
                ),
                params![id, now_us as i64],
            )?;
            if changed == 1 {
                if let Some(prompt) = fetch_prompt(&tx, &id)? {
                    expired.push(prompt);
                }
            }
        }
        tx.commit()?;
        Ok(expired)
    }

    /// Prompts stuck in `created` (the escalation send failed) with an
    /// unexpired TTL, for the router's retry pass.
    pub fn unrouted(&self, now_us: u64) -> anyhow::Result<Vec<PromptEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROMPT_COLS} FROM prompts
             WHERE status = 'created' AND expires_at_us > ?1
             ORDER BY created_at_us"
        ))?;
        let rows = stmt.query_map(params![now_us as i64], row_to_prompt)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Startup recovery: every prompt still awaiting a decision with an
    /// unexpired TTL.
    pub fn reload_pending(&self, now_us: u64) -> anyhow::Result<Vec<PromptEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROMPT_COLS} FROM prompts
             WHERE status IN {DECIDABLE} AND expires_at_us > ?1
             ORDER BY created_at_us"
        ))?;
        let rows = stmt.query_map(params![now_us as i64], row_to_prompt)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_prompt(&self, prompt_id: Uuid) -> anyhow::Result<Option<PromptEvent>> {
        let conn = self.conn.lock();
        Ok(fetch_prompt(&conn, &prompt_id.to_string())?)
    }

    pub fn prompt_status(&self, prompt_id: Uuid) -> anyhow::Result<Option<PromptStatus>> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM prompts WHERE prompt_id = ?1",
                params![prompt_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.and_then(|s| PromptStatus::parse(&s)))
    }

    /// Resolve the 8-hex-char short form of a prompt id. More than one hit
    /// means the short form is ambiguous; the caller treats that as an
    /// invalid callback.
    pub fn find_by_short_id(&self, short_id: &str) -> anyhow::Result<Vec<PromptEvent>> {
        if short_id.len() != 8 || !short_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(vec![]);
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROMPT_COLS} FROM prompts WHERE prompt_id LIKE ?1"
        ))?;
        let pattern = format!("{short_id}%");
        let rows = stmt.query_map(params![pattern], row_to_prompt)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// All free-text prompts currently awaiting a reply, across sessions.
    pub fn pending_free_text(&self) -> anyhow::Result<Vec<PromptEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROMPT_COLS} FROM prompts
             WHERE status = 'awaiting_reply' AND kind = 'free_text'
             ORDER BY created_at_us"
        ))?;
        let rows = stmt.query_map([], row_to_prompt)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ----- replies ---------------------------------------------------------

    pub fn insert_reply(&self, reply: &Reply) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "INSERT INTO replies (reply_id, prompt_id, session_id, raw_value,
                                  normalised_value, source, responder, injected_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reply.reply_id.to_string(),
                reply.prompt_id.to_string(),
                reply.session_id.to_string(),
                reply.raw_value,
                reply.normalised_value,
                reply.source.as_str(),
                reply.responder,
                reply.injected_at_us.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    pub fn mark_reply_injected(&self, prompt_id: Uuid, now_us: u64) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE replies SET injected_at_us = ?2
             WHERE prompt_id = ?1 AND injected_at_us IS NULL",
            params![prompt_id.to_string(), now_us as i64],
        )?;
        Ok(())
    }

    pub fn reply_for_prompt(&self, prompt_id: Uuid) -> anyhow::Result<Option<Reply>> {
        let conn = self.conn.lock();
        let reply = conn
            .query_row(
                "SELECT reply_id, prompt_id, session_id, raw_value, normalised_value,
                        source, responder, injected_at_us
                 FROM replies WHERE prompt_id = ?1",
                params![prompt_id.to_string()],
                row_to_reply,
            )
            .optional()?;
        Ok(reply)
    }

    // ----- audit mirror ----------------------------------------------------

    pub fn insert_audit_row(
        &self,
        seq: u64,
        ts_us: u64,
        event: &str,
        session_id: Option<Uuid>,
        prompt_id: Option<Uuid>,
        payload_json: &str,
        hash: &str,
    ) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO audit_events (seq, ts_us, event, session_id, prompt_id, payload, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                seq as i64,
                ts_us as i64,
                event,
                session_id.map(|u| u.to_string()),
                prompt_id.map(|u| u.to_string()),
                payload_json,
                hash,
            ],
        )?;
        Ok(())
    }
}

const PROMPT_COLS: &str = "prompt_id, session_id, kind, confidence, excerpt, choices,
    max_length, allowed_choices, nonce, safe_default, status, idempotency_key,
    channel_message_id, responder, created_at_us, expires_at_us";

fn fetch_prompt(conn: &Connection, prompt_id: &str) -> rusqlite::Result<Option<PromptEvent>> {
    conn.query_row(
        &format!("SELECT {PROMPT_COLS} FROM prompts WHERE prompt_id = ?1"),
        params![prompt_id],
        row_to_prompt,
    )
    .optional()
}

fn bad_column(msg: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(msg.to_owned()),
    )
}

fn parse_uuid(s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|_| bad_column("malformed uuid"))
}

fn row_to_prompt(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptEvent> {
    let choices: String = row.get(5)?;
    let choices: Vec<Choice> =
        serde_json::from_str(&choices).map_err(|_| bad_column("malformed choices"))?;
    let allowed: Option<String> = row.get(7)?;
    let allowed_choices = match allowed {
        Some(raw) => {
            Some(serde_json::from_str(&raw).map_err(|_| bad_column("malformed allowed_choices"))?)
        }
        None => None,
    };
    let kind: String = row.get(2)?;
    let confidence: String = row.get(3)?;
    let status: String = row.get(10)?;
    Ok(PromptEvent {
        prompt_id: parse_uuid(row.get(0)?)?,
        session_id: parse_uuid(row.get(1)?)?,
        kind: PromptType::parse(&kind).ok_or_else(|| bad_column("unknown prompt kind"))?,
        confidence: Confidence::parse(&confidence)
            .ok_or_else(|| bad_column("unknown confidence"))?,
        excerpt: row.get(4)?,
        choices,
        constraints: Constraints {
            max_length: row.get::<_, Option<i64>>(6)?.map(|v| v as usize),
            allowed_choices,
        },
        nonce: row.get(8)?,
        safe_default: row.get(9)?,
        status: PromptStatus::parse(&status).ok_or_else(|| bad_column("unknown status"))?,
        idempotency_key: row.get(11)?,
        channel_message_id: row.get(12)?,
        responder: row.get(13)?,
        created_at_us: row.get::<_, i64>(14)? as u64,
        expires_at_us: row.get::<_, i64>(15)? as u64,
    })
}

fn row_to_reply(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reply> {
    let source: String = row.get(5)?;
    Ok(Reply {
        reply_id: parse_uuid(row.get(0)?)?,
        prompt_id: parse_uuid(row.get(1)?)?,
        session_id: parse_uuid(row.get(2)?)?,
        raw_value: row.get(3)?,
        normalised_value: row.get(4)?,
        source: crate::prompt::ReplySource::parse(&source)
            .ok_or_else(|| bad_column("unknown reply source"))?,
        responder: row.get(6)?,
        injected_at_us: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(5)?;
    Ok(SessionRecord {
        session_id: parse_uuid(row.get(0)?)?,
        tool: row.get(1)?,
        cwd: row.get(2)?,
        label: row.get(3)?,
        child_pid: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
        status: SessionStatus::parse(&status).ok_or_else(|| bad_column("unknown status"))?,
        started_at_us: row.get::<_, i64>(6)? as u64,
        ended_at_us: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        exit_code: row.get::<_, Option<i64>>(8)?.map(|v| v as i32),
    })
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
