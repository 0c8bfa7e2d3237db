// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only hash-chained audit log.
//!
//! One canonical-JSON record per line. Each record's `hash` covers the
//! serialized record with the `hash` field absent; `prev_hash` is the
//! predecessor's hash, or `"genesis"` for the first record of the first
//! segment. Rotation moves whole segments aside and carries the last hash
//! as the anchor of the new segment, so archived segments verify
//! end-to-end in order.
//!
//! A failed file write never blocks the caller — the underlying state
//! write is authoritative. Failed lines queue in memory and are replayed
//! in front of the next append.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::prompt::now_us;
use crate::store::Store;

/// `prev_hash` of the very first record.
pub const GENESIS: &str = "genesis";

/// Rotate when the active segment exceeds this size.
const MAX_SEGMENT_BYTES: u64 = 10 * 1024 * 1024;

/// How many rotated segments to keep (`audit.log.1` is the newest archive).
const MAX_ARCHIVES: u32 = 8;

/// A single audit record as serialized to the log.
///
/// Field order is the canonical serialization order; the payload map is a
/// `BTreeMap` so its keys are always sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub ts_us: u64,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<Uuid>,
    pub payload: BTreeMap<String, serde_json::Value>,
    pub prev_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

impl AuditRecord {
    /// Hash over the canonical serialization with the `hash` field absent.
    pub fn compute_hash(&self) -> String {
        let mut unhashed = self.clone();
        unhashed.hash = String::new();
        let canonical = serde_json::to_string(&unhashed).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("sha256:{}", hex::encode(digest))
    }
}

/// Audit event vocabulary. Each variant knows its wire name and payload.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    SessionStarted { session_id: Uuid, tool: String, cwd: String },
    SessionEnded { session_id: Uuid, status: String, exit_code: Option<i32> },
    PromptDetected { session_id: Uuid, prompt_id: Uuid, kind: String, confidence: String },
    PromptRouted { session_id: Uuid, prompt_id: Uuid, message_id: String },
    ReplyReceived { session_id: Uuid, prompt_id: Uuid, source: String, responder: Option<String> },
    ResponseInjected { session_id: Uuid, prompt_id: Uuid, bytes: usize },
    PromptExpired { session_id: Uuid, prompt_id: Uuid },
    PromptCanceled { session_id: Uuid, prompt_id: Uuid, reason: String },
    DuplicateCallbackIgnored { session_id: Uuid, prompt_id: Uuid, responder: String },
    LateReplyRejected { session_id: Uuid, prompt_id: Uuid, responder: String },
    InvalidCallback { session_id: Option<Uuid>, detail: String },
    ChannelTransportFailed { detail: String },
    DaemonRestarted { pending: usize },
    PolicyLoaded { name: String, content_hash: String, autonomy_mode: String },
    AutopilotDecided {
        session_id: Uuid,
        prompt_id: Uuid,
        rule_id: Option<String>,
        action: String,
        idempotency_key: String,
    },
    AutopilotPaused,
    AutopilotResumed,
}

impl AuditEvent {
    /// Wire name, ids, and payload map for this event.
    fn parts(&self) -> (&'static str, Option<Uuid>, Option<Uuid>, BTreeMap<String, serde_json::Value>) {
        use serde_json::json;
        let mut payload = BTreeMap::new();
        match self {
            Self::SessionStarted { session_id, tool, cwd } => {
                payload.insert("tool".into(), json!(tool));
                payload.insert("cwd".into(), json!(cwd));
                ("session_started", Some(*session_id), None, payload)
            }
            Self::SessionEnded { session_id, status, exit_code } => {
                payload.insert("status".into(), json!(status));
                payload.insert("exit_code".into(), json!(exit_code));
                ("session_ended", Some(*session_id), None, payload)
            }
            Self::PromptDetected { session_id, prompt_id, kind, confidence } => {
                payload.insert("kind".into(), json!(kind));
                payload.insert("confidence".into(), json!(confidence));
                ("prompt_detected", Some(*session_id), Some(*prompt_id), payload)
            }
            Self::PromptRouted { session_id, prompt_id, message_id } => {
                payload.insert("message_id".into(), json!(message_id));
                ("prompt_routed", Some(*session_id), Some(*prompt_id), payload)
            }
            Self::ReplyReceived { session_id, prompt_id, source, responder } => {
                payload.insert("source".into(), json!(source));
                payload.insert("responder".into(), json!(responder));
                ("reply_received", Some(*session_id), Some(*prompt_id), payload)
            }
            Self::ResponseInjected { session_id, prompt_id, bytes } => {
                payload.insert("bytes".into(), json!(bytes));
                ("response_injected", Some(*session_id), Some(*prompt_id), payload)
            }
            Self::PromptExpired { session_id, prompt_id } => {
                ("prompt_expired", Some(*session_id), Some(*prompt_id), payload)
            }
            Self::PromptCanceled { session_id, prompt_id, reason } => {
                payload.insert("reason".into(), json!(reason));
                ("prompt_canceled", Some(*session_id), Some(*prompt_id), payload)
            }
            Self::DuplicateCallbackIgnored { session_id, prompt_id, responder } => {
                payload.insert("responder".into(), json!(responder));
                ("duplicate_callback_ignored", Some(*session_id), Some(*prompt_id), payload)
            }
            Self::LateReplyRejected { session_id, prompt_id, responder } => {
                payload.insert("responder".into(), json!(responder));
                ("late_reply_rejected", Some(*session_id), Some(*prompt_id), payload)
            }
            Self::InvalidCallback { session_id, detail } => {
                payload.insert("detail".into(), json!(detail));
                ("invalid_callback", *session_id, None, payload)
            }
            Self::ChannelTransportFailed { detail } => {
                payload.insert("detail".into(), json!(detail));
                ("channel_transport_failed", None, None, payload)
            }
            Self::DaemonRestarted { pending } => {
                payload.insert("pending".into(), json!(pending));
                ("daemon_restarted", None, None, payload)
            }
            Self::PolicyLoaded { name, content_hash, autonomy_mode } => {
                payload.insert("name".into(), json!(name));
                payload.insert("content_hash".into(), json!(content_hash));
                payload.insert("autonomy_mode".into(), json!(autonomy_mode));
                ("policy_loaded", None, None, payload)
            }
            Self::AutopilotDecided { session_id, prompt_id, rule_id, action, idempotency_key } => {
                payload.insert("rule_id".into(), json!(rule_id));
                payload.insert("action".into(), json!(action));
                payload.insert("idempotency_key".into(), json!(idempotency_key));
                ("autopilot_decided", Some(*session_id), Some(*prompt_id), payload)
            }
            Self::AutopilotPaused => ("autopilot_paused", None, None, payload),
            Self::AutopilotResumed => ("autopilot_resumed", None, None, payload),
        }
    }
}

struct Inner {
    path: PathBuf,
    seq: u64,
    prev_hash: String,
    /// Lines that failed to reach the file, replayed before the next append.
    pending: VecDeque<String>,
    store: Option<Arc<Store>>,
}

/// Shared audit writer handle.
pub struct Audit {
    inner: Mutex<Inner>,
}

impl Audit {
    /// Open the audit log, recovering `seq` and the chain anchor from the
    /// tail of an existing segment.
    pub fn open(path: &Path, store: Option<Arc<Store>>) -> anyhow::Result<Self> {
        let (seq, prev_hash) = match read_tail(path)? {
            Some(last) => (last.seq, last.hash),
            None => (0, GENESIS.to_owned()),
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                path: path.to_owned(),
                seq,
                prev_hash,
                pending: VecDeque::new(),
                store,
            }),
        })
    }

    /// Append one event. Infallible from the caller's perspective: file
    /// trouble is logged and queued, never surfaced.
    pub fn record(&self, event: AuditEvent) -> u64 {
        let (event_name, session_id, prompt_id, payload) = event.parts();
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let mut record = AuditRecord {
            seq: inner.seq,
            ts_us: now_us(),
            event: event_name.to_owned(),
            session_id,
            prompt_id,
            payload,
            prev_hash: inner.prev_hash.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash();
        inner.prev_hash = record.hash.clone();

        if let Some(ref store) = inner.store {
            let payload_json = serde_json::to_string(&record.payload).unwrap_or_default();
            if let Err(e) = store.insert_audit_row(
                record.seq,
                record.ts_us,
                &record.event,
                record.session_id,
                record.prompt_id,
                &payload_json,
                &record.hash,
            ) {
                warn!("audit mirror write failed: {e:#}");
            }
        }

        let line = serde_json::to_string(&record).unwrap_or_default();
        let seq = record.seq;
        inner.pending.push_back(line);
        flush_pending(&mut inner);
        maybe_rotate(&mut inner);
        seq
    }

    /// Number of lines still waiting to reach the file.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Retry queued lines without appending a new event.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        flush_pending(&mut inner);
    }
}

fn flush_pending(inner: &mut Inner) {
    while let Some(line) = inner.pending.front() {
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inner.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        match written {
            Ok(()) => {
                inner.pending.pop_front();
            }
            Err(e) => {
                warn!("audit write failed ({} queued): {e}", inner.pending.len());
                break;
            }
        }
    }
}

fn maybe_rotate(inner: &mut Inner) {
    let Ok(meta) = std::fs::metadata(&inner.path) else {
        return;
    };
    if meta.len() < MAX_SEGMENT_BYTES {
        return;
    }
    // Shift audit.log.N → audit.log.N+1, oldest falls off.
    let archive = |n: u32| PathBuf::from(format!("{}.{n}", inner.path.display()));
    let _ = std::fs::remove_file(archive(MAX_ARCHIVES));
    for n in (1..MAX_ARCHIVES).rev() {
        let _ = std::fs::rename(archive(n), archive(n + 1));
    }
    if let Err(e) = std::fs::rename(&inner.path, archive(1)) {
        warn!("audit rotation failed: {e}");
    }
    // The in-memory prev_hash carries the anchor into the new segment.
}

/// Read the last record of a segment, if the file exists and is non-empty.
fn read_tail(path: &Path) -> anyhow::Result<Option<AuditRecord>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let last = contents.lines().rev().find(|l| !l.trim().is_empty());
    match last {
        Some(line) => Ok(Some(serde_json::from_str(line)?)),
        None => Ok(None),
    }
}

/// Outcome of verifying one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// All `count` records verified; `last_hash` anchors the next segment.
    Valid { count: u64, last_hash: String },
    /// First discrepancy at this seq; verification stopped there.
    Broken { seq: u64, detail: String },
}

/// Verify a segment against an expected anchor (`GENESIS` for the first).
pub fn verify_segment(path: &Path, anchor: &str) -> anyhow::Result<VerifyOutcome> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    let mut prev_hash = anchor.to_owned();
    let mut count = 0u64;
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        let record: AuditRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                return Ok(VerifyOutcome::Broken {
                    seq: count + 1,
                    detail: format!("unparseable record: {e}"),
                });
            }
        };
        if record.prev_hash != prev_hash {
            return Ok(VerifyOutcome::Broken {
                seq: record.seq,
                detail: "prev_hash does not match predecessor".into(),
            });
        }
        let expected = record.compute_hash();
        if record.hash != expected {
            return Ok(VerifyOutcome::Broken {
                seq: record.seq,
                detail: "hash does not match record contents".into(),
            });
        }
        prev_hash = record.hash;
        count += 1;
    }
    Ok(VerifyOutcome::Valid { count, last_hash: prev_hash })
}

/// Verify archived segments plus the active one, oldest first.
pub fn verify_all(path: &Path) -> anyhow::Result<VerifyOutcome> {
    let mut segments: Vec<PathBuf> = Vec::new();
    for n in (1..=MAX_ARCHIVES).rev() {
        let archived = PathBuf::from(format!("{}.{n}", path.display()));
        if archived.exists() {
            segments.push(archived);
        }
    }
    segments.push(path.to_owned());

    let mut anchor = GENESIS.to_owned();
    let mut total = 0u64;
    for segment in segments {
        if !segment.exists() {
            continue;
        }
        match verify_segment(&segment, &anchor)? {
            VerifyOutcome::Valid { count, last_hash } => {
                total += count;
                anchor = last_hash;
            }
            broken @ VerifyOutcome::Broken { .. } => return Ok(broken),
        }
    }
    Ok(VerifyOutcome::Valid { count: total, last_hash: anchor })
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
