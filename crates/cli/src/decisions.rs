// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only autopilot decision trace.
//!
//! One JSON line per policy decision, rotated by size. Entries are
//! deduplicated on the decision idempotency key so replayed evaluations
//! (restart recovery, duplicate detector windows) do not double-log.

use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Rotate when the trace exceeds this size.
const MAX_TRACE_BYTES: u64 = 10 * 1024 * 1024;

/// Archives kept after rotation.
const MAX_ARCHIVES: u32 = 3;

/// Recent idempotency keys remembered for dedup.
const DEDUP_WINDOW: usize = 1024;

/// One decision-trace entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub ts_us: u64,
    pub session_id: Uuid,
    pub prompt_id: Uuid,
    pub rule_id: Option<String>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub autonomy_mode: String,
    pub policy_hash: String,
    pub idempotency_key: String,
    pub explain: Vec<String>,
}

struct Inner {
    path: PathBuf,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

/// Shared decision-trace writer.
pub struct DecisionTrace {
    inner: Mutex<Inner>,
}

impl DecisionTrace {
    pub fn open(path: &Path) -> Self {
        Self {
            inner: Mutex::new(Inner {
                path: path.to_owned(),
                seen: HashSet::with_capacity(DEDUP_WINDOW),
                order: VecDeque::with_capacity(DEDUP_WINDOW),
            }),
        }
    }

    /// Append an entry unless its idempotency key was recently traced.
    /// Returns whether the entry was written.
    pub fn append(&self, entry: &DecisionEntry) -> bool {
        let mut inner = self.inner.lock();
        if inner.seen.contains(&entry.idempotency_key) {
            return false;
        }
        if inner.order.len() == DEDUP_WINDOW {
            if let Some(evicted) = inner.order.pop_front() {
                inner.seen.remove(&evicted);
            }
        }
        inner.seen.insert(entry.idempotency_key.clone());
        inner.order.push_back(entry.idempotency_key.clone());

        let Ok(line) = serde_json::to_string(entry) else {
            return false;
        };
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inner.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = written {
            warn!("decision trace write failed: {e}");
            return false;
        }
        maybe_rotate(&inner.path);
        true
    }
}

fn maybe_rotate(path: &Path) {
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    if meta.len() < MAX_TRACE_BYTES {
        return;
    }
    let archive = |n: u32| PathBuf::from(format!("{}.{n}", path.display()));
    let _ = std::fs::remove_file(archive(MAX_ARCHIVES));
    for n in (1..MAX_ARCHIVES).rev() {
        let _ = std::fs::rename(archive(n), archive(n + 1));
    }
    if let Err(e) = std::fs::rename(path, archive(1)) {
        warn!("decision trace rotation failed: {e}");
    }
}

#[cfg(test)]
#[path = "decisions_tests.rs"]
mod tests;
