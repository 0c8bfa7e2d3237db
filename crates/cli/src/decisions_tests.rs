// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::prompt::now_us;

fn entry(key: &str) -> DecisionEntry {
    DecisionEntry {
        ts_us: now_us(),
        session_id: Uuid::new_v4(),
        prompt_id: Uuid::new_v4(),
        rule_id: Some("allow-cargo".into()),
        action: "auto_reply".into(),
        value: Some("y".into()),
        autonomy_mode: "full".into(),
        policy_hash: "sha256:abc".into(),
        idempotency_key: key.to_owned(),
        explain: vec!["rule allow-cargo matched".into()],
    }
}

#[test]
fn appends_jsonl_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("autopilot_decisions.jsonl");
    let trace = DecisionTrace::open(&path);

    assert!(trace.append(&entry("k1")));
    assert!(trace.append(&entry("k2")));

    let contents = std::fs::read_to_string(&path).expect("read");
    let lines: Vec<DecisionEntry> = contents
        .lines()
        .map(|l| serde_json::from_str(l).expect("parse"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].idempotency_key, "k1");
    assert_eq!(lines[0].rule_id.as_deref(), Some("allow-cargo"));
}

#[test]
fn dedups_on_idempotency_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("autopilot_decisions.jsonl");
    let trace = DecisionTrace::open(&path);

    assert!(trace.append(&entry("same")));
    assert!(!trace.append(&entry("same")));

    let contents = std::fs::read_to_string(&path).expect("read");
    assert_eq!(contents.lines().count(), 1);
}

#[test]
fn dedup_window_is_bounded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("autopilot_decisions.jsonl");
    let trace = DecisionTrace::open(&path);

    for i in 0..(DEDUP_WINDOW + 10) {
        assert!(trace.append(&entry(&format!("k{i}"))));
    }
    // The oldest key fell out of the window, so it is accepted again.
    assert!(trace.append(&entry("k0")));
}
