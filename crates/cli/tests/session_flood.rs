// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Output-flood scenario: tens of thousands of lines followed by a
//! blocking prompt. Memory stays bounded by the rolling buffer and line
//! deque; the trailing prompt still classifies; the injection lands.

use std::sync::Arc;
use std::time::Duration;

use atlasbridge::audit::Audit;
use atlasbridge::prompt::{now_us, PromptStatus, PromptType, Reply, ReplySource};
use atlasbridge::session::{
    run_session, spawn_backend, Injection, SessionDeps, SessionInfo, SupervisorConfig,
};
use atlasbridge::store::Store;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn config() -> SupervisorConfig {
    SupervisorConfig {
        cols: 120,
        rows: 40,
        max_buffer_bytes: 4096,
        ttl: Duration::from_secs(300),
        stuck_timeout: Duration::from_millis(800),
        echo_suppress: Duration::from_millis(200),
        inject_settle: Duration::from_millis(50),
        injection_timeout: Duration::from_secs(5),
        task_timeout: Duration::from_secs(10),
        free_text_max: 200,
        forward_output: false,
        relay_stdin: false,
    }
}

#[tokio::test]
async fn flood_then_prompt_still_classifies_and_injects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let audit = Arc::new(Audit::open(&dir.path().join("audit.log"), None).expect("audit"));

    let session_id = Uuid::new_v4();
    store
        .create_session(session_id, "sh", "/tmp", Some("flood"), now_us())
        .expect("session row");

    let script = "seq 1 20000; printf 'Do you want to continue? (y/n)'; read answer; \
                  echo \"got:$answer\"; exit 0";
    let backend = spawn_backend(
        &["/bin/sh".into(), "-c".into(), script.into()],
        &[],
        120,
        40,
    )
    .expect("spawn");

    let (prompt_tx, mut prompt_rx) = mpsc::channel(16);
    let (injection_tx, injection_rx) = mpsc::channel(16);
    let tail = Arc::new(parking_lot::Mutex::new(String::new()));
    let info = SessionInfo {
        session_id,
        tool: "sh".into(),
        cwd: "/tmp".into(),
        label: Some("flood".into()),
    };

    let deps = SessionDeps {
        store: Arc::clone(&store),
        audit,
        prompt_tx,
        injection_rx,
        tail: Arc::clone(&tail),
    };
    let shutdown = CancellationToken::new();
    let supervisor_config = config();
    let supervisor_info = info.clone();
    let session = tokio::spawn(async move {
        run_session(&supervisor_config, &supervisor_info, deps, backend, shutdown).await
    });

    // The flood must not wedge detection: the trailing prompt arrives.
    let event = tokio::time::timeout(Duration::from_secs(30), prompt_rx.recv())
        .await
        .expect("prompt within deadline")
        .expect("prompt event");
    assert_eq!(event.kind, PromptType::YesNo);

    // Route and decide the way the router would.
    assert!(store.insert_prompt(&event).expect("insert"));
    store
        .advance_status(event.prompt_id, &[PromptStatus::Created], PromptStatus::Routed)
        .expect("route");
    store
        .advance_status(event.prompt_id, &[PromptStatus::Routed], PromptStatus::AwaitingReply)
        .expect("await");
    let rows = store
        .decide_prompt(
            event.prompt_id,
            session_id,
            &event.nonce,
            PromptStatus::ReplyReceived,
            Some("telegram:42"),
            now_us(),
        )
        .expect("decide");
    assert_eq!(rows, 1);
    store
        .insert_reply(&Reply::new(&event, "y", b"y\r".to_vec(), ReplySource::Human, None))
        .expect("reply");
    injection_tx
        .send(Injection { prompt_id: event.prompt_id, bytes: b"y\r".to_vec() })
        .await
        .expect("enqueue");

    let outcome = tokio::time::timeout(Duration::from_secs(30), session)
        .await
        .expect("session ends")
        .expect("join")
        .expect("run");
    assert_eq!(outcome.status.code, Some(0));

    // The prompt reached its terminal state before session end.
    assert_eq!(
        store.prompt_status(event.prompt_id).expect("status"),
        Some(PromptStatus::Resolved)
    );
    // The tail snapshot is bounded, not the whole flood.
    assert!(tail.lock().len() <= 800);
}
