// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::prompt::{Confidence, PromptStatus, PromptType, Reply, ReplySource};
use crate::store::Store;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        cols: 120,
        rows: 40,
        max_buffer_bytes: 4096,
        ttl: Duration::from_secs(300),
        stuck_timeout: Duration::from_secs(2),
        echo_suppress: Duration::from_millis(500),
        inject_settle: Duration::from_millis(100),
        injection_timeout: Duration::from_secs(5),
        task_timeout: Duration::from_secs(10),
        free_text_max: 200,
        forward_output: false,
        relay_stdin: false,
    }
}

struct Harness {
    store: Arc<Store>,
    audit: Arc<crate::audit::Audit>,
    info: SessionInfo,
    prompt_rx: mpsc::Receiver<crate::prompt::PromptEvent>,
    injection_tx: mpsc::Sender<Injection>,
    _dir: tempfile::TempDir,
}

/// Wire a supervisor around a scripted fake backend.
fn harness(
    backend_output_rx: mpsc::Receiver<Bytes>,
    backend_input_tx: mpsc::Sender<Bytes>,
    handle: tokio::task::JoinHandle<anyhow::Result<ExitStatus>>,
    shutdown: CancellationToken,
) -> (Harness, tokio::task::JoinHandle<anyhow::Result<SessionOutcome>>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let audit = Arc::new(
        crate::audit::Audit::open(&dir.path().join("audit.log"), None).expect("audit"),
    );
    let info = SessionInfo {
        session_id: Uuid::new_v4(),
        tool: "claude".into(),
        cwd: "/tmp/repo".into(),
        label: None,
    };
    store
        .create_session(info.session_id, &info.tool, &info.cwd, None, crate::prompt::now_us())
        .expect("session row");

    let (prompt_tx, prompt_rx) = mpsc::channel(16);
    let (injection_tx, injection_rx) = mpsc::channel(16);
    let tail = Arc::new(parking_lot::Mutex::new(String::new()));

    let deps = SessionDeps {
        store: Arc::clone(&store),
        audit: Arc::clone(&audit),
        prompt_tx,
        injection_rx,
        tail,
    };
    let backend = BackendIo {
        output_rx: backend_output_rx,
        input_tx: backend_input_tx,
        handle,
        controls: None,
    };

    let config = test_config();
    let session_info = info.clone();
    let task = tokio::spawn(async move {
        run_session(&config, &session_info, deps, backend, shutdown).await
    });

    (Harness { store, audit, info, prompt_rx, injection_tx, _dir: dir }, task)
}

#[tokio::test(start_paused = true)]
async fn partial_line_prompt_is_detected_and_answered() {
    let (output_tx, output_rx) = mpsc::channel::<Bytes>(16);
    let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(16);
    let (echo_tx, echo_rx) = tokio::sync::oneshot::channel::<Bytes>();

    // Fake child: prints a partial-line prompt, waits for input, exits 0.
    let child_output = output_tx.clone();
    let handle = tokio::spawn(async move {
        child_output
            .send(Bytes::from_static(b"Do you want to continue? (y/n)"))
            .await
            .ok();
        let answer = input_rx.recv().await.unwrap_or_default();
        let _ = echo_tx.send(answer);
        drop(child_output);
        Ok(ExitStatus { code: Some(0), signal: None })
    });
    drop(output_tx);

    let shutdown = CancellationToken::new();
    let (mut h, session) = harness(output_rx, input_tx, handle, shutdown);

    // The supervisor classifies the pause within the stall window.
    let event = h.prompt_rx.recv().await.expect("prompt event");
    assert_eq!(event.kind, PromptType::YesNo);
    assert!(event.confidence >= Confidence::Medium);
    assert!(event.excerpt.contains("(y/n)"));

    // Emulate the router: persist, route, decide, enqueue the injection.
    assert!(h.store.insert_prompt(&event).expect("insert"));
    h.store
        .advance_status(event.prompt_id, &[PromptStatus::Created], PromptStatus::Routed)
        .expect("route");
    h.store
        .advance_status(event.prompt_id, &[PromptStatus::Routed], PromptStatus::AwaitingReply)
        .expect("await");
    let rows = h
        .store
        .decide_prompt(
            event.prompt_id,
            h.info.session_id,
            &event.nonce,
            PromptStatus::ReplyReceived,
            Some("telegram:42"),
            crate::prompt::now_us(),
        )
        .expect("decide");
    assert_eq!(rows, 1);
    let reply = Reply::new(&event, "y", b"y\r".to_vec(), ReplySource::Human, None);
    h.store.insert_reply(&reply).expect("reply");
    h.injection_tx
        .send(Injection { prompt_id: event.prompt_id, bytes: b"y\r".to_vec() })
        .await
        .expect("enqueue");

    // Exactly the decided bytes reach the child, exactly once.
    let written = echo_rx.await.expect("child got input");
    assert_eq!(&written[..], b"y\r");

    let outcome = session.await.expect("join").expect("run");
    assert_eq!(outcome.status.code, Some(0));
    assert_eq!(outcome.session_status, crate::prompt::SessionStatus::Completed);

    // Echo window elapsed inside the session: prompt fully resolved.
    assert_eq!(
        h.store.prompt_status(event.prompt_id).expect("status"),
        Some(PromptStatus::Resolved)
    );
    let stored_reply = h.store.reply_for_prompt(event.prompt_id).expect("get").expect("reply");
    assert!(stored_reply.injected_at_us.is_some());
    assert_eq!(h.audit.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn stall_without_pattern_emits_low_confidence_unknown() {
    let (output_tx, output_rx) = mpsc::channel::<Bytes>(16);
    let (input_tx, _input_rx) = mpsc::channel::<Bytes>(16);
    let shutdown = CancellationToken::new();
    let child_shutdown = shutdown.clone();

    let child_output = output_tx.clone();
    let handle = tokio::spawn(async move {
        child_output.send(Bytes::from_static(b"compiling everything...")).await.ok();
        child_shutdown.cancelled().await;
        drop(child_output);
        Ok(ExitStatus { code: Some(0), signal: None })
    });
    drop(output_tx);

    let (mut h, session) = harness(output_rx, input_tx, handle, shutdown.clone());

    let event = h.prompt_rx.recv().await.expect("prompt event");
    assert_eq!(event.kind, PromptType::Unknown);
    assert_eq!(event.confidence, Confidence::Low);

    shutdown.cancel();
    let outcome = session.await.expect("join").expect("run");
    assert_eq!(outcome.session_status, crate::prompt::SessionStatus::Terminated);
}

#[tokio::test(start_paused = true)]
async fn no_event_during_echo_suppression_window() {
    let (output_tx, output_rx) = mpsc::channel::<Bytes>(16);
    let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(16);
    let shutdown = CancellationToken::new();
    let child_shutdown = shutdown.clone();

    let child_output = output_tx.clone();
    let handle = tokio::spawn(async move {
        child_output.send(Bytes::from_static(b"Continue? (y/n)")).await.ok();
        // Echo the injected bytes straight back, the way a PTY does.
        if let Some(answer) = input_rx.recv().await {
            let mut echoed = b"Continue? (y/n)".to_vec();
            echoed.extend_from_slice(&answer);
            child_output.send(Bytes::from(echoed)).await.ok();
        }
        child_shutdown.cancelled().await;
        drop(child_output);
        Ok(ExitStatus { code: Some(0), signal: None })
    });
    drop(output_tx);

    let (mut h, session) = harness(output_rx, input_tx, handle, shutdown.clone());

    let event = h.prompt_rx.recv().await.expect("first event");
    assert!(h.store.insert_prompt(&event).expect("insert"));
    h.store
        .advance_status(event.prompt_id, &[PromptStatus::Created], PromptStatus::Routed)
        .expect("route");
    h.store
        .advance_status(event.prompt_id, &[PromptStatus::Routed], PromptStatus::AwaitingReply)
        .expect("await");
    h.store
        .decide_prompt(
            event.prompt_id,
            h.info.session_id,
            &event.nonce,
            PromptStatus::ReplyReceived,
            None,
            crate::prompt::now_us(),
        )
        .expect("decide");
    h.injection_tx
        .send(Injection { prompt_id: event.prompt_id, bytes: b"y\r".to_vec() })
        .await
        .expect("enqueue");

    // The echoed prompt text lands inside the suppression window. If the
    // detector saw it, a second (spurious) event would arrive here.
    let quiet =
        tokio::time::timeout(Duration::from_secs(120), h.prompt_rx.recv()).await;
    match quiet {
        Err(_elapsed) => {} // nothing detected: suppression held
        Ok(Some(second)) => {
            panic!("echoed injection was reclassified as {:?}", second.kind)
        }
        Ok(None) => {}
    }

    shutdown.cancel();
    let _ = session.await.expect("join");
}

#[tokio::test(start_paused = true)]
async fn empty_safe_default_resolves_without_pty_write() {
    let (output_tx, output_rx) = mpsc::channel::<Bytes>(16);
    let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(16);
    let shutdown = CancellationToken::new();
    let child_shutdown = shutdown.clone();

    let child_output = output_tx.clone();
    let handle = tokio::spawn(async move {
        child_output.send(Bytes::from_static(b"thinking...")).await.ok();
        tokio::select! {
            _ = child_shutdown.cancelled() => {}
            _ = input_rx.recv() => panic!("no bytes may reach the child"),
        }
        drop(child_output);
        Ok(ExitStatus { code: Some(0), signal: None })
    });
    drop(output_tx);

    let (mut h, session) = harness(output_rx, input_tx, handle, shutdown.clone());

    // Low-confidence unknown prompt, expired with an empty safe default.
    let event = h.prompt_rx.recv().await.expect("event");
    assert_eq!(event.kind, PromptType::Unknown);
    assert!(h.store.insert_prompt(&event).expect("insert"));
    h.store
        .advance_status(event.prompt_id, &[PromptStatus::Created], PromptStatus::Routed)
        .expect("route");
    h.store
        .advance_status(event.prompt_id, &[PromptStatus::Routed], PromptStatus::AwaitingReply)
        .expect("await");
    let expired = h.store.expire_stale(event.expires_at_us).expect("expire");
    assert_eq!(expired.len(), 1);

    h.injection_tx
        .send(Injection { prompt_id: event.prompt_id, bytes: vec![] })
        .await
        .expect("enqueue");

    // Give the supervisor time to process and resolve.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        h.store.prompt_status(event.prompt_id).expect("status"),
        Some(PromptStatus::Resolved)
    );

    shutdown.cancel();
    let _ = session.await.expect("join");
}

#[tokio::test(start_paused = true)]
async fn open_prompts_fail_when_child_dies() {
    let (output_tx, output_rx) = mpsc::channel::<Bytes>(16);
    let (input_tx, _input_rx) = mpsc::channel::<Bytes>(16);

    let child_output = output_tx.clone();
    let handle = tokio::spawn(async move {
        child_output.send(Bytes::from_static(b"Continue? (y/n)")).await.ok();
        // Child crashes while the prompt is still open.
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(child_output);
        Ok(ExitStatus { code: Some(1), signal: None })
    });
    drop(output_tx);

    let shutdown = CancellationToken::new();
    let (mut h, session) = harness(output_rx, input_tx, handle, shutdown);

    let event = h.prompt_rx.recv().await.expect("event");
    assert!(h.store.insert_prompt(&event).expect("insert"));
    h.store
        .advance_status(event.prompt_id, &[PromptStatus::Created], PromptStatus::Routed)
        .expect("route");

    let outcome = session.await.expect("join").expect("run");
    assert_eq!(outcome.session_status, crate::prompt::SessionStatus::Crashed);
    assert_eq!(
        h.store.prompt_status(event.prompt_id).expect("status"),
        Some(PromptStatus::Failed)
    );
}
