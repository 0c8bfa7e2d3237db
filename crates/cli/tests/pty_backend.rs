// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end checks against a real pseudoterminal.

use atlasbridge::pty::spawn::NativePty;
use bytes::Bytes;
use tokio::sync::mpsc;

#[tokio::test]
async fn spawn_and_capture() {
    let (output_tx, mut output_rx) = mpsc::channel(64);
    let (_input_tx, input_rx) = mpsc::channel::<Bytes>(64);

    let pty = NativePty::spawn(&["echo".into(), "hello".into()], &[], 80, 24)
        .expect("spawn failed");
    assert!(pty.child_pid() > 0);

    let status = pty.run(output_tx, input_rx).await.expect("run failed");
    assert_eq!(status.code, Some(0));
    assert_eq!(status.signal, None);

    let mut output = Vec::new();
    while let Ok(chunk) = output_rx.try_recv() {
        output.extend_from_slice(&chunk);
    }
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("hello"), "expected 'hello' in output: {text:?}");
}

#[tokio::test]
async fn input_round_trips_through_the_master() {
    let (output_tx, mut output_rx) = mpsc::channel(64);
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(64);

    let pty = NativePty::spawn(&["/bin/cat".into()], &[], 80, 24).expect("spawn failed");
    let handle = tokio::spawn(pty.run(output_tx, input_rx));

    // Write a line, then Ctrl-D on an empty line to signal EOF.
    input_tx.send(Bytes::from_static(b"ping\n")).await.expect("send failed");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    input_tx.send(Bytes::from_static(b"\x04")).await.expect("send eof failed");
    drop(input_tx);

    let status = handle.await.expect("join").expect("run");
    assert_eq!(status.code, Some(0));

    let mut output = Vec::new();
    while let Ok(chunk) = output_rx.try_recv() {
        output.extend_from_slice(&chunk);
    }
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("ping"), "expected 'ping' in output: {text:?}");
}

#[tokio::test]
async fn child_environment_is_marked() {
    let (output_tx, mut output_rx) = mpsc::channel(64);
    let (_input_tx, input_rx) = mpsc::channel::<Bytes>(64);

    let pty = NativePty::spawn(
        &["/bin/sh".into(), "-c".into(), "echo marker=$ATLASBRIDGE:$AB_EXTRA".into()],
        &[("AB_EXTRA".into(), "42".into())],
        80,
        24,
    )
    .expect("spawn failed");

    let status = pty.run(output_tx, input_rx).await.expect("run failed");
    assert_eq!(status.code, Some(0));

    let mut output = Vec::new();
    while let Ok(chunk) = output_rx.try_recv() {
        output.extend_from_slice(&chunk);
    }
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("marker=1:42"), "env not propagated: {text:?}");
}

#[tokio::test]
async fn resize_and_signal_controls() {
    let pty = NativePty::spawn(
        &["/bin/sh".into(), "-c".into(), "sleep 5".into()],
        &[],
        80,
        24,
    )
    .expect("spawn failed");
    let controls = pty.controls();

    controls.resize(120, 40).expect("resize failed");
    assert!(controls.alive());

    let (output_tx, _output_rx) = mpsc::channel(64);
    let (_input_tx, input_rx) = mpsc::channel::<Bytes>(64);
    let handle = tokio::spawn(pty.run(output_tx, input_rx));

    controls.signal(nix::sys::signal::Signal::SIGTERM).expect("signal failed");
    let status = handle.await.expect("join").expect("run");
    assert_eq!(status.signal, Some(nix::sys::signal::Signal::SIGTERM as i32));
}

#[tokio::test]
async fn nonzero_exit_code_is_reported() {
    let (output_tx, _output_rx) = mpsc::channel(64);
    let (_input_tx, input_rx) = mpsc::channel::<Bytes>(64);

    let pty = NativePty::spawn(&["/bin/sh".into(), "-c".into(), "exit 7".into()], &[], 80, 24)
        .expect("spawn failed");
    let status = pty.run(output_tx, input_rx).await.expect("run failed");
    assert_eq!(status.code, Some(7));
}
