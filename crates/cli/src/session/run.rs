// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The session supervisor select-loop.
//!
//! Four cooperative tasks share one loop and two helpers:
//!
//! - **reader** — backend output arm: forward raw bytes to the host
//!   terminal, feed the rolling buffer (unless inside the echo-suppression
//!   window), run the detector.
//! - **stdin relay** — separate task; each host keystroke chunk takes the
//!   injection gate before reaching the PTY, so it yields to injections.
//! - **watchdog** — periodic arm: stall detection, resolve timers,
//!   pending-prompt bookkeeping against the store, relay restarts.
//! - **injector** — delivery-queue arm: gate → write → settle →
//!   suppression window → buffer clear. The gate is released on every
//!   path; acquisition has a hard timeout that terminates the session
//!   rather than deadlocking it.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{Audit, AuditEvent};
use crate::detect::Detector;
use crate::error::Fault;
use crate::prompt::{now_us, PromptEvent, SessionStatus};
use crate::pty::spawn::{NativePty, PtyControls};
use crate::pty::ExitStatus;
use crate::ring::RollingBuffer;
use crate::store::Store;

use super::{Injection, SessionInfo, SessionOutcome};

/// How many times a dead stdin relay is restarted before the session
/// gives up.
const MAX_TASK_RESTARTS: u32 = 3;

/// Watchdog cadence.
const WATCHDOG_TICK: Duration = Duration::from_millis(250);

/// Tail snapshot size kept for the show-last-output affordance.
const TAIL_SNAPSHOT_BYTES: usize = 800;

/// Tunables for one session, resolved from config.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub cols: u16,
    pub rows: u16,
    pub max_buffer_bytes: usize,
    pub ttl: Duration,
    pub stuck_timeout: Duration,
    pub echo_suppress: Duration,
    pub inject_settle: Duration,
    pub injection_timeout: Duration,
    pub task_timeout: Duration,
    pub free_text_max: usize,
    /// Mirror child output to the host terminal (off under test).
    pub forward_output: bool,
    /// Relay host stdin to the child (off under test).
    pub relay_stdin: bool,
}

/// The supervisor's view of a running backend.
pub struct BackendIo {
    pub output_rx: mpsc::Receiver<Bytes>,
    pub input_tx: mpsc::Sender<Bytes>,
    pub handle: JoinHandle<anyhow::Result<ExitStatus>>,
    pub controls: Option<PtyControls>,
}

/// Shared services the supervisor writes through.
pub struct SessionDeps {
    pub store: Arc<Store>,
    pub audit: Arc<Audit>,
    pub prompt_tx: mpsc::Sender<PromptEvent>,
    pub injection_rx: mpsc::Receiver<Injection>,
    pub tail: Arc<Mutex<String>>,
}

/// Spawn the child on a PTY and wire up its pump task.
pub fn spawn_backend(
    argv: &[String],
    env: &[(String, String)],
    cols: u16,
    rows: u16,
) -> anyhow::Result<BackendIo> {
    let pty = NativePty::spawn(argv, env, cols, rows)?;
    let controls = pty.controls();
    let (output_tx, output_rx) = mpsc::channel(256);
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);
    let handle = tokio::spawn(pty.run(output_tx, input_rx));
    Ok(BackendIo { output_rx, input_tx, handle, controls: Some(controls) })
}

/// Run one session to completion.
pub async fn run_session(
    config: &SupervisorConfig,
    info: &SessionInfo,
    deps: SessionDeps,
    backend: BackendIo,
    shutdown: CancellationToken,
) -> anyhow::Result<SessionOutcome> {
    let SessionDeps { store, audit, prompt_tx, mut injection_rx, tail } = deps;
    let BackendIo { mut output_rx, input_tx, mut handle, controls } = backend;

    if let Some(controls) = controls {
        store.set_session_child(info.session_id, controls.pid())?;
    }
    store.set_session_status(info.session_id, SessionStatus::Running)?;
    audit.record(AuditEvent::SessionStarted {
        session_id: info.session_id,
        tool: info.tool.clone(),
        cwd: info.cwd.clone(),
    });

    let gate = Arc::new(tokio::sync::Mutex::new(()));
    let mut relay = RelaySlot::new(config, &gate, &input_tx);

    let mut buffer = RollingBuffer::new(config.max_buffer_bytes);
    let mut detector = Detector::new(config.free_text_max);
    let mut last_output = Instant::now();
    let mut suppress_until: Option<Instant> = None;
    let mut pending_prompt: Option<uuid::Uuid> = None;
    let mut resolve_timers: Vec<(Instant, uuid::Uuid)> = Vec::new();
    let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
    let mut terminated = false;
    let mut injection_open = true;
    // One stall emission per silence period; fresh output rearms it.
    let mut stall_fired = false;

    loop {
        tokio::select! {
            // Reader: backend output.
            data = output_rx.recv() => {
                match data {
                    Some(bytes) => {
                        if config.forward_output {
                            forward_to_host(&bytes);
                        }
                        let suppressed = suppress_until.is_some_and(|until| Instant::now() < until);
                        if !suppressed {
                            buffer.feed(&bytes);
                            last_output = Instant::now();
                            stall_fired = false;
                            *tail.lock() = buffer.tail_text(TAIL_SNAPSHOT_BYTES);
                            emit_detection(
                                &mut detector, &buffer, false, info, config,
                                &store, &audit, &prompt_tx, &mut pending_prompt,
                            ).await;
                        }
                    }
                    None => break,
                }
            }

            // Injector: consume the delivery queue.
            injection = injection_rx.recv(), if injection_open => {
                let Some(injection) = injection else {
                    injection_open = false;
                    continue;
                };
                let guard = tokio::time::timeout(config.injection_timeout, gate.lock()).await;
                let Ok(_guard) = guard else {
                    warn!(prompt = %injection.prompt_id, "injection gate timeout, terminating session");
                    return fail_session(
                        &store, &audit, info, &mut handle, controls,
                        Fault::resource("injection gate acquisition timed out"),
                    ).await;
                };
                if !injection.bytes.is_empty() {
                    if input_tx.send(Bytes::from(injection.bytes.clone())).await.is_err() {
                        debug!("backend input closed, dropping injection");
                        continue;
                    }
                    tokio::time::sleep(config.inject_settle).await;
                }
                suppress_until = Some(Instant::now() + config.echo_suppress);
                buffer.clear();
                detector.reset();
                let now = now_us();
                if store.mark_injected(injection.prompt_id, now)? {
                    store.mark_reply_injected(injection.prompt_id, now)?;
                    audit.record(AuditEvent::ResponseInjected {
                        session_id: info.session_id,
                        prompt_id: injection.prompt_id,
                        bytes: injection.bytes.len(),
                    });
                    resolve_timers.push((Instant::now() + config.echo_suppress, injection.prompt_id));
                }
                // Gate released here, on every path.
            }

            // Watchdog.
            _ = watchdog.tick() => {
                // Resolve prompts whose echo window elapsed.
                let now = Instant::now();
                for (due, prompt_id) in resolve_timers.iter().copied().collect::<Vec<_>>() {
                    if now >= due {
                        if store.mark_resolved(prompt_id)? {
                            store.set_session_status(info.session_id, SessionStatus::Running)?;
                        }
                        if pending_prompt == Some(prompt_id) {
                            pending_prompt = None;
                        }
                    }
                }
                resolve_timers.retain(|(due, _)| now < *due);

                // Pending prompt reached a terminal state some other way
                // (cancel, deny, expiry without bytes)? The store decides.
                if let Some(prompt_id) = pending_prompt {
                    match store.prompt_status(prompt_id)? {
                        Some(status) if !status.is_terminal() => {}
                        _ => pending_prompt = None,
                    }
                }

                // Stall signal.
                let suppressed = suppress_until.is_some_and(|until| now < until);
                let alive = controls.map(|c| c.alive()).unwrap_or(true);
                if !suppressed
                    && alive
                    && !stall_fired
                    && last_output.elapsed() >= config.stuck_timeout
                {
                    stall_fired = true;
                    emit_detection(
                        &mut detector, &buffer, true, info, config,
                        &store, &audit, &prompt_tx, &mut pending_prompt,
                    ).await;
                }

                // Restart a dead stdin relay, up to the budget.
                if let Err(e) = relay.ensure_running() {
                    return fail_session(&store, &audit, info, &mut handle, controls, e).await;
                }
            }

            // Shutdown.
            _ = shutdown.cancelled(), if !terminated => {
                info!("shutdown requested, hanging up child");
                terminated = true;
                if let Some(controls) = controls {
                    controls.hangup_group();
                }
            }
        }
    }

    // Drain any output produced between EOF detection and now.
    while let Ok(bytes) = output_rx.try_recv() {
        if config.forward_output {
            forward_to_host(&bytes);
        }
    }

    relay.stop();
    drop(input_tx);

    let status = wait_for_backend(&mut handle, controls, config.task_timeout).await;

    // Injections that happened have happened: settle their resolve timers
    // now rather than letting the prompts count as failed.
    for (_, prompt_id) in resolve_timers.drain(..) {
        let _ = store.mark_resolved(prompt_id);
    }

    let failed = store.fail_open_prompts(info.session_id)?;
    if failed > 0 {
        debug!("{failed} open prompts failed with the session");
    }
    let session_status = if terminated {
        SessionStatus::Terminated
    } else if status.code == Some(0) {
        SessionStatus::Completed
    } else {
        SessionStatus::Crashed
    };
    store.end_session(info.session_id, session_status, status.code, now_us())?;
    audit.record(AuditEvent::SessionEnded {
        session_id: info.session_id,
        status: session_status.as_str().to_owned(),
        exit_code: status.code,
    });

    Ok(SessionOutcome { status, session_status })
}

/// Run the detector once and forward a fresh event to the router.
///
/// Emission is suppressed while a previous prompt of this session is still
/// non-terminal — the store, not a local cache, is the authority on that.
#[allow(clippy::too_many_arguments)]
async fn emit_detection(
    detector: &mut Detector,
    buffer: &RollingBuffer,
    stalled: bool,
    info: &SessionInfo,
    config: &SupervisorConfig,
    store: &Store,
    audit: &Audit,
    prompt_tx: &mpsc::Sender<PromptEvent>,
    pending_prompt: &mut Option<uuid::Uuid>,
) {
    if pending_prompt.is_some() {
        return;
    }
    let ttl_us = config.ttl.as_micros() as u64;
    let Some(event) = detector.scan(buffer, stalled, info.session_id, ttl_us, now_us()) else {
        return;
    };
    audit.record(AuditEvent::PromptDetected {
        session_id: info.session_id,
        prompt_id: event.prompt_id,
        kind: event.kind.as_str().to_owned(),
        confidence: event.confidence.as_str().to_owned(),
    });
    let _ = store.set_session_status(info.session_id, SessionStatus::AwaitingReply);
    *pending_prompt = Some(event.prompt_id);
    if prompt_tx.send(event).await.is_err() {
        debug!("router gone, dropping detection");
        *pending_prompt = None;
    }
}

fn forward_to_host(bytes: &Bytes) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(bytes);
    let _ = stdout.flush();
}

/// Wind down on a fatal supervisor error: kill the child, fail open
/// prompts, record the end, then surface the error.
async fn fail_session(
    store: &Store,
    audit: &Audit,
    info: &SessionInfo,
    handle: &mut JoinHandle<anyhow::Result<ExitStatus>>,
    controls: Option<PtyControls>,
    error: anyhow::Error,
) -> anyhow::Result<SessionOutcome> {
    if let Some(controls) = controls {
        controls.hangup_group();
    }
    let status = wait_for_backend(handle, controls, Duration::from_secs(5)).await;
    let _ = store.fail_open_prompts(info.session_id);
    let _ = store.end_session(info.session_id, SessionStatus::Crashed, status.code, now_us());
    audit.record(AuditEvent::SessionEnded {
        session_id: info.session_id,
        status: SessionStatus::Crashed.as_str().to_owned(),
        exit_code: status.code,
    });
    Err(error)
}

/// Await the backend pump, force-killing the child group on timeout.
async fn wait_for_backend(
    handle: &mut JoinHandle<anyhow::Result<ExitStatus>>,
    controls: Option<PtyControls>,
    timeout: Duration,
) -> ExitStatus {
    match tokio::time::timeout(timeout, &mut *handle).await {
        Ok(Ok(Ok(status))) => status,
        Ok(Ok(Err(e))) => {
            warn!("backend error: {e:#}");
            ExitStatus { code: Some(1), signal: None }
        }
        Ok(Err(e)) => {
            warn!("backend task panicked: {e}");
            ExitStatus { code: Some(1), signal: None }
        }
        Err(_elapsed) => {
            warn!("backend did not exit within {timeout:?}, sending SIGKILL");
            if let Some(controls) = controls {
                let _ = controls.signal(nix::sys::signal::Signal::SIGKILL);
            }
            handle.abort();
            ExitStatus { code: Some(137), signal: Some(9) }
        }
    }
}

/// Bookkeeping for the host stdin relay task.
struct RelaySlot {
    enabled: bool,
    gate: Arc<tokio::sync::Mutex<()>>,
    input_tx: mpsc::Sender<Bytes>,
    handle: Option<JoinHandle<()>>,
    restarts: u32,
    stop: CancellationToken,
}

impl RelaySlot {
    fn new(
        config: &SupervisorConfig,
        gate: &Arc<tokio::sync::Mutex<()>>,
        input_tx: &mpsc::Sender<Bytes>,
    ) -> Self {
        let mut slot = Self {
            enabled: config.relay_stdin,
            gate: Arc::clone(gate),
            input_tx: input_tx.clone(),
            handle: None,
            restarts: 0,
            stop: CancellationToken::new(),
        };
        if slot.enabled {
            slot.spawn();
        }
        slot
    }

    fn spawn(&mut self) {
        let gate = Arc::clone(&self.gate);
        let input_tx = self.input_tx.clone();
        let stop = self.stop.clone();
        self.handle = Some(tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; 1024];
            loop {
                let n = tokio::select! {
                    _ = stop.cancelled() => break,
                    read = stdin.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    },
                };
                // Yield to any in-flight injection before writing.
                let _gate = gate.lock().await;
                if input_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Restart the relay if it died, within the restart budget.
    fn ensure_running(&mut self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let finished = self.handle.as_ref().is_some_and(JoinHandle::is_finished);
        if !finished {
            return Ok(());
        }
        self.restarts += 1;
        if self.restarts > MAX_TASK_RESTARTS {
            return Err(Fault::resource("stdin relay restart budget exhausted"));
        }
        warn!("stdin relay exited, restarting ({}/{MAX_TASK_RESTARTS})", self.restarts);
        self.spawn();
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
