// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session supervision: the four cooperative tasks around one child.

pub mod run;

pub use run::{run_session, spawn_backend, BackendIo, SessionDeps, SupervisorConfig};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::pty::ExitStatus;
use crate::prompt::SessionStatus;

/// Static attributes of one supervised invocation.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub tool: String,
    pub cwd: String,
    pub label: Option<String>,
}

/// One queued write to a session's PTY, produced by the router and
/// consumed by the session's injector.
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub prompt_id: Uuid,
    pub bytes: Vec<u8>,
}

/// What the router holds for a live session: where to queue injections
/// and a snapshot of the latest output tail (for the ambiguity protocol's
/// show-last-output affordance).
#[derive(Clone)]
pub struct SessionHandle {
    pub info: SessionInfo,
    pub injection_tx: mpsc::Sender<Injection>,
    pub tail: Arc<Mutex<String>>,
}

/// Final state of a completed session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOutcome {
    pub status: ExitStatus,
    pub session_status: SessionStatus,
}
