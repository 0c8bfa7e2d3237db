// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Chat-channel abstraction.
//!
//! One concrete implementation (Telegram long-poll) ships with the core;
//! the trait keeps further backends a pure addition. Inbound traffic is
//! allowlist-filtered before it reaches the router; outbound traffic runs
//! through the per-chat rate limiter and the circuit breaker.

pub mod guard;
pub mod telegram;
pub mod wire;

pub use guard::{CircuitBreaker, CircuitState, InboundWindow, RateLimiter};
pub use telegram::TelegramChannel;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::prompt::PromptEvent;

/// Session attributes a channel message displays.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub tool: String,
    pub label: Option<String>,
}

impl SessionContext {
    /// Short human-facing identifier: the label if set, else the first 8
    /// hex chars of the session id.
    pub fn short_name(&self) -> String {
        match self.label {
            Some(ref label) => label.clone(),
            None => self.session_id.simple().to_string()[..8].to_owned(),
        }
    }
}

/// Channel health snapshot for `--json` output and logs.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    pub status: &'static str,
    pub connected: bool,
    pub circuit_state: &'static str,
}

/// An inbound item that already passed the allowlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Channel-qualified identity, e.g. `telegram:123456`.
    pub identity: String,
    pub kind: InboundKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    /// A button tap carrying a callback payload (see [`wire`]).
    Callback { data: String, message_id: String },
    /// A typed free-text message.
    Text { text: String },
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability contract a chat backend implements.
pub trait Channel: Send + Sync + 'static {
    /// Establish background connectivity and pump validated inbound items
    /// into `inbound_tx` until shutdown. The future is the pump itself;
    /// the caller spawns it.
    fn start(
        self: Arc<Self>,
        inbound_tx: mpsc::Sender<Inbound>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, ()>;

    /// Deliver a prompt with platform affordances. Returns the channel's
    /// message id for later edits.
    fn send_prompt<'a>(
        &'a self,
        prompt: &'a PromptEvent,
        ctx: &'a SessionContext,
        suggestion: Option<&'a str>,
    ) -> BoxFuture<'a, anyhow::Result<String>>;

    /// Reflect post-decision state on a previously-sent message.
    fn edit_prompt_message<'a>(
        &'a self,
        message_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Out-of-band, non-interactive notification.
    fn notify<'a>(&'a self, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Allowlist check applied to every inbound identity.
    fn is_allowed(&self, identity: &str) -> bool;

    fn healthcheck(&self) -> ChannelHealth;

    /// Tear down cleanly: cancel background work, flush in-flight sends.
    fn close<'a>(&'a self) -> BoxFuture<'a, ()>;
}
