// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The data path between detector, policy, store, channel, and injectors.
//!
//! One router task per process serialises every prompt decision: detected
//! prompts arrive on one queue, channel callbacks on another, and a 1 s
//! sweeper drives TTL expiry. All state transitions go through the store's
//! guarded updates — the router never caches prompt status across a
//! decision boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{Audit, AuditEvent};
use crate::channel::guard::{Admission, InboundWindow};
use crate::channel::{wire, Channel, Inbound, InboundKind, SessionContext};
use crate::decisions::{DecisionEntry, DecisionTrace};
use crate::policy::{evaluate, AutonomyMode, Decision, Evaluation, PolicyHandle, SessionMeta};
use crate::prompt::{normalise_value, now_us, PromptEvent, PromptStatus, Reply, ReplySource};
use crate::session::{Injection, SessionHandle};
use crate::store::Store;

/// Sweep cadence for TTL expiry and escalation retries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct Router {
    store: Arc<Store>,
    audit: Arc<Audit>,
    decisions: Arc<DecisionTrace>,
    policy: PolicyHandle,
    channel: Arc<dyn Channel>,
    sessions: Mutex<HashMap<uuid::Uuid, SessionHandle>>,
    inbound_window: InboundWindow,
    pause_file: PathBuf,
    free_text_max: usize,
}

impl Router {
    pub fn new(
        store: Arc<Store>,
        audit: Arc<Audit>,
        decisions: Arc<DecisionTrace>,
        policy: PolicyHandle,
        channel: Arc<dyn Channel>,
        pause_file: PathBuf,
        free_text_max: usize,
    ) -> Self {
        Self {
            store,
            audit,
            decisions,
            policy,
            channel,
            sessions: Mutex::new(HashMap::new()),
            inbound_window: InboundWindow::new(),
            pause_file,
            free_text_max,
        }
    }

    pub fn register_session(&self, handle: SessionHandle) {
        self.sessions.lock().insert(handle.info.session_id, handle);
    }

    pub fn unregister_session(&self, session_id: uuid::Uuid) {
        self.sessions.lock().remove(&session_id);
    }

    fn session_handle(&self, session_id: uuid::Uuid) -> Option<SessionHandle> {
        self.sessions.lock().get(&session_id).cloned()
    }

    fn session_context(&self, session_id: uuid::Uuid) -> SessionContext {
        match self.session_handle(session_id) {
            Some(handle) => SessionContext {
                session_id,
                tool: handle.info.tool,
                label: handle.info.label,
            },
            None => SessionContext { session_id, tool: "unknown".to_owned(), label: None },
        }
    }

    /// Autopilot pause sentinel, toggled by `atlasbridge pause`/`resume`
    /// from any process. Checked before every policy execution.
    fn autopilot_paused(&self) -> bool {
        self.pause_file.exists()
    }

    /// Main loop. Runs until shutdown; both queues closing also ends it.
    pub async fn run(
        self: Arc<Self>,
        mut prompt_rx: mpsc::Receiver<PromptEvent>,
        mut inbound_rx: mpsc::Receiver<Inbound>,
        shutdown: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut prompts_open = true;
        let mut inbound_open = true;

        while prompts_open || inbound_open {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = prompt_rx.recv(), if prompts_open => {
                    match event {
                        Some(event) => self.handle_prompt(event).await,
                        None => prompts_open = false,
                    }
                }
                item = inbound_rx.recv(), if inbound_open => {
                    match item {
                        Some(item) => self.handle_inbound(item).await,
                        None => inbound_open = false,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep(now_us()).await;
                }
            }
        }
    }

    // ----- forward path ----------------------------------------------------

    /// One detected prompt: persist, evaluate policy, act.
    pub async fn handle_prompt(&self, event: PromptEvent) {
        match self.store.insert_prompt(&event) {
            Ok(true) => {}
            Ok(false) => {
                debug!(prompt = %event.prompt_id, "duplicate idempotency key, dropping event");
                return;
            }
            Err(e) => {
                warn!("prompt insert failed: {e:#}");
                return;
            }
        }

        let evaluation = self.evaluate_prompt(&event);
        self.trace_decision(&event, &evaluation);

        match evaluation.decision.clone() {
            Decision::AutoReply { value } => {
                self.apply_auto_reply(&event, &evaluation, &value).await;
            }
            Decision::Escalate { message, suggestion } => {
                self.escalate(&event, message.as_deref(), suggestion.as_deref()).await;
            }
            Decision::Deny { reason } => {
                let why = reason.unwrap_or_else(|| "denied by policy".to_owned());
                let _ = self
                    .channel
                    .notify(&format!(
                        "[{}] prompt denied: {why}\n{}",
                        self.session_context(event.session_id).short_name(),
                        event.excerpt
                    ))
                    .await;
                self.close_prompt(&event, &why).await;
            }
            Decision::NotifyOnly => {
                let _ = self
                    .channel
                    .notify(&format!(
                        "[{}] waiting at the terminal (no reply expected):\n{}",
                        self.session_context(event.session_id).short_name(),
                        event.excerpt
                    ))
                    .await;
                self.close_prompt(&event, "notify_only").await;
            }
        }
    }

    fn evaluate_prompt(&self, event: &PromptEvent) -> Evaluation {
        let policy = self.policy.get();
        let meta = match self.session_handle(event.session_id) {
            Some(handle) => SessionMeta {
                tool: handle.info.tool,
                repo: handle.info.cwd,
                tag: handle.info.label,
            },
            None => SessionMeta::default(),
        };
        if self.autopilot_paused() {
            let mut muted = (*policy).clone();
            muted.autonomy_mode = AutonomyMode::Off;
            let mut evaluation = evaluate(&muted, event, &meta);
            evaluation.explain.insert(0, "autopilot paused".to_owned());
            evaluation
        } else {
            evaluate(&policy, event, &meta)
        }
    }

    fn trace_decision(&self, event: &PromptEvent, evaluation: &Evaluation) {
        let policy = self.policy.get();
        self.decisions.append(&DecisionEntry {
            ts_us: now_us(),
            session_id: event.session_id,
            prompt_id: event.prompt_id,
            rule_id: evaluation.matched_rule.clone(),
            action: evaluation.decision.kind().to_owned(),
            value: match &evaluation.decision {
                Decision::AutoReply { value } => Some(value.clone()),
                Decision::Escalate { suggestion, .. } => suggestion.clone(),
                _ => None,
            },
            autonomy_mode: policy.autonomy_mode.as_str().to_owned(),
            policy_hash: policy.content_hash.clone(),
            idempotency_key: evaluation.idempotency_key.clone(),
            explain: evaluation.explain.clone(),
        });
        self.audit.record(AuditEvent::AutopilotDecided {
            session_id: event.session_id,
            prompt_id: event.prompt_id,
            rule_id: evaluation.matched_rule.clone(),
            action: evaluation.decision.kind().to_owned(),
            idempotency_key: evaluation.idempotency_key.clone(),
        });
    }

    async fn apply_auto_reply(&self, event: &PromptEvent, evaluation: &Evaluation, value: &str) {
        let bytes = match normalise_value(
            event.kind,
            value,
            &event.choices,
            &event.constraints,
            self.free_text_max,
        ) {
            Ok(bytes) => bytes,
            Err(why) => {
                warn!(prompt = %event.prompt_id, "auto-reply value rejected ({why}), escalating");
                self.escalate(event, Some(&why), None).await;
                return;
            }
        };

        let _ = self
            .store
            .advance_status(event.prompt_id, &[PromptStatus::Created], PromptStatus::Routed);
        let responder = format!(
            "policy:{}",
            evaluation.matched_rule.as_deref().unwrap_or("default")
        );
        match self.store.decide_prompt(
            event.prompt_id,
            event.session_id,
            &event.nonce,
            PromptStatus::ReplyReceived,
            Some(&responder),
            now_us(),
        ) {
            Ok(1) => {}
            Ok(_) => {
                debug!(prompt = %event.prompt_id, "auto-reply lost the decision race");
                return;
            }
            Err(e) => {
                warn!("auto-reply decide failed: {e:#}");
                return;
            }
        }
        let reply = Reply::new(event, value, bytes.clone(), ReplySource::AutoPolicy, Some(responder.clone()));
        let _ = self.store.insert_reply(&reply);
        self.audit.record(AuditEvent::ReplyReceived {
            session_id: event.session_id,
            prompt_id: event.prompt_id,
            source: ReplySource::AutoPolicy.as_str().to_owned(),
            responder: Some(responder),
        });
        self.enqueue_injection(event.session_id, event.prompt_id, bytes).await;
    }

    /// Send the prompt to the channel and advance it to awaiting_reply.
    async fn escalate(&self, event: &PromptEvent, message: Option<&str>, suggestion: Option<&str>) {
        let ctx = self.session_context(event.session_id);
        let mut prompt = event.clone();
        if let Some(note) = message {
            prompt.excerpt = format!("{note}\n{}", prompt.excerpt);
        }
        match self.channel.send_prompt(&prompt, &ctx, suggestion).await {
            Ok(message_id) => {
                let _ = self.store.set_channel_message(event.prompt_id, &message_id);
                let _ = self
                    .store
                    .advance_status(event.prompt_id, &[PromptStatus::Created], PromptStatus::Routed);
                self.audit.record(AuditEvent::PromptRouted {
                    session_id: event.session_id,
                    prompt_id: event.prompt_id,
                    message_id,
                });
                let _ = self.store.advance_status(
                    event.prompt_id,
                    &[PromptStatus::Routed],
                    PromptStatus::AwaitingReply,
                );
            }
            Err(e) => {
                warn!("channel send failed, prompt stays queued for retry: {e:#}");
                self.audit
                    .record(AuditEvent::ChannelTransportFailed { detail: format!("{e:#}") });
            }
        }
    }

    /// Close a prompt that will not be answered (deny / notify_only).
    async fn close_prompt(&self, event: &PromptEvent, reason: &str) {
        let moved = self
            .store
            .advance_status(
                event.prompt_id,
                &[PromptStatus::Created, PromptStatus::Routed, PromptStatus::AwaitingReply],
                PromptStatus::Canceled,
            )
            .unwrap_or(false);
        if moved {
            self.audit.record(AuditEvent::PromptCanceled {
                session_id: event.session_id,
                prompt_id: event.prompt_id,
                reason: reason.to_owned(),
            });
        }
    }

    async fn enqueue_injection(
        &self,
        session_id: uuid::Uuid,
        prompt_id: uuid::Uuid,
        bytes: Vec<u8>,
    ) {
        match self.session_handle(session_id) {
            Some(handle) => {
                if handle.injection_tx.send(Injection { prompt_id, bytes }).await.is_err() {
                    warn!(prompt = %prompt_id, "session injector gone, injection dropped");
                }
            }
            None => {
                warn!(prompt = %prompt_id, "no live session for injection");
            }
        }
    }

    // ----- return path -----------------------------------------------------

    /// One validated inbound item from the channel.
    pub async fn handle_inbound(&self, item: Inbound) {
        if !self.channel.is_allowed(&item.identity) {
            warn!("inbound from non-allowlisted {}", item.identity);
            return;
        }
        match item.kind {
            InboundKind::Callback { data, .. } => {
                self.handle_callback(&item.identity, &data).await;
            }
            InboundKind::Text { text } => {
                self.handle_text(&item.identity, &text).await;
            }
        }
    }

    async fn handle_callback(&self, identity: &str, data: &str) {
        let Some(parts) = wire::parse(data) else {
            self.audit.record(AuditEvent::InvalidCallback {
                session_id: None,
                detail: "malformed callback payload".to_owned(),
            });
            return;
        };

        let hits = self.store.find_by_short_id(&parts.short_id).unwrap_or_default();
        let prompt = match hits.as_slice() {
            [prompt] => prompt.clone(),
            [] => {
                self.audit.record(AuditEvent::InvalidCallback {
                    session_id: None,
                    detail: format!("unknown prompt {}", parts.short_id),
                });
                let _ = self.channel.notify("That prompt is unknown.").await;
                return;
            }
            _ => {
                self.audit.record(AuditEvent::InvalidCallback {
                    session_id: None,
                    detail: format!("ambiguous short id {}", parts.short_id),
                });
                let _ = self.channel.notify("That prompt reference is ambiguous.").await;
                return;
            }
        };

        if prompt.nonce_prefix() != parts.nonce_prefix {
            self.audit.record(AuditEvent::InvalidCallback {
                session_id: Some(prompt.session_id),
                detail: "nonce prefix mismatch".to_owned(),
            });
            return;
        }

        match self.inbound_window.admit(prompt.session_id) {
            Admission::Allowed => {}
            Admission::RejectedWarn => {
                let _ = self
                    .channel
                    .notify("Too many replies this minute; routing is paused briefly.")
                    .await;
                return;
            }
            Admission::RejectedSilent => return,
        }

        // Ambiguity-protocol affordances that do not consume the nonce.
        if parts.value == "show" {
            let tail = self
                .session_handle(prompt.session_id)
                .map(|h| h.tail.lock().clone())
                .unwrap_or_default();
            let text = if tail.is_empty() { "(no recent output)".to_owned() } else { tail };
            let _ = self.channel.notify(&text).await;
            return;
        }
        if parts.value == "cancel" {
            self.cancel_via_callback(&prompt, identity).await;
            return;
        }

        let (raw, bytes) = match self.normalise_callback(&prompt, &parts.value) {
            Ok(pair) => pair,
            Err(why) => {
                self.audit.record(AuditEvent::InvalidCallback {
                    session_id: Some(prompt.session_id),
                    detail: why.clone(),
                });
                let _ = self.channel.notify(&format!("Rejected: {why}")).await;
                return;
            }
        };

        self.decide_and_inject(&prompt, identity, &raw, bytes).await;
    }

    /// Map a button value to injectable bytes.
    fn normalise_callback(
        &self,
        prompt: &PromptEvent,
        value: &str,
    ) -> Result<(String, Vec<u8>), String> {
        if value == "d" {
            return Ok(("default".to_owned(), prompt.safe_default.clone()));
        }
        if value == "enter" {
            return Ok(("enter".to_owned(), b"\r".to_vec()));
        }
        let bytes = normalise_value(
            prompt.kind,
            value,
            &prompt.choices,
            &prompt.constraints,
            self.free_text_max,
        )?;
        Ok((value.to_owned(), bytes))
    }

    async fn cancel_via_callback(&self, prompt: &PromptEvent, identity: &str) {
        let rows = self
            .store
            .decide_prompt(
                prompt.prompt_id,
                prompt.session_id,
                &prompt.nonce,
                PromptStatus::Canceled,
                Some(identity),
                now_us(),
            )
            .unwrap_or(0);
        if rows == 1 {
            self.audit.record(AuditEvent::PromptCanceled {
                session_id: prompt.session_id,
                prompt_id: prompt.prompt_id,
                reason: "canceled from channel".to_owned(),
            });
            self.edit_message(prompt, "Canceled.").await;
        } else {
            self.reject_stale(prompt, identity).await;
        }
    }

    /// The guarded transition plus everything that follows a win.
    async fn decide_and_inject(
        &self,
        prompt: &PromptEvent,
        identity: &str,
        raw: &str,
        bytes: Vec<u8>,
    ) {
        let rows = match self.store.decide_prompt(
            prompt.prompt_id,
            prompt.session_id,
            &prompt.nonce,
            PromptStatus::ReplyReceived,
            Some(identity),
            now_us(),
        ) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("decide failed: {e:#}");
                return;
            }
        };

        if rows == 0 {
            self.reject_stale(prompt, identity).await;
            return;
        }

        let reply = Reply::new(prompt, raw, bytes.clone(), ReplySource::Human, Some(identity.to_owned()));
        let _ = self.store.insert_reply(&reply);
        self.audit.record(AuditEvent::ReplyReceived {
            session_id: prompt.session_id,
            prompt_id: prompt.prompt_id,
            source: ReplySource::Human.as_str().to_owned(),
            responder: Some(identity.to_owned()),
        });
        self.enqueue_injection(prompt.session_id, prompt.prompt_id, bytes).await;
        self.edit_message(prompt, &format!("Answered ({raw}) by {identity}.")).await;
    }

    /// A losing decision: figure out why and acknowledge accordingly.
    async fn reject_stale(&self, prompt: &PromptEvent, identity: &str) {
        let status = self.store.prompt_status(prompt.prompt_id).ok().flatten();
        match status {
            Some(PromptStatus::Expired) => {
                self.audit.record(AuditEvent::LateReplyRejected {
                    session_id: prompt.session_id,
                    prompt_id: prompt.prompt_id,
                    responder: identity.to_owned(),
                });
                self.edit_message(prompt, "Expired; the safe default was injected.").await;
                let _ = self.channel.notify("Too late: that prompt already expired.").await;
            }
            Some(
                PromptStatus::ReplyReceived
                | PromptStatus::Injected
                | PromptStatus::Resolved
                | PromptStatus::Canceled,
            ) => {
                self.audit.record(AuditEvent::DuplicateCallbackIgnored {
                    session_id: prompt.session_id,
                    prompt_id: prompt.prompt_id,
                    responder: identity.to_owned(),
                });
            }
            _ => {
                self.audit.record(AuditEvent::InvalidCallback {
                    session_id: Some(prompt.session_id),
                    detail: format!("callback for prompt in state {status:?}"),
                });
            }
        }
    }

    /// Free-text replies: route to the single pending free-text prompt, or
    /// to an explicitly cited one (`<short_id> value`).
    async fn handle_text(&self, identity: &str, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }

        // Explicit citation: an 8-hex-char prompt id, then the value.
        if let Some((head, rest)) = trimmed.split_once(char::is_whitespace) {
            let head = head.trim_end_matches(':');
            if head.len() == 8 && head.chars().all(|c| c.is_ascii_hexdigit()) {
                if let Ok([prompt]) =
                    self.store.find_by_short_id(head).as_deref()
                {
                    let prompt = prompt.clone();
                    self.apply_text_reply(&prompt, identity, rest.trim()).await;
                    return;
                }
            }
        }

        let pending = self.store.pending_free_text().unwrap_or_default();
        match pending.as_slice() {
            [] => {
                let _ = self
                    .channel
                    .notify("No prompt is waiting for a typed reply right now.")
                    .await;
            }
            [prompt] => {
                let prompt = prompt.clone();
                self.apply_text_reply(&prompt, identity, trimmed).await;
            }
            many => {
                // Held: ask the sender to disambiguate by short id.
                let ids: Vec<String> = many
                    .iter()
                    .map(|p| {
                        format!(
                            "{} ({})",
                            p.short_id(),
                            self.session_context(p.session_id).short_name()
                        )
                    })
                    .collect();
                let _ = self
                    .channel
                    .notify(&format!(
                        "Several prompts are waiting. Resend as `<id> your reply` with one of: {}",
                        ids.join(", ")
                    ))
                    .await;
            }
        }
    }

    async fn apply_text_reply(&self, prompt: &PromptEvent, identity: &str, value: &str) {
        match self.inbound_window.admit(prompt.session_id) {
            Admission::Allowed => {}
            Admission::RejectedWarn => {
                let _ = self
                    .channel
                    .notify("Too many replies this minute; routing is paused briefly.")
                    .await;
                return;
            }
            Admission::RejectedSilent => return,
        }
        match normalise_value(
            prompt.kind,
            value,
            &prompt.choices,
            &prompt.constraints,
            self.free_text_max,
        ) {
            Ok(bytes) => self.decide_and_inject(prompt, identity, value, bytes).await,
            Err(why) => {
                let _ = self.channel.notify(&format!("Rejected: {why}")).await;
            }
        }
    }

    // ----- timers ----------------------------------------------------------

    /// Periodic pass: expire lapsed prompts (injecting safe defaults) and
    /// retry escalations that never reached the channel.
    pub async fn sweep(&self, now: u64) {
        match self.store.expire_stale(now) {
            Ok(expired) => {
                for prompt in expired {
                    self.audit.record(AuditEvent::PromptExpired {
                        session_id: prompt.session_id,
                        prompt_id: prompt.prompt_id,
                    });
                    let reply = Reply::new(
                        &prompt,
                        "default",
                        prompt.safe_default.clone(),
                        ReplySource::TimeoutDefault,
                        None,
                    );
                    let _ = self.store.insert_reply(&reply);
                    self.enqueue_injection(
                        prompt.session_id,
                        prompt.prompt_id,
                        prompt.safe_default.clone(),
                    )
                    .await;
                    self.edit_message(&prompt, "Expired; the safe default was injected.").await;
                }
            }
            Err(e) => warn!("expiry sweep failed: {e:#}"),
        }

        // Escalations that failed to send stay in `created`; retry them.
        if let Ok(unrouted) = self.store.unrouted(now) {
            for prompt in unrouted {
                debug!(prompt = %prompt.prompt_id, "retrying channel escalation");
                self.escalate(&prompt, None, None).await;
            }
        }
    }

    /// Startup recovery: re-notify every prompt that survived a restart
    /// with a live TTL, and report how many there were.
    pub async fn recover(&self, now: u64) {
        let pending = self.store.reload_pending(now).unwrap_or_default();
        self.audit.record(AuditEvent::DaemonRestarted { pending: pending.len() });
        if pending.is_empty() {
            return;
        }
        info!("recovering {} pending prompts", pending.len());
        for prompt in pending {
            let ctx = self.session_context(prompt.session_id);
            match self.channel.send_prompt(&prompt, &ctx, None).await {
                Ok(message_id) => {
                    let _ = self.store.set_channel_message(prompt.prompt_id, &message_id);
                    let _ = self.store.advance_status(
                        prompt.prompt_id,
                        &[PromptStatus::Routed],
                        PromptStatus::AwaitingReply,
                    );
                    self.audit.record(AuditEvent::PromptRouted {
                        session_id: prompt.session_id,
                        prompt_id: prompt.prompt_id,
                        message_id,
                    });
                }
                Err(e) => {
                    warn!("recovery re-notification failed: {e:#}");
                    self.audit
                        .record(AuditEvent::ChannelTransportFailed { detail: format!("{e:#}") });
                }
            }
        }
    }

    async fn edit_message(&self, prompt: &PromptEvent, text: &str) {
        let message_id = match &prompt.channel_message_id {
            Some(id) => id.clone(),
            None => match self.store.get_prompt(prompt.prompt_id).ok().flatten() {
                Some(stored) => match stored.channel_message_id {
                    Some(id) => id,
                    None => return,
                },
                None => return,
            },
        };
        if let Err(e) = self.channel.edit_prompt_message(&message_id, text).await {
            debug!("message edit failed: {e:#}");
        }
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
