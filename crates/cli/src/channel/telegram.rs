// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Telegram Bot API channel over long-polling `getUpdates`.
//!
//! No SDK; the surface needed here is four methods and one poll loop,
//! driven through the shared `reqwest` client. All outbound traffic runs
//! through the rate limiter and circuit breaker; all inbound traffic is
//! allowlist-filtered before it reaches the router.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Fault;
use crate::prompt::{PromptEvent, PromptType};

use super::guard::{CircuitBreaker, RateLimiter};
use super::wire;
use super::{Channel, ChannelHealth, Inbound, InboundKind, SessionContext};

/// Long-poll window requested from Telegram.
const POLL_TIMEOUT_SECS: u64 = 50;

/// Identity prefix for allowlist entries and audit records.
const IDENTITY_PREFIX: &str = "telegram:";

pub struct TelegramChannel {
    client: reqwest::Client,
    base_url: String,
    chat_id: i64,
    allowed_users: HashSet<String>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    connected: AtomicBool,
}

impl TelegramChannel {
    pub fn new(token: &str, chat_id: i64, allowed_users: &[String]) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 20))
            .build()
            .map_err(|e| Fault::network(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{token}"),
            chat_id,
            allowed_users: allowed_users
                .iter()
                .map(|u| qualify_identity(u))
                .collect(),
            limiter: RateLimiter::new(),
            breaker: CircuitBreaker::new(),
            connected: AtomicBool::new(false),
        })
    }

    /// Point the channel at a different API host (tests).
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// One Bot API call with breaker and 429 handling.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &impl Serialize,
    ) -> anyhow::Result<T> {
        if !self.breaker.allow() {
            return Err(Fault::network("channel circuit open, failing fast"));
        }
        let url = format!("{}/{method}", self.base_url);
        let response = match self.client.post(&url).json(body).send().await {
            Ok(r) => r,
            Err(e) => {
                self.breaker.on_failure();
                self.connected.store(false, Ordering::Relaxed);
                return Err(Fault::network(format!("{method}: {e}")));
            }
        };

        let status = response.status();
        let envelope: ApiResponse<T> = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                self.breaker.on_failure();
                return Err(Fault::network(format!("{method}: malformed response: {e}")));
            }
        };

        if status.as_u16() == 429 {
            let retry_after = envelope
                .parameters
                .and_then(|p| p.retry_after)
                .unwrap_or(5);
            self.limiter.backoff(self.chat_id, Duration::from_secs(retry_after));
            self.breaker.on_failure();
            return Err(Fault::network(format!(
                "{method}: rate limited, retry after {retry_after}s"
            )));
        }
        if !envelope.ok {
            self.breaker.on_failure();
            return Err(Fault::network(format!(
                "{method}: api error {}: {}",
                envelope.error_code.unwrap_or_default(),
                envelope.description.unwrap_or_default(),
            )));
        }
        self.breaker.on_success();
        self.connected.store(true, Ordering::Relaxed);
        envelope
            .result
            .ok_or_else(|| Fault::network(format!("{method}: ok response without result")))
    }

    async fn send_message(
        &self,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> anyhow::Result<String> {
        let _permit = self.limiter.acquire(self.chat_id).await;
        let mut body = json!({ "chat_id": self.chat_id, "text": text });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }
        let message: Message = self.call("sendMessage", &body).await?;
        Ok(message.message_id.to_string())
    }

    async fn poll_once(&self, offset: &mut i64, inbound_tx: &mpsc::Sender<Inbound>) {
        let body = json!({
            "offset": *offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message", "callback_query"],
        });
        let updates: Vec<Update> = match self.call("getUpdates", &body).await {
            Ok(u) => u,
            Err(e) => {
                debug!("getUpdates failed: {e:#}");
                tokio::time::sleep(Duration::from_secs(3)).await;
                return;
            }
        };

        for update in updates {
            *offset = (*offset).max(update.update_id + 1);
            if let Some(item) = self.admit_update(update).await {
                if inbound_tx.send(item).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Filter one update through the allowlist and shape it for the router.
    async fn admit_update(&self, update: Update) -> Option<Inbound> {
        if let Some(callback) = update.callback_query {
            let identity = format!("{IDENTITY_PREFIX}{}", callback.from.id);
            // Always stop the client-side spinner; drop the payload if the
            // sender is not allowlisted.
            let ack = json!({ "callback_query_id": callback.id });
            if let Err(e) = self.call::<bool>("answerCallbackQuery", &ack).await {
                debug!("answerCallbackQuery failed: {e:#}");
            }
            if !self.is_allowed(&identity) {
                warn!("dropping callback from non-allowlisted {identity}");
                return None;
            }
            let data = callback.data?;
            let message_id = callback
                .message
                .map(|m| m.message_id.to_string())
                .unwrap_or_default();
            return Some(Inbound {
                identity,
                kind: InboundKind::Callback { data, message_id },
            });
        }

        if let Some(message) = update.message {
            let from = message.from?;
            let identity = format!("{IDENTITY_PREFIX}{}", from.id);
            if !self.is_allowed(&identity) {
                warn!("dropping message from non-allowlisted {identity}");
                return None;
            }
            let text = message.text?;
            return Some(Inbound { identity, kind: InboundKind::Text { text } });
        }

        None
    }
}

impl Channel for TelegramChannel {
    fn start(
        self: Arc<Self>,
        inbound_tx: mpsc::Sender<Inbound>,
        shutdown: CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>> {
        Box::pin(async move {
            let mut offset = 0i64;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    () = self.poll_once(&mut offset, &inbound_tx) => {}
                }
            }
        })
    }

    fn send_prompt<'a>(
        &'a self,
        prompt: &'a PromptEvent,
        ctx: &'a SessionContext,
        suggestion: Option<&'a str>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<String>> + Send + 'a>>
    {
        Box::pin(async move {
            let text = prompt_text(prompt, ctx);
            let markup = prompt_keyboard(prompt, suggestion);
            self.send_message(&text, markup).await
        })
    }

    fn edit_prompt_message<'a>(
        &'a self,
        message_id: &'a str,
        text: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let _permit = self.limiter.acquire(self.chat_id).await;
            let message_id: i64 = message_id
                .parse()
                .map_err(|_| Fault::network(format!("bad message id {message_id:?}")))?;
            let body = json!({
                "chat_id": self.chat_id,
                "message_id": message_id,
                "text": text,
            });
            // Telegram returns the edited Message or `true` for inline ones.
            let _: serde_json::Value = self.call("editMessageText", &body).await?;
            Ok(())
        })
    }

    fn notify<'a>(
        &'a self,
        text: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.send_message(text, None).await?;
            Ok(())
        })
    }

    fn is_allowed(&self, identity: &str) -> bool {
        self.allowed_users.contains(identity)
    }

    fn healthcheck(&self) -> ChannelHealth {
        let connected = self.connected.load(Ordering::Relaxed);
        let circuit = self.breaker.state();
        ChannelHealth {
            status: if connected && circuit == super::CircuitState::Closed {
                "ok"
            } else {
                "degraded"
            },
            connected,
            circuit_state: circuit.as_str(),
        }
    }

    fn close<'a>(&'a self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.connected.store(false, Ordering::Relaxed);
        })
    }
}

/// Qualify a bare user id with the channel prefix, leaving already
/// qualified entries alone.
fn qualify_identity(user: &str) -> String {
    if user.starts_with(IDENTITY_PREFIX) {
        user.to_owned()
    } else {
        format!("{IDENTITY_PREFIX}{user}")
    }
}

/// Human-facing prompt message: excerpt, session identity, TTL, and the
/// safe default that fires on timeout.
fn prompt_text(prompt: &PromptEvent, ctx: &SessionContext) -> String {
    let ttl = prompt.ttl_remaining_secs(prompt.created_at_us);
    let default_hint = match prompt.kind {
        PromptType::YesNo => "n",
        PromptType::ConfirmEnter | PromptType::MultipleChoice | PromptType::FreeText => "Enter",
        PromptType::Unknown => "none",
    };
    let mut text = format!(
        "[{}] {} is waiting for input ({})\n\n{}\n\n",
        ctx.short_name(),
        ctx.tool,
        prompt.kind,
        prompt.excerpt,
    );
    if prompt.kind == PromptType::FreeText {
        text.push_str("Reply to this chat with the value to enter.\n");
    }
    text.push_str(&format!("Expires in {ttl}s, then the default ({default_hint}) is injected."));
    text
}

/// Inline keyboard with the affordances for each prompt type. Every
/// button embeds the `ans:` callback payload (prompt id, nonce, value).
fn prompt_keyboard(prompt: &PromptEvent, suggestion: Option<&str>) -> Option<serde_json::Value> {
    let button = |label: &str, value: &str| {
        json!({ "text": label, "callback_data": wire::encode(prompt, value) })
    };
    let mut rows: Vec<serde_json::Value> = Vec::new();

    match prompt.kind {
        PromptType::YesNo => {
            rows.push(json!([button("Yes", "y"), button("No", "n")]));
            rows.push(json!([button("Use default (n)", "d")]));
        }
        PromptType::ConfirmEnter => {
            rows.push(json!([button("Press Enter", "enter")]));
            rows.push(json!([button("Use default", "d")]));
        }
        PromptType::MultipleChoice => {
            for choice in &prompt.choices {
                let label = format!("{}. {}", choice.key, choice.label);
                rows.push(json!([button(&label, &choice.key)]));
            }
            rows.push(json!([button("Use default", "d")]));
        }
        PromptType::FreeText => return None,
        PromptType::Unknown => {
            rows.push(json!([button("Send Enter", "enter")]));
            rows.push(json!([button("Show last output", "show")]));
            rows.push(json!([button("Cancel", "cancel")]));
        }
    }

    if let Some(value) = suggestion {
        rows.insert(0, json!([button(&format!("Suggested: {value}"), value)]));
    }

    Some(json!({ "inline_keyboard": rows }))
}

// ----- Bot API wire types ---------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i32>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    #[serde(default)]
    from: Option<User>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: User,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    data: Option<String>,
}

#[cfg(test)]
#[path = "telegram_tests.rs"]
mod tests;
