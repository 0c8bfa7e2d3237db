// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound rate limiting and the send circuit breaker, plus the inbound
//! per-session callback window.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// Minimum spacing between messages to one chat.
const PER_CHAT_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive failures that trip the breaker.
const TRIP_THRESHOLD: u32 = 3;

/// How long the breaker stays open before a probe is allowed.
const OPEN_WINDOW: Duration = Duration::from_secs(30);

/// Processed callbacks allowed per session per minute.
const INBOUND_PER_MINUTE: u32 = 20;

/// Conservative outbound pacing: per-chat spacing plus a global
/// concurrency bound.
pub struct RateLimiter {
    last_send: Mutex<HashMap<i64, Instant>>,
    global: tokio::sync::Semaphore,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { last_send: Mutex::new(HashMap::new()), global: tokio::sync::Semaphore::new(4) }
    }

    /// Wait for a send slot to `chat_id`. Returns a permit that bounds
    /// global concurrency; drop it when the request finishes.
    pub async fn acquire(&self, chat_id: i64) -> tokio::sync::SemaphorePermit<'_> {
        loop {
            let wait = {
                let mut last = self.last_send.lock();
                let now = Instant::now();
                match last.get(&chat_id) {
                    Some(&prev) if now < prev + PER_CHAT_INTERVAL => prev + PER_CHAT_INTERVAL - now,
                    _ => {
                        last.insert(chat_id, now);
                        Duration::ZERO
                    }
                }
            };
            if wait.is_zero() {
                break;
            }
            tokio::time::sleep(wait).await;
        }
        // Semaphore is never closed, so acquire cannot fail.
        match self.global.acquire().await {
            Ok(permit) => permit,
            Err(_closed) => unreachable!("rate limiter semaphore is never closed"),
        }
    }

    /// Honour an explicit server backoff (HTTP 429 retry_after): no send
    /// to this chat until `retry_after` has passed.
    pub fn backoff(&self, chat_id: i64, retry_after: Duration) {
        let resume = Instant::now() + retry_after;
        let stamp = resume.checked_sub(PER_CHAT_INTERVAL).unwrap_or(resume);
        self.last_send.lock().insert(chat_id, stamp);
    }
}

/// Breaker state as reported by healthchecks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    probing: bool,
}

/// Trips open after [`TRIP_THRESHOLD`] consecutive send failures; stays
/// open for [`OPEN_WINDOW`]; a single successful probe closes it.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                open_until: None,
                probing: false,
            }),
        }
    }

    /// Whether a send may proceed right now. While open, everything fails
    /// fast; once the window lapses, exactly one caller gets the probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.open_until {
            None => true,
            Some(until) => {
                if Instant::now() < until {
                    false
                } else if inner.probing {
                    false
                } else {
                    inner.probing = true;
                    true
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.open_until = None;
        inner.probing = false;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.probing = false;
        if inner.consecutive_failures >= TRIP_THRESHOLD {
            inner.open_until = Some(Instant::now() + OPEN_WINDOW);
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match inner.open_until {
            None => CircuitState::Closed,
            Some(until) if Instant::now() < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }
}

struct WindowInner {
    window_start: Instant,
    count: u32,
    warned: bool,
}

/// Per-session inbound callback budget: at most [`INBOUND_PER_MINUTE`]
/// processed callbacks per minute. The first breach in a window asks the
/// caller to warn; the rest of the window is silently dropped.
pub struct InboundWindow {
    sessions: Mutex<HashMap<Uuid, WindowInner>>,
}

/// Outcome of an inbound admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Over budget; the caller should send one warning.
    RejectedWarn,
    /// Over budget; warning already sent this window.
    RejectedSilent,
}

impl Default for InboundWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundWindow {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    pub fn admit(&self, session_id: Uuid) -> Admission {
        let mut sessions = self.sessions.lock();
        let now = Instant::now();
        let entry = sessions.entry(session_id).or_insert(WindowInner {
            window_start: now,
            count: 0,
            warned: false,
        });
        if now.duration_since(entry.window_start) >= Duration::from_secs(60) {
            entry.window_start = now;
            entry.count = 0;
            entry.warned = false;
        }
        entry.count += 1;
        if entry.count <= INBOUND_PER_MINUTE {
            Admission::Allowed
        } else if !entry.warned {
            entry.warned = true;
            Admission::RejectedWarn
        } else {
            Admission::RejectedSilent
        }
    }
}

#[cfg(test)]
#[path = "guard_tests.rs"]
mod tests;
