// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core data model: detected prompts, replies, and session lifecycle.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Maximum excerpt length in characters (ANSI-stripped).
pub const MAX_EXCERPT_CHARS: usize = 200;

/// Maximum number of choices carried by a multiple-choice prompt.
pub const MAX_CHOICES: usize = 9;

/// Width of the idempotency time bucket in microseconds (30 s).
const BUCKET_US: u64 = 30_000_000;

/// Classified type of a detected prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    YesNo,
    ConfirmEnter,
    MultipleChoice,
    FreeText,
    Unknown,
}

impl PromptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YesNo => "yes_no",
            Self::ConfirmEnter => "confirm_enter",
            Self::MultipleChoice => "multiple_choice",
            Self::FreeText => "free_text",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes_no" => Some(Self::YesNo),
            "confirm_enter" => Some(Self::ConfirmEnter),
            "multiple_choice" => Some(Self::MultipleChoice),
            "free_text" => Some(Self::FreeText),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Bytes injected when the prompt's TTL expires with no reply.
    ///
    /// These are fixed at compile time; the config loader rejects any
    /// attempt to override them. `Unknown` injects nothing — an ambiguous
    /// pause is left untouched rather than poked with a guessed answer.
    pub fn safe_default(&self) -> &'static [u8] {
        match self {
            Self::YesNo => b"n\r",
            Self::ConfirmEnter => b"\r",
            Self::MultipleChoice => b"\r",
            Self::FreeText => b"\r",
            Self::Unknown => b"",
        }
    }
}

impl fmt::Display for PromptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection confidence, ordered low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Created,
    Routed,
    AwaitingReply,
    ReplyReceived,
    Injected,
    Resolved,
    Expired,
    Canceled,
    Failed,
}

impl PromptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Routed => "routed",
            Self::AwaitingReply => "awaiting_reply",
            Self::ReplyReceived => "reply_received",
            Self::Injected => "injected",
            Self::Resolved => "resolved",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "routed" => Some(Self::Routed),
            "awaiting_reply" => Some(Self::AwaitingReply),
            "reply_received" => Some(Self::ReplyReceived),
            "injected" => Some(Self::Injected),
            "resolved" => Some(Self::Resolved),
            "expired" => Some(Self::Expired),
            "canceled" => Some(Self::Canceled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Expired | Self::Canceled | Self::Failed)
    }
}

impl fmt::Display for PromptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One selectable option of a multiple-choice prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    /// Key the child expects on stdin (typically a digit).
    pub key: String,
    pub label: String,
}

/// Validation constraints applied to a reply value before injection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_choices: Option<Vec<String>>,
}

/// A single detected pause of the supervised child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEvent {
    pub prompt_id: Uuid,
    pub session_id: Uuid,
    pub kind: PromptType,
    pub confidence: Confidence,
    /// ANSI-stripped tail of the output, at most [`MAX_EXCERPT_CHARS`].
    pub excerpt: String,
    pub choices: Vec<Choice>,
    pub constraints: Constraints,
    /// 128-bit single-use token, 32 lowercase hex chars.
    pub nonce: String,
    pub safe_default: Vec<u8>,
    pub created_at_us: u64,
    pub expires_at_us: u64,
    pub status: PromptStatus,
    pub idempotency_key: String,
    pub channel_message_id: Option<String>,
    pub responder: Option<String>,
}

impl PromptEvent {
    pub fn new(
        session_id: Uuid,
        kind: PromptType,
        confidence: Confidence,
        excerpt: &str,
        choices: Vec<Choice>,
        constraints: Constraints,
        ttl_us: u64,
        now_us: u64,
    ) -> Self {
        let excerpt = truncate_excerpt(excerpt);
        let idempotency_key = idempotency_key(&session_id, &excerpt, now_us);
        Self {
            prompt_id: Uuid::new_v4(),
            session_id,
            kind,
            confidence,
            excerpt,
            choices,
            constraints,
            nonce: mint_nonce(),
            safe_default: kind.safe_default().to_vec(),
            created_at_us: now_us,
            expires_at_us: now_us.saturating_add(ttl_us),
            status: PromptStatus::Created,
            idempotency_key,
            channel_message_id: None,
            responder: None,
        }
    }

    /// First 8 hex chars of the prompt UUID, used by the callback wire form.
    pub fn short_id(&self) -> String {
        self.prompt_id.simple().to_string()[..8].to_owned()
    }

    /// First 16 hex chars of the nonce, used by the callback wire form.
    pub fn nonce_prefix(&self) -> &str {
        &self.nonce[..16]
    }

    /// Remaining TTL in whole seconds at `now_us` (0 when already expired).
    pub fn ttl_remaining_secs(&self, now_us: u64) -> u64 {
        self.expires_at_us.saturating_sub(now_us) / 1_000_000
    }
}

/// Where a reply originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Human,
    TimeoutDefault,
    AutoPolicy,
}

impl ReplySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::TimeoutDefault => "timeout_default",
            Self::AutoPolicy => "auto_policy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Self::Human),
            "timeout_default" => Some(Self::TimeoutDefault),
            "auto_policy" => Some(Self::AutoPolicy),
            _ => None,
        }
    }
}

/// A captured response to a prompt — human, policy, or timeout default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub reply_id: Uuid,
    pub prompt_id: Uuid,
    pub session_id: Uuid,
    pub raw_value: String,
    pub normalised_value: Vec<u8>,
    pub source: ReplySource,
    pub responder: Option<String>,
    pub injected_at_us: Option<u64>,
}

impl Reply {
    pub fn new(
        prompt: &PromptEvent,
        raw_value: impl Into<String>,
        normalised_value: Vec<u8>,
        source: ReplySource,
        responder: Option<String>,
    ) -> Self {
        Self {
            reply_id: Uuid::new_v4(),
            prompt_id: prompt.prompt_id,
            session_id: prompt.session_id,
            raw_value: raw_value.into(),
            normalised_value,
            source,
            responder,
            injected_at_us: None,
        }
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    AwaitingReply,
    Completed,
    Crashed,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::AwaitingReply => "awaiting_reply",
            Self::Completed => "completed",
            Self::Crashed => "crashed",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "awaiting_reply" => Some(Self::AwaitingReply),
            "completed" => Some(Self::Completed),
            "crashed" => Some(Self::Crashed),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one supervised child invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub tool: String,
    pub cwd: String,
    pub label: Option<String>,
    pub child_pid: Option<u32>,
    pub status: SessionStatus,
    pub started_at_us: u64,
    pub ended_at_us: Option<u64>,
    pub exit_code: Option<i32>,
}

/// Mint a 128-bit random nonce as 32 lowercase hex chars.
pub fn mint_nonce() -> String {
    let n: u128 = rand::rng().random();
    format!("{n:032x}")
}

/// Current UTC time as microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Truncate an excerpt to [`MAX_EXCERPT_CHARS`] characters, appending an
/// ellipsis when shortened. Keeps the tail — the prompt text sits at the
/// end of the output, not the beginning.
pub fn truncate_excerpt(s: &str) -> String {
    let s = s.trim();
    let count = s.chars().count();
    if count <= MAX_EXCERPT_CHARS {
        return s.to_owned();
    }
    let skip = count - (MAX_EXCERPT_CHARS - 1);
    let tail: String = s.chars().skip(skip).collect();
    format!("…{tail}")
}

/// Stable dedup key: SHA-256 over session, canonicalised excerpt, and a
/// 30-second time bucket. Identical pauses within one bucket collapse to
/// one prompt; a re-detection after the bucket rolls is a new prompt.
pub fn idempotency_key(session_id: &Uuid, excerpt: &str, now_us: u64) -> String {
    let canonical: String = excerpt.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(canonical.as_bytes());
    hasher.update((now_us / BUCKET_US).to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Normalise a human-facing reply value into the bytes to inject.
///
/// Returns `Err` with a short reason when the value fails the prompt's
/// constraints — the caller reports it to the channel, nothing is injected.
pub fn normalise_value(
    kind: PromptType,
    raw: &str,
    choices: &[Choice],
    constraints: &Constraints,
    free_text_max: usize,
) -> Result<Vec<u8>, String> {
    match kind {
        PromptType::YesNo => match raw.trim().to_lowercase().as_str() {
            "y" | "yes" => Ok(b"y\r".to_vec()),
            "n" | "no" => Ok(b"n\r".to_vec()),
            other => Err(format!("expected yes or no, got {other:?}")),
        },
        PromptType::ConfirmEnter => match raw.trim().to_lowercase().as_str() {
            "" | "enter" | "ok" => Ok(b"\r".to_vec()),
            other => Err(format!("expected enter, got {other:?}")),
        },
        PromptType::MultipleChoice => {
            let key = raw.trim();
            if !choices.iter().any(|c| c.key == key) {
                return Err(format!("{key:?} is not one of the offered choices"));
            }
            if let Some(ref allowed) = constraints.allowed_choices {
                if !allowed.iter().any(|a| a == key) {
                    return Err(format!("{key:?} is not an allowed choice"));
                }
            }
            let mut bytes = key.as_bytes().to_vec();
            bytes.push(b'\r');
            Ok(bytes)
        }
        PromptType::FreeText | PromptType::Unknown => {
            let max = constraints.max_length.unwrap_or(free_text_max);
            if raw.chars().count() > max {
                return Err(format!("reply exceeds {max} characters"));
            }
            if let Some(ref allowed) = constraints.allowed_choices {
                if !allowed.iter().any(|a| a == raw.trim()) {
                    return Err("reply is not an allowed value".to_owned());
                }
            }
            let mut bytes = raw.as_bytes().to_vec();
            bytes.push(b'\r');
            Ok(bytes)
        }
    }
}

#[cfg(test)]
#[path = "prompt_tests.rs"]
mod tests;
