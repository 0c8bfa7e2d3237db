// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deterministic first-match policy engine.
//!
//! A policy is an ordered rule list plus defaults, loaded from YAML,
//! validated and compiled up front, and swapped atomically on reload.
//! Evaluation is pure: same event + same policy ⇒ same decision and
//! idempotency key.

pub mod cmd;
pub mod eval;
pub mod load;
pub mod reload;

pub use eval::{evaluate, Decision, Evaluation, SessionMeta};
pub use load::load_policy;
pub use reload::PolicyHandle;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::prompt::{Confidence, PromptType};

/// Global autonomy gate applied after rule matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    Off,
    Assist,
    Full,
}

// Hand-written so a bare YAML `off` (which the 1.1 scalar rules resolve
// to boolean false) still reads as AutonomyMode::Off.
impl<'de> Deserialize<'de> for AutonomyMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ModeVisitor;

        impl serde::de::Visitor<'_> for ModeVisitor {
            type Value = AutonomyMode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("one of: off, assist, full")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "off" => Ok(AutonomyMode::Off),
                    "assist" => Ok(AutonomyMode::Assist),
                    "full" => Ok(AutonomyMode::Full),
                    other => Err(E::custom(format!("unknown autonomy_mode {other:?}"))),
                }
            }

            fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Self::Value, E> {
                if v {
                    Err(E::custom("autonomy_mode true is ambiguous; use assist or full"))
                } else {
                    Ok(AutonomyMode::Off)
                }
            }
        }

        deserializer.deserialize_any(ModeVisitor)
    }
}

impl AutonomyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Assist => "assist",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for AutonomyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substring or compiled-regex text matcher for rule criteria.
#[derive(Debug, Clone)]
pub enum TextMatcher {
    Literal(String),
    Pattern(Regex),
}

impl TextMatcher {
    pub fn matches(&self, haystack: &str) -> bool {
        match self {
            Self::Literal(needle) => haystack.contains(needle.as_str()),
            Self::Pattern(re) => re.is_match(haystack),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Literal(s) => format!("contains {s:?}"),
            Self::Pattern(re) => format!("matches /{}/", re.as_str()),
        }
    }
}

/// Compiled match criteria of one rule. All present criteria must hold.
#[derive(Debug, Clone, Default)]
pub struct RuleMatch {
    pub tool: Option<String>,
    pub repo_prefix: Option<String>,
    pub prompt_types: Option<Vec<PromptType>>,
    pub contains: Option<TextMatcher>,
    pub min_confidence: Option<Confidence>,
    pub max_confidence: Option<Confidence>,
    pub session_tag: Option<String>,
    pub any_of: Vec<RuleMatch>,
    pub none_of: Vec<RuleMatch>,
}

/// Validated action of a matched rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleAction {
    AutoReply { value: String },
    RequireHuman { message: Option<String> },
    Deny { reason: Option<String> },
    NotifyOnly,
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AutoReply { .. } => "auto_reply",
            Self::RequireHuman { .. } => "require_human",
            Self::Deny { .. } => "deny",
            Self::NotifyOnly => "notify_only",
        }
    }
}

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub matcher: RuleMatch,
    pub action: RuleAction,
}

/// Fallback behaviour when no rule matches. Never `auto_reply` — the
/// loader rejects that outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Escalate,
    Deny,
    NotifyOnly,
}

impl DefaultAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Escalate => "escalate",
            Self::Deny => "deny",
            Self::NotifyOnly => "notify_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Defaults {
    pub no_match: DefaultAction,
    pub low_confidence: DefaultAction,
}

impl Default for Defaults {
    fn default() -> Self {
        Self { no_match: DefaultAction::Escalate, low_confidence: DefaultAction::Escalate }
    }
}

/// A loaded, immutable policy. Replaced wholesale on reload.
#[derive(Debug, Clone)]
pub struct Policy {
    pub dsl_version: String,
    pub name: String,
    pub autonomy_mode: AutonomyMode,
    pub rules: Vec<Rule>,
    pub defaults: Defaults,
    /// SHA-256 of the policy source text, `sha256:`-prefixed.
    pub content_hash: String,
}

impl Policy {
    /// The built-in policy when no file is configured: everything escalates.
    pub fn disabled() -> Self {
        Self {
            dsl_version: "1".to_owned(),
            name: "disabled".to_owned(),
            autonomy_mode: AutonomyMode::Off,
            rules: vec![],
            defaults: Defaults::default(),
            content_hash: "sha256:none".to_owned(),
        }
    }
}
