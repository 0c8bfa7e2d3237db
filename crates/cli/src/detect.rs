// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tri-signal prompt classifier over the rolling buffer.
//!
//! Signals:
//! 1. **Pattern** — compiled regex tables per prompt type, matched against
//!    the unterminated tail line and recent assembled lines. High base
//!    confidence. Every call runs under a wall-clock budget; a breach
//!    yields no pattern match and logs a warning.
//! 2. **Stall** — the supervisor's watchdog reports that the child has
//!    produced no output for the configured window. Low base confidence.
//! 3. A reserved TTY-blocked-on-read signal (OS introspection) is stubbed;
//!    pattern + stall carry detection.
//!
//! A pattern match alone is high confidence; co-occurring stall bumps the
//! confidence one step (already-high stays high). A stall with no pattern
//! and a non-empty buffer emits a low-confidence `unknown` event, which
//! the router handles via the ambiguity protocol.

use std::time::{Duration, Instant};

use regex::Regex;
use tracing::warn;
use uuid::Uuid;

use crate::prompt::{
    Choice, Confidence, Constraints, PromptEvent, PromptType, MAX_CHOICES, MAX_EXCERPT_CHARS,
};
use crate::ring::RollingBuffer;

/// Wall-clock budget for one full pattern pass.
pub const REGEX_BUDGET: Duration = Duration::from_millis(5);

/// How many recent lines participate in multiple-choice detection.
const CHOICE_WINDOW: usize = 12;

/// A classification before it is wrapped into a [`PromptEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub kind: PromptType,
    pub confidence: Confidence,
    pub choices: Vec<Choice>,
}

struct PatternTable {
    yes_no: Vec<Regex>,
    confirm_enter: Vec<Regex>,
    free_text: Vec<Regex>,
    choice_line: Option<Regex>,
}

impl PatternTable {
    fn compile() -> Self {
        Self {
            yes_no: compile_set(&[
                r"(?i)\(y(es)?/n(o)?\)",
                r"(?i)\[y(es)?/n(o)?\]",
                r"(?i)\byes/no\b",
                r"(?i)\(y/n/[a-z]+\)",
            ]),
            confirm_enter: compile_set(&[
                r"(?i)press\s+(enter|return|any key)",
                r"(?i)--\s?more\s?--",
                r"(?i)hit\s+(enter|return)\b",
                r"(?i)\bcontinue\?\s*$",
            ]),
            free_text: compile_set(&[
                r"(?i)\bpassword\s*:\s*$",
                r"(?i)\bpassphrase\s*:\s*$",
                r"(?i)\bapi key\s*:\s*$",
                r"(?i)\btoken\s*:\s*$",
                r"(?i)\busername\s*:\s*$",
                r"(?i)^enter\s+.+:\s*$",
            ]),
            choice_line: Regex::new(r"^\s*(\d)[).]\s+(\S.*)$").ok(),
        }
    }
}

fn compile_set(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// Stateful classifier. One per session; owned by the supervisor's reader.
pub struct Detector {
    table: PatternTable,
    free_text_max: usize,
    /// Idempotency key of the last emitted event, for stable-window dedup.
    last_key: Option<String>,
    budget: Duration,
}

impl Detector {
    pub fn new(free_text_max: usize) -> Self {
        Self {
            table: PatternTable::compile(),
            free_text_max,
            last_key: None,
            budget: REGEX_BUDGET,
        }
    }

    #[cfg(test)]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Forget the dedup key. Called after each injection (alongside the
    /// buffer clear) so the next genuine prompt is not suppressed.
    pub fn reset(&mut self) {
        self.last_key = None;
    }

    /// Run one classification pass. Returns a fully-populated event, or
    /// `None` when nothing new was detected.
    pub fn scan(
        &mut self,
        buffer: &RollingBuffer,
        stalled: bool,
        session_id: Uuid,
        ttl_us: u64,
        now_us: u64,
    ) -> Option<PromptEvent> {
        let detection = self.classify(buffer, stalled)?;

        let excerpt = buffer.tail_text(MAX_EXCERPT_CHARS * 4);
        let constraints = match detection.kind {
            PromptType::FreeText => Constraints {
                max_length: Some(self.free_text_max),
                allowed_choices: None,
            },
            PromptType::MultipleChoice => Constraints {
                max_length: None,
                allowed_choices: Some(detection.choices.iter().map(|c| c.key.clone()).collect()),
            },
            _ => Constraints::default(),
        };

        let event = PromptEvent::new(
            session_id,
            detection.kind,
            detection.confidence,
            &excerpt,
            detection.choices,
            constraints,
            ttl_us,
            now_us,
        );

        // At most one event per stable buffer window.
        if self.last_key.as_deref() == Some(event.idempotency_key.as_str()) {
            return None;
        }
        self.last_key = Some(event.idempotency_key.clone());
        Some(event)
    }

    /// Combine the pattern and stall signals into a detection.
    pub fn classify(&self, buffer: &RollingBuffer, stalled: bool) -> Option<Detection> {
        if buffer.is_empty() {
            return None;
        }

        if let Some(mut detection) = self.pattern_signal(buffer) {
            if stalled {
                detection.confidence = bump(detection.confidence);
            }
            return Some(detection);
        }

        if stalled {
            return Some(Detection {
                kind: PromptType::Unknown,
                confidence: Confidence::Low,
                choices: vec![],
            });
        }

        None
    }

    fn pattern_signal(&self, buffer: &RollingBuffer) -> Option<Detection> {
        let started = Instant::now();

        // The blocking prompt is almost always the unterminated tail line;
        // fall back to the last assembled non-empty line.
        let partial = buffer.partial_line().trim_end();
        let last_line;
        let candidate = if partial.is_empty() {
            last_line = buffer
                .recent_lines(CHOICE_WINDOW)
                .filter(|l| !l.trim().is_empty())
                .next_back()
                .unwrap_or("")
                .to_owned();
            last_line.trim_end()
        } else {
            partial
        };
        if candidate.is_empty() {
            return None;
        }

        for (set, kind) in [
            (&self.table.yes_no, PromptType::YesNo),
            (&self.table.free_text, PromptType::FreeText),
            (&self.table.confirm_enter, PromptType::ConfirmEnter),
        ] {
            for re in set {
                if started.elapsed() >= self.budget {
                    warn!("pattern signal exceeded its time budget, yielding no match");
                    return None;
                }
                if re.is_match(candidate) {
                    return Some(Detection {
                        kind,
                        confidence: Confidence::High,
                        choices: vec![],
                    });
                }
            }
        }

        if started.elapsed() >= self.budget {
            warn!("pattern signal exceeded its time budget, yielding no match");
            return None;
        }
        self.choice_signal(buffer)
    }

    /// Detect a numbered-option menu: two or more lines shaped like
    /// `1) label` / `2. label` within the tail window, numbered from 1.
    fn choice_signal(&self, buffer: &RollingBuffer) -> Option<Detection> {
        let choice_line = self.table.choice_line.as_ref()?;
        let mut choices: Vec<Choice> = Vec::new();
        let lines: Vec<&str> = buffer
            .recent_lines(CHOICE_WINDOW)
            .chain(std::iter::once(buffer.partial_line()))
            .collect();

        for line in lines {
            if let Some(caps) = choice_line.captures(line) {
                let key = caps[1].to_owned();
                let label = caps[2].trim().to_owned();
                // Restart on a fresh `1)` — the previous run was an earlier menu.
                if key == "1" {
                    choices.clear();
                }
                let expected = (choices.len() + 1).to_string();
                if key == expected && choices.len() < MAX_CHOICES {
                    choices.push(Choice { key, label });
                }
            }
        }

        if choices.len() >= 2 {
            Some(Detection {
                kind: PromptType::MultipleChoice,
                confidence: Confidence::High,
                choices,
            })
        } else {
            None
        }
    }
}

fn bump(confidence: Confidence) -> Confidence {
    match confidence {
        Confidence::Low => Confidence::Medium,
        Confidence::Medium | Confidence::High => Confidence::High,
    }
}

#[cfg(test)]
#[path = "detect_tests.rs"]
mod tests;
