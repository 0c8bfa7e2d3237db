// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Compact callback payload format.
//!
//! `ans:<short_prompt_id>:<nonce_prefix>:<value>`: 8 hex chars of the
//! prompt UUID, 16 hex chars of the nonce, then the reply value. Fits the
//! 64-byte callback-data budget of the tightest platforms; value space is
//! bounded by button vocabulary, not free text.

use crate::prompt::PromptEvent;

const PREFIX: &str = "ans";

/// Longest value that still fits the 64-byte budget.
const MAX_VALUE_LEN: usize = 64 - (PREFIX.len() + 8 + 16 + 3);

/// Parsed callback payload, not yet resolved against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParts {
    pub short_id: String,
    pub nonce_prefix: String,
    pub value: String,
}

/// Encode a callback payload for one prompt.
pub fn encode(prompt: &PromptEvent, value: &str) -> String {
    format!("{PREFIX}:{}:{}:{value}", prompt.short_id(), prompt.nonce_prefix())
}

/// Parse a callback payload. Returns `None` for anything malformed:
/// wrong prefix, bad lengths, non-hex ids, oversized values.
pub fn parse(data: &str) -> Option<CallbackParts> {
    let mut parts = data.splitn(4, ':');
    if parts.next() != Some(PREFIX) {
        return None;
    }
    let short_id = parts.next()?;
    let nonce_prefix = parts.next()?;
    let value = parts.next()?;

    if short_id.len() != 8 || !is_lower_hex(short_id) {
        return None;
    }
    if nonce_prefix.len() != 16 || !is_lower_hex(nonce_prefix) {
        return None;
    }
    if value.is_empty() || value.len() > MAX_VALUE_LEN {
        return None;
    }
    Some(CallbackParts {
        short_id: short_id.to_owned(),
        nonce_prefix: nonce_prefix.to_owned(),
        value: value.to_owned(),
    })
}

fn is_lower_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
