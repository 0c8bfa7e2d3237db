// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::prompt::{Confidence, Constraints, PromptEvent, PromptType};
use proptest::prelude::*;
use uuid::Uuid;

fn sample() -> PromptEvent {
    PromptEvent::new(
        Uuid::new_v4(),
        PromptType::YesNo,
        Confidence::High,
        "Continue? (y/n)",
        vec![],
        Constraints::default(),
        300_000_000,
        1_700_000_000_000_000,
    )
}

#[test]
fn round_trip() {
    let prompt = sample();
    let encoded = encode(&prompt, "y");
    let parts = parse(&encoded).expect("parse");
    assert_eq!(parts.short_id, prompt.short_id());
    assert_eq!(parts.nonce_prefix, prompt.nonce_prefix());
    assert_eq!(parts.value, "y");
}

#[test]
fn fits_the_64_byte_budget() {
    let prompt = sample();
    for value in ["y", "n", "d", "enter", "show", "cancel", "9"] {
        assert!(encode(&prompt, value).len() <= 64);
    }
}

#[test]
fn rejects_malformed_payloads() {
    let prompt = sample();
    let good = encode(&prompt, "y");

    assert!(parse("").is_none());
    assert!(parse("nope").is_none());
    assert!(parse(&good.replacen("ans:", "xyz:", 1)).is_none());
    // Truncated short id.
    assert!(parse(&format!("ans:abc:{}:y", prompt.nonce_prefix())).is_none());
    // Uppercase hex is not canonical.
    assert!(parse(&good.to_uppercase()).is_none());
    // Empty value.
    assert!(parse(&format!("ans:{}:{}:", prompt.short_id(), prompt.nonce_prefix())).is_none());
    // Nonce prefix of the wrong width.
    assert!(parse(&format!("ans:{}:abcd:y", prompt.short_id())).is_none());
}

#[test]
fn value_may_contain_colons() {
    let prompt = sample();
    let encoded = encode(&prompt, "a:b");
    let parts = parse(&encoded).expect("parse");
    assert_eq!(parts.value, "a:b");
}

proptest! {
    #[test]
    fn parse_never_panics(data in ".*") {
        let _ = parse(&data);
    }

    #[test]
    fn round_trip_any_short_value(value in "[a-z0-9:]{1,20}") {
        let prompt = sample();
        let parts = parse(&encode(&prompt, &value)).expect("parse");
        prop_assert_eq!(parts.value, value);
    }
}
