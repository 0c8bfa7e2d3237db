// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn sample_prompt(kind: PromptType) -> PromptEvent {
    PromptEvent::new(
        Uuid::new_v4(),
        kind,
        Confidence::High,
        "Continue? (y/n)",
        vec![],
        Constraints::default(),
        300_000_000,
        1_700_000_000_000_000,
    )
}

#[test]
fn nonce_is_32_hex() {
    let nonce = mint_nonce();
    assert_eq!(nonce.len(), 32);
    assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(mint_nonce(), mint_nonce());
}

#[test]
fn short_forms() {
    let prompt = sample_prompt(PromptType::YesNo);
    assert_eq!(prompt.short_id().len(), 8);
    assert_eq!(prompt.nonce_prefix().len(), 16);
    assert!(prompt.nonce.starts_with(prompt.nonce_prefix()));
}

#[test]
fn ttl_remaining() {
    let prompt = sample_prompt(PromptType::YesNo);
    assert_eq!(prompt.ttl_remaining_secs(prompt.created_at_us), 300);
    assert_eq!(prompt.ttl_remaining_secs(prompt.expires_at_us), 0);
    assert_eq!(prompt.ttl_remaining_secs(prompt.expires_at_us + 1), 0);
}

#[test]
fn excerpt_truncates_keeping_tail() {
    let long: String = "x".repeat(300) + " Continue? (y/n)";
    let excerpt = truncate_excerpt(&long);
    assert_eq!(excerpt.chars().count(), MAX_EXCERPT_CHARS);
    assert!(excerpt.starts_with('…'));
    assert!(excerpt.ends_with("Continue? (y/n)"));
}

#[test]
fn excerpt_short_passes_through() {
    assert_eq!(truncate_excerpt("  hello  "), "hello");
}

#[test]
fn idempotency_key_is_stable_within_bucket() {
    let session = Uuid::new_v4();
    let t = 1_700_000_000_000_000;
    let a = idempotency_key(&session, "Continue?  (y/n)", t);
    let b = idempotency_key(&session, "Continue? (y/n)", t + 1_000_000);
    // Whitespace canonicalisation and same bucket collapse to one key.
    assert_eq!(a, b);
}

#[test]
fn idempotency_key_differs_across_buckets_and_sessions() {
    let session = Uuid::new_v4();
    let t = 1_700_000_000_000_000;
    let a = idempotency_key(&session, "Continue? (y/n)", t);
    assert_ne!(a, idempotency_key(&session, "Continue? (y/n)", t + 31_000_000));
    assert_ne!(a, idempotency_key(&Uuid::new_v4(), "Continue? (y/n)", t));
}

#[parameterized(
    yes = { "y", b"y\r" },
    yes_word = { "Yes", b"y\r" },
    no = { "n", b"n\r" },
    no_word = { "NO", b"n\r" },
)]
fn normalise_yes_no(raw: &str, expected: &[u8]) {
    let got = normalise_value(PromptType::YesNo, raw, &[], &Constraints::default(), 200);
    assert_eq!(got, Ok(expected.to_vec()));
}

#[test]
fn normalise_yes_no_rejects_garbage() {
    let got = normalise_value(PromptType::YesNo, "maybe", &[], &Constraints::default(), 200);
    assert!(got.is_err());
}

#[test]
fn normalise_confirm_enter() {
    for raw in ["", "enter", "OK"] {
        let got = normalise_value(PromptType::ConfirmEnter, raw, &[], &Constraints::default(), 200);
        assert_eq!(got, Ok(b"\r".to_vec()));
    }
}

#[test]
fn normalise_multiple_choice_checks_offered_keys() {
    let choices = vec![
        Choice { key: "1".into(), label: "a".into() },
        Choice { key: "2".into(), label: "b".into() },
    ];
    let got = normalise_value(PromptType::MultipleChoice, "2", &choices, &Constraints::default(), 200);
    assert_eq!(got, Ok(b"2\r".to_vec()));
    let got = normalise_value(PromptType::MultipleChoice, "3", &choices, &Constraints::default(), 200);
    assert!(got.is_err());
}

#[test]
fn normalise_free_text_enforces_max_length() {
    let constraints = Constraints { max_length: Some(5), allowed_choices: None };
    let got = normalise_value(PromptType::FreeText, "short", &[], &constraints, 200);
    assert_eq!(got, Ok(b"short\r".to_vec()));
    let got = normalise_value(PromptType::FreeText, "much too long", &[], &constraints, 200);
    assert!(got.is_err());
}

#[test]
fn free_text_falls_back_to_global_max() {
    let got = normalise_value(PromptType::FreeText, &"a".repeat(201), &[], &Constraints::default(), 200);
    assert!(got.is_err());
    let got = normalise_value(PromptType::FreeText, &"a".repeat(200), &[], &Constraints::default(), 200);
    assert!(got.is_ok());
}

#[test]
fn safe_defaults_are_fixed() {
    assert_eq!(PromptType::YesNo.safe_default(), b"n\r");
    assert_eq!(PromptType::ConfirmEnter.safe_default(), b"\r");
    assert_eq!(PromptType::Unknown.safe_default(), b"");
}

#[test]
fn status_terminality() {
    for terminal in [
        PromptStatus::Resolved,
        PromptStatus::Expired,
        PromptStatus::Canceled,
        PromptStatus::Failed,
    ] {
        assert!(terminal.is_terminal());
    }
    for live in [
        PromptStatus::Created,
        PromptStatus::Routed,
        PromptStatus::AwaitingReply,
        PromptStatus::ReplyReceived,
        PromptStatus::Injected,
    ] {
        assert!(!live.is_terminal());
    }
}

#[test]
fn status_round_trips_through_strings() {
    for status in [
        PromptStatus::Created,
        PromptStatus::Routed,
        PromptStatus::AwaitingReply,
        PromptStatus::ReplyReceived,
        PromptStatus::Injected,
        PromptStatus::Resolved,
        PromptStatus::Expired,
        PromptStatus::Canceled,
        PromptStatus::Failed,
    ] {
        assert_eq!(PromptStatus::parse(status.as_str()), Some(status));
    }
}
