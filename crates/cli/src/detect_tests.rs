// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::ring::RollingBuffer;
use std::time::Duration;
use yare::parameterized;

const TTL_US: u64 = 300_000_000;

fn buffer_with(raw: &[u8]) -> RollingBuffer {
    let mut buf = RollingBuffer::new(4096);
    buf.feed(raw);
    buf
}

fn classify(raw: &[u8], stalled: bool) -> Option<Detection> {
    let detector = Detector::new(200);
    detector.classify(&buffer_with(raw), stalled)
}

#[parameterized(
    paren_lower = { b"Do you want to continue? (y/n)" },
    paren_caps = { b"Overwrite existing file? (Y/N)" },
    bracket = { b"Apply changes? [y/n]" },
    bracket_default = { b"Proceed? [Y/n]" },
    long_form = { b"Please answer yes/no: " },
    with_extra = { b"Delete branch? (y/n/a)" },
)]
fn yes_no_patterns(raw: &[u8]) {
    let detection = classify(raw, false).expect("should detect");
    assert_eq!(detection.kind, PromptType::YesNo);
    assert_eq!(detection.confidence, Confidence::High);
}

#[parameterized(
    press_enter = { b"Press Enter to continue" },
    press_return = { b"press RETURN when ready" },
    pager = { b"-- More --" },
    hit_enter = { b"Hit enter to proceed" },
)]
fn confirm_enter_patterns(raw: &[u8]) {
    let detection = classify(raw, false).expect("should detect");
    assert_eq!(detection.kind, PromptType::ConfirmEnter);
}

#[parameterized(
    password = { b"Password:" },
    password_space = { b"sudo password: " },
    api_key = { b"API key:" },
    token = { b"Paste your token:" },
    enter_value = { b"Enter your email address:" },
)]
fn free_text_patterns(raw: &[u8]) {
    let detection = classify(raw, false).expect("should detect");
    assert_eq!(detection.kind, PromptType::FreeText);
}

#[test]
fn multiple_choice_extracts_ordered_options() {
    let raw = b"Select a theme:\n1) Dark mode\n2) Light mode\n3. High contrast\n";
    let detection = classify(raw, false).expect("should detect");
    assert_eq!(detection.kind, PromptType::MultipleChoice);
    assert_eq!(detection.choices.len(), 3);
    assert_eq!(detection.choices[0].key, "1");
    assert_eq!(detection.choices[0].label, "Dark mode");
    assert_eq!(detection.choices[2].label, "High contrast");
}

#[test]
fn second_menu_replaces_first() {
    let raw = b"1) old a\n2) old b\nnew question:\n1) fresh a\n2) fresh b\n";
    let detection = classify(raw, false).expect("should detect");
    assert_eq!(detection.choices[0].label, "fresh a");
    assert_eq!(detection.choices.len(), 2);
}

#[test]
fn single_numbered_line_is_not_a_menu() {
    assert_eq!(classify(b"1) lone item\n", false), None);
}

#[test]
fn choices_are_capped_at_nine() {
    let mut raw = Vec::new();
    for i in 1..=9 {
        raw.extend_from_slice(format!("{i}) option {i}\n").as_bytes());
    }
    let detection = classify(&raw, false).expect("should detect");
    assert_eq!(detection.choices.len(), 9);
}

#[test]
fn stall_alone_with_output_is_low_confidence_unknown() {
    let detection = classify(b"compiling everything...", true).expect("should detect");
    assert_eq!(detection.kind, PromptType::Unknown);
    assert_eq!(detection.confidence, Confidence::Low);
}

#[test]
fn stall_with_empty_buffer_detects_nothing() {
    let detector = Detector::new(200);
    let buf = RollingBuffer::new(4096);
    assert_eq!(detector.classify(&buf, true), None);
}

#[test]
fn no_stall_no_pattern_detects_nothing() {
    assert_eq!(classify(b"just some build output", false), None);
}

#[test]
fn pattern_plus_stall_stays_high() {
    let detection = classify(b"Continue? (y/n)", true).expect("should detect");
    assert_eq!(detection.confidence, Confidence::High);
}

#[test]
fn pattern_matches_last_line_when_tail_has_newline() {
    let raw = b"building...\nDo you want to continue? (y/n)\n";
    let detection = classify(raw, false).expect("should detect");
    assert_eq!(detection.kind, PromptType::YesNo);
}

#[test]
fn ansi_heavy_prompt_still_classifies() {
    let raw = b"\x1b[2K\x1b[1m\x1b[33mOverwrite config?\x1b[0m \x1b[90m(y/n)\x1b[0m";
    let detection = classify(raw, false).expect("should detect");
    assert_eq!(detection.kind, PromptType::YesNo);
}

#[test]
fn zero_budget_yields_no_pattern_match() {
    let detector = Detector::new(200).with_budget(Duration::ZERO);
    let buf = buffer_with(b"Continue? (y/n)");
    // Pattern signal is muted; stall still classifies as unknown.
    assert_eq!(detector.classify(&buf, false), None);
    let stalled = detector.classify(&buf, true).expect("stall survives budget breach");
    assert_eq!(stalled.kind, PromptType::Unknown);
}

#[test]
fn scan_dedups_identical_window() {
    let mut detector = Detector::new(200);
    let buf = buffer_with(b"Continue? (y/n)");
    let session = uuid::Uuid::new_v4();
    let now = crate::prompt::now_us();

    let first = detector.scan(&buf, false, session, TTL_US, now);
    assert!(first.is_some());
    let second = detector.scan(&buf, false, session, TTL_US, now);
    assert!(second.is_none(), "same stable window must emit at most once");
}

#[test]
fn reset_allows_reemission() {
    let mut detector = Detector::new(200);
    let buf = buffer_with(b"Continue? (y/n)");
    let session = uuid::Uuid::new_v4();
    let now = crate::prompt::now_us();

    assert!(detector.scan(&buf, false, session, TTL_US, now).is_some());
    detector.reset();
    assert!(detector.scan(&buf, false, session, TTL_US, now).is_some());
}

#[test]
fn scan_populates_constraints() {
    let mut detector = Detector::new(200);
    let buf = buffer_with(b"1) red\n2) blue\n");
    let session = uuid::Uuid::new_v4();
    let event = detector
        .scan(&buf, false, session, TTL_US, crate::prompt::now_us())
        .expect("should detect");
    assert_eq!(
        event.constraints.allowed_choices,
        Some(vec!["1".to_owned(), "2".to_owned()])
    );

    let mut detector = Detector::new(64);
    let buf = buffer_with(b"Password:");
    let event = detector
        .scan(&buf, false, session, TTL_US, crate::prompt::now_us())
        .expect("should detect");
    assert_eq!(event.constraints.max_length, Some(64));
}

#[test]
fn scan_sets_nonce_and_expiry() {
    let mut detector = Detector::new(200);
    let buf = buffer_with(b"Continue? (y/n)");
    let now = 1_000_000;
    let event = detector
        .scan(&buf, false, uuid::Uuid::new_v4(), TTL_US, now)
        .expect("should detect");
    assert_eq!(event.nonce.len(), 32);
    assert_eq!(event.expires_at_us, now + TTL_US);
    assert_eq!(event.safe_default, b"n\r".to_vec());
}
