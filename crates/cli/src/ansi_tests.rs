// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn strip_str(input: &[u8]) -> String {
    String::from_utf8_lossy(&strip_ansi(input)).into_owned()
}

#[parameterized(
    plain = { b"hello world", "hello world" },
    sgr_color = { b"\x1b[31mred\x1b[0m text", "red text" },
    sgr_bold_multi = { b"\x1b[1;32;44mstyled\x1b[m", "styled" },
    cursor_moves = { b"a\x1b[2Ab\x1b[10;20Hc", "abc" },
    erase_line = { b"\x1b[2K\x1b[1Gprompt:", "prompt:" },
    osc_title_bel = { b"\x1b]0;window title\x07visible", "visible" },
    osc_title_st = { b"\x1b]2;title\x1b\\visible", "visible" },
    charset = { b"\x1b(Bascii", "ascii" },
    private_mode = { b"\x1b[?25lhidden cursor\x1b[?25h", "hidden cursor" },
    keeps_newlines = { b"line1\r\nline2", "line1\r\nline2" },
    keeps_tabs = { b"a\tb", "a\tb" },
    drops_bel = { b"ding\x07dong", "dingdong" },
    drops_backspace = { b"ab\x08c", "abc" },
)]
fn strips(input: &[u8], expected: &str) {
    assert_eq!(strip_str(input), expected);
}

#[test]
fn sequence_split_across_chunks() {
    let mut stripper = AnsiStripper::new();
    let mut out = Vec::new();
    stripper.strip_into(b"before\x1b[3", &mut out);
    stripper.strip_into(b"1mred\x1b[0m", &mut out);
    assert_eq!(String::from_utf8_lossy(&out), "beforered");
}

#[test]
fn osc_split_across_chunks() {
    let mut stripper = AnsiStripper::new();
    let mut out = Vec::new();
    stripper.strip_into(b"\x1b]0;half", &mut out);
    stripper.strip_into(b" title\x07done", &mut out);
    assert_eq!(String::from_utf8_lossy(&out), "done");
}

#[test]
fn reset_recovers_from_partial_sequence() {
    let mut stripper = AnsiStripper::new();
    let mut out = Vec::new();
    stripper.strip_into(b"\x1b[3", &mut out);
    stripper.reset();
    stripper.strip_into(b"plain", &mut out);
    assert_eq!(String::from_utf8_lossy(&out), "plain");
}

#[test]
fn yes_no_prompt_with_color_matches_after_strip() {
    let raw = b"\x1b[1mDo you want to continue?\x1b[0m \x1b[33m(y/n)\x1b[0m";
    assert_eq!(strip_str(raw), "Do you want to continue? (y/n)");
}
