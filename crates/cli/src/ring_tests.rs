// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;

#[test]
fn empty_buffer() {
    let buf = RollingBuffer::new(16);
    assert!(buf.is_empty());
    assert_eq!(buf.tail_text(16), "");
    assert_eq!(buf.partial_line(), "");
}

#[test]
fn partial_line_tracks_unterminated_output() {
    let mut buf = RollingBuffer::new(4096);
    buf.feed(b"Do you want to continue? (y/n)");
    assert_eq!(buf.partial_line(), "Do you want to continue? (y/n)");
    assert_eq!(buf.line_count(), 0);
}

#[test]
fn newline_moves_partial_into_lines() {
    let mut buf = RollingBuffer::new(4096);
    buf.feed(b"first line\nsecond");
    assert_eq!(buf.recent_lines(10).collect::<Vec<_>>(), vec!["first line"]);
    assert_eq!(buf.partial_line(), "second");
}

#[test]
fn carriage_return_resets_partial() {
    let mut buf = RollingBuffer::new(4096);
    buf.feed(b"spinner frame 1\rspinner frame 2\rfinal");
    assert_eq!(buf.partial_line(), "final");
}

#[test]
fn ansi_is_stripped_before_assembly() {
    let mut buf = RollingBuffer::new(4096);
    buf.feed(b"\x1b[32mok\x1b[0m\n\x1b[1mContinue? (y/n)\x1b[0m");
    assert_eq!(buf.recent_lines(10).collect::<Vec<_>>(), vec!["ok"]);
    assert_eq!(buf.partial_line(), "Continue? (y/n)");
}

#[test]
fn ring_capacity_is_never_exceeded() {
    let mut buf = RollingBuffer::new(64);
    for _ in 0..1000 {
        buf.feed(b"0123456789abcdef\n");
    }
    assert_eq!(buf.len(), 64);
    assert_eq!(buf.line_count(), MAX_LINES);
    assert_eq!(buf.total_written(), 17_000);
}

#[test]
fn tail_text_returns_latest_bytes_after_wrap() {
    let mut buf = RollingBuffer::new(8);
    buf.feed(b"abcdefgh");
    buf.feed(b"XY");
    assert_eq!(buf.tail_text(4), "ghXY");
    assert_eq!(buf.tail_text(8), "cdefghXY");
}

#[test]
fn clear_resets_everything() {
    let mut buf = RollingBuffer::new(64);
    buf.feed(b"some lines\nand a partial");
    buf.clear();
    assert!(buf.is_empty());
    assert_eq!(buf.tail_text(64), "");
    assert_eq!(buf.recent_lines(10).count(), 0);
}

#[test]
fn line_deque_is_bounded() {
    let mut buf = RollingBuffer::new(4096);
    for i in 0..500 {
        buf.feed(format!("line {i}\n").as_bytes());
    }
    assert_eq!(buf.line_count(), MAX_LINES);
    let last: Vec<&str> = buf.recent_lines(1).collect();
    assert_eq!(last, vec!["line 499"]);
}

proptest! {
    #[test]
    fn memory_stays_bounded(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 0..64)) {
        let mut buf = RollingBuffer::new(4096);
        for chunk in &chunks {
            buf.feed(chunk);
        }
        prop_assert!(buf.len() <= 4096);
        prop_assert!(buf.line_count() <= MAX_LINES);
    }

    #[test]
    fn tail_matches_suffix_of_plain_input(data in prop::collection::vec(0x20u8..0x7f, 1..2048)) {
        let mut buf = RollingBuffer::new(256);
        buf.feed(&data);
        let expected_len = data.len().min(256);
        let expected: String = String::from_utf8_lossy(&data[data.len() - expected_len..]).into_owned();
        prop_assert_eq!(buf.tail_text(256), expected);
    }
}
