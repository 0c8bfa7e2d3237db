// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use anyhow::Context;

#[test]
fn exit_codes() {
    assert_eq!(ErrorKind::Config.exit_code(), 2);
    assert_eq!(ErrorKind::Environment.exit_code(), 3);
    assert_eq!(ErrorKind::Network.exit_code(), 4);
    assert_eq!(ErrorKind::Interrupted.exit_code(), 130);
    assert_eq!(ErrorKind::Internal.exit_code(), 1);
}

#[test]
fn fault_classifies_through_chain() {
    let err = Fault::config("bad policy").context("loading startup state");
    assert_eq!(exit_code_for(&err), 2);

    let err = Fault::environment("forkpty failed").context("spawning child");
    assert_eq!(exit_code_for(&err), 3);
}

#[test]
fn unclassified_error_is_general() {
    let err = anyhow::anyhow!("something broke");
    assert_eq!(exit_code_for(&err), 1);
}

#[test]
fn fault_display_includes_kind() {
    let fault = Fault::new(ErrorKind::Network, "telegram unreachable");
    assert_eq!(fault.to_string(), "network: telegram unreachable");
}
