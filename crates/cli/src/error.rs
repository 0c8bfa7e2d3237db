// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Failure taxonomy and process exit codes.
//!
//! Guard failures (stale nonce, expired TTL, already-terminal status) are
//! not represented here — they are expected outcomes recorded as audit
//! events, never errors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified failure kinds, each mapping to a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid policy, missing channel credentials, banned overrides.
    Config,
    /// PTY spawn failure, tool not found, unsupported platform.
    Environment,
    /// Channel API unreachable beyond retry budget.
    Network,
    /// Audit chain break, database corruption.
    Integrity,
    /// Injection gate timeout, task restart limit exceeded.
    Resource,
    /// Interrupted by the user (SIGINT).
    Interrupted,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config => 2,
            Self::Environment => 3,
            Self::Network => 4,
            Self::Interrupted => 130,
            Self::Integrity | Self::Resource | Self::Internal => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Environment => "environment",
            Self::Network => "network",
            Self::Integrity => "integrity",
            Self::Resource => "resource",
            Self::Interrupted => "interrupted",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error carrying its [`ErrorKind`] through an `anyhow` chain.
#[derive(Debug)]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self::new(ErrorKind::Config, message))
    }

    pub fn environment(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self::new(ErrorKind::Environment, message))
    }

    pub fn network(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self::new(ErrorKind::Network, message))
    }

    pub fn integrity(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self::new(ErrorKind::Integrity, message))
    }

    pub fn resource(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self::new(ErrorKind::Resource, message))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

/// Resolve the exit code for a top-level error.
///
/// Walks the anyhow chain looking for a [`Fault`]; unclassified errors
/// exit with the general code 1.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(fault) = cause.downcast_ref::<Fault>() {
            return fault.kind.exit_code();
        }
    }
    1
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
