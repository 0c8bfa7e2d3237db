// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Layered runtime configuration: CLI flag over environment over default.
//!
//! Two keys are frozen: the yes/no safe default (`"n"`) and the rolling
//! buffer size (4096). They remain flags so an override attempt is a
//! visible configuration error instead of a silently-ignored setting.

use std::fmt;
use std::path::PathBuf;

use clap::Parser;

use crate::error::Fault;
use crate::session::run::SupervisorConfig;

/// The only permitted yes/no safe default.
pub const FROZEN_YES_NO_DEFAULT: &str = "n";

/// The only permitted rolling-buffer size.
pub const FROZEN_MAX_BUFFER_BYTES: usize = 4096;

/// Options for `atlasbridge run`.
#[derive(Parser)]
pub struct Config {
    /// Tool to supervise (after --), e.g. `-- claude --dangerously...`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Human-readable label shown in channel messages.
    #[arg(long, env = "ATLASBRIDGE_SESSION_LABEL")]
    pub session_label: Option<String>,

    /// Autopilot policy file (YAML).
    #[arg(long = "policy", env = "ATLASBRIDGE_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Telegram bot token.
    #[arg(long, env = "ATLASBRIDGE_TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_bot_token: Option<String>,

    /// Chat that receives prompts.
    #[arg(long, env = "ATLASBRIDGE_TELEGRAM_CHAT_ID")]
    pub telegram_chat_id: Option<i64>,

    /// Comma-separated Telegram user ids allowed to reply.
    #[arg(long, env = "ATLASBRIDGE_TELEGRAM_ALLOWED_USERS", value_delimiter = ',')]
    pub telegram_allowed_users: Vec<String>,

    /// Prompt TTL in seconds.
    #[arg(long, env = "ATLASBRIDGE_TIMEOUT_SECONDS", default_value = "300")]
    pub timeout_seconds: u64,

    /// Silence window before the stall signal fires, in seconds.
    #[arg(long, env = "ATLASBRIDGE_STUCK_TIMEOUT_SECONDS", default_value = "2.0")]
    pub stuck_timeout_seconds: f64,

    /// Detector pause after an injection, in milliseconds.
    #[arg(long, env = "ATLASBRIDGE_ECHO_SUPPRESS_MS", default_value = "500")]
    pub echo_suppress_ms: u64,

    /// Maximum free-text reply length.
    #[arg(long, env = "ATLASBRIDGE_FREE_TEXT_MAX_LENGTH", default_value = "200")]
    pub free_text_max_length: usize,

    /// Rolling buffer size in bytes (frozen).
    #[arg(long, env = "ATLASBRIDGE_MAX_BUFFER_BYTES", default_value = "4096")]
    pub max_buffer_bytes: usize,

    /// Safe default for yes/no prompts (frozen).
    #[arg(long, env = "ATLASBRIDGE_YES_NO_SAFE_DEFAULT", default_value = "n")]
    pub yes_no_safe_default: String,

    /// Settle delay after writing an injection, in milliseconds.
    #[arg(long, env = "ATLASBRIDGE_INJECT_SETTLE_MS", default_value = "100")]
    pub inject_settle_ms: u64,

    /// Injection gate acquisition timeout, in seconds.
    #[arg(long, env = "ATLASBRIDGE_INJECTION_TIMEOUT_SECONDS", default_value = "5")]
    pub injection_timeout_seconds: u64,

    /// Supervisor task wind-down budget, in seconds.
    #[arg(long, env = "ATLASBRIDGE_TASK_TIMEOUT_SECONDS", default_value = "30")]
    pub task_timeout_seconds: u64,

    /// State directory (database, audit log, pid file).
    #[arg(long, env = "ATLASBRIDGE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Database path override.
    #[arg(long, env = "ATLASBRIDGE_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ATLASBRIDGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (json or text).
    #[arg(long, env = "ATLASBRIDGE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Terminal columns when the host size is unavailable.
    #[arg(long, env = "ATLASBRIDGE_COLS", default_value = "200")]
    pub cols: u16,

    /// Terminal rows when the host size is unavailable.
    #[arg(long, env = "ATLASBRIDGE_ROWS", default_value = "50")]
    pub rows: u16,

    /// Opt into experimental platform backends.
    #[arg(long)]
    pub experimental: bool,

    /// Machine-readable output.
    #[arg(long)]
    pub json: bool,
}

/// Resolved filesystem layout under the state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub db: PathBuf,
    pub audit: PathBuf,
    pub decisions: PathBuf,
    pub pid: PathBuf,
    pub pause: PathBuf,
}

impl Config {
    /// Validate the configuration after parsing. The supervisor never
    /// starts in a misconfigured state.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !cfg!(unix) {
            return Err(Fault::environment(
                "only POSIX pseudoterminals are supported on this build",
            ));
        }
        if self.command.is_empty() {
            return Err(Fault::config("no tool given; usage: atlasbridge run -- <tool> [args]"));
        }
        if self.yes_no_safe_default != FROZEN_YES_NO_DEFAULT {
            return Err(Fault::config(format!(
                "prompts.yes_no_safe_default is frozen to \"{FROZEN_YES_NO_DEFAULT}\"; \
                 {:?} is not accepted",
                self.yes_no_safe_default
            )));
        }
        if self.max_buffer_bytes != FROZEN_MAX_BUFFER_BYTES {
            return Err(Fault::config(format!(
                "prompts.max_buffer_bytes is frozen to {FROZEN_MAX_BUFFER_BYTES}; \
                 {} is not accepted",
                self.max_buffer_bytes
            )));
        }
        if self.timeout_seconds == 0 {
            return Err(Fault::config("prompts.timeout_seconds must be positive"));
        }
        if !self.stuck_timeout_seconds.is_finite() || self.stuck_timeout_seconds <= 0.0 {
            return Err(Fault::config("prompts.stuck_timeout_seconds must be positive"));
        }
        if self.telegram_bot_token.as_deref().unwrap_or("").is_empty() {
            return Err(Fault::config("telegram.bot_token is required"));
        }
        if self.telegram_chat_id.is_none() {
            return Err(Fault::config("telegram.chat_id is required"));
        }
        if self.telegram_allowed_users.iter().all(|u| u.trim().is_empty()) {
            return Err(Fault::config("telegram.allowed_users must name at least one identity"));
        }
        Ok(())
    }

    /// Resolve the state directory:
    /// `--state-dir` > `$XDG_STATE_HOME/atlasbridge` > `~/.local/state/atlasbridge`.
    pub fn paths(&self) -> StatePaths {
        let state_dir = match self.state_dir {
            Some(ref dir) => dir.clone(),
            None => {
                let state_home = std::env::var("XDG_STATE_HOME").unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_default();
                    format!("{home}/.local/state")
                });
                PathBuf::from(state_home).join("atlasbridge")
            }
        };
        StatePaths {
            db: self.db_path.clone().unwrap_or_else(|| state_dir.join("atlasbridge.db")),
            audit: state_dir.join("audit.log"),
            decisions: state_dir.join("autopilot_decisions.jsonl"),
            pid: state_dir.join("atlasbridge.pid"),
            pause: state_dir.join("autopilot.paused"),
            state_dir,
        }
    }

    pub fn supervisor_config(&self, forward_output: bool, relay_stdin: bool) -> SupervisorConfig {
        use std::time::Duration;
        SupervisorConfig {
            cols: self.cols,
            rows: self.rows,
            max_buffer_bytes: self.max_buffer_bytes,
            ttl: Duration::from_secs(self.timeout_seconds),
            stuck_timeout: Duration::from_secs_f64(self.stuck_timeout_seconds),
            echo_suppress: Duration::from_millis(self.echo_suppress_ms),
            inject_settle: Duration::from_millis(self.inject_settle_ms),
            injection_timeout: Duration::from_secs(self.injection_timeout_seconds),
            task_timeout: Duration::from_secs(self.task_timeout_seconds),
            free_text_max: self.free_text_max_length,
            forward_output,
            relay_stdin,
        }
    }
}

// Hand-written so the bot token can never reach a log line through `{:?}`.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("command", &self.command)
            .field("session_label", &self.session_label)
            .field("policy_file", &self.policy_file)
            .field("telegram_bot_token", &self.telegram_bot_token.as_ref().map(|_| "<redacted>"))
            .field("telegram_chat_id", &self.telegram_chat_id)
            .field("telegram_allowed_users", &self.telegram_allowed_users)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("stuck_timeout_seconds", &self.stuck_timeout_seconds)
            .field("echo_suppress_ms", &self.echo_suppress_ms)
            .field("free_text_max_length", &self.free_text_max_length)
            .field("state_dir", &self.state_dir)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
