// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level `run` command: wire the store, audit log, policy, channel,
//! router, and one supervised session together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::audit::{Audit, AuditEvent};
use crate::channel::{Channel, ChannelHealth, TelegramChannel};
use crate::config::Config;
use crate::decisions::DecisionTrace;
use crate::error::Fault;
use crate::pidfile::PidFile;
use crate::policy::{load_policy, reload, Policy, PolicyHandle};
use crate::prompt::{now_us, SessionStatus};
use crate::pty::{host_winsize, ExitStatus, RawModeGuard};
use crate::router::Router;
use crate::session::{run_session, spawn_backend, SessionDeps, SessionHandle, SessionInfo};
use crate::store::Store;

/// Everything `main` needs to report and exit.
pub struct RunResult {
    pub session_id: Uuid,
    pub status: ExitStatus,
    pub session_status: SessionStatus,
    pub health: ChannelHealth,
}

/// Initialize tracing/logging from config.
///
/// Priority: `--log-level` / `ATLASBRIDGE_LOG_LEVEL` > `RUST_LOG` >
/// default (`info`). Uses `try_init` so tests can call it repeatedly.
pub fn init_tracing(log_level: &str, log_format: &str) {
    use tracing_subscriber::fmt;

    let filter = if std::env::var("ATLASBRIDGE_LOG_LEVEL").is_err() && log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    } else {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match log_format {
        "json" => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
    };
    drop(result);
}

/// Run one supervised session to completion.
pub async fn run(config: Config) -> anyhow::Result<RunResult> {
    init_tracing(&config.log_level, &config.log_format);
    // reqwest is built against a provider-less rustls; install ring once.
    let _ = rustls::crypto::ring::default_provider().install_default();

    config.validate()?;
    let paths = config.paths();
    std::fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("creating state dir {}", paths.state_dir.display()))?;
    let _pid_lock = PidFile::acquire(&paths.pid)?;

    let store = Arc::new(Store::open(&paths.db)?);
    let audit = Arc::new(Audit::open(&paths.audit, Some(Arc::clone(&store)))?);
    let decisions = Arc::new(DecisionTrace::open(&paths.decisions));
    let shutdown = CancellationToken::new();

    // Policy: explicit file or the everything-escalates default.
    let policy = match config.policy_file {
        Some(ref path) => load_policy(path)?,
        None => Policy::disabled(),
    };
    audit.record(AuditEvent::PolicyLoaded {
        name: policy.name.clone(),
        content_hash: policy.content_hash.clone(),
        autonomy_mode: policy.autonomy_mode.to_string(),
    });
    info!(
        name = %policy.name,
        autonomy = %policy.autonomy_mode,
        rules = policy.rules.len(),
        "policy loaded"
    );
    let policy_handle = PolicyHandle::new(policy);
    if let Some(path) = config.policy_file.clone() {
        tokio::spawn(reload::watch_policy_file(
            path,
            policy_handle.clone(),
            Arc::clone(&audit),
            shutdown.clone(),
        ));
    }

    // Channel. `validate` guaranteed the credentials exist.
    let token = config.telegram_bot_token.as_deref().unwrap_or_default();
    let chat_id = config
        .telegram_chat_id
        .ok_or_else(|| Fault::config("telegram.chat_id is required"))?;
    let telegram = Arc::new(TelegramChannel::new(token, chat_id, &config.telegram_allowed_users)?);
    let channel: Arc<dyn Channel> = telegram;
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    tokio::spawn(Arc::clone(&channel).start(inbound_tx, shutdown.clone()));

    let router = Arc::new(Router::new(
        Arc::clone(&store),
        Arc::clone(&audit),
        decisions,
        policy_handle,
        Arc::clone(&channel),
        paths.pause.clone(),
        config.free_text_max_length,
    ));

    // Session row and backend.
    let session_id = Uuid::new_v4();
    let cwd = std::env::current_dir()?.display().to_string();
    let tool = config.command[0].clone();
    store.create_session(
        session_id,
        &tool,
        &cwd,
        config.session_label.as_deref(),
        now_us(),
    )?;

    let (cols, rows) = host_winsize().unwrap_or((config.cols, config.rows));
    let backend = spawn_backend(&config.command, &[], cols, rows)?;

    // Raw mode for the passthrough terminal; restored unconditionally.
    let raw_guard = RawModeGuard::enter().ok();
    if let Some(ref guard) = raw_guard {
        guard.install_panic_hook();
    }

    let (prompt_tx, prompt_rx) = mpsc::channel(64);
    let (injection_tx, injection_rx) = mpsc::channel(64);
    let tail = Arc::new(parking_lot::Mutex::new(String::new()));

    let info = SessionInfo {
        session_id,
        tool,
        cwd,
        label: config.session_label.clone(),
    };
    router.register_session(SessionHandle {
        info: info.clone(),
        injection_tx,
        tail: Arc::clone(&tail),
    });

    // Re-notify prompts that survived a previous daemon run, then start
    // the routing loop.
    router.recover(now_us()).await;
    let router_task =
        tokio::spawn(Arc::clone(&router).run(prompt_rx, inbound_rx, shutdown.clone()));

    // SIGINT → cooperative shutdown.
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let supervisor_config = config.supervisor_config(true, true);
    let deps = SessionDeps {
        store: Arc::clone(&store),
        audit: Arc::clone(&audit),
        prompt_tx,
        injection_rx,
        tail,
    };
    let outcome = run_session(&supervisor_config, &info, deps, backend, shutdown.clone()).await;

    // Wind down: stop the router and channel, restore the terminal.
    router.unregister_session(session_id);
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), router_task).await;
    channel.close().await;
    let health = channel.healthcheck();
    drop(raw_guard);
    audit.flush();

    let outcome = outcome?;
    Ok(RunResult {
        session_id,
        status: outcome.status,
        session_status: outcome.session_status,
        health,
    })
}
