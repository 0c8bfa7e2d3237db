// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic policy swap and live file reload.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::audit::{Audit, AuditEvent};

use super::{load_policy, Policy};

/// Shared handle to the currently-loaded policy. Readers clone the `Arc`
/// and keep evaluating against a consistent snapshot; reload swaps the
/// whole policy at once.
#[derive(Clone)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<Policy>>>,
}

impl PolicyHandle {
    pub fn new(policy: Policy) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(policy))) }
    }

    pub fn get(&self) -> Arc<Policy> {
        self.inner.read().clone()
    }

    pub fn set(&self, policy: Policy) {
        *self.inner.write() = Arc::new(policy);
    }
}

/// Watch the policy file and swap the handle on change.
///
/// Uses `notify` events with a polling fallback; an invalid file keeps the
/// previous policy and logs the rejection.
pub async fn watch_policy_file(
    path: PathBuf,
    handle: PolicyHandle,
    audit: Arc<Audit>,
    shutdown: CancellationToken,
) {
    let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
    let _watcher = setup_notify_watcher(&path, wake_tx);
    let mut poll = tokio::time::interval(Duration::from_secs(10));
    poll.tick().await; // consume the immediate first tick

    let mut last_hash = handle.get().content_hash.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake_rx.recv() => {}
            _ = poll.tick() => {}
        }

        match load_policy(&path) {
            Ok(policy) if policy.content_hash != last_hash => {
                last_hash = policy.content_hash.clone();
                info!(
                    name = %policy.name,
                    autonomy = %policy.autonomy_mode,
                    rules = policy.rules.len(),
                    "policy reloaded"
                );
                audit.record(AuditEvent::PolicyLoaded {
                    name: policy.name.clone(),
                    content_hash: policy.content_hash.clone(),
                    autonomy_mode: policy.autonomy_mode.to_string(),
                });
                handle.set(policy);
            }
            Ok(_) => {}
            Err(e) => error!("policy reload rejected, keeping previous: {e:#}"),
        }
    }
}

fn setup_notify_watcher(
    path: &std::path::Path,
    wake_tx: mpsc::Sender<()>,
) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
        let _ = wake_tx.try_send(());
    })
    .ok()?;
    // Watch the parent directory so atomic rename-into-place is seen too.
    let watch_path = path.parent().unwrap_or(path);
    watcher.watch(watch_path, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}
