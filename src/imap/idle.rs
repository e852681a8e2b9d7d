//! Idle supervision: push-notification listeners and the keep-alive sweep.
//!
//! Each sweep round spawns one listener task per pooled session slot. A
//! listener bound to a folder holds a long-blocking IDLE wait on it (or a
//! NOOP keep-alive when the server lacks IDLE) and triggers a synchronization
//! when the server reports a change. Slots beyond the configured idle folders
//! keep their session warm with a plain NOOP. The sweep tears every listener
//! down at the end of the round, so the supervisor never holds more sessions
//! than the pool allows.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AccountConfig;
use crate::constants::NOOP_FOLDER_TAG;
use crate::error::ImapError;
use crate::imap::coordinator::SyncIdleCoordinator;
use crate::imap::pool::ConnectionPool;
use crate::imap::session::{IdleOutcome, Session};
use crate::sync::Synchronizer;

pub struct IdleSupervisor {
    pool: ConnectionPool,
    coordinator: Arc<SyncIdleCoordinator>,
    synchronizer: Arc<dyn Synchronizer>,
    account: String,
    idle_folders: Vec<String>,
}

impl IdleSupervisor {
    pub fn new(
        account: &AccountConfig,
        pool: ConnectionPool,
        coordinator: Arc<SyncIdleCoordinator>,
        synchronizer: Arc<dyn Synchronizer>,
    ) -> Self {
        Self {
            pool,
            coordinator,
            synchronizer,
            account: account.name.clone(),
            idle_folders: account.idle_folders.clone(),
        }
    }

    /// Keep-alive sweep. Runs until `stop` turns true, then returns after
    /// every spawned listener has finished its current step.
    pub async fn run(&self, interval: Duration, mut stop: watch::Receiver<bool>) {
        tracing::debug!("Keepalive sweep started");
        loop {
            if *stop.borrow() {
                break;
            }

            let slots = self.pool.session_count().await;
            tracing::debug!("Keepalive: spawning {} listeners", slots);
            let mut listeners: Vec<(watch::Sender<bool>, JoinHandle<()>)> =
                Vec::with_capacity(slots);

            for slot in 0..slots {
                let (stop_tx, stop_rx) = watch::channel(false);
                let handle = match self.idle_folders.get(slot) {
                    Some(folder) => tokio::spawn(idle_listener(
                        self.pool.clone(),
                        Arc::clone(&self.coordinator),
                        Arc::clone(&self.synchronizer),
                        self.account.clone(),
                        folder.clone(),
                        format!("idle-{}", slot),
                        stop_rx,
                    )),
                    None => tokio::spawn(noop_listener(self.pool.clone(), stop_rx)),
                };
                listeners.push((stop_tx, handle));
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.wait_for(|stopped| *stopped) => {}
            }

            for (stop_tx, _) in &listeners {
                stop_tx.send_replace(true);
            }
            for (_, handle) in listeners {
                if let Err(e) = handle.await {
                    tracing::warn!("Idle listener panicked: {}", e);
                }
            }
        }
        tracing::debug!("Keepalive sweep stopped");
    }
}

/// Listener loop for one idle-target folder.
async fn idle_listener(
    pool: ConnectionPool,
    coordinator: Arc<SyncIdleCoordinator>,
    synchronizer: Arc<dyn Synchronizer>,
    account: String,
    folder: String,
    label: String,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            return;
        }

        // Never idle on a folder that is being synchronized. Best-effort:
        // the registration below is what other components observe.
        coordinator.wait_for_sync(&folder).await;

        let mut session = match pool.acquire(Some(&folder)).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Idle listener '{}' could not acquire a session: {}", folder, e);
                return;
            }
        };
        coordinator.register_idling(&folder, &label);

        let outcome = listen_once(&mut session, &folder, stop.clone()).await;

        coordinator.unregister_idling(&folder);
        match outcome {
            Ok(IdleOutcome::Changed) => {
                pool.release(session).await;
                tracing::info!("Idle listener '{}' received a change notification", folder);
                coordinator.register_syncing(&folder);
                if let Err(e) = synchronizer.sync_folder(&account, &folder).await {
                    tracing::warn!("Sync of '{}' failed: {:#}", folder, e);
                }
                coordinator.unregister_syncing(&folder);
                // Loop; the stop signal is re-checked at the top.
            }
            Ok(IdleOutcome::Stopped) => {
                pool.release(session).await;
                return;
            }
            Err(e) => {
                tracing::warn!("Idle listener '{}' aborted: {}", folder, e);
                session.mark_terminate();
                pool.release(session).await;
                return;
            }
        }
    }
}

/// One wait on the folder: IDLE when the server supports it, otherwise a
/// NOOP keep-alive followed by sitting out the window.
async fn listen_once(
    session: &mut Session,
    folder: &str,
    mut stop: watch::Receiver<bool>,
) -> Result<IdleOutcome, ImapError> {
    session.select(folder, false).await?;
    if session.capabilities().contains("IDLE") {
        session.idle(stop).await
    } else {
        session.noop().await?;
        let _ = stop.wait_for(|stopped| *stopped).await;
        Ok(IdleOutcome::Stopped)
    }
}

/// Keep-alive task for a session slot with no idle folder: hold a session,
/// NOOP it once, and give it back when the sweep ends.
async fn noop_listener(pool: ConnectionPool, mut stop: watch::Receiver<bool>) {
    let mut session = match pool.acquire(Some(NOOP_FOLDER_TAG)).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Keepalive listener could not acquire a session: {}", e);
            return;
        }
    };
    if let Err(e) = session.noop().await {
        tracing::warn!("Keepalive NOOP failed: {}", e);
        session.mark_terminate();
    }
    let _ = stop.wait_for(|stopped| *stopped).await;
    pool.release(session).await;
}
