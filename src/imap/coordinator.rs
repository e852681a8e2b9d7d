//! Per-folder coordination between synchronization and idle listeners.
//!
//! A folder must not be idled on while a synchronization runs on it, and
//! vice versa. This registry provides the wait/notify half of that contract;
//! it is a best-effort barrier, not a lock — callers re-check after acquiring
//! the resource they were waiting for.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

#[derive(Default)]
struct Registry {
    /// Folder -> completion signal for the synchronization in progress.
    /// The signal stays registered (fired) after completion.
    syncing: HashMap<String, watch::Sender<bool>>,
    /// Folder -> label of the listener currently holding an idle session.
    idling: HashMap<String, String>,
}

#[derive(Default)]
pub struct SyncIdleCoordinator {
    registry: Mutex<Registry>,
}

impl SyncIdleCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a synchronization started on `folder`. Replaces any prior
    /// signal; stale waiters on the replaced signal are woken.
    pub fn register_syncing(&self, folder: &str) {
        let (tx, _rx) = watch::channel(false);
        self.registry
            .lock()
            .unwrap()
            .syncing
            .insert(folder.to_string(), tx);
    }

    /// Fire the completion signal for `folder`, waking every waiter.
    pub fn unregister_syncing(&self, folder: &str) {
        if let Some(tx) = self.registry.lock().unwrap().syncing.get(folder) {
            tx.send_replace(true);
        }
    }

    /// Block until the synchronization registered for `folder` completes.
    /// Returns immediately if none is registered. A new synchronization may
    /// register itself between this returning and the caller's next action.
    pub async fn wait_for_sync(&self, folder: &str) {
        let rx = {
            let registry = self.registry.lock().unwrap();
            registry.syncing.get(folder).map(|tx| tx.subscribe())
        };
        if let Some(mut rx) = rx {
            // A dropped sender (signal replaced) also wakes us.
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    /// Bookkeeping only: record which listener idles on `folder`.
    pub fn register_idling(&self, folder: &str, listener: &str) {
        self.registry
            .lock()
            .unwrap()
            .idling
            .insert(folder.to_string(), listener.to_string());
    }

    pub fn unregister_idling(&self, folder: &str) {
        self.registry.lock().unwrap().idling.remove(folder);
    }

    /// Label of the listener currently idling on `folder`, if any.
    pub fn idling_listener(&self, folder: &str) -> Option<String> {
        self.registry.lock().unwrap().idling.get(folder).cloned()
    }
}
