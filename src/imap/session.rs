//! Session surface: the protocol-collaborator trait and the pool's handle.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::error::ImapError;

pub type SessionId = u64;

/// One entry from a LIST response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub delimiter: Option<String>,
}

/// How an idle wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server reported a mailbox change.
    Changed,
    /// The stop signal fired and the wait was terminated cleanly.
    Stopped,
}

/// Challenge responder for SASL exchanges: raw server challenge in, raw
/// client response out. `None` abandons the exchange.
pub type ChallengeResponder<'a> = &'a mut (dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send);

/// One live connection to the server, as the pool sees it.
///
/// Implementations wrap a concrete transport; the shipped one lives in
/// [`crate::imap::transport`]. All calls are atomic remote operations.
#[async_trait]
pub trait RemoteSession: Send {
    /// Capabilities advertised by the server. Refreshed by implementations
    /// after authentication changes what the server is willing to offer.
    fn capabilities(&self) -> &HashSet<String>;

    /// Whether the transport arrived already authenticated (tunnel).
    fn preauthenticated(&self) -> bool {
        false
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<(), ImapError>;

    async fn authenticate(
        &mut self,
        mechanism: &str,
        responder: ChallengeResponder<'_>,
    ) -> Result<(), ImapError>;

    async fn list(&mut self, reference: &str, pattern: &str)
    -> Result<Vec<ListEntry>, ImapError>;

    async fn select(&mut self, folder: &str, readonly: bool) -> Result<(), ImapError>;

    /// Block until the server reports a change, the connection dies, or
    /// `stop` turns true. Implementations complete the protocol exchange
    /// (DONE) after a stop before returning.
    async fn idle(&mut self, stop: watch::Receiver<bool>) -> Result<IdleOutcome, ImapError>;

    async fn noop(&mut self) -> Result<(), ImapError>;

    async fn logout(&mut self) -> Result<(), ImapError>;
}

/// Opens fresh, not-yet-authenticated sessions for the pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, ImapError>;
}

struct SessionCore {
    remote: Box<dyn RemoteSession>,
    /// Folder currently selected, with its read-only mode. Re-selecting the
    /// same folder in the same mode is a no-op.
    selected: Option<(String, bool)>,
}

pub(crate) struct SessionShared {
    id: SessionId,
    capabilities: HashSet<String>,
    terminate: AtomicBool,
    core: Mutex<SessionCore>,
}

impl SessionShared {
    /// Log the session out, ignoring protocol errors on the way down.
    pub(crate) async fn logout(&self) {
        let mut core = self.core.lock().await;
        core.remote.logout().await.ok();
    }
}

/// An authenticated session checked out of the pool.
///
/// Exclusively owned by the acquiring task until handed back via
/// [`crate::imap::pool::ConnectionPool::release`]. The pool keeps a shared
/// reference so `shutdown` can log out sessions that are still assigned.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn new(id: SessionId, remote: Box<dyn RemoteSession>) -> Self {
        let capabilities = remote.capabilities().clone();
        Self {
            shared: Arc::new(SessionShared {
                id,
                capabilities,
                terminate: AtomicBool::new(false),
                core: Mutex::new(SessionCore {
                    remote,
                    selected: None,
                }),
            }),
        }
    }

    pub(crate) fn shared(&self) -> Arc<SessionShared> {
        Arc::clone(&self.shared)
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn capabilities(&self) -> &HashSet<String> {
        &self.shared.capabilities
    }

    /// Mark the session unfit for reuse; the pool will log it out instead of
    /// re-pooling it on release. Callers must mark sessions whose remote
    /// calls failed at the protocol level.
    pub fn mark_terminate(&self) {
        self.shared.terminate.store(true, Ordering::Relaxed);
    }

    pub fn terminated(&self) -> bool {
        self.shared.terminate.load(Ordering::Relaxed)
    }

    pub async fn select(&mut self, folder: &str, readonly: bool) -> Result<(), ImapError> {
        let mut core = self.shared.core.lock().await;
        if core
            .selected
            .as_ref()
            .is_some_and(|(f, ro)| f == folder && *ro == readonly)
        {
            return Ok(());
        }
        match core.remote.select(folder, readonly).await {
            Ok(()) => {
                core.selected = Some((folder.to_string(), readonly));
                Ok(())
            }
            Err(e) => {
                core.selected = None;
                Err(e)
            }
        }
    }

    pub async fn selected_folder(&self) -> Option<String> {
        let core = self.shared.core.lock().await;
        core.selected.as_ref().map(|(f, _)| f.clone())
    }

    pub async fn list(
        &mut self,
        reference: &str,
        pattern: &str,
    ) -> Result<Vec<ListEntry>, ImapError> {
        let mut core = self.shared.core.lock().await;
        core.remote.list(reference, pattern).await
    }

    pub async fn idle(&mut self, stop: watch::Receiver<bool>) -> Result<IdleOutcome, ImapError> {
        let mut core = self.shared.core.lock().await;
        core.remote.idle(stop).await
    }

    pub async fn noop(&mut self) -> Result<(), ImapError> {
        let mut core = self.shared.core.lock().await;
        core.remote.noop().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("terminated", &self.terminated())
            .finish()
    }
}
