//! Bounded IMAP connection pool with task affinity.
//!
//! Sessions are expensive to open (handshake + authentication), so they are
//! pooled and reused. The pool enforces `max_connections` with a semaphore,
//! prefers handing a task the session it used last, tracks which sessions
//! serve which folder, and discovers the server's folder delimiter and root
//! exactly once per lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, OnceCell, Semaphore};

use crate::config::AccountConfig;
use crate::credentials::PasswordSource;
use crate::error::ImapError;
use crate::imap::auth::{GssProvider, Negotiator};
use crate::imap::session::{RemoteSession, Session, SessionFactory, SessionId, SessionShared};
use crate::imap::transport::Connector;

/// Server-wide folder naming constants, discovered from the first session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub delimiter: String,
    pub root: String,
}

#[derive(Default)]
struct PoolState {
    /// Idle sessions ready for reuse; most recently released at the back.
    available: Vec<Session>,
    /// Checked-out sessions, kept shared so shutdown can log them out.
    assigned: HashMap<SessionId, Arc<SessionShared>>,
    /// Task that last checked out each session. Reuse hint, not a lock.
    last_owner: HashMap<SessionId, tokio::task::Id>,
    /// Folder -> sessions currently assigned for it. Best-effort diagnostics.
    folder_sessions: HashMap<String, Vec<SessionId>>,
}

struct PoolInner {
    reference: String,
    max_connections: usize,
    factory: Arc<dyn SessionFactory>,
    negotiator: Negotiator,
    /// One permit per allowed concurrent session.
    permits: Semaphore,
    /// Serializes the reuse-or-create decision so racing callers cannot all
    /// start creating when one freed session would do.
    admission: Mutex<()>,
    state: Mutex<PoolState>,
    namespace: OnceCell<Namespace>,
    next_id: AtomicU64,
}

/// Handle to a shared connection pool. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Pool using the built-in async-imap connector.
    pub fn new(
        account: &AccountConfig,
        credentials: Arc<dyn PasswordSource>,
        gss: Option<Arc<dyn GssProvider>>,
    ) -> Self {
        let factory = Arc::new(Connector::new(account.imap.clone()));
        Self::with_factory(account, factory, credentials, gss)
    }

    /// Pool over a custom transport (preauthenticated tunnels, tests).
    pub fn with_factory(
        account: &AccountConfig,
        factory: Arc<dyn SessionFactory>,
        credentials: Arc<dyn PasswordSource>,
        gss: Option<Arc<dyn GssProvider>>,
    ) -> Self {
        let negotiator = Negotiator::new(
            account.name.clone(),
            account.user.clone(),
            account.imap.server.clone(),
            credentials,
            gss,
        );
        Self {
            inner: Arc::new(PoolInner {
                reference: account.imap.reference.clone(),
                max_connections: account.imap.max_connections,
                factory,
                negotiator,
                permits: Semaphore::new(account.imap.max_connections),
                admission: Mutex::new(()),
                state: Mutex::new(PoolState::default()),
                namespace: OnceCell::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    /// Check out an authenticated session, blocking while the pool is at
    /// capacity. `for_folder` tags the session for diagnostics.
    ///
    /// On creation failure the permit is returned and the error propagates;
    /// the caller may retry.
    pub async fn acquire(&self, for_folder: Option<&str>) -> Result<Session, ImapError> {
        let inner = &self.inner;

        // Held across the permit wait on purpose: the next freed session
        // belongs to the caller that has been waiting here, not to a
        // latecomer that would race it to the available list.
        let admission = inner.admission.lock().await;
        let permit = inner
            .permits
            .acquire()
            .await
            .map_err(|_| ImapError::Closed)?;
        permit.forget();
        let mut state = inner.state.lock().await;
        drop(admission);

        if let Some(session) = take_available(&mut state) {
            tracing::debug!("Pool: reusing session {}", session.id());
            check_out(&mut state, &session, for_folder);
            return Ok(session);
        }
        drop(state);

        match self.create_session().await {
            Ok(session) => {
                tracing::debug!("Pool: created session {}", session.id());
                let mut state = inner.state.lock().await;
                check_out(&mut state, &session, for_folder);
                Ok(session)
            }
            Err(e) => {
                inner.permits.add_permits(1);
                Err(e)
            }
        }
    }

    async fn create_session(&self) -> Result<Session, ImapError> {
        let inner = &self.inner;
        let mut remote = inner.factory.connect().await?;
        inner.negotiator.authenticate(remote.as_mut()).await?;

        {
            let reference = inner.reference.clone();
            let remote = remote.as_mut();
            inner
                .namespace
                .get_or_try_init(move || async move {
                    let namespace = discover_namespace(remote, &reference).await?;
                    tracing::debug!(
                        "Pool: discovered delimiter {:?}, root {:?}",
                        namespace.delimiter,
                        namespace.root
                    );
                    Ok::<_, ImapError>(namespace)
                })
                .await?;
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(id, remote))
    }

    /// Hand a session back. Terminate-flagged sessions are logged out and
    /// dropped; healthy ones return to the available list.
    ///
    /// Must be called exactly once per successful `acquire`; releasing a
    /// session the pool did not hand out is a bug in the caller.
    pub async fn release(&self, session: Session) {
        let inner = &self.inner;
        let id = session.id();

        let mut state = inner.state.lock().await;
        assert!(
            state.assigned.remove(&id).is_some(),
            "release() called with a session not checked out from this pool"
        );
        for sessions in state.folder_sessions.values_mut() {
            sessions.retain(|sid| *sid != id);
        }

        if session.terminated() {
            state.last_owner.remove(&id);
            drop(state);
            tracing::debug!("Pool: logging out terminated session {}", id);
            session.shared().logout().await;
        } else {
            tracing::debug!(
                "Pool: session {} returned ({} available)",
                id,
                state.available.len() + 1
            );
            state.available.push(session);
            drop(state);
        }
        inner.permits.add_permits(1);
    }

    /// Block until at least one permit is free, without taking it. A hint
    /// for callers that would otherwise spawn a pile of workers all parked
    /// inside `acquire`; another caller may still win the permit.
    pub async fn wait_for_capacity(&self) {
        if let Ok(permit) = self.inner.permits.acquire().await {
            drop(permit);
        }
    }

    /// Log out every pooled session and reset all bookkeeping, including the
    /// authentication negotiation state. Callers must have quiesced their
    /// workers first; in-flight sessions are logged out underneath them.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        let free = inner.permits.available_permits();
        if free < inner.max_connections {
            inner.permits.add_permits(inner.max_connections - free);
        }

        let available: Vec<Session> = state.available.drain(..).collect();
        let assigned: Vec<Arc<SessionShared>> = state.assigned.drain().map(|(_, s)| s).collect();
        state.last_owner.clear();
        state.folder_sessions.clear();
        drop(state);

        let count = available.len() + assigned.len();
        for session in &available {
            session.shared().logout().await;
        }
        for shared in &assigned {
            shared.logout().await;
        }
        drop(available);

        inner.negotiator.reset();
        tracing::info!("Pool shut down, {} sessions logged out", count);
    }

    /// Folder hierarchy delimiter, defined after the first successful
    /// `acquire`.
    pub fn delimiter(&self) -> Option<String> {
        self.inner.namespace.get().map(|ns| ns.delimiter.clone())
    }

    /// Folder hierarchy root, defined after the first successful `acquire`.
    pub fn root(&self) -> Option<String> {
        self.inner.namespace.get().map(|ns| ns.root.clone())
    }

    /// Total live sessions, available and assigned.
    pub async fn session_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.available.len() + state.assigned.len()
    }

    /// Sessions currently assigned for `folder`. Best-effort diagnostics.
    pub async fn sessions_for_folder(&self, folder: &str) -> Vec<SessionId> {
        let state = self.inner.state.lock().await;
        state
            .folder_sessions
            .get(folder)
            .cloned()
            .unwrap_or_default()
    }
}

/// Pick an available session, preferring one the calling task used before.
/// Most recently released sessions sit at the back, so the scan runs from
/// there.
fn take_available(state: &mut PoolState) -> Option<Session> {
    if state.available.is_empty() {
        return None;
    }
    if let Some(me) = tokio::task::try_id()
        && let Some(pos) = state
            .available
            .iter()
            .rposition(|s| state.last_owner.get(&s.id()) == Some(&me))
    {
        return Some(state.available.remove(pos));
    }
    Some(state.available.remove(0))
}

fn check_out(state: &mut PoolState, session: &Session, for_folder: Option<&str>) {
    let id = session.id();
    state.assigned.insert(id, session.shared());
    if let Some(owner) = tokio::task::try_id() {
        state.last_owner.insert(id, owner);
    }
    if let Some(folder) = for_folder {
        state
            .folder_sessions
            .entry(folder.to_string())
            .or_default()
            .push(id);
    }
}

/// Learn the delimiter and root from a LIST of the reference. Some servers
/// answer an empty-pattern LIST with nothing; retry once with a wildcard.
async fn discover_namespace(
    remote: &mut dyn RemoteSession,
    reference: &str,
) -> Result<Namespace, ImapError> {
    let mut entries = remote.list(reference, "").await?;
    if entries.is_empty() {
        entries = remote.list(reference, "*").await?;
    }
    let first = entries
        .first()
        .ok_or_else(|| ImapError::Protocol("server returned no LIST entries".to_string()))?;
    Ok(Namespace {
        delimiter: first.delimiter.clone().unwrap_or_default(),
        root: first.name.clone(),
    })
}
