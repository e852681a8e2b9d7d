//! Scripted collaborators for the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::watch;

use crate::credentials::PasswordSource;
use crate::error::ImapError;
use crate::imap::auth::{GssContext, GssError, GssProvider, GssStatus};
use crate::imap::session::{
    ChallengeResponder, IdleOutcome, ListEntry, RemoteSession, SessionFactory,
};
use crate::sync::Synchronizer;

pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

/// Route tracing output through the test harness. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What one `idle()` call reports.
#[derive(Debug, Clone, Copy)]
pub(crate) enum IdleScript {
    Changed,
    Abort,
}

/// A remote session with scripted behavior. Unscripted idle calls park until
/// the stop signal fires, like a quiet server.
pub(crate) struct ScriptedSession {
    pub caps: HashSet<String>,
    pub preauth: bool,
    calls: CallLog,
    logouts: Arc<AtomicUsize>,
    list_counter: Option<Arc<AtomicUsize>>,
    failing_mechanisms: HashSet<String>,
    reject_logins: bool,
    failing_folder: Option<String>,
    challenge_rounds: usize,
    list_script: Mutex<VecDeque<Vec<ListEntry>>>,
    idle_script: Mutex<VecDeque<IdleScript>>,
}

impl ScriptedSession {
    pub(crate) fn with_capabilities(caps: &[&str]) -> Self {
        Self {
            caps: caps.iter().map(|c| c.to_string()).collect(),
            preauth: false,
            calls: Arc::new(Mutex::new(Vec::new())),
            logouts: Arc::new(AtomicUsize::new(0)),
            list_counter: None,
            failing_mechanisms: HashSet::new(),
            reject_logins: false,
            failing_folder: None,
            challenge_rounds: 1,
            list_script: Mutex::new(VecDeque::new()),
            idle_script: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn calls(&self) -> CallLog {
        Arc::clone(&self.calls)
    }

    pub(crate) fn shared_calls(mut self, calls: CallLog) -> Self {
        self.calls = calls;
        self
    }

    pub(crate) fn shared_logouts(mut self, logouts: Arc<AtomicUsize>) -> Self {
        self.logouts = logouts;
        self
    }

    pub(crate) fn shared_list_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.list_counter = Some(counter);
        self
    }

    pub(crate) fn failing_mechanism(mut self, mechanism: &str) -> Self {
        self.failing_mechanisms.insert(mechanism.to_string());
        self
    }

    pub(crate) fn rejecting_logins(mut self) -> Self {
        self.reject_logins = true;
        self
    }

    pub(crate) fn failing_folder(mut self, folder: &str) -> Self {
        self.failing_folder = Some(folder.to_string());
        self
    }

    /// Number of challenges the server sends per SASL exchange.
    pub(crate) fn challenges(mut self, rounds: usize) -> Self {
        self.challenge_rounds = rounds;
        self
    }

    /// Successive `list()` results; exhausted scripts fall back to a single
    /// INBOX entry with a `/` delimiter.
    pub(crate) fn list_returns(self, script: Vec<Vec<ListEntry>>) -> Self {
        *self.list_script.lock().unwrap() = script.into();
        self
    }

    pub(crate) fn idle_script(self, script: Vec<IdleScript>) -> Self {
        *self.idle_script.lock().unwrap() = script.into();
        self
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    fn capabilities(&self) -> &HashSet<String> {
        &self.caps
    }

    fn preauthenticated(&self) -> bool {
        self.preauth
    }

    async fn login(&mut self, user: &str, _password: &str) -> Result<(), ImapError> {
        self.log(format!("login {}", user));
        if self.reject_logins {
            return Err(ImapError::Auth {
                mechanism: "LOGIN".to_string(),
                reason: "LOGIN rejected by server".to_string(),
            });
        }
        Ok(())
    }

    async fn authenticate(
        &mut self,
        mechanism: &str,
        responder: ChallengeResponder<'_>,
    ) -> Result<(), ImapError> {
        self.log(format!("authenticate {}", mechanism));
        for round in 0..self.challenge_rounds {
            let challenge = format!("challenge-{}", round);
            if responder(challenge.as_bytes()).is_none() {
                return Err(ImapError::Auth {
                    mechanism: mechanism.to_string(),
                    reason: "exchange abandoned by client".to_string(),
                });
            }
        }
        if self.failing_mechanisms.contains(mechanism) {
            return Err(ImapError::Auth {
                mechanism: mechanism.to_string(),
                reason: "mechanism rejected by server".to_string(),
            });
        }
        Ok(())
    }

    async fn list(
        &mut self,
        reference: &str,
        pattern: &str,
    ) -> Result<Vec<ListEntry>, ImapError> {
        self.log(format!("list '{}' '{}'", reference, pattern));
        if let Some(counter) = &self.list_counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let scripted = self.list_script.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| {
            vec![ListEntry {
                name: "INBOX".to_string(),
                delimiter: Some("/".to_string()),
            }]
        }))
    }

    async fn select(&mut self, folder: &str, _readonly: bool) -> Result<(), ImapError> {
        self.log(format!("select {}", folder));
        if self.failing_folder.as_deref() == Some(folder) {
            return Err(ImapError::Protocol(format!("no such folder '{}'", folder)));
        }
        Ok(())
    }

    async fn idle(&mut self, mut stop: watch::Receiver<bool>) -> Result<IdleOutcome, ImapError> {
        self.log("idle".to_string());
        let scripted = self.idle_script.lock().unwrap().pop_front();
        match scripted {
            Some(IdleScript::Changed) => Ok(IdleOutcome::Changed),
            Some(IdleScript::Abort) => {
                Err(ImapError::Abort("connection dropped during IDLE".to_string()))
            }
            None => {
                let _ = stop.wait_for(|stopped| *stopped).await;
                Ok(IdleOutcome::Stopped)
            }
        }
    }

    async fn noop(&mut self) -> Result<(), ImapError> {
        self.log("noop".to_string());
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        self.log("logout".to_string());
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory producing scripted sessions, with optional connect failures.
pub(crate) struct ScriptedFactory {
    build: Box<dyn Fn() -> ScriptedSession + Send + Sync>,
    connects: AtomicUsize,
    failures_left: AtomicUsize,
}

impl ScriptedFactory {
    pub(crate) fn new<F>(build: F) -> Self
    where
        F: Fn() -> ScriptedSession + Send + Sync + 'static,
    {
        Self {
            build: Box::new(build),
            connects: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Number of connect attempts made so far.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make the next `count` connect attempts fail.
    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, ImapError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(ImapError::Connect("scripted connect failure".to_string()));
        }
        Ok(Box::new((self.build)()))
    }
}

/// Password source that counts lookups and records carried error text.
pub(crate) struct CountingPrompt {
    password: String,
    prompts: AtomicUsize,
    seen: Mutex<Vec<Option<String>>>,
}

impl CountingPrompt {
    pub(crate) fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            prompts: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub(crate) fn seen_errors(&self) -> Vec<Option<String>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PasswordSource for CountingPrompt {
    async fn password(&self, _account: &str, prior_error: Option<&str>) -> anyhow::Result<String> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push(prior_error.map(|e| e.to_string()));
        Ok(self.password.clone())
    }
}

/// GSSAPI provider whose contexts complete after two steps, or fail.
pub(crate) struct ScriptedGss {
    fail: bool,
    calls: CallLog,
}

impl ScriptedGss {
    pub(crate) fn succeeding() -> Self {
        Self {
            fail: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn calls(&self) -> CallLog {
        Arc::clone(&self.calls)
    }
}

impl GssProvider for ScriptedGss {
    fn new_context(&self, _service: &str) -> Result<Box<dyn GssContext>, GssError> {
        self.calls.lock().unwrap().push("init".to_string());
        Ok(Box::new(ScriptedGssContext {
            fail: self.fail,
            steps: 0,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct ScriptedGssContext {
    fail: bool,
    steps: usize,
    calls: CallLog,
}

impl GssContext for ScriptedGssContext {
    fn step(&mut self, _token: &str) -> Result<GssStatus, GssError> {
        self.calls.lock().unwrap().push("step".to_string());
        if self.fail {
            return Err(GssError("no kerberos credentials".to_string()));
        }
        self.steps += 1;
        if self.steps >= 2 {
            Ok(GssStatus::Complete)
        } else {
            Ok(GssStatus::Continue)
        }
    }

    fn response(&mut self) -> Option<String> {
        Some(BASE64.encode(b"token"))
    }

    fn unwrap(&mut self, _token: &str) -> Result<(), GssError> {
        self.calls.lock().unwrap().push("unwrap".to_string());
        Ok(())
    }

    fn wrap(&mut self, _token: &str, user: &str) -> Result<(), GssError> {
        self.calls.lock().unwrap().push(format!("wrap {}", user));
        Ok(())
    }
}

/// Synchronizer that records invocations.
pub(crate) struct CountingSync {
    folders: Mutex<Vec<(String, String)>>,
    count: AtomicUsize,
}

impl CountingSync {
    pub(crate) fn new() -> Self {
        Self {
            folders: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn folders(&self) -> Vec<(String, String)> {
        self.folders.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for_calls(&self, at_least: usize) {
        while self.calls() < at_least {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Synchronizer for CountingSync {
    async fn sync_folder(&self, account: &str, folder: &str) -> anyhow::Result<()> {
        self.folders
            .lock()
            .unwrap()
            .push((account.to_string(), folder.to_string()));
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
