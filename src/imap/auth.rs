//! Authentication negotiation: GSSAPI, CRAM-MD5, plain login.
//!
//! The negotiator turns a freshly connected session into an authenticated
//! one, preferring the strongest mechanism the server advertises and falling
//! back gracefully. Kerberos mechanics live behind [`GssProvider`]; only the
//! sequencing is here.

use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use md5::Md5;
use thiserror::Error;

use crate::credentials::PasswordSource;
use crate::error::ImapError;
use crate::imap::session::RemoteSession;

const CAP_GSSAPI: &str = "AUTH=GSSAPI";
const CAP_CRAM_MD5: &str = "AUTH=CRAM-MD5";

#[derive(Debug, Error)]
#[error("{0}")]
pub struct GssError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GssStatus {
    Continue,
    Complete,
}

/// One Kerberos client context. Tokens cross this boundary base64-encoded,
/// matching the GSSAPI library convention.
pub trait GssContext: Send {
    /// Feed a server token into the credential-establishment exchange.
    fn step(&mut self, token: &str) -> Result<GssStatus, GssError>;
    /// Token to send to the server, if the last operation produced one.
    fn response(&mut self) -> Option<String>;
    /// Unwrap the server's security-layer token.
    fn unwrap(&mut self, token: &str) -> Result<(), GssError>;
    /// Wrap the security-layer response, confirming `user` to the server.
    fn wrap(&mut self, token: &str, user: &str) -> Result<(), GssError>;
}

/// Supplies fresh [`GssContext`]s. Absent means the runtime has no GSSAPI
/// support and the mechanism is never attempted.
pub trait GssProvider: Send + Sync {
    fn new_context(&self, service: &str) -> Result<Box<dyn GssContext>, GssError>;
}

/// Where the GSSAPI exchange currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GssStep {
    /// Exchanging authentication tokens.
    Step,
    /// Negotiating the security layer and confirming the identity.
    Wrap,
}

pub(crate) struct AuthState {
    gss_step: GssStep,
    gss_context: Option<Box<dyn GssContext>>,
    /// GSSAPI proved usable; future session creations go straight to it.
    gssapi: bool,
    /// GSSAPI failed once; never attempted again for this pool's lifetime.
    gss_failed: bool,
    /// Last password we attempted, confirmed or not.
    password: Option<String>,
    /// Last password the server accepted. Kept separate from `password` so a
    /// later failure cannot wipe a known-good value.
    good_password: Option<String>,
    /// Rejection text carried into the next password lookup.
    password_error: Option<String>,
}

impl AuthState {
    fn new() -> Self {
        Self {
            gss_step: GssStep::Step,
            gss_context: None,
            gssapi: false,
            gss_failed: false,
            password: None,
            good_password: None,
            password_error: None,
        }
    }

    /// Drop all GSSAPI negotiation state. Passwords survive: a confirmed
    /// credential is still valid after the connections are torn down.
    fn reset(&mut self) {
        self.gss_step = GssStep::Step;
        self.gss_context = None;
        self.gssapi = false;
        self.gss_failed = false;
    }

    fn clear_gss(&mut self) {
        self.gss_step = GssStep::Step;
        self.gss_context = None;
    }
}

/// Per-pool authentication driver. Holds the mechanism fallback state and
/// the password cache; GSSAPI state is reset on pool shutdown.
pub(crate) struct Negotiator {
    account: String,
    user: String,
    hostname: String,
    credentials: Arc<dyn PasswordSource>,
    gss: Option<Arc<dyn GssProvider>>,
    state: Mutex<AuthState>,
}

impl Negotiator {
    pub(crate) fn new(
        account: String,
        user: String,
        hostname: String,
        credentials: Arc<dyn PasswordSource>,
        gss: Option<Arc<dyn GssProvider>>,
    ) -> Self {
        Self {
            account,
            user,
            hostname,
            credentials,
            gss,
            state: Mutex::new(AuthState::new()),
        }
    }

    pub(crate) fn reset(&self) {
        self.state.lock().unwrap().reset();
    }

    /// Run the mechanism fallback chain on a fresh session.
    pub(crate) async fn authenticate(
        &self,
        remote: &mut dyn RemoteSession,
    ) -> Result<(), ImapError> {
        if remote.preauthenticated() {
            tracing::debug!("tunnel transport is preauthenticated, skipping negotiation");
            return Ok(());
        }

        if let Some(provider) = self.gss.clone() {
            let try_gss = {
                let state = self.state.lock().unwrap();
                !state.gss_failed
                    && (state.gssapi || remote.capabilities().contains(CAP_GSSAPI))
            };
            if try_gss {
                tracing::debug!("attempting GSSAPI authentication");
                match self.gssapi(remote, provider.as_ref()).await {
                    Ok(()) => {
                        self.state.lock().unwrap().gssapi = true;
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!("GSSAPI authentication failed: {}", e);
                        let mut state = self.state.lock().unwrap();
                        state.gssapi = false;
                        state.gss_failed = true;
                        state.clear_gss();
                    }
                }
            }
        }

        if remote.capabilities().contains(CAP_CRAM_MD5) {
            tracing::debug!("attempting CRAM-MD5 authentication");
            let password = self.password().await?;
            match self.cram_md5(remote, &password).await {
                Ok(()) => {
                    self.confirm_password(password);
                    return Ok(());
                }
                Err(e) => tracing::debug!("CRAM-MD5 authentication failed: {}", e),
            }
        }

        self.plain(remote).await
    }

    async fn gssapi(
        &self,
        remote: &mut dyn RemoteSession,
        provider: &dyn GssProvider,
    ) -> Result<(), ImapError> {
        let service = format!("imap@{}", self.hostname);
        let user = self.user.clone();
        let mut responder = |challenge: &[u8]| -> Option<Vec<u8>> {
            let mut state = self.state.lock().unwrap();
            gss_respond(&mut state, provider, &service, &user, challenge)
        };
        let result = remote.authenticate("GSSAPI", &mut responder).await;
        // The context is single-exchange either way.
        self.state.lock().unwrap().clear_gss();
        result
    }

    async fn cram_md5(
        &self,
        remote: &mut dyn RemoteSession,
        password: &str,
    ) -> Result<(), ImapError> {
        let user = self.user.clone();
        let password = password.to_string();
        let mut responder = move |challenge: &[u8]| -> Option<Vec<u8>> {
            Some(cram_md5_response(&user, &password, challenge).into_bytes())
        };
        remote.authenticate("CRAM-MD5", &mut responder).await
    }

    async fn plain(&self, remote: &mut dyn RemoteSession) -> Result<(), ImapError> {
        tracing::debug!("attempting plain authentication");
        let password = self.password().await?;
        match remote.login(&self.user, &password).await {
            Ok(()) => {
                self.confirm_password(password);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                state.password = None;
                state.password_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Resolve the password to attempt: confirmed-good, then cached, then a
    /// fresh lookup carrying any rejection text from the last failure.
    async fn password(&self) -> Result<String, ImapError> {
        let prior_error = {
            let mut state = self.state.lock().unwrap();
            if let Some(good) = &state.good_password {
                return Ok(good.clone());
            }
            if let Some(cached) = &state.password
                && state.password_error.is_none()
            {
                return Ok(cached.clone());
            }
            state.password_error.take()
        };

        let fresh = self
            .credentials
            .password(&self.account, prior_error.as_deref())
            .await
            .map_err(|e| ImapError::Auth {
                mechanism: "LOGIN".to_string(),
                reason: format!("no password available: {:#}", e),
            })?;

        self.state.lock().unwrap().password = Some(fresh.clone());
        Ok(fresh)
    }

    fn confirm_password(&self, password: String) {
        let mut state = self.state.lock().unwrap();
        state.password = Some(password.clone());
        state.good_password = Some(password);
        state.password_error = None;
    }

    #[cfg(test)]
    pub(crate) fn gss_abandoned(&self) -> bool {
        self.state.lock().unwrap().gss_failed
    }
}

/// Drive one step of the GSSAPI exchange. Returns the raw bytes to answer
/// the server with, or `None` to abandon the mechanism.
fn gss_respond(
    state: &mut AuthState,
    provider: &dyn GssProvider,
    service: &str,
    user: &str,
    challenge: &[u8],
) -> Option<Vec<u8>> {
    let token = BASE64.encode(challenge);
    let exchange = (|| -> Result<Option<String>, GssError> {
        match state.gss_step {
            GssStep::Step => {
                if state.gss_context.is_none() {
                    state.gss_context = Some(provider.new_context(service)?);
                }
                let context = state.gss_context.as_mut().expect("context just installed");
                if context.step(&token)? != GssStatus::Continue {
                    state.gss_step = GssStep::Wrap;
                }
                Ok(context.response())
            }
            GssStep::Wrap => {
                let context = state
                    .gss_context
                    .as_mut()
                    .ok_or_else(|| GssError("security-layer token without a context".into()))?;
                context.unwrap(&token)?;
                let unwrapped = context.response().unwrap_or_default();
                context.wrap(&unwrapped, user)?;
                Ok(context.response())
            }
        }
    })();

    match exchange {
        Ok(response) => {
            let raw = BASE64.decode(response.unwrap_or_default()).ok()?;
            Some(raw)
        }
        Err(e) => {
            tracing::debug!("GSSAPI exchange error: {}", e);
            None
        }
    }
}

/// CRAM-MD5 response line: `user` and the hex HMAC-MD5 of the challenge.
pub(crate) fn cram_md5_response(user: &str, password: &str, challenge: &[u8]) -> String {
    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(challenge.trim_ascii());
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{} {}", user, hex)
}
