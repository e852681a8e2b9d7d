//! Shipped transport: async-imap over TCP or TLS.
//!
//! Implements [`SessionFactory`] and [`RemoteSession`] for the `Direct` and
//! `Tls` transports. The `Tunnel` variant exists at the configuration
//! boundary only: async-imap models authentication as a typed
//! client-to-session transition and cannot adopt a connection the far end
//! already authenticated, so preauthenticated tunnels are served by an
//! embedder-supplied factory.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::config::{ImapConfig, TransportKind};
use crate::error::ImapError;
use crate::imap::session::{
    ChallengeResponder, IdleOutcome, ListEntry, RemoteSession, SessionFactory,
};

/// Byte stream a session can run over.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug> SessionStream for T {}

type BoxStream = Box<dyn SessionStream>;

enum Backend {
    /// Connected but not authenticated.
    Fresh(async_imap::Client<BoxStream>),
    /// Authenticated and usable.
    Ready(async_imap::Session<BoxStream>),
    /// Mid-transition or torn down.
    Gone,
}

/// The shipped [`SessionFactory`]: opens TCP or TLS connections per the
/// account configuration.
pub struct Connector {
    config: ImapConfig,
}

impl Connector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    async fn open_stream(&self) -> Result<BoxStream, ImapError> {
        let addr = format!("{}:{}", self.config.server, self.config.effective_port());

        match &self.config.transport {
            TransportKind::Tunnel { command } => Err(ImapError::Connect(format!(
                "preauthenticated tunnel '{}' requires an embedder-supplied session factory",
                command
            ))),
            TransportKind::Direct => {
                let tcp = TcpStream::connect(&addr)
                    .await
                    .map_err(|e| ImapError::Connect(format!("{}: {}", addr, e)))?;
                Ok(Box::new(tcp.compat()))
            }
            TransportKind::Tls => {
                let tcp = TcpStream::connect(&addr)
                    .await
                    .map_err(|e| ImapError::Connect(format!("{}: {}", addr, e)))?;

                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let tls_config = rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                let connector = TlsConnector::from(Arc::new(tls_config));
                let server_name =
                    rustls::pki_types::ServerName::try_from(self.config.server.clone())
                        .map_err(|e| ImapError::Tls(e.to_string()))?;
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ImapError::Tls(e.to_string()))?;
                Ok(Box::new(tls.compat()))
            }
        }
    }
}

#[async_trait]
impl SessionFactory for Connector {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, ImapError> {
        let stream = self.open_stream().await?;
        let mut client = async_imap::Client::new(stream);

        // Learn the advertised authentication mechanisms before the
        // negotiator picks one.
        let caps = match client.run_command_and_read_response("CAPABILITY").await {
            Ok(raw) => parse_capability_lines(&raw),
            Err(e) => {
                tracing::warn!("Pre-auth CAPABILITY failed: {:?}", e);
                HashSet::new()
            }
        };

        tracing::info!("Connected to IMAP server {}", self.config.server);
        Ok(Box::new(ImapSession {
            backend: Backend::Fresh(client),
            caps,
        }))
    }
}

/// An async-imap backed session.
pub struct ImapSession {
    backend: Backend,
    caps: HashSet<String>,
}

impl ImapSession {
    fn session_mut(&mut self) -> Result<&mut async_imap::Session<BoxStream>, ImapError> {
        match &mut self.backend {
            Backend::Ready(session) => Ok(session),
            _ => Err(ImapError::Protocol(
                "operation requires an authenticated session".to_string(),
            )),
        }
    }

    async fn refresh_capabilities(&mut self) {
        if let Backend::Ready(session) = &mut self.backend {
            match session.capabilities().await {
                Ok(caps) => self.caps = capability_names(&caps),
                Err(e) => tracing::debug!("Capability refresh failed: {:?}", e),
            }
        }
    }
}

#[async_trait]
impl RemoteSession for ImapSession {
    fn capabilities(&self) -> &HashSet<String> {
        &self.caps
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<(), ImapError> {
        match std::mem::replace(&mut self.backend, Backend::Gone) {
            Backend::Fresh(client) => match client.login(user, password).await {
                Ok(session) => {
                    self.backend = Backend::Ready(session);
                    self.refresh_capabilities().await;
                    Ok(())
                }
                Err((e, client)) => {
                    self.backend = Backend::Fresh(client);
                    Err(ImapError::Auth {
                        mechanism: "LOGIN".to_string(),
                        reason: format!("{:?}", e),
                    })
                }
            },
            other => {
                self.backend = other;
                Err(ImapError::Protocol("session is already authenticated".to_string()))
            }
        }
    }

    async fn authenticate(
        &mut self,
        mechanism: &str,
        responder: ChallengeResponder<'_>,
    ) -> Result<(), ImapError> {
        match std::mem::replace(&mut self.backend, Backend::Gone) {
            Backend::Fresh(client) => {
                let bridge = SaslBridge { responder };
                match client.authenticate(mechanism, bridge).await {
                    Ok(session) => {
                        self.backend = Backend::Ready(session);
                        self.refresh_capabilities().await;
                        Ok(())
                    }
                    Err((e, client)) => {
                        self.backend = Backend::Fresh(client);
                        Err(ImapError::Auth {
                            mechanism: mechanism.to_string(),
                            reason: format!("{:?}", e),
                        })
                    }
                }
            }
            other => {
                self.backend = other;
                Err(ImapError::Protocol("session is already authenticated".to_string()))
            }
        }
    }

    async fn list(
        &mut self,
        reference: &str,
        pattern: &str,
    ) -> Result<Vec<ListEntry>, ImapError> {
        let session = self.session_mut()?;
        let mut stream = session
            .list(Some(reference), Some(pattern))
            .await
            .map_err(|e| ImapError::Protocol(format!("LIST failed: {:?}", e)))?;

        let mut entries = Vec::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(name) => entries.push(ListEntry {
                    name: name.name().to_string(),
                    delimiter: name.delimiter().map(|d| d.to_string()),
                }),
                Err(e) => tracing::warn!("Error in LIST response: {:?}", e),
            }
        }
        Ok(entries)
    }

    async fn select(&mut self, folder: &str, readonly: bool) -> Result<(), ImapError> {
        let session = self.session_mut()?;
        let result = if readonly {
            session.examine(folder).await
        } else {
            session.select(folder).await
        };
        result
            .map(|_| ())
            .map_err(|e| ImapError::Protocol(format!("Failed to select folder '{}': {:?}", folder, e)))
    }

    async fn idle(&mut self, mut stop: watch::Receiver<bool>) -> Result<IdleOutcome, ImapError> {
        let session = match std::mem::replace(&mut self.backend, Backend::Gone) {
            Backend::Ready(session) => session,
            other => {
                self.backend = other;
                return Err(ImapError::Protocol(
                    "IDLE requires an authenticated session".to_string(),
                ));
            }
        };

        let mut handle = session.idle();
        if let Err(e) = handle.init().await {
            // Try to get the session back; the connection may still be alive.
            if let Ok(session) = handle.done().await {
                self.backend = Backend::Ready(session);
            }
            return Err(ImapError::Abort(format!("IDLE init failed: {:?}", e)));
        }

        let (idle_future, stop_source) = handle.wait();

        let waited = tokio::select! {
            result = idle_future => match result {
                Ok(_) => Ok(IdleOutcome::Changed),
                Err(e) => Err(ImapError::Abort(format!("IDLE wait failed: {:?}", e))),
            },
            _ = stop.wait_for(|stopped| *stopped) => {
                // Interrupt the wait; done() below completes the exchange.
                drop(stop_source);
                Ok(IdleOutcome::Stopped)
            }
        };

        match handle.done().await {
            Ok(session) => {
                self.backend = Backend::Ready(session);
                waited
            }
            Err(e) => Err(ImapError::Abort(format!("Failed to end IDLE: {:?}", e))),
        }
    }

    async fn noop(&mut self) -> Result<(), ImapError> {
        self.session_mut()?
            .run_command_and_check_ok("NOOP")
            .await
            .map_err(|e| ImapError::Protocol(format!("NOOP failed: {:?}", e)))
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        match std::mem::replace(&mut self.backend, Backend::Gone) {
            Backend::Ready(mut session) => session
                .logout()
                .await
                .map_err(|e| ImapError::Protocol(format!("LOGOUT failed: {:?}", e))),
            _ => Ok(()),
        }
    }
}

/// Adapts a negotiator challenge responder to async-imap's authenticator.
struct SaslBridge<'a> {
    responder: ChallengeResponder<'a>,
}

impl async_imap::Authenticator for SaslBridge<'_> {
    type Response = Vec<u8>;

    fn process(&mut self, challenge: &[u8]) -> Self::Response {
        // An abandoned exchange answers with an empty token; the server
        // rejects it and the negotiator falls through to the next mechanism.
        (self.responder)(challenge).unwrap_or_default()
    }
}

fn capability_names(caps: &async_imap::types::Capabilities) -> HashSet<String> {
    use async_imap::types::Capability;

    caps.iter()
        .map(|c| match c {
            Capability::Imap4rev1 => "IMAP4REV1".to_string(),
            Capability::Auth(mechanism) => format!("AUTH={}", mechanism.to_ascii_uppercase()),
            Capability::Atom(atom) => atom.to_ascii_uppercase(),
        })
        .collect()
}

/// Pull capability tokens out of a raw `* CAPABILITY ...` response.
fn parse_capability_lines(raw: &[u8]) -> HashSet<String> {
    let text = String::from_utf8_lossy(raw);
    let mut caps = HashSet::new();
    for line in text.lines() {
        let line = line.trim().trim_start_matches("* ");
        if let Some(rest) = line.strip_prefix("CAPABILITY ") {
            for token in rest.split_whitespace() {
                caps.insert(token.to_ascii_uppercase());
            }
        }
    }
    caps
}
