use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MAX_CONNECTIONS, IMAP_PORT, IMAP_TLS_PORT};

/// Configuration for one synchronized account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account identifier, used for credential lookup and sync callbacks.
    pub name: String,
    /// Login name on the IMAP server.
    pub user: String,
    pub imap: ImapConfig,
    /// Folders that get a push-notification (IDLE) listener, in priority
    /// order. Listener slots beyond this list fall back to NOOP keep-alive.
    #[serde(default)]
    pub idle_folders: Vec<String>,
}

impl AccountConfig {
    /// Parse an account from a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse account configuration")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub server: String,
    /// Explicit port; when absent the transport kind picks 993 or 143.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// LIST reference prefix used for folder discovery.
    #[serde(default)]
    pub reference: String,
}

impl ImapConfig {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.transport {
            TransportKind::Tls => IMAP_TLS_PORT,
            _ => IMAP_PORT,
        })
    }
}

/// How to reach the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawn a command whose stdio carries a pre-authenticated IMAP session
    /// (e.g. ssh into the host and exec the IMAP daemon in preauth mode).
    Tunnel { command: String },
    /// Plain TCP.
    Direct,
    /// TLS-wrapped TCP.
    #[default]
    Tls,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}
