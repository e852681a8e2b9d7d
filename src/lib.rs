//! Pooled IMAP session management with push-notification supervision.
//!
//! Opening an IMAP session is expensive (TCP + TLS + authentication), so
//! sessions are pooled and reused with task affinity, bounded by a permit
//! budget. A subset of folders can additionally hold long-blocking IDLE
//! sessions that wake a synchronization when the server reports changes,
//! coordinated so a folder is never idled on while it is being synchronized.
//!
//! The wire protocol, the synchronization algorithm, credential prompting
//! and Kerberos mechanics are collaborators behind traits ([`RemoteSession`],
//! [`Synchronizer`], [`PasswordSource`], [`GssProvider`]); this crate is the
//! policy layer on top.

pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod imap;
pub mod sync;

pub use config::{AccountConfig, ImapConfig, TransportKind};
pub use credentials::{CredentialStore, PasswordSource};
pub use error::ImapError;
pub use imap::auth::{GssContext, GssError, GssProvider, GssStatus};
pub use imap::coordinator::SyncIdleCoordinator;
pub use imap::idle::IdleSupervisor;
pub use imap::pool::{ConnectionPool, Namespace};
pub use imap::session::{
    IdleOutcome, ListEntry, RemoteSession, Session, SessionFactory, SessionId,
};
pub use imap::transport::Connector;
pub use sync::Synchronizer;
