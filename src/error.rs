//! Error taxonomy for pool, authentication, and session operations.

use thiserror::Error;

/// Failures surfaced by session acquisition and use.
#[derive(Debug, Error)]
pub enum ImapError {
    /// Transport-level failure while opening a connection.
    #[error("connection failed: {0}")]
    Connect(String),

    /// TLS setup or handshake failure.
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// An authentication mechanism was rejected.
    #[error("{mechanism} authentication failed: {reason}")]
    Auth { mechanism: String, reason: String },

    /// The server rejected a command on an established session.
    #[error("server rejected command: {0}")]
    Protocol(String),

    /// The connection died mid-operation (e.g. during an IDLE wait).
    /// Sessions that report this must not be returned to the pool.
    #[error("connection aborted: {0}")]
    Abort(String),

    /// The pool has been shut down.
    #[error("connection pool is shut down")]
    Closed,
}
