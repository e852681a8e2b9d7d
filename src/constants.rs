//! Crate-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

/// Default keep-alive sweep interval in seconds.
/// RFC 2177 allows 29 minutes between IDLE refreshes; we use 5 minutes so
/// connections survive aggressive NAT timeouts.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 300;

/// Default maximum number of pooled sessions per account.
/// Conservative because some servers cap concurrent logins per user.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1;

/// Default IMAP-over-TLS port.
pub const IMAP_TLS_PORT: u16 = 993;

/// Default cleartext IMAP port.
pub const IMAP_PORT: u16 = 143;

/// Folder tag recorded for keep-alive sessions that idle on no folder.
pub const NOOP_FOLDER_TAG: &str = "NOOP";
