//! IMAP session management: pool, authentication, idle supervision.
//!
//! This module is split into:
//! - `session` - the protocol-collaborator trait and the pool's handle
//! - `transport` - the shipped async-imap connector
//! - `auth` - authentication mechanism negotiation
//! - `pool` - the bounded connection pool
//! - `coordinator` - sync/idle mutual exclusion per folder
//! - `idle` - keep-alive sweep and push-notification listeners

pub mod auth;
pub mod coordinator;
pub mod idle;
pub mod pool;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
