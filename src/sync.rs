//! Boundary to the folder synchronization engine.

use async_trait::async_trait;

/// Invoked by an idle listener when the server reports a change on a folder.
///
/// Runs on the listener task, after the listener has released its session
/// back to the pool, so implementations are free to acquire sessions of
/// their own.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    async fn sync_folder(&self, account: &str, folder: &str) -> anyhow::Result<()>;
}
