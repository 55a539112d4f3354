//! Services the outer protocol handler provides to the remote.
//!
//! git-annex answers configuration and credential requests over the same
//! line protocol that carries commands, so the lookups are async.

use async_trait::async_trait;

#[async_trait]
pub trait Host: Send + Sync {
    /// Read a remote configuration value. Unset values come back empty.
    async fn get_config(&self, name: &str) -> anyhow::Result<String>;

    async fn set_config(&self, name: &str, value: &str) -> anyhow::Result<()>;

    /// Read a stored credential pair `(user, password)`. Both empty if unset.
    async fn get_creds(&self, setting: &str) -> anyhow::Result<(String, String)>;

    async fn set_creds(&self, setting: &str, user: &str, password: &str) -> anyhow::Result<()>;

    /// Report the cumulative number of bytes transferred for the current request.
    fn progress(&self, bytes: u64);

    /// Send a diagnostic line to the host's debug log.
    fn debug(&self, message: &str);
}
