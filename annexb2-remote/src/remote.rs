//! Request handlers for the B2 special remote.
//!
//! [`B2Remote`] starts uninitialized. `init_remote` (which may create the
//! bucket) or `prepare` moves it to ready; after that every request runs
//! against the same store connection and presence cache until the process
//! exits.

use std::path::Path;
use std::sync::Arc;

use annexb2_common::{remote_name, ObjectStore, StoreConnector};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{process_env, EnvLookup, RemoteSettings};
use crate::error::RemoteError;
use crate::host::Host;
use crate::presence::PresenceCache;
use crate::progress::ProgressWriter;
use crate::store::{store_file, RetryPolicy};

/// How widely reachable the remote's content is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Global,
    Local,
}

struct Session {
    store: Arc<dyn ObjectStore>,
    settings: RemoteSettings,
    presence: PresenceCache,
}

enum State {
    Uninitialized,
    Ready(Session),
}

pub struct B2Remote {
    host: Arc<dyn Host>,
    connector: Arc<dyn StoreConnector>,
    env: Box<EnvLookup>,
    state: State,
}

impl B2Remote {
    pub fn new(host: Arc<dyn Host>, connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            host,
            connector,
            env: Box::new(process_env),
            state: State::Uninitialized,
        }
    }

    /// Replace the environment lookup used during setup.
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    /// First-time setup of a remote; creates the bucket if it is missing.
    pub async fn init_remote(&mut self) -> Result<(), RemoteError> {
        self.setup(true).await
    }

    /// Setup before serving requests; the bucket must already exist.
    pub async fn prepare(&mut self) -> Result<(), RemoteError> {
        self.setup(false).await
    }

    async fn setup(&mut self, create_bucket: bool) -> Result<(), RemoteError> {
        if self.is_ready() {
            return Ok(());
        }

        let settings = RemoteSettings::resolve(self.host.as_ref(), self.env.as_ref()).await?;
        let connection = self
            .connector
            .connect(&settings.credentials, &settings.bucket, create_bucket)
            .await
            .map_err(|source| RemoteError::Connect {
                bucket: settings.bucket.clone(),
                source,
            })?;

        let creds = &connection.credentials;
        self.host
            .set_config("accountid", &creds.account_id)
            .await
            .map_err(RemoteError::Host)?;
        self.host
            .set_creds("appkey", &creds.key_id, &creds.app_key)
            .await
            .map_err(RemoteError::Host)?;

        info!(
            bucket = %settings.bucket,
            prefix = %settings.prefix,
            retries = settings.retries,
            snapshot_cache = settings.cache.enabled,
            "Remote ready"
        );
        let settings = RemoteSettings {
            credentials: connection.credentials,
            ..settings
        };
        self.state = State::Ready(Session {
            store: connection.store,
            presence: PresenceCache::new(&settings.cache),
            settings,
        });
        Ok(())
    }

    fn session(&mut self) -> Result<&mut Session, RemoteError> {
        match &mut self.state {
            State::Ready(session) => Ok(session),
            State::Uninitialized => Err(RemoteError::NotReady),
        }
    }

    pub async fn store(&mut self, key: &str, path: &Path) -> Result<(), RemoteError> {
        let host = self.host.clone();
        let session = self.session()?;
        let name = remote_name(&session.settings.prefix, key);
        store_file(
            &session.store,
            &mut session.presence,
            &host,
            RetryPolicy::new(session.settings.retries),
            &name,
            path,
        )
        .await
    }

    /// Download `key` into `dest`. A failed download leaves no file behind.
    pub async fn retrieve(&mut self, key: &str, dest: &Path) -> Result<(), RemoteError> {
        let host = self.host.clone();
        let session = self.session()?;
        let name = remote_name(&session.settings.prefix, key);

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|source| RemoteError::LocalIo {
                path: dest.to_path_buf(),
                source,
            })?;
        let mut writer = ProgressWriter::new(file, host);

        let result = match session.store.download_object(&name, &mut writer).await {
            Ok(bytes) => {
                let synced = match writer.flush().await {
                    Ok(()) => writer.into_inner().sync_all().await,
                    Err(e) => Err(e),
                };
                synced.map(|()| bytes).map_err(|source| RemoteError::LocalIo {
                    path: dest.to_path_buf(),
                    source,
                })
            }
            Err(source) => {
                drop(writer);
                Err(RemoteError::Download {
                    name: name.clone(),
                    source,
                })
            }
        };

        match result {
            Ok(bytes) => {
                debug!(name = %name, bytes, "Retrieved");
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(dest).await {
                    warn!(path = %dest.display(), error = %rm, "Couldn't remove partial download");
                }
                Err(e)
            }
        }
    }

    pub async fn check_present(&mut self, key: &str) -> Result<bool, RemoteError> {
        let session = self.session()?;
        let name = remote_name(&session.settings.prefix, key);
        let presence = session
            .presence
            .lookup(session.store.as_ref(), &name)
            .await
            .map_err(|source| RemoteError::Lookup { name, source })?;
        Ok(presence.found)
    }

    /// Hide `key`. Removing something that is already absent succeeds.
    pub async fn remove(&mut self, key: &str) -> Result<(), RemoteError> {
        let session = self.session()?;
        let name = remote_name(&session.settings.prefix, key);
        let presence = session
            .presence
            .lookup(session.store.as_ref(), &name)
            .await
            .map_err(|source| RemoteError::Lookup {
                name: name.clone(),
                source,
            })?;
        if !presence.found {
            debug!(name = %name, "Already absent, nothing to remove");
            return Ok(());
        }

        let result = session.store.hide_object(&name).await;
        session.presence.record_hide(&name, result.is_ok());
        result.map_err(|source| RemoteError::Hide { name, source })
    }

    pub fn get_cost(&self) -> Result<u32, RemoteError> {
        Err(RemoteError::Unsupported)
    }

    pub fn get_availability(&self) -> Availability {
        Availability::Global
    }

    /// A direct URL for `key` when the bucket is public.
    pub fn where_is(&self, key: &str) -> Result<String, RemoteError> {
        match &self.state {
            State::Ready(session) => session
                .store
                .public_url(&remote_name(&session.settings.prefix, key))
                .ok_or(RemoteError::Unsupported),
            State::Uninitialized => Err(RemoteError::NotReady),
        }
    }
}
