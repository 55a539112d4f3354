//! Store pipeline: hash the local file while checking whether the object is
//! already present, skip the transfer when the remote content matches, and
//! otherwise upload with exponential backoff on transient failures.

use std::io::{self, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use annexb2_common::{ContentReader, ErrorKind, ObjectStore};
use sha1::{Digest, Sha1};
use tokio::io::AsyncSeekExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::host::Host;
use crate::presence::PresenceCache;
use crate::progress::ProgressReader;

/// SHA-1 and size of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDigest {
    pub sha1_hex: String,
    pub length: u64,
}

impl LocalDigest {
    pub fn matches(&self, remote_sha1: &str) -> bool {
        self.sha1_hex.eq_ignore_ascii_case(remote_sha1)
    }
}

/// Hash the whole file, then rewind it for the upload.
fn hash_file(mut file: std::fs::File) -> io::Result<(std::fs::File, LocalDigest)> {
    let mut hasher = Sha1::new();
    let length = io::copy(&mut file, &mut hasher)?;
    file.seek(SeekFrom::Start(0))?;
    let sha1_hex = hex::encode(hasher.finalize());
    Ok((file, LocalDigest { sha1_hex, length }))
}

type HashTask = JoinHandle<io::Result<(std::fs::File, LocalDigest)>>;

fn spawn_hash(file: std::fs::File) -> HashTask {
    tokio::task::spawn_blocking(move || hash_file(file))
}

async fn join_hash(task: HashTask, path: &Path) -> Result<(std::fs::File, LocalDigest), RemoteError> {
    let joined = task
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()));
    joined.and_then(|r| r).map_err(|source| RemoteError::Hash {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        Self { retries }
    }

    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Decide what to do after `attempt` (zero-based) failed with `kind`.
    pub fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        match kind {
            ErrorKind::Transient if attempt + 1 < self.attempts() => {
                RetryDecision::RetryAfter(backoff(attempt))
            }
            ErrorKind::Transient | ErrorKind::Fatal | ErrorKind::Other => RetryDecision::Abort,
        }
    }
}

/// `2^attempt` seconds.
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Store the file at `path` as `name`. On success the object exists with
/// content identical to the file, whether uploaded now or earlier.
pub async fn store_file(
    store: &Arc<dyn ObjectStore>,
    presence: &mut PresenceCache,
    host: &Arc<dyn Host>,
    policy: RetryPolicy,
    name: &str,
    path: &Path,
) -> Result<(), RemoteError> {
    let file = std::fs::File::open(path).map_err(|source| RemoteError::LocalIo {
        path: path.to_path_buf(),
        source,
    })?;
    let hashing = spawn_hash(file);

    let found = presence
        .lookup(store.as_ref(), name)
        .await
        .map_err(|source| RemoteError::Lookup {
            name: name.to_string(),
            source,
        })?;

    let (file, digest) = match found.id {
        Some(id) if found.found => {
            let info = store
                .get_object_info(&id)
                .await
                .map_err(|source| RemoteError::FileInfo { id: id.clone(), source })?;
            let (file, digest) = join_hash(hashing, path).await?;
            if info.content_sha1.as_deref().is_some_and(|sha1| digest.matches(sha1)) {
                debug!(name = %name, id = %id, "Object already stored with matching SHA-1");
                return Ok(());
            }
            debug!(name = %name, id = %id, "Stored object differs; uploading new version");
            (file, digest)
        }
        _ => join_hash(hashing, path).await?,
    };

    let mut file = tokio::fs::File::from_std(file);
    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|source| RemoteError::Rewind {
                    name: name.to_string(),
                    source,
                })?;
        }
        let body = file.try_clone().await.map_err(|source| RemoteError::LocalIo {
            path: path.to_path_buf(),
            source,
        })?;
        let content: ContentReader = Box::new(ProgressReader::new(body, host.clone()));

        match store
            .upload_object(name, content, &digest.sha1_hex, digest.length)
            .await
        {
            Ok(uploaded) => {
                presence.record_upload(&uploaded.name, &uploaded.id);
                info!(
                    name = %uploaded.name,
                    id = %uploaded.id,
                    bytes = digest.length,
                    attempts = attempt + 1,
                    "Upload complete"
                );
                return Ok(());
            }
            Err(err) => match policy.decide(err.kind, attempt) {
                RetryDecision::RetryAfter(wait) => {
                    host.debug(&format!(
                        "upload failed, retrying in {}s, error: {}",
                        wait.as_secs(),
                        err
                    ));
                    warn!(name = %name, attempt = attempt + 1, wait_s = wait.as_secs(), error = %err, "Upload failed, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                RetryDecision::Abort => {
                    return Err(RemoteError::Upload {
                        name: name.to_string(),
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            },
        }
    }
}
