use std::path::PathBuf;

use annexb2_common::StoreError;

use crate::config::ConfigError;

/// Failure of one remote request. The protocol handler reports it to
/// git-annex and keeps serving further requests.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("remote has not been prepared")]
    NotReady,
    #[error("request not supported by this remote")]
    Unsupported,
    #[error("couldn't open bucket {bucket:?}: {source}")]
    Connect { bucket: String, source: StoreError },
    #[error("couldn't list filenames for {name}: {source}")]
    Lookup { name: String, source: StoreError },
    #[error("couldn't get file info for {id:?}: {source}")]
    FileInfo { id: String, source: StoreError },
    #[error("couldn't open {}: {source}", path.display())]
    LocalIo { path: PathBuf, source: std::io::Error },
    #[error("couldn't hash local file {}: {source}", path.display())]
    Hash { path: PathBuf, source: std::io::Error },
    #[error("couldn't retry upload of {name}: {source}")]
    Rewind { name: String, source: std::io::Error },
    #[error("couldn't upload {name} after {attempts} attempt(s): {source}")]
    Upload {
        name: String,
        attempts: u32,
        source: StoreError,
    },
    #[error("couldn't download {name}: {source}")]
    Download { name: String, source: StoreError },
    #[error("couldn't delete file version {name}: {source}")]
    Hide { name: String, source: StoreError },
    #[error("couldn't save settings to git-annex: {0}")]
    Host(anyhow::Error),
}

impl RemoteError {
    /// The store classification behind this failure, if it came from the store.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            RemoteError::Connect { source, .. }
            | RemoteError::Lookup { source, .. }
            | RemoteError::FileInfo { source, .. }
            | RemoteError::Upload { source, .. }
            | RemoteError::Download { source, .. }
            | RemoteError::Hide { source, .. } => Some(source),
            _ => None,
        }
    }
}
