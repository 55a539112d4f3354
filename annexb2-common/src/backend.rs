use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::StoreError;

/// Upload body handed to a store. Owned so clients can stream it from a
/// spawned HTTP request.
pub type ContentReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// What the most recent version of a name represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectAction {
    /// A regular uploaded file.
    Upload,
    /// A hide marker; the name is absent from the adapter's point of view.
    Hide,
    /// An unfinished large-file upload.
    Start,
    /// A virtual folder entry.
    Folder,
}

/// One row of a name listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: String,
    pub id: String,
    pub action: ObjectAction,
}

/// One page of a name listing. `next_name` is `None` once the namespace is
/// exhausted.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub entries: Vec<ObjectEntry>,
    pub next_name: Option<String>,
}

/// Metadata for a single object version.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub id: String,
    pub name: String,
    /// Hex SHA-1 of the content, if the store recorded one.
    pub content_sha1: Option<String>,
    pub content_length: u64,
    pub action: ObjectAction,
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// Identity assigned by the store to a freshly uploaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub id: String,
    pub name: String,
}

/// Trait implemented by object store clients.
///
/// The adapter only ever addresses objects by their full remote name (prefix
/// already applied) or by the identity returned from a listing or upload.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// List names in lexical order starting at `start_name` (inclusive).
    async fn list_objects(&self, start_name: &str, max_count: u32) -> Result<ObjectPage, StoreError>;

    /// Fetch metadata for one object version by identity.
    async fn get_object_info(&self, id: &str) -> Result<ObjectInfo, StoreError>;

    /// Upload `length` bytes read from `content`. The store rejects the
    /// upload if the received bytes do not hash to `sha1_hex`.
    async fn upload_object(
        &self,
        name: &str,
        content: ContentReader,
        sha1_hex: &str,
        length: u64,
    ) -> Result<UploadedObject, StoreError>;

    /// Stream the latest version of `name` into `dest`, returning the byte count.
    async fn download_object(
        &self,
        name: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, StoreError>;

    /// Soft-delete `name` by placing a hide marker over its versions.
    async fn hide_object(&self, name: &str) -> Result<(), StoreError>;

    /// Direct download URL for `name`, if the bucket allows anonymous reads.
    fn public_url(&self, name: &str) -> Option<String>;
}

/// Account credentials as resolved from configuration.
#[derive(Clone, Default)]
pub struct Credentials {
    pub account_id: String,
    /// Application key id; empty when the master key is used.
    pub key_id: String,
    pub app_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("key_id", &self.key_id)
            .field("app_key", &"<redacted>")
            .finish()
    }
}

/// An authenticated store bound to one bucket.
pub struct Connection {
    pub store: Arc<dyn ObjectStore>,
    /// Credentials as confirmed by the store (the account id may be filled in
    /// by authorization when only a key id was configured).
    pub credentials: Credentials,
}

/// Authenticates and resolves a bucket, producing a ready store.
#[async_trait::async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
        bucket: &str,
        create_bucket: bool,
    ) -> Result<Connection, StoreError>;
}

/// Compute the remote object name for a key given the configured prefix.
/// The prefix is either empty or already ends with `/`.
pub fn remote_name(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

/// Normalize a configured prefix so that it is empty or ends with `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}
