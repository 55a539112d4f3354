//! Backblaze B2 native API client.
//!
//! Talks to the `b2api/v2` JSON endpoints with reqwest. Uploads go to a
//! per-bucket upload URL that is reused until an upload on it fails, as B2
//! asks clients to do. An expired account token triggers one re-authorization
//! and one repeat of the call.

use std::sync::Arc;
use std::time::Duration;

use annexb2_common::{
    Connection, ContentReader, Credentials, ErrorKind, ObjectAction, ObjectEntry, ObjectInfo,
    ObjectPage, ObjectStore, StoreConnector, StoreError, UploadedObject,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

pub const DEFAULT_AUTHORIZE_URL: &str =
    "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";
const API_PATH: &str = "b2api/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    account_id: String,
    authorization_token: String,
    api_url: String,
    download_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketWire {
    bucket_id: String,
    bucket_name: String,
    bucket_type: String,
}

#[derive(Debug, Deserialize)]
struct ListBucketsResponse {
    buckets: Vec<BucketWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileWire {
    file_id: Option<String>,
    file_name: String,
    action: Option<ObjectAction>,
    content_sha1: Option<String>,
    #[serde(default)]
    content_length: u64,
    upload_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesResponse {
    files: Vec<FileWire>,
    next_file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlResponse {
    upload_url: String,
    authorization_token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

// ── Failure classification ───────────────────────────────────────────────────

#[derive(Debug)]
enum Failure {
    Api { status: u16, code: String, message: String },
    Transport(reqwest::Error),
    Decode(String),
}

impl Failure {
    fn is_expired_auth(&self) -> bool {
        matches!(self, Failure::Api { status: 401, code, .. } if code == "expired_auth_token")
    }

    fn into_store_error(self, context: &str) -> StoreError {
        match self {
            Failure::Api { status, code, message } => StoreError::new(
                classify(status, &code),
                format!("{}: {} {}: {}", context, status, code, message),
            ),
            Failure::Transport(e) => {
                let kind = if e.is_timeout() || e.is_connect() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Other
                };
                StoreError::new(kind, format!("{}: {}", context, e))
            }
            Failure::Decode(m) => StoreError::other(format!("{}: {}", context, m)),
        }
    }
}

/// Map a B2 error response onto the retry taxonomy.
pub fn classify(status: u16, code: &str) -> ErrorKind {
    match status {
        401 if code == "expired_auth_token" || code == "bad_auth_token" => ErrorKind::Transient,
        408 | 429 => ErrorKind::Transient,
        500..=599 => ErrorKind::Transient,
        400..=499 => ErrorKind::Fatal,
        _ => ErrorKind::Other,
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, Failure> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&text).unwrap_or(ErrorBody {
        code: String::new(),
        message: text,
    });
    Err(Failure::Api {
        status: status.as_u16(),
        code: body.code,
        message: body.message,
    })
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Failure> {
    let resp = check_status(resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| Failure::Decode(e.to_string()))
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Percent-encode a file name for headers and download URLs, keeping `/`.
pub fn encode_file_name(name: &str) -> String {
    name.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// B2 reports `none` for large files and prefixes client-unverified hashes.
fn normalize_sha1(raw: Option<String>) -> Option<String> {
    let raw = raw?;
    let sha1 = raw.strip_prefix("unverified:").unwrap_or(&raw);
    if sha1.is_empty() || sha1 == "none" {
        None
    } else {
        Some(sha1.to_string())
    }
}

#[derive(Debug, Clone)]
struct Authorization {
    account_id: String,
    token: String,
    api_url: String,
    download_url: String,
}

async fn authorize(
    client: &Client,
    authorize_url: &str,
    user: &str,
    app_key: &str,
) -> Result<Authorization, Failure> {
    let resp = client
        .get(authorize_url)
        .basic_auth(user, Some(app_key))
        .send()
        .await
        .map_err(Failure::Transport)?;
    let auth: AuthorizeResponse = read_json(resp).await?;
    Ok(Authorization {
        account_id: auth.account_id,
        token: auth.authorization_token,
        api_url: auth.api_url.trim_end_matches('/').to_string(),
        download_url: auth.download_url.trim_end_matches('/').to_string(),
    })
}

async fn post_api<T: DeserializeOwned>(
    client: &Client,
    auth: &Authorization,
    operation: &str,
    body: &serde_json::Value,
) -> Result<T, Failure> {
    let url = format!("{}/{}/{}", auth.api_url, API_PATH, operation);
    let resp = client
        .post(&url)
        .header(header::AUTHORIZATION, &auth.token)
        .json(body)
        .send()
        .await
        .map_err(Failure::Transport)?;
    read_json(resp).await
}

// ── Connector ────────────────────────────────────────────────────────────────

pub struct B2Connector {
    client: Client,
    authorize_url: String,
}

impl B2Connector {
    pub fn new() -> Result<Self, StoreError> {
        Self::with_authorize_url(DEFAULT_AUTHORIZE_URL)
    }

    pub fn with_authorize_url(authorize_url: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::other(format!("couldn't build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            authorize_url: authorize_url.into(),
        })
    }
}

#[async_trait]
impl StoreConnector for B2Connector {
    async fn connect(
        &self,
        credentials: &Credentials,
        bucket: &str,
        create_bucket: bool,
    ) -> Result<Connection, StoreError> {
        let user = if credentials.key_id.is_empty() {
            &credentials.account_id
        } else {
            &credentials.key_id
        };
        let auth = authorize(&self.client, &self.authorize_url, user, &credentials.app_key)
            .await
            .map_err(|f| f.into_store_error("couldn't authorize"))?;
        debug!(account_id = %auth.account_id, api_url = %auth.api_url, "B2 authorized");

        let listed: ListBucketsResponse = post_api(
            &self.client,
            &auth,
            "b2_list_buckets",
            &json!({ "accountId": auth.account_id, "bucketName": bucket }),
        )
        .await
        .map_err(|f| f.into_store_error("b2_list_buckets"))?;

        let info = match listed.buckets.into_iter().find(|b| b.bucket_name == bucket) {
            Some(b) => b,
            None if create_bucket => {
                info!(bucket = %bucket, "Creating private B2 bucket");
                post_api(
                    &self.client,
                    &auth,
                    "b2_create_bucket",
                    &json!({
                        "accountId": auth.account_id,
                        "bucketName": bucket,
                        "bucketType": "allPrivate",
                    }),
                )
                .await
                .map_err(|f| f.into_store_error("b2_create_bucket"))?
            }
            None => {
                return Err(StoreError::fatal(format!(
                    "bucket {:?} does not exist anymore",
                    bucket
                )))
            }
        };

        let confirmed = Credentials {
            account_id: auth.account_id.clone(),
            key_id: credentials.key_id.clone(),
            app_key: credentials.app_key.clone(),
        };
        let store = B2Store {
            client: self.client.clone(),
            authorize_url: self.authorize_url.clone(),
            user: user.to_string(),
            app_key: credentials.app_key.clone(),
            download_url: auth.download_url.clone(),
            auth: RwLock::new(auth),
            bucket_id: info.bucket_id,
            bucket_name: info.bucket_name,
            public: info.bucket_type == "allPublic",
            upload_target: Mutex::new(None),
        };
        Ok(Connection {
            store: Arc::new(store),
            credentials: confirmed,
        })
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

struct UploadTarget {
    url: String,
    token: String,
}

pub struct B2Store {
    client: Client,
    authorize_url: String,
    user: String,
    app_key: String,
    download_url: String,
    auth: RwLock<Authorization>,
    bucket_id: String,
    bucket_name: String,
    public: bool,
    upload_target: Mutex<Option<UploadTarget>>,
}

impl B2Store {
    async fn reauthorize(&self) -> Result<Authorization, StoreError> {
        debug!("B2 authorization token expired, re-authorizing");
        let auth = authorize(&self.client, &self.authorize_url, &self.user, &self.app_key)
            .await
            .map_err(|f| f.into_store_error("couldn't re-authorize"))?;
        *self.auth.write().await = auth.clone();
        Ok(auth)
    }

    async fn api<T: DeserializeOwned>(
        &self,
        operation: &str,
        body: serde_json::Value,
    ) -> Result<T, StoreError> {
        let auth = self.auth.read().await.clone();
        match post_api(&self.client, &auth, operation, &body).await {
            Err(f) if f.is_expired_auth() => {
                let auth = self.reauthorize().await?;
                post_api(&self.client, &auth, operation, &body)
                    .await
                    .map_err(|f| f.into_store_error(operation))
            }
            result => result.map_err(|f| f.into_store_error(operation)),
        }
    }

    async fn take_upload_target(&self) -> Result<UploadTarget, StoreError> {
        if let Some(target) = self.upload_target.lock().await.take() {
            return Ok(target);
        }
        let resp: UploadUrlResponse = self
            .api("b2_get_upload_url", json!({ "bucketId": self.bucket_id }))
            .await?;
        Ok(UploadTarget {
            url: resp.upload_url,
            token: resp.authorization_token,
        })
    }

    fn file_url(&self, name: &str) -> String {
        format!(
            "{}/file/{}/{}",
            self.download_url,
            urlencoding::encode(&self.bucket_name),
            encode_file_name(name)
        )
    }

    async fn send_download(&self, name: &str, auth: &Authorization) -> Result<reqwest::Response, Failure> {
        let resp = self
            .client
            .get(self.file_url(name))
            .header(header::AUTHORIZATION, &auth.token)
            .send()
            .await
            .map_err(Failure::Transport)?;
        check_status(resp).await
    }
}

#[async_trait]
impl ObjectStore for B2Store {
    async fn list_objects(&self, start_name: &str, max_count: u32) -> Result<ObjectPage, StoreError> {
        let mut body = json!({ "bucketId": self.bucket_id, "maxFileCount": max_count });
        if !start_name.is_empty() {
            body["startFileName"] = json!(start_name);
        }
        let resp: ListFileNamesResponse = self.api("b2_list_file_names", body).await?;
        let entries = resp
            .files
            .into_iter()
            .filter_map(|f| {
                Some(ObjectEntry {
                    id: f.file_id?,
                    name: f.file_name,
                    action: f.action.unwrap_or(ObjectAction::Upload),
                })
            })
            .collect();
        Ok(ObjectPage {
            entries,
            next_name: resp.next_file_name,
        })
    }

    async fn get_object_info(&self, id: &str) -> Result<ObjectInfo, StoreError> {
        let file: FileWire = self.api("b2_get_file_info", json!({ "fileId": id })).await?;
        Ok(ObjectInfo {
            id: file.file_id.unwrap_or_else(|| id.to_string()),
            name: file.file_name,
            content_sha1: normalize_sha1(file.content_sha1),
            content_length: file.content_length,
            action: file.action.unwrap_or(ObjectAction::Upload),
            uploaded_at: file
                .upload_timestamp
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }

    async fn upload_object(
        &self,
        name: &str,
        content: ContentReader,
        sha1_hex: &str,
        length: u64,
    ) -> Result<UploadedObject, StoreError> {
        let target = self.take_upload_target().await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(content));
        let sent = self
            .client
            .post(&target.url)
            .header(header::AUTHORIZATION, &target.token)
            .header("X-Bz-File-Name", encode_file_name(name))
            .header(header::CONTENT_TYPE, "b2/x-auto")
            .header(header::CONTENT_LENGTH, length)
            .header("X-Bz-Content-Sha1", sha1_hex)
            .body(body)
            .send()
            .await
            .map_err(Failure::Transport);
        let result = match sent {
            Ok(resp) => read_json::<FileWire>(resp).await,
            Err(f) => Err(f),
        };

        // The upload URL goes back into rotation only after a success.
        let file = result.map_err(|f| f.into_store_error(&format!("upload of {}", name)))?;
        *self.upload_target.lock().await = Some(target);

        let id = file.file_id.ok_or_else(|| {
            StoreError::other(format!("upload of {}: response carried no fileId", name))
        })?;
        debug!(name = %file.file_name, id = %id, bytes = length, "B2 upload complete");
        Ok(UploadedObject {
            id,
            name: file.file_name,
        })
    }

    async fn download_object(
        &self,
        name: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, StoreError> {
        let context = format!("download of {}", name);
        let auth = self.auth.read().await.clone();
        let sent = match self.send_download(name, &auth).await {
            Err(f) if f.is_expired_auth() => {
                let auth = self.reauthorize().await?;
                self.send_download(name, &auth).await
            }
            result => result,
        };
        let mut resp = sent.map_err(|f| f.into_store_error(&context))?;

        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| Failure::Transport(e).into_store_error(&context))?
        {
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        dest.flush().await?;
        debug!(name = %name, bytes = written, "B2 download complete");
        Ok(written)
    }

    async fn hide_object(&self, name: &str) -> Result<(), StoreError> {
        let _: serde_json::Value = self
            .api(
                "b2_hide_file",
                json!({ "bucketId": self.bucket_id, "fileName": name }),
            )
            .await?;
        debug!(name = %name, "B2 hide complete");
        Ok(())
    }

    fn public_url(&self, name: &str) -> Option<String> {
        self.public.then(|| self.file_url(name))
    }
}
