//! In-memory doubles for the store, the connector and git-annex.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use annexb2_common::{
    Connection, ContentReader, Credentials, ObjectAction, ObjectEntry, ObjectInfo, ObjectPage,
    ObjectStore, StoreConnector, StoreError, UploadedObject,
};
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::host::Host;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub id: String,
    pub data: Vec<u8>,
    pub sha1: String,
    pub action: ObjectAction,
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<String, StoredObject>,
    next_id: u64,
    list_failures: VecDeque<StoreError>,
    upload_failures: VecDeque<StoreError>,
    hide_failures: VecDeque<StoreError>,
    upload_times: Vec<Instant>,
}

impl StoreState {
    fn assign_id(&mut self) -> String {
        self.next_id += 1;
        format!("4_z{:08}", self.next_id)
    }
}

/// Bucket contents held in a map. Only the latest version of each name is
/// kept, which is all a name listing ever shows.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    public: AtomicBool,
    list_calls: AtomicUsize,
    info_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    download_calls: AtomicUsize,
    hide_calls: AtomicUsize,
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an object directly, bypassing the upload path and its counters.
    pub fn put(&self, name: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let id = state.assign_id();
        state.objects.insert(
            name.to_string(),
            StoredObject {
                id,
                data: data.to_vec(),
                sha1: sha1_hex(data),
                action: ObjectAction::Upload,
            },
        );
    }

    /// Cover `name` with a hide marker, as another client would.
    pub fn hide_now(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let id = state.assign_id();
        state.objects.insert(
            name.to_string(),
            StoredObject {
                id,
                data: Vec::new(),
                sha1: String::new(),
                action: ObjectAction::Hide,
            },
        );
    }

    /// The visible object under `name`, if any.
    pub fn object(&self, name: &str) -> Option<StoredObject> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(name)
            .filter(|o| o.action == ObjectAction::Upload)
            .cloned()
    }

    pub fn set_public(&self, public: bool) {
        self.public.store(public, Ordering::SeqCst);
    }

    pub fn fail_next_list(&self, err: StoreError) {
        self.state.lock().unwrap().list_failures.push_back(err);
    }

    /// Queue a failure; queued failures are consumed by successive uploads.
    pub fn fail_next_upload(&self, err: StoreError) {
        self.state.lock().unwrap().upload_failures.push_back(err);
    }

    pub fn fail_next_hide(&self, err: StoreError) {
        self.state.lock().unwrap().hide_failures.push_back(err);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn hide_calls(&self) -> usize {
        self.hide_calls.load(Ordering::SeqCst)
    }

    /// When each upload attempt started.
    pub fn upload_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().upload_times.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(&self, start_name: &str, max_count: u32) -> Result<ObjectPage, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }

        let mut names = state.objects.range(start_name.to_string()..);
        let entries: Vec<ObjectEntry> = names
            .by_ref()
            .take(max_count as usize)
            .map(|(name, obj)| ObjectEntry {
                name: name.clone(),
                id: obj.id.clone(),
                action: obj.action,
            })
            .collect();
        let next_name = names.next().map(|(name, _)| name.clone());
        Ok(ObjectPage { entries, next_name })
    }

    async fn get_object_info(&self, id: &str) -> Result<ObjectInfo, StoreError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .find(|(_, obj)| obj.id == id)
            .map(|(name, obj)| ObjectInfo {
                id: obj.id.clone(),
                name: name.clone(),
                content_sha1: Some(obj.sha1.clone()).filter(|s| !s.is_empty()),
                content_length: obj.data.len() as u64,
                action: obj.action,
                uploaded_at: None,
            })
            .ok_or_else(|| StoreError::fatal(format!("file_not_present: {id}")))
    }

    async fn upload_object(
        &self,
        name: &str,
        mut content: ContentReader,
        sha1_hex_expected: &str,
        length: u64,
    ) -> Result<UploadedObject, StoreError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            state.upload_times.push(Instant::now());
            if let Some(err) = state.upload_failures.pop_front() {
                return Err(err);
            }
        }

        let mut data = Vec::new();
        content.read_to_end(&mut data).await?;
        if data.len() as u64 != length {
            return Err(StoreError::fatal(format!(
                "bad_request: sent {} bytes, declared {length}",
                data.len()
            )));
        }
        let sha1 = sha1_hex(&data);
        if !sha1.eq_ignore_ascii_case(sha1_hex_expected) {
            return Err(StoreError::fatal("bad_request: sha1 did not match data received"));
        }

        let mut state = self.state.lock().unwrap();
        let id = state.assign_id();
        state.objects.insert(
            name.to_string(),
            StoredObject {
                id: id.clone(),
                data,
                sha1,
                action: ObjectAction::Upload,
            },
        );
        Ok(UploadedObject {
            id,
            name: name.to_string(),
        })
    }

    async fn download_object(
        &self,
        name: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, StoreError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let data = self
            .object(name)
            .map(|o| o.data)
            .ok_or_else(|| StoreError::fatal(format!("not_found: {name}")))?;
        for chunk in data.chunks(4) {
            dest.write_all(chunk).await?;
        }
        dest.flush().await?;
        Ok(data.len() as u64)
    }

    async fn hide_object(&self, name: &str) -> Result<(), StoreError> {
        self.hide_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.hide_failures.pop_front() {
                return Err(err);
            }
        }
        if self.object(name).is_none() {
            return Err(StoreError::fatal(format!("no_such_file: {name}")));
        }
        self.hide_now(name);
        Ok(())
    }

    fn public_url(&self, name: &str) -> Option<String> {
        self.public
            .load(Ordering::SeqCst)
            .then(|| format!("https://f000.backblazeb2.com/file/annex/{name}"))
    }
}

/// Records what the adapter asks of git-annex.
#[derive(Default)]
pub struct FakeHost {
    config: Mutex<HashMap<String, String>>,
    creds: Mutex<HashMap<String, (String, String)>>,
    progress: Mutex<Vec<u64>>,
    debug: Mutex<Vec<String>>,
    config_reads: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: &str) {
        self.config
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> String {
        self.config.lock().unwrap().get(name).cloned().unwrap_or_default()
    }

    pub fn set_stored_creds(&self, setting: &str, user: &str, password: &str) {
        self.creds
            .lock()
            .unwrap()
            .insert(setting.to_string(), (user.to_string(), password.to_string()));
    }

    pub fn stored_creds(&self, setting: &str) -> Option<(String, String)> {
        self.creds.lock().unwrap().get(setting).cloned()
    }

    pub fn progress_reports(&self) -> Vec<u64> {
        self.progress.lock().unwrap().clone()
    }

    pub fn debug_messages(&self) -> Vec<String> {
        self.debug.lock().unwrap().clone()
    }

    pub fn config_reads(&self) -> usize {
        self.config_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn get_config(&self, name: &str) -> anyhow::Result<String> {
        self.config_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(name))
    }

    async fn set_config(&self, name: &str, value: &str) -> anyhow::Result<()> {
        self.set(name, value);
        Ok(())
    }

    async fn get_creds(&self, setting: &str) -> anyhow::Result<(String, String)> {
        Ok(self.stored_creds(setting).unwrap_or_default())
    }

    async fn set_creds(&self, setting: &str, user: &str, password: &str) -> anyhow::Result<()> {
        self.set_stored_creds(setting, user, password);
        Ok(())
    }

    fn progress(&self, bytes: u64) {
        self.progress.lock().unwrap().push(bytes);
    }

    fn debug(&self, message: &str) {
        self.debug.lock().unwrap().push(message.to_string());
    }
}

/// Hands out one shared [`MemoryStore`] for every connection.
pub struct FakeConnector {
    store: Arc<MemoryStore>,
    bucket_exists: AtomicBool,
    created_bucket: AtomicBool,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            bucket_exists: AtomicBool::new(true),
            created_bucket: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn set_bucket_exists(&self, exists: bool) {
        self.bucket_exists.store(exists, Ordering::SeqCst);
    }

    pub fn created_bucket(&self) -> bool {
        self.created_bucket.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for FakeConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
        bucket: &str,
        create_bucket: bool,
    ) -> Result<Connection, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.bucket_exists.load(Ordering::SeqCst) {
            if !create_bucket {
                return Err(StoreError::fatal(format!(
                    "bucket {bucket:?} does not exist anymore"
                )));
            }
            self.bucket_exists.store(true, Ordering::SeqCst);
            self.created_bucket.store(true, Ordering::SeqCst);
        }
        Ok(Connection {
            store: self.store.clone(),
            credentials: credentials.clone(),
        })
    }
}
