//! Presence cache: answers "is this name stored, and under which file id".
//!
//! Two tiers with different trust levels:
//!
//! * [`SnapshotCache`] enumerates the whole bucket once and serves lookups from
//!   memory until its TTL runs out. A complete snapshot is authoritative for
//!   both hits and misses; an incomplete one only for hits.
//! * [`LastLookup`] remembers the single most recent live lookup for a short
//!   window. git-annex runs CHECKPRESENT right before TRANSFER STORE of the same
//!   key, and the store path repeats the lookup, so this halves list calls.
//!
//! Both tiers are advisory with respect to other processes writing to the same
//! bucket. The store pipeline re-verifies hits against live metadata.

use std::collections::HashMap;
use std::time::Duration;

use annexb2_common::{ObjectAction, ObjectStore, StoreError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CachePolicy;

pub const SNAPSHOT_PAGE_SIZE: u32 = 10_000;
/// Upper bound on listing pages per rebuild, so a misbehaving listing cannot
/// loop forever.
pub const SNAPSHOT_MAX_PAGES: usize = 100;
pub const LOOKUP_FRESHNESS: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Presence {
    pub found: bool,
    pub id: Option<String>,
}

impl Presence {
    pub fn present(id: impl Into<String>) -> Self {
        Self { found: true, id: Some(id.into()) }
    }

    pub fn absent() -> Self {
        Self::default()
    }
}

/// What a snapshot can say about a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotAnswer {
    Present(String),
    Absent,
    /// Not in an incomplete snapshot; only a live lookup can tell.
    Unknown,
}

struct Snapshot {
    names: HashMap<String, String>,
    built_at: Instant,
    complete: bool,
}

pub struct SnapshotCache {
    ttl: Option<Duration>,
    page_size: u32,
    max_pages: usize,
    snapshot: Option<Snapshot>,
}

impl SnapshotCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self::with_limits(ttl, SNAPSHOT_PAGE_SIZE, SNAPSHOT_MAX_PAGES)
    }

    pub fn with_limits(ttl: Option<Duration>, page_size: u32, max_pages: usize) -> Self {
        Self {
            ttl,
            page_size,
            max_pages,
            snapshot: None,
        }
    }

    pub fn needs_rebuild(&self) -> bool {
        match (&self.snapshot, self.ttl) {
            (None, _) => true,
            (Some(snap), Some(ttl)) => snap.built_at.elapsed() > ttl,
            (Some(_), None) => false,
        }
    }

    /// Replace the snapshot with a fresh enumeration. On failure no snapshot
    /// is kept, so the next lookup retries the rebuild.
    pub async fn rebuild(&mut self, store: &dyn ObjectStore) -> Result<(), StoreError> {
        self.snapshot = None;

        let mut names = HashMap::new();
        let mut start = String::new();
        let mut pending = false;
        for _ in 0..self.max_pages {
            let page = store.list_objects(&start, self.page_size).await?;
            for entry in page.entries {
                if entry.action == ObjectAction::Upload {
                    names.insert(entry.name, entry.id);
                }
            }
            match page.next_name {
                Some(next) => {
                    start = next;
                    pending = true;
                }
                None => {
                    pending = false;
                    break;
                }
            }
        }

        if pending {
            warn!(
                entries = names.len(),
                pages = self.max_pages,
                "Bucket listing truncated; snapshot is incomplete"
            );
        } else {
            info!(entries = names.len(), "Bucket snapshot built");
        }

        self.snapshot = Some(Snapshot {
            names,
            built_at: Instant::now(),
            complete: !pending,
        });
        Ok(())
    }

    pub fn probe(&self, name: &str) -> SnapshotAnswer {
        match &self.snapshot {
            None => SnapshotAnswer::Unknown,
            Some(snap) => match snap.names.get(name) {
                Some(id) => SnapshotAnswer::Present(id.clone()),
                None if snap.complete => SnapshotAnswer::Absent,
                None => SnapshotAnswer::Unknown,
            },
        }
    }

    /// Record an upload. Does nothing until a snapshot has been built.
    pub fn insert(&mut self, name: &str, id: &str) {
        if let Some(snap) = &mut self.snapshot {
            snap.names.insert(name.to_string(), id.to_string());
        }
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(snap) = &mut self.snapshot {
            snap.names.remove(name);
        }
    }

    pub fn is_built(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.snapshot.as_ref().map(|s| s.complete).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.snapshot.as_ref().map(|s| s.names.len()).unwrap_or(0)
    }
}

struct LookupRecord {
    name: String,
    presence: Presence,
    observed_at: Instant,
}

/// Single-entry cache of the last live lookup.
pub struct LastLookup {
    freshness: Duration,
    record: Option<LookupRecord>,
}

impl LastLookup {
    pub fn new(freshness: Duration) -> Self {
        Self { freshness, record: None }
    }

    pub fn get(&self, name: &str) -> Option<Presence> {
        let record = self.record.as_ref()?;
        if record.name == name && record.observed_at.elapsed() <= self.freshness {
            Some(record.presence.clone())
        } else {
            None
        }
    }

    pub fn record(&mut self, name: &str, presence: Presence) {
        self.record = Some(LookupRecord {
            name: name.to_string(),
            presence,
            observed_at: Instant::now(),
        });
    }

    pub fn clear(&mut self) {
        self.record = None;
    }
}

pub struct PresenceCache {
    /// `None` when snapshot caching is disabled.
    snapshot: Option<SnapshotCache>,
    last: LastLookup,
}

impl PresenceCache {
    pub fn new(policy: &CachePolicy) -> Self {
        let snapshot = policy.enabled.then(|| SnapshotCache::new(policy.ttl));
        Self::from_parts(snapshot, LastLookup::new(LOOKUP_FRESHNESS))
    }

    pub fn from_parts(snapshot: Option<SnapshotCache>, last: LastLookup) -> Self {
        Self { snapshot, last }
    }

    pub fn snapshot(&self) -> Option<&SnapshotCache> {
        self.snapshot.as_ref()
    }

    pub async fn lookup(&mut self, store: &dyn ObjectStore, name: &str) -> Result<Presence, StoreError> {
        if let Some(snapshot) = &mut self.snapshot {
            if snapshot.needs_rebuild() {
                snapshot.rebuild(store).await?;
            }
            match snapshot.probe(name) {
                SnapshotAnswer::Present(id) => return Ok(Presence::present(id)),
                SnapshotAnswer::Absent => return Ok(Presence::absent()),
                SnapshotAnswer::Unknown => {}
            }
        }

        if let Some(cached) = self.last.get(name) {
            debug!(name = %name, found = cached.found, "Presence served from last lookup");
            return Ok(cached);
        }

        let page = store.list_objects(name, 1).await?;
        let presence = match page.entries.into_iter().next() {
            Some(entry) if entry.name == name && entry.action == ObjectAction::Upload => {
                Presence::present(entry.id)
            }
            _ => Presence::absent(),
        };
        debug!(name = %name, found = presence.found, "Presence looked up");
        self.last.record(name, presence.clone());
        Ok(presence)
    }

    /// A new version of `name` now exists with identity `id`.
    pub fn record_upload(&mut self, name: &str, id: &str) {
        self.last.clear();
        if let Some(snapshot) = &mut self.snapshot {
            snapshot.insert(name, id);
        }
    }

    /// A hide of `name` was attempted. The last lookup is dropped whatever the
    /// outcome; the snapshot only forgets the name if the hide went through.
    pub fn record_hide(&mut self, name: &str, succeeded: bool) {
        self.last.clear();
        if succeeded {
            if let Some(snapshot) = &mut self.snapshot {
                snapshot.remove(name);
            }
        }
    }
}
