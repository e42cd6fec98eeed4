//! Process registry
//!
//! Maps stream ids to their running transcoder. The in-memory map is the
//! fast path and holds the live process handle; an optional [`ProcessStore`]
//! keeps a durable pid record so another gateway instance sharing the store
//! can still stop the stream.
//!
//! Whoever claims the durable record owns the teardown. A live entry whose
//! record has been claimed by a peer is "released": the stream is already
//! stopped and only local cleanup remains.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, StreamError};
use crate::session::{Session, SessionStatus};
use crate::transcoder::TranscoderProcess;

/// Live registry entry owned by this instance
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub session: Arc<Session>,
    pub process: Arc<TranscoderProcess>,
    pub registered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// A durable record was written for this entry
    pub durable: bool,
}

impl RegistryEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// `now + ttl`, saturating at the latest representable instant
pub fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Durable description of a registered process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub stream_id: String,
    pub pid: u32,
    pub source_url: String,
    pub output_dir: PathBuf,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// What a lookup found
#[derive(Debug, Clone)]
pub enum Registered {
    /// Process spawned by this instance
    Live(RegistryEntry),
    /// Only a durable record exists (spawned elsewhere)
    Detached(ProcessRecord),
}

/// Result of [`ProcessRegistry::take`]
#[derive(Debug, Clone)]
pub enum Claim {
    /// The caller owns the teardown
    Won(Registered),
    /// A peer already stopped the stream; the local handle still needs cleanup
    Released(RegistryEntry),
}

/// Durable key → process record storage
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn put(&self, record: &ProcessRecord) -> io::Result<()>;

    async fn get(&self, stream_id: &str) -> io::Result<Option<ProcessRecord>>;

    /// Remove and return a record. Of several concurrent callers, across
    /// every instance sharing the store, at most one receives `Some`.
    async fn claim(&self, stream_id: &str) -> io::Result<Option<ProcessRecord>>;

    /// Removing an absent record succeeds
    async fn remove(&self, stream_id: &str) -> io::Result<()>;
}

/// One JSON file per stream under a state directory
#[derive(Debug, Clone)]
pub struct FsProcessStore {
    dir: PathBuf,
}

impl FsProcessStore {
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path(&self, stream_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stream_id))
    }
}

#[async_trait]
impl ProcessStore for FsProcessStore {
    async fn put(&self, record: &ProcessRecord) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let path = self.path(&record.stream_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn get(&self, stream_id: &str) -> io::Result<Option<ProcessRecord>> {
        match tokio::fs::read(self.path(stream_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn claim(&self, stream_id: &str) -> io::Result<Option<ProcessRecord>> {
        // rename(2) is atomic: only one claimer moves the file away
        let claimed = self
            .dir
            .join(format!("{}.{}.claimed", stream_id, Uuid::new_v4()));
        match tokio::fs::rename(self.path(stream_id), &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }

        let bytes = tokio::fs::read(&claimed).await;
        if let Err(e) = tokio::fs::remove_file(&claimed).await {
            tracing::debug!(path = %claimed.display(), "Failed to remove claimed record: {}", e);
        }
        serde_json::from_slice(&bytes?)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn remove(&self, stream_id: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path(stream_id)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Durable record lookup outcome
enum RecordState {
    Present(ProcessRecord),
    Absent,
    /// No store configured, or the store could not be read
    Unknown,
}

/// Shared stream id → process mapping
#[derive(Default)]
pub struct ProcessRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
    store: Option<Arc<dyn ProcessStore>>,
}

impl ProcessRegistry {
    /// In-memory registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that mirrors entries into a durable store
    pub fn with_store(store: Arc<dyn ProcessStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store: Some(store),
        }
    }

    /// Register a process for a session.
    ///
    /// Fails if the id is already present; entries are never overwritten.
    pub async fn register(
        &self,
        session: Arc<Session>,
        process: Arc<TranscoderProcess>,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let mut entry = RegistryEntry {
            session,
            process,
            registered_at: now,
            expires_at: expiry(now, ttl),
            durable: false,
        };
        let id = entry.session.id.clone();

        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(StreamError::DuplicateSession(id));
        }
        entry.durable = self.persist(&entry, SessionStatus::Starting).await;
        tracing::debug!(
            stream_id = %id,
            pid = entry.process.pid(),
            durable = entry.durable,
            "Registered transcoder"
        );
        entries.insert(id, entry);
        Ok(())
    }

    /// Find a stream, preferring the live entry.
    ///
    /// A released live entry is reported as absent.
    pub async fn lookup(&self, stream_id: &str) -> Option<Registered> {
        let live = self.entries.read().await.get(stream_id).cloned();
        match live {
            Some(entry) => {
                if entry.durable && matches!(self.record_state(stream_id).await, RecordState::Absent)
                {
                    return None;
                }
                Some(Registered::Live(entry))
            }
            None => match self.record_state(stream_id).await {
                RecordState::Present(record) => Some(Registered::Detached(record)),
                _ => None,
            },
        }
    }

    /// Atomically claim a stream: remove it and return what was registered.
    ///
    /// Of several concurrent callers, on this instance or any peer sharing
    /// the store, at most one receives [`Claim::Won`].
    pub async fn take(&self, stream_id: &str) -> Option<Claim> {
        // Held across the store claim so local callers serialise
        let mut entries = self.entries.write().await;
        match entries.remove(stream_id) {
            Some(entry) if entry.durable => match self.claim_record(stream_id).await {
                RecordState::Absent => Some(Claim::Released(entry)),
                _ => Some(Claim::Won(Registered::Live(entry))),
            },
            Some(entry) => Some(Claim::Won(Registered::Live(entry))),
            None => match self.claim_record(stream_id).await {
                RecordState::Present(record) => Some(Claim::Won(Registered::Detached(record))),
                _ => None,
            },
        }
    }

    /// Remove a stream; absent ids are a no-op
    pub async fn remove(&self, stream_id: &str) -> Option<RegistryEntry> {
        let removed = self.entries.write().await.remove(stream_id);
        self.forget_record(stream_id).await;
        removed
    }

    /// Mirror a status change into the durable record.
    ///
    /// A record a peer already claimed is not recreated.
    pub async fn record_status(&self, stream_id: &str, status: SessionStatus) {
        let entry = self.entries.read().await.get(stream_id).cloned();
        if let Some(entry) = entry {
            if entry.durable && matches!(self.record_state(stream_id).await, RecordState::Absent) {
                return;
            }
            self.persist(&entry, status).await;
        }
    }

    /// Ids of live entries whose ttl has elapsed
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove and return live entries whose durable record a peer claimed
    pub async fn drain_released(&self) -> Vec<RegistryEntry> {
        if self.store.is_none() {
            return Vec::new();
        }
        let candidates: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.durable)
            .map(|(id, _)| id.clone())
            .collect();

        let mut released = Vec::new();
        for id in candidates {
            if !matches!(self.record_state(&id).await, RecordState::Absent) {
                continue;
            }
            let mut entries = self.entries.write().await;
            // Re-check under the lock; a local take may have won meanwhile
            if entries.contains_key(&id)
                && matches!(self.record_state(&id).await, RecordState::Absent)
            {
                if let Some(entry) = entries.remove(&id) {
                    released.push(entry);
                }
            }
        }
        released
    }

    pub async fn entries(&self) -> Vec<RegistryEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Write the durable record; returns whether it was stored
    async fn persist(&self, entry: &RegistryEntry, status: SessionStatus) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let record = ProcessRecord {
            stream_id: entry.session.id.clone(),
            pid: entry.process.pid(),
            source_url: entry.session.source_url.clone(),
            output_dir: entry.session.output_dir.clone(),
            status,
            created_at: entry.session.created_at,
            expires_at: entry.expires_at,
        };
        match store.put(&record).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(stream_id = %record.stream_id, "Failed to persist process record: {}", e);
                false
            }
        }
    }

    async fn record_state(&self, stream_id: &str) -> RecordState {
        let Some(store) = &self.store else {
            return RecordState::Unknown;
        };
        match store.get(stream_id).await {
            Ok(Some(record)) => RecordState::Present(record),
            Ok(None) => RecordState::Absent,
            Err(e) => {
                tracing::warn!(stream_id, "Failed to read process record: {}", e);
                RecordState::Unknown
            }
        }
    }

    async fn claim_record(&self, stream_id: &str) -> RecordState {
        let Some(store) = &self.store else {
            return RecordState::Unknown;
        };
        match store.claim(stream_id).await {
            Ok(Some(record)) => RecordState::Present(record),
            Ok(None) => RecordState::Absent,
            Err(e) => {
                tracing::warn!(stream_id, "Failed to claim process record: {}", e);
                RecordState::Unknown
            }
        }
    }

    async fn forget_record(&self, stream_id: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(stream_id).await {
                tracing::warn!(stream_id, "Failed to remove process record: {}", e);
            }
        }
    }
}
