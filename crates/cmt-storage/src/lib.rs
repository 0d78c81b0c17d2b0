//! Durable local state for CMT: crash-safe JSON files, the deduplicated record store,
//! the single-writer run lease and retry backoff.
//!
//! Layout under the data root:
//!
//! ```text
//! masters/<item>.json      one MasterRecord per item
//! snapshots/<item>.jsonl   append-only SnapshotRecord log, ascending collected_at
//! growth/<item>.json       latest derived GrowthMetric (cache, not ground truth)
//! run.lease                held while an ingestion cycle is active
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cmt_core::{Clock, GrowthMetric, ItemId, MasterAttrs, MasterRecord, Metrics, SnapshotRecord};
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cmt-storage";

const MASTERS_DIR: &str = "masters";
const SNAPSHOTS_DIR: &str = "snapshots";
const GROWTH_DIR: &str = "growth";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt state file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("item id must not be empty")]
    EmptyItemId,
    #[error("unknown item {0}: no master record stored for it")]
    UnknownItem(ItemId),
    #[error("data directory is leased by run {holder} (acquired {acquired_at}, expires {expires_at})")]
    ConcurrentAccess {
        holder: Uuid,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// File stem for an item. Ids that are not plain `[A-Za-z0-9_-]` are hash-addressed.
pub fn item_file_stem(item_id: &ItemId) -> String {
    let raw = item_id.as_str();
    let plain = !raw.is_empty()
        && raw.len() <= 96
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        raw.to_string()
    } else {
        format!("h-{}", sha256_hex(raw.as_bytes()))
    }
}

/// Replace `path` with `bytes` via temp file, fsync and rename, so readers see the old
/// content or the new content and never a torn write.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| io_err(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| io_err(&temp_path, e))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(&temp_path, err));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(path, err));
    }
    Ok(())
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T, what: &'static str) -> Result<()> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode { what, source })?;
    write_atomic(path, &bytes).await
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

async fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(dir, err)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(dir, e))? {
        let path = entry.path();
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if !hidden && path.extension().is_some_and(|ext| ext == extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// A single JSON document persisted with [`write_atomic`].
#[derive(Debug)]
pub struct StateFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateFile<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when the file does not exist yet.
    pub async fn load(&self) -> Result<Option<T>> {
        read_json(&self.path).await
    }

    pub async fn save(&self, value: &T) -> Result<()> {
        write_json(&self.path, value, "state file").await
    }
}

/// Newline-delimited JSON log. Each append is fsynced; rewriting goes through
/// [`write_atomic`].
///
/// A crash mid-append can leave a torn last line. `load` drops it and rewrites the log
/// so later appends start on a clean line. A bad line anywhere else is corruption.
#[derive(Debug)]
pub struct AppendLog<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AppendLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in append order; empty when the log does not exist yet.
    pub async fn load(&self) -> Result<Vec<T>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&self.path, err)),
        };

        let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());
        let mut torn = !text.is_empty() && !text.ends_with('\n');
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(_) if index + 1 == lines.len() => {
                    warn!(path = %self.path.display(), "dropping torn last line of log");
                    torn = true;
                }
                Err(source) => {
                    return Err(StoreError::Corrupt {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
        if torn {
            self.rewrite(&entries).await?;
        }
        Ok(entries)
    }

    pub async fn append(&self, entries: &[T]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let bytes = encode_lines(entries)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| io_err(&self.path, e))?;
        file.write_all(&bytes).await.map_err(|e| io_err(&self.path, e))?;
        file.flush().await.map_err(|e| io_err(&self.path, e))?;
        file.sync_data().await.map_err(|e| io_err(&self.path, e))
    }

    /// Replace the whole log, e.g. to compact it.
    pub async fn rewrite(&self, entries: &[T]) -> Result<()> {
        write_atomic(&self.path, &encode_lines(entries)?).await
    }
}

fn encode_lines<T: Serialize>(entries: &[T]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut bytes, entry).map_err(|source| StoreError::Encode {
            what: "log entry",
            source,
        })?;
        bytes.push(b'\n');
    }
    Ok(bytes)
}

/// Proof that a master record exists for an item. Only the store hands these out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterHandle {
    item_id: ItemId,
}

impl MasterHandle {
    pub fn item_id(&self) -> &ItemId {
        &self.item_id
    }
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub created: bool,
    pub backfilled: Vec<&'static str>,
    pub handle: MasterHandle,
}

/// Parent/child store: exactly one master per item, append-only snapshot history.
///
/// Every mutation is written to disk before the in-memory index changes, and writes
/// for one item are serialized by a per-item lock.
#[derive(Debug)]
pub struct RecordStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    masters: RwLock<BTreeMap<ItemId, MasterRecord>>,
    snapshots: RwLock<HashMap<ItemId, Vec<SnapshotRecord>>>,
    item_locks: Mutex<HashMap<ItemId, Arc<Mutex<()>>>>,
}

impl RecordStore {
    pub async fn open(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let root = root.into();
        let masters_dir = root.join(MASTERS_DIR);
        let snapshots_dir = root.join(SNAPSHOTS_DIR);
        for dir in [&masters_dir, &snapshots_dir] {
            fs::create_dir_all(dir).await.map_err(|e| io_err(dir, e))?;
        }

        let mut masters = BTreeMap::new();
        for path in list_files(&masters_dir, "json").await? {
            if let Some(record) = read_json::<MasterRecord>(&path).await? {
                masters.insert(record.item_id.clone(), record);
            }
        }

        let mut snapshots = HashMap::new();
        let mut snapshot_total = 0usize;
        for path in list_files(&snapshots_dir, "jsonl").await? {
            let mut history = AppendLog::<SnapshotRecord>::new(&path).load().await?;
            history.sort_by_key(|s| s.collected_at);
            let Some(first) = history.first() else {
                continue;
            };
            if !masters.contains_key(&first.item_id) {
                warn!(item_id = %first.item_id, path = %path.display(), "snapshot history without a master record");
            }
            snapshot_total += history.len();
            snapshots.insert(first.item_id.clone(), history);
        }

        info!(
            root = %root.display(),
            masters = masters.len(),
            snapshots = snapshot_total,
            "record store opened"
        );

        Ok(Self {
            root,
            clock,
            masters: RwLock::new(masters),
            snapshots: RwLock::new(snapshots),
            item_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn item_lock(&self, item_id: &ItemId) -> Arc<Mutex<()>> {
        let mut map = self.item_locks.lock().await;
        map.entry(item_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map's entry once no other writer holds or waits on the lock. Clones are
    /// only handed out under the map lock, so the count cannot grow while it is checked.
    async fn forget_item_lock(&self, item_id: &ItemId, lock: &Arc<Mutex<()>>) {
        let mut map = self.item_locks.lock().await;
        if Arc::strong_count(lock) <= 2 {
            map.remove(item_id);
        }
    }

    #[cfg(test)]
    async fn tracked_item_locks(&self) -> usize {
        self.item_locks.lock().await.len()
    }

    fn master_path(&self, item_id: &ItemId) -> PathBuf {
        self.root
            .join(MASTERS_DIR)
            .join(format!("{}.json", item_file_stem(item_id)))
    }

    fn snapshot_log(&self, item_id: &ItemId) -> AppendLog<SnapshotRecord> {
        AppendLog::new(
            self.root
                .join(SNAPSHOTS_DIR)
                .join(format!("{}.jsonl", item_file_stem(item_id))),
        )
    }

    fn growth_path(&self, item_id: &ItemId) -> PathBuf {
        self.root
            .join(GROWTH_DIR)
            .join(format!("{}.json", item_file_stem(item_id)))
    }

    /// Create the master on first sighting; afterwards only fill empty backfillable fields.
    pub async fn upsert_master(&self, item_id: &ItemId, attrs: MasterAttrs) -> Result<UpsertOutcome> {
        if item_id.is_empty() {
            return Err(StoreError::EmptyItemId);
        }
        let lock = self.item_lock(item_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.upsert_locked(item_id, attrs).await
        };
        self.forget_item_lock(item_id, &lock).await;
        outcome
    }

    async fn upsert_locked(&self, item_id: &ItemId, attrs: MasterAttrs) -> Result<UpsertOutcome> {
        let handle = MasterHandle {
            item_id: item_id.clone(),
        };
        let existing = self.masters.read().await.get(item_id).cloned();
        let now = self.clock.now();

        let Some(mut record) = existing else {
            let record = MasterRecord {
                item_id: item_id.clone(),
                attrs,
                first_discovered_at: now,
                updated_at: now,
            };
            write_json(&self.master_path(item_id), &record, "master record").await?;
            self.masters.write().await.insert(item_id.clone(), record);
            info!(%item_id, "new item discovered");
            return Ok(UpsertOutcome {
                created: true,
                backfilled: Vec::new(),
                handle,
            });
        };

        let backfilled = record.attrs.backfill_from(&attrs);
        if !backfilled.is_empty() {
            record.updated_at = now;
            write_json(&self.master_path(item_id), &record, "master record").await?;
            self.masters.write().await.insert(item_id.clone(), record);
            debug!(%item_id, fields = ?backfilled, "backfilled master attributes");
        }
        Ok(UpsertOutcome {
            created: false,
            backfilled,
            handle,
        })
    }

    /// Handle for an item whose master is already stored.
    pub async fn handle_for(&self, item_id: &ItemId) -> Result<MasterHandle> {
        if self.masters.read().await.contains_key(item_id) {
            Ok(MasterHandle {
                item_id: item_id.clone(),
            })
        } else {
            Err(StoreError::UnknownItem(item_id.clone()))
        }
    }

    /// Append a new snapshot. Never merges with or rewrites an earlier one.
    ///
    /// `collected_at` is strictly increasing per item: a timestamp that would collide with
    /// or precede the latest snapshot is moved one microsecond past it.
    pub async fn append_snapshot(
        &self,
        master: &MasterHandle,
        time_point: impl Into<String>,
        metrics: Metrics,
        source_task: impl Into<String>,
    ) -> Result<SnapshotRecord> {
        let item_id = master.item_id();
        if !self.masters.read().await.contains_key(item_id) {
            return Err(StoreError::UnknownItem(item_id.clone()));
        }
        let lock = self.item_lock(item_id).await;
        let appended = {
            let _guard = lock.lock().await;
            self.append_locked(item_id, time_point.into(), metrics, source_task.into())
                .await
        };
        self.forget_item_lock(item_id, &lock).await;
        appended
    }

    async fn append_locked(
        &self,
        item_id: &ItemId,
        time_point: String,
        mut metrics: Metrics,
        source_task: String,
    ) -> Result<SnapshotRecord> {
        metrics.retain(|name, value| {
            let finite = value.is_finite();
            if !finite {
                warn!(%item_id, metric = %name, "dropping non-finite metric value");
            }
            finite
        });

        let latest = self
            .snapshots
            .read()
            .await
            .get(item_id)
            .and_then(|history| history.last().map(|s| s.collected_at));
        let mut collected_at = self.clock.now();
        if let Some(last) = latest {
            if collected_at <= last {
                collected_at = last + chrono::Duration::microseconds(1);
            }
        }

        let record = SnapshotRecord {
            id: Uuid::new_v4(),
            item_id: item_id.clone(),
            collected_at,
            time_point,
            metrics,
            source_task,
        };
        self.snapshot_log(item_id)
            .append(std::slice::from_ref(&record))
            .await?;
        self.snapshots
            .write()
            .await
            .entry(item_id.clone())
            .or_default()
            .push(record.clone());
        debug!(%item_id, %collected_at, time_point = %record.time_point, "snapshot appended");
        Ok(record)
    }

    pub async fn known_item_ids(&self) -> BTreeSet<ItemId> {
        self.masters.read().await.keys().cloned().collect()
    }

    pub async fn master(&self, item_id: &ItemId) -> Option<MasterRecord> {
        self.masters.read().await.get(item_id).cloned()
    }

    /// Snapshot history, ascending by `collected_at`.
    pub async fn snapshots_for(&self, item_id: &ItemId) -> Vec<SnapshotRecord> {
        self.snapshots
            .read()
            .await
            .get(item_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn snapshot(&self, item_id: &ItemId, collected_at: DateTime<Utc>) -> Option<SnapshotRecord> {
        self.snapshots
            .read()
            .await
            .get(item_id)
            .and_then(|history| history.iter().find(|s| s.collected_at == collected_at).cloned())
    }

    pub async fn master_count(&self) -> usize {
        self.masters.read().await.len()
    }

    pub async fn snapshot_count(&self, item_id: &ItemId) -> usize {
        self.snapshots
            .read()
            .await
            .get(item_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Overwrite the derived growth cache for an item.
    pub async fn record_growth(&self, growth: &GrowthMetric) -> Result<()> {
        write_json(&self.growth_path(&growth.item_id), growth, "growth metric").await
    }

    pub async fn latest_growth(&self, item_id: &ItemId) -> Result<Option<GrowthMetric>> {
        read_json(&self.growth_path(item_id)).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub run_id: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Exclusive lease on a data directory for the duration of one run.
///
/// An unexpired lease held by another run is a [`StoreError::ConcurrentAccess`]; an
/// expired one is treated as left behind by a dead process and reclaimed.
#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
    info: LeaseInfo,
    released: bool,
}

impl RunLease {
    pub const FILE_NAME: &'static str = "run.lease";

    pub async fn acquire(root: &Path, run_id: Uuid, ttl: Duration, clock: &dyn Clock) -> Result<Self> {
        fs::create_dir_all(root).await.map_err(|e| io_err(root, e))?;
        let path = root.join(Self::FILE_NAME);
        let now = clock.now();
        let ttl_std = ttl;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(2));
        let info = LeaseInfo {
            run_id,
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let bytes = serde_json::to_vec_pretty(&info).map_err(|source| StoreError::Encode {
            what: "run lease",
            source,
        })?;

        for _ in 0..2 {
            if publish_lease(root, &path, run_id, &bytes).await? {
                debug!(%run_id, path = %path.display(), "run lease acquired");
                return Ok(Self {
                    path,
                    info,
                    released: false,
                });
            }

            let held = match read_json::<LeaseInfo>(&path).await {
                Ok(Some(held)) => held,
                Ok(None) => continue,
                Err(err) => {
                    if !lease_file_is_stale(&path, ttl_std).await {
                        warn!(path = %path.display(), error = %err, "run lease unreadable; treating it as held");
                        return Err(StoreError::ConcurrentAccess {
                            holder: Uuid::nil(),
                            acquired_at: now,
                            expires_at: now,
                        });
                    }
                    warn!(path = %path.display(), "reclaiming unreadable run lease older than its ttl");
                    remove_if_present(&path).await?;
                    continue;
                }
            };
            if held.expires_at > now {
                return Err(StoreError::ConcurrentAccess {
                    holder: held.run_id,
                    acquired_at: held.acquired_at,
                    expires_at: held.expires_at,
                });
            }
            warn!(path = %path.display(), stale_holder = %held.run_id, "reclaiming expired run lease");
            reclaim_expired(root, &path, run_id, &held).await?;
        }

        let held = read_json::<LeaseInfo>(&path).await.ok().flatten();
        Err(StoreError::ConcurrentAccess {
            holder: held.as_ref().map(|h| h.run_id).unwrap_or_else(Uuid::nil),
            acquired_at: held.as_ref().map(|h| h.acquired_at).unwrap_or(now),
            expires_at: held.map(|h| h.expires_at).unwrap_or(now),
        })
    }

    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }

    /// Remove the lease file if it still names this run.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let still_ours = read_json::<LeaseInfo>(&self.path)
            .await
            .ok()
            .flatten()
            .is_some_and(|held| held.run_id == self.info.run_id);
        if still_ours {
            remove_if_present(&self.path).await?;
        }
        Ok(())
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let still_ours = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LeaseInfo>(&bytes).ok())
            .is_some_and(|held| held.run_id == self.info.run_id);
        if still_ours {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write the lease body to a private temp file, then link it into place. The link fails
/// when a lease already exists, so the lease file is never visible half written.
async fn publish_lease(root: &Path, path: &Path, run_id: Uuid, bytes: &[u8]) -> Result<bool> {
    let temp_path = root.join(format!(".{}.{run_id}.tmp", RunLease::FILE_NAME));
    write_atomic(&temp_path, bytes).await?;
    let linked = fs::hard_link(&temp_path, path).await;
    let _ = fs::remove_file(&temp_path).await;
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Move an expired lease aside. If another run replaced it in the meantime, its lease is
/// linked back and left alone.
async fn reclaim_expired(root: &Path, path: &Path, run_id: Uuid, expired: &LeaseInfo) -> Result<()> {
    let aside = root.join(format!(".{}.{run_id}.stale", RunLease::FILE_NAME));
    match fs::rename(path, &aside).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_err(path, err)),
    }
    let moved = read_json::<LeaseInfo>(&aside).await.ok().flatten();
    if moved.as_ref().is_some_and(|moved| moved.run_id != expired.run_id) {
        match fs::hard_link(&aside, path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(io_err(path, err)),
        }
    }
    remove_if_present(&aside).await
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

/// True when the file was last modified longer than `ttl` ago.
async fn lease_file_is_stale(path: &Path, ttl: Duration) -> bool {
    fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > ttl)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Up to this fraction of the computed delay is added at random.
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay<R: Rng>(&self, attempt_index: usize, rng: &mut R) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let spread = delay.mul_f64(self.jitter_ratio.min(1.0) * rng.gen::<f64>());
        delay.saturating_add(spread).min(self.max_delay)
    }
}
