//! Core domain model for CMT: tracked items, metric snapshots, sync ledger entries and credentials.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cmt-core";

/// Stable identifier of a tracked content item. Surrounding whitespace is trimmed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Metric name -> numeric value for one measurement.
pub type Metrics = BTreeMap<String, f64>;

/// Descriptive attributes of an item.
///
/// `title`, `owner_id` and `published_at` are fixed at first discovery. The rest are
/// backfillable: a later observation may fill them in when they are still empty.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MasterAttrs {
    pub title: Option<String>,
    pub owner_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub owner_name: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MasterAttrs {
    pub const BACKFILL_FIELDS: [&'static str; 5] =
        ["owner_name", "description", "cover_url", "duration_secs", "tags"];

    /// Fill empty backfillable fields from `newer`. Returns the names of the fields that changed.
    pub fn backfill_from(&mut self, newer: &MasterAttrs) -> Vec<&'static str> {
        let mut filled = Vec::new();
        if fill_if_empty(&mut self.owner_name, &newer.owner_name) {
            filled.push("owner_name");
        }
        if fill_if_empty(&mut self.description, &newer.description) {
            filled.push("description");
        }
        if fill_if_empty(&mut self.cover_url, &newer.cover_url) {
            filled.push("cover_url");
        }
        if fill_if_empty(&mut self.duration_secs, &newer.duration_secs) {
            filled.push("duration_secs");
        }
        if self.tags.is_empty() && !newer.tags.is_empty() {
            self.tags = newer.tags.clone();
            filled.push("tags");
        }
        filled
    }
}

fn fill_if_empty<T: Clone>(slot: &mut Option<T>, candidate: &Option<T>) -> bool {
    match (slot.is_none(), candidate) {
        (true, Some(value)) => {
            *slot = Some(value.clone());
            true
        }
        _ => false,
    }
}

/// Parent record: one per item, created on first sighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub item_id: ItemId,
    pub attrs: MasterAttrs,
    pub first_discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Child record: one point-in-time measurement. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub item_id: ItemId,
    pub collected_at: DateTime<Utc>,
    pub time_point: String,
    pub metrics: Metrics,
    pub source_task: String,
}

impl SnapshotRecord {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef::Snapshot {
            item_id: self.item_id.clone(),
            collected_at: self.collected_at,
        }
    }
}

/// How much the fetch layer should pull for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchScope {
    /// First sighting: descriptive attributes and metrics.
    Full,
    /// Known item: metrics, plus whatever attributes come along for free.
    MetricsOnly,
}

/// Handoff contract from the fetch layer into the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetricBundle {
    pub item_id: ItemId,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub attrs: MasterAttrs,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Master,
    Snapshot,
}

/// Addresses one locally stored record. Masters order before snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordRef {
    Master {
        item_id: ItemId,
    },
    Snapshot {
        item_id: ItemId,
        collected_at: DateTime<Utc>,
    },
}

impl RecordRef {
    pub fn master(item_id: ItemId) -> Self {
        Self::Master { item_id }
    }

    pub fn item_id(&self) -> &ItemId {
        match self {
            Self::Master { item_id } | Self::Snapshot { item_id, .. } => item_id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Master { .. } => RecordKind::Master,
            Self::Snapshot { .. } => RecordKind::Snapshot,
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master { item_id } => write!(f, "master:{item_id}"),
            Self::Snapshot {
                item_id,
                collected_at,
            } => write!(f, "snapshot:{item_id}@{}", collected_at.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InFlight,
    Synced,
    Failed,
}

/// Delivery ledger entry for one local record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub record: RecordRef,
    pub status: SyncStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn pending(record: RecordRef, now: DateTime<Utc>) -> Self {
        Self {
            record,
            status: SyncStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == SyncStatus::Pending && self.next_attempt_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    #[default]
    Random,
    RoundRobin,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// One authentication credential and its health bookkeeping.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub name: String,
    pub secret: String,
    pub priority: i32,
    pub enabled: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub max_failures: u32,
    #[serde(default)]
    pub last_health_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub health: HealthStatus,
}

impl CredentialRecord {
    pub fn new(name: impl Into<String>, secret: impl Into<String>, priority: i32, max_failures: u32) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
            priority,
            enabled: true,
            last_used_at: None,
            failure_count: 0,
            max_failures,
            last_health_check_at: None,
            health: HealthStatus::Unknown,
        }
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("last_used_at", &self.last_used_at)
            .field("failure_count", &self.failure_count)
            .field("max_failures", &self.max_failures)
            .field("health", &self.health)
            .finish()
    }
}

/// Derived growth between two snapshots of the same item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthMetric {
    pub item_id: ItemId,
    pub earlier_at: DateTime<Utc>,
    pub later_at: DateTime<Utc>,
    pub earlier_time_point: String,
    pub later_time_point: String,
    pub interval_seconds: i64,
    pub delta: BTreeMap<String, f64>,
    pub rate_per_hour: BTreeMap<String, f64>,
    /// True when some metric was present in only one of the two snapshots.
    pub partial: bool,
    pub excluded_metrics: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InsufficientReason {
    NotEnoughDataPoints { available: usize },
    TimePointMissing { time_point: String },
}

impl InsufficientReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotEnoughDataPoints { .. } => "not_enough_data_points",
            Self::TimePointMissing { .. } => "time_point_missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Growth {
    Computed(GrowthMetric),
    Insufficient {
        item_id: ItemId,
        reason: InsufficientReason,
    },
}

/// Outcome counters for one ingestion cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items_requested: usize,
    pub items_processed: usize,
    pub items_skipped: usize,
    pub new_items: usize,
    pub snapshots_written: usize,
    pub growth_computed: usize,
    pub growth_insufficient: usize,
    pub records_synced: usize,
    pub records_failed: usize,
    pub sync_backlog: usize,
    pub credentials_disabled: Vec<String>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    CycleStarted {
        run_id: Uuid,
        started_at: DateTime<Utc>,
        items: usize,
    },
    CycleCompleted {
        stats: CycleSummary,
    },
    CycleFailed {
        run_id: Uuid,
        error: String,
    },
}

impl NotifyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CycleStarted { .. } => "cycle_started",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::CycleFailed { .. } => "cycle_failed",
        }
    }
}

/// Source of "now" for every timestamp the pipeline writes.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
