use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cmt_adapters::{
    DeliveryOutcome, DeliveryRecord, FixtureFetcher, Notifier, SyncTransport, TransportError,
};
use cmt_core::{Clock, Growth, ItemId, ManualClock, NotifyEvent, RecordKind, RecordRef, SelectionMode, SyncStatus};
use cmt_credentials::{CredentialSpec, HealthProbe, PoolConfig, PoolFile, ProbeError};
use cmt_storage::BackoffPolicy;
use cmt_sync::{Collaborators, CycleError, IngestionPipeline, PipelineConfig, SyncSettings, Watchlist};
use serde_json::json;
use tempfile::{tempdir, TempDir};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
}

#[derive(Default)]
struct RecordingTransport {
    offline: AtomicBool,
    batches: Mutex<Vec<Vec<DeliveryRecord>>>,
}

impl RecordingTransport {
    fn delivered(&self) -> Vec<Vec<DeliveryRecord>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncTransport for RecordingTransport {
    async fn deliver(&self, batch: &[DeliveryRecord]) -> Result<Vec<DeliveryOutcome>, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("connection refused".into()));
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(vec![DeliveryOutcome::Ok; batch.len()])
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
    drained: AtomicBool,
}

impl RecordingNotifier {
    fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(NotifyEvent::name).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn notify(&self, event: &NotifyEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    async fn drain(&self, _timeout: Duration) {
        self.drained.store(true, Ordering::SeqCst);
    }
}

struct AcceptingProbe;

#[async_trait]
impl HealthProbe for AcceptingProbe {
    async fn probe(&self, _endpoint: &str, _secret: &str) -> Result<bool, ProbeError> {
        Ok(true)
    }
}

struct Harness {
    dir: TempDir,
    clock: Arc<ManualClock>,
    transport: Arc<RecordingTransport>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("fixtures")).unwrap();
        Self {
            dir,
            clock: Arc::new(ManualClock::new(t0())),
            transport: Arc::new(RecordingTransport::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            data_dir: self.dir.path().join("data"),
            fixtures_dir: self.dir.path().join("fixtures"),
            sync: SyncSettings {
                batch_size: 10,
                max_concurrent_batches: 2,
                batch_timeout: Duration::from_secs(5),
                backoff: BackoffPolicy {
                    max_retries: 3,
                    base_delay: Duration::from_secs(5),
                    max_delay: Duration::from_secs(60),
                    jitter_ratio: 0.2,
                },
            },
            ..PipelineConfig::default()
        }
    }

    fn fixture(&self, id: &str, body: serde_json::Value) {
        write_fixture(&self.dir.path().join("fixtures"), id, body);
    }

    fn collaborators(&self) -> Collaborators {
        let clock: Arc<dyn Clock> = self.clock.clone();
        Collaborators {
            fetcher: Arc::new(FixtureFetcher::new(self.dir.path().join("fixtures"), clock)),
            transport: self.transport.clone(),
            probe: Arc::new(AcceptingProbe),
            notifier: self.notifier.clone(),
        }
    }

    async fn open(&self, credentials: Vec<CredentialSpec>) -> Result<IngestionPipeline, CycleError> {
        let pool_file = PoolFile {
            config: PoolConfig {
                selection_mode: SelectionMode::Priority,
                ..PoolConfig::default()
            },
            credentials,
        };
        IngestionPipeline::open(self.config(), pool_file, self.clock.clone(), self.collaborators()).await
    }
}

fn write_fixture(dir: &Path, id: &str, body: serde_json::Value) {
    std::fs::write(dir.join(format!("{id}.json")), serde_json::to_vec_pretty(&body).unwrap()).unwrap();
}

fn credential(name: &str, priority: i32, max_failures: u32) -> CredentialSpec {
    CredentialSpec {
        name: name.to_string(),
        secret: format!("SESSDATA={name}"),
        priority,
        enabled: true,
        max_failures,
    }
}

fn video(id: &str, title: &str, view: f64, like: f64) -> serde_json::Value {
    json!({
        "item_id": id,
        "attrs": { "title": title, "owner_id": "9001", "tags": ["vlog"] },
        "metrics": { "view": view, "like": like }
    })
}

fn watch(ids: &[&str]) -> Watchlist {
    Watchlist::new(ids.iter().map(|id| ItemId::new(*id)))
}

#[tokio::test]
async fn first_cycle_stores_new_items_and_syncs_masters_ahead_of_snapshots() {
    let harness = Harness::new();
    harness.fixture("BV1aa", video("BV1aa", "Studio tour", 100.0, 10.0));
    harness.fixture("BV1bb", video("BV1bb", "Q&A", 2000.0, 300.0));
    let mut pipeline = harness.open(vec![credential("main", 1, 3)]).await.unwrap();

    let summary = pipeline
        .run_cycle(&watch(&["BV1aa", "BV1bb", "BV1missing", "BV1aa"]))
        .await
        .unwrap();

    assert_eq!(summary.items_requested, 3);
    assert_eq!(summary.items_processed, 2);
    assert_eq!(summary.items_skipped, 1);
    assert_eq!(summary.new_items, 2);
    assert_eq!(summary.snapshots_written, 2);
    assert_eq!(summary.growth_insufficient, 2);
    assert_eq!(summary.records_synced, 4);
    assert_eq!(summary.sync_backlog, 0);
    assert!(summary.credentials_disabled.is_empty());
    assert!(!summary.timed_out);

    let master = pipeline.store().master(&ItemId::new("BV1aa")).await.unwrap();
    assert_eq!(master.attrs.title.as_deref(), Some("Studio tour"));
    assert_eq!(master.first_discovered_at, t0());

    for batch in harness.transport.delivered() {
        let first_snapshot = batch.iter().position(|r| r.kind == RecordKind::Snapshot);
        let last_master = batch.iter().rposition(|r| r.kind == RecordKind::Master);
        if let (Some(snapshot), Some(master)) = (first_snapshot, last_master) {
            assert!(master < snapshot);
        }
    }
    assert_eq!(harness.notifier.names(), vec!["cycle_started", "cycle_completed"]);
    assert!(!harness.notifier.drained.load(Ordering::SeqCst));
    pipeline.close().await.unwrap();
    assert!(harness.notifier.drained.load(Ordering::SeqCst), "close waits for outstanding notifications");
}

#[tokio::test]
async fn known_items_fetch_metrics_only_and_grow() {
    let harness = Harness::new();
    harness.fixture("BV1aa", video("BV1aa", "Studio tour", 100.0, 10.0));
    let mut pipeline = harness.open(vec![credential("main", 1, 3)]).await.unwrap();
    pipeline.run_cycle(&watch(&["BV1aa"])).await.unwrap();

    harness.clock.advance(chrono::Duration::hours(1));
    harness.fixture("BV1aa", video("BV1aa", "Renamed upstream", 150.0, 16.0));
    let summary = pipeline.run_cycle(&watch(&["BV1aa"])).await.unwrap();

    assert_eq!(summary.new_items, 0);
    assert_eq!(summary.growth_computed, 1);
    assert_eq!(summary.records_synced, 1);

    let id = ItemId::new("BV1aa");
    let master = pipeline.store().master(&id).await.unwrap();
    assert_eq!(master.attrs.title.as_deref(), Some("Studio tour"));
    assert_eq!(pipeline.store().snapshot_count(&id).await, 2);

    let cached = pipeline.store().latest_growth(&id).await.unwrap().unwrap();
    assert_eq!(cached.delta["view"], 50.0);
    assert_eq!(cached.rate_per_hour["view"], 50.0);
    assert_eq!(cached.rate_per_hour["like"], 6.0);
    assert!(matches!(pipeline.growth(&id, None).await.unwrap(), Growth::Computed(_)));
    pipeline.close().await.unwrap();
}

#[tokio::test]
async fn rejected_credential_is_disabled_and_the_next_one_takes_over() {
    let harness = Harness::new();
    let mut body = video("BV1auth", "Members only", 5.0, 1.0);
    body["rejected_credentials"] = json!(["main"]);
    harness.fixture("BV1auth", body);
    let mut pipeline = harness
        .open(vec![credential("main", 1, 1), credential("spare", 2, 3)])
        .await
        .unwrap();

    let summary = pipeline.run_cycle(&watch(&["BV1auth"])).await.unwrap();

    assert_eq!(summary.items_processed, 1);
    assert_eq!(summary.credentials_disabled, vec!["main".to_string()]);
    let status = pipeline.pool_status();
    assert_eq!(status.available, 1);
    assert_eq!(status.disabled, 1);
    pipeline.close().await.unwrap();
}

#[tokio::test]
async fn rejected_credential_below_its_failure_limit_still_hands_over_to_the_next() {
    let harness = Harness::new();
    let mut body = video("BV1auth", "Members only", 5.0, 1.0);
    body["rejected_credentials"] = json!(["main"]);
    harness.fixture("BV1auth", body);
    let mut pipeline = harness
        .open(vec![credential("main", 1, 5), credential("spare", 2, 5)])
        .await
        .unwrap();

    let summary = pipeline.run_cycle(&watch(&["BV1auth"])).await.unwrap();

    assert_eq!(summary.items_processed, 1);
    assert!(summary.credentials_disabled.is_empty());
    let records = pipeline.pool().records();
    let main = records.iter().find(|r| r.name == "main").unwrap();
    let spare = records.iter().find(|r| r.name == "spare").unwrap();
    assert_eq!(main.failure_count, 1);
    assert!(main.enabled);
    assert!(spare.last_used_at.is_some());
    assert_eq!(spare.failure_count, 0);
    pipeline.close().await.unwrap();
}

#[tokio::test]
async fn item_rejected_by_every_credential_is_skipped_once_each_was_tried() {
    let harness = Harness::new();
    let mut body = video("BV1locked", "Locked", 5.0, 1.0);
    body["rejected_credentials"] = json!(["main", "spare"]);
    harness.fixture("BV1locked", body);
    harness.fixture("BV1ok", video("BV1ok", "Fine", 1.0, 1.0));
    let mut pipeline = harness
        .open(vec![credential("main", 1, 9), credential("spare", 2, 9)])
        .await
        .unwrap();

    let summary = pipeline.run_cycle(&watch(&["BV1locked", "BV1ok"])).await.unwrap();

    assert_eq!(summary.items_processed, 1);
    assert_eq!(summary.items_skipped, 1);
    assert!(pipeline.pool().records().iter().all(|r| r.failure_count <= 1));
    pipeline.close().await.unwrap();
}

#[tokio::test]
async fn exhausted_pool_fails_the_cycle_and_notifies() {
    let harness = Harness::new();
    let mut body = video("BV1auth", "Members only", 5.0, 1.0);
    body["rejected_credentials"] = json!(["main"]);
    harness.fixture("BV1auth", body);
    let mut pipeline = harness.open(vec![credential("main", 1, 1)]).await.unwrap();

    let err = pipeline.run_cycle(&watch(&["BV1auth"])).await.unwrap_err();

    assert!(matches!(err, CycleError::Exhausted { total: 1 }));
    assert_eq!(harness.notifier.names(), vec!["cycle_started", "cycle_failed"]);
    assert!(pipeline.store().master(&ItemId::new("BV1auth")).await.is_none());
    pipeline.close().await.unwrap();
}

#[tokio::test]
async fn non_auth_fetch_failure_skips_the_item_without_penalizing_the_credential() {
    let harness = Harness::new();
    let mut flaky = video("BV1flaky", "Flaky", 1.0, 1.0);
    flaky["failure"] = json!("transient");
    harness.fixture("BV1flaky", flaky);
    harness.fixture("BV1ok", video("BV1ok", "Fine", 1.0, 1.0));
    let mut pipeline = harness.open(vec![credential("main", 1, 1)]).await.unwrap();

    let summary = pipeline.run_cycle(&watch(&["BV1flaky", "BV1ok"])).await.unwrap();

    assert_eq!(summary.items_processed, 1);
    assert_eq!(summary.items_skipped, 1);
    assert_eq!(pipeline.pool().records()[0].failure_count, 0);
    assert!(pipeline.pool().records()[0].enabled);
    pipeline.close().await.unwrap();
}

#[tokio::test]
async fn offline_sync_target_keeps_records_queued_until_it_returns() {
    let harness = Harness::new();
    harness.fixture("BV1aa", video("BV1aa", "Studio tour", 100.0, 10.0));
    harness.transport.offline.store(true, Ordering::SeqCst);
    let mut pipeline = harness.open(vec![credential("main", 1, 3)]).await.unwrap();

    let summary = pipeline.run_cycle(&watch(&["BV1aa"])).await.unwrap();
    assert_eq!(summary.items_processed, 1);
    assert_eq!(summary.records_synced, 0);
    assert_eq!(summary.sync_backlog, 2);

    let master_ref = RecordRef::master(ItemId::new("BV1aa"));
    let state = pipeline.sync_engine().state_of(&master_ref).unwrap();
    assert_eq!(state.status, SyncStatus::Pending);
    assert_eq!(state.attempts, 1);
    assert!(pipeline.store().master(&ItemId::new("BV1aa")).await.is_some());

    harness.transport.offline.store(false, Ordering::SeqCst);
    harness.clock.advance(chrono::Duration::minutes(5));
    let report = pipeline.flush(None).await.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(pipeline.sync_engine().backlog(), 0);
    pipeline.close().await.unwrap();
}

#[tokio::test]
async fn a_healthy_target_receives_every_record_of_a_large_cycle() {
    let harness = Harness::new();
    let ids: Vec<String> = (0..15).map(|n| format!("BV1bulk{n:02}")).collect();
    for id in &ids {
        harness.fixture(id, video(id, "Bulk", 1.0, 1.0));
    }
    let watchlist = Watchlist::new(ids.iter().map(|id| ItemId::new(id.as_str())));
    let mut pipeline = harness.open(vec![credential("main", 1, 3)]).await.unwrap();

    let summary = pipeline.run_cycle(&watchlist).await.unwrap();

    assert_eq!(summary.items_processed, 15);
    assert_eq!(summary.records_synced, 30);
    assert_eq!(summary.sync_backlog, 0);
    let delivered: usize = harness.transport.delivered().iter().map(Vec::len).sum();
    assert_eq!(delivered, 30);
    pipeline.close().await.unwrap();
}

#[tokio::test]
async fn a_second_pipeline_on_the_same_data_dir_is_refused() {
    let harness = Harness::new();
    let first = harness.open(vec![credential("main", 1, 3)]).await.unwrap();

    let second = harness.open(vec![credential("main", 1, 3)]).await;
    assert!(matches!(second, Err(CycleError::ConcurrentAccess { .. })));

    first.close().await.unwrap();
    let third = harness.open(vec![credential("main", 1, 3)]).await.unwrap();
    third.close().await.unwrap();
}

#[tokio::test]
async fn default_collaborators_spool_deliveries_to_the_outbox() {
    let harness = Harness::new();
    harness.fixture("BV1aa", video("BV1aa", "Studio tour", 100.0, 10.0));
    let config = harness.config();
    let clock: Arc<dyn Clock> = harness.clock.clone();
    let collaborators = Collaborators::from_config(&config, clock.clone()).unwrap();
    let pool_file = PoolFile {
        config: PoolConfig::default(),
        credentials: vec![credential("main", 1, 3)],
    };
    let mut pipeline = IngestionPipeline::open(config.clone(), pool_file, clock, collaborators)
        .await
        .unwrap();

    let summary = pipeline.run_cycle(&watch(&["BV1aa"])).await.unwrap();
    assert_eq!(summary.records_synced, 2);

    let spooled = std::fs::read_to_string(config.outbox_path()).unwrap();
    let kinds: Vec<RecordKind> = spooled
        .lines()
        .map(|line| serde_json::from_str::<DeliveryRecord>(line).unwrap().kind)
        .collect();
    assert_eq!(kinds, vec![RecordKind::Master, RecordKind::Snapshot]);
    pipeline.close().await.unwrap();
}
