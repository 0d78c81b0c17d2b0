//! Ingestion cycle orchestration: credential pool, record store, growth analysis and
//! offline-first sync wired together behind one `IngestionPipeline`.

mod engine;
mod growth;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cmt_adapters::{
    FetchError, FixtureFetcher, HttpClientConfig, HttpHealthProbe, HttpSyncTransport, ItemFetcher,
    LogNotifier, Notifier, SpoolTransport, SyncTransport, WebhookNotifier,
};
use cmt_core::{
    Clock, CycleSummary, FetchScope, Growth, ItemId, NotifyEvent, RawMetricBundle,
    RecordRef, SystemClock,
};
use cmt_credentials::{CredentialPool, HealthProbe, HealthReport, PoolError, PoolFile, PoolState, PoolStatus};
use cmt_storage::{AppendLog, BackoffPolicy, RecordStore, RunLease, StateFile, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use engine::{FlushReport, LedgerCounts, SyncEngine, SyncSettings, LEDGER_FILE};
pub use growth::{growth_between, GrowthAnalyzer, GrowthError};

pub const CRATE_NAME: &str = "cmt-sync";

pub const POOL_STATE_FILE: &str = "credentials_state.json";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub credentials_file: PathBuf,
    pub watchlist_file: PathBuf,
    pub fixtures_dir: PathBuf,
    /// Remote ingest endpoint. Unset means deliveries are spooled under `data_dir/outbox`.
    pub sync_endpoint: Option<String>,
    pub sync_token: Option<String>,
    pub notify_webhook: Option<String>,
    pub sync: SyncSettings,
    pub cycle_timeout: Duration,
    pub max_credential_switches: usize,
    pub lease_ttl: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            credentials_file: PathBuf::from("./credentials.yaml"),
            watchlist_file: PathBuf::from("./watchlist.yaml"),
            fixtures_dir: PathBuf::from("./fixtures"),
            sync_endpoint: None,
            sync_token: None,
            notify_webhook: None,
            sync: SyncSettings::default(),
            cycle_timeout: Duration::from_secs(1800),
            max_credential_switches: 3,
            lease_ttl: Duration::from_secs(7200),
            scheduler_enabled: false,
            sync_cron: "0 0 8 * * *".to_string(),
            http_timeout_secs: 10,
            user_agent: "cmt-bot/0.1".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, falling back to defaults for missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, fallback: u64| text(key).and_then(|v| v.parse().ok()).unwrap_or(fallback);
        let secs = |key: &str, fallback: Duration| Duration::from_secs(number(key, fallback.as_secs()));

        let backoff = BackoffPolicy {
            max_retries: number("CMT_SYNC_MAX_RETRIES", defaults.sync.backoff.max_retries as u64) as u32,
            base_delay: secs("CMT_SYNC_BACKOFF_BASE_SECS", defaults.sync.backoff.base_delay),
            max_delay: secs("CMT_SYNC_BACKOFF_CAP_SECS", defaults.sync.backoff.max_delay),
            ..defaults.sync.backoff
        };

        Self {
            data_dir: text("CMT_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            credentials_file: text("CMT_CREDENTIALS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.credentials_file),
            watchlist_file: text("CMT_WATCHLIST_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.watchlist_file),
            fixtures_dir: text("CMT_FIXTURES_DIR").map(PathBuf::from).unwrap_or(defaults.fixtures_dir),
            sync_endpoint: text("CMT_SYNC_ENDPOINT"),
            sync_token: text("CMT_SYNC_TOKEN"),
            notify_webhook: text("CMT_NOTIFY_WEBHOOK"),
            sync: SyncSettings {
                batch_size: number("CMT_SYNC_BATCH_SIZE", defaults.sync.batch_size as u64) as usize,
                max_concurrent_batches: number(
                    "CMT_SYNC_MAX_CONCURRENT_BATCHES",
                    defaults.sync.max_concurrent_batches as u64,
                ) as usize,
                batch_timeout: secs("CMT_SYNC_BATCH_TIMEOUT_SECS", defaults.sync.batch_timeout),
                backoff,
            },
            cycle_timeout: secs("CMT_CYCLE_TIMEOUT_SECS", defaults.cycle_timeout),
            max_credential_switches: number(
                "CMT_MAX_CREDENTIAL_SWITCHES",
                defaults.max_credential_switches as u64,
            ) as usize,
            lease_ttl: secs("CMT_LEASE_TTL_SECS", defaults.lease_ttl),
            scheduler_enabled: text("CMT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: text("CMT_SYNC_CRON").unwrap_or(defaults.sync_cron),
            http_timeout_secs: number("CMT_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            user_agent: text("CMT_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("outbox").join("deliveries.jsonl")
    }
}

fn default_time_point() -> String {
    "full".to_string()
}

fn default_source_task() -> String {
    "scheduled".to_string()
}

/// Items one cycle should fetch, plus the labels stamped on the snapshots it writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watchlist {
    #[serde(default = "default_time_point")]
    pub time_point: String,
    #[serde(default = "default_source_task")]
    pub source_task: String,
    #[serde(default)]
    pub items: Vec<ItemId>,
}

impl Watchlist {
    pub fn new(items: impl IntoIterator<Item = ItemId>) -> Self {
        Self {
            time_point: default_time_point(),
            source_task: default_source_task(),
            items: items.into_iter().collect(),
        }
    }

    /// Non-empty ids in file order, duplicates removed.
    pub fn unique_items(&self) -> Vec<ItemId> {
        let mut seen = BTreeSet::new();
        self.items
            .iter()
            .filter(|id| !id.is_empty() && seen.insert((*id).clone()))
            .cloned()
            .collect()
    }
}

pub async fn load_pool_file(path: &Path) -> Result<PoolFile> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn load_watchlist(path: &Path) -> Result<Watchlist> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Cycle-fatal failures. Everything else is handled per item or recovered by the sync ledger.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("credential pool exhausted: none of {total} credentials is enabled")]
    Exhausted { total: usize },
    #[error("data directory is leased by run {holder} until {expires_at}")]
    ConcurrentAccess { holder: Uuid, expires_at: DateTime<Utc> },
    #[error("credential pool: {0}")]
    Pool(PoolError),
    #[error("local storage: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for CycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrentAccess { holder, expires_at, .. } => Self::ConcurrentAccess { holder, expires_at },
            other => Self::Storage(other),
        }
    }
}

impl From<PoolError> for CycleError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { total } => Self::Exhausted { total },
            PoolError::Store(err) => err.into(),
            other => Self::Pool(other),
        }
    }
}

/// External collaborators a pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn ItemFetcher>,
    pub transport: Arc<dyn SyncTransport>,
    pub probe: Arc<dyn HealthProbe>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Fixture fetcher, HTTP probe, and HTTP or spool transport depending on the config.
    pub fn from_config(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let http = config.http_client_config();
        let transport: Arc<dyn SyncTransport> = match &config.sync_endpoint {
            Some(endpoint) => Arc::new(
                HttpSyncTransport::new(&http, endpoint.clone(), config.sync_token.clone())
                    .context("building sync transport")?,
            ),
            None => Arc::new(SpoolTransport::new(config.outbox_path())),
        };
        let notifier: Arc<dyn Notifier> = match &config.notify_webhook {
            Some(url) => Arc::new(WebhookNotifier::new(&http, url.clone()).context("building webhook notifier")?),
            None => Arc::new(LogNotifier),
        };
        Ok(Self {
            fetcher: Arc::new(FixtureFetcher::new(config.fixtures_dir.clone(), clock)),
            transport,
            probe: Arc::new(HttpHealthProbe::new(&http).context("building health probe")?),
            notifier,
        })
    }
}

#[derive(Debug, Default)]
struct CycleTally {
    processed: usize,
    new_items: usize,
    snapshots_written: usize,
    growth_computed: usize,
    growth_insufficient: usize,
}

enum ItemOutcome {
    Stored,
    Skipped,
    DeadlineReached,
}

enum FetchAttempt {
    Fetched(RawMetricBundle),
    Skipped,
    DeadlineReached,
}

/// Owns the data directory for its lifetime through a [`RunLease`].
pub struct IngestionPipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    lease: Option<RunLease>,
    store: Arc<RecordStore>,
    pool: CredentialPool,
    sync: SyncEngine,
    analyzer: GrowthAnalyzer,
    collaborators: Collaborators,
}

impl IngestionPipeline {
    pub async fn open(
        config: PipelineConfig,
        pool_file: PoolFile,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
    ) -> Result<Self, CycleError> {
        let lease = RunLease::acquire(&config.data_dir, Uuid::new_v4(), config.lease_ttl, clock.as_ref()).await?;
        let store = Arc::new(RecordStore::open(&config.data_dir, clock.clone()).await?);
        let pool = CredentialPool::open(
            pool_file.config,
            pool_file.credentials,
            StateFile::<PoolState>::new(config.data_dir.join(POOL_STATE_FILE)),
            clock.clone(),
        )
        .await?;
        let sync = SyncEngine::open(
            AppendLog::new(config.data_dir.join(LEDGER_FILE)),
            clock.clone(),
            config.sync,
        )
        .await?;
        let analyzer = GrowthAnalyzer::new(store.clone(), clock.clone());
        Ok(Self {
            config,
            clock,
            lease: Some(lease),
            store,
            pool,
            sync,
            analyzer,
            collaborators,
        })
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status_summary()
    }

    pub async fn reset_credential(&mut self, name: &str) -> Result<(), CycleError> {
        Ok(self.pool.reset(name).await?)
    }

    /// Probe every in-scope credential now, ignoring the check interval.
    pub async fn health_check(&mut self) -> Result<HealthReport, CycleError> {
        Ok(self.pool.health_check(self.collaborators.probe.clone()).await?)
    }

    pub async fn growth(&self, item_id: &ItemId, labels: Option<(&str, &str)>) -> Result<Growth, GrowthError> {
        match labels {
            Some((earlier, later)) => self.analyzer.compute_growth_between(item_id, earlier, later).await,
            None => self.analyzer.compute_growth(item_id).await,
        }
    }

    pub async fn retry_failed(&mut self) -> Result<usize, CycleError> {
        Ok(self.sync.retry_failed().await?)
    }

    /// Deliver everything ready now, outside a cycle.
    pub async fn flush(&mut self, deadline: Option<Instant>) -> Result<FlushReport, CycleError> {
        let settings = *self.sync.settings();
        Ok(self
            .sync
            .drain(
                &self.store,
                self.collaborators.transport.clone(),
                settings.batch_size,
                settings.max_concurrent_batches,
                deadline,
            )
            .await?)
    }

    /// Fetch every watchlist item, store what came back, derive growth and sync.
    ///
    /// Only credential exhaustion (and a lost lease) aborts the cycle; the notifier hears
    /// about the outcome either way.
    pub async fn run_cycle(&mut self, watchlist: &Watchlist) -> Result<CycleSummary, CycleError> {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let items = watchlist.unique_items();
        let span = info_span!("ingest_cycle", %run_id, items = items.len());

        async {
            self.collaborators.notifier.notify(&NotifyEvent::CycleStarted {
                run_id,
                started_at,
                items: items.len(),
            });
            match self.cycle_inner(run_id, started_at, watchlist, &items).await {
                Ok(summary) => {
                    info!(
                        processed = summary.items_processed,
                        skipped = summary.items_skipped,
                        new_items = summary.new_items,
                        synced = summary.records_synced,
                        backlog = summary.sync_backlog,
                        timed_out = summary.timed_out,
                        "ingest cycle completed"
                    );
                    self.collaborators.notifier.notify(&NotifyEvent::CycleCompleted {
                        stats: summary.clone(),
                    });
                    Ok(summary)
                }
                Err(err) => {
                    error!(error = %err, "ingest cycle failed");
                    self.collaborators.notifier.notify(&NotifyEvent::CycleFailed {
                        run_id,
                        error: err.to_string(),
                    });
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn cycle_inner(
        &mut self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        watchlist: &Watchlist,
        items: &[ItemId],
    ) -> Result<CycleSummary, CycleError> {
        let deadline = Instant::now() + self.config.cycle_timeout;
        let disabled_before: BTreeSet<String> = self.pool.disabled_names().into_iter().collect();

        if let Some(report) = self
            .pool
            .health_check_if_due(self.collaborators.probe.clone())
            .await?
        {
            debug!(checked = report.checked, disabled = report.disabled.len(), "pre-cycle health check done");
        }

        let known = self.store.known_item_ids().await;
        let mut tally = CycleTally::default();
        let mut timed_out = false;

        for item_id in items {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            let scope = if known.contains(item_id) {
                FetchScope::MetricsOnly
            } else {
                FetchScope::Full
            };
            match self.ingest_item(item_id, scope, watchlist, deadline, &mut tally).await? {
                ItemOutcome::Stored => tally.processed += 1,
                ItemOutcome::Skipped => {}
                ItemOutcome::DeadlineReached => {
                    timed_out = true;
                    break;
                }
            }
        }
        if timed_out {
            warn!(processed = tally.processed, total = items.len(), "cycle deadline reached; remaining items skipped");
        }

        let mut flush = FlushReport::default();
        if !timed_out {
            let settings = *self.sync.settings();
            match self
                .sync
                .drain(
                    &self.store,
                    self.collaborators.transport.clone(),
                    settings.batch_size,
                    settings.max_concurrent_batches,
                    Some(deadline),
                )
                .await
            {
                Ok(report) => flush = report,
                Err(err) => warn!(error = %err, "sync flush failed; records stay queued locally"),
            }
        }

        let credentials_disabled: Vec<String> = self
            .pool
            .disabled_names()
            .into_iter()
            .filter(|name| !disabled_before.contains(name))
            .collect();

        Ok(CycleSummary {
            run_id,
            started_at,
            finished_at: self.clock.now(),
            items_requested: items.len(),
            items_processed: tally.processed,
            items_skipped: items.len() - tally.processed,
            new_items: tally.new_items,
            snapshots_written: tally.snapshots_written,
            growth_computed: tally.growth_computed,
            growth_insufficient: tally.growth_insufficient,
            records_synced: flush.synced,
            records_failed: flush.failed,
            sync_backlog: self.sync.backlog(),
            credentials_disabled,
            timed_out: timed_out || flush.timed_out,
        })
    }

    async fn ingest_item(
        &mut self,
        item_id: &ItemId,
        scope: FetchScope,
        watchlist: &Watchlist,
        deadline: Instant,
        tally: &mut CycleTally,
    ) -> Result<ItemOutcome, CycleError> {
        let bundle = match self.fetch_with_failover(item_id, scope, deadline).await? {
            FetchAttempt::Fetched(bundle) => bundle,
            FetchAttempt::Skipped => return Ok(ItemOutcome::Skipped),
            FetchAttempt::DeadlineReached => return Ok(ItemOutcome::DeadlineReached),
        };

        let upsert = match self.store.upsert_master(item_id, bundle.attrs).await {
            Ok(upsert) => upsert,
            Err(err) => {
                warn!(%item_id, error = %err, "could not store master record; item skipped");
                return Ok(ItemOutcome::Skipped);
            }
        };
        let master_ref = RecordRef::master(item_id.clone());
        if upsert.created {
            tally.new_items += 1;
            self.queue(master_ref, false).await;
        } else if !upsert.backfilled.is_empty() {
            self.queue(master_ref, true).await;
        }

        let snapshot = match self
            .store
            .append_snapshot(&upsert.handle, watchlist.time_point.as_str(), bundle.metrics, watchlist.source_task.as_str())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%item_id, error = %err, "could not store snapshot; item skipped");
                return Ok(ItemOutcome::Skipped);
            }
        };
        tally.snapshots_written += 1;
        self.queue(snapshot.record_ref(), false).await;

        match self.analyzer.compute_growth(item_id).await {
            Ok(Growth::Computed(metric)) => {
                tally.growth_computed += 1;
                if let Err(err) = self.store.record_growth(&metric).await {
                    warn!(%item_id, error = %err, "growth cache not updated");
                }
            }
            Ok(Growth::Insufficient { reason, .. }) => {
                tally.growth_insufficient += 1;
                debug!(%item_id, reason = reason.as_str(), "growth not computed yet");
            }
            Err(err) => warn!(%item_id, error = %err, "growth computation rejected"),
        }
        Ok(ItemOutcome::Stored)
    }

    /// Auth failures move on to a credential not yet tried for this item, up to
    /// `max_credential_switches` times.
    async fn fetch_with_failover(
        &mut self,
        item_id: &ItemId,
        scope: FetchScope,
        deadline: Instant,
    ) -> Result<FetchAttempt, CycleError> {
        let max_attempts = self.config.max_credential_switches + 1;
        let mut tried = BTreeSet::new();
        for attempt in 1..=max_attempts {
            let Some(credential) = self.pool.select_excluding(&tried).await? else {
                warn!(%item_id, tried = tried.len(), "every enabled credential rejected the item; item skipped");
                return Ok(FetchAttempt::Skipped);
            };
            let fetched = tokio::time::timeout_at(deadline, self.collaborators.fetcher.fetch(item_id, &credential, scope)).await;
            match fetched {
                Err(_) => return Ok(FetchAttempt::DeadlineReached),
                Ok(Ok(bundle)) => {
                    self.pool.report_success(&credential.name).await?;
                    return Ok(FetchAttempt::Fetched(bundle));
                }
                Ok(Err(err @ FetchError::Auth(_))) => {
                    warn!(%item_id, credential = %credential.name, attempt, error = %err, "credential rejected; switching");
                    self.pool.report_failure(&credential.name).await?;
                    tried.insert(credential.name);
                }
                Ok(Err(err)) => {
                    warn!(%item_id, credential = %credential.name, retryable = err.is_retryable(), error = %err, "fetch failed; item skipped");
                    return Ok(FetchAttempt::Skipped);
                }
            }
        }
        warn!(%item_id, attempts = max_attempts, "no credential accepted for item; item skipped");
        Ok(FetchAttempt::Skipped)
    }

    async fn queue(&mut self, record: RecordRef, dirty: bool) {
        let queued = if dirty {
            self.sync.mark_dirty(record.clone()).await
        } else {
            self.sync.enqueue(record.clone()).await
        };
        if let Err(err) = queued {
            warn!(%record, error = %err, "sync ledger not updated");
        }
    }

    /// Wait briefly for outstanding notifications, then release the data directory lease.
    pub async fn close(mut self) -> Result<(), CycleError> {
        let grace = Duration::from_secs(self.config.http_timeout_secs.max(1));
        self.collaborators.notifier.drain(grace).await;
        if let Some(lease) = self.lease.take() {
            lease.release().await?;
        }
        Ok(())
    }
}

/// Open a pipeline on the system clock with the files and collaborators `config` names.
pub async fn open_pipeline(config: PipelineConfig) -> Result<IngestionPipeline> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pool_file = load_pool_file(&config.credentials_file).await?;
    let collaborators = Collaborators::from_config(&config, clock.clone())?;
    IngestionPipeline::open(config, pool_file, clock, collaborators)
        .await
        .context("opening ingestion pipeline")
}

/// Run one cycle over the configured watchlist and release the data directory.
pub async fn run_cycle_with_config(config: PipelineConfig) -> Result<CycleSummary> {
    let watchlist = load_watchlist(&config.watchlist_file).await?;
    let mut pipeline = open_pipeline(config).await?;
    let outcome = pipeline.run_cycle(&watchlist).await;
    pipeline.close().await.context("releasing data directory lease")?;
    Ok(outcome?)
}

pub async fn run_cycle_once_from_env() -> Result<CycleSummary> {
    run_cycle_with_config(PipelineConfig::from_env()).await
}

/// Cron-driven cycles. `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(config: &PipelineConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = config.clone();
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            match run_cycle_with_config(config).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    processed = summary.items_processed,
                    backlog = summary.sync_backlog,
                    "scheduled cycle finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
