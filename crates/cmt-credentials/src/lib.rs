//! Credential pool for CMT: picks a working credential per fetch, counts failures,
//! auto-disables credentials that keep failing and probes them back to health.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmt_core::{Clock, CredentialRecord, HealthStatus, SelectionMode};
use cmt_storage::{StateFile, StoreError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "cmt-credentials";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("credential pool exhausted: none of {total} credentials is enabled")]
    Exhausted { total: usize },
    #[error("unknown credential '{0}'")]
    UnknownCredential(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe request failed: {0}")]
    Request(String),
    #[error("unexpected probe response: {0}")]
    Response(String),
}

/// Checks whether an endpoint accepts a credential secret as a live session.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &str, secret: &str) -> Result<bool, ProbeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckScope {
    #[default]
    All,
    EnabledOnly,
    DisabledOnly,
}

impl HealthCheckScope {
    fn includes(&self, record: &CredentialRecord) -> bool {
        match self {
            Self::All => true,
            Self::EnabledOnly => record.enabled,
            Self::DisabledOnly => !record.enabled,
        }
    }
}

fn default_priority() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_failures() -> u32 {
    3
}

/// One credential as declared in the pool definition file.
#[derive(Clone, Deserialize)]
pub struct CredentialSpec {
    pub name: String,
    pub secret: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl fmt::Debug for CredentialSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSpec")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("max_failures", &self.max_failures)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub selection_mode: SelectionMode,
    pub auto_disable_failed: bool,
    pub auto_reenable_on_health_success: bool,
    pub health_check_scope: HealthCheckScope,
    pub check_interval_hours: u64,
    pub health_check_endpoints: Vec<String>,
    pub probe_concurrency: usize,
    pub probe_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            selection_mode: SelectionMode::Random,
            auto_disable_failed: true,
            auto_reenable_on_health_success: true,
            health_check_scope: HealthCheckScope::All,
            check_interval_hours: 6,
            health_check_endpoints: Vec::new(),
            probe_concurrency: 4,
            probe_timeout_secs: 10,
        }
    }
}

/// Pool definition file: settings plus the credential list.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolFile {
    #[serde(flatten)]
    pub config: PoolConfig,
    #[serde(default)]
    pub credentials: Vec<CredentialSpec>,
}

/// Picks one of the enabled credentials. `candidates` is never empty and keeps pool order.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    fn mode(&self) -> SelectionMode;
    fn pick(&mut self, candidates: &[&CredentialRecord]) -> usize;
}

#[derive(Debug)]
pub struct RandomSelection {
    rng: StdRng,
}

impl RandomSelection {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSelection {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RandomSelection {
    fn mode(&self) -> SelectionMode {
        SelectionMode::Random
    }

    fn pick(&mut self, candidates: &[&CredentialRecord]) -> usize {
        self.rng.gen_range(0..candidates.len())
    }
}

/// Least-recently-used first; never-used credentials go before used ones.
#[derive(Debug, Default)]
pub struct RoundRobinSelection;

impl SelectionStrategy for RoundRobinSelection {
    fn mode(&self) -> SelectionMode {
        SelectionMode::RoundRobin
    }

    fn pick(&mut self, candidates: &[&CredentialRecord]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, record)| record.last_used_at)
            .map(|(index, _)| index)
            .unwrap_or(0)
    }
}

/// Lowest `priority` value wins, then least recently used.
#[derive(Debug, Default)]
pub struct PrioritySelection;

impl SelectionStrategy for PrioritySelection {
    fn mode(&self) -> SelectionMode {
        SelectionMode::Priority
    }

    fn pick(&mut self, candidates: &[&CredentialRecord]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, record)| (record.priority, record.last_used_at))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }
}

pub fn strategy_for(mode: SelectionMode) -> Box<dyn SelectionStrategy> {
    match mode {
        SelectionMode::Random => Box::new(RandomSelection::new()),
        SelectionMode::RoundRobin => Box::new(RoundRobinSelection),
        SelectionMode::Priority => Box::new(PrioritySelection),
    }
}

/// Persisted pool state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolState {
    pub records: Vec<CredentialRecord>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
    pub reenabled: Vec<String>,
    pub disabled: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub failure_count: u32,
    pub max_failures: u32,
    pub health: HealthStatus,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub selection_mode: SelectionMode,
    pub total: usize,
    pub available: usize,
    pub disabled: usize,
    pub healthy: usize,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub credentials: Vec<CredentialStatus>,
}

/// Owns the credentials and persists every mutation before returning.
#[derive(Debug)]
pub struct CredentialPool {
    records: Vec<CredentialRecord>,
    config: PoolConfig,
    strategy: Box<dyn SelectionStrategy>,
    state: StateFile<PoolState>,
    clock: Arc<dyn Clock>,
    last_health_check_at: Option<DateTime<Utc>>,
}

impl CredentialPool {
    /// Load persisted state and merge it with the configured credentials.
    pub async fn open(
        config: PoolConfig,
        specs: Vec<CredentialSpec>,
        state: StateFile<PoolState>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError> {
        let persisted = state.load().await?.unwrap_or_default();
        let records = reconcile(&specs, persisted.records);
        let strategy = strategy_for(config.selection_mode);
        let pool = Self {
            records,
            config,
            strategy,
            state,
            clock,
            last_health_check_at: persisted.last_health_check_at,
        };
        pool.persist().await?;
        info!(
            mode = ?pool.config.selection_mode,
            total = pool.records.len(),
            enabled = pool.records.iter().filter(|r| r.enabled).count(),
            "credential pool ready"
        );
        Ok(pool)
    }

    /// Swap the selection strategy, e.g. for a seeded random one.
    pub fn with_strategy(mut self, strategy: Box<dyn SelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn records(&self) -> &[CredentialRecord] {
        &self.records
    }

    pub fn disabled_names(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| !r.enabled)
            .map(|r| r.name.clone())
            .collect()
    }

    async fn persist(&self) -> Result<(), PoolError> {
        self.state
            .save(&PoolState {
                records: self.records.clone(),
                last_health_check_at: self.last_health_check_at,
            })
            .await?;
        Ok(())
    }

    fn index_of(&self, name: &str) -> Result<usize, PoolError> {
        self.records
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| PoolError::UnknownCredential(name.to_string()))
    }

    /// Usage stamps are strictly increasing so least-recently-used stays a total order
    /// even when the clock does not move between two uses.
    fn next_use_stamp(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        match self.records.iter().filter_map(|r| r.last_used_at).max() {
            Some(latest) if latest >= now => latest + chrono::Duration::microseconds(1),
            _ => now,
        }
    }

    /// Return an enabled credential chosen by the configured strategy.
    pub async fn select(&mut self) -> Result<CredentialRecord, PoolError> {
        self.select_excluding(&BTreeSet::new())
            .await?
            .ok_or(PoolError::Exhausted {
                total: self.records.len(),
            })
    }

    /// Like [`select`](Self::select) but never returns a credential named in `tried`.
    ///
    /// `Ok(None)` means enabled credentials remain but all of them were already tried.
    pub async fn select_excluding(
        &mut self,
        tried: &BTreeSet<String>,
    ) -> Result<Option<CredentialRecord>, PoolError> {
        let enabled: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.enabled)
            .map(|(index, _)| index)
            .collect();
        if enabled.is_empty() {
            warn!(total = self.records.len(), "no enabled credential left");
            return Err(PoolError::Exhausted {
                total: self.records.len(),
            });
        }
        let candidates: Vec<usize> = enabled
            .into_iter()
            .filter(|&index| !tried.contains(&self.records[index].name))
            .collect();
        if candidates.is_empty() {
            debug!(tried = tried.len(), "every enabled credential was already tried");
            return Ok(None);
        }

        let refs: Vec<&CredentialRecord> = candidates.iter().map(|&i| &self.records[i]).collect();
        let picked = self.strategy.pick(&refs).min(candidates.len() - 1);
        let index = candidates[picked];

        let stamp = self.next_use_stamp();
        let record = &mut self.records[index];
        record.last_used_at = Some(stamp);
        let selected = record.clone();
        self.persist().await?;
        debug!(credential = %selected.name, mode = ?self.strategy.mode(), "credential selected");
        Ok(Some(selected))
    }

    pub async fn report_success(&mut self, name: &str) -> Result<(), PoolError> {
        let index = self.index_of(name)?;
        let stamp = self.next_use_stamp();
        let record = &mut self.records[index];
        record.failure_count = 0;
        record.last_used_at = Some(stamp);
        record.health = HealthStatus::Healthy;
        self.persist().await
    }

    /// Count a failure. Returns true when this call disabled the credential.
    pub async fn report_failure(&mut self, name: &str) -> Result<bool, PoolError> {
        let index = self.index_of(name)?;
        let stamp = self.next_use_stamp();
        self.records[index].last_used_at = Some(stamp);
        let disabled = self.apply_failure(index);
        self.persist().await?;
        Ok(disabled)
    }

    fn apply_failure(&mut self, index: usize) -> bool {
        let auto_disable = self.config.auto_disable_failed;
        let record = &mut self.records[index];
        record.failure_count = record.failure_count.saturating_add(1);
        record.health = HealthStatus::Unhealthy;
        warn!(
            credential = %record.name,
            failures = record.failure_count,
            max_failures = record.max_failures,
            "credential failure recorded"
        );
        if auto_disable && record.enabled && record.failure_count >= record.max_failures {
            record.enabled = false;
            error!(credential = %record.name, "credential auto-disabled after repeated failures");
            return true;
        }
        false
    }

    /// Operator reset: re-enable and clear the failure count.
    pub async fn reset(&mut self, name: &str) -> Result<(), PoolError> {
        let index = self.index_of(name)?;
        let record = &mut self.records[index];
        record.enabled = true;
        record.failure_count = 0;
        record.health = HealthStatus::Unknown;
        info!(credential = %record.name, "credential reset");
        self.persist().await
    }

    pub fn health_check_due(&self) -> bool {
        let Some(last) = self.last_health_check_at else {
            return true;
        };
        match i64::try_from(self.config.check_interval_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
        {
            Some(interval) => self.clock.now() - last >= interval,
            None => false,
        }
    }

    pub async fn health_check_if_due(
        &mut self,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Option<HealthReport>, PoolError> {
        if !self.health_check_due() {
            debug!(
                interval_hours = self.config.check_interval_hours,
                "skipping credential health check, last round is recent"
            );
            return Ok(None);
        }
        self.health_check(probe).await.map(Some)
    }

    /// Probe every in-scope credential against the configured endpoints.
    ///
    /// A credential passes when any endpoint accepts it. Passing may re-enable a disabled
    /// credential; failing counts exactly like [`CredentialPool::report_failure`].
    pub async fn health_check(&mut self, probe: Arc<dyn HealthProbe>) -> Result<HealthReport, PoolError> {
        if self.config.health_check_endpoints.is_empty() {
            info!("no health check endpoints configured; skipping probe round");
            return Ok(HealthReport::default());
        }

        let scope = self.config.health_check_scope;
        let targets: Vec<(usize, String, String)> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| scope.includes(record))
            .map(|(index, record)| (index, record.name.clone(), record.secret.clone()))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.probe_concurrency.max(1)));
        let endpoints: Arc<[String]> = self.config.health_check_endpoints.clone().into();
        let timeout = Duration::from_secs(self.config.probe_timeout_secs.max(1));

        let mut tasks = JoinSet::new();
        for (index, name, secret) in targets {
            let probe = probe.clone();
            let semaphore = semaphore.clone();
            let endpoints = endpoints.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let healthy = probe_any(probe.as_ref(), &endpoints, &name, &secret, timeout).await;
                (index, healthy)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "health probe task did not complete"),
            }
        }
        results.sort_by_key(|(index, _)| *index);

        let now = self.clock.now();
        let reenable = self.config.auto_reenable_on_health_success;
        let mut report = HealthReport {
            checked: results.len(),
            ..Default::default()
        };
        for (index, healthy) in results {
            if healthy {
                let record = &mut self.records[index];
                record.health = HealthStatus::Healthy;
                record.last_health_check_at = Some(now);
                record.failure_count = 0;
                if !record.enabled && reenable {
                    record.enabled = true;
                    info!(credential = %record.name, "credential re-enabled by health check");
                    report.reenabled.push(record.name.clone());
                }
                report.healthy.push(record.name.clone());
            } else {
                self.records[index].last_health_check_at = Some(now);
                if self.apply_failure(index) {
                    report.disabled.push(self.records[index].name.clone());
                }
                report.unhealthy.push(self.records[index].name.clone());
            }
        }

        self.last_health_check_at = Some(now);
        self.persist().await?;
        info!(
            checked = report.checked,
            healthy = report.healthy.len(),
            reenabled = report.reenabled.len(),
            disabled = report.disabled.len(),
            "credential health check complete"
        );
        Ok(report)
    }

    pub fn status_summary(&self) -> PoolStatus {
        PoolStatus {
            selection_mode: self.config.selection_mode,
            total: self.records.len(),
            available: self.records.iter().filter(|r| r.enabled).count(),
            disabled: self.records.iter().filter(|r| !r.enabled).count(),
            healthy: self
                .records
                .iter()
                .filter(|r| r.health == HealthStatus::Healthy)
                .count(),
            last_health_check_at: self.last_health_check_at,
            credentials: self
                .records
                .iter()
                .map(|r| CredentialStatus {
                    name: r.name.clone(),
                    priority: r.priority,
                    enabled: r.enabled,
                    failure_count: r.failure_count,
                    max_failures: r.max_failures,
                    health: r.health,
                    last_used_at: r.last_used_at,
                    last_health_check_at: r.last_health_check_at,
                })
                .collect(),
        }
    }
}

async fn probe_any(
    probe: &dyn HealthProbe,
    endpoints: &[String],
    name: &str,
    secret: &str,
    timeout: Duration,
) -> bool {
    for endpoint in endpoints {
        match tokio::time::timeout(timeout, probe.probe(endpoint, secret)).await {
            Ok(Ok(true)) => return true,
            Ok(Ok(false)) => debug!(credential = name, %endpoint, "endpoint rejected credential"),
            Ok(Err(err)) => warn!(credential = name, %endpoint, error = %err, "health probe failed"),
            Err(_) => warn!(credential = name, %endpoint, "health probe timed out"),
        }
    }
    false
}

/// Merge configured credentials with persisted runtime state, matched by name.
///
/// Config owns secret, priority and max_failures; persisted state owns enabled,
/// failure_count, last_used_at and health. A rotated secret starts fresh. Persisted
/// credentials missing from the config are kept, disabled.
fn reconcile(specs: &[CredentialSpec], persisted: Vec<CredentialRecord>) -> Vec<CredentialRecord> {
    let mut leftovers: Vec<Option<CredentialRecord>> = persisted.into_iter().map(Some).collect();
    let mut records: Vec<CredentialRecord> = Vec::new();

    for spec in specs {
        if !spec.enabled || spec.secret.trim().is_empty() {
            debug!(credential = %spec.name, "credential not loaded (disabled in config or empty)");
            continue;
        }
        if records.iter().any(|r| r.name == spec.name) {
            warn!(credential = %spec.name, "duplicate credential name in config; keeping the first");
            continue;
        }

        let previous = leftovers
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|r| r.name == spec.name))
            .and_then(Option::take);
        let record = match previous {
            Some(mut record) => {
                if record.secret != spec.secret {
                    info!(credential = %spec.name, "credential secret rotated; clearing failure state");
                    record.secret = spec.secret.clone();
                    record.enabled = true;
                    record.failure_count = 0;
                    record.health = HealthStatus::Unknown;
                }
                record.priority = spec.priority;
                record.max_failures = spec.max_failures;
                record
            }
            None => CredentialRecord::new(&spec.name, &spec.secret, spec.priority, spec.max_failures),
        };
        records.push(record);
    }

    for mut retired in leftovers.into_iter().flatten() {
        if retired.enabled {
            info!(credential = %retired.name, "credential no longer configured; keeping it disabled");
            retired.enabled = false;
        }
        records.push(retired);
    }
    records
}
