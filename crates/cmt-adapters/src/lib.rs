//! Collaborator contracts around the ingestion core (fetch, remote sync, health probing,
//! notifications) plus fixture-first and HTTP implementations.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmt_core::{
    Clock, CredentialRecord, FetchScope, ItemId, MasterAttrs, Metrics, NotifyEvent, RawMetricBundle,
    RecordKind, RecordRef,
};
use cmt_credentials::{HealthProbe, ProbeError};
use cmt_storage::item_file_stem;
use reqwest::{header, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "cmt-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    /// Auth failures count against the credential that was used.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Fetches the current metric bundle for one item with one credential.
#[async_trait]
pub trait ItemFetcher: Send + Sync {
    async fn fetch(
        &self,
        item_id: &ItemId,
        credential: &CredentialRecord,
        scope: FetchScope,
    ) -> Result<RawMetricBundle, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFailure {
    Transient,
    Permanent,
}

/// Captured fetch result for one item, replayed by [`FixtureFetcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub item_id: ItemId,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attrs: MasterAttrs,
    #[serde(default)]
    pub metrics: Metrics,
    /// Credential names the captured endpoint refused.
    #[serde(default)]
    pub rejected_credentials: Vec<String>,
    #[serde(default)]
    pub failure: Option<FixtureFailure>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replays `<root>/<item>.json` fixture bundles in place of live fetching.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FixtureFetcher {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn bundle_path_for(&self, item_id: &ItemId) -> PathBuf {
        self.root.join(format!("{}.json", item_file_stem(item_id)))
    }
}

#[async_trait]
impl ItemFetcher for FixtureFetcher {
    async fn fetch(
        &self,
        item_id: &ItemId,
        credential: &CredentialRecord,
        scope: FetchScope,
    ) -> Result<RawMetricBundle, FetchError> {
        let path = self.bundle_path_for(item_id);
        if !path.exists() {
            return Err(FetchError::Permanent(format!(
                "no fixture for {item_id} at {}",
                path.display()
            )));
        }
        let bundle = load_fixture_bundle(&path).map_err(|err| FetchError::Permanent(format!("{err:#}")))?;

        if bundle.rejected_credentials.iter().any(|name| name == &credential.name) {
            return Err(FetchError::Auth(format!(
                "credential '{}' rejected for {item_id}",
                credential.name
            )));
        }
        match bundle.failure {
            Some(FixtureFailure::Transient) => {
                return Err(FetchError::Transient(format!("captured transient failure for {item_id}")))
            }
            Some(FixtureFailure::Permanent) => {
                return Err(FetchError::Permanent(format!("captured permanent failure for {item_id}")))
            }
            None => {}
        }

        let attrs = match scope {
            FetchScope::Full => bundle.attrs,
            FetchScope::MetricsOnly => MasterAttrs::default(),
        };
        Ok(RawMetricBundle {
            item_id: item_id.clone(),
            fetched_at: bundle.fetched_at.unwrap_or_else(|| self.clock.now()),
            attrs,
            metrics: bundle.metrics,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

/// One record handed to the remote sync target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub record: RecordRef,
    pub kind: RecordKind,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Ok,
    TransientError(String),
    PermanentError(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("sync target unavailable: {0}")]
    Unavailable(String),
    #[error("sync target rejected the batch: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Remote tabular store. Returns one outcome per record, in batch order.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn deliver(&self, batch: &[DeliveryRecord]) -> Result<Vec<DeliveryOutcome>, TransportError>;
}

#[derive(Debug, Serialize)]
struct DeliveryRequest<'a> {
    records: &'a [DeliveryRecord],
}

#[derive(Debug, Deserialize)]
struct DeliveryResponse {
    results: Vec<DeliveryOutcome>,
}

/// Posts batches as JSON to a remote ingest endpoint.
#[derive(Debug, Clone)]
pub struct HttpSyncTransport {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpSyncTransport {
    pub fn new(config: &HttpClientConfig, endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn deliver(&self, batch: &[DeliveryRecord]) -> Result<Vec<DeliveryOutcome>, TransportError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&DeliveryRequest { records: batch });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| match classify_reqwest_error(&err) {
            RetryDisposition::Retryable => TransportError::Unavailable(err.to_string()),
            RetryDisposition::NonRetryable => TransportError::Rejected(err.to_string()),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("http status {} from {}", status.as_u16(), self.endpoint);
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => TransportError::Unavailable(message),
                RetryDisposition::NonRetryable => TransportError::Rejected(message),
            });
        }

        let parsed: DeliveryResponse = response
            .json()
            .await
            .map_err(|err| TransportError::Unavailable(format!("unreadable delivery response: {err}")))?;
        debug!(records = batch.len(), outcomes = parsed.results.len(), "batch delivered over http");
        Ok(parsed.results)
    }
}

/// Appends every batch to a local JSON-lines outbox and reports success.
#[derive(Debug)]
pub struct SpoolTransport {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SpoolTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, batch: &[DeliveryRecord]) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut lines = Vec::new();
        for record in batch {
            serde_json::to_writer(&mut lines, record)?;
            lines.push(b'\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&lines).await?;
        file.sync_data().await
    }
}

#[async_trait]
impl SyncTransport for SpoolTransport {
    async fn deliver(&self, batch: &[DeliveryRecord]) -> Result<Vec<DeliveryOutcome>, TransportError> {
        self.append(batch)
            .await
            .map_err(|err| TransportError::Unavailable(format!("spooling to {}: {err}", self.path.display())))?;
        Ok(vec![DeliveryOutcome::Ok; batch.len()])
    }
}

/// True when a session endpoint body reports a logged-in session (`code == 0`, `data.isLogin`).
pub fn session_is_logged_in(body: &JsonValue) -> bool {
    let code_ok = body.get("code").and_then(JsonValue::as_i64) == Some(0);
    let logged_in = body
        .get("data")
        .and_then(|data| data.get("isLogin"))
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    code_ok && logged_in
}

/// Probes a session endpoint with the credential secret sent as the `Cookie` header.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &str, secret: &str) -> Result<bool, ProbeError> {
        let response = self
            .client
            .get(endpoint)
            .header(header::COOKIE, secret)
            .send()
            .await
            .map_err(|err| ProbeError::Request(err.to_string()))?;

        if response.status() != StatusCode::OK {
            debug!(endpoint, status = response.status().as_u16(), "probe endpoint returned non-200");
            return Ok(false);
        }
        let body: JsonValue = response
            .json()
            .await
            .map_err(|err| ProbeError::Response(err.to_string()))?;
        Ok(session_is_logged_in(&body))
    }
}

/// Fire-and-forget sink for cycle events. Must never block or fail the pipeline.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotifyEvent);

    /// Wait up to `timeout` for notifications still in flight.
    async fn drain(&self, _timeout: Duration) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: &NotifyEvent) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &NotifyEvent) {
        match event {
            NotifyEvent::CycleStarted { run_id, items, .. } => {
                info!(%run_id, items, "cycle started")
            }
            NotifyEvent::CycleCompleted { stats } => info!(
                run_id = %stats.run_id,
                processed = stats.items_processed,
                skipped = stats.items_skipped,
                backlog = stats.sync_backlog,
                disabled = ?stats.credentials_disabled,
                "cycle completed"
            ),
            NotifyEvent::CycleFailed { run_id, error } => {
                warn!(%run_id, %error, "cycle failed")
            }
        }
    }
}

/// Posts each event as JSON to a webhook on a background task.
///
/// Deliveries are tracked so [`Notifier::drain`] can wait for them before the runtime stops.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    in_flight: Arc<StdMutex<JoinSet<()>>>,
}

impl WebhookNotifier {
    pub fn new(config: &HttpClientConfig, url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            url: url.into(),
            in_flight: Arc::new(StdMutex::new(JoinSet::new())),
        })
    }

    /// Deliveries spawned and not yet reaped.
    pub fn pending(&self) -> usize {
        self.in_flight.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn notify(&self, event: &NotifyEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(event = event.name(), "no async runtime; webhook notification dropped");
            return;
        };
        let Ok(mut tasks) = self.in_flight.lock() else {
            warn!(event = event.name(), "webhook task set poisoned; notification dropped");
            return;
        };
        while tasks.try_join_next().is_some() {}

        let client = self.client.clone();
        let url = self.url.clone();
        let name = event.name();
        let body = event.clone();
        tasks.spawn_on(
            async move {
                match client.post(&url).json(&body).send().await {
                    Ok(resp) if resp.status().is_success() => debug!(event = name, "webhook notified"),
                    Ok(resp) => warn!(event = name, status = resp.status().as_u16(), "webhook rejected notification"),
                    Err(err) => warn!(event = name, error = %err, "webhook notification failed"),
                }
            },
            &runtime,
        );
    }

    async fn drain(&self, timeout: Duration) {
        let mut tasks = match self.in_flight.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        if tasks.is_empty() {
            return;
        }
        let waiting = tasks.len();
        let finished = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        match finished {
            Ok(()) => debug!(waiting, "webhook notifications drained"),
            Err(_) => {
                warn!(abandoned = tasks.len(), ?timeout, "webhook notifications still pending at shutdown; abandoning");
                tasks.abort_all();
            }
        }
    }
}
