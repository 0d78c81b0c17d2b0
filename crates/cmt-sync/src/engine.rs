//! Offline-first delivery of stored records to the remote sync target.
//!
//! Every master and snapshot written locally gets a ledger entry. `flush` moves entries
//! through Pending -> InFlight -> Synced, or back to Pending with backoff, or to Failed
//! once retries run out. The local record itself is never touched.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cmt_adapters::{DeliveryOutcome, DeliveryRecord, SyncTransport};
use cmt_core::{Clock, ItemId, RecordKind, RecordRef, SyncState, SyncStatus};
use cmt_storage::{AppendLog, BackoffPolicy, RecordStore, StoreError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const LEDGER_FILE: &str = "sync_ledger.jsonl";

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    /// Upper bound for one `deliver` call.
    pub batch_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrent_batches: 2,
            batch_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub batches: usize,
    pub submitted: usize,
    pub synced: usize,
    pub retried: usize,
    pub failed: usize,
    /// Reverted to Pending without using an attempt (deadline hit or task lost).
    pub abandoned: usize,
    pub backlog: usize,
    pub timed_out: bool,
    /// Status each record ended up in, in the order outcomes were applied.
    pub applied: Vec<(RecordRef, SyncStatus)>,
}

impl FlushReport {
    /// Fold a later round into this one. `backlog` is taken from the later round.
    fn absorb(&mut self, round: FlushReport) {
        self.batches += round.batches;
        self.submitted += round.submitted;
        self.synced += round.synced;
        self.retried += round.retried;
        self.failed += round.failed;
        self.abandoned += round.abandoned;
        self.backlog = round.backlog;
        self.timed_out |= round.timed_out;
        self.applied.extend(round.applied);
    }

    fn made_progress(&self) -> bool {
        self.synced + self.retried + self.failed > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct SyncEngine {
    ledger: BTreeMap<RecordRef, SyncState>,
    journal: AppendLog<SyncState>,
    /// Lines currently in the journal, superseded ones included.
    journal_len: usize,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    rng: StdRng,
}

impl SyncEngine {
    /// Replay the ledger journal. Entries left InFlight by an interrupted run go back to
    /// Pending, and the journal is compacted to one line per record.
    pub async fn open(
        journal: AppendLog<SyncState>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Result<Self, StoreError> {
        let entries = journal.load().await?;
        let journal_len = entries.len();
        let mut ledger = BTreeMap::new();
        for entry in entries {
            ledger.insert(entry.record.clone(), entry);
        }

        let now = clock.now();
        let mut recovered = 0usize;
        for entry in ledger.values_mut() {
            if entry.status == SyncStatus::InFlight {
                entry.status = SyncStatus::Pending;
                entry.updated_at = now;
                recovered += 1;
            }
        }

        let mut engine = Self {
            ledger,
            journal,
            journal_len,
            clock,
            settings,
            rng: StdRng::from_entropy(),
        };
        if recovered > 0 {
            warn!(recovered, "reverted in-flight sync records left by an interrupted run");
        }
        if recovered > 0 || engine.journal_len > engine.ledger.len() {
            engine.compact().await?;
        }
        info!(records = engine.ledger.len(), backlog = engine.backlog(), "sync ledger opened");
        Ok(engine)
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Journal the current state of `changed`, compacting once superseded lines dominate.
    async fn persist(&mut self, changed: &[RecordRef]) -> Result<(), StoreError> {
        let entries: Vec<SyncState> = changed
            .iter()
            .filter_map(|record| self.ledger.get(record))
            .cloned()
            .collect();
        self.journal.append(&entries).await?;
        self.journal_len += entries.len();
        if self.journal_len > 2 * self.ledger.len() + 256 {
            self.compact().await?;
        }
        Ok(())
    }

    async fn compact(&mut self) -> Result<(), StoreError> {
        let entries: Vec<SyncState> = self.ledger.values().cloned().collect();
        self.journal.rewrite(&entries).await?;
        debug!(superseded = self.journal_len.saturating_sub(entries.len()), "sync ledger compacted");
        self.journal_len = entries.len();
        Ok(())
    }

    /// Queue a record. Pending, InFlight and Synced records are left alone; a Failed
    /// record starts over with zero attempts.
    pub async fn enqueue(&mut self, record: RecordRef) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let changed = match self.ledger.entry(record.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(SyncState::pending(record.clone(), now));
                true
            }
            Entry::Occupied(mut slot) if slot.get().status == SyncStatus::Failed => {
                requeue(slot.get_mut(), now);
                true
            }
            Entry::Occupied(_) => false,
        };
        if changed {
            debug!(%record, "record queued for sync");
            self.persist(std::slice::from_ref(&record)).await?;
        }
        Ok(changed)
    }

    /// Queue a record whose local content changed, even if it was already Synced.
    pub async fn mark_dirty(&mut self, record: RecordRef) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let changed = match self.ledger.entry(record.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(SyncState::pending(record.clone(), now));
                true
            }
            Entry::Occupied(mut slot)
                if matches!(slot.get().status, SyncStatus::Synced | SyncStatus::Failed) =>
            {
                requeue(slot.get_mut(), now);
                true
            }
            Entry::Occupied(_) => false,
        };
        if changed {
            debug!(%record, "record re-queued after local change");
            self.persist(std::slice::from_ref(&record)).await?;
        }
        Ok(changed)
    }

    /// Move every Failed record back to Pending. Returns how many moved.
    pub async fn retry_failed(&mut self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut moved = Vec::new();
        for entry in self.ledger.values_mut() {
            if entry.status == SyncStatus::Failed {
                requeue(entry, now);
                moved.push(entry.record.clone());
            }
        }
        if !moved.is_empty() {
            info!(moved = moved.len(), "failed sync records re-queued");
            self.persist(&moved).await?;
        }
        Ok(moved.len())
    }

    pub fn state_of(&self, record: &RecordRef) -> Option<&SyncState> {
        self.ledger.get(record)
    }

    pub fn states(&self) -> impl Iterator<Item = &SyncState> {
        self.ledger.values()
    }

    pub fn counts(&self) -> LedgerCounts {
        let mut counts = LedgerCounts::default();
        for entry in self.ledger.values() {
            match entry.status {
                SyncStatus::Pending => counts.pending += 1,
                SyncStatus::InFlight => counts.in_flight += 1,
                SyncStatus::Synced => counts.synced += 1,
                SyncStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Records not yet delivered, Failed ones included.
    pub fn backlog(&self) -> usize {
        self.ledger
            .values()
            .filter(|entry| entry.status != SyncStatus::Synced)
            .count()
    }

    /// Deliver up to `batch_size * max_concurrent_batches` ready records.
    ///
    /// Batches run concurrently, each bounded by the batch timeout. When `deadline`
    /// passes first, unfinished batches are abandoned and their records return to
    /// Pending without consuming an attempt.
    pub async fn flush(
        &mut self,
        store: &RecordStore,
        transport: Arc<dyn SyncTransport>,
        batch_size: usize,
        max_concurrent_batches: usize,
        deadline: Option<Instant>,
    ) -> Result<FlushReport, StoreError> {
        let now = self.clock.now();
        let planned = self.plan_batches(now, batch_size.max(1), max_concurrent_batches.max(1));
        let mut report = FlushReport::default();
        if planned.is_empty() {
            report.backlog = self.backlog();
            debug!(backlog = report.backlog, "nothing ready to sync");
            return Ok(report);
        }

        let in_flight: Vec<RecordRef> = planned.iter().flatten().cloned().collect();
        for record in &in_flight {
            if let Some(entry) = self.ledger.get_mut(record) {
                entry.status = SyncStatus::InFlight;
                entry.updated_at = now;
            }
        }
        self.persist(&in_flight).await?;
        report.batches = planned.len();
        report.submitted = planned.iter().map(Vec::len).sum();

        let batch_timeout = self.settings.batch_timeout;
        let mut tasks = JoinSet::new();
        for (index, refs) in planned.into_iter().enumerate() {
            let (deliverable, held) = load_batch(store, refs).await;
            let held_refs: Vec<RecordRef> = held.iter().map(|(record, _)| record.clone()).collect();
            for (record, outcome) in held {
                self.apply(&record, outcome, &mut report);
            }
            self.persist(&held_refs).await?;
            if deliverable.is_empty() {
                continue;
            }
            let transport = transport.clone();
            let span = info_span!("sync_batch", batch = index, records = deliverable.len());
            tasks.spawn(
                async move {
                    let outcomes = deliver_batch(transport.as_ref(), &deliverable, batch_timeout).await;
                    (deliverable, outcomes)
                }
                .instrument(span),
            );
        }

        loop {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(pending_batches = tasks.len(), "cycle deadline reached during sync; abandoning batches");
                        report.timed_out = true;
                        tasks.abort_all();
                        break;
                    }
                },
                None => tasks.join_next().await,
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((records, outcomes)) => {
                    let applied: Vec<RecordRef> = records.iter().map(|r| r.record.clone()).collect();
                    self.apply_batch(records, outcomes, &mut report);
                    self.persist(&applied).await?;
                }
                Err(err) => warn!(error = %err, "sync batch task did not complete"),
            }
        }

        let now = self.clock.now();
        let mut abandoned = Vec::new();
        for record in in_flight {
            if let Some(entry) = self.ledger.get_mut(&record) {
                if entry.status == SyncStatus::InFlight {
                    entry.status = SyncStatus::Pending;
                    entry.updated_at = now;
                    abandoned.push(record);
                }
            }
        }
        report.abandoned = abandoned.len();
        self.persist(&abandoned).await?;

        report.backlog = self.backlog();
        info!(
            batches = report.batches,
            synced = report.synced,
            retried = report.retried,
            failed = report.failed,
            abandoned = report.abandoned,
            backlog = report.backlog,
            "sync flush finished"
        );
        Ok(report)
    }

    /// Run [`flush`](Self::flush) rounds until nothing is ready, the deadline passes, or a
    /// round settles no record.
    pub async fn drain(
        &mut self,
        store: &RecordStore,
        transport: Arc<dyn SyncTransport>,
        batch_size: usize,
        max_concurrent_batches: usize,
        deadline: Option<Instant>,
    ) -> Result<FlushReport, StoreError> {
        let mut total = FlushReport::default();
        let mut rounds = 0usize;
        loop {
            let round = self
                .flush(store, transport.clone(), batch_size, max_concurrent_batches, deadline)
                .await?;
            let settled = round.submitted > 0 && round.made_progress() && !round.timed_out;
            if round.submitted > 0 {
                rounds += 1;
            }
            total.absorb(round);
            if !settled || deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
        }
        if rounds > 1 {
            debug!(rounds, synced = total.synced, backlog = total.backlog, "sync drained over several rounds");
        }
        Ok(total)
    }

    /// Group ready records into batches.
    ///
    /// A snapshot is eligible only when its master is already Synced (or untracked), or
    /// when the master is ready too; then both travel in the same batch. Masters lead
    /// every batch.
    fn plan_batches(&self, now: DateTime<Utc>, batch_size: usize, max_batches: usize) -> Vec<Vec<RecordRef>> {
        let mut groups: BTreeMap<&ItemId, (Option<&RecordRef>, Vec<&RecordRef>)> = BTreeMap::new();
        for entry in self.ledger.values().filter(|entry| entry.is_ready(now)) {
            let group = groups.entry(entry.record.item_id()).or_default();
            match entry.record.kind() {
                RecordKind::Master => group.0 = Some(&entry.record),
                RecordKind::Snapshot => group.1.push(&entry.record),
            }
        }

        let mut units: Vec<Vec<RecordRef>> = Vec::new();
        for (item_id, (master, snapshots)) in groups {
            match master {
                Some(master) => {
                    let mut unit = vec![master.clone()];
                    unit.extend(snapshots.into_iter().cloned());
                    unit.truncate(batch_size);
                    units.push(unit);
                }
                None => {
                    let master_synced = self
                        .ledger
                        .get(&RecordRef::master(item_id.clone()))
                        .map_or(true, |state| state.status == SyncStatus::Synced);
                    if master_synced {
                        units.extend(snapshots.into_iter().map(|s| vec![s.clone()]));
                    } else if !snapshots.is_empty() {
                        debug!(%item_id, held = snapshots.len(), "snapshots held back until their master syncs");
                    }
                }
            }
        }

        let mut batches: Vec<Vec<RecordRef>> = Vec::new();
        let mut current: Vec<RecordRef> = Vec::new();
        for unit in units {
            if current.len() + unit.len() > batch_size {
                if !current.is_empty() {
                    batches.push(std::mem::take(&mut current));
                }
                if batches.len() == max_batches {
                    break;
                }
            }
            current.extend(unit);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        for batch in &mut batches {
            batch.sort_by_key(RecordRef::kind);
        }
        batches
    }

    fn apply_batch(&mut self, records: Vec<DeliveryRecord>, outcomes: Vec<DeliveryOutcome>, report: &mut FlushReport) {
        let failed_masters: BTreeSet<ItemId> = records
            .iter()
            .zip(&outcomes)
            .filter(|(record, outcome)| record.kind == RecordKind::Master && **outcome != DeliveryOutcome::Ok)
            .map(|(record, _)| record.record.item_id().clone())
            .collect();

        let mut pairs: Vec<(RecordRef, DeliveryOutcome)> = records
            .into_iter()
            .zip(outcomes)
            .map(|(record, outcome)| (record.record, outcome))
            .collect();
        pairs.sort_by_key(|(record, _)| record.kind());

        for (record, outcome) in pairs {
            let outcome = match outcome {
                DeliveryOutcome::Ok
                    if record.kind() == RecordKind::Snapshot && failed_masters.contains(record.item_id()) =>
                {
                    DeliveryOutcome::TransientError("parent master record was not synced".into())
                }
                other => other,
            };
            self.apply(&record, outcome, report);
        }
    }

    fn apply(&mut self, record: &RecordRef, outcome: DeliveryOutcome, report: &mut FlushReport) {
        let now = self.clock.now();
        let backoff = self.settings.backoff;
        let Some(entry) = self.ledger.get_mut(record) else {
            return;
        };
        entry.updated_at = now;
        match outcome {
            DeliveryOutcome::Ok => {
                entry.status = SyncStatus::Synced;
                entry.last_error = None;
                report.synced += 1;
            }
            DeliveryOutcome::TransientError(error) => {
                entry.attempts = entry.attempts.saturating_add(1);
                entry.last_error = Some(error);
                if entry.attempts < backoff.max_retries {
                    let delay = backoff.jittered_delay(entry.attempts as usize - 1, &mut self.rng);
                    entry.status = SyncStatus::Pending;
                    entry.next_attempt_at = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    report.retried += 1;
                    debug!(%record, attempts = entry.attempts, next_attempt_at = %entry.next_attempt_at, "sync retry scheduled");
                } else {
                    entry.status = SyncStatus::Failed;
                    report.failed += 1;
                    warn!(%record, attempts = entry.attempts, error = ?entry.last_error, "sync retries exhausted; record kept locally");
                }
            }
            DeliveryOutcome::PermanentError(error) => {
                entry.attempts = entry.attempts.saturating_add(1);
                entry.status = SyncStatus::Failed;
                warn!(%record, %error, "sync target rejected record; kept locally");
                entry.last_error = Some(error);
                report.failed += 1;
            }
        }
        report.applied.push((record.clone(), entry.status));
    }
}

fn requeue(entry: &mut SyncState, now: DateTime<Utc>) {
    entry.status = SyncStatus::Pending;
    entry.attempts = 0;
    entry.next_attempt_at = now;
    entry.last_error = None;
    entry.updated_at = now;
}

/// Read payloads for a planned batch. Records that cannot be read are returned with the
/// outcome they get instead of being delivered; snapshots whose master is unreadable
/// wait for a later flush.
async fn load_batch(
    store: &RecordStore,
    refs: Vec<RecordRef>,
) -> (Vec<DeliveryRecord>, Vec<(RecordRef, DeliveryOutcome)>) {
    let mut deliverable = Vec::with_capacity(refs.len());
    let mut held = Vec::new();
    let mut unreadable_masters = BTreeSet::new();
    for record in refs {
        if record.kind() == RecordKind::Snapshot && unreadable_masters.contains(record.item_id()) {
            held.push((
                record,
                DeliveryOutcome::TransientError("parent master record unavailable".into()),
            ));
            continue;
        }
        match delivery_record(store, &record).await {
            Ok(delivery) => deliverable.push(delivery),
            Err(reason) => {
                warn!(%record, %reason, "local record could not be prepared for sync");
                if record.kind() == RecordKind::Master {
                    unreadable_masters.insert(record.item_id().clone());
                }
                held.push((record, DeliveryOutcome::PermanentError(reason)));
            }
        }
    }
    (deliverable, held)
}

async fn delivery_record(store: &RecordStore, record: &RecordRef) -> Result<DeliveryRecord, String> {
    let payload = match record {
        RecordRef::Master { item_id } => store.master(item_id).await.map(|m| serde_json::to_value(&m)),
        RecordRef::Snapshot {
            item_id,
            collected_at,
        } => store
            .snapshot(item_id, *collected_at)
            .await
            .map(|s| serde_json::to_value(&s)),
    };
    match payload {
        None => Err(format!("local record {record} not found")),
        Some(Err(err)) => Err(format!("encoding {record}: {err}")),
        Some(Ok(payload)) => Ok(DeliveryRecord {
            record: record.clone(),
            kind: record.kind(),
            payload,
        }),
    }
}

async fn deliver_batch(
    transport: &dyn SyncTransport,
    batch: &[DeliveryRecord],
    timeout: Duration,
) -> Vec<DeliveryOutcome> {
    match tokio::time::timeout(timeout, transport.deliver(batch)).await {
        Ok(Ok(outcomes)) if outcomes.len() == batch.len() => outcomes,
        Ok(Ok(outcomes)) => {
            warn!(expected = batch.len(), got = outcomes.len(), "sync target returned a mismatched outcome list");
            vec![DeliveryOutcome::TransientError("mismatched outcome list".into()); batch.len()]
        }
        Ok(Err(err)) => {
            warn!(error = %err, records = batch.len(), "sync batch delivery failed");
            let outcome = if err.is_transient() {
                DeliveryOutcome::TransientError(err.to_string())
            } else {
                DeliveryOutcome::PermanentError(err.to_string())
            };
            vec![outcome; batch.len()]
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, records = batch.len(), "sync batch timed out");
            vec![DeliveryOutcome::TransientError(format!("batch timed out after {timeout:?}")); batch.len()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use cmt_adapters::TransportError;
    use cmt_core::{ManualClock, MasterAttrs, Metrics};
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
    }

    fn settings(max_retries: u32) -> SyncSettings {
        SyncSettings {
            batch_size: 10,
            max_concurrent_batches: 2,
            batch_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(300),
                jitter_ratio: 0.2,
            },
        }
    }

    async fn open_engine(dir: &Path, clock: Arc<ManualClock>, max_retries: u32) -> SyncEngine {
        SyncEngine::open(AppendLog::new(dir.join(LEDGER_FILE)), clock, settings(max_retries))
            .await
            .unwrap()
            .with_rng_seed(7)
    }

    /// Stores one item with `snapshots` snapshots and returns the refs, master first.
    async fn seed_item(store: &RecordStore, clock: &ManualClock, id: &str, snapshots: usize) -> Vec<RecordRef> {
        let item_id = ItemId::new(id);
        let handle = store
            .upsert_master(&item_id, MasterAttrs::default())
            .await
            .unwrap()
            .handle;
        let mut refs = vec![RecordRef::master(item_id)];
        for n in 0..snapshots {
            let metrics: Metrics = [("view".to_string(), n as f64)].into_iter().collect();
            let snap = store.append_snapshot(&handle, "full", metrics, "test").await.unwrap();
            refs.push(snap.record_ref());
            clock.advance(chrono::Duration::seconds(1));
        }
        refs
    }

    /// Scripted transport: answers each record by kind and remembers every batch.
    #[derive(Default)]
    struct ScriptedTransport {
        master_outcome: StdMutex<Option<DeliveryOutcome>>,
        snapshot_outcome: StdMutex<Option<DeliveryOutcome>>,
        fail_whole_batch: StdMutex<Option<String>>,
        delay: Option<Duration>,
        batches: StdMutex<Vec<Vec<RecordRef>>>,
    }

    impl ScriptedTransport {
        fn set_master(&self, outcome: DeliveryOutcome) {
            *self.master_outcome.lock().unwrap() = Some(outcome);
        }

        fn unavailable(&self, message: Option<&str>) {
            *self.fail_whole_batch.lock().unwrap() = message.map(str::to_string);
        }

        fn delivered(&self) -> Vec<Vec<RecordRef>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn deliver(&self, batch: &[DeliveryRecord]) -> Result<Vec<DeliveryOutcome>, TransportError> {
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|r| r.record.clone()).collect());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = self.fail_whole_batch.lock().unwrap().clone() {
                return Err(TransportError::Unavailable(message));
            }
            let master = self.master_outcome.lock().unwrap().clone().unwrap_or(DeliveryOutcome::Ok);
            let snapshot = self.snapshot_outcome.lock().unwrap().clone().unwrap_or(DeliveryOutcome::Ok);
            Ok(batch
                .iter()
                .map(|r| match r.kind {
                    RecordKind::Master => master.clone(),
                    RecordKind::Snapshot => snapshot.clone(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn double_enqueue_delivers_once_and_syncs() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        let refs = seed_item(&store, &clock, "BV1once", 0).await;

        assert!(engine.enqueue(refs[0].clone()).await.unwrap());
        assert!(!engine.enqueue(refs[0].clone()).await.unwrap());

        let transport = Arc::new(ScriptedTransport::default());
        let report = engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(transport.delivered(), vec![vec![refs[0].clone()]]);

        assert!(!engine.enqueue(refs[0].clone()).await.unwrap());
        let again = engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();
        assert_eq!(again.submitted, 0);
        assert_eq!(engine.state_of(&refs[0]).unwrap().status, SyncStatus::Synced);
        assert_eq!(transport.delivered().len(), 1);
    }

    #[tokio::test]
    async fn three_transient_failures_end_in_failed_with_data_intact() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        let refs = seed_item(&store, &clock, "BV1retry", 0).await;
        engine.enqueue(refs[0].clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        transport.unavailable(Some("remote table locked"));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let report = engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();
            assert_eq!(report.submitted, 1);
            let state = engine.state_of(&refs[0]).unwrap().clone();
            seen.push(state.status);
            assert!(store.master(refs[0].item_id()).await.is_some());

            if state.status == SyncStatus::Pending {
                assert!(state.next_attempt_at > clock.now());
                let blocked = engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();
                assert_eq!(blocked.submitted, 0);
                clock.set(state.next_attempt_at);
            }
        }

        assert_eq!(seen, vec![SyncStatus::Pending, SyncStatus::Pending, SyncStatus::Failed]);
        let state = engine.state_of(&refs[0]).unwrap();
        assert_eq!(state.attempts, 3);
        assert_eq!(state.last_error.as_deref(), Some("sync target unavailable: remote table locked"));
        assert_eq!(engine.backlog(), 1);
    }

    #[tokio::test]
    async fn first_retry_waits_base_delay_plus_bounded_jitter() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        let refs = seed_item(&store, &clock, "BV1delay", 0).await;
        engine.enqueue(refs[0].clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        transport.unavailable(Some("busy"));
        engine.flush(&store, transport, 10, 2, None).await.unwrap();

        let wait = engine.state_of(&refs[0]).unwrap().next_attempt_at - clock.now();
        assert!(wait >= chrono::Duration::seconds(5));
        assert!(wait <= chrono::Duration::seconds(6));
    }

    #[tokio::test]
    async fn master_leads_its_snapshots_and_syncs_first() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        let refs = seed_item(&store, &clock, "BV1order", 2).await;
        for record in refs.iter().rev() {
            engine.enqueue(record.clone()).await.unwrap();
        }

        let transport = Arc::new(ScriptedTransport::default());
        let report = engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();

        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0][0], refs[0]);
        assert_eq!(report.applied[0], (refs[0].clone(), SyncStatus::Synced));
        assert!(report.applied[1..].iter().all(|(r, _)| r.kind() == RecordKind::Snapshot));
        assert_eq!(report.synced, 3);
    }

    #[tokio::test]
    async fn snapshot_ok_does_not_count_when_its_master_failed() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        let refs = seed_item(&store, &clock, "BV1parent", 1).await;
        for record in &refs {
            engine.enqueue(record.clone()).await.unwrap();
        }

        let transport = Arc::new(ScriptedTransport::default());
        transport.set_master(DeliveryOutcome::TransientError("parent table busy".into()));
        let report = engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();

        assert_eq!(report.synced, 0);
        assert_eq!(report.retried, 2);
        let snapshot_state = engine.state_of(&refs[1]).unwrap();
        assert_eq!(snapshot_state.status, SyncStatus::Pending);
        assert_eq!(snapshot_state.last_error.as_deref(), Some("parent master record was not synced"));
    }

    #[tokio::test]
    async fn snapshots_wait_while_master_is_backing_off() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        let refs = seed_item(&store, &clock, "BV1gate", 0).await;
        engine.enqueue(refs[0].clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        transport.set_master(DeliveryOutcome::TransientError("busy".into()));
        engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();

        let handle = store.handle_for(refs[0].item_id()).await.unwrap();
        let snap = store
            .append_snapshot(&handle, "T2", Metrics::new(), "test")
            .await
            .unwrap();
        engine.enqueue(snap.record_ref()).await.unwrap();

        let report = engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();
        assert_eq!(report.submitted, 0);
        assert_eq!(engine.state_of(&snap.record_ref()).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn drain_delivers_more_than_one_round_can_plan() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        for n in 0..15 {
            for record in seed_item(&store, &clock, &format!("BV1bulk{n:02}"), 1).await {
                engine.enqueue(record).await.unwrap();
            }
        }
        assert_eq!(engine.backlog(), 30);

        let transport = Arc::new(ScriptedTransport::default());
        let report = engine.drain(&store, transport.clone(), 10, 2, None).await.unwrap();

        assert_eq!(report.submitted, 30);
        assert_eq!(report.synced, 30);
        assert_eq!(report.batches, 3);
        assert_eq!(report.backlog, 0);
        assert_eq!(engine.counts().synced, 30);
        assert!(transport.delivered().iter().all(|batch| batch.len() <= 10));
    }

    #[tokio::test]
    async fn drain_stops_once_everything_left_is_backing_off() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        for n in 0..3 {
            let refs = seed_item(&store, &clock, &format!("BV1down{n}"), 0).await;
            engine.enqueue(refs[0].clone()).await.unwrap();
        }

        let transport = Arc::new(ScriptedTransport::default());
        transport.unavailable(Some("maintenance"));
        let report = engine.drain(&store, transport.clone(), 10, 2, None).await.unwrap();

        assert_eq!(report.retried, 3);
        assert_eq!(report.backlog, 3);
        assert_eq!(transport.delivered().len(), 1);
        assert!(engine.states().all(|state| state.attempts == 1));
    }

    #[tokio::test]
    async fn oversized_backoff_parks_the_record_instead_of_overflowing() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let huge = SyncSettings {
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(u64::MAX / 4),
                max_delay: Duration::MAX,
                jitter_ratio: 0.0,
            },
            ..settings(3)
        };
        let mut engine = SyncEngine::open(AppendLog::new(dir.path().join(LEDGER_FILE)), clock.clone(), huge)
            .await
            .unwrap();
        let refs = seed_item(&store, &clock, "BV1park", 0).await;
        engine.enqueue(refs[0].clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        transport.unavailable(Some("busy"));
        let report = engine.flush(&store, transport, 10, 2, None).await.unwrap();

        assert_eq!(report.retried, 1);
        let state = engine.state_of(&refs[0]).unwrap();
        assert_eq!(state.status, SyncStatus::Pending);
        assert!(state.next_attempt_at > clock.now());
    }

    #[tokio::test]
    async fn batches_respect_size_and_concurrency_limits() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        for n in 0..5 {
            let refs = seed_item(&store, &clock, &format!("BV1batch{n}"), 0).await;
            engine.enqueue(refs[0].clone()).await.unwrap();
        }

        let transport = Arc::new(ScriptedTransport::default());
        let report = engine.flush(&store, transport.clone(), 2, 2, None).await.unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!(report.submitted, 4);
        assert!(transport.delivered().iter().all(|batch| batch.len() == 2));
        assert_eq!(engine.counts().pending, 1);

        let rest = engine.flush(&store, transport, 2, 2, None).await.unwrap();
        assert_eq!(rest.synced, 1);
        assert_eq!(engine.backlog(), 0);
    }

    #[tokio::test]
    async fn slow_batch_times_out_as_transient() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = SyncEngine::open(
            AppendLog::new(dir.path().join(LEDGER_FILE)),
            clock.clone(),
            SyncSettings {
                batch_timeout: Duration::from_millis(50),
                ..settings(3)
            },
        )
        .await
        .unwrap();
        let refs = seed_item(&store, &clock, "BV1slow", 0).await;
        engine.enqueue(refs[0].clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let report = engine.flush(&store, transport, 10, 1, None).await.unwrap();
        assert_eq!(report.retried, 1);
        let state = engine.state_of(&refs[0]).unwrap();
        assert_eq!(state.attempts, 1);
        assert!(state.last_error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn cycle_deadline_abandons_batches_without_using_attempts() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        let refs = seed_item(&store, &clock, "BV1deadline", 1).await;
        for record in &refs {
            engine.enqueue(record.clone()).await.unwrap();
        }

        let transport = Arc::new(ScriptedTransport {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let deadline = Instant::now() + Duration::from_millis(50);
        let report = engine.flush(&store, transport, 10, 1, Some(deadline)).await.unwrap();

        assert!(report.timed_out);
        assert_eq!(report.abandoned, 2);
        for record in &refs {
            let state = engine.state_of(record).unwrap();
            assert_eq!(state.status, SyncStatus::Pending);
            assert_eq!(state.attempts, 0);
        }
    }

    #[tokio::test]
    async fn reopening_recovers_in_flight_records() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let record = RecordRef::master(ItemId::new("BV1crash"));
        let mut crashed = SyncState::pending(record.clone(), t0());
        crashed.status = SyncStatus::InFlight;
        crashed.attempts = 1;
        AppendLog::new(dir.path().join(LEDGER_FILE))
            .append(&[crashed])
            .await
            .unwrap();

        let engine = open_engine(dir.path(), clock, 3).await;
        let state = engine.state_of(&record).unwrap();
        assert_eq!(state.status, SyncStatus::Pending);
        assert_eq!(state.attempts, 1);
    }

    #[tokio::test]
    async fn ledger_journal_replays_latest_state_and_compacts_on_reopen() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        let refs = seed_item(&store, &clock, "BV1journal", 1).await;
        for record in &refs {
            engine.enqueue(record.clone()).await.unwrap();
        }
        let transport = Arc::new(ScriptedTransport::default());
        engine.flush(&store, transport, 10, 2, None).await.unwrap();
        drop(engine);

        let journal = dir.path().join(LEDGER_FILE);
        let lines_before = std::fs::read_to_string(&journal).unwrap().lines().count();
        assert!(lines_before > refs.len(), "each transition appends a line");

        let engine = open_engine(dir.path(), clock, 3).await;
        assert_eq!(engine.counts().synced, refs.len());
        assert_eq!(engine.backlog(), 0);
        let lines_after = std::fs::read_to_string(&journal).unwrap().lines().count();
        assert_eq!(lines_after, refs.len());
    }

    #[tokio::test]
    async fn failed_records_can_be_retried_and_dirty_masters_requeued() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path().join("data"), clock.clone()).await.unwrap();
        let mut engine = open_engine(dir.path(), clock.clone(), 3).await;
        let a = seed_item(&store, &clock, "BV1a", 0).await.remove(0);
        let b = seed_item(&store, &clock, "BV1b", 0).await.remove(0);
        engine.enqueue(a.clone()).await.unwrap();
        engine.enqueue(b.clone()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        transport.set_master(DeliveryOutcome::PermanentError("schema mismatch".into()));
        let report = engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(engine.counts().failed, 2);

        assert_eq!(engine.retry_failed().await.unwrap(), 2);
        transport.set_master(DeliveryOutcome::Ok);
        engine.flush(&store, transport.clone(), 10, 2, None).await.unwrap();
        assert_eq!(engine.counts().synced, 2);

        assert!(!engine.enqueue(a.clone()).await.unwrap());
        assert!(engine.mark_dirty(a.clone()).await.unwrap());
        assert_eq!(engine.state_of(&a).unwrap().status, SyncStatus::Pending);
        assert_eq!(engine.backlog(), 1);
    }
}
