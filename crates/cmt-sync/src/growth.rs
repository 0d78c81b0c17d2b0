//! Growth between snapshots of one item.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cmt_core::{Clock, Growth, GrowthMetric, InsufficientReason, ItemId, SnapshotRecord};
use cmt_storage::RecordStore;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrowthError {
    #[error("invalid interval of {interval_seconds}s between snapshots of {item_id}")]
    InvalidInterval { item_id: ItemId, interval_seconds: i64 },
    #[error("snapshots belong to different items ({earlier} and {later})")]
    MismatchedItems { earlier: ItemId, later: ItemId },
}

/// Per-metric delta and hourly rate from `earlier` to `later`.
///
/// Only metrics present in both snapshots are compared; the rest are listed in
/// `excluded_metrics` and the result is flagged `partial`. Negative deltas are kept.
pub fn growth_between(
    earlier: &SnapshotRecord,
    later: &SnapshotRecord,
    computed_at: DateTime<Utc>,
) -> Result<GrowthMetric, GrowthError> {
    if earlier.item_id != later.item_id {
        return Err(GrowthError::MismatchedItems {
            earlier: earlier.item_id.clone(),
            later: later.item_id.clone(),
        });
    }
    let interval_seconds = (later.collected_at - earlier.collected_at).num_seconds();
    if interval_seconds <= 0 {
        return Err(GrowthError::InvalidInterval {
            item_id: later.item_id.clone(),
            interval_seconds,
        });
    }
    let hours = interval_seconds as f64 / 3600.0;

    let mut delta = BTreeMap::new();
    let mut rate_per_hour = BTreeMap::new();
    for (name, later_value) in &later.metrics {
        if let Some(earlier_value) = earlier.metrics.get(name) {
            let change = later_value - earlier_value;
            delta.insert(name.clone(), change);
            rate_per_hour.insert(name.clone(), change / hours);
        }
    }
    let excluded_metrics: Vec<String> = earlier
        .metrics
        .keys()
        .chain(later.metrics.keys())
        .filter(|name| !delta.contains_key(*name))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Ok(GrowthMetric {
        item_id: later.item_id.clone(),
        earlier_at: earlier.collected_at,
        later_at: later.collected_at,
        earlier_time_point: earlier.time_point.clone(),
        later_time_point: later.time_point.clone(),
        interval_seconds,
        delta,
        rate_per_hour,
        partial: !excluded_metrics.is_empty(),
        excluded_metrics,
        computed_at,
    })
}

/// Reads snapshot history from the store and derives growth on demand.
#[derive(Debug, Clone)]
pub struct GrowthAnalyzer {
    store: Arc<RecordStore>,
    clock: Arc<dyn Clock>,
}

impl GrowthAnalyzer {
    pub fn new(store: Arc<RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Growth across the two most recent snapshots.
    pub async fn compute_growth(&self, item_id: &ItemId) -> Result<Growth, GrowthError> {
        let history = self.store.snapshots_for(item_id).await;
        let [.., earlier, later] = history.as_slice() else {
            debug!(%item_id, available = history.len(), "not enough snapshots for growth");
            return Ok(Growth::Insufficient {
                item_id: item_id.clone(),
                reason: InsufficientReason::NotEnoughDataPoints {
                    available: history.len(),
                },
            });
        };
        growth_between(earlier, later, self.clock.now()).map(Growth::Computed)
    }

    /// Growth between the latest snapshots labelled `earlier_label` and `later_label`.
    pub async fn compute_growth_between(
        &self,
        item_id: &ItemId,
        earlier_label: &str,
        later_label: &str,
    ) -> Result<Growth, GrowthError> {
        let history = self.store.snapshots_for(item_id).await;
        if history.len() < 2 {
            return Ok(Growth::Insufficient {
                item_id: item_id.clone(),
                reason: InsufficientReason::NotEnoughDataPoints {
                    available: history.len(),
                },
            });
        }
        let latest_with = |label: &str| history.iter().rev().find(|s| s.time_point == label);
        let Some(earlier) = latest_with(earlier_label) else {
            return Ok(missing_label(item_id, earlier_label));
        };
        let Some(later) = latest_with(later_label) else {
            return Ok(missing_label(item_id, later_label));
        };
        growth_between(earlier, later, self.clock.now()).map(Growth::Computed)
    }
}

fn missing_label(item_id: &ItemId, label: &str) -> Growth {
    Growth::Insufficient {
        item_id: item_id.clone(),
        reason: InsufficientReason::TimePointMissing {
            time_point: label.to_string(),
        },
    }
}
