//! Aggregation snapshots served by the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One bucket of the 24h execution histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyBucket {
    /// Start of the hour, UTC.
    pub hour: DateTime<Utc>,
    pub executions: u64,
    pub failures: u64,
}

/// Aggregated job counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total: u64,
    /// Keyed by status wire name (SCHEDULED, RUNNING, ...).
    pub by_status: BTreeMap<String, u64>,
    pub by_task_type: BTreeMap<String, u64>,
    /// Hourly execution counts over the trailing 24 hours, oldest first.
    pub hourly: Vec<HourlyBucket>,
}
