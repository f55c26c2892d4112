//! Worker statistics.
//!
//! Counters are written only from the worker's own completion path, so
//! plain atomics are enough.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Default)]
pub struct WorkerStats {
    jobs_processed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    total_execution_ms: AtomicU64,
    active_jobs: AtomicUsize,
    last_job_at: Mutex<Option<DateTime<Utc>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy with the derived rates filled in.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatsSnapshot {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub total_retries: u64,
    pub successful_retries: u64,
    pub total_execution_ms: u64,
    pub active_jobs: usize,
    pub last_job_at: Option<DateTime<Utc>>,
    pub uptime_ms: u64,
    pub success_rate: f64,
    pub avg_execution_ms: f64,
    pub retry_success_rate: f64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self, now: DateTime<Utc>) {
        *self.started_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(now);
    }

    pub fn job_started(&self) {
        self.active_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_succeeded(&self, duration_ms: u64, was_retry: bool, now: DateTime<Utc>) {
        self.job_finished(now);
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        self.total_execution_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if was_retry {
            self.successful_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn job_retrying(&self, now: DateTime<Utc>) {
        self.job_finished(now);
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self, now: DateTime<Utc>) {
        self.job_finished(now);
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// An attempt that neither succeeded nor failed (claim lost).
    pub fn job_lost(&self) {
        self.active_jobs.fetch_sub(1, Ordering::Relaxed);
    }

    fn job_finished(&self, now: DateTime<Utc>) {
        self.active_jobs.fetch_sub(1, Ordering::Relaxed);
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        *self.last_job_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(now);
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> WorkerStatsSnapshot {
        let processed = self.jobs_processed.load(Ordering::Relaxed);
        let succeeded = self.jobs_succeeded.load(Ordering::Relaxed);
        let retries = self.total_retries.load(Ordering::Relaxed);
        let successful_retries = self.successful_retries.load(Ordering::Relaxed);
        let total_execution_ms = self.total_execution_ms.load(Ordering::Relaxed);
        let started_at = *self.started_at.lock().unwrap_or_else(|p| p.into_inner());

        WorkerStatsSnapshot {
            jobs_processed: processed,
            jobs_succeeded: succeeded,
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            total_retries: retries,
            successful_retries,
            total_execution_ms,
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            last_job_at: *self.last_job_at.lock().unwrap_or_else(|p| p.into_inner()),
            uptime_ms: started_at
                .map(|t| (now - t).num_milliseconds().max(0) as u64)
                .unwrap_or(0),
            success_rate: ratio(succeeded, processed),
            avg_execution_ms: if succeeded == 0 {
                0.0
            } else {
                total_execution_ms as f64 / succeeded as f64
            },
            retry_success_rate: ratio(successful_retries, retries),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_derives_rates() {
        let stats = WorkerStats::new();
        let t0 = Utc::now();
        stats.mark_started(t0);

        stats.job_started();
        stats.job_succeeded(100, false, t0);
        stats.job_started();
        stats.job_retrying(t0);
        stats.job_started();
        stats.job_succeeded(300, true, t0);
        stats.job_started();
        stats.job_failed(t0);

        let snap = stats.snapshot(t0 + chrono::Duration::seconds(10));
        assert_eq!(snap.jobs_processed, 4);
        assert_eq!(snap.jobs_succeeded, 2);
        assert_eq!(snap.jobs_failed, 1);
        assert_eq!(snap.total_retries, 1);
        assert_eq!(snap.successful_retries, 1);
        assert_eq!(snap.active_jobs, 0);
        assert_eq!(snap.success_rate, 0.5);
        assert_eq!(snap.avg_execution_ms, 200.0);
        assert_eq!(snap.retry_success_rate, 1.0);
        assert!(snap.uptime_ms >= 10_000);
    }

    #[test]
    fn empty_stats_have_zero_rates() {
        let snap = WorkerStats::new().snapshot(Utc::now());
        assert_eq!(snap.success_rate, 0.0);
        assert_eq!(snap.avg_execution_ms, 0.0);
        assert_eq!(snap.retry_success_rate, 0.0);
        assert_eq!(snap.uptime_ms, 0);
    }
}
