// src/core/health/stats.rs

//! Shared per-backend health-check statistics, updated on every probe and
//! formatted for external readers by the admin surface.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

/// Counters and durations for one backend's probes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeStats {
    pub total_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub skip_count: u64,
    pub retry_count: u64,
    /// Largest retry ladder climbed within one probe session.
    pub max_retry_count: u32,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    pub min_duration_ms: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_successful_health_check: Option<DateTime<Utc>>,
    pub last_failed_health_check: Option<DateTime<Utc>>,
    pub last_skipped_health_check: Option<DateTime<Utc>>,
}

impl ProbeStats {
    pub fn average_duration_ms(&self) -> u64 {
        if self.success_count + self.fail_count == 0 {
            0
        } else {
            self.total_duration_ms / (self.success_count + self.fail_count)
        }
    }
}

/// The shared statistics table, one record per configured backend.
#[derive(Debug)]
pub struct HealthStats {
    records: Vec<Mutex<ProbeStats>>,
}

impl HealthStats {
    pub fn new(num_backends: usize) -> Self {
        Self {
            records: (0..num_backends).map(|_| Mutex::new(ProbeStats::default())).collect(),
        }
    }

    pub fn record_success(&self, node_id: usize, duration: Duration) {
        if let Some(record) = self.records.get(node_id) {
            let mut stats = record.lock();
            let ms = duration.as_millis() as u64;
            stats.total_count += 1;
            stats.success_count += 1;
            stats.total_duration_ms += ms;
            stats.max_duration_ms = stats.max_duration_ms.max(ms);
            stats.min_duration_ms = if stats.min_duration_ms == 0 {
                ms
            } else {
                stats.min_duration_ms.min(ms)
            };
            let now = Utc::now();
            stats.last_health_check = Some(now);
            stats.last_successful_health_check = Some(now);
        }
    }

    pub fn record_failure(&self, node_id: usize, duration: Duration, retries_used: u32) {
        if let Some(record) = self.records.get(node_id) {
            let mut stats = record.lock();
            let ms = duration.as_millis() as u64;
            stats.total_count += 1;
            stats.fail_count += 1;
            stats.retry_count += retries_used as u64;
            stats.max_retry_count = stats.max_retry_count.max(retries_used);
            stats.total_duration_ms += ms;
            stats.max_duration_ms = stats.max_duration_ms.max(ms);
            let now = Utc::now();
            stats.last_health_check = Some(now);
            stats.last_failed_health_check = Some(now);
        }
    }

    pub fn record_skip(&self, node_id: usize) {
        if let Some(record) = self.records.get(node_id) {
            let mut stats = record.lock();
            stats.total_count += 1;
            stats.skip_count += 1;
            let now = Utc::now();
            stats.last_health_check = Some(now);
            stats.last_skipped_health_check = Some(now);
        }
    }

    /// Copies every record for external formatting.
    pub fn snapshot(&self) -> Vec<ProbeStats> {
        self.records.iter().map(|r| r.lock().clone()).collect()
    }
}
