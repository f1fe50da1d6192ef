use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::response::Response;
use crate::util::lock_unpoisoned;

/// Point-in-time copy of the dispatcher counters.
///
/// Every attempt counts once in `requests_started`, replays included. An
/// attempt that is deferred is not counted as succeeded or failed; its replay
/// is.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatcherMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub duplicates_rejected: u64,
    pub cancelled: u64,
    pub deferred: u64,
    pub replays: u64,
    pub recoveries_started: u64,
    pub recoveries_failed: u64,
    pub in_flight: u64,
    pub pending_requests: u64,
    pub waiting_for_recovery: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct DispatcherMetrics {
    inner: Arc<DispatcherMetricsInner>,
}

#[derive(Debug, Default)]
struct DispatcherMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    duplicates_rejected: AtomicU64,
    cancelled: AtomicU64,
    deferred: AtomicU64,
    replays: AtomicU64,
    recoveries_started: AtomicU64,
    recoveries_failed: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Arc<DispatcherMetricsInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl DispatcherMetrics {
    pub(crate) fn record_attempt_started(&self, deferrals: usize) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
        if deferrals > 0 {
            self.inner.replays.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn record_deferred(&self) {
        self.inner.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery_started(&self) {
        self.inner.recoveries_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery_failed(&self) {
        self.inner.recoveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt_completed(
        &self,
        result: &Result<Response, Error>,
        latency: Duration,
    ) {
        self.record_latency(latency);
        let error = match result {
            Ok(response) => {
                self.inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status().as_u16());
                return;
            }
            Err(error) => error,
        };

        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        match error {
            Error::DuplicateRequest { .. } => {
                self.inner.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(error.code().as_str().to_owned());
            }
            Error::Cancelled { .. } => {
                self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(error.code().as_str().to_owned());
            }
            Error::Transport { kind, .. } => {
                self.add_error_count(format!("transport:{kind}"));
            }
            Error::HttpStatus { status, .. } => {
                self.add_status_count(*status);
                self.add_error_count(format!("http_status:{status}"));
            }
            Error::Domain { code, .. } => {
                self.add_error_count(format!("domain:{code}"));
            }
            other => {
                self.add_error_count(other.code().as_str().to_owned());
            }
        }
    }

    pub(crate) fn snapshot(
        &self,
        pending_requests: usize,
        waiting_for_recovery: usize,
    ) -> DispatcherMetricsSnapshot {
        let inner = &self.inner;
        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        DispatcherMetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            duplicates_rejected: inner.duplicates_rejected.load(Ordering::Relaxed),
            cancelled: inner.cancelled.load(Ordering::Relaxed),
            deferred: inner.deferred.load(Ordering::Relaxed),
            replays: inner.replays.load(Ordering::Relaxed),
            recoveries_started: inner.recoveries_started.load(Ordering::Relaxed),
            recoveries_failed: inner.recoveries_failed.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            pending_requests: pending_requests as u64,
            waiting_for_recovery: waiting_for_recovery as u64,
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner
            .latency_total_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn add_status_count(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, key: String) {
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(key).or_insert(0) += 1;
    }
}
