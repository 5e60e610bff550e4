//! Metrics registry for autorestart
//!
//! OpenTelemetry instruments for:
//! - Reconcile outcomes and latency
//! - Restart actions issued, by method
//! - Ledger size
//!
//! Instruments are no-ops until a meter provider is installed by
//! [`init_telemetry`](crate::telemetry::init_telemetry).

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::model::RestartMethod;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("autorestart"));

/// Counter of finished reconciles
///
/// Labels:
/// - `outcome`: committed, cleaned, dropped_not_found, dropped_unchanged,
///   superseded, failed
/// - `error_type`: transient, permanent (failed only)
pub static RECONCILES_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("autorestart_reconciles_total")
        .with_description("Total number of reconciles by outcome")
        .with_unit("{reconciles}")
        .build()
});

/// Histogram of reconcile duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("autorestart_reconcile_duration_seconds")
        .with_description("Duration of a reconcile attempt in seconds")
        .with_unit("s")
        .build()
});

/// Counter of restart actions that succeeded
///
/// Labels:
/// - `method`: delete, annotate
pub static RESTART_ACTIONS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("autorestart_restart_actions_total")
        .with_description("Total number of restart actions issued")
        .with_unit("{actions}")
        .build()
});

/// Gauge of ConfigMaps with a recorded revision, sampled by the ledger sweep
pub static LEDGER_ENTRIES: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("autorestart_ledger_entries")
        .with_description("ConfigMaps with a processed revision in the ledger")
        .with_unit("{configmaps}")
        .build()
});

/// Times one reconcile and records its outcome
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record a reconcile that reached a terminal outcome
    pub fn success(self, outcome: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "success")],
        );
        RECONCILES_TOTAL.add(1, &[KeyValue::new("outcome", outcome)]);
    }

    /// Record a failed reconcile
    pub fn error(self, error_type: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "error")],
        );
        RECONCILES_TOTAL.add(
            1,
            &[
                KeyValue::new("outcome", "failed"),
                KeyValue::new("error_type", error_type),
            ],
        );
    }
}

/// Count a restart action that was applied
pub fn record_restart_action(method: RestartMethod) {
    RESTART_ACTIONS_TOTAL.add(1, &[KeyValue::new("method", method.as_str())]);
}

/// Update the ledger size gauge
pub fn set_ledger_entries(count: usize) {
    LEDGER_ENTRIES.record(i64::try_from(count).unwrap_or(i64::MAX), &[]);
}
