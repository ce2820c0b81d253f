//! Metrics registry for the cache worker set controller
//!
//! Provides OpenTelemetry metrics for:
//! - Reconcile passes (duration, errors)
//! - Targeted scale-in (pods marked and removed)
//!
//! Instruments are created lazily on the global meter. Until a meter provider
//! is installed by [`crate::telemetry::init_telemetry`] they record into the
//! no-op provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::Error;

/// Global meter for controller metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("cacheworkerset"));

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `set`: CacheWorkerSet name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("cacheworkerset_reconcile_duration_seconds")
        .with_description("Duration of CacheWorkerSet reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed reconcile passes
///
/// Labels:
/// - `set`: CacheWorkerSet name
/// - `error_type`: see [`ErrorKind`]
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cacheworkerset_reconcile_errors_total")
        .with_description("Total number of CacheWorkerSet reconciliation errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Scale-in Metrics
// ============================================================================

/// Counter of pods touched by targeted scale-in
///
/// Labels:
/// - `set`: CacheWorkerSet name
/// - `phase`: marked, removed
pub static SCALE_IN_PODS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cacheworkerset_scale_in_pods_total")
        .with_description("Total number of pods marked or removed by targeted scale-in")
        .with_unit("{pods}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Label for the kind of error that failed a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Optimistic-concurrency conflict that outlived its retries
    Conflict,
    /// The cache-drain hook refused a pod
    Drain,
    /// Revision or status bookkeeping did not hold
    Invariant,
    /// Any other API or encoding failure
    Api,
}

impl ErrorKind {
    /// Classify a reconcile error
    pub fn of(error: &Error) -> Self {
        match error {
            Error::Drain { .. } => Self::Drain,
            Error::Invariant(_) => Self::Invariant,
            e if e.is_conflict() => Self::Conflict,
            _ => Self::Api,
        }
    }

    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Drain => "drain",
            Self::Invariant => "invariant",
            Self::Api => "api",
        }
    }
}

/// Labels for scale-in phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleInPhase {
    /// Pod annotated for removal
    Marked,
    /// Pod drained and deleted
    Removed,
}

impl ScaleInPhase {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Marked => "marked",
            Self::Removed => "removed",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one reconcile pass
pub struct ReconcileTimer {
    set: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(set: impl Into<String>) -> Self {
        Self {
            set: set.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        self.finish("success");
    }

    /// Record a failed pass
    pub fn error(self) {
        self.finish("error");
    }

    fn finish(self, result: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("set", self.set),
                KeyValue::new("result", result),
            ],
        );
    }
}

/// Count a failed pass
pub fn record_reconcile_error(set: &str, error: &Error) {
    RECONCILE_ERRORS.add(
        1,
        &[
            KeyValue::new("set", set.to_string()),
            KeyValue::new("error_type", ErrorKind::of(error).as_str()),
        ],
    );
}

/// Count pods marked or removed by scale-in
pub fn record_scale_in(set: &str, phase: ScaleInPhase, pods: usize) {
    if pods == 0 {
        return;
    }
    SCALE_IN_PODS.add(
        u64::try_from(pods).unwrap_or(u64::MAX),
        &[
            KeyValue::new("set", set.to_string()),
            KeyValue::new("phase", phase.as_str()),
        ],
    );
}
