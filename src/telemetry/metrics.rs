//! Attempt and unit counters, read from the global meter provider.
//!
//! Without an OTLP endpoint the global provider is a no-op and recording is
//! free.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("attempt-rs")
}

/// Counter: task attempts started.
pub fn attempts_started() -> Counter<u64> {
    meter()
        .u64_counter("attempt.started")
        .with_description("Number of task attempts started")
        .build()
}

/// Counter: terminal results.
/// Labels: `result` ("completed" | "canceled" | "failed").
pub fn attempt_results() -> Counter<u64> {
    meter()
        .u64_counter("attempt.results")
        .with_description("Number of task attempts by terminal result")
        .build()
}

/// Counter: work units run by the bundled engine.
/// Labels: `status` ("succeeded" | "failed" | "cancelled").
pub fn units_run() -> Counter<u64> {
    meter()
        .u64_counter("attempt.units")
        .with_description("Number of work units run")
        .build()
}

/// Histogram: attempt duration in milliseconds.
pub fn attempt_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("attempt.duration_ms")
        .with_description("Task attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: shared-resource brokers that failed to close.
pub fn broker_close_failures() -> Counter<u64> {
    meter()
        .u64_counter("attempt.broker.close_failures")
        .with_description("Resource broker teardown failures")
        .build()
}
