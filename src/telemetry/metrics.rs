//! Metric instrument factories.
//!
//! Instruments are created lazily from the `"kakunin"` meter using the
//! globally-registered `MeterProvider`.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("kakunin")
}

/// Counter: safety checks executed.
/// Labels: `result` ("pass" | "fail" | "override"),
/// `source` ("adapter" | "synthesized" | "supervisor").
pub fn checks_executed() -> Counter<u64> {
    meter()
        .u64_counter("kakunin.checks.executed")
        .with_description("Number of safety checks executed")
        .build()
}

/// Counter: session status transitions. Labels: `to`.
pub fn session_transitions() -> Counter<u64> {
    meter()
        .u64_counter("kakunin.sessions.transitions")
        .with_description("Number of work session status transitions")
        .build()
}

/// Counter: adapter calls that failed or timed out. Labels: `adapter`.
pub fn adapter_failures() -> Counter<u64> {
    meter()
        .u64_counter("kakunin.adapters.failures")
        .with_description("Adapter failures absorbed by the orchestrator")
        .build()
}

/// Histogram: adapter call duration in milliseconds. Labels: `adapter`.
pub fn adapter_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("kakunin.adapters.duration_ms")
        .with_description("Adapter call duration in milliseconds")
        .with_unit("ms")
        .build()
}
