//! Metric instrument factories for taskq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskq"` meter.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for taskq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: number of work items submitted.
/// Labels: `handler`, `source`.
pub fn work_submitted() -> Counter<u64> {
    meter()
        .u64_counter("taskq.work.submitted")
        .with_description("Number of work items submitted")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskq.work.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Counter: broker operations issued by the engine (`enqueue`,
/// `dequeue_batch`, `extend_lease`, `complete`, `retry`, `fail`, `release`,
/// `reap_expired`).
/// Labels: `operation`, `result` ("ok" | "error").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.queue.operations")
        .with_description("Number of broker operations")
        .build()
}

/// Count one broker call in [`queue_operations`].
pub fn record_queue_operation<T, E>(operation: &'static str, result: &Result<T, E>) {
    queue_operations().add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
        ],
    );
}

/// Counter: failed attempts that were re-enqueued with backoff.
/// Labels: `handler`.
pub fn work_retries() -> Counter<u64> {
    meter()
        .u64_counter("taskq.work.retries")
        .with_description("Failed attempts scheduled for retry")
        .build()
}

/// Counter: work items failed because no handler is registered.
/// Labels: `handler`.
pub fn work_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("taskq.work.unroutable")
        .with_description("Work items with no registered handler")
        .build()
}

/// Counter: stale leases returned to the queue by the reaper.
pub fn leases_reaped() -> Counter<u64> {
    meter()
        .u64_counter("taskq.leases.reaped")
        .with_description("Abandoned leases returned to pending")
        .build()
}

/// Counter: schedule firings that enqueued a work item.
/// Labels: `schedule`.
pub fn schedule_fired() -> Counter<u64> {
    meter()
        .u64_counter("taskq.schedule.fired")
        .with_description("Schedule firings that enqueued work")
        .build()
}

/// Counter: schedule firings that were claimed but not enqueued, or skipped.
/// Labels: `schedule`, `reason` ("enqueue_failed" | "catch_up_limit").
pub fn schedule_misfires() -> Counter<u64> {
    meter()
        .u64_counter("taskq.schedule.misfires")
        .with_description("Missed schedule firings")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
