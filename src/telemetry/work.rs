//! Spans around a single handler execution.

use tracing::Span;

use crate::model::WorkId;

/// Span for one attempt. `work.state` starts empty and is filled in by
/// [`record_state_transition`].
pub fn start_work_span(handler: &str, work_id: &WorkId, attempt: u32) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.handler" = handler,
        "work.id" = %work_id,
        "work.attempt" = attempt,
        "work.state" = tracing::field::Empty,
    )
}

/// Set `work.state` on the span and log the transition inside it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
