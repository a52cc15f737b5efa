use opentelemetry::trace::{TraceContextExt, TraceId};
use rand::Rng;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Trace id of the current span, or a random one when no otel context is attached.
pub fn get_trace_id() -> TraceId {
    let id = tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id();
    if id != TraceId::INVALID {
        return id;
    }
    let val: u128 = rand::thread_rng().gen();
    TraceId::from(val)
}
