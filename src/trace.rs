//! Trace propagation helper (§4.6). Captures the current span's context at
//! enqueue time and, at dequeue time, installs it as a *link* -- never a
//! parent -- on the handler span, so tracing backends show a correlation
//! edge across the queue boundary instead of an inflated, re-parented
//! causal chain.

use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::types::TraceContext as WireTraceContext;

/// Captures the currently active span's context, to be serialized into the
/// envelope at enqueue time. Returns `None` if there is no active
/// OpenTelemetry context (e.g. tracing isn't wired up, or this is a test).
pub fn capture() -> Option<WireTraceContext> {
    let ctx = tracing::Span::current().context();
    let span_ref = ctx.span();
    let span_ctx = span_ref.span_context();
    if !span_ctx.is_valid() {
        return None;
    }
    Some(WireTraceContext {
        trace_id: span_ctx.trace_id().to_string(),
        span_id: span_ctx.span_id().to_string(),
        trace_flags: Some(span_ctx.trace_flags().to_u8()),
        trace_state: {
            let s = span_ctx.trace_state().header();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        },
    })
}

/// Reconstructs a remote `SpanContext` from the wire format and attaches it
/// to `span` as a link. The handler's span is left parentless: any parent
/// it would otherwise have inherited from the worker's polling loop is not
/// what we want recorded, since that's an artifact of task scheduling, not
/// of the job's logical causality.
pub fn install_link(span: &tracing::Span, trace: &WireTraceContext) {
    let Ok(trace_id) = TraceId::from_hex(&trace.trace_id) else {
        tracing::warn!(trace_id = %trace.trace_id, "failed to parse trace id, dropping link");
        return;
    };
    let Ok(span_id) = SpanId::from_hex(&trace.span_id) else {
        tracing::warn!(span_id = %trace.span_id, "failed to parse span id, dropping link");
        return;
    };
    let flags = TraceFlags::new(trace.trace_flags.unwrap_or(0));
    let state = trace
        .trace_state
        .as_deref()
        .and_then(|s| TraceState::from_key_value(parse_state_pairs(s)).ok())
        .unwrap_or_default();

    let remote_ctx = SpanContext::new(trace_id, span_id, flags, true, state);
    span.add_link(remote_ctx);
}

fn parse_state_pairs(header: &str) -> Vec<(String, String)> {
    header
        .split(',')
        .filter_map(|kv| {
            let mut parts = kv.splitn(2, '=');
            let k = parts.next()?.trim();
            let v = parts.next()?.trim();
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_link_ignores_unparseable_ids_without_panicking() {
        let span = tracing::info_span!("test");
        let trace = WireTraceContext {
            trace_id: "not-hex".to_string(),
            span_id: "also-not-hex".to_string(),
            trace_flags: None,
            trace_state: None,
        };
        install_link(&span, &trace);
    }

    #[test]
    fn install_link_accepts_well_formed_ids() {
        let span = tracing::info_span!("test");
        let trace = WireTraceContext {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            trace_flags: Some(1),
            trace_state: None,
        };
        install_link(&span, &trace);
    }
}
