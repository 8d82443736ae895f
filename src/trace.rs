use std::borrow::Cow;

use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::SdkTracer;

/// Span operations scoped to one telemetry instance.
///
/// Spans parent off an explicit [`Context`] rather than a thread-local, which
/// keeps the facade usable from any task without global registration. The
/// request middleware puts the extracted context into request extensions;
/// handlers pass it down.
#[derive(Clone)]
pub struct TraceApi {
    tracer: SdkTracer,
}

impl TraceApi {
    pub(crate) fn new(tracer: SdkTracer) -> Self {
        TraceApi { tracer }
    }

    /// Start a span as a child of `parent` and return a guard holding the new
    /// context.
    ///
    /// The span ends when the guard is dropped or [`SpanGuard::end`] is
    /// called. Pass [`SpanGuard::context`] to nested operations so they
    /// parent correctly.
    pub fn start_span(&self, parent: &Context, name: impl Into<Cow<'static, str>>) -> SpanGuard {
        self.start_span_with_attributes(parent, name, Vec::new())
    }

    /// Start a child span carrying the given attributes from the start.
    pub fn start_span_with_attributes(
        &self,
        parent: &Context,
        name: impl Into<Cow<'static, str>>,
        attributes: Vec<KeyValue>,
    ) -> SpanGuard {
        let mut builder = self.tracer.span_builder(name);
        builder.span_kind = Some(SpanKind::Internal);
        if !attributes.is_empty() {
            builder.attributes = Some(attributes);
        }
        let span = self.tracer.build_with_context(builder, parent);
        SpanGuard {
            cx: parent.with_span(span),
            ended: false,
        }
    }

    /// Record `err` on the span in `cx` and mark the span as failed.
    ///
    /// No-op when the context carries no recording span.
    pub fn record_error(&self, cx: &Context, err: &dyn std::error::Error) {
        let span = cx.span();
        if span.is_recording() {
            span.record_error(err);
            span.set_status(Status::error(err.to_string()));
        }
    }

    /// Set attributes on the span in `cx`.
    pub fn set_attributes(&self, cx: &Context, attributes: impl IntoIterator<Item = KeyValue>) {
        let span = cx.span();
        if span.is_recording() {
            for attribute in attributes {
                span.set_attribute(attribute);
            }
        }
    }

    /// Add a named event with attributes to the span in `cx`.
    pub fn add_event(
        &self,
        cx: &Context,
        name: impl Into<Cow<'static, str>>,
        attributes: Vec<KeyValue>,
    ) {
        let span = cx.span();
        if span.is_recording() {
            span.add_event(name, attributes);
        }
    }

    /// Set the status of the span in `cx`.
    pub fn set_status(&self, cx: &Context, status: Status) {
        let span = cx.span();
        if span.is_recording() {
            span.set_status(status);
        }
    }

    /// The span carried by `cx`, a no-op span when there is none.
    pub fn span<'a>(&self, cx: &'a Context) -> opentelemetry::trace::SpanRef<'a> {
        cx.span()
    }

    /// Run `f` inside a new child span of `parent`, ending the span when `f`
    /// returns.
    pub fn in_span<T>(
        &self,
        parent: &Context,
        name: impl Into<Cow<'static, str>>,
        f: impl FnOnce(&Context) -> T,
    ) -> T {
        let guard = self.start_span(parent, name);
        let result = f(guard.context());
        guard.end();
        result
    }
}

/// Active span handle. Ends the span on drop.
#[must_use = "dropping the guard immediately ends the span"]
pub struct SpanGuard {
    cx: Context,
    ended: bool,
}

impl SpanGuard {
    /// Context carrying this span, for parenting nested spans and correlating
    /// logs.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// End the span now instead of at drop.
    pub fn end(mut self) {
        self.cx.span().end();
        self.ended = true;
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if !self.ended {
            self.cx.span().end();
        }
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState, TracerProvider as _,
    };
    use opentelemetry_sdk::trace::SdkTracerProvider;

    use super::*;

    fn test_api() -> TraceApi {
        TraceApi::new(SdkTracerProvider::builder().build().tracer("trace-tests"))
    }

    fn remote_parent() -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_bytes([7; 16]),
            SpanId::from_bytes([3; 8]),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ))
    }

    #[test]
    fn child_span_joins_the_parent_trace() {
        let api = test_api();
        let parent = remote_parent();

        let guard = api.start_span(&parent, "handle-order");
        let child = guard.context().span().span_context().clone();
        assert_eq!(child.trace_id(), TraceId::from_bytes([7; 16]));
        assert_ne!(child.span_id(), SpanId::from_bytes([3; 8]));
        guard.end();
    }

    #[test]
    fn span_operations_tolerate_a_spanless_context() {
        let api = test_api();
        let empty = Context::new();

        api.record_error(&empty, &std::io::Error::other("nope"));
        api.set_attributes(&empty, [KeyValue::new("k", "v")]);
        api.add_event(&empty, "event", Vec::new());
        api.set_status(&empty, Status::Ok);
    }

    #[test]
    fn in_span_parents_off_the_given_context() {
        let api = test_api();
        let parent = remote_parent();

        let trace_id = api.in_span(&parent, "lookup", |cx| {
            cx.span().span_context().trace_id()
        });
        assert_eq!(trace_id, TraceId::from_bytes([7; 16]));
    }

    #[test]
    fn dropping_the_guard_ends_the_span() {
        let api = test_api();
        {
            let _guard = api.start_span_with_attributes(
                &Context::new(),
                "short-lived",
                vec![KeyValue::new("step", "setup")],
            );
        }
        // Reaching here without panicking is the assertion; the span ended in
        // the drop.
    }
}
