use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use axum::body::Body;
use axum::http::{HeaderMap, Request};
use axum::response::Response;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracer;
use tower::{Layer, Service};

/// Tower layer that opens a server span around every request.
///
/// The span continues a remote trace when the request carries a W3C
/// `traceparent` header, otherwise it roots a new one. The resulting
/// [`Context`] is inserted into request extensions, so handlers reach it with
/// `Extension<opentelemetry::Context>` and pass it to the facades for child
/// spans and correlated logs.
#[derive(Clone)]
pub struct HttpTraceLayer {
    tracer: SdkTracer,
    propagator: Arc<TraceContextPropagator>,
}

impl HttpTraceLayer {
    pub(crate) fn new(tracer: SdkTracer) -> Self {
        HttpTraceLayer {
            tracer,
            propagator: Arc::new(TraceContextPropagator::new()),
        }
    }
}

impl<S> Layer<S> for HttpTraceLayer {
    type Service = HttpTraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpTraceService {
            inner,
            tracer: self.tracer.clone(),
            propagator: Arc::clone(&self.propagator),
        }
    }
}

/// Service produced by [`HttpTraceLayer`].
#[derive(Clone)]
pub struct HttpTraceService<S> {
    inner: S,
    tracer: SdkTracer,
    propagator: Arc<TraceContextPropagator>,
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|key| key.as_str()).collect()
    }
}

impl<S> Service<Request<Body>> for HttpTraceService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let parent = self.propagator.extract(&HeaderExtractor(req.headers()));
        let method = req.method().as_str().to_owned();
        let path = req.uri().path().to_owned();

        let mut builder = self.tracer.span_builder(format!("{method} {path}"));
        builder.span_kind = Some(SpanKind::Server);
        builder.attributes = Some(vec![
            KeyValue::new("http.request.method", method),
            KeyValue::new("url.path", path),
        ]);
        let span = self.tracer.build_with_context(builder, &parent);
        let cx = parent.with_span(span);
        req.extensions_mut().insert(cx.clone());

        // Clone-swap so the borrowed service stays ready for the next call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let result = inner.call(req).await;
            let span = cx.span();
            match &result {
                Ok(response) => {
                    let status = response.status();
                    span.set_attribute(KeyValue::new(
                        "http.response.status_code",
                        i64::from(status.as_u16()),
                    ));
                    if status.is_server_error() {
                        span.set_status(Status::error(format!("HTTP {}", status.as_u16())));
                    }
                }
                Err(_) => {
                    span.set_status(Status::error("request handler failed"));
                }
            }
            span.end();
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::Extension;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use tower::ServiceExt;

    use super::*;

    fn test_layer() -> (HttpTraceLayer, InMemorySpanExporter, SdkTracerProvider) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let layer = HttpTraceLayer::new(provider.tracer("middleware-tests"));
        (layer, exporter, provider)
    }

    #[tokio::test]
    async fn request_span_carries_method_path_and_status() {
        let (layer, exporter, _provider) = test_layer();
        let app = Router::new()
            .route("/orders", get(|| async { "ok" }))
            .layer(layer);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/orders")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "GET /orders");
        assert_eq!(span.span_kind, SpanKind::Server);
        assert_eq!(span.status, Status::Unset);
        assert!(span
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == "http.response.status_code"
                && kv.value == opentelemetry::Value::I64(200)));
    }

    #[tokio::test]
    async fn traceparent_header_continues_the_remote_trace() {
        let (layer, _exporter, _provider) = test_layer();
        let app = Router::new()
            .route(
                "/ctx",
                get(|Extension(cx): Extension<Context>| async move {
                    cx.span().span_context().trace_id().to_string()
                }),
            )
            .layer(layer);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ctx")
                    .header(
                        "traceparent",
                        "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"0af7651916cd43dd8448eb211c80319c");
    }

    #[tokio::test]
    async fn server_errors_mark_the_span_failed() {
        let (layer, exporter, _provider) = test_layer();
        let app = Router::new()
            .route("/boom", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .layer(layer);

        app.oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert!(matches!(spans[0].status, Status::Error { .. }));
    }

    #[tokio::test]
    async fn requests_without_traceparent_root_a_new_trace() {
        let (layer, exporter, _provider) = test_layer();
        let app = Router::new()
            .route("/fresh", get(|| async { "ok" }))
            .layer(layer);

        app.oneshot(
            Request::builder()
                .uri("/fresh")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].span_context.is_valid());
        assert_eq!(
            spans[0].parent_span_id,
            opentelemetry::trace::SpanId::INVALID
        );
    }
}
