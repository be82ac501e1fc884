use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

/// Request series recorded by the global middleware.
pub struct HttpMetrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: HistogramVec,
}

impl HttpMetrics {
    /// Create the series and register them into `registry`.
    pub fn register(registry: Registry) -> anyhow::Result<Arc<Self>> {
        let requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Number of HTTP requests served"),
            &["method", "status"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["method", "status"],
        )?;

        registry
            .register(Box::new(requests.clone()))
            .context("failed to register http_requests_total")?;
        registry
            .register(Box::new(duration.clone()))
            .context("failed to register http_request_duration_seconds")?;

        Ok(Arc::new(Self {
            registry,
            requests,
            duration,
        }))
    }

    fn observe(&self, method: &str, status: StatusCode, started: Instant) {
        let status = status.as_u16().to_string();
        let labels = [method, status.as_str()];
        self.requests.with_label_values(&labels).inc();
        self.duration
            .with_label_values(&labels)
            .observe(started.elapsed().as_secs_f64());
    }

    /// Registry contents in the text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .context("failed to encode metrics")?;
        String::from_utf8(buf).context("metrics are not valid UTF-8")
    }
}

/// Middleware recording `http_requests_total` and `http_request_duration_seconds`.
pub async fn record(State(metrics): State<Arc<HttpMetrics>>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let started = Instant::now();
    let response = next.run(req).await;
    metrics.observe(method.as_str(), response.status(), started);
    response
}

/// `GET /metrics`
pub async fn serve_metrics(State(metrics): State<Arc<HttpMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_shows_up_in_render() {
        let metrics = HttpMetrics::register(Registry::new()).unwrap();
        metrics.observe("GET", StatusCode::OK, Instant::now());

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"http_requests_total{method="GET",status="200"} 1"#));
        assert!(text.contains("http_request_duration_seconds_bucket"));
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        HttpMetrics::register(registry.clone()).unwrap();
        assert!(HttpMetrics::register(registry).is_err());
    }
}
