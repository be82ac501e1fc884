use axum::http::{HeaderMap, Request};
use axum::{body::Body, Router};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::field::Empty;

use crate::request_id;

/// W3C Trace Context header name
pub const TRACEPARENT: &str = "traceparent";

/// Trace id of an inbound `traceparent` (`00-<trace-id>-<span-id>-<flags>`).
pub fn trace_id_from_headers(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(TRACEPARENT)?.to_str().ok()?;
    let mut parts = value.split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let _flags = parts.next()?;

    let valid = version.len() == 2
        && trace_id.len() == 32
        && span_id.len() == 16
        && trace_id.bytes().all(|b| b.is_ascii_hexdigit())
        && trace_id.bytes().any(|b| b != b'0');
    valid.then_some(trace_id)
}

/// Opens an `http_request` span per request and records status and latency on response.
pub fn apply_trace_layer(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request<Body>| {
                let rid = req
                    .headers()
                    .get(request_id::header())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("n/a");
                let trace_id = trace_id_from_headers(req.headers()).unwrap_or("");
                tracing::info_span!(
                    "http_request",
                    method = %req.method(),
                    path = %req.uri().path(),
                    version = ?req.version(),
                    request_id = %rid,
                    trace_id = %trace_id,
                    status = Empty,
                    latency_ms = Empty
                )
            })
            .on_response(
                |res: &axum::http::Response<Body>, latency: Duration, span: &tracing::Span| {
                    span.record("status", res.status().as_u16());
                    span.record("latency_ms", latency.as_millis() as u64);
                    tracing::debug!("request finished");
                },
            ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TRACEPARENT, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn extracts_trace_id() {
        let headers = headers_with("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01");
        assert_eq!(
            trace_id_from_headers(&headers),
            Some("4bf92f3577b34da6a3ce929d0e0e4736")
        );
    }

    #[test]
    fn missing_header_is_none() {
        assert!(trace_id_from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn malformed_values_are_ignored() {
        for bad in [
            "invalid-trace-context",
            "00-4bf92f35-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-zzf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        ] {
            assert!(trace_id_from_headers(&headers_with(bad)).is_none(), "{bad}");
        }
    }
}
