use axum::{
    body::Body,
    http::{header, Response, StatusCode},
    response::Json,
};
use serde_json::{json, Value};
use std::any::Any;

/// `GET /api/health`
pub async fn health_check() -> Json<Value> {
    Json(json!({ "ok": true }))
}

pub(crate) fn panic_message(err: &(dyn Any + Send)) -> &str {
    if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        *s
    } else {
        "unknown panic"
    }
}

/// Turns a handler panic into a 500 JSON response; the message goes to the request span.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = panic_message(err.as_ref());
    tracing::error!(panic = %message, "Request handler panicked");

    let body = json!({
        "error": "Internal Server Error",
        "code": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
