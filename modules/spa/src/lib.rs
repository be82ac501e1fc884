//! Single page application support.
//!
//! A Routable that rewrites 404 responses for HTML navigations into the SPA
//! index, so client-side routes like `/settings/profile` load the app.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::Response,
    Router,
};
use modkit::{AppContext, Module, ModuleDef, Routable};
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_INDEX: &str = "index.html";

pub struct Spa {
    index_path: Arc<PathBuf>,
}

impl Spa {
    /// Serve `index.html` from `root` as the fallback page.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_index(root, DEFAULT_INDEX)
    }

    pub fn with_index(root: impl Into<PathBuf>, index: &str) -> Self {
        let index = if index.is_empty() { DEFAULT_INDEX } else { index };
        Self {
            index_path: Arc::new(root.into().join(index)),
        }
    }

    pub fn index_path(&self) -> &std::path::Path {
        &self.index_path
    }
}

fn accepts_html(req: &Request) -> bool {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

/// Replace an HTML 404 with the index page. Other headers of the inner response are kept.
async fn rewrite_not_found(
    State(index_path): State<Arc<PathBuf>>,
    req: Request,
    next: Next,
) -> Response {
    let wants_html = accepts_html(&req);
    let response = next.run(req).await;
    if !wants_html || response.status() != StatusCode::NOT_FOUND {
        return response;
    }

    let index = match tokio::fs::read(index_path.as_path()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(index = %index_path.display(), error = %e, "SPA index not readable");
            return response;
        }
    };

    let (mut parts, _) = response.into_parts();
    parts.status = StatusCode::OK;
    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    Response::from_parts(parts, Body::from(index))
}

#[async_trait]
impl Module for Spa {
    async fn start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Routable for Spa {
    fn route(&self, _ctx: &AppContext, router: Router) -> anyhow::Result<Router> {
        Ok(router)
    }

    /// Applied after every module's routes, so their 404s are rewritten too.
    fn decorate(&self, _ctx: &AppContext, router: Router) -> anyhow::Result<Router> {
        Ok(router.layer(from_fn_with_state(
            self.index_path.clone(),
            rewrite_not_found,
        )))
    }
}

impl From<Spa> for ModuleDef {
    fn from(spa: Spa) -> Self {
        ModuleDef::builder(Arc::new(spa)).routable().build()
    }
}
