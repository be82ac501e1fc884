//! HTTP host module.
//!
//! During `start` it assembles one router: `/metrics`, `/api/health`, the
//! optional static content root and the routes of every `Routable` module,
//! wrapped in the global middleware stack. `post_start` binds the listener and
//! serves it in a background task; `stop` drains connections within
//! `shutdown_timeout`.

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    http::{header, HeaderValue, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use futures::FutureExt;
use modkit::{
    AppContext, ConfigCell, ConfigTarget, Configurable, Lifecycle, Module, ModuleDef, PostStarter,
};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    services::ServeDir,
    set_header::SetResponseHeaderLayer,
    timeout::{RequestBodyTimeoutLayer, TimeoutLayer},
};

mod config;
pub mod metrics;
pub mod request_id;
pub mod trace;
mod web;

pub use config::{resolve_addr, HttpConfig};
pub use metrics::HttpMetrics;

/// The HTTP collaborator: Configurable (`http`) and PostStarter.
pub struct HttpServer {
    cfg: ConfigCell<HttpConfig>,
    content: Option<PathBuf>,
    router: Mutex<Option<Router>>,
    handle: Mutex<Option<axum_server::Handle>>,
    local_addr: Mutex<Option<SocketAddr>>,
    server: Lifecycle,
}

impl HttpServer {
    /// `content` is served as the static fallback when set.
    pub fn new(content: Option<PathBuf>) -> Self {
        Self {
            cfg: ConfigCell::new("http", HttpConfig::default())
                .with_env_alias("HTTP_ADDRESS", "address")
                .with_env_alias("HTTPS_CERTIFICATE", "cert_file")
                .with_env_alias("HTTPS_KEY", "key_file"),
            content,
            router: Mutex::new(None),
            handle: Mutex::new(None),
            local_addr: Mutex::new(None),
            server: Lifecycle::new(),
        }
    }

    /// Registration definition that keeps this handle usable by the caller.
    pub fn definition(self: &Arc<Self>) -> ModuleDef {
        ModuleDef::builder(self.clone())
            .configurable()
            .post_starter()
            .build()
    }

    pub fn current(&self) -> Arc<HttpConfig> {
        self.cfg.get()
    }

    /// Bound address once `post_start` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Build the full router for the application in `ctx`.
    pub fn build_router(&self, ctx: &AppContext) -> anyhow::Result<Router> {
        let cfg = self.cfg.get();
        let (name, version) = match ctx.app() {
            Some(app) => (app.name().to_string(), app.version().to_string()),
            None => (
                env!("CARGO_PKG_NAME").to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
        };

        let registry = match ctx.client::<prometheus::Registry>() {
            Ok(shared) => (*shared).clone(),
            Err(_) => prometheus::Registry::new(),
        };
        let http_metrics = HttpMetrics::register(registry)?;

        let mut router = Router::new()
            .route("/metrics", get(metrics::serve_metrics))
            .with_state(http_metrics.clone())
            .route("/api/health", get(web::health_check));

        if let Some(dir) = &self.content {
            tracing::debug!(content = %dir.display(), "Serving static content");
            router = router.fallback_service(ServeDir::new(dir));
        }

        if let Some(app) = ctx.app() {
            let routables = app.controller().routables();
            for entry in &routables {
                let Some(routable) = &entry.routes else {
                    continue;
                };
                router = routable
                    .route(ctx, router)
                    .with_context(|| format!("failed to route for module \"{}\"", entry.name))?;
                tracing::debug!(module = %entry.name, "Routes registered");
            }
            for entry in &routables {
                let Some(routable) = &entry.routes else {
                    continue;
                };
                router = routable
                    .decorate(ctx, router)
                    .with_context(|| format!("failed to route for module \"{}\"", entry.name))?;
            }
        }

        let server_header = HeaderValue::from_str(&format!("{name}/{version}"))
            .with_context(|| format!("invalid server header \"{name}/{version}\""))?;
        let x_request_id = request_id::header();

        // Registration order is innermost first.
        router = router
            .layer(RequestBodyTimeoutLayer::new(cfg.read_timeout))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::SERVICE_UNAVAILABLE,
                cfg.write_timeout,
            ))
            .layer(from_fn_with_state(http_metrics, metrics::record))
            .layer(CatchPanicLayer::custom(web::handle_panic))
            .layer(SetResponseHeaderLayer::overriding(
                header::SERVER,
                server_header,
            ))
            .layer(from_fn(request_id::push_req_id_to_extensions));
        router = trace::apply_trace_layer(router);
        router = router
            .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
            .layer(SetRequestIdLayer::new(x_request_id, request_id::MakeReqId));

        Ok(router)
    }
}

impl From<HttpServer> for ModuleDef {
    fn from(server: HttpServer) -> Self {
        Arc::new(server).definition()
    }
}

/// TCP keep-alive period for accepted connections.
const TCP_KEEPALIVE: Duration = Duration::from_secs(3 * 60);

/// Listening socket with TCP keep-alive, so dead peers eventually go away.
fn bind_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[async_trait]
impl Module for HttpServer {
    async fn start(&self, ctx: &AppContext) -> anyhow::Result<()> {
        let router = self.build_router(ctx)?;
        *self.router.lock() = Some(router);
        Ok(())
    }

    async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        let grace = self.cfg.get().shutdown_timeout;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.graceful_shutdown(Some(grace));
        }
        let reason = self.server.stop(grace).await?;
        tracing::debug!(?reason, "HTTP server task stopped");
        *self.local_addr.lock() = None;
        Ok(())
    }
}

impl Configurable for HttpServer {
    fn config(&self) -> anyhow::Result<&dyn ConfigTarget> {
        Ok(&self.cfg)
    }
}

#[async_trait]
impl PostStarter for HttpServer {
    async fn post_start(&self, ctx: &AppContext) -> anyhow::Result<()> {
        let cfg = self.cfg.get();
        let router = self
            .router
            .lock()
            .take()
            .context("http router is not built")?;

        let addr = resolve_addr(&cfg.address)
            .await
            .with_context(|| format!("failed to listen on \"{}\"", cfg.address))?;
        let listener = bind_listener(addr)
            .with_context(|| format!("failed to listen on \"{}\"", cfg.address))?;
        let local = listener.local_addr()?;

        let tls = match cfg.tls_files() {
            Some((cert, key)) => Some(
                axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .with_context(|| format!("failed to load certificate \"{cert}\" / \"{key}\""))?,
            ),
            None => None,
        };
        if tls.is_some() {
            tracing::info!(url = %format!("https://{local}"), "HTTPS Server Listening");
        } else {
            tracing::info!(url = %format!("http://{local}"), "HTTP Server Listening");
        }

        let handle = axum_server::Handle::new();
        *self.handle.lock() = Some(handle.clone());
        *self.local_addr.lock() = Some(local);

        let serve_ctx = ctx.clone();
        let grace = cfg.shutdown_timeout;
        self.server.start_with_ready_and_token(
            ctx.cancellation_token().child_token(),
            move |cancel, ready| async move {
                let app = router.into_make_service();
                let serve = match tls {
                    Some(tls) => axum_server::from_tcp_rustls(listener, tls)
                        .handle(handle.clone())
                        .serve(app)
                        .boxed(),
                    None => axum_server::from_tcp(listener)
                        .handle(handle.clone())
                        .serve(app)
                        .boxed(),
                };
                ready.notify();

                let watcher = tokio::spawn(async move {
                    cancel.cancelled().await;
                    handle.graceful_shutdown(Some(grace));
                });
                let result = AssertUnwindSafe(serve).catch_unwind().await;
                watcher.abort();

                match result {
                    Ok(Ok(())) => tracing::debug!("HTTP server closed"),
                    Ok(Err(e)) => serve_ctx
                        .exit_or_abort(anyhow::Error::new(e).context("http server failed to serve")),
                    Err(panic) => serve_ctx.exit_or_abort(anyhow::anyhow!(
                        "http server failed to serve: panic: {}",
                        web::panic_message(panic.as_ref())
                    )),
                }
                Ok(())
            },
        )?;
        Ok(())
    }
}
