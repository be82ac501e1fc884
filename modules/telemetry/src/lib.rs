//! OpenTelemetry collaborator.
//!
//! Publishes a `prometheus::Registry` labelled with the service identity for
//! the HTTP host's `/metrics`, and, when `otel.grpc_address` is set, exports
//! spans over OTLP/gRPC by installing a `tracing-opentelemetry` layer into the
//! logging subscriber's reload slot.

use anyhow::Context;
use async_trait::async_trait;
use modkit::{AppContext, ConfigCell, ConfigTarget, Configurable, Initializer, Module, ModuleDef};
use opentelemetry::{trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
use parking_lot::Mutex;
use runtime::TracingHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Section `otel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OtelConfig {
    /// OTLP gRPC collector, e.g. `127.0.0.1:4317`. Empty disables span export.
    pub grpc_address: String,
    /// Fraction of root traces to sample.
    pub sample_ratio: f64,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            grpc_address: String::new(),
            sample_ratio: 1.0,
        }
    }
}

impl OtelConfig {
    fn endpoint(&self) -> String {
        let addr = self.grpc_address.trim();
        if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        }
    }

    fn sampler(&self) -> Sampler {
        if self.sample_ratio >= 1.0 {
            Sampler::ParentBased(Box::new(Sampler::AlwaysOn))
        } else {
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(self.sample_ratio)))
        }
    }
}

pub struct Telemetry {
    cfg: ConfigCell<OtelConfig>,
    provider: Mutex<Option<SdkTracerProvider>>,
    tracing: Mutex<Option<Arc<TracingHandle>>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            cfg: ConfigCell::new("otel", OtelConfig::default())
                .with_env_alias("OTEL_GRPC_ADDRESS", "grpc_address"),
            provider: Mutex::new(None),
            tracing: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Arc<OtelConfig> {
        self.cfg.get()
    }

    /// Whether a span exporter is running.
    pub fn is_exporting(&self) -> bool {
        self.provider.lock().is_some()
    }
}

/// Registry whose series all carry `service_name` and `service_version`.
pub fn service_registry(name: &str, version: &str) -> anyhow::Result<prometheus::Registry> {
    let labels = HashMap::from([
        ("service_name".to_string(), name.to_string()),
        ("service_version".to_string(), version.to_string()),
    ]);
    prometheus::Registry::new_custom(None, Some(labels))
        .context("failed to initialize metrics registry")
}

fn build_tracer_provider(
    cfg: &OtelConfig,
    name: &str,
    version: &str,
) -> anyhow::Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(cfg.endpoint())
        .build()
        .context("failed to create grpc trace exporter")?;

    let resource = Resource::builder_empty()
        .with_attributes([
            KeyValue::new("service.name", name.to_string()),
            KeyValue::new("service.version", version.to_string()),
        ])
        .build();

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(cfg.sampler())
        .with_resource(resource)
        .build())
}

#[async_trait]
impl Module for Telemetry {
    async fn start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        let provider = self.provider.lock().take();
        if let Some(provider) = provider {
            let flush = tokio::task::spawn_blocking(move || {
                if let Err(e) = provider.force_flush() {
                    tracing::warn!(error = %e, "Failed to flush spans");
                }
                provider.shutdown()
            });
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, flush).await {
                Ok(Ok(Ok(()))) => tracing::debug!("Tracer provider shut down"),
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Failed to shut down tracer provider"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Tracer provider shutdown task failed"),
                Err(_) => tracing::warn!("Tracer provider shutdown timed out"),
            }
        }

        let handle = self.tracing.lock().take();
        if let Some(handle) = handle {
            handle.clear()?;
        }
        Ok(())
    }
}

impl Configurable for Telemetry {
    fn config(&self) -> anyhow::Result<&dyn ConfigTarget> {
        Ok(&self.cfg)
    }
}

#[async_trait]
impl Initializer for Telemetry {
    async fn initialize(&self, ctx: AppContext) -> anyhow::Result<AppContext> {
        let (name, version) = match ctx.app() {
            Some(app) => (app.name().to_string(), app.version().to_string()),
            None => (
                env!("CARGO_PKG_NAME").to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
        };

        let registry = service_registry(&name, &version)?;
        let ctx = ctx.with_client(Arc::new(registry));

        let cfg = self.cfg.get();
        if cfg.grpc_address.trim().is_empty() {
            tracing::debug!("OTLP export disabled");
            return Ok(ctx);
        }

        let provider = build_tracer_provider(&cfg, &name, &version)?;
        match ctx.client::<TracingHandle>() {
            Ok(handle) => {
                let layer = tracing_opentelemetry::layer().with_tracer(provider.tracer(name.clone()));
                handle.install_layer(layer)?;
                *self.tracing.lock() = Some(handle);
                tracing::info!(endpoint = %cfg.endpoint(), "Exporting spans over OTLP");
            }
            Err(_) => {
                tracing::warn!("No tracing handle in context; spans will not be exported");
            }
        }
        *self.provider.lock() = Some(provider);

        Ok(ctx)
    }
}

impl From<Telemetry> for ModuleDef {
    fn from(telemetry: Telemetry) -> Self {
        ModuleDef::builder(Arc::new(telemetry))
            .configurable()
            .initializer()
            .build()
    }
}
