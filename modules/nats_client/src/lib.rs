//! NATS collaborator.
//!
//! Connects during Initialize when `nats.address` is set and publishes the
//! `async_nats::Client` into the context for the modules after it.

use anyhow::Context;
use async_nats::{AuthError, Client, ConnectOptions};
use async_trait::async_trait;
use modkit::{AppContext, ConfigCell, ConfigTarget, Configurable, Initializer, Module, ModuleDef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Section `nats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NatsConfig {
    /// Connection name reported to the server. Defaults to `{app}-{pid}`.
    pub name: String,
    /// Server URL, e.g. `nats://127.0.0.1:4222`. Empty disables the client.
    pub address: String,
    /// Plain token, or the user JWT when `secret` is set.
    pub token: String,
    /// NKey seed that signs the server nonce for JWT auth.
    pub secret: String,
    pub credentials_file: String,
}

impl NatsConfig {
    fn connection_name(&self, app: &str) -> String {
        if self.name.is_empty() {
            format!("{app}-{}", std::process::id())
        } else {
            self.name.clone()
        }
    }
}

/// Client options for `cfg`. Connection retries are always on.
pub async fn connect_options(cfg: &NatsConfig, app: &str) -> anyhow::Result<ConnectOptions> {
    let mut opts = ConnectOptions::new()
        .name(cfg.connection_name(app))
        .retry_on_initial_connect();

    if !cfg.token.is_empty() {
        if cfg.secret.is_empty() {
            opts = opts.token(cfg.token.clone());
        } else {
            let key = Arc::new(
                nkeys::KeyPair::from_seed(&cfg.secret).context("invalid nats secret seed")?,
            );
            opts = opts.jwt(cfg.token.clone(), move |nonce| {
                let key = key.clone();
                async move { key.sign(&nonce).map_err(AuthError::new) }
            });
        }
    }

    if !cfg.credentials_file.is_empty() {
        opts = opts
            .credentials_file(&cfg.credentials_file)
            .await
            .with_context(|| format!("failed to read credentials file {}", cfg.credentials_file))?;
    }

    Ok(opts)
}

pub struct NatsClient {
    cfg: ConfigCell<NatsConfig>,
    client: Mutex<Option<Client>>,
}

impl NatsClient {
    pub fn new() -> Self {
        Self {
            cfg: ConfigCell::new("nats", NatsConfig::default()),
            client: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Arc<NatsConfig> {
        self.cfg.get()
    }

    pub fn client(&self) -> Option<Client> {
        self.client.lock().clone()
    }
}

impl Default for NatsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for NatsClient {
    async fn start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        let Some(client) = self.client.lock().take() else {
            return Ok(());
        };
        // Draining unsubscribes, flushes and closes the connection, also for
        // the clones other modules got from the context. A pending client
        // drains once it connects.
        tracing::debug!(state = ?client.connection_state(), "Draining NATS client");
        match tokio::time::timeout(DRAIN_TIMEOUT, client.drain()).await {
            Ok(res) => res.context("failed to drain nats client")?,
            Err(_) => tracing::warn!("Timed out draining NATS client"),
        }
        Ok(())
    }
}

impl Configurable for NatsClient {
    fn config(&self) -> anyhow::Result<&dyn ConfigTarget> {
        Ok(&self.cfg)
    }
}

#[async_trait]
impl Initializer for NatsClient {
    async fn initialize(&self, ctx: AppContext) -> anyhow::Result<AppContext> {
        let cfg = self.cfg.get();
        if cfg.address.is_empty() {
            return Ok(ctx);
        }

        let app = ctx
            .app()
            .map(|app| app.name().to_string())
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        let client = connect_options(&cfg, &app)
            .await?
            .connect(cfg.address.as_str())
            .await
            .context("failed to connect to nats server")?;

        tracing::info!(address = %cfg.address, state = ?client.connection_state(), "NATS client ready");
        *self.client.lock() = Some(client.clone());
        Ok(ctx.with_client(Arc::new(client)))
    }
}

impl From<NatsClient> for ModuleDef {
    fn from(nats: NatsClient) -> Self {
        ModuleDef::builder(Arc::new(nats))
            .configurable()
            .initializer()
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_defaults_to_app_and_pid() {
        let cfg = NatsConfig::default();
        assert_eq!(
            cfg.connection_name("demo"),
            format!("demo-{}", std::process::id())
        );

        let cfg = NatsConfig {
            name: "worker".into(),
            ..Default::default()
        };
        assert_eq!(cfg.connection_name("demo"), "worker");
    }

    #[tokio::test]
    async fn bad_seed_is_rejected() {
        let cfg = NatsConfig {
            token: "jwt".into(),
            secret: "not-a-seed".into(),
            ..Default::default()
        };
        let err = connect_options(&cfg, "demo").await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid nats secret seed"));
    }

    #[tokio::test]
    async fn missing_credentials_file_is_an_error() {
        let cfg = NatsConfig {
            credentials_file: "/nonexistent/user.creds".into(),
            ..Default::default()
        };
        let err = connect_options(&cfg, "demo").await.unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/user.creds"));
    }

    #[tokio::test]
    async fn seed_and_token_build_options() {
        let seed = nkeys::KeyPair::new_user().seed().unwrap();
        let cfg = NatsConfig {
            token: "eyJ0eXAiOiJKV1QifQ".into(),
            secret: seed,
            ..Default::default()
        };
        assert!(connect_options(&cfg, "demo").await.is_ok());
    }
}
