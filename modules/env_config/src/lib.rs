//! Environment collaborator.
//!
//! An Initializer that walks every Configurable module and fills its
//! configuration from environment variables at the `Environment` layer, so a
//! value from the config file or a CLI flag is never overwritten.
//!
//! For a module whose section is `http` and a key `address`, the variable is
//! `{PREFIX}HTTP_ADDRESS`. Extra names declared with
//! [`modkit::ConfigCell::with_env_alias`] are looked up as `{PREFIX}{ALIAS}`.

use anyhow::Context;
use async_trait::async_trait;
use modkit::{AppContext, ConfigLayer, ConfigTarget, Initializer, Module, ModuleDef};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

mod coerce;

pub use coerce::coerce;

/// Reads module configuration from the process environment, with an optional
/// variable prefix and a seed map that takes precedence over the process.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    prefix: String,
    seed: HashMap<String, String>,
}

impl EnvConfig {
    pub fn new(prefix: Option<&str>, seed: HashMap<String, String>) -> Self {
        Self {
            prefix: prefix.unwrap_or_default().to_string(),
            seed,
        }
    }

    /// Seed first, then the process environment. Empty values count as unset.
    fn lookup(&self, var: &str) -> Option<String> {
        self.seed
            .get(var)
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| std::env::var(var).ok().filter(|v| !v.is_empty()))
    }

    fn var_name(&self, parts: &[&str]) -> String {
        let mut name = self.prefix.clone();
        name.push_str(&parts.join("_"));
        name.to_uppercase()
    }

    /// Environment values for every top-level key of `target`, coerced to the
    /// key's current JSON type.
    pub fn collect(&self, target: &dyn ConfigTarget) -> anyhow::Result<Map<String, Value>> {
        let snapshot = match target.snapshot()? {
            Value::Object(map) => map,
            other => anyhow::bail!(
                "configuration '{}' is not a mapping: {other}",
                target.section()
            ),
        };

        let aliases: HashMap<&str, &str> = target
            .env_aliases()
            .iter()
            .map(|(var, key)| (key.as_str(), var.as_str()))
            .collect();

        let mut values = Map::new();
        for (key, current) in &snapshot {
            let var = self.var_name(&[target.section(), key]);
            let raw = self.lookup(&var).map(|raw| (var, raw)).or_else(|| {
                let alias = *aliases.get(key.as_str())?;
                let alias = self.var_name(&[alias]);
                self.lookup(&alias).map(|raw| (alias, raw))
            });
            let Some((var, raw)) = raw else {
                continue;
            };
            let value = coerce(&raw, current).with_context(|| format!("invalid value in {var}"))?;
            values.insert(key.clone(), value);
        }
        Ok(values)
    }

    /// Collect and apply at the `Environment` layer. Returns the keys written.
    pub fn apply(&self, target: &dyn ConfigTarget) -> anyhow::Result<Vec<String>> {
        let values = self.collect(target)?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        target.apply(ConfigLayer::Environment, values)
    }
}

#[async_trait]
impl Module for EnvConfig {
    async fn start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Initializer for EnvConfig {
    async fn initialize(&self, ctx: AppContext) -> anyhow::Result<AppContext> {
        let Some(app) = ctx.app() else {
            return Ok(ctx);
        };

        app.controller().try_range(|entry| -> anyhow::Result<()> {
            let Some(configurable) = &entry.config else {
                return Ok(());
            };
            let target = configurable
                .config()
                .with_context(|| format!("failed to config for module \"{}\"", entry.name))?;
            let written = self.apply(target).with_context(|| {
                format!("failed to parse environment for module \"{}\"", entry.name)
            })?;
            if !written.is_empty() {
                tracing::debug!(module = %entry.name, keys = ?written, "Configuration read from environment");
            }
            Ok(())
        })?;

        Ok(ctx)
    }
}

impl From<EnvConfig> for ModuleDef {
    fn from(env: EnvConfig) -> Self {
        ModuleDef::builder(Arc::new(env)).initializer().build()
    }
}
