//! Module configuration cells.
//!
//! A module exposes its configuration as a [`ConfigTarget`]: a typed value that
//! external sources (config file, CLI flags, environment) merge into before any
//! Initializer runs. Every top-level key remembers the [`ConfigLayer`] that last
//! wrote it, and a lower layer never overwrites a higher one, so precedence does
//! not depend on the order in which sources are applied.

use anyhow::Context;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Provider of module-specific configuration (raw JSON sections only).
pub trait ConfigProvider: Send + Sync {
    /// Returns raw JSON section by name, if any.
    fn get_module_config(&self, section: &str) -> Option<&Value>;
}

/// Origin of a configuration key, ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigLayer {
    Defaults,
    Environment,
    Explicit,
}

/// Type-erased view of a module configuration object.
pub trait ConfigTarget: Send + Sync {
    /// Section name, e.g. `http`. Used for file lookups and env var names.
    fn section(&self) -> &str;

    /// Extra env var names bound to top-level keys: `(VAR, key)`.
    fn env_aliases(&self) -> &[(String, String)];

    /// Current value as a JSON object.
    fn snapshot(&self) -> anyhow::Result<Value>;

    /// Merge top-level `values` at `layer`. Keys owned by a higher layer are
    /// skipped. Returns the keys that were written. On failure nothing changes.
    fn apply(&self, layer: ConfigLayer, values: Map<String, Value>) -> anyhow::Result<Vec<String>>;

    /// Layer that last wrote `key`.
    fn layer_of(&self, key: &str) -> ConfigLayer;
}

/// Stock [`ConfigTarget`] backed by a serde type and an `ArcSwap` for lock-free reads.
pub struct ConfigCell<T> {
    section: String,
    aliases: Vec<(String, String)>,
    current: ArcSwap<T>,
    origins: Mutex<HashMap<String, ConfigLayer>>,
}

impl<T> ConfigCell<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(section: impl Into<String>, defaults: T) -> Self {
        Self {
            section: section.into(),
            aliases: Vec::new(),
            current: ArcSwap::from_pointee(defaults),
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Bind an additional environment variable to a top-level key.
    #[must_use]
    pub fn with_env_alias(mut self, var: impl Into<String>, key: impl Into<String>) -> Self {
        self.aliases.push((var.into(), key.into()));
        self
    }

    /// Current configuration.
    pub fn get(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Replace the whole value programmatically. Key origins are kept.
    pub fn set(&self, value: T) {
        self.current.store(Arc::new(value));
    }
}

impl<T> ConfigTarget for ConfigCell<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn section(&self) -> &str {
        &self.section
    }

    fn env_aliases(&self) -> &[(String, String)] {
        &self.aliases
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        serde_json::to_value(&**self.current.load())
            .with_context(|| format!("failed to serialize '{}' configuration", self.section))
    }

    fn apply(&self, layer: ConfigLayer, values: Map<String, Value>) -> anyhow::Result<Vec<String>> {
        // Hold the origins lock for the whole merge so concurrent applies serialize.
        let mut origins = self.origins.lock();

        let mut merged = match self.snapshot()? {
            Value::Object(map) => map,
            other => anyhow::bail!(
                "configuration '{}' must serialize to a mapping, got {other}",
                self.section
            ),
        };

        let mut written = Vec::new();
        for (key, value) in values {
            let owner = origins.get(&key).copied().unwrap_or(ConfigLayer::Defaults);
            if owner > layer {
                tracing::debug!(section = %self.section, key = %key, ?owner, ?layer, "config key kept from higher layer");
                continue;
            }
            merged.insert(key.clone(), value);
            written.push(key);
        }

        if written.is_empty() {
            return Ok(written);
        }

        let parsed: T = serde_json::from_value(Value::Object(merged)).with_context(|| {
            format!("invalid '{}' configuration ({})", self.section, written.join(", "))
        })?;
        self.current.store(Arc::new(parsed));
        for key in &written {
            origins.insert(key.clone(), layer);
        }
        Ok(written)
    }

    fn layer_of(&self, key: &str) -> ConfigLayer {
        self.origins
            .lock()
            .get(key)
            .copied()
            .unwrap_or(ConfigLayer::Defaults)
    }
}
