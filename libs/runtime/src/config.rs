use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration with strongly-typed global sections
/// and a flexible per-module configuration bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Core server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Directory containing per-module YAML files (optional).
    #[serde(default)]
    pub modules_dir: Option<String>,
    /// Per-module configuration bag: section name → arbitrary JSON/YAML value.
    #[serde(default)]
    pub modules: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Base directory for relative paths (log files). Normalized to an absolute path.
    pub home_dir: String,
    /// Bound for each module's stop call.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            home_dir: String::new(),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    pub file: String,          // "logs/api.log", empty disables the file
    pub file_level: String,
    pub max_backups: Option<usize>, // How many files to keep
    pub max_size_mb: Option<u64>,   // Max size of the file in MB
}

impl Default for Section {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            file: String::new(),
            file_level: "debug".to_string(),
            max_backups: None,
            max_size_mb: None,
        }
    }
}

/// Create a default logging configuration: console only, `info`.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert("default".to_string(), Section::default());
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: Some(default_logging_config()),
            modules_dir: None,
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    /// Also normalizes `server.home_dir` into an absolute path and creates the directory.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let path = config_path.as_ref();
        // figment treats a missing file as an empty source.
        if !path.is_file() {
            anyhow::bail!("config file not found: {}", path.display());
        }

        // Start from a minimal base where optional sections are None,
        // so they remain None unless explicitly provided by YAML/ENV.
        let base = AppConfig {
            server: ServerConfig::default(),
            logging: None,
            modules_dir: None,
            modules: HashMap::new(),
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(path))
            // Example: APP__MODULES__HTTP__ADDRESS=:9000 maps to modules.http.address
            .merge(Env::prefixed("APP__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        normalize_home_dir_inplace(&mut config.server)
            .context("Failed to resolve server.home_dir")?;

        if let Some(dir) = config.modules_dir.clone() {
            merge_module_files(&mut config.modules, dir)?;
        }

        Ok(config)
    }

    /// Load configuration from file or create with default values.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                normalize_home_dir_inplace(&mut c.server)
                    .context("Failed to resolve server.home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments. Flags land in the module
    /// sections, so they reach modules at the explicit layer.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let http_overrides: Vec<(&str, &String)> = [
            ("address", &args.address),
            ("cert_file", &args.cert_file),
            ("key_file", &args.key_file),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key, v)))
        .collect();

        if !http_overrides.is_empty() {
            let mut http = match self.modules.remove("http") {
                Some(Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            for (key, value) in http_overrides {
                http.insert(key.to_string(), Value::String(value.clone()));
            }
            self.modules.insert("http".to_string(), Value::Object(http));
        }

        // Set logging level based on verbose flags for "default" section.
        let logging = self.logging.get_or_insert_with(default_logging_config);
        let default_section = logging.entry("default".to_string()).or_default();
        default_section.console_level = match args.verbose {
            0 => default_section.console_level.clone(), // keep
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub address: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

/// Normalize `server.home_dir` into an absolute path and create it.
/// Empty means the working directory; a leading `~` expands to `$HOME`.
fn normalize_home_dir_inplace(server: &mut ServerConfig) -> Result<()> {
    let raw = server.home_dir.trim();
    let path = if raw.is_empty() {
        PathBuf::from(".")
    } else if let Some(rest) = raw.strip_prefix('~') {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .context("cannot expand '~': HOME is not set")?;
        PathBuf::from(home).join(rest.trim_start_matches(['/', '\\']))
    } else {
        PathBuf::from(raw)
    };

    let abs = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .context("cannot read working directory")?
            .join(path)
    };
    std::fs::create_dir_all(&abs)
        .with_context(|| format!("cannot create home_dir {}", abs.display()))?;

    server.home_dir = abs.to_string_lossy().to_string();
    Ok(())
}

fn merge_module_files(bag: &mut HashMap<String, Value>, dir: impl AsRef<Path>) -> Result<()> {
    use std::fs;
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext != "yml" && ext != "yaml" {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let val: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML in {}", path.display()))?;
        bag.insert(name, serde_json::to_value(val)?);
    }
    Ok(())
}

/// Serves module sections to the lifecycle runner: `logging` from the
/// logging section, everything else from `modules`.
pub struct AppConfigProvider {
    sections: HashMap<String, Value>,
}

impl AppConfigProvider {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let mut sections = config.modules.clone();
        if let Some(logging) = &config.logging {
            sections.insert(
                "logging".to_string(),
                serde_json::to_value(logging).context("Failed to serialize logging config")?,
            );
        }
        Ok(Self { sections })
    }
}

impl modkit::ConfigProvider for AppConfigProvider {
    fn get_module_config(&self, section: &str) -> Option<&Value> {
        self.sections.get(section)
    }
}
