use crate::config::{LoggingConfig, Section};
use anyhow::Context;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::{IsTerminal, Write},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};
use tracing::Level;
use tracing_subscriber::{
    filter::{FilterFn, LevelFilter, Targets},
    fmt,
    layer::SubscriberExt,
    reload, Layer, Registry,
};

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};

// -------- level helpers --------
fn parse_tracing_level(s: &str) -> Option<tracing::Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" => None,
        _ => Some(Level::INFO),
    }
}

// -------- filtering functions --------

type CrateFilter = FilterFn<Box<dyn Fn(&tracing::Metadata<'_>) -> bool + Send + Sync + 'static>>;

fn create_default_filter_for_crates(crate_names: &[String], max_level: Level) -> CrateFilter {
    let crates = crate_names.to_vec();
    FilterFn::new(Box::new(move |meta: &tracing::Metadata<'_>| {
        let t = meta.target();
        // If the target belongs to any of the listed crates, it's not default
        if crates.iter().any(|c| matches_crate_prefix(t, c)) {
            return false;
        }
        meta.level() <= &max_level
    }))
}

/// Returns true if target == crate_name or target starts with "crate_name::"
fn matches_crate_prefix(target: &str, crate_name: &str) -> bool {
    target == crate_name
        || (target.starts_with(crate_name) && target[crate_name.len()..].starts_with("::"))
}

// -------- rotating writer for files --------
#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

#[derive(Clone)]
struct RotWriterHandle(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl Write for RotWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

// A writer handle that may be None (drops writes)
struct RoutedWriterHandle(Option<RotWriterHandle>);

impl Write for RoutedWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.0 {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.0 {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Route log records to different files by target prefix.
#[derive(Clone)]
struct MultiFileRouter {
    default: Option<RotWriter>,
    by_prefix: HashMap<String, RotWriter>,
}

impl MultiFileRouter {
    fn resolve_for(&self, target: &str) -> Option<RotWriterHandle> {
        self.by_prefix
            .iter()
            .find(|(crate_name, _)| matches_crate_prefix(target, crate_name))
            .map(|(_, wr)| wr)
            .or(self.default.as_ref())
            .map(|w| RotWriterHandle(w.0.clone()))
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for MultiFileRouter {
    type Writer = RoutedWriterHandle;

    fn make_writer(&'a self) -> Self::Writer {
        RoutedWriterHandle(self.default.as_ref().map(|w| RotWriterHandle(w.0.clone())))
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        RoutedWriterHandle(self.resolve_for(meta.target()))
    }
}

// -------- config extraction --------

struct ConfigData<'a> {
    default_section: Option<&'a Section>,
    crate_sections: Vec<(String, &'a Section)>,
    crate_names: Vec<String>,
}

fn extract_config_data(cfg: &LoggingConfig) -> ConfigData<'_> {
    let crate_sections = cfg
        .iter()
        .filter(|(k, _)| k.as_str() != "default")
        .map(|(k, v)| (k.clone(), v))
        .collect::<Vec<_>>();

    let crate_names = crate_sections.iter().map(|(n, _)| n.clone()).collect();

    ConfigData {
        default_section: cfg.get("default"),
        crate_sections,
        crate_names,
    }
}

// -------- path resolution helpers --------

/// Absolute paths are kept as-is; relative paths are joined with `base_dir`.
fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

/// Create a rotating writer, ensuring the parent directory exists.
fn create_rotating_writer_at_path(
    log_path: &Path,
    max_bytes: usize,
    max_files: usize,
) -> anyhow::Result<RotWriter> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create log directory {}", parent.display()))?;
    }

    let rot = FileRotate::new(
        log_path,
        AppendTimestamp::default(FileLimit::MaxFiles(max_files)),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        #[cfg(unix)]
        None, // file permissions (Unix only)
    );

    Ok(RotWriter(Arc::new(Mutex::new(rot))))
}

fn create_file_writer(subsystem: &str, section: &Section, base_dir: &Path) -> Option<RotWriter> {
    if section.file.trim().is_empty() {
        return None;
    }

    let max_bytes = section.max_size_mb.unwrap_or(100) * 1024 * 1024;
    let max_files = section.max_backups.unwrap_or(3);
    let log_path = resolve_log_path(&section.file, base_dir);

    match create_rotating_writer_at_path(&log_path, max_bytes as usize, max_files) {
        Ok(writer) => Some(writer),
        Err(e) => {
            // The subscriber is not installed yet.
            eprintln!(
                "Failed to init log file for subsystem '{}': {} ({e:#})",
                subsystem,
                log_path.to_string_lossy(),
            );
            None
        }
    }
}

// -------- reloadable tracing slot --------

/// Layer slot below the fmt layers. Empty until a tracing exporter is installed.
pub type TracingSlot = Option<Box<dyn Layer<Registry> + Send + Sync>>;

type Base = tracing_subscriber::layer::Layered<reload::Layer<TracingSlot, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync>;

/// Handle to the process subscriber, published into the application context
/// so a telemetry module can attach a span exporter without touching globals.
#[derive(Clone)]
pub struct TracingHandle {
    slot: reload::Handle<TracingSlot, Registry>,
}

impl TracingHandle {
    /// Replace the slot with `layer`.
    pub fn install_layer<L>(&self, layer: L) -> anyhow::Result<()>
    where
        L: Layer<Registry> + Send + Sync + 'static,
    {
        self.slot
            .reload(Some(Box::new(layer) as Box<dyn Layer<Registry> + Send + Sync>))
            .context("failed to install tracing layer")
    }

    /// Empty the slot.
    pub fn clear(&self) -> anyhow::Result<()> {
        self.slot
            .reload(None)
            .context("failed to remove tracing layer")
    }
}

static TRACING: OnceLock<TracingHandle> = OnceLock::new();

// -------- public init --------

/// Initialize logging from a configuration, once per process.
/// - `cfg`: LoggingConfig containing the logging sections
/// - `base_dir`: base directory used to resolve relative log file paths (usually server.home_dir)
///
/// Later calls return the handle of the first initialization.
pub fn init_logging_from_config(cfg: &LoggingConfig, base_dir: &Path) -> TracingHandle {
    TRACING
        .get_or_init(|| install_subscriber(cfg, base_dir))
        .clone()
}

fn install_subscriber(cfg: &LoggingConfig, base_dir: &Path) -> TracingHandle {
    // Bridge `log` → `tracing` *before* installing the subscriber
    let _ = tracing_log::LogTracer::init();

    let (slot_layer, slot) = reload::Layer::new(None);
    let layers = if cfg.is_empty() {
        build_logging_layers(&extract_config_data(&crate::config::default_logging_config()), base_dir)
    } else {
        build_logging_layers(&extract_config_data(cfg), base_dir)
    };

    let subscriber = Registry::default().with(slot_layer).with(layers);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("global tracing subscriber already set; keeping the existing one");
    }

    TracingHandle { slot }
}

fn build_console_targets(config: &ConfigData) -> Targets {
    let mut targets = Targets::new().with_default(LevelFilter::OFF);

    for (crate_name, section) in &config.crate_sections {
        if let Some(level) = parse_tracing_level(&section.console_level) {
            targets = targets.with_target(crate_name.clone(), LevelFilter::from_level(level));
        }
    }

    targets
}

fn build_file_targets(config: &ConfigData) -> Targets {
    let mut targets = Targets::new().with_default(LevelFilter::OFF);

    for (crate_name, section) in &config.crate_sections {
        if section.file.trim().is_empty() {
            continue;
        }
        if let Some(level) = parse_tracing_level(&section.file_level) {
            targets = targets.with_target(crate_name.clone(), LevelFilter::from_level(level));
        }
    }

    targets
}

fn build_file_router(config: &ConfigData, base_dir: &Path) -> MultiFileRouter {
    let mut router = MultiFileRouter {
        default: None,
        by_prefix: HashMap::new(),
    };

    if let Some(section) = config.default_section {
        router.default = create_file_writer("default", section, base_dir);
    }

    for (crate_name, section) in &config.crate_sections {
        if let Some(writer) = create_file_writer(crate_name, section, base_dir) {
            router.by_prefix.insert(crate_name.clone(), writer);
        }
    }

    router
}

/// Console and JSON file layers: explicit subsystems first, then the
/// catch-all `default` section for every other target.
fn build_logging_layers(config: &ConfigData, base_dir: &Path) -> Vec<BoxedLayer> {
    let ansi = std::io::stdout().is_terminal();
    let file_router = build_file_router(config, base_dir);

    let mut layers: Vec<BoxedLayer> = Vec::new();

    layers.push(
        fmt::layer()
            .with_ansi(ansi)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_filter(build_console_targets(config))
            .boxed(),
    );

    if !file_router.is_empty() {
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_writer(file_router.clone())
                .with_filter(build_file_targets(config))
                .boxed(),
        );
    }

    let Some(default_section) = config.default_section else {
        return layers;
    };

    if let Some(console_level) = parse_tracing_level(&default_section.console_level) {
        layers.push(
            fmt::layer()
                .with_ansi(ansi)
                .with_target(true)
                .with_level(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_filter(create_default_filter_for_crates(
                    &config.crate_names,
                    console_level,
                ))
                .boxed(),
        );
    }

    if file_router.default.is_some() {
        if let Some(file_level) = parse_tracing_level(&default_section.file_level) {
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_writer(file_router)
                    .with_filter(create_default_filter_for_crates(
                        &config.crate_names,
                        file_level,
                    ))
                    .boxed(),
            );
        }
    }

    layers
}

// =================== tests ===================
