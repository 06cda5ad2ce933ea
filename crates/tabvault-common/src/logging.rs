//! Logging configuration and initialisation
//!
//! Every Tabvault component logs through `tracing` macros with structured
//! fields (`table = %name`, `key = %key`, ...). This module installs the
//! global subscriber once at process start:
//!
//! - console, daily-rotated file, or both
//! - human-readable text or JSON lines (JSON suits log aggregation of
//!   scheduled backup runs)
//! - an `EnvFilter` seeded from the configured level plus extra directives
//!
//! # Example
//!
//! ```no_run
//! use tabvault_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!
//!     info!(environment = "staging", "Backup run started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Directives applied before any configured ones. The AWS SDK logs every
/// request at debug level, which drowns out per-table progress.
pub const SDK_DIRECTIVES: &[&str] = &["aws_smithy_runtime=warn", "aws_config=warn", "hyper=warn"];

/// File name prefix used when no run name is given.
pub const DEFAULT_LOG_FILE_PREFIX: &str = "tabvault";

/// Parse `raw` case-insensitively against `(aliases, value)` pairs.
fn parse_choice<T: Copy>(kind: &str, raw: &str, choices: &[(&[&str], T)]) -> Result<T> {
    let wanted = raw.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|(aliases, _)| aliases.contains(&wanted.as_str()))
        .map(|(_, value)| *value)
        .ok_or_else(|| anyhow::anyhow!("Invalid log {}: {}", kind, raw))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice(
            "level",
            s,
            &[
                (&["trace"], LogLevel::Trace),
                (&["debug"], LogLevel::Debug),
                (&["info"], LogLevel::Info),
                (&["warn", "warning"], LogLevel::Warn),
                (&["error"], LogLevel::Error),
            ],
        )
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

impl std::str::FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice(
            "output",
            s,
            &[
                (&["console", "stdout"], LogOutput::Console),
                (&["file"], LogOutput::File),
                (&["both", "all"], LogOutput::Both),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice(
            "format",
            s,
            &[(&["text", "pretty"], LogFormat::Text), (&["json"], LogFormat::Json)],
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,

    /// Directory for rotated log files (only used when output includes file)
    pub log_dir: PathBuf,

    /// File name prefix, e.g. "tabvault-restore" -> "tabvault-restore.2025-01-15"
    pub log_file_prefix: String,

    /// Extra comma-separated directives, e.g. "tabvault_orchestrator::writer=debug"
    pub filter_directives: Option<String>,

    /// Keep AWS SDK internals at warn
    pub quiet_sdk: bool,

    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: DEFAULT_LOG_FILE_PREFIX.to_string(),
            filter_directives: None,
            quiet_sdk: true,
            include_location: false,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    ///
    /// - `LOG_LEVEL`: trace, debug, info, warn, error
    /// - `LOG_OUTPUT`: console, file, both
    /// - `LOG_FORMAT`: text, json
    /// - `LOG_DIR`, `LOG_FILE_PREFIX`, `LOG_FILTER`
    /// - `LOG_QUIET_SDK`, `LOG_INCLUDE_LOCATION`: true/false
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Overlay any `LOG_*` variables that are set onto this configuration.
    pub fn merge_env(mut self) -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(level) = var("LOG_LEVEL") {
            self.level = level.parse()?;
        }
        if let Some(output) = var("LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = var("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = var("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        self.quiet_sdk = env_flag("LOG_QUIET_SDK", self.quiet_sdk);
        self.include_location = env_flag("LOG_INCLUDE_LOCATION", self.include_location);
        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    fn directives(&self) -> Vec<&str> {
        let sdk = if self.quiet_sdk { SDK_DIRECTIVES } else { &[] };
        let configured: Vec<&str> = self
            .filter_directives
            .as_deref()
            .map(|d| d.split(',').map(str::trim).filter(|d| !d.is_empty()).collect())
            .unwrap_or_default();
        sdk.iter().copied().chain(configured).collect()
    }

    fn filter(&self) -> Result<EnvFilter> {
        let level: Level = self.level.into();
        self.directives().into_iter().try_fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| {
                let directive = directive
                    .parse()
                    .with_context(|| format!("Invalid log filter directive '{}'", directive))?;
                Ok(filter.add_directive(directive))
            },
        )
    }
}

/// Builder for LogConfig
#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    /// Name log files after one kind of run: `tabvault-<run>`.
    pub fn for_run(self, run: &str) -> Self {
        self.log_file_prefix(format!("{}-{}", DEFAULT_LOG_FILE_PREFIX, run))
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Keeps the non-blocking file writer flushing. Hold it for the lifetime of
/// the process; dropping it flushes buffered lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = config.filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.output.console() {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config, writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard { _file: file_guard })
}

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_choices() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" json ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("stdout".parse::<LogOutput>().unwrap(), LogOutput::Console);

        let err = "loud".parse::<LogLevel>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid log level: loud");
    }

    #[test]
    fn test_log_output_targets() {
        assert!(LogOutput::Both.console() && LogOutput::Both.file());
        assert!(!LogOutput::Console.file());
        assert!(!LogOutput::File.console());
    }

    #[test]
    fn test_sdk_directives_come_first() {
        let config = LogConfig::builder()
            .filter_directives("tabvault_orchestrator::writer=debug, ")
            .build();
        let directives = config.directives();

        assert_eq!(&directives[..SDK_DIRECTIVES.len()], SDK_DIRECTIVES);
        assert_eq!(directives.last(), Some(&"tabvault_orchestrator::writer=debug"));
        assert!(config.filter().is_ok());

        let loud = LogConfig {
            quiet_sdk: false,
            ..LogConfig::default()
        };
        assert!(loud.directives().is_empty());
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        let config = LogConfig::builder().filter_directives("=[").build();
        assert!(config.filter().is_err());
    }

    #[test]
    fn test_run_prefix() {
        let config = LogConfig::builder().for_run("restore").build();
        assert_eq!(config.log_file_prefix, "tabvault-restore");
    }

    #[test]
    #[serial]
    fn test_merge_env_overrides_builder_values() {
        std::env::set_var("LOG_FORMAT", "json");
        std::env::set_var("LOG_QUIET_SDK", "false");

        let config = LogConfig::builder()
            .level(LogLevel::Debug)
            .for_run("backup")
            .build()
            .merge_env()
            .unwrap();

        std::env::remove_var("LOG_FORMAT");
        std::env::remove_var("LOG_QUIET_SDK");

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, LogLevel::Debug);
        assert!(!config.quiet_sdk);
        assert_eq!(config.log_file_prefix, "tabvault-backup");
    }

    #[test]
    #[serial]
    fn test_merge_env_rejects_bad_level() {
        std::env::set_var("LOG_LEVEL", "chatty");
        let result = LogConfig::default().merge_env();
        std::env::remove_var("LOG_LEVEL");
        assert!(result.is_err());
    }
}
