//! Configuration for the dispatcher service.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::dispatch::DispatcherConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Dispatcher tuning as it appears in config files and the environment.
///
/// Durations are plain millisecond/second counts here and become
/// `std::time::Duration`s in `DispatcherConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSettings {
    /// Maximum number of queued (not yet assigned) requests (default: 64).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of worker slots, i.e. concurrent inference calls (default: 4).
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Wait time after which a queued request jumps ahead of later arrivals (default: 5000).
    #[serde(default = "default_starvation_threshold_ms")]
    pub starvation_threshold_ms: u64,
    /// Deadline applied to requests that do not carry their own.
    #[serde(default)]
    pub default_deadline_ms: Option<u64>,
    /// Hold a session's results until all its earlier requests resolved.
    #[serde(default)]
    pub in_order_delivery_per_session: bool,
    /// How often queued deadlines and idle sessions are checked (default: 25).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Close sessions idle for this long with nothing outstanding.
    #[serde(default)]
    pub session_idle_timeout_secs: Option<u64>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_count: default_worker_count(),
            starvation_threshold_ms: default_starvation_threshold_ms(),
            default_deadline_ms: None,
            in_order_delivery_per_session: false,
            sweep_interval_ms: default_sweep_interval_ms(),
            session_idle_timeout_secs: None,
        }
    }
}

impl DispatcherSettings {
    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Message(
                "dispatcher.worker_count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "dispatcher.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Message(
                "dispatcher.sweep_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&DispatcherSettings> for DispatcherConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            worker_count: settings.worker_count,
            starvation_threshold: Duration::from_millis(settings.starvation_threshold_ms),
            default_deadline: settings.default_deadline_ms.map(Duration::from_millis),
            in_order_delivery_per_session: settings.in_order_delivery_per_session,
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
            session_idle_timeout: settings.session_idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Which inference backend to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Echo,
    Ollama,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub kind: EngineKind,
    #[serde(default = "default_echo_latency_ms")]
    pub echo_latency_ms: u64,
    #[serde(default)]
    pub echo_jitter_ms: u64,
    #[serde(default = "default_ollama_url")]
    pub ollama_base_url: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            echo_latency_ms: default_echo_latency_ms(),
            echo_jitter_ms: 0,
            ollama_base_url: default_ollama_url(),
            ollama_model: default_ollama_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_queue_capacity() -> usize {
    64
}
fn default_worker_count() -> usize {
    4
}
fn default_starvation_threshold_ms() -> u64 {
    5000
}
fn default_sweep_interval_ms() -> u64 {
    25
}
fn default_echo_latency_ms() -> u64 {
    1000
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3.2".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `config.toml` (if present) and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (DISPATCH__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Same as `load`, reading the file source from `path` (extension optional).
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config: Config = ConfigLoader::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("DISPATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.dispatcher.validate()?;
        Ok(config)
    }

    /// Runtime dispatcher configuration derived from the loaded settings.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::from(&self.dispatcher)
    }
}
