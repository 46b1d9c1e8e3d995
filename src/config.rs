//! Configuration for the aftershock engine.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AFTERSHOCK_HOME, AFTERSHOCK_PUBLISH_KEY)
//! 2. Config file (.aftershock/config.yaml)
//! 3. Defaults (~/.aftershock)
//!
//! Config file discovery:
//! - Searches current directory and parents for .aftershock/config.yaml
//! - Paths in config file are relative to the .aftershock/ directory
//! - Durations in the file are integer seconds

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::model::ModelSettings;
use crate::adapters::publisher::PublishSettings;
use crate::adapters::source::SourceSettings;
use crate::core::{DispatcherConfig, EngineSettings, ForecastSchedule, HealthSettings, RetryPolicy};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".aftershock";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub dispatcher: Option<DispatcherConfig>,
    #[serde(default)]
    pub forecast: Option<ForecastConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub publish: Option<PublishSettings>,
    #[serde(default)]
    pub source: Option<SourceSettings>,
    #[serde(default)]
    pub health: Option<HealthSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .aftershock/)
    pub home: Option<String>,
    /// Task database (relative to home)
    pub task_db: Option<String>,
    /// Timeline log directory (relative to home)
    pub timelines: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForecastConfig {
    /// Forecast lags in seconds after origin
    pub lags_secs: Option<Vec<u64>>,
    #[serde(default)]
    pub model: ModelSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    pub publish: Option<RetryPolicy>,
    pub intake: Option<RetryPolicy>,
    pub forecast: Option<RetryPolicy>,
}

/// Values taken from the environment
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<PathBuf>,
    pub publish_key: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var("AFTERSHOCK_HOME").ok().map(PathBuf::from),
            publish_key: std::env::var("AFTERSHOCK_PUBLISH_KEY").ok(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// SQLite task database
    pub task_db: PathBuf,
    /// Directory of per-event timeline logs
    pub timeline_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,

    pub dispatcher: DispatcherConfig,
    pub engine: EngineSettings,
    pub publish: PublishSettings,
    pub source: SourceSettings,
    pub model: ModelSettings,
    pub health: HealthSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Build the resolved configuration from an optional config file and
/// environment overrides
pub fn resolve(config_path: Option<&Path>, env: EnvOverrides) -> Result<ResolvedConfig> {
    let file = config_path.map(load_config_file).transpose()?;

    let home = match (&env.home, config_path, file.as_ref().and_then(|f| f.paths.home.as_ref())) {
        (Some(home), _, _) => home.clone(),
        (None, Some(path), Some(home)) => {
            let config_dir = path.parent().unwrap_or(Path::new("."));
            resolve_path(config_dir, home)
        }
        _ => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR),
    };

    let file = file.unwrap_or(ConfigFile {
        version: "1".to_string(),
        paths: PathsConfig::default(),
        dispatcher: None,
        forecast: None,
        retry: None,
        publish: None,
        source: None,
        health: None,
    });

    let task_db = file
        .paths
        .task_db
        .as_deref()
        .map_or_else(|| home.join("tasks.db"), |p| resolve_path(&home, p));
    let timeline_dir = file
        .paths
        .timelines
        .as_deref()
        .map_or_else(|| home.join("timelines"), |p| resolve_path(&home, p));

    let forecast = file.forecast.unwrap_or_default();
    let retry = file.retry.unwrap_or_default();

    let mut publish = file.publish.unwrap_or_default();
    if env.publish_key.is_some() {
        publish.signing_key = env.publish_key;
    }

    let defaults = EngineSettings::default();
    let engine = EngineSettings {
        schedule: forecast
            .lags_secs
            .map_or(defaults.schedule, ForecastSchedule::new),
        intake_retry: retry.intake.unwrap_or(defaults.intake_retry),
        forecast_retry: retry.forecast.unwrap_or(defaults.forecast_retry),
        publish_retry: retry.publish.unwrap_or(defaults.publish_retry),
        product_network: publish.network.clone(),
        product_code_prefix: publish.code_prefix.clone(),
        product_reviewed: publish.reviewed,
    };

    Ok(ResolvedConfig {
        home,
        task_db,
        timeline_dir,
        config_file: config_path.map(Path::to_path_buf),
        dispatcher: file.dispatcher.unwrap_or_default(),
        engine,
        publish,
        source: file.source.unwrap_or_default(),
        model: forecast.model,
        health: file.health.unwrap_or_default(),
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();
    resolve(config_file.as_deref(), EnvOverrides::from_env())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
