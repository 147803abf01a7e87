//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{CliArgs, Command, SettingsOverrides, SimulateArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "rescore";
const ENV_PREFIX: &str = "RESCORE";
const DEFAULT_ALIAS_DEPTH_LIMIT: u32 = 8;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 30_000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub resource: ResourceSettings,
    pub task: TaskSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub alias_depth_limit: NonZeroUsize,
    pub evict_on_free: bool,
}

#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub poll_interval: Duration,
    /// `None` lets while-tasks poll until cancelled.
    pub poll_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Simulate(args)) => raw.apply_overrides(&args.overrides),
        None => raw.apply_overrides(&SettingsOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    resource: RawResourceSettings,
    task: RawTaskSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &SettingsOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(limit) = overrides.alias_depth_limit {
            self.resource.alias_depth_limit = Some(limit);
        }
        if let Some(evict) = overrides.evict_on_free {
            self.resource.evict_on_free = Some(evict);
        }
        if let Some(interval) = overrides.poll_interval_ms {
            self.task.poll_interval_ms = Some(interval);
        }
        if let Some(timeout) = overrides.poll_timeout_ms {
            self.task.poll_timeout_ms = Some(timeout);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            resource,
            task,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            resource: build_resource_settings(resource)?,
            task: build_task_settings(task)?,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
            resource: ResourceSettings {
                alias_depth_limit: NonZeroUsize::new(DEFAULT_ALIAS_DEPTH_LIMIT as usize)
                    .unwrap_or(NonZeroUsize::MIN),
                evict_on_free: false,
            },
            task: TaskSettings {
                poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
                poll_timeout: Some(Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS)),
            },
        }
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_resource_settings(resource: RawResourceSettings) -> Result<ResourceSettings, LoadError> {
    let depth = resource
        .alias_depth_limit
        .unwrap_or(DEFAULT_ALIAS_DEPTH_LIMIT);
    let depth = usize::try_from(depth).map_err(|_| {
        LoadError::invalid(
            "resource.alias_depth_limit",
            "value exceeds supported range for usize",
        )
    })?;
    let alias_depth_limit = NonZeroUsize::new(depth).ok_or_else(|| {
        LoadError::invalid("resource.alias_depth_limit", "must be greater than zero")
    })?;

    Ok(ResourceSettings {
        alias_depth_limit,
        evict_on_free: resource.evict_on_free.unwrap_or(false),
    })
}

fn build_task_settings(task: RawTaskSettings) -> Result<TaskSettings, LoadError> {
    let interval_ms = task.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "task.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    let poll_timeout = match task.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS) {
        0 => None,
        timeout_ms if timeout_ms < interval_ms => {
            return Err(LoadError::invalid(
                "task.poll_timeout_ms",
                "must not be shorter than task.poll_interval_ms",
            ));
        }
        timeout_ms => Some(Duration::from_millis(timeout_ms)),
    };

    Ok(TaskSettings {
        poll_interval: Duration::from_millis(interval_ms),
        poll_timeout,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResourceSettings {
    alias_depth_limit: Option<u32>,
    evict_on_free: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTaskSettings {
    poll_interval_ms: Option<u64>,
    poll_timeout_ms: Option<u64>,
}
