use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the rescore binary.
#[derive(Debug, Parser)]
#[command(
    name = "rescore",
    version,
    about = "Resource cache and task coordination toolkit"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "RESCORE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Hammer a synthetic resource with concurrent consumers and report how
    /// many loader calls served the requests.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub overrides: SettingsOverrides,

    /// Number of concurrent consumers.
    #[arg(long, default_value_t = 16)]
    pub consumers: usize,

    /// Number of distinct keys the consumers draw from.
    #[arg(long, default_value_t = 32)]
    pub keys: u32,

    /// Requests issued by each consumer.
    #[arg(long, default_value_t = 64)]
    pub requests: usize,

    /// Simulated backend latency per loader call.
    #[arg(long = "latency-ms", default_value_t = 20)]
    pub latency_ms: u64,

    /// Outdate every key after this many requests per consumer; 0 disables.
    #[arg(long = "outdate-every", default_value_t = 0)]
    pub outdate_every: usize,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            overrides: SettingsOverrides::default(),
            consumers: 16,
            keys: 32,
            requests: 64,
            latency_ms: 20,
            outdate_every: 0,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct SettingsOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override how many alias hops resolution follows.
    #[arg(long = "resource-alias-depth-limit", value_name = "COUNT")]
    pub alias_depth_limit: Option<u32>,

    /// Toggle eviction of entries once their last consumer frees them.
    #[arg(
        long = "resource-evict-on-free",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub evict_on_free: Option<bool>,

    /// Override the default polling interval of while-tasks.
    #[arg(long = "task-poll-interval-ms", value_name = "MILLIS")]
    pub poll_interval_ms: Option<u64>,

    /// Override the default polling timeout of while-tasks; 0 disables it.
    #[arg(long = "task-poll-timeout-ms", value_name = "MILLIS")]
    pub poll_timeout_ms: Option<u64>,
}
