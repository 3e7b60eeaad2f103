//! Configuration management for the Convoy worker process
//!
//! Values are read from an optional YAML file, overridden by `CONVOY_`
//! environment variables (`CONVOY_CLUSTER__NODES=3`) and finally by command
//! line arguments.

use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use convoy_core::distribution::DistributionConfig;
use convoy_core::task::{CleanupConfig, TaskNodeConfig};

use crate::startup::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/convoy.yml";
const DEFAULT_GROUP: &str = "workers";
const DEFAULT_NODES: i64 = 3;

/// Command line arguments of the worker process
#[derive(Debug, Parser)]
#[command(version, about = "Runs coordinated Convoy worker nodes")]
pub struct Cli {
    /// Configuration file, missing file is ignored
    #[arg(short = 'c', long = "config", env = "CONVOY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config_file: String,
    /// Number of worker nodes started in this process
    #[arg(short = 'n', long = "nodes")]
    pub nodes: Option<u32>,
    /// Distribution group name
    #[arg(short = 'g', long = "group")]
    pub group: Option<String>,
    /// Demo triggers created at startup
    #[arg(long = "seed")]
    pub seed: Option<u32>,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

/// Application configuration loaded from the config file and environment
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new() -> anyhow::Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(args: Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name(&args.config_file).required(false))
            .add_source(
                Environment::with_prefix("convoy")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(v) = args.nodes {
            builder = builder.set_override("cluster.nodes", i64::from(v))?;
        }
        if let Some(v) = args.group {
            builder = builder.set_override("cluster.group", v)?;
        }
        if let Some(v) = args.seed {
            builder = builder.set_override("demo.seed", i64::from(v))?;
        }
        if let Some(v) = args.log_level {
            builder = builder.set_override("logging.level", v)?;
        }

        Ok(Self {
            config: builder.build()?,
        })
    }

    fn duration_secs(&self, key: &str, default: u64) -> Duration {
        let secs = self
            .config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default);
        Duration::from_secs(secs)
    }

    // ========================================================================
    // Cluster
    // ========================================================================

    pub fn node_count(&self) -> usize {
        self.config
            .get_int("cluster.nodes")
            .ok()
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(DEFAULT_NODES as usize)
    }

    pub fn group(&self) -> String {
        self.config
            .get_string("cluster.group")
            .unwrap_or_else(|_| DEFAULT_GROUP.to_string())
    }

    pub fn node_id_prefix(&self) -> String {
        self.config
            .get_string("cluster.node_id_prefix")
            .unwrap_or_else(|_| "worker".to_string())
    }

    pub fn session_ttl(&self) -> Duration {
        self.duration_secs("cluster.ttl_secs", 15)
    }

    pub fn distribution_config(&self) -> DistributionConfig {
        let defaults = DistributionConfig::default();
        DistributionConfig {
            ttl: self.session_ttl(),
            startup_timeout: self.duration_secs("cluster.startup_timeout_secs", defaults.startup_timeout.as_secs()),
            shutdown_timeout: self.duration_secs("cluster.shutdown_timeout_secs", defaults.shutdown_timeout.as_secs()),
            events_group_interval: self.duration_secs(
                "cluster.events_group_interval_secs",
                defaults.events_group_interval.as_secs(),
            ),
        }
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    pub fn task_node_config(&self) -> TaskNodeConfig {
        let defaults = CleanupConfig::default();
        TaskNodeConfig {
            ttl: self.session_ttl(),
            cleanup: CleanupConfig {
                enabled: self.config.get_bool("tasks.cleanup.enabled").unwrap_or(true),
                interval: self.duration_secs("tasks.cleanup.interval_secs", defaults.interval.as_secs()),
                unfinished_after: self.duration_secs(
                    "tasks.cleanup.unfinished_after_secs",
                    defaults.unfinished_after.as_secs(),
                ),
                successful_after: self.duration_secs(
                    "tasks.cleanup.successful_after_secs",
                    defaults.successful_after.as_secs(),
                ),
                failed_after: self.duration_secs("tasks.cleanup.failed_after_secs", defaults.failed_after.as_secs()),
            },
            ..Default::default()
        }
    }

    pub fn task_timeout(&self) -> Duration {
        self.duration_secs("tasks.timeout_secs", 60)
    }

    // ========================================================================
    // Orchestrator
    // ========================================================================

    pub fn trigger_prefix(&self) -> String {
        self.config
            .get_string("orchestrator.prefix")
            .unwrap_or_else(|_| "trigger".to_string())
    }

    pub fn restart_interval(&self) -> Duration {
        self.duration_secs("orchestrator.restart_interval_secs", 60)
    }

    pub fn demo_seed(&self) -> u32 {
        self.config
            .get_int("demo.seed")
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }

    // ========================================================================
    // Logging
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("logging.dir").ok(),
            self.config.get_bool("logging.console").unwrap_or(true),
            self.config.get_bool("logging.file").unwrap_or(false),
            self.config
                .get_string("logging.level")
                .unwrap_or_else(|_| "info".to_string()),
        )
    }
}
