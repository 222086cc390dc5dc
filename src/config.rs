//! Configuration file loading.
//!
//! The file is TOML. Every value can be overridden from the environment
//! with the `PERFFLUX_` prefix and `__` between nested keys, e.g.
//! `PERFFLUX_MAIN__SPOOL_WORKERS=4`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Environment, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub main: MainConfig,
    pub log: LogConfig,
    pub livestatus: LivestatusConfig,
    pub gearman: GearmanConfig,
    pub influx: Vec<InfluxTarget>,
    pub elasticsearch: Vec<ElasticTarget>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MainConfig {
    /// Spool directory to watch. No spool collector runs when unset.
    pub spool_dir: Option<PathBuf>,
    pub spool_workers: usize,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub min_file_age: Duration,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub scan_interval: Duration,
    /// Base name of the spill files.
    pub dump_file: PathBuf,
    /// Capacity of each target's job queue.
    pub queue_capacity: usize,
    /// How long a producer waits on a full queue before giving up.
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub send_timeout: Duration,
    pub entry_separator: String,
    pub kv_separator: String,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            spool_dir: None,
            spool_workers: 1,
            min_file_age: Duration::from_secs(10),
            scan_interval: Duration::from_secs(5),
            dump_file: PathBuf::from("perfflux.dump"),
            queue_capacity: 10_000,
            send_timeout: Duration::from_secs(5),
            entry_separator: "\t".to_string(),
            kv_separator: "::".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivestatusConfig {
    pub enabled: bool,
    /// `host:port` or a Unix socket path.
    pub address: String,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub cache_interval: Duration,
    /// How long pipeline start waits for the first cache build.
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub cache_wait: Duration,
    pub collect_events: bool,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub events_interval: Duration,
}

impl Default for LivestatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:6557".to_string(),
            cache_interval: Duration::from_secs(30),
            cache_wait: Duration::from_secs(10),
            collect_events: false,
            events_interval: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GearmanConfig {
    pub enabled: bool,
    pub address: String,
    pub queues: Vec<String>,
    /// Shared secret for encrypted payloads. Plain payloads when unset.
    pub secret: Option<String>,
    pub workers: usize,
}

impl Default for GearmanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:4730".to_string(),
            queues: vec!["perfdata".to_string()],
            secret: None,
            workers: 1,
        }
    }
}

/// Worker pool settings shared by every target type.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    pub batch_size: usize,
    /// Longest time a partial batch waits before it is flushed.
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub flush_interval: Duration,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub scaling_interval: Duration,
    /// Stop pulling jobs while the backend is down.
    pub stop_reading_if_down: bool,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub request_timeout: Duration,
    /// How long pool start waits for the backend before replaying spill.
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub startup_wait: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_workers: 1,
            max_workers: 4,
            batch_size: 500,
            flush_interval: Duration::from_millis(200),
            scaling_interval: Duration::from_secs(10),
            stop_reading_if_down: true,
            request_timeout: Duration::from_secs(10),
            startup_wait: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxTarget {
    pub name: String,
    #[serde(default = "default_influx_address")]
    pub address: String,
    #[serde(default = "default_influx_arguments")]
    pub arguments: String,
    #[serde(default)]
    pub create_database: Option<String>,
    #[serde(flatten)]
    pub pool: PoolSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElasticTarget {
    pub name: String,
    #[serde(default = "default_elastic_address")]
    pub address: String,
    #[serde(default = "default_elastic_index")]
    pub index: String,
    #[serde(flatten)]
    pub pool: PoolSettings,
}

fn default_influx_address() -> String {
    "http://127.0.0.1:8086".to_string()
}

fn default_influx_arguments() -> String {
    "precision=ms&db=perfflux".to_string()
}

fn default_elastic_address() -> String {
    "http://127.0.0.1:9200".to_string()
}

fn default_elastic_index() -> String {
    "perfflux".to_string()
}

impl Config {
    /// Load a TOML file plus environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let builder =
            config::Config::builder().add_source(File::from(path).format(FileFormat::Toml));
        Self::finish(builder)
            .with_context(|| format!("Failed to load config from {}", path.display()))
    }

    /// Parse TOML text plus environment overrides.
    pub fn from_toml(text: &str) -> Result<Self> {
        let builder = config::Config::builder().add_source(File::from_str(text, FileFormat::Toml));
        Self::finish(builder)
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config: Config = builder
            .add_source(
                Environment::with_prefix("PERFFLUX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let pools = self
            .influx
            .iter()
            .map(|t| (&t.name, &t.pool))
            .chain(self.elasticsearch.iter().map(|t| (&t.name, &t.pool)));

        let mut enabled = 0;
        let mut names = std::collections::HashSet::new();
        for (name, pool) in pools {
            if name.is_empty() {
                bail!("Every target needs a name");
            }
            if !names.insert(name) {
                bail!("Duplicate target name '{}'", name);
            }
            if !pool.enabled {
                continue;
            }
            enabled += 1;
            if pool.min_workers < 1 {
                bail!("Target '{}': min_workers must be at least 1", name);
            }
            if pool.min_workers > pool.max_workers {
                bail!(
                    "Target '{}': min_workers ({}) exceeds max_workers ({})",
                    name,
                    pool.min_workers,
                    pool.max_workers
                );
            }
            if pool.batch_size == 0 {
                bail!("Target '{}': batch_size must be positive", name);
            }
        }
        if enabled == 0 {
            bail!("No enabled influx or elasticsearch target configured");
        }

        if self.main.queue_capacity == 0 {
            bail!("main.queue_capacity must be positive");
        }
        if self.main.entry_separator.is_empty() || self.main.kv_separator.is_empty() {
            bail!("main.entry_separator and main.kv_separator must not be empty");
        }
        if self.gearman.enabled {
            match &self.gearman.secret {
                Some(secret) if secret.is_empty() => {
                    bail!("gearman.secret is set but empty")
                }
                _ => {}
            }
            if self.gearman.queues.is_empty() {
                bail!("gearman.queues must name at least one queue");
            }
        }
        Ok(())
    }
}
