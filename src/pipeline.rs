//! Wires targets, the downtime cache and the sources together.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use perfflux_adapters::elastic::ElasticBackend;
use perfflux_adapters::influx::InfluxBackend;
use perfflux_adapters::livestatus::{LivestatusAddress, LivestatusClient};
use perfflux_adapters::Backend;

use crate::config::{Config, PoolSettings};
use crate::dispatch::{Router, TargetPool};
use crate::downtime::{DowntimeCacheBuilder, DowntimeHandle, StatusQuery};
use crate::parse::PerfdataParser;
use crate::source::{EventCollector, Ingest, SourceHandle, SpoolSource};
use crate::stats::Stats;

/// A backend together with the pool settings of its target.
pub type Target = (Arc<dyn Backend>, PoolSettings);

/// Build a backend for every enabled target in the config.
pub fn backends(config: &Config) -> Result<Vec<Target>> {
    let mut targets: Vec<Target> = Vec::new();
    for target in config.influx.iter().filter(|t| t.pool.enabled) {
        let mut builder = InfluxBackend::builder()
            .name(&target.name)
            .endpoint(&target.address)
            .arguments(&target.arguments)
            .timeout(target.pool.request_timeout);
        if let Some(database) = &target.create_database {
            builder = builder.create_database(database);
        }
        let backend = builder
            .build()
            .with_context(|| format!("Invalid influx target '{}'", target.name))?;
        targets.push((Arc::new(backend), target.pool.clone()));
    }
    for target in config.elasticsearch.iter().filter(|t| t.pool.enabled) {
        let backend = ElasticBackend::builder()
            .name(&target.name)
            .endpoint(&target.address)
            .index(&target.index)
            .timeout(target.pool.request_timeout)
            .build()
            .with_context(|| format!("Invalid elasticsearch target '{}'", target.name))?;
        targets.push((Arc::new(backend), target.pool.clone()));
    }
    Ok(targets)
}

/// The running pipeline.
#[derive(Debug)]
pub struct Pipeline {
    sources: Vec<SourceHandle>,
    downtime: Option<DowntimeHandle>,
    pools: Vec<TargetPool>,
    router: Router,
}

impl Pipeline {
    /// Start everything the config describes.
    pub async fn start(config: &Config, stats: Arc<Stats>) -> Result<Self> {
        let targets = backends(config)?;
        Self::with_targets(config, targets, stats).await
    }

    /// Start with the given targets instead of the configured ones.
    ///
    /// Pools come up first (replaying their spill files), then the
    /// downtime cache, then the sources.
    pub async fn with_targets(
        config: &Config,
        targets: Vec<Target>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        // Fail on bad source settings before anything is started.
        let status: Option<Arc<dyn StatusQuery>> = if config.livestatus.enabled {
            let address: LivestatusAddress = config
                .livestatus
                .address
                .parse()
                .context("Invalid livestatus address")?;
            Some(Arc::new(LivestatusClient::new(address)))
        } else {
            None
        };
        #[cfg(feature = "gearman")]
        let gearman = if config.gearman.enabled {
            Some(
                crate::source::gearman::GearmanSource::new(&config.gearman)
                    .context("Invalid gearman settings")?,
            )
        } else {
            None
        };

        let mut pools = Vec::with_capacity(targets.len());
        for (backend, settings) in targets {
            let pool = TargetPool::start(
                backend,
                &settings,
                config.main.queue_capacity,
                &config.main.dump_file,
                &stats,
            )
            .await;
            pools.push(pool);
        }
        let router = Router::new(
            pools.iter().map(TargetPool::queue).collect(),
            config.main.send_timeout,
        );

        let mut parser = PerfdataParser::new();
        let downtime = match &status {
            Some(status) => {
                let builder =
                    DowntimeCacheBuilder::new(status.clone(), config.livestatus.cache_interval);
                let handle = builder.start();
                if !handle.wait_ready(config.livestatus.cache_wait).await {
                    warn!(
                        waited = ?config.livestatus.cache_wait,
                        "Downtime cache not ready, starting without it"
                    );
                }
                parser = parser.with_downtime(handle.cache());
                Some(handle)
            }
            None => None,
        };

        let ingest = Ingest::new(parser, router.clone(), stats.clone())
            .with_separators(&config.main.entry_separator, &config.main.kv_separator);

        let mut sources = Vec::new();
        if let Some(spool) = SpoolSource::from_config(&config.main) {
            sources.push(spool.start(ingest.clone()));
        }
        #[cfg(feature = "gearman")]
        sources.extend(gearman.map(|gearman| gearman.start(ingest.clone())));
        if let (Some(status), true) = (&status, config.livestatus.collect_events) {
            let collector = EventCollector::new(status.clone(), config.livestatus.events_interval);
            sources.push(collector.start(router.clone(), stats.clone()));
        }
        if sources.is_empty() {
            warn!("No source configured, nothing will be collected");
        }

        info!(
            targets = pools.len(),
            sources = sources.len(),
            downtime = downtime.is_some(),
            "Pipeline started"
        );
        Ok(Self {
            sources,
            downtime,
            pools,
            router,
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Stop producers before their consumers: sources, then the downtime
    /// cache, then the target pools.
    pub async fn stop(self) {
        for source in self.sources {
            debug!(source = source.description(), "Stopping source");
            source.stop().await;
        }
        if let Some(downtime) = self.downtime {
            downtime.stop().await;
        }
        for pool in self.pools {
            debug!(target_name = pool.name(), "Stopping target pool");
            pool.stop().await;
        }
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_enabled_targets_only() {
        let config = Config::from_toml(
            r#"
            [[influx]]
            name = "a"
            create_database = "perfflux"

            [[influx]]
            name = "off"
            enabled = false

            [[elasticsearch]]
            name = "es"
            index = "monitoring"
            "#,
        )
        .unwrap();

        let targets = backends(&config).unwrap();
        let names: Vec<(&str, &str)> = targets
            .iter()
            .map(|(backend, _)| (backend.kind(), backend.name()))
            .collect();
        assert_eq!(names, vec![("influxdb", "a"), ("elasticsearch", "es")]);
    }

    #[tokio::test]
    async fn bad_livestatus_address_fails_before_start() {
        let mut config = Config::from_toml("[[influx]]\nname = \"a\"\n").unwrap();
        config.livestatus.enabled = true;
        config.livestatus.address = "nowhere".to_string();

        let err = Pipeline::with_targets(&config, Vec::new(), Stats::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("livestatus address"));
    }
}
