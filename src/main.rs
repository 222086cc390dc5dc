use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info};

use perfflux::{logging, Config, Pipeline, Stats};

#[derive(Parser, Debug)]
#[command(name = "perfflux")]
#[command(about = "Ships monitoring perfdata to InfluxDB and Elasticsearch")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "perfflux.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Interval of the debug stats log (e.g., "60s", "5m")
    #[arg(long, default_value = "60s")]
    stats_interval: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    if args.check {
        println!("{}: ok", args.config.display());
        return Ok(());
    }

    logging::init(&config.log)?;
    let stats_interval = perfflux::duration::parse_duration(&args.stats_interval)?;

    let stats = Stats::new();
    let pipeline = Pipeline::start(&config, stats.clone()).await?;
    info!(config = %args.config.display(), "perfflux running");

    wait_for_shutdown(&stats, stats_interval).await;

    info!("Shutting down");
    pipeline.stop().await;
    log_stats(&stats);
    Ok(())
}

async fn wait_for_shutdown(stats: &Arc<Stats>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Could not listen for ctrl-c");
                }
                return;
            }
            _ = ticker.tick() => log_stats(stats),
        }
    }
}

fn log_stats(stats: &Stats) {
    match serde_json::to_string(&stats.snapshot()) {
        Ok(json) => debug!(stats = %json, "Pipeline stats"),
        Err(e) => error!(error = %e, "Could not serialize stats"),
    }
}
