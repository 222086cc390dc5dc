//! # perfflux
//!
//! Ships performance data from a monitoring core to time-series and search
//! backends.
//!
//! Check results arrive as perfdata records (spool files written by the
//! core, or jobs on a Gearman queue). Each record is tokenized, parsed into
//! one [`MetricPoint`](perfflux_types::MetricPoint) per performance label,
//! annotated with scheduled downtimes, and fanned out to every configured
//! target.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────┐   ┌──────────────┐
//! │ spool files  │──▶│             │   │          │──▶│ InfluxDB     │
//! │ gearman jobs │──▶│ parse       │──▶│ Router   │   │ pool         │
//! │ status events│──▶│ + downtime  │   │          │──▶│ Elasticsearch│
//! └──────────────┘   └─────────────┘   └──────────┘   │ pool         │
//!                           ▲                         └──────┬───────┘
//!                    downtime cache                          ▼
//!                    (livestatus)                       spill files
//! ```
//!
//! - **[`parse`]**: tokenizer, sanitizer, threshold ranges and the perfdata
//!   parser
//! - **[`downtime`]**: periodically rebuilt downtime cache
//! - **[`dispatch`]**: per-target queues, scaling worker pools and the
//!   spill file
//! - **[`source`]**: spool directory, Gearman and status event collectors
//! - **[`pipeline`]**: starts and stops everything in order
//!
//! ## Usage
//!
//! ```no_run
//! use perfflux::{Config, Pipeline, Stats};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("perfflux.toml".as_ref())?;
//! let pipeline = Pipeline::start(&config, Stats::new()).await?;
//! tokio::signal::ctrl_c().await?;
//! pipeline.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod downtime;
pub mod duration;
pub mod logging;
pub mod parse;
pub mod pipeline;
pub mod source;
pub mod stats;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use parse::{tokenize, PerfdataParser};
pub use pipeline::Pipeline;
pub use stats::Stats;
