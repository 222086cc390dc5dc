//! # perfflux-adapters
//!
//! Connectors for the systems perfflux talks to.
//!
//! ## Supported Systems
//!
//! - **InfluxDB** (`influx` feature) - writes points and events as line
//!   protocol through the HTTP write API
//! - **Elasticsearch** (`elasticsearch` feature) - writes documents through
//!   the bulk API into monthly indices
//! - **Livestatus** (`livestatus` feature) - line-oriented query client for
//!   the monitoring core's status interface
//!
//! Backends implement the [`Backend`] trait so the dispatch layer can batch,
//! retry and spill without knowing the wire format.
//!
//! ## Quick Start (InfluxDB)
//!
//! ```rust,no_run
//! use perfflux_adapters::influx::InfluxBackend;
//! use perfflux_adapters::Backend;
//! use perfflux_types::MetricPoint;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = InfluxBackend::builder()
//!         .endpoint("http://localhost:8086")
//!         .arguments("precision=ms&db=perfflux")
//!         .build()?;
//!
//!     let point = MetricPoint::builder()
//!         .hostname("web01")
//!         .label("rta")
//!         .time_ms(1_441_791_000_000)
//!         .field("value", "0.5")
//!         .build();
//!
//!     if let Some(line) = backend.render(&point.into()) {
//!         backend.send(line).await?;
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt::Debug;

use async_trait::async_trait;

use perfflux_types::DispatchJob;

pub mod error;

#[cfg(feature = "influx")]
pub mod influx;

#[cfg(feature = "elasticsearch")]
pub mod elastic;

#[cfg(feature = "livestatus")]
pub mod livestatus;

pub use error::AdapterError;

// Re-export types for convenience
pub use perfflux_types::{EventKind, EventRecord, MetricPoint};

/// A time-series or search backend that accepts batches of records.
///
/// A *record* is the rendered form of one [`DispatchJob`]; it always ends
/// with a newline, so a batch payload is the plain concatenation of its
/// records.
#[async_trait]
pub trait Backend: Send + Sync + Debug {
    /// Backend type, e.g. `influxdb`. Used in spill file names.
    fn kind(&self) -> &'static str;

    /// Configured target name.
    fn name(&self) -> &str;

    /// Render a job into a newline-terminated record, or `None` if the job
    /// cannot be represented by this backend.
    fn render(&self, job: &DispatchJob) -> Option<String>;

    /// Split a payload (for example a replayed spill file) back into
    /// individually sendable records.
    fn split_records(&self, payload: &str) -> Vec<String> {
        payload
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| format!("{}\n", line))
            .collect()
    }

    /// Check whether the backend currently accepts requests.
    async fn is_alive(&self) -> bool;

    /// One-time setup before the first send (create database, ...).
    async fn prepare(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Send one payload.
    async fn send(&self, payload: String) -> Result<(), AdapterError>;
}

/// Make sure a rendered record ends with exactly one trailing newline.
pub fn terminate_record(mut record: String) -> String {
    while record.ends_with('\n') || record.ends_with('\r') {
        record.pop();
    }
    record.push('\n');
    record
}
