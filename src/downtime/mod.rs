//! Downtime awareness for parsed points.
//!
//! A [`DowntimeCacheBuilder`] periodically asks the monitoring core which
//! hosts and services are in a scheduled downtime and publishes the answer
//! as an immutable [`DowntimeCache`]. The parser only sees the
//! [`DowntimeLookup`] trait.

mod builder;
mod cache;

pub use builder::{CacheState, DowntimeCacheBuilder, DowntimeHandle};
pub(crate) use builder::collect_rows;
pub use cache::{DowntimeCache, SharedDowntimeCache};

use std::fmt::Debug;

use tokio::sync::mpsc;

use perfflux_adapters::livestatus::{LivestatusClient, Row};
use perfflux_adapters::AdapterError;

/// Answers whether a host or service is in downtime at a given time.
pub trait DowntimeLookup: Send + Sync {
    /// `service` is empty for host checks. `time_secs` is the check time.
    fn in_downtime(&self, host: &str, service: &str, time_secs: u64) -> bool;
}

/// Something that answers status-interface queries row by row.
pub trait StatusQuery: Send + Sync + Debug {
    fn query_stream(&self, query: &str) -> mpsc::Receiver<Result<Row, AdapterError>>;
}

impl StatusQuery for LivestatusClient {
    fn query_stream(&self, query: &str) -> mpsc::Receiver<Result<Row, AdapterError>> {
        LivestatusClient::query_stream(self, query)
    }
}
