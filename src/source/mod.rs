//! Producers feeding the dispatch queues.
//!
//! Every source turns its input into [`DispatchJob`]s and hands them to the
//! [`Router`]. Perfdata text (spool files and job-queue payloads) goes
//! through the shared [`Ingest`] path; status events are built directly.

mod events;
#[cfg(feature = "gearman")]
pub mod gearman;
mod spool;

pub use events::EventCollector;
pub use spool::SpoolSource;

use std::sync::Arc;

use tracing::{debug, warn};

use perfflux_types::DispatchJob;

use crate::dispatch::{DispatchError, Router};
use crate::parse::{tokenize, PerfdataParser};
use crate::stats::Stats;
use crate::task::{StopSignal, TaskHandle};

/// Turns perfdata text into points and routes them.
#[derive(Debug, Clone)]
pub struct Ingest {
    parser: PerfdataParser,
    router: Router,
    stats: Arc<Stats>,
    entry_separator: String,
    kv_separator: String,
}

impl Ingest {
    pub fn new(parser: PerfdataParser, router: Router, stats: Arc<Stats>) -> Self {
        Self {
            parser,
            router,
            stats,
            entry_separator: "\t".to_string(),
            kv_separator: "::".to_string(),
        }
    }

    pub fn with_separators(mut self, entry: impl Into<String>, kv: impl Into<String>) -> Self {
        self.entry_separator = entry.into();
        self.kv_separator = kv.into();
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Parse every line of `text` and queue the points on all targets.
    ///
    /// Returns the number of points queued. Fails only when `stop` fires
    /// before every point was accepted.
    ///
    /// ```
    /// use std::time::Duration;
    /// use perfflux::dispatch::{JobQueue, Router};
    /// use perfflux::source::Ingest;
    /// use perfflux::{PerfdataParser, Stats};
    ///
    /// # tokio_test::block_on(async {
    /// let queue = JobQueue::new("influx", 100);
    /// let router = Router::new(vec![queue.clone()], Duration::from_secs(1));
    /// let ingest = Ingest::new(PerfdataParser::new(), router, Stats::new());
    /// let (_stop_tx, stop) = tokio::sync::watch::channel(false);
    ///
    /// let line = "DATATYPE::HOSTPERFDATA\tTIMET::1441791000\tHOSTNAME::web01\tHOSTPERFDATA::rta=1ms";
    /// assert_eq!(ingest.lines(line, &stop).await.unwrap(), 1);
    /// assert_eq!(queue.len(), 1);
    /// # });
    /// ```
    pub async fn lines(&self, text: &str, stop: &StopSignal) -> Result<usize, DispatchError> {
        let mut emitted = 0;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record = tokenize(line, &self.entry_separator, &self.kv_separator);
            if record.is_empty() {
                Stats::add(&self.stats.records_skipped, 1);
                continue;
            }

            let points = match self.parser.parse(&record) {
                Ok(points) => points,
                Err(e) => {
                    warn!(error = %e, "Skipping perfdata record");
                    Stats::add(&self.stats.records_skipped, 1);
                    continue;
                }
            };
            Stats::add(&self.stats.records_parsed, 1);
            if points.is_empty() {
                continue;
            }

            let count = points.len();
            self.router
                .dispatch_all(points.into_iter().map(DispatchJob::Point), stop)
                .await?;
            Stats::add(&self.stats.points_emitted, count as u64);
            emitted += count;
        }
        debug!(points = emitted, "Ingested perfdata");
        Ok(emitted)
    }
}

/// The running tasks of one source.
#[derive(Debug)]
pub struct SourceHandle {
    description: String,
    tasks: Vec<TaskHandle>,
}

impl SourceHandle {
    pub fn new(description: impl Into<String>, tasks: Vec<TaskHandle>) -> Self {
        Self {
            description: description.into(),
            tasks,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Stop the tasks in the order they were started.
    pub async fn stop(self) {
        for task in self.tasks {
            debug!(task = task.name(), "Stopping task");
            task.stop().await;
        }
        debug!(source = %self.description, "Source stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JobQueue;
    use std::time::Duration;
    use tokio::sync::watch;

    fn ingest(capacity: usize) -> (Ingest, JobQueue) {
        let queue = JobQueue::new("t", capacity);
        let router = Router::new(vec![queue.clone()], Duration::from_millis(50));
        (
            Ingest::new(PerfdataParser::new(), router, Stats::new()),
            queue,
        )
    }

    const LINE: &str = "DATATYPE::SERVICEPERFDATA\tTIMET::1441791000\tHOSTNAME::h\t\
                        SERVICEDESC::s\tSERVICEPERFDATA::a=1 b=2\tSERVICECHECKCOMMAND::c";

    #[tokio::test]
    async fn lines_queue_points_and_count() {
        let (ingest, queue) = ingest(16);
        let (_stop_tx, stop) = watch::channel(false);
        let text = format!("{}\n\nDATATYPE::OTHER\tX::y\ngarbage\n{}\n", LINE, LINE);

        assert_eq!(ingest.lines(&text, &stop).await.unwrap(), 4);
        assert_eq!(queue.len(), 4);

        let snap = ingest.stats().snapshot();
        assert_eq!(snap.records_parsed, 3);
        assert_eq!(snap.records_skipped, 1);
        assert_eq!(snap.points_emitted, 4);
    }

    #[tokio::test]
    async fn invalid_time_is_skipped() {
        let (ingest, queue) = ingest(16);
        let (_stop_tx, stop) = watch::channel(false);
        let line = LINE.replace("1441791000", "soon");

        assert_eq!(ingest.lines(&line, &stop).await.unwrap(), 0);
        assert!(queue.is_empty());
        assert_eq!(ingest.stats().snapshot().records_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_gives_up_when_stopped() {
        let (ingest, _queue) = ingest(1);
        let (stop_tx, stop) = watch::channel(false);

        let task = tokio::spawn(async move { ingest.lines(LINE, &stop).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop_tx.send(true).unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(DispatchError::Stopped)));
    }

    #[tokio::test]
    async fn custom_separators() {
        let (ingest, queue) = ingest(16);
        let ingest = ingest.with_separators("|", "=");
        let (_stop_tx, stop) = watch::channel(false);
        let line = "DATATYPE=HOSTPERFDATA|TIMET=1|HOSTNAME=h|HOSTPERFDATA=rta=1ms";

        assert_eq!(ingest.lines(line, &stop).await.unwrap(), 1);
        assert_eq!(queue.len(), 1);
    }
}
