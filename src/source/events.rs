//! Collects comments, downtimes and notifications from the status
//! interface and queues them as events.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, info};

use perfflux_adapters::livestatus::Row;
use perfflux_types::{DispatchJob, EventBase, EventKind, EventRecord};

use super::SourceHandle;
use crate::dispatch::Router;
use crate::downtime::{collect_rows, StatusQuery};
use crate::stats::Stats;
use crate::task::{stopped, StopSignal, TaskHandle};

/// Polls the status interface for recent events.
#[derive(Debug, Clone)]
pub struct EventCollector {
    status: Arc<dyn StatusQuery>,
    interval: Duration,
}

impl EventCollector {
    pub fn new(status: Arc<dyn StatusQuery>, interval: Duration) -> Self {
        Self { status, interval }
    }

    /// Events are fetched from 1.5 intervals back so consecutive polls
    /// overlap.
    fn lookback(&self) -> Duration {
        self.interval * 3 / 2
    }

    /// Fetch every event newer than `since` (unix seconds).
    pub async fn collect(&self, since: u64) -> Vec<EventRecord> {
        let deadline = Instant::now() + self.interval / 2;
        let (comments, downtimes, notifications) = tokio::join!(
            collect_rows(self.status.query_stream(&comments_query(since)), deadline, "comments"),
            collect_rows(self.status.query_stream(&downtimes_query(since)), deadline, "downtimes"),
            collect_rows(
                self.status.query_stream(&notifications_query(since)),
                deadline,
                "notifications"
            ),
        );

        let mut events = Vec::new();
        events.extend(comments.iter().filter_map(comment_event));
        events.extend(downtimes.iter().filter_map(downtime_event));
        events.extend(notifications.iter().filter_map(notification_event));
        events
    }

    pub fn start(self, router: Router, stats: Arc<Stats>) -> SourceHandle {
        info!(interval = ?self.interval, "Status event collector started");
        let task = TaskHandle::spawn("status-events", move |mut stop_rx| async move {
            loop {
                self.poll(&router, &stats, &stop_rx).await;
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = stopped(&mut stop_rx) => break,
                }
            }
        });
        SourceHandle::new("status events", vec![task])
    }

    async fn poll(&self, router: &Router, stats: &Stats, stop: &StopSignal) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let since = now.saturating_sub(self.lookback()).as_secs();

        let events = self.collect(since).await;
        let count = events.len();
        if count == 0 {
            return;
        }
        match router
            .dispatch_all(events.into_iter().map(DispatchJob::Event), stop)
            .await
        {
            Ok(()) => {
                Stats::add(&stats.events_collected, count as u64);
                debug!(events = count, "Queued status events");
            }
            Err(e) => debug!(error = %e, "Event dispatch interrupted"),
        }
    }
}

// The free-text column comes last so `;` inside it survives the row split.

fn comments_query(since: u64) -> String {
    format!(
        "GET comments\n\
         Columns: host_name service_description entry_time author entry_type comment\n\
         Filter: entry_time > {}\n\
         OutputFormat: csv\n",
        since
    )
}

fn downtimes_query(since: u64) -> String {
    format!(
        "GET downtimes\n\
         Columns: host_name service_description start_time end_time author comment\n\
         Filter: entry_time > {}\n\
         OutputFormat: csv\n",
        since
    )
}

fn notifications_query(since: u64) -> String {
    format!(
        "GET log\n\
         Columns: time contact_name message\n\
         Filter: class = 3\n\
         Filter: time > {}\n\
         OutputFormat: csv\n",
        since
    )
}

/// Cells from `from` on, joined back with `;`.
fn rest(row: &Row, from: usize) -> String {
    row.get(from..).map(|cells| cells.join(";")).unwrap_or_default()
}

fn millis(secs: &str) -> Option<u64> {
    secs.trim().parse::<u64>().ok().map(|s| s * 1000)
}

fn comment_event(row: &Row) -> Option<EventRecord> {
    let [host, service, entry, author, entry_type, ..] = row.as_slice() else {
        return None;
    };
    let base = EventBase {
        host: host.clone(),
        service: service.clone(),
        time_ms: millis(entry)?,
        author: author.clone(),
        text: rest(row, 5),
    };
    Some(EventRecord::comment(base, entry_type.trim()))
}

fn downtime_event(row: &Row) -> Option<EventRecord> {
    let [host, service, start, end, author, ..] = row.as_slice() else {
        return None;
    };
    let base = EventBase {
        host: host.clone(),
        service: service.clone(),
        time_ms: millis(start)?,
        author: author.clone(),
        text: rest(row, 5),
    };
    Some(EventRecord::downtime(base, millis(end)?))
}

/// Parses `HOST NOTIFICATION: contact;host;state;command;output` and
/// `SERVICE NOTIFICATION: contact;host;service;state;command;output`.
fn notification_event(row: &Row) -> Option<EventRecord> {
    let [time, contact, ..] = row.as_slice() else {
        return None;
    };
    let message = rest(row, 2);
    let (kind, body) = message.split_once(": ")?;
    let parts: Vec<&str> = body.splitn(6, ';').collect();

    let (host, service, state, command, output) = match (kind.trim(), parts.as_slice()) {
        ("HOST NOTIFICATION", [_, host, state, command, output @ ..]) => {
            (*host, "", *state, *command, output.join(";"))
        }
        ("SERVICE NOTIFICATION", [_, host, service, state, command, output @ ..]) => {
            (*host, *service, *state, *command, output.join(";"))
        }
        _ => return None,
    };
    let (notification_type, state) = notification_state(state);

    let base = EventBase {
        host: host.to_string(),
        service: service.to_string(),
        time_ms: millis(time)?,
        author: contact.clone(),
        text: output,
    };
    Some(EventRecord::new(
        base,
        EventKind::Notification {
            notification_type,
            state,
            command: command.to_string(),
        },
    ))
}

/// `ACKNOWLEDGEMENT (CRITICAL)` splits into type and state; a bare state
/// is a recovery when it is OK or UP and a problem otherwise.
fn notification_state(raw: &str) -> (String, String) {
    let raw = raw.trim();
    if let Some((kind, state)) = raw.split_once(" (") {
        return (kind.to_string(), state.trim_end_matches(')').to_string());
    }
    let kind = match raw {
        "OK" | "UP" => "RECOVERY",
        _ => "PROBLEM",
    };
    (kind.to_string(), raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JobQueue;
    use perfflux_adapters::AdapterError;
    use tokio::sync::{mpsc, watch};

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[derive(Debug)]
    struct FakeStatus;

    impl StatusQuery for FakeStatus {
        fn query_stream(&self, query: &str) -> mpsc::Receiver<Result<Row, AdapterError>> {
            let rows = if query.starts_with("GET comments") {
                vec![row(&["h", "s", "100", "admin", "1", "looking; into it"])]
            } else if query.starts_with("GET downtimes") {
                vec![row(&["h", "", "200", "300", "admin", "patching"])]
            } else {
                vec![
                    row(&["400", "oncall", "SERVICE NOTIFICATION: oncall;h;s;CRITICAL;notify-by-mail;disk full"]),
                    row(&["oops"]),
                ]
            };
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for r in rows {
                    let _ = tx.send(Ok(r)).await;
                }
            });
            rx
        }
    }

    #[test]
    fn queries_filter_by_time() {
        assert!(comments_query(42).contains("Filter: entry_time > 42\n"));
        assert!(notifications_query(7).contains("Filter: time > 7\n"));
        assert!(downtimes_query(1).ends_with("OutputFormat: csv\n"));
    }

    #[test]
    fn comment_text_keeps_separators() {
        let event = comment_event(&row(&["h", "s", "100", "admin", "1", "a", "b"])).unwrap();
        assert_eq!(event.base.text, "a;b");
        assert_eq!(event.base.time_ms, 100_000);
        assert_eq!(
            event.kind,
            EventKind::Comment {
                entry_type: "1".into()
            }
        );
        assert!(comment_event(&row(&["h", "s"])).is_none());
    }

    #[test]
    fn host_and_service_notifications() {
        let host = notification_event(&row(&[
            "10",
            "c",
            "HOST NOTIFICATION: c;h1;DOWN;host-notify;PING CRITICAL",
        ]))
        .unwrap();
        assert_eq!(host.base.host, "h1");
        assert_eq!(host.base.service, "");
        assert_eq!(host.base.text, "PING CRITICAL");
        assert_eq!(
            host.kind,
            EventKind::Notification {
                notification_type: "PROBLEM".into(),
                state: "DOWN".into(),
                command: "host-notify".into(),
            }
        );

        let ack = notification_event(&row(&[
            "10",
            "c",
            "SERVICE NOTIFICATION: c;h1;disk;ACKNOWLEDGEMENT (WARNING);notify;out;put",
        ]))
        .unwrap();
        assert_eq!(ack.base.service, "disk");
        assert_eq!(ack.base.text, "out;put");
        let EventKind::Notification {
            notification_type,
            state,
            ..
        } = ack.kind
        else {
            panic!("not a notification");
        };
        assert_eq!(notification_type, "ACKNOWLEDGEMENT");
        assert_eq!(state, "WARNING");

        assert!(notification_event(&row(&["10", "c", "EXTERNAL COMMAND: x"])).is_none());
    }

    #[test]
    fn recovery_state() {
        assert_eq!(
            notification_state("OK"),
            ("RECOVERY".to_string(), "OK".to_string())
        );
    }

    #[tokio::test]
    async fn collects_every_kind_and_skips_bad_rows() {
        let collector = EventCollector::new(Arc::new(FakeStatus), Duration::from_secs(120));
        let events = collector.collect(0).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["comment", "downtime", "notification"]);
        assert_eq!(events[0].base.text, "looking; into it");
        assert_eq!(
            events[1].kind,
            EventKind::Downtime { end_ms: 300_000 }
        );
    }

    #[tokio::test]
    async fn poll_queues_events_and_counts() {
        let queue = JobQueue::new("t", 16);
        let router = Router::new(vec![queue.clone()], Duration::from_millis(50));
        let stats = Stats::new();
        let (_stop_tx, stop) = watch::channel(false);

        let collector = EventCollector::new(Arc::new(FakeStatus), Duration::from_secs(120));
        assert_eq!(collector.lookback(), Duration::from_secs(180));
        collector.poll(&router, &stats, &stop).await;

        assert_eq!(queue.len(), 3);
        assert_eq!(stats.snapshot().events_collected, 3);
    }
}
