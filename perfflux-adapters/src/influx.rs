//! InfluxDB backend using the HTTP write API.
//!
//! Points are written to the `metrics` measurement, events to `messages`,
//! both as line protocol with millisecond timestamps:
//!
//! ```text
//! metrics,host=web01,service=disk\ /,command=check_disk,performanceLabel=used,unit=MB,warn-fill=none value=4.0,warn=2.0 1441791000000
//! messages,host=web01,type=comment,author=admin message="rebooting" 1441791000000
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use perfflux_adapters::influx::InfluxBackend;
//! use perfflux_adapters::Backend;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = InfluxBackend::builder()
//!         .endpoint("http://localhost:8086")
//!         .arguments("precision=ms&db=perfflux")
//!         .create_database("perfflux")
//!         .build()?;
//!
//!     if backend.is_alive().await {
//!         backend.prepare().await?;
//!     }
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use perfflux_types::{DispatchJob, EventKind, EventRecord, MetricPoint};

use crate::{terminate_record, AdapterError, Backend};

const POINT_MEASUREMENT: &str = "metrics";
const EVENT_MEASUREMENT: &str = "messages";

/// InfluxDB target.
#[derive(Debug, Clone)]
pub struct InfluxBackend {
    client: Client,
    name: String,
    endpoint: String,
    arguments: String,
    database: Option<String>,
}

impl InfluxBackend {
    /// Create a new builder for configuring the backend.
    pub fn builder() -> InfluxBackendBuilder {
        InfluxBackendBuilder::default()
    }

    /// Full URL of the write endpoint.
    pub fn write_url(&self) -> String {
        if self.arguments.is_empty() {
            format!("{}/write", self.endpoint)
        } else {
            format!("{}/write?{}", self.endpoint, self.arguments)
        }
    }

    fn render_point(point: &MetricPoint) -> Option<String> {
        if point.fields.is_empty() {
            return None;
        }

        let mut line = String::from(POINT_MEASUREMENT);
        push_tag(&mut line, "host", &point.hostname);
        push_tag(&mut line, "service", &point.service);
        push_tag(&mut line, "command", &point.command);
        push_tag(&mut line, "performanceLabel", &point.label);
        push_tag(&mut line, "unit", &point.unit);
        for (key, value) in &point.tags {
            push_tag(&mut line, key, value);
        }

        line.push(' ');
        let fields: Vec<String> = point
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape(key), value))
            .collect();
        line.push_str(&fields.join(","));
        line.push(' ');
        line.push_str(&point.time_ms.to_string());

        Some(terminate_record(line))
    }

    fn render_event(event: &EventRecord) -> String {
        let base = &event.base;
        let mut line = String::from(EVENT_MEASUREMENT);
        push_tag(&mut line, "host", &base.host);
        push_tag(&mut line, "service", &base.service);
        push_tag(&mut line, "type", event.kind.name());
        push_tag(&mut line, "author", &base.author);

        let mut fields = vec![format!("message=\"{}\"", escape_string_field(&base.text))];
        match &event.kind {
            EventKind::Comment { entry_type } => {
                push_tag(&mut line, "entryType", entry_type);
            }
            EventKind::Downtime { end_ms } => {
                fields.push(format!("endTime={}i", end_ms));
            }
            EventKind::Notification {
                notification_type,
                state,
                command,
            } => {
                push_tag(&mut line, "notificationType", notification_type);
                push_tag(&mut line, "state", state);
                push_tag(&mut line, "command", command);
            }
        }

        line.push(' ');
        line.push_str(&fields.join(","));
        line.push(' ');
        line.push_str(&base.time_ms.to_string());
        terminate_record(line)
    }
}

#[async_trait]
impl Backend for InfluxBackend {
    fn kind(&self) -> &'static str {
        "influxdb"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, job: &DispatchJob) -> Option<String> {
        match job {
            DispatchJob::Point(point) => Self::render_point(point),
            DispatchJob::Event(event) => Some(Self::render_event(event)),
            DispatchJob::Raw(raw) if raw.trim().is_empty() => None,
            DispatchJob::Raw(raw) => Some(terminate_record(raw.clone())),
        }
    }

    async fn is_alive(&self) -> bool {
        match self.client.get(format!("{}/ping", self.endpoint)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn prepare(&self) -> Result<(), AdapterError> {
        let Some(database) = &self.database else {
            return Ok(());
        };

        let statement = format!("CREATE DATABASE \"{}\"", database.replace('"', "\\\""));
        let response = self
            .client
            .post(format!("{}/query", self.endpoint))
            .query(&[("q", statement.as_str())])
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match AdapterError::from_status(status, &body) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn send(&self, payload: String) -> Result<(), AdapterError> {
        let response = self.client.post(self.write_url()).body(payload).send().await?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        match AdapterError::from_status(status, &body) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Builder for InfluxBackend.
#[derive(Debug, Default)]
pub struct InfluxBackendBuilder {
    name: Option<String>,
    endpoint: Option<String>,
    arguments: Option<String>,
    database: Option<String>,
    timeout: Option<Duration>,
}

impl InfluxBackendBuilder {
    /// Set the target name (default: "influxdb").
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the server address (e.g., "http://localhost:8086").
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the query string of the write endpoint
    /// (default: "precision=ms&db=perfflux").
    pub fn arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    /// Create this database in `prepare()`.
    pub fn create_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the request timeout (default: 10 seconds).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the backend.
    pub fn build(self) -> Result<InfluxBackend, AdapterError> {
        let timeout = self.timeout.unwrap_or(Duration::from_secs(10));

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Config(e.to_string()))?;

        let endpoint = self
            .endpoint
            .unwrap_or_else(|| "http://127.0.0.1:8086".to_string());

        Ok(InfluxBackend {
            client,
            name: self.name.unwrap_or_else(|| "influxdb".to_string()),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            arguments: self
                .arguments
                .unwrap_or_else(|| "precision=ms&db=perfflux".to_string())
                .trim_start_matches('?')
                .to_string(),
            database: self.database,
        })
    }
}

fn push_tag(line: &mut String, key: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    line.push(',');
    line.push_str(&escape(key));
    line.push('=');
    line.push_str(&escape(value));
}

/// Escape commas, spaces and equal signs for measurement names, tag keys,
/// tag values and field keys.
///
/// Characters that already follow a backslash are left as they are, so
/// escaping twice gives the same result as escaping once. A trailing lone
/// backslash is doubled so it cannot swallow the following separator.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push_str("\\\\"),
            },
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(c);
            }
            '\n' | '\r' | '\t' => {
                out.push_str("\\ ");
            }
            _ => out.push(c),
        }
    }
    out
}

/// Escape a string field value (to be wrapped in double quotes).
fn escape_string_field(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfflux_types::EventBase;

    fn backend() -> InfluxBackend {
        InfluxBackend::builder().build().unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let backend = backend();
        assert_eq!(backend.name(), "influxdb");
        assert_eq!(backend.kind(), "influxdb");
        assert_eq!(
            backend.write_url(),
            "http://127.0.0.1:8086/write?precision=ms&db=perfflux"
        );
        assert!(backend.database.is_none());
    }

    #[test]
    fn test_builder_custom() {
        let backend = InfluxBackend::builder()
            .name("primary")
            .endpoint("http://influx.local:8086/")
            .arguments("?db=nagios&precision=ms&u=writer&p=secret")
            .create_database("nagios")
            .build()
            .unwrap();

        assert_eq!(backend.name(), "primary");
        assert_eq!(
            backend.write_url(),
            "http://influx.local:8086/write?db=nagios&precision=ms&u=writer&p=secret"
        );
        assert_eq!(backend.database.as_deref(), Some("nagios"));
    }

    #[test]
    fn renders_point_as_line_protocol() {
        let point = MetricPoint::builder()
            .hostname("web01")
            .service("disk /")
            .command("check_disk")
            .label("a used")
            .unit("MB")
            .time_ms(1_441_791_000_000)
            .field("value", "4.0")
            .field("warn", "2.0")
            .tag("warn-fill", "none")
            .build();

        let line = backend().render(&point.into()).unwrap();
        assert_eq!(
            line,
            "metrics,host=web01,service=disk\\ /,command=check_disk,performanceLabel=a\\ used,\
             unit=MB,warn-fill=none value=4.0,warn=2.0 1441791000000\n"
        );
    }

    #[test]
    fn host_points_omit_empty_tags() {
        let point = MetricPoint::builder()
            .hostname("web01")
            .command("check_ping")
            .label("rta")
            .time_ms(1000)
            .field("value", "0.5")
            .build();

        let line = backend().render(&point.into()).unwrap();
        assert_eq!(
            line,
            "metrics,host=web01,command=check_ping,performanceLabel=rta value=0.5 1000\n"
        );
    }

    #[test]
    fn point_without_fields_is_not_rendered() {
        let point = MetricPoint::builder().hostname("h").label("l").build();
        assert!(backend().render(&point.into()).is_none());
    }

    #[test]
    fn renders_events() {
        let base = EventBase {
            host: "web01".into(),
            service: String::new(),
            time_ms: 1000,
            author: "admin".into(),
            text: "say \"hi\"".into(),
        };
        let comment = EventRecord::comment(base.clone(), "1");
        assert_eq!(
            backend().render(&comment.into()).unwrap(),
            "messages,host=web01,type=comment,author=admin,entryType=1 message=\"say \\\"hi\\\"\" 1000\n"
        );

        let downtime = EventRecord::downtime(base, 5000);
        assert_eq!(
            backend().render(&downtime.into()).unwrap(),
            "messages,host=web01,type=downtime,author=admin message=\"say \\\"hi\\\"\",endTime=5000i 1000\n"
        );
    }

    #[test]
    fn raw_jobs_pass_through() {
        let raw = DispatchJob::Raw("metrics,host=a value=1.0 1\nmetrics,host=b value=2.0 2".into());
        assert_eq!(
            backend().render(&raw).unwrap(),
            "metrics,host=a value=1.0 1\nmetrics,host=b value=2.0 2\n"
        );
        assert!(backend().render(&DispatchJob::Raw("\n".into())).is_none());
    }

    #[test]
    fn split_records_by_line() {
        let records = backend().split_records("a 1\n\nb 2\n");
        assert_eq!(records, vec!["a 1\n".to_string(), "b 2\n".to_string()]);
    }

    #[test]
    fn escape_special_characters() {
        assert_eq!(escape("a b,c=d"), "a\\ b\\,c\\=d");
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("trailing\\"), "trailing\\\\");
    }

    #[test]
    fn escape_is_idempotent() {
        for input in ["a b", "a\\ b", "x,y=z", "end\\", "C:\\temp dir", "tab\there"] {
            let once = escape(input);
            assert_eq!(escape(&once), once, "input {:?}", input);
        }
    }
}
