//! Elasticsearch backend using the bulk API.
//!
//! Every job becomes one bulk record: an action line naming a monthly index
//! (`<index>-YYYY.MM`, taken from the record time) followed by the document.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use tracing::warn;

use perfflux_types::{DispatchJob, EventKind, EventRecord, MetricPoint};

use crate::{terminate_record, AdapterError, Backend};

/// Elasticsearch target.
#[derive(Debug, Clone)]
pub struct ElasticBackend {
    client: Client,
    name: String,
    endpoint: String,
    index: String,
}

impl ElasticBackend {
    /// Create a new builder for configuring the backend.
    pub fn builder() -> ElasticBackendBuilder {
        ElasticBackendBuilder::default()
    }

    /// Index a record with the given time belongs to.
    pub fn index_for(&self, time_ms: u64) -> String {
        let time = i64::try_from(time_ms)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        format!("{}-{}", self.index, time.format("%Y.%m"))
    }

    fn record(&self, time_ms: u64, document: Value) -> String {
        let action = json!({ "index": { "_index": self.index_for(time_ms) } });
        format!("{}\n{}\n", action, document)
    }

    fn render_point(&self, point: &MetricPoint) -> Option<String> {
        if point.fields.is_empty() {
            return None;
        }

        let mut doc = Map::new();
        doc.insert("timestamp".into(), json!(point.time_ms));
        doc.insert("type".into(), json!("metrics"));
        doc.insert("host".into(), json!(point.hostname));
        doc.insert("service".into(), json!(point.service));
        doc.insert("command".into(), json!(point.command));
        doc.insert("performanceLabel".into(), json!(point.label));
        doc.insert("unit".into(), json!(point.unit));
        for (key, value) in &point.tags {
            doc.insert(key.clone(), json!(value));
        }
        for (key, value) in &point.fields {
            doc.insert(key.clone(), numeric(value));
        }

        Some(self.record(point.time_ms, Value::Object(doc)))
    }

    fn render_event(&self, event: &EventRecord) -> String {
        let base = &event.base;
        let mut doc = Map::new();
        doc.insert("timestamp".into(), json!(base.time_ms));
        doc.insert("type".into(), json!(event.kind.name()));
        doc.insert("host".into(), json!(base.host));
        doc.insert("service".into(), json!(base.service));
        doc.insert("author".into(), json!(base.author));
        doc.insert("message".into(), json!(base.text));

        match &event.kind {
            EventKind::Comment { entry_type } => {
                doc.insert("entryType".into(), json!(entry_type));
            }
            EventKind::Downtime { end_ms } => {
                doc.insert("endTime".into(), json!(end_ms));
            }
            EventKind::Notification {
                notification_type,
                state,
                command,
            } => {
                doc.insert("notificationType".into(), json!(notification_type));
                doc.insert("state".into(), json!(state));
                doc.insert("command".into(), json!(command));
            }
        }

        self.record(base.time_ms, Value::Object(doc))
    }
}

#[async_trait]
impl Backend for ElasticBackend {
    fn kind(&self) -> &'static str {
        "elasticsearch"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, job: &DispatchJob) -> Option<String> {
        match job {
            DispatchJob::Point(point) => self.render_point(point),
            DispatchJob::Event(event) => Some(self.render_event(event)),
            DispatchJob::Raw(raw) if raw.trim().is_empty() => None,
            DispatchJob::Raw(raw) => Some(terminate_record(raw.clone())),
        }
    }

    /// A bulk record is an action line plus its document line.
    fn split_records(&self, payload: &str) -> Vec<String> {
        let lines: Vec<&str> = payload
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        lines
            .chunks(2)
            .map(|pair| {
                let mut record = pair.join("\n");
                record.push('\n');
                record
            })
            .collect()
    }

    async fn is_alive(&self) -> bool {
        match self.client.get(format!("{}/", self.endpoint)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn send(&self, payload: String) -> Result<(), AdapterError> {
        let response = self
            .client
            .post(format!("{}/_bulk", self.endpoint))
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if let Some(err) = AdapterError::from_status(status, &body) {
            return Err(err);
        }

        // A 2xx means the batch was stored, even if the summary is unreadable.
        match serde_json::from_str::<BulkResponse>(&body) {
            Ok(summary) if summary.errors => Err(AdapterError::Rejected(summary.first_error())),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(target_name = %self.name, status, error = %e, "Unreadable bulk response");
                Ok(())
            }
        }
    }
}

/// Builder for ElasticBackend.
#[derive(Debug, Default)]
pub struct ElasticBackendBuilder {
    name: Option<String>,
    endpoint: Option<String>,
    index: Option<String>,
    timeout: Option<Duration>,
}

impl ElasticBackendBuilder {
    /// Set the target name (default: "elasticsearch").
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the server address (e.g., "http://localhost:9200").
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the index prefix (default: "perfflux").
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Set the request timeout (default: 10 seconds).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the backend.
    pub fn build(self) -> Result<ElasticBackend, AdapterError> {
        let index = self.index.unwrap_or_else(|| "perfflux".to_string());
        if index.is_empty() {
            return Err(AdapterError::Config("index must not be empty".to_string()));
        }

        let client = Client::builder()
            .timeout(self.timeout.unwrap_or(Duration::from_secs(10)))
            .build()
            .map_err(|e| AdapterError::Config(e.to_string()))?;

        let endpoint = self
            .endpoint
            .unwrap_or_else(|| "http://127.0.0.1:9200".to_string());

        Ok(ElasticBackend {
            client,
            name: self.name.unwrap_or_else(|| "elasticsearch".to_string()),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            index,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

impl BulkResponse {
    fn first_error(&self) -> String {
        self.items
            .iter()
            .filter_map(|item| item.as_object()?.values().next()?.get("error"))
            .map(|error| {
                error
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string())
            })
            .next()
            .unwrap_or_else(|| "bulk request reported errors".to_string())
    }
}

fn numeric(value: &str) -> Value {
    value
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfflux_types::EventBase;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP request with a canned response. Returns the base URL.
    async fn answer_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request_complete(&request) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn request_complete(request: &[u8]) -> bool {
        let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let length = String::from_utf8_lossy(&request[..end])
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }

    fn http_200(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn accepted_batch_with_unreadable_body_is_not_resent() {
        let url = answer_once(http_200("ok")).await;
        let backend = ElasticBackend::builder().endpoint(url).build().unwrap();
        backend.send("{}\n{}\n".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn bulk_item_errors_are_rejections() {
        let body = r#"{"errors":true,"items":[{"index":{"error":{"reason":"mapper_parsing_exception"}}}]}"#;
        let url = answer_once(http_200(body)).await;
        let backend = ElasticBackend::builder().endpoint(url).build().unwrap();
        let err = backend.send("{}\n{}\n".to_string()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Rejected(ref reason) if reason == "mapper_parsing_exception"));
    }

    fn backend() -> ElasticBackend {
        ElasticBackend::builder().index("nagios").build().unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let backend = ElasticBackend::builder().build().unwrap();
        assert_eq!(backend.name(), "elasticsearch");
        assert_eq!(backend.kind(), "elasticsearch");
        assert_eq!(backend.endpoint, "http://127.0.0.1:9200");
        assert_eq!(backend.index, "perfflux");
    }

    #[test]
    fn empty_index_is_rejected() {
        let result = ElasticBackend::builder().index("").build();
        assert!(matches!(result, Err(AdapterError::Config(_))));
    }

    #[test]
    fn monthly_index_from_record_time() {
        // 2015-09-09T09:30:00Z
        assert_eq!(backend().index_for(1_441_791_000_000), "nagios-2015.09");
        assert_eq!(backend().index_for(0), "nagios-1970.01");
    }

    #[test]
    fn renders_point_as_bulk_record() {
        let point = MetricPoint::builder()
            .hostname("xxx")
            .service("range")
            .command("check_ranges")
            .label("a used")
            .time_ms(1_441_791_000_000)
            .field("value", "4.0")
            .field("warn-min", "2.0")
            .tag("warn-fill", "outer")
            .build();

        let record = backend().render(&point.into()).unwrap();
        let lines: Vec<&str> = record.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(record.ends_with('\n'));

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "nagios-2015.09");

        let doc: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["host"], "xxx");
        assert_eq!(doc["performanceLabel"], "a used");
        assert_eq!(doc["value"], 4.0);
        assert_eq!(doc["warn-min"], 2.0);
        assert_eq!(doc["warn-fill"], "outer");
        assert_eq!(doc["timestamp"], 1_441_791_000_000u64);
    }

    #[test]
    fn renders_notification_event() {
        let event = EventRecord::new(
            EventBase {
                host: "web01".into(),
                service: "http".into(),
                time_ms: 1_441_791_000_000,
                author: "nagiosadmin".into(),
                text: "HTTP CRITICAL".into(),
            },
            EventKind::Notification {
                notification_type: "PROBLEM".into(),
                state: "CRITICAL".into(),
                command: "notify-by-mail".into(),
            },
        );

        let record = backend().render(&event.into()).unwrap();
        let doc: Value = serde_json::from_str(record.lines().nth(1).unwrap()).unwrap();
        assert_eq!(doc["type"], "notification");
        assert_eq!(doc["state"], "CRITICAL");
        assert_eq!(doc["message"], "HTTP CRITICAL");
    }

    #[test]
    fn split_records_pairs_lines() {
        let payload = "{\"index\":{}}\n{\"a\":1}\n\n{\"index\":{}}\n{\"b\":2}\n";
        let records = backend().split_records(payload);
        assert_eq!(
            records,
            vec![
                "{\"index\":{}}\n{\"a\":1}\n".to_string(),
                "{\"index\":{}}\n{\"b\":2}\n".to_string(),
            ]
        );
    }

    #[test]
    fn bulk_error_reason_is_reported() {
        let body = r#"{"took":3,"errors":true,"items":[
            {"index":{"status":201}},
            {"index":{"status":400,"error":{"type":"mapper_parsing_exception","reason":"failed to parse [value]"}}}
        ]}"#;
        let summary: BulkResponse = serde_json::from_str(body).unwrap();
        assert!(summary.errors);
        assert_eq!(summary.first_error(), "failed to parse [value]");
    }

    #[test]
    fn non_numeric_fields_stay_strings() {
        assert_eq!(numeric("4.5"), json!(4.5));
        assert_eq!(numeric("abc"), json!("abc"));
    }
}
