//! Client for the monitoring core's Livestatus interface.
//!
//! A query is a block of header lines terminated by an empty line. The core
//! answers with one CSV row per line (`;`-separated) and closes the
//! connection when the answer is complete.
//!
//! Rows are streamed through a channel so a caller that times out still
//! keeps the rows it has seen so far.
//!
//! ## Example
//!
//! ```rust,no_run
//! use perfflux_adapters::livestatus::LivestatusClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = LivestatusClient::new("127.0.0.1:6557".parse()?);
//!     let rows = client
//!         .query("GET hosts\nColumns: name state\nOutputFormat: csv\n")
//!         .await?;
//!     for row in rows {
//!         println!("{:?}", row);
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::AdapterError;

/// One response row.
pub type Row = Vec<String>;

/// Where the Livestatus socket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivestatusAddress {
    /// `host:port`
    Tcp(String),
    /// Path of a Unix domain socket.
    Unix(PathBuf),
}

impl FromStr for LivestatusAddress {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AdapterError::Config(
                "livestatus address must not be empty".to_string(),
            ));
        }
        if s.starts_with('/') || s.starts_with('.') {
            return Ok(LivestatusAddress::Unix(PathBuf::from(s)));
        }
        if !s.contains(':') {
            return Err(AdapterError::Config(format!(
                "livestatus address '{}' is neither host:port nor a socket path",
                s
            )));
        }
        Ok(LivestatusAddress::Tcp(s.to_string()))
    }
}

impl fmt::Display for LivestatusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivestatusAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
            LivestatusAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Connection-per-query Livestatus client.
#[derive(Debug, Clone)]
pub struct LivestatusClient {
    address: LivestatusAddress,
    connect_timeout: Duration,
}

impl LivestatusClient {
    pub fn new(address: LivestatusAddress) -> Self {
        Self {
            address,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set how long to wait for the socket to accept (default: 5 seconds).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn address(&self) -> &LivestatusAddress {
        &self.address
    }

    /// Run a query in the background, streaming rows as they arrive.
    ///
    /// The channel closes after the last row. A connection or read failure
    /// is delivered as a final `Err` item.
    pub fn query_stream(&self, query: &str) -> mpsc::Receiver<Result<Row, AdapterError>> {
        let (tx, rx) = mpsc::channel(256);
        let client = self.clone();
        let query = query.to_string();

        tokio::spawn(async move {
            if let Err(e) = client.run(&query, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    /// Run a query and collect every row.
    pub async fn query(&self, query: &str) -> Result<Vec<Row>, AdapterError> {
        let mut rx = self.query_stream(query);
        let mut rows = Vec::new();
        while let Some(row) = rx.recv().await {
            rows.push(row?);
        }
        Ok(rows)
    }

    async fn run(
        &self,
        query: &str,
        tx: &mpsc::Sender<Result<Row, AdapterError>>,
    ) -> Result<(), AdapterError> {
        match &self.address {
            LivestatusAddress::Tcp(addr) => {
                let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| AdapterError::Timeout)??;
                exchange(stream, query, tx).await
            }
            #[cfg(unix)]
            LivestatusAddress::Unix(path) => {
                let stream = tokio::time::timeout(
                    self.connect_timeout,
                    tokio::net::UnixStream::connect(path),
                )
                .await
                .map_err(|_| AdapterError::Timeout)??;
                exchange(stream, query, tx).await
            }
            #[cfg(not(unix))]
            LivestatusAddress::Unix(path) => Err(AdapterError::Config(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }
}

/// Make sure the query is terminated by exactly one empty line.
pub fn terminate_query(query: &str) -> String {
    let mut query = query.trim_end_matches(['\n', '\r']).to_string();
    query.push_str("\n\n");
    query
}

/// Write the query to `stream` and forward every response row to `tx`
/// until the peer closes the connection or the receiver is dropped.
pub async fn exchange<S>(
    stream: S,
    query: &str,
    tx: &mpsc::Sender<Result<Row, AdapterError>>,
) -> Result<(), AdapterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(terminate_query(query).as_bytes())
        .await?;
    stream.get_mut().flush().await?;

    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = stream.read_line(&mut line) => read?,
            _ = tx.closed() => return Ok(()),
        };
        if read == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            continue;
        }
        let row: Row = trimmed.split(';').map(str::to_string).collect();
        if tx.send(Ok(row)).await.is_err() {
            // Caller gave up
            return Ok(());
        }
    }
}
