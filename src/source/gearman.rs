//! Gearman worker source.
//!
//! Connects to a Gearman job server, registers for the configured queues
//! and processes perfdata jobs as they are assigned. Payloads may be
//! base64 encoded and AES-256-ECB encrypted with a shared secret.
//!
//! ## Wire format
//!
//! Every packet has a 12 byte header followed by `size` bytes of
//! arguments separated by NUL:
//!
//! ```text
//! +--------+--------+--------+-----------------+
//! | magic  |  type  |  size  |   arguments     |
//! | 4 bytes| u32 BE | u32 BE |  size bytes     |
//! +--------+--------+--------+-----------------+
//! ```
//!
//! Requests carry `\0REQ`, responses `\0RES`.

use std::time::Duration;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes256;
use base64::Engine;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{Ingest, SourceHandle};
use crate::config::GearmanConfig;
use crate::dispatch::DispatchError;
use crate::task::{is_stopped, stopped, StopSignal, TaskHandle};

pub const CAN_DO: u32 = 1;
pub const PRE_SLEEP: u32 = 4;
pub const NOOP: u32 = 6;
pub const GRAB_JOB: u32 = 9;
pub const NO_JOB: u32 = 10;
pub const JOB_ASSIGN: u32 = 11;
pub const WORK_COMPLETE: u32 = 13;
pub const ERROR: u32 = 19;

pub const REQ: &[u8; 4] = b"\0REQ";
pub const RES: &[u8; 4] = b"\0RES";

const HEADER_LEN: usize = 12;
const MAX_PACKET: usize = 64 * 1024 * 1024;
const KEY_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

const RECONNECT_START: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GearmanError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Job server error: {0}")]
    Server(String),

    #[error("Gearman secret must not be empty")]
    EmptyKey,

    #[error("Payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Encrypted payload length {0} is not a multiple of 16")]
    BlockLength(usize),
}

/// One Gearman packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: u32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(kind: u32, args: &[&[u8]]) -> Self {
        Self {
            kind,
            data: args.join(&0u8),
        }
    }

    /// Split the data into at most `n` NUL separated arguments.
    pub fn args(&self, n: usize) -> Vec<&[u8]> {
        self.data.splitn(n, |b| *b == 0).collect()
    }

    pub fn encode(&self, magic: &[u8; 4]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len());
        buf.extend_from_slice(magic);
        buf.extend_from_slice(&self.kind.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }
}

/// Read one packet, checking its magic.
pub async fn read_packet<R>(reader: &mut R, magic: &[u8; 4]) -> Result<Packet, GearmanError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    if &header[..4] != magic {
        return Err(GearmanError::Protocol(format!(
            "unexpected magic {:?}",
            &header[..4]
        )));
    }
    let kind = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let size = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if size > MAX_PACKET {
        return Err(GearmanError::Protocol(format!("packet of {} bytes", size)));
    }

    let mut data = vec![0u8; size];
    reader.read_exact(&mut data).await?;
    Ok(Packet { kind, data })
}

pub async fn write_packet<W>(
    writer: &mut W,
    magic: &[u8; 4],
    packet: &Packet,
) -> Result<(), GearmanError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode(magic)).await?;
    writer.flush().await?;
    Ok(())
}

/// AES-256 key derived from the shared secret.
#[derive(Clone)]
pub struct GearmanKey {
    cipher: Aes256,
}

impl std::fmt::Debug for GearmanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GearmanKey(..)")
    }
}

impl GearmanKey {
    /// The secret is zero-padded or truncated to 32 bytes.
    pub fn new(secret: &str) -> Result<Self, GearmanError> {
        if secret.is_empty() {
            return Err(GearmanError::EmptyKey);
        }
        let mut key = [0u8; KEY_LEN];
        let bytes = secret.as_bytes();
        let len = bytes.len().min(KEY_LEN);
        key[..len].copy_from_slice(&bytes[..len]);
        Ok(Self {
            cipher: Aes256::new(GenericArray::from_slice(&key)),
        })
    }

    /// Base64 decode and decrypt a payload. Trailing padding is removed.
    pub fn decrypt(&self, payload: &[u8]) -> Result<String, GearmanError> {
        let trimmed = payload.trim_ascii();
        let mut data = base64::engine::general_purpose::STANDARD.decode(trimmed)?;
        if data.len() % BLOCK_LEN != 0 {
            return Err(GearmanError::BlockLength(data.len()));
        }
        for chunk in data.chunks_exact_mut(BLOCK_LEN) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }
        let text = String::from_utf8_lossy(&data);
        Ok(text.trim_end_matches(['\0', ' ', '\n', '\r', '\t']).to_string())
    }
}

/// Gearman job-queue source.
#[derive(Debug, Clone)]
pub struct GearmanSource {
    address: String,
    queues: Vec<String>,
    key: Option<GearmanKey>,
    workers: usize,
}

impl GearmanSource {
    pub fn new(config: &GearmanConfig) -> Result<Self, GearmanError> {
        let key = config.secret.as_deref().map(GearmanKey::new).transpose()?;
        Ok(Self {
            address: config.address.clone(),
            queues: config.queues.clone(),
            key,
            workers: config.workers.max(1),
        })
    }

    /// Turn a job payload into perfdata text.
    pub fn decode(&self, payload: &[u8]) -> Result<String, GearmanError> {
        match &self.key {
            Some(key) => key.decrypt(payload),
            None => Ok(String::from_utf8_lossy(payload).into_owned()),
        }
    }

    pub fn start(self, ingest: Ingest) -> SourceHandle {
        let tasks = (0..self.workers)
            .map(|id| {
                let source = self.clone();
                let ingest = ingest.clone();
                TaskHandle::spawn(format!("gearman-{}", id), move |stop_rx| {
                    source.run(id, ingest, stop_rx)
                })
            })
            .collect();
        info!(
            address = %self.address,
            queues = ?self.queues,
            workers = self.workers,
            encrypted = self.key.is_some(),
            "Gearman worker started"
        );
        SourceHandle::new(format!("gearman: {}", self.address), tasks)
    }

    /// Connect, serve, and reconnect with backoff until stopped.
    async fn run(self, id: usize, ingest: Ingest, mut stop_rx: StopSignal) {
        let mut backoff = RECONNECT_START;
        while !is_stopped(&stop_rx) {
            let connected = tokio::select! {
                result = TcpStream::connect(&self.address) => result,
                _ = stopped(&mut stop_rx) => break,
            };
            match connected {
                Ok(stream) => {
                    debug!(worker = id, address = %self.address, "Connected to job server");
                    backoff = RECONNECT_START;
                    match self.serve(stream, &ingest, &mut stop_rx).await {
                        Ok(()) => break,
                        Err(e) => warn!(worker = id, error = %e, "Job server session ended"),
                    }
                }
                Err(e) => {
                    warn!(worker = id, address = %self.address, error = %e, retry_in = ?backoff, "Could not connect to job server");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = stopped(&mut stop_rx) => break,
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    /// Run the worker protocol on one connection. Returns `Ok` when
    /// stopped.
    pub async fn serve<S>(
        &self,
        mut stream: S,
        ingest: &Ingest,
        stop_rx: &mut StopSignal,
    ) -> Result<(), GearmanError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for queue in &self.queues {
            write_packet(&mut stream, REQ, &Packet::new(CAN_DO, &[queue.as_bytes()])).await?;
        }

        loop {
            if is_stopped(stop_rx) {
                return Ok(());
            }
            write_packet(&mut stream, REQ, &Packet::new(GRAB_JOB, &[])).await?;

            let packet = tokio::select! {
                packet = read_packet(&mut stream, RES) => packet?,
                _ = stopped(stop_rx) => return Ok(()),
            };
            match packet.kind {
                JOB_ASSIGN => {
                    let args = packet.args(3);
                    let [handle, function, payload] = args.as_slice() else {
                        return Err(GearmanError::Protocol("short JOB_ASSIGN".to_string()));
                    };
                    if let Err(e) = self.handle_job(function, payload, ingest, stop_rx).await {
                        // Unacknowledged jobs are handed out again by the server.
                        info!(error = %e, "Job interrupted, leaving it to the job server");
                        return Ok(());
                    }
                    write_packet(&mut stream, REQ, &Packet::new(WORK_COMPLETE, &[*handle, b""]))
                        .await?;
                }
                NO_JOB => {
                    write_packet(&mut stream, REQ, &Packet::new(PRE_SLEEP, &[])).await?;
                    loop {
                        let packet = tokio::select! {
                            packet = read_packet(&mut stream, RES) => packet?,
                            _ = stopped(stop_rx) => return Ok(()),
                        };
                        match packet.kind {
                            NOOP => break,
                            ERROR => return Err(server_error(&packet)),
                            other => debug!(kind = other, "Ignoring packet while sleeping"),
                        }
                    }
                }
                NOOP => {}
                ERROR => return Err(server_error(&packet)),
                other => debug!(kind = other, "Ignoring unexpected packet"),
            }
        }
    }

    /// Ingest one job. Undecodable payloads are dropped; an error means
    /// the job was not fully queued and must not be acknowledged.
    async fn handle_job(
        &self,
        function: &[u8],
        payload: &[u8],
        ingest: &Ingest,
        stop: &StopSignal,
    ) -> Result<(), DispatchError> {
        let text = match self.decode(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    queue = %String::from_utf8_lossy(function),
                    error = %e,
                    "Dropping undecodable job"
                );
                return Ok(());
            }
        };
        ingest.lines(&text, stop).await.map(|_| ())
    }
}

fn server_error(packet: &Packet) -> GearmanError {
    let text = packet
        .args(2)
        .iter()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect::<Vec<_>>()
        .join(": ");
    GearmanError::Server(text)
}
