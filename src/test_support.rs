//! Shared fakes for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use perfflux_adapters::{terminate_record, AdapterError, Backend};
use perfflux_types::DispatchJob;

/// In-memory backend that records accepted payloads.
#[derive(Debug)]
pub struct FakeBackend {
    name: String,
    alive: AtomicBool,
    accepted: Mutex<Vec<String>>,
    failures_left: AtomicUsize,
    failure: Mutex<Option<fn() -> AdapterError>>,
    reject: Mutex<Option<String>>,
    prepared: AtomicBool,
}

impl FakeBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            alive: AtomicBool::new(true),
            accepted: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            failure: Mutex::new(None),
            reject: Mutex::new(None),
            prepared: AtomicBool::new(false),
        })
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Fail the next `n` sends with the error `make` builds.
    pub fn fail_next(&self, n: usize, make: fn() -> AdapterError) {
        *self.failure.lock() = Some(make);
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Refuse every payload containing `needle`.
    pub fn reject_containing(&self, needle: &str) {
        *self.reject.lock() = Some(needle.to_string());
    }

    pub fn payloads(&self) -> Vec<String> {
        self.accepted.lock().clone()
    }

    pub fn was_prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    /// Wait (in test time) until at least `n` payloads were accepted.
    pub async fn wait_for_payloads(&self, n: usize) {
        for _ in 0..10_000 {
            if self.accepted.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} payloads, got {:?}", n, self.payloads());
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, job: &DispatchJob) -> Option<String> {
        match job {
            DispatchJob::Raw(raw) if raw.trim().is_empty() => None,
            DispatchJob::Raw(raw) => Some(terminate_record(raw.clone())),
            DispatchJob::Point(point) => Some(format!(
                "{} {} {}\n",
                point.hostname,
                point.label,
                point.field("value").unwrap_or("-")
            )),
            DispatchJob::Event(event) => {
                Some(format!("{} {}\n", event.kind.name(), event.base.host))
            }
        }
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn prepare(&self) -> Result<(), AdapterError> {
        self.prepared.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, payload: String) -> Result<(), AdapterError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            if let Some(make) = *self.failure.lock() {
                return Err(make());
            }
        }
        if let Some(needle) = self.reject.lock().as_deref() {
            if payload.contains(needle) {
                return Err(AdapterError::Rejected(format!("contains {}", needle)));
            }
        }
        self.accepted.lock().push(payload);
        Ok(())
    }
}
