//! Background task handles with cooperative stop.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Receiving side of a stop signal. `true` means stop.
pub type StopSignal = watch::Receiver<bool>;

/// Handle for a spawned loop that watches a stop signal.
///
/// `stop()` resolves only after the loop has finished its in-flight work and
/// returned.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `task`, passing it the stop signal.
    pub fn spawn<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(task(stop_rx));
        Self {
            name: name.into(),
            stop_tx,
            join,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the task to stop without waiting.
    pub fn signal(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Signal the task and wait for it to return.
    pub async fn stop(self) {
        self.signal();
        if let Err(e) = self.join.await {
            tracing::error!(task = %self.name, error = %e, "Task ended abnormally");
        }
    }
}

/// Wait until the signal says stop (or its sender is gone).
pub async fn stopped(stop_rx: &mut StopSignal) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Non-blocking check of a stop signal.
pub fn is_stopped(stop_rx: &StopSignal) -> bool {
    *stop_rx.borrow()
}
