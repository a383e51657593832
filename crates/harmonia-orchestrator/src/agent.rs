use crate::types::{Task, TaskOutcome};
use async_trait::async_trait;
use harmonia_core::HarmoniaResult;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Simple health signal returned by an agent probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeSignal {
    Healthy,
    Unhealthy,
}

/// The capability-set interface every agent implements.
///
/// Both calls are made off the registry lock with an explicit timeout, so an
/// implementation may block on external work as long as it wants; the core
/// treats a late answer as a timeout.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Report current health. Errors count as a failed probe.
    async fn probe(&self) -> HarmoniaResult<ProbeSignal>;

    /// Perform the task. Implementations should watch `cancel` and stop early
    /// once it fires; the core never kills work it does not own.
    async fn execute(&self, task: &Task, cancel: CancelSignal) -> HarmoniaResult<TaskOutcome>;
}

/// Sending half of a cooperative cancellation flag.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half of a cooperative cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation was requested. Pends forever if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked cancellation handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}
