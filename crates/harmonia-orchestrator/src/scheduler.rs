use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handles of the background loops started by the engine.
///
/// Dropping it leaves the loops running; call [`LoopHandles::shutdown`] to
/// stop them.
pub struct LoopHandles {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl LoopHandles {
    pub(crate) fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Run `tick` every `period` until shutdown. The first tick fires after
    /// `first_delay`.
    pub(crate) fn spawn_periodic<F, Fut>(
        &mut self,
        name: &'static str,
        period: Duration,
        first_delay: Duration,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + first_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(loop_name = name, period_ms = period.as_millis() as u64, "Loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!(loop_name = name, "Tick");
                        tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(loop_name = name, "Loop stopped");
        });
        self.handles.push((name, handle));
    }

    /// Names of the running loops.
    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Signal every loop to stop and wait for them to finish their current tick.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(loop_name = name, error = %e, "Loop ended abnormally");
            }
        }
    }
}
