use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Named periodic task owned by whoever started it.
///
/// The first tick fires one `period` after start. `cancel()` stops it
/// synchronously: no tick runs after it returns, even if the task itself
/// has not been polled yet. Dropping the task cancels it too.
pub struct ScheduledTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn every<F>(name: &'static str, period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if token.is_cancelled() {
                            break;
                        }
                        on_tick();
                    }
                }
            }
            debug!("Scheduled task '{}' finished", name);
        });

        debug!("Scheduled task '{}' started ({}ms)", name, period.as_millis());

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the task. Idempotent.
    pub fn cancel(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("Cancelling scheduled task '{}'", self.name);
        }
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
