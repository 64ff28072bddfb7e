use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rota_core::config::SchedulerConfig;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::SchedulerError;
use crate::index::ScheduleIndex;
use crate::tick::TickProcessor;

/// Periodic driver for a [`TickProcessor`].
///
/// Ticks once at startup, then on wall-clock multiples of the interval, so an
/// hourly loop fires just after each hour begins. Each tick runs under its
/// own child cancellation token and a deadline. A shutdown signal cancels the
/// tick in flight; it stops at the next event boundary. After every tick the
/// expired events are swept from the index.
pub struct TickLoop {
    processor: Arc<dyn TickProcessor>,
    index: Arc<ScheduleIndex>,
    interval: Duration,
    timeout: Duration,
}

impl TickLoop {
    pub fn new(
        processor: Arc<dyn TickProcessor>,
        index: Arc<ScheduleIndex>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            processor,
            index,
            interval: Duration::from_secs(config.tick_interval_secs.max(1)),
            timeout: Duration::from_secs(config.tick_timeout_secs.max(1)),
        }
    }

    /// Main loop. Runs until `shutdown` broadcasts `true` or its sender is
    /// dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let delay = delay_to_boundary(Utc::now(), self.interval);
        info!(
            interval_secs = self.interval.as_secs(),
            first_boundary_in_ms = delay.as_millis() as u64,
            "tick loop started"
        );
        let root = CancellationToken::new();
        let mut interval = tokio::time::interval_at(Instant::now() + delay, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut startup = true;
        loop {
            if !startup {
                tokio::select! {
                    _ = interval.tick() => {}
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            info!("tick loop shutting down");
                            break;
                        }
                        continue;
                    }
                }
            }
            startup = false;

            let token = root.child_token();
            tokio::select! {
                _ = self.tick(&token) => {}
                res = shutdown.changed() => {
                    token.cancel();
                    if res.is_err() || *shutdown.borrow() {
                        info!("tick loop shutting down mid-tick");
                        break;
                    }
                }
            }
        }
        root.cancel();
    }

    async fn tick(&self, token: &CancellationToken) {
        match tokio::time::timeout(self.timeout, self.processor.process_tick("", token)).await {
            Ok(Ok(report)) => {
                if report.failures > 0 {
                    warn!(
                        failures = report.failures,
                        bucket = %report.bucket,
                        "tick finished with failures"
                    );
                }
            }
            Ok(Err(SchedulerError::Cancelled { processed })) => {
                warn!(processed, "tick cancelled");
            }
            Ok(Err(e)) => error!(code = e.code(), "tick error: {e}"),
            Err(_) => {
                token.cancel();
                error!(timeout_secs = self.timeout.as_secs(), "tick timed out");
            }
        }
        if let Err(e) = self.index.purge_expired(Utc::now()) {
            error!("expired event sweep failed: {e}");
        }
    }
}

/// Time from `now` to the next wall-clock multiple of `period`. A `now`
/// exactly on a boundary waits a whole period.
fn delay_to_boundary(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1);
    let now_ms = u128::try_from(now.timestamp_millis()).unwrap_or(0);
    let wait_ms = period_ms - now_ms % period_ms;
    Duration::from_millis(u64::try_from(wait_ms).unwrap_or(u64::MAX))
}
