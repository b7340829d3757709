//! Background lease-expiry sweep.

use crate::pool::Pool;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Periodically reminds holders of expired leases.
pub struct LeaseSupervisor {
    pool: Arc<Pool>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl LeaseSupervisor {
    /// Create a supervisor sweeping `pool` every `interval` until
    /// `shutdown` turns true.
    pub fn new(pool: Arc<Pool>, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            interval,
            shutdown,
        }
    }

    /// Run until shutdown is signalled or the sender goes away.
    pub async fn run(mut self) {
        tracing::info!(interval = ?self.interval, "lease supervisor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("lease supervisor stopped");
    }

    async fn sweep(&self) {
        match self.pool.sweep_expired(Utc::now()).await {
            Ok(0) => tracing::debug!("no expired leases"),
            Ok(count) => tracing::info!(count, "sent lease expiry reminders"),
            Err(e) => tracing::warn!(error = %e, "lease sweep failed"),
        }
    }
}
