//! Background eviction of idle sessions.

use crate::registry::SessionRegistry;
use chrono::Utc;
use futures::FutureExt;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info};

/// Periodically removes sessions that have been inactive longer than a timeout.
pub struct EvictionSweeper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl EvictionSweeper {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval: interval.max(Duration::from_millis(1)),
            timeout,
        }
    }

    /// Runs the sweeper on its own task for the rest of the process lifetime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Sweeps every interval, forever. A panicking sweep is logged and the
    /// loop carries on with the next tick.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "Session sweeper started"
        );
        sweep_loop(self.interval, || self.sweep_once()).await
    }

    /// Evicts every session idle for longer than the timeout and returns how
    /// many were removed.
    pub async fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let timed_out: Vec<_> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|(_, session)| {
                (now - session.last_activity_at())
                    .to_std()
                    .is_ok_and(|idle| idle > self.timeout)
            })
            .collect();

        let mut evicted = 0;
        for (id, session) in timed_out {
            info!(session_id = %id, timeout_secs = self.timeout.as_secs(), "Session timed out after inactivity");
            if self.registry.remove(id.as_str()).await.is_some() {
                session.connection().close();
                evicted += 1;
            }
        }
        evicted
    }
}

async fn sweep_loop<F, Fut>(interval: Duration, mut sweep: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = usize>,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; the first sweep is one interval out.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match AssertUnwindSafe(sweep()).catch_unwind().await {
            Ok(0) => debug!("Session sweep found nothing to evict"),
            Ok(evicted) => info!(evicted, "Cleaned up timed out sessions"),
            Err(_) => error!("Session sweep panicked; continuing with next interval"),
        }
    }
}
