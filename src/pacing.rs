use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Process-wide spacing between provider calls.
///
/// Every outbound query, exact or broadened, takes one slot. The lock only
/// covers the wait itself and is released before the caller goes to the
/// network.
pub struct PacingGate {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl PacingGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn from_millis(min_interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_interval_ms))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait_my_turn(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let remaining = self.min_interval - elapsed;
                trace!(?remaining, "pacing gate holding next provider call");
                sleep(remaining).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
