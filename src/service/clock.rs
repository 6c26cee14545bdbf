//! DeviceClock - local time plus a smoothed offset to a remote clock
//!
//! Local time is a monotonic tokio `Instant` anchored to the wall clock once,
//! so scheduling stays consistent under a paused test clock. When a remote
//! time source is configured the offset to it is measured on `sync` and
//! smoothed; `now` never calls the remote side.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often a remote clock is re-measured
pub const CLOCK_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Weight of a new offset sample against the running offset
const OFFSET_SMOOTHING: f64 = 0.25;

/// Remote clock, e.g. a studio time server
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Remote time in milliseconds since the epoch
    async fn remote_time_ms(&self) -> anyhow::Result<i64>;
}

#[derive(Debug, Default)]
struct OffsetState {
    offset_ms: Option<f64>,
    syncs: u64,
}

pub struct DeviceClock {
    anchor: Instant,
    anchor_ms: i64,
    source: Option<Arc<dyn TimeSource>>,
    offset: Mutex<OffsetState>,
}

impl DeviceClock {
    /// Clock with no remote source
    pub fn local() -> Self {
        Self::with_source(None)
    }

    pub fn with_source(source: Option<Arc<dyn TimeSource>>) -> Self {
        let anchor_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            anchor: Instant::now(),
            anchor_ms,
            source,
            offset: Mutex::new(OffsetState::default()),
        }
    }

    /// Local time in milliseconds since the epoch
    pub fn local_ms(&self) -> i64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as i64
    }

    /// Current device time (local time corrected by the remote offset)
    pub fn now(&self) -> i64 {
        let offset = self.offset.lock().offset_ms.unwrap_or(0.0);
        self.local_ms() + offset.round() as i64
    }

    /// Tokio instant at which the device clock reads `time`
    pub fn instant_at(&self, time: i64) -> Instant {
        let delta = time - self.now();
        if delta <= 0 {
            Instant::now()
        } else {
            Instant::now() + Duration::from_millis(delta as u64)
        }
    }

    pub fn has_remote(&self) -> bool {
        self.source.is_some()
    }

    /// Number of successful remote measurements
    pub fn sync_count(&self) -> u64 {
        self.offset.lock().syncs
    }

    /// Measure the remote offset once
    ///
    /// The sample is taken against the midpoint of the request so round trip
    /// latency cancels out. The first sample is taken as is, later ones are
    /// blended in.
    pub async fn sync(&self) {
        let Some(source) = &self.source else {
            return;
        };

        let before = self.local_ms();
        let remote = match source.remote_time_ms().await {
            Ok(t) => t,
            Err(e) => {
                warn!("Remote clock sync failed: {}", e);
                return;
            }
        };
        let after = self.local_ms();

        let sample = remote as f64 - (before + after) as f64 / 2.0;
        let mut state = self.offset.lock();
        let offset = match state.offset_ms {
            Some(prev) => prev + (sample - prev) * OFFSET_SMOOTHING,
            None => sample,
        };
        state.offset_ms = Some(offset);
        state.syncs += 1;
        debug!(offset_ms = offset, round_trip_ms = after - before, "Clock synced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Remote clock running a fixed amount ahead of ours
    struct AheadSource {
        clock_anchor: i64,
        start: Instant,
        ahead_ms: i64,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TimeSource for AheadSource {
        async fn remote_time_ms(&self) -> anyhow::Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.clock_anchor + self.start.elapsed().as_millis() as i64 + self.ahead_ms)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_clock_advances() {
        let clock = DeviceClock::local();
        let t0 = clock.now();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now() - t0, 250);
        clock.sync().await;
        assert_eq!(clock.sync_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_offset_applied() {
        let local = DeviceClock::local();
        let source = Arc::new(AheadSource {
            clock_anchor: local.local_ms(),
            start: Instant::now(),
            ahead_ms: 5000,
            calls: AtomicU32::new(0),
        });
        let clock = DeviceClock::with_source(Some(source.clone() as Arc<dyn TimeSource>));
        clock.sync().await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!((clock.now() - (clock.local_ms() + 5000)).abs() <= 10);

        // now() never goes to the remote side
        tokio::time::sleep(Duration::from_millis(250)).await;
        clock.now();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_at() {
        let clock = DeviceClock::local();
        let now = Instant::now();
        let at = clock.instant_at(clock.now() + 400);
        assert_eq!(at.duration_since(now), Duration::from_millis(400));
        assert!(clock.instant_at(clock.now() - 1000) <= Instant::now());
    }
}
