//! Idle asset reaper
//!
//! Tracks the last playback touch per asset and periodically destroys the
//! transcoding state of assets that have been abandoned. This is a
//! staleness sweep, not an LRU: exact recency ordering is never needed,
//! only "has this been touched recently".

use std::collections::HashMap;
use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::transcoder::{Transcoder, UsageEvent};

/// Last-usage bookkeeping, separated from the driving task so the sweep
/// decision is testable with synthetic clocks.
pub(crate) struct Tracker {
    last_usage: HashMap<String, Instant>,
    idle_timeout: Duration,
}

impl Tracker {
    pub(crate) fn new(idle_timeout: Duration) -> Self {
        Self {
            last_usage: HashMap::new(),
            idle_timeout,
        }
    }

    pub(crate) fn note(&mut self, asset_id: String, now: Instant) {
        self.last_usage.insert(asset_id, now);
    }

    /// Remove and return every asset idle beyond the threshold.
    pub(crate) fn sweep(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.idle_timeout;
        let expired: Vec<String> = self
            .last_usage
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.last_usage.remove(id);
        }
        expired
    }
}

/// Drive a [`Tracker`] from the usage channel and a sweep timer. The task
/// holds a weak reference and exits when the transcoder is dropped or the
/// channel closes.
pub(crate) fn spawn(
    transcoder: Weak<Transcoder>,
    mut usage_rx: mpsc::Receiver<UsageEvent>,
    sweep_interval: Duration,
    idle_timeout: Duration,
) {
    tokio::spawn(async move {
        let mut tracker = Tracker::new(idle_timeout);
        let start = tokio::time::Instant::now() + sweep_interval;
        let mut timer = tokio::time::interval_at(start, sweep_interval);

        loop {
            tokio::select! {
                event = usage_rx.recv() => {
                    match event {
                        Some(event) => tracker.note(event.asset_id, Instant::now()),
                        None => break,
                    }
                }
                _ = timer.tick() => {
                    let Some(transcoder) = transcoder.upgrade() else {
                        break;
                    };
                    for asset_id in tracker.sweep(Instant::now()) {
                        if let Some(wrapper) = transcoder.streams.remove(&asset_id) {
                            info!(asset = %asset_id, "destroying idle stream");
                            wrapper.destroy();
                        }
                    }
                }
            }
        }
        debug!("tracker stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_only_expires_idle_assets() {
        let mut tracker = Tracker::new(Duration::from_secs(4 * 60 * 60));
        let t0 = Instant::now();
        tracker.note("asset-1".to_string(), t0);

        // 3h later: still fresh
        assert!(tracker.sweep(t0 + Duration::from_secs(3 * 60 * 60)).is_empty());

        // 5h later: expired and forgotten
        let expired = tracker.sweep(t0 + Duration::from_secs(5 * 60 * 60));
        assert_eq!(expired, vec!["asset-1".to_string()]);
        assert!(tracker
            .sweep(t0 + Duration::from_secs(6 * 60 * 60))
            .is_empty());
    }

    #[test]
    fn test_touch_resets_idle_clock() {
        let mut tracker = Tracker::new(Duration::from_secs(100));
        let t0 = Instant::now();
        tracker.note("asset-1".to_string(), t0);
        tracker.note("asset-1".to_string(), t0 + Duration::from_secs(90));

        assert!(tracker.sweep(t0 + Duration::from_secs(150)).is_empty());
        assert_eq!(
            tracker.sweep(t0 + Duration::from_secs(200)),
            vec!["asset-1".to_string()]
        );
    }

    #[test]
    fn test_sweep_handles_multiple_assets() {
        let mut tracker = Tracker::new(Duration::from_secs(10));
        let t0 = Instant::now();
        tracker.note("old".to_string(), t0);
        tracker.note("fresh".to_string(), t0 + Duration::from_secs(20));

        let expired = tracker.sweep(t0 + Duration::from_secs(25));
        assert_eq!(expired, vec!["old".to_string()]);
    }
}
