//! Keyframe boundary sequences
//!
//! A strictly ascending list of timestamps where the source can be cut
//! without re-encoding artifacts. Segment `i` spans
//! `[keyframes[i], keyframes[i+1])`; the final segment ends at the media
//! duration, which the metadata provider owns.
//!
//! Extraction may still be running when a stream starts consuming the
//! sequence: `add` appends under the write lock and fans out to registered
//! listeners, so streams can grow their segment tables and serve early
//! segments before the whole file has been scanned.

use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::{Error, Result};

type Listener = Box<dyn Fn(&[f64]) + Send + Sync>;

struct Inner {
    timestamps: Vec<f64>,
    is_complete: bool,
    listeners: Vec<Listener>,
}

/// Ascending keyframe timestamps with incremental, concurrently-observed
/// population.
pub struct Keyframe {
    // Lock order: this lock is always taken before any stream lock
    // (listeners run under it and may lock their stream).
    inner: RwLock<Inner>,
    progress_tx: watch::Sender<(usize, bool)>,
}

impl Keyframe {
    pub fn new(timestamps: Vec<f64>, is_complete: bool) -> Self {
        let progress = (timestamps.len(), is_complete);
        Self {
            inner: RwLock::new(Inner {
                timestamps,
                is_complete,
                listeners: Vec::new(),
            }),
            progress_tx: watch::channel(progress).0,
        }
    }

    pub fn get(&self, idx: usize) -> Option<f64> {
        self.inner.read().timestamps.get(idx).copied()
    }

    /// Number of boundaries and whether extraction has finished.
    pub fn len(&self) -> (usize, bool) {
        let inner = self.inner.read();
        (inner.timestamps.len(), inner.is_complete)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().timestamps.is_empty()
    }

    /// A read-only view of `[start, end)`. While extraction is incomplete
    /// the backing slice is still being appended to, so the view is a copy
    /// either way.
    pub fn slice(&self, start: usize, end: usize) -> Vec<f64> {
        if end <= start {
            return Vec::new();
        }
        let inner = self.inner.read();
        let end = end.min(inner.timestamps.len());
        if end <= start {
            return Vec::new();
        }
        inner.timestamps[start..end].to_vec()
    }

    /// Snapshot of the whole sequence.
    pub fn to_vec(&self) -> Vec<f64> {
        self.inner.read().timestamps.clone()
    }

    /// Append newly extracted boundaries and notify listeners. Called by
    /// the scanning subsystem while extraction is running.
    pub fn add(&self, values: &[f64]) {
        let mut inner = self.inner.write();
        inner.timestamps.extend_from_slice(values);
        for listener in &inner.listeners {
            listener(&inner.timestamps);
        }
        let _ = self
            .progress_tx
            .send((inner.timestamps.len(), inner.is_complete));
    }

    /// Mark extraction as finished.
    pub fn set_complete(&self) {
        let mut inner = self.inner.write();
        inner.is_complete = true;
        let _ = self
            .progress_tx
            .send((inner.timestamps.len(), inner.is_complete));
    }

    /// Register a callback invoked (under the write lock) every time new
    /// boundaries are appended.
    pub fn add_listener(&self, listener: impl Fn(&[f64]) + Send + Sync + 'static) {
        self.inner.write().listeners.push(Box::new(listener));
    }

    /// Wait until the sequence holds an `idx`-th boundary or extraction
    /// completes. Returns whether the boundary exists.
    pub async fn wait_for_index(&self, idx: usize, timeout: Duration) -> Result<bool> {
        let mut rx = self.progress_tx.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|(len, done)| idx < *len || *done))
            .await
            .map_err(|_| Error::SegmentTimeout {
                index: idx as u32,
                timeout_secs: timeout.as_secs(),
            })?;
        match outcome {
            Ok(state) => Ok(idx < state.0),
            // sender dropped means the keyframe owner went away
            Err(_) => Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_len_and_completeness() {
        let kf = Keyframe::new(vec![0.0, 4.0, 8.0], false);
        assert_eq!(kf.len(), (3, false));
        kf.set_complete();
        assert_eq!(kf.len(), (3, true));
    }

    #[test]
    fn test_slice_is_clamped() {
        let kf = Keyframe::new(vec![0.0, 4.0, 8.0, 12.0], true);
        assert_eq!(kf.slice(1, 3), vec![4.0, 8.0]);
        assert_eq!(kf.slice(2, 10), vec![8.0, 12.0]);
        assert!(kf.slice(3, 3).is_empty());
        assert!(kf.slice(10, 12).is_empty());
    }

    #[test]
    fn test_add_notifies_listeners() {
        let kf = Keyframe::new(vec![0.0], false);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        kf.add_listener(move |all| {
            seen2.store(all.len(), Ordering::SeqCst);
        });

        kf.add(&[2.0, 4.0]);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(kf.to_vec(), vec![0.0, 2.0, 4.0]);
    }

    #[tokio::test]
    async fn test_wait_for_index_resolves_on_add() {
        let kf = Arc::new(Keyframe::new(vec![0.0], false));

        let kf2 = kf.clone();
        let waiter = tokio::spawn(async move {
            kf2.wait_for_index(2, Duration::from_secs(5)).await
        });

        tokio::task::yield_now().await;
        kf.add(&[3.0, 6.0]);

        assert_eq!(waiter.await.unwrap(), Ok(true));
    }

    #[tokio::test]
    async fn test_wait_for_index_resolves_on_completion() {
        let kf = Arc::new(Keyframe::new(vec![0.0, 4.0], false));

        let kf2 = kf.clone();
        let waiter = tokio::spawn(async move {
            kf2.wait_for_index(10, Duration::from_secs(5)).await
        });

        tokio::task::yield_now().await;
        kf.set_complete();

        // extraction is done and the boundary never appeared
        assert_eq!(waiter.await.unwrap(), Ok(false));
    }
}
