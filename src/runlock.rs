//! Single-flight coordination
//!
//! For a given key, the first caller performs the work while every
//! concurrent caller for the same key waits for that one result. Used to
//! dedupe first-time stream construction under request stampedes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Clone)]
enum FlightState<V> {
    Pending,
    Done(V),
    /// The leader dropped its completer without publishing a result
    Abandoned,
}

type FlightMap<K, V> = Arc<Mutex<HashMap<K, watch::Sender<FlightState<V>>>>>;

/// Per-key single-flight coordinator.
pub struct RunLock<K, V> {
    running: FlightMap<K, V>,
}

impl<K, V> Default for RunLock<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of [`RunLock::start`].
pub enum Flight<K: Eq + Hash, V: Clone> {
    /// This caller goes first and must publish a result through the
    /// completer exactly once.
    Leader(Completer<K, V>),
    /// Another caller is already doing the work.
    Waiter(Waiter<V>),
}

impl<K, V> RunLock<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the flight for `key`, becoming the leader if none is in
    /// progress.
    pub fn start(&self, key: K) -> Flight<K, V> {
        let mut running = self.running.lock();
        if let Some(tx) = running.get(&key) {
            return Flight::Waiter(Waiter {
                rx: tx.subscribe(),
            });
        }

        let (tx, _) = watch::channel(FlightState::Pending);
        running.insert(key.clone(), tx);
        Flight::Leader(Completer {
            key: Some(key),
            running: self.running.clone(),
        })
    }

    /// Number of flights currently in progress.
    pub fn in_flight(&self) -> usize {
        self.running.lock().len()
    }
}

/// Handle held by the single leader of a flight. Publishing is consuming,
/// so completing twice is unrepresentable; dropping without completing
/// publishes an abandoned outcome instead of leaking the waiters.
pub struct Completer<K: Eq + Hash, V: Clone> {
    key: Option<K>,
    running: FlightMap<K, V>,
}

impl<K: Eq + Hash, V: Clone> Completer<K, V> {
    /// Publish the result to every current and future waiter and clear the
    /// in-flight entry.
    pub fn complete(mut self, value: V) {
        let key = self.key.take().expect("completer used once");
        if let Some(tx) = self.running.lock().remove(&key) {
            let _ = tx.send(FlightState::Done(value));
        }
    }
}

impl<K: Eq + Hash, V: Clone> Drop for Completer<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Some(tx) = self.running.lock().remove(&key) {
                let _ = tx.send(FlightState::Abandoned);
            }
        }
    }
}

/// Handle held by everyone who joined an in-progress flight.
pub struct Waiter<V: Clone> {
    rx: watch::Receiver<FlightState<V>>,
}

impl<V: Clone> Waiter<V> {
    /// Block until the leader publishes. `None` means the leader went away
    /// without completing (panicked or was cancelled); the caller should
    /// treat that as a cancellation and retry.
    pub async fn wait(mut self) -> Option<V> {
        let state = self
            .rx
            .wait_for(|s| !matches!(s, FlightState::Pending))
            .await;
        match state {
            Ok(state) => match &*state {
                FlightState::Done(v) => Some(v.clone()),
                _ => None,
            },
            // sender dropped before publishing
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_receive_leader_result() {
        let lock: Arc<RunLock<u32, u32>> = Arc::new(RunLock::new());

        let completer = match lock.start(1) {
            Flight::Leader(c) => c,
            Flight::Waiter(_) => panic!("first caller must lead"),
        };

        let mut waiters = Vec::new();
        for _ in 0..8 {
            match lock.start(1) {
                Flight::Leader(_) => panic!("flight already in progress"),
                Flight::Waiter(w) => waiters.push(tokio::spawn(w.wait())),
            }
        }

        completer.complete(99);
        for w in waiters {
            assert_eq!(w.await.unwrap(), Some(99));
        }

        // entry cleared: the next caller leads again
        assert_eq!(lock.in_flight(), 0);
        assert!(matches!(lock.start(1), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_abandoned_leader_wakes_waiters() {
        let lock: RunLock<u32, u32> = RunLock::new();

        let completer = match lock.start(5) {
            Flight::Leader(c) => c,
            Flight::Waiter(_) => unreachable!(),
        };
        let waiter = match lock.start(5) {
            Flight::Waiter(w) => w,
            Flight::Leader(_) => unreachable!(),
        };

        drop(completer);
        assert_eq!(waiter.wait().await, None);
        assert_eq!(lock.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_independent_keys_run_in_parallel() {
        let lock: RunLock<u32, u32> = RunLock::new();
        let a = lock.start(1);
        let b = lock.start(2);
        assert!(matches!(a, Flight::Leader(_)));
        assert!(matches!(b, Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_waiter_joining_after_completion_is_a_new_leader() {
        let lock: RunLock<u32, u32> = RunLock::new();
        match lock.start(3) {
            Flight::Leader(c) => c.complete(1),
            Flight::Waiter(_) => unreachable!(),
        }

        // no in-flight entry remains, so this caller starts a fresh flight
        match lock.start(3) {
            Flight::Leader(c) => {
                tokio::time::sleep(Duration::from_millis(1)).await;
                c.complete(2);
            }
            Flight::Waiter(_) => panic!("completed flight must not linger"),
        }
    }
}
