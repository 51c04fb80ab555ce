use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::KeepAliveConfig;

const IDLE_POLL: Duration = Duration::from_millis(50);
const JITTER_MAX_MS: u64 = 250;

/// Capability the scheduler needs from a connection.
///
/// Sends and disconnects are dispatched on their own tasks, so
/// implementations may perform I/O; failures are the implementation's
/// problem (typically a silent disconnect).
#[async_trait]
pub trait KeepAlivePeer: Send + Sync {
    /// Stable key identifying this peer for the scheduler's lifetime.
    fn liveness_key(&self) -> u64;
    async fn send_keep_alive(&self);
    async fn disconnect_idle(&self);
}

struct Entry {
    peer: Weak<dyn KeepAlivePeer>,
    last_sent: Instant,
    last_received: Instant,
}

#[derive(Default)]
struct SchedState {
    /// Ordered by next deadline, peer key as tie-break.
    queue: BTreeMap<(Instant, u64), Entry>,
    /// Peer key to its current position in `queue`.
    index: HashMap<u64, Instant>,
}

/// Centralized keep-alive scheduler shared by every connection of a process.
///
/// One long-running cooperative loop maintains a sorted set of
/// `(deadline, peer)` records. A record's deadline is
/// `min(last_sent + interval, last_received + timeout)`; when it fires the
/// scheduler either emits a ping or declares the peer dead. All mutation is
/// O(log N) under a single mutex. The scheduler holds only weak references;
/// ownership of connections stays with their registry.
pub struct KeepAliveScheduler {
    interval: Duration,
    timeout: Duration,
    state: Mutex<SchedState>,
    wake: Notify,
    cancel: CancellationToken,
}

impl KeepAliveScheduler {
    pub fn new(config: KeepAliveConfig) -> Arc<Self> {
        assert!(
            config.interval < config.timeout,
            "keep-alive interval must be shorter than the timeout"
        );
        Arc::new(Self {
            interval: config.interval,
            timeout: config.timeout,
            state: Mutex::new(SchedState::default()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the scheduler loop on the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Stop the loop. Registered records are left in place and simply stop
    /// being serviced.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.wake.notify_one();
    }

    pub fn register(&self, peer: Arc<dyn KeepAlivePeer>) {
        let key = peer.liveness_key();
        let now = Instant::now();
        let entry = Entry {
            peer: Arc::downgrade(&peer),
            last_sent: now,
            last_received: now,
        };
        let deadline = self.next_event(&entry);
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.index.insert(key, deadline) {
                state.queue.remove(&(previous, key));
            }
            state.queue.insert((deadline, key), entry);
        }
        self.wake.notify_one();
    }

    pub fn unregister(&self, key: u64) {
        let mut state = self.state.lock();
        if let Some(deadline) = state.index.remove(&key) {
            state.queue.remove(&(deadline, key));
        }
    }

    pub fn mark_sent(&self, key: u64) {
        self.update(key, |entry, now| entry.last_sent = now);
    }

    pub fn mark_received(&self, key: u64) {
        self.update(key, |entry, now| entry.last_received = now);
    }

    pub fn is_registered(&self, key: u64) -> bool {
        self.state.lock().index.contains_key(&key)
    }

    fn update(&self, key: u64, apply: impl FnOnce(&mut Entry, Instant)) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(deadline) = state.index.get(&key).copied() else {
            return;
        };
        let Some(mut entry) = state.queue.remove(&(deadline, key)) else {
            return;
        };
        apply(&mut entry, now);
        let next = self.next_event(&entry);
        state.index.insert(key, next);
        state.queue.insert((next, key), entry);
    }

    fn next_event(&self, entry: &Entry) -> Instant {
        (entry.last_sent + self.interval).min(entry.last_received + self.timeout)
    }

    async fn run(&self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = {
                let state = self.state.lock();
                state.queue.keys().next().map(|&(deadline, _)| deadline)
            };
            match next {
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        let until = tokio::time::Instant::from_std(deadline);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = self.wake.notified() => continue,
                            _ = tokio::time::sleep_until(until) => {}
                        }
                    }
                    self.drain_due();
                }
            }
        }
    }

    /// Pop and service every record whose deadline has passed.
    fn drain_due(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        loop {
            let Some(&(deadline, key)) = state.queue.keys().next() else {
                break;
            };
            if deadline > now {
                break;
            }
            let Some(mut entry) = state.queue.remove(&(deadline, key)) else {
                break;
            };
            state.index.remove(&key);

            let Some(peer) = entry.peer.upgrade() else {
                continue;
            };

            if now.duration_since(entry.last_received) >= self.timeout {
                tracing::debug!(
                    target: "tether::keepalive",
                    key,
                    idle = ?now.duration_since(entry.last_received),
                    "peer idle past timeout, disconnecting"
                );
                tokio::spawn(async move { peer.disconnect_idle().await });
                continue;
            }

            if now.duration_since(entry.last_sent) >= self.interval {
                // Stagger the next ping so thousands of long-idle peers do
                // not synchronize into a thundering herd.
                let jitter = rand::thread_rng().gen_range(0..JITTER_MAX_MS);
                entry.last_sent = now + Duration::from_millis(jitter);
                tokio::spawn(async move { peer.send_keep_alive().await });
            }

            let next = self.next_event(&entry);
            state.index.insert(key, next);
            state.queue.insert((next, key), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockPeer {
        key: u64,
        pings: AtomicUsize,
        dropped: AtomicBool,
    }

    impl MockPeer {
        fn new(key: u64) -> Arc<Self> {
            Arc::new(Self {
                key,
                pings: AtomicUsize::new(0),
                dropped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl KeepAlivePeer for MockPeer {
        fn liveness_key(&self) -> u64 {
            self.key
        }

        async fn send_keep_alive(&self) {
            self.pings.fetch_add(1, Ordering::SeqCst);
        }

        async fn disconnect_idle(&self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn config(interval_ms: u64, timeout_ms: u64) -> KeepAliveConfig {
        KeepAliveConfig {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    #[should_panic(expected = "interval must be shorter")]
    fn rejects_interval_at_or_above_timeout() {
        let _ = KeepAliveScheduler::new(config(100, 100));
    }

    #[tokio::test]
    async fn pings_idle_peers_after_the_interval() {
        let scheduler = KeepAliveScheduler::new(config(40, 5_000));
        let task = scheduler.start();
        let peer = MockPeer::new(1);
        scheduler.register(peer.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(peer.pings.load(Ordering::SeqCst) >= 1);
        assert!(!peer.dropped.load(Ordering::SeqCst));

        scheduler.shutdown();
        task.await.expect("scheduler task");
    }

    #[tokio::test]
    async fn disconnects_peers_past_the_timeout() {
        let scheduler = KeepAliveScheduler::new(config(50, 150));
        let task = scheduler.start();
        let peer = MockPeer::new(2);
        scheduler.register(peer.clone());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(peer.dropped.load(Ordering::SeqCst));
        assert!(!scheduler.is_registered(2));

        scheduler.shutdown();
        task.await.expect("scheduler task");
    }

    #[tokio::test]
    async fn received_traffic_defers_the_timeout() {
        let scheduler = KeepAliveScheduler::new(config(500, 700));
        let task = scheduler.start();
        let peer = MockPeer::new(3);
        scheduler.register(peer.clone());

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            scheduler.mark_received(3);
        }
        assert!(!peer.dropped.load(Ordering::SeqCst));
        assert!(scheduler.is_registered(3));

        scheduler.shutdown();
        task.await.expect("scheduler task");
    }

    #[tokio::test]
    async fn unregister_stops_servicing() {
        let scheduler = KeepAliveScheduler::new(config(40, 5_000));
        let task = scheduler.start();
        let peer = MockPeer::new(4);
        scheduler.register(peer.clone());
        scheduler.unregister(4);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(peer.pings.load(Ordering::SeqCst), 0);

        scheduler.shutdown();
        task.await.expect("scheduler task");
    }

    #[tokio::test]
    async fn deadline_ordering_holds_after_updates() {
        let scheduler = KeepAliveScheduler::new(config(1_000, 3_000));
        let a = MockPeer::new(10);
        let b = MockPeer::new(11);
        scheduler.register(a.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.register(b.clone());
        scheduler.mark_sent(10);

        let state = scheduler.state.lock();
        // Every queue key must equal the entry's recomputed deadline.
        for (&(deadline, _), entry) in state.queue.iter() {
            let expected =
                (entry.last_sent + scheduler.interval).min(entry.last_received + scheduler.timeout);
            assert_eq!(deadline, expected);
        }
        assert_eq!(state.queue.len(), 2);
        assert_eq!(state.index.len(), 2);
    }
}
