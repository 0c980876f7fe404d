/*
    TtlManager - per-identifier idle countdowns

    One tick task for the whole manager. Each tick subtracts the tick period
    from every armed entry; an entry whose remaining time drops below zero is
    removed and reported on the expiry channel exactly once.

    put(id)       -> track without a timer
    set(id, ttl)  -> arm or re-arm
    remove(id)    -> forget, suppressing any pending expiry
*/

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::core_identity::Identifier;

/// Remaining milliseconds; `None` means tracked but not armed
type Entries = HashMap<Identifier, Option<i64>>;

pub struct TtlManager {
    entries: Arc<Mutex<Entries>>,
    stopped: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TtlManager {
    /// Spawn the tick task on the current runtime
    pub fn start(tick: Duration, expired: mpsc::UnboundedSender<Identifier>) -> Self {
        let entries = Arc::new(Mutex::new(Entries::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(Self::run(tick, entries.clone(), stopped.clone(), expired));
        TtlManager { entries, stopped, task: Mutex::new(Some(task)) }
    }

    async fn run(
        tick: Duration,
        entries: Arc<Mutex<Entries>>,
        stopped: Arc<AtomicBool>,
        expired: mpsc::UnboundedSender<Identifier>,
    ) {
        let step = (tick.as_millis() as i64).max(1);
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let fired: Vec<Identifier> = {
                let mut entries = entries.lock();
                if stopped.load(Ordering::Acquire) {
                    return;
                }
                let mut fired = Vec::new();
                for (id, remaining) in entries.iter_mut() {
                    if let Some(ms) = remaining {
                        *ms -= step;
                        if *ms < 0 {
                            fired.push(id.clone());
                        }
                    }
                }
                for id in &fired {
                    entries.remove(id);
                }
                fired
            };

            for id in fired {
                debug!(peer = %id, "TTL expired");
                if expired.send(id).is_err() {
                    trace!("TTL expiry receiver dropped");
                    return;
                }
            }
        }
    }

    /// Track `id` without arming a timer. An existing timer is kept.
    pub fn put(&self, id: Identifier) {
        self.entries.lock().entry(id).or_insert(None);
    }

    /// Arm or re-arm the countdown for `id`
    pub fn set(&self, id: Identifier, ttl: Duration) {
        let ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.entries.lock().insert(id, Some(ms));
    }

    /// Forget `id`; returns whether it was tracked
    pub fn remove(&self, id: &Identifier) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Remaining time of an armed entry
    pub fn remaining(&self, id: &Identifier) -> Option<Duration> {
        self.entries
            .lock()
            .get(id)
            .copied()
            .flatten()
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Halt the tick task and clear every entry. No expiry is reported
    /// after this returns.
    pub async fn stop(&self) {
        {
            let _entries = self.entries.lock();
            self.stopped.store(true, Ordering::Release);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.entries.lock().clear();
    }
}

impl Drop for TtlManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout, Instant};

    fn peer(seed: u8) -> Identifier {
        crate::core_identity::CryptoIdentity::from_seed(&[seed; 32]).identifier().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fires_after_ttl() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ttl = TtlManager::start(Duration::from_millis(50), tx);
        let started = Instant::now();

        ttl.set(peer(1), Duration::from_millis(150));
        let expired = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();

        let elapsed = started.elapsed();
        assert_eq!(expired, peer(1));
        assert!(elapsed >= Duration::from_millis(150), "fired early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(250), "fired late: {elapsed:?}");
        assert!(!ttl.contains(&peer(1)));

        // Exactly once
        sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        ttl.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_suppresses_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ttl = TtlManager::start(Duration::from_millis(50), tx);

        ttl.set(peer(1), Duration::from_millis(150));
        sleep(Duration::from_millis(60)).await;
        assert!(ttl.remove(&peer(1)));

        sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        ttl.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_never_expires_and_rearm_extends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ttl = TtlManager::start(Duration::from_millis(50), tx);

        ttl.put(peer(1));
        ttl.set(peer(2), Duration::from_millis(100));
        sleep(Duration::from_millis(80)).await;
        ttl.set(peer(2), Duration::from_millis(100));
        sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err(), "re-armed entry expired early");

        let expired = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(expired, peer(2));
        assert!(ttl.contains(&peer(1)));
        assert_eq!(ttl.remaining(&peer(1)), None);
        ttl.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_and_silences() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ttl = TtlManager::start(Duration::from_millis(50), tx);
        ttl.set(peer(1), Duration::from_millis(100));
        ttl.put(peer(2));

        ttl.stop().await;
        assert!(ttl.is_empty());

        ttl.set(peer(3), Duration::from_millis(10));
        sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());

        // Idempotent
        ttl.stop().await;
    }
}
