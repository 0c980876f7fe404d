/*
    DispatchQueue - per-destination send queues drained by a small worker pool

    Every destination is owned by exactly one worker (hash of the identifier),
    so sends to one destination are offered to the target strictly in FIFO
    order. A worker walks its destinations round-robin, offering one send per
    destination per pass.

    The target answers each offer:
      Accepted  -> the channel now owns the frame
      Declined  -> put back at the head of its queue, offered again after
                   `retry_interval` (or sooner, on `wake`)
      Failed    -> the send's completion receives the error

    Sends past their deadline fail with `SendError::Timeout` without being
    offered again.
*/

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use super::metrics;
use crate::core_channel::{OutboundFrame, SendError};
use crate::core_identity::Identifier;

/// One message waiting for a route to its destination
#[derive(Debug)]
pub struct PendingSend {
    pub destination: Identifier,
    pub frame: OutboundFrame,
    pub timeout: Duration,
    pub enqueued_at: Instant,
}

impl PendingSend {
    pub fn new(destination: Identifier, frame: OutboundFrame, timeout: Duration) -> Self {
        Self { destination, frame, timeout, enqueued_at: Instant::now() }
    }

    pub fn deadline(&self) -> Instant {
        self.enqueued_at + self.timeout
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    pub(crate) fn fail(self, error: SendError) {
        self.frame.fail(error);
    }
}

/// Verdict of a [`DispatchTarget`] on one offered send
#[derive(Debug)]
pub enum Dispatch {
    Accepted,
    Declined(PendingSend),
    Failed(PendingSend, SendError),
}

/// Receives sends from the workers. Called from worker tasks; must not block.
pub trait DispatchTarget: Send + Sync + 'static {
    fn dispatch(&self, send: PendingSend) -> Dispatch;
}

#[derive(Default)]
struct DestinationQueue {
    sends: VecDeque<PendingSend>,
    retry_at: Option<Instant>,
}

#[derive(Default)]
struct WorkerState {
    order: VecDeque<Identifier>,
    queues: HashMap<Identifier, DestinationQueue>,
    stopped: bool,
}

enum Next {
    Offer(PendingSend),
    Idle(Option<Instant>),
    Stopped,
}

impl WorkerState {
    fn push_back(&mut self, send: PendingSend) {
        let destination = send.destination.clone();
        let queue = self.queues.entry(destination.clone()).or_default();
        if queue.sends.is_empty() && queue.retry_at.is_none() && !self.order.contains(&destination) {
            self.order.push_back(destination);
        }
        queue.sends.push_back(send);
    }

    fn put_back(&mut self, send: PendingSend, retry_at: Instant) {
        let destination = send.destination.clone();
        if !self.order.contains(&destination) {
            self.order.push_back(destination.clone());
        }
        let queue = self.queues.entry(destination).or_default();
        queue.sends.push_front(send);
        queue.retry_at = Some(retry_at);
    }

    /// Remove expired sends, then pick the next ready destination in turn
    fn next(&mut self, now: Instant, expired: &mut Vec<PendingSend>) -> Next {
        if self.stopped {
            return Next::Stopped;
        }

        for queue in self.queues.values_mut() {
            let (keep, gone): (VecDeque<_>, VecDeque<_>) =
                queue.sends.drain(..).partition(|send| !send.is_expired(now));
            queue.sends = keep;
            expired.extend(gone);
        }
        self.queues.retain(|_, queue| !queue.sends.is_empty());
        let queues = &self.queues;
        self.order.retain(|destination| queues.contains_key(destination));

        let mut wake_at: Option<Instant> = None;
        for _ in 0..self.order.len() {
            let Some(destination) = self.order.pop_front() else {
                break;
            };
            self.order.push_back(destination.clone());

            let Some(queue) = self.queues.get_mut(&destination) else {
                continue;
            };
            match queue.retry_at {
                Some(at) if at > now => {
                    wake_at = earliest(wake_at, at);
                }
                _ => {
                    queue.retry_at = None;
                    if let Some(send) = queue.sends.pop_front() {
                        return Next::Offer(send);
                    }
                }
            }
        }

        for queue in self.queues.values() {
            if let Some(send) = queue.sends.front() {
                wake_at = earliest(wake_at, send.deadline());
            }
        }
        Next::Idle(wake_at)
    }
}

fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(current.map_or(candidate, |at| at.min(candidate)))
}

struct Worker {
    state: Mutex<WorkerState>,
    notify: Notify,
}

pub struct DispatchQueue {
    workers: Vec<Arc<Worker>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Spawn `workers` tasks on the current runtime
    pub fn start(workers: usize, retry_interval: Duration, target: Arc<dyn DispatchTarget>) -> Self {
        let workers: Vec<Arc<Worker>> = (0..workers.max(1))
            .map(|_| Arc::new(Worker { state: Mutex::new(WorkerState::default()), notify: Notify::new() }))
            .collect();
        let tasks = workers
            .iter()
            .enumerate()
            .map(|(index, worker)| tokio::spawn(run_worker(index, worker.clone(), target.clone(), retry_interval)))
            .collect();
        DispatchQueue { workers, tasks: Mutex::new(tasks) }
    }

    fn worker_for(&self, destination: &Identifier) -> &Arc<Worker> {
        let mut hasher = DefaultHasher::new();
        destination.hash(&mut hasher);
        &self.workers[(hasher.finish() % self.workers.len() as u64) as usize]
    }

    /// Queue a send behind any others for the same destination
    pub fn enqueue(&self, send: PendingSend) -> Result<(), SendError> {
        let worker = self.worker_for(&send.destination);
        {
            let mut state = worker.state.lock();
            if state.stopped {
                drop(state);
                send.fail(SendError::Shutdown);
                return Err(SendError::Shutdown);
            }
            state.push_back(send);
        }
        worker.notify.notify_one();
        Ok(())
    }

    /// Offer queued sends for `destination` now instead of after the retry delay
    pub fn wake(&self, destination: &Identifier) {
        let worker = self.worker_for(destination);
        if let Some(queue) = worker.state.lock().queues.get_mut(destination) {
            queue.retry_at = None;
        }
        worker.notify.notify_one();
    }

    /// Sends still queued for `destination`
    pub fn pending(&self, destination: &Identifier) -> usize {
        self.worker_for(destination)
            .state
            .lock()
            .queues
            .get(destination)
            .map_or(0, |queue| queue.sends.len())
    }

    /// Halt the workers; every queued send fails with `SendError::Shutdown`
    pub async fn stop(&self) {
        let mut abandoned = Vec::new();
        for worker in &self.workers {
            let mut state = worker.state.lock();
            state.stopped = true;
            state.order.clear();
            for (_, queue) in state.queues.drain() {
                abandoned.extend(queue.sends);
            }
            drop(state);
            worker.notify.notify_one();
        }
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "Failing queued sends on shutdown");
        }
        for send in abandoned {
            send.fail(SendError::Shutdown);
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        // Queued sends are dropped with the state; their deliveries resolve as `Dropped`
        for worker in &self.workers {
            worker.state.lock().stopped = true;
            worker.notify.notify_one();
        }
    }
}

async fn run_worker(index: usize, worker: Arc<Worker>, target: Arc<dyn DispatchTarget>, retry_interval: Duration) {
    trace!(worker = index, "Dispatch worker started");
    loop {
        let mut expired = Vec::new();
        let next = worker.state.lock().next(Instant::now(), &mut expired);
        for send in expired {
            trace!(worker = index, peer = %send.destination, "Send timed out");
            metrics::dispatch_timed_out();
            send.fail(SendError::Timeout);
        }

        match next {
            Next::Stopped => break,
            Next::Offer(send) => match target.dispatch(send) {
                Dispatch::Accepted => {}
                Dispatch::Declined(send) => {
                    metrics::dispatch_retried();
                    let mut state = worker.state.lock();
                    if state.stopped {
                        drop(state);
                        send.fail(SendError::Shutdown);
                    } else {
                        state.put_back(send, Instant::now() + retry_interval);
                    }
                }
                Dispatch::Failed(send, error) => {
                    trace!(worker = index, peer = %send.destination, %error, "Send failed");
                    send.fail(error);
                }
            },
            Next::Idle(Some(at)) => {
                tokio::select! {
                    _ = worker.notify.notified() => {}
                    _ = sleep_until(at) => {}
                }
            }
            Next::Idle(None) => worker.notify.notified().await,
        }
    }
    trace!(worker = index, "Dispatch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_channel::MessageId;
    use crate::core_identity::CryptoIdentity;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::oneshot;

    /// Accepts only once `open` is set, recording accepted message ids
    #[derive(Default)]
    struct Gate {
        open: AtomicBool,
        accepted: Mutex<Vec<(Identifier, MessageId)>>,
        offers: Mutex<usize>,
    }

    impl DispatchTarget for Gate {
        fn dispatch(&self, send: PendingSend) -> Dispatch {
            *self.offers.lock() += 1;
            if !self.open.load(Ordering::SeqCst) {
                return Dispatch::Declined(send);
            }
            self.accepted.lock().push((send.destination.clone(), send.frame.id));
            send.frame.complete();
            Dispatch::Accepted
        }
    }

    fn peer(seed: u8) -> Identifier {
        CryptoIdentity::from_seed(&[seed; 32]).identifier().unwrap()
    }

    fn pending(
        destination: &Identifier,
        id: u64,
        timeout: Duration,
    ) -> (PendingSend, oneshot::Receiver<Result<(), SendError>>) {
        let (tx, rx) = oneshot::channel();
        let frame = OutboundFrame::with_completion(MessageId(id), vec![id as u8], tx);
        (PendingSend::new(destination.clone(), frame, timeout), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_sends_are_retried_in_order() {
        let gate = Arc::new(Gate::default());
        let queue = DispatchQueue::start(2, Duration::from_millis(100), gate.clone());
        let a = peer(1);

        let mut receivers = Vec::new();
        for id in 0..5 {
            let (send, rx) = pending(&a, id, Duration::from_secs(10));
            queue.enqueue(send).unwrap();
            receivers.push(rx);
        }

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(gate.accepted.lock().is_empty());
        let offers = *gate.offers.lock();
        assert!((2..=6).contains(&offers), "retry should be paced, got {offers} offers");

        gate.open.store(true, Ordering::SeqCst);
        queue.wake(&a);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Ok(()));
        }
        let ids: Vec<u64> = gate.accepted.lock().iter().map(|(_, id)| id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_sends_fail_with_timeout() {
        let gate = Arc::new(Gate::default());
        let queue = DispatchQueue::start(1, Duration::from_millis(50), gate.clone());
        let a = peer(1);

        let (short, short_rx) = pending(&a, 1, Duration::from_millis(200));
        let (long, long_rx) = pending(&a, 2, Duration::from_secs(5));
        queue.enqueue(short).unwrap();
        queue.enqueue(long).unwrap();

        let started = Instant::now();
        assert_eq!(short_rx.await.unwrap(), Err(SendError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(queue.pending(&a), 1);

        gate.open.store(true, Ordering::SeqCst);
        queue.wake(&a);
        assert_eq!(long_rx.await.unwrap(), Ok(()));
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_destinations_alternate() {
        let gate = Arc::new(Gate::default());
        gate.open.store(true, Ordering::SeqCst);
        // Single worker so both destinations share one round-robin
        let queue = DispatchQueue::start(1, Duration::from_millis(50), gate.clone());
        let (a, b) = (peer(1), peer(2));

        let mut receivers = Vec::new();
        for id in 0..3 {
            for dest in [&a, &b] {
                let (send, rx) = pending(dest, id, Duration::from_secs(5));
                receivers.push(rx);
                queue.enqueue(send).unwrap();
            }
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        let order: Vec<bool> = gate.accepted.lock().iter().map(|(dest, _)| *dest == a).collect();
        assert_eq!(order, vec![true, false, true, false, true, false]);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_fails_everything_queued() {
        let gate = Arc::new(Gate::default());
        let queue = DispatchQueue::start(3, Duration::from_millis(50), gate);

        let mut receivers = Vec::new();
        for seed in 1..=4 {
            let (send, rx) = pending(&peer(seed), seed as u64, Duration::from_secs(60));
            queue.enqueue(send).unwrap();
            receivers.push(rx);
        }
        queue.stop().await;

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(SendError::Shutdown));
        }
        let (late, late_rx) = pending(&peer(9), 9, Duration::from_secs(1));
        assert_eq!(queue.enqueue(late), Err(SendError::Shutdown));
        assert_eq!(late_rx.await.unwrap(), Err(SendError::Shutdown));
    }
}
