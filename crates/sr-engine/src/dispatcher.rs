//! Worker dispatcher: admitted tasks run on a bounded rayon pool, tasks that
//! find no capacity are retried after a fixed delay on the async runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use sr_types::{internal_error, SrResult};

use crate::config::ExecutorConfig;
use crate::gate::{AdmissionPermit, ConcurrencyGate};

/// Log a reminder every this many admission retries of the same task.
const RETRY_WARN_INTERVAL: u32 = 30;

/// Unit of work the dispatcher schedules.
pub trait DispatchTask: Send + 'static {
    /// Short description for logs.
    fn label(&self) -> String;

    /// A cancelled task is never admitted again.
    fn is_cancelled(&self) -> bool;

    /// Completes the task as a no-op without running it.
    fn cancel(self: Box<Self>);

    /// Runs on a worker thread. The permit must be held until the task's
    /// work is finished and dropped exactly then.
    fn run(self: Box<Self>, permit: AdmissionPermit);
}

struct Deferred {
    task: Box<dyn DispatchTask>,
    attempts: u32,
}

pub struct WorkerDispatcher {
    gate: ConcurrencyGate,
    pool: ThreadPool,
    queue_capacity: usize,
    queue_depth: Arc<AtomicUsize>,
    queued_retries: AtomicUsize,
    retry_delay: Duration,
    runtime: Handle,
}

impl WorkerDispatcher {
    pub fn new(config: &ExecutorConfig, gate: ConcurrencyGate, runtime: Handle) -> SrResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("sr-worker-{i}"))
            .build()
            .map_err(|e| internal_error!("failed to build worker pool: {}", e))?;

        debug!(
            worker_threads = config.worker_threads,
            queue_capacity = config.worker_queue_capacity,
            max_concurrent = gate.max_concurrent(),
            "worker dispatcher ready"
        );

        Ok(Self {
            gate,
            pool,
            queue_capacity: config.worker_queue_capacity,
            queue_depth: Arc::new(AtomicUsize::new(0)),
            queued_retries: AtomicUsize::new(0),
            retry_delay: config.retry_delay,
            runtime,
        })
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Tasks waiting on the retry timer.
    pub fn queued_retries(&self) -> usize {
        self.queued_retries.load(Ordering::Acquire)
    }

    /// Admitted tasks handed to the pool but not yet started.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    /// Admits and dispatches `task`, or defers it. Never blocks.
    pub fn submit(self: &Arc<Self>, task: Box<dyn DispatchTask>) {
        self.attempt(Deferred { task, attempts: 0 });
    }

    fn attempt(self: &Arc<Self>, deferred: Deferred) {
        if deferred.task.is_cancelled() {
            debug!(task = %deferred.task.label(), "task cancelled before admission");
            deferred.task.cancel();
            return;
        }

        match self.gate.try_admit() {
            Some(permit) => self.dispatch(deferred, permit),
            None => self.schedule_retry(deferred),
        }
    }

    fn dispatch(self: &Arc<Self>, deferred: Deferred, permit: AdmissionPermit) {
        let depth = self.queue_depth.fetch_add(1, Ordering::AcqRel);
        if depth >= self.queue_capacity {
            // Pool is saturated; give the slot back and go through the retry path.
            self.queue_depth.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
            warn!(
                task = %deferred.task.label(),
                queue_depth = depth,
                "worker pool queue full, deferring task"
            );
            self.schedule_retry(deferred);
            return;
        }

        let queue_depth = Arc::clone(&self.queue_depth);
        self.pool.spawn(move || {
            queue_depth.fetch_sub(1, Ordering::AcqRel);
            deferred.task.run(permit);
        });
    }

    fn schedule_retry(self: &Arc<Self>, mut deferred: Deferred) {
        deferred.attempts += 1;
        if deferred.attempts % RETRY_WARN_INTERVAL == 0 {
            warn!(
                task = %deferred.task.label(),
                attempts = deferred.attempts,
                "task still waiting for capacity"
            );
        } else {
            debug!(
                task = %deferred.task.label(),
                attempts = deferred.attempts,
                delay_ms = self.retry_delay.as_millis() as u64,
                "no capacity, retrying later"
            );
        }

        self.queued_retries.fetch_add(1, Ordering::AcqRel);
        let dispatcher = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(dispatcher.retry_delay).await;
            // Decrement after the attempt so a re-deferred task is never
            // missing from the count.
            dispatcher.attempt(deferred);
            dispatcher.queued_retries.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

impl std::fmt::Debug for WorkerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDispatcher")
            .field("gate", &self.gate)
            .field("worker_threads", &self.pool.current_num_threads())
            .field("queue_capacity", &self.queue_capacity)
            .field("queue_depth", &self.queue_depth())
            .field("queued_retries", &self.queued_retries())
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::{mpsc, Notify};

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Started(usize),
        Cancelled(usize),
    }

    /// Holds its permit until `release` is notified.
    struct HeldTask {
        id: usize,
        cancelled: Arc<AtomicBool>,
        release: Arc<Notify>,
        events: mpsc::UnboundedSender<Event>,
        runtime: Handle,
    }

    impl DispatchTask for HeldTask {
        fn label(&self) -> String {
            format!("held-{}", self.id)
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        fn cancel(self: Box<Self>) {
            let _ = self.events.send(Event::Cancelled(self.id));
        }

        fn run(self: Box<Self>, permit: AdmissionPermit) {
            let _ = self.events.send(Event::Started(self.id));
            let release = Arc::clone(&self.release);
            self.runtime.spawn(async move {
                release.notified().await;
                drop(permit);
            });
        }
    }

    struct Harness {
        dispatcher: Arc<WorkerDispatcher>,
        cancelled: Arc<AtomicBool>,
        release: Arc<Notify>,
        events: mpsc::UnboundedReceiver<Event>,
        sender: mpsc::UnboundedSender<Event>,
    }

    impl Harness {
        fn new(config: ExecutorConfig) -> Self {
            let gate = ConcurrencyGate::new(config.max_concurrent_tasks);
            let dispatcher =
                Arc::new(WorkerDispatcher::new(&config, gate, Handle::current()).unwrap());
            let (sender, events) = mpsc::unbounded_channel();
            Self {
                dispatcher,
                cancelled: Arc::new(AtomicBool::new(false)),
                release: Arc::new(Notify::new()),
                events,
                sender,
            }
        }

        fn submit(&self, id: usize) {
            self.dispatcher.submit(Box::new(HeldTask {
                id,
                cancelled: Arc::clone(&self.cancelled),
                release: Arc::clone(&self.release),
                events: self.sender.clone(),
                runtime: Handle::current(),
            }));
        }

        async fn next(&mut self) -> Event {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("event within timeout")
                .expect("channel open")
        }
    }

    fn config(max: usize) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_max_concurrent_tasks(max)
            .with_worker_threads(2)
            .with_retry_delay(Duration::from_millis(20))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn defers_beyond_capacity_then_admits_on_release() {
        let mut harness = Harness::new(config(2));
        for id in 0..3 {
            harness.submit(id);
        }

        let mut started = vec![];
        for _ in 0..2 {
            match harness.next().await {
                Event::Started(id) => started.push(id),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(harness.dispatcher.gate().in_flight(), 2);
        assert!(harness.dispatcher.queued_retries() >= 1);

        harness.release.notify_one();
        assert!(matches!(harness.next().await, Event::Started(2)));
        assert!(harness.dispatcher.gate().peak_in_flight() <= 2);

        harness.release.notify_waiters();
        harness.release.notify_one();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_task_short_circuits_on_retry() {
        let mut harness = Harness::new(config(1));
        harness.submit(0);
        harness.submit(1);

        assert_eq!(harness.next().await, Event::Started(0));
        harness.cancelled.store(true, Ordering::SeqCst);
        assert_eq!(harness.next().await, Event::Cancelled(1));
        assert_eq!(harness.dispatcher.gate().in_flight(), 1);

        harness.release.notify_one();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_pool_queue_releases_permit_and_retries() {
        let mut harness = Harness::new(
            config(4)
                .with_worker_queue_capacity(1)
                .with_retry_delay(Duration::from_millis(50)),
        );
        // Occupy the queue slot so the next dispatch sees a full pool.
        harness.dispatcher.queue_depth.fetch_add(1, Ordering::SeqCst);
        harness.submit(0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(harness.dispatcher.gate().in_flight(), 0);
        assert!(harness.dispatcher.queued_retries() >= 1);

        harness.dispatcher.queue_depth.fetch_sub(1, Ordering::SeqCst);
        assert_eq!(harness.next().await, Event::Started(0));
        harness.release.notify_one();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_the_fixed_delay() {
        let mut harness = Harness::new(config(1).with_retry_delay(Duration::from_secs(1)));
        harness.submit(0);
        assert_eq!(harness.events.recv().await, Some(Event::Started(0)));

        harness.submit(1);
        harness.release.notify_one();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(harness.events.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(harness.events.recv().await, Some(Event::Started(1)));
        harness.release.notify_one();
    }
}
