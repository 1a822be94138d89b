//! Periodic job scheduler
//!
//! A fixed pool of workers drains a bounded queue of due jobs. Each job
//! first fires after a random delay in `[0, interval)` and is re-queued
//! `interval` after every run until it is cancelled or its target leaves
//! the registry.

use futures_util::future::BoxFuture;
use meshgate_core::{DeviceId, IeeeAddress, Registry};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Shortest interval a job may be scheduled at
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// What a job polls; checked against the registry before each run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollTarget {
    Node(IeeeAddress),
    Device(DeviceId),
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollTarget::Node(address) => write!(f, "node {}", address),
            PollTarget::Device(id) => write!(f, "device {}", id),
        }
    }
}

/// Poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Capacity of the due-job queue
    pub queue_capacity: usize,
    /// Maximum duration of a single job run in milliseconds
    pub max_duration_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            max_duration_ms: 10_000,
        }
    }
}

/// Work performed on every tick
pub type PollFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    id: u64,
    target: PollTarget,
    interval: Duration,
    run: PollFn,
    cancelled: Arc<AtomicBool>,
}

struct Shared {
    registry: Arc<Registry>,
    tx: mpsc::Sender<Job>,
    max_duration: Duration,
    /// Live jobs by id
    jobs: Mutex<HashMap<u64, (PollTarget, Arc<AtomicBool>)>>,
    stopped: AtomicBool,
}

impl Shared {
    fn forget(&self, id: u64) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    async fn target_exists(&self, target: PollTarget) -> bool {
        match target {
            PollTarget::Node(address) => self.registry.contains_node(address).await,
            PollTarget::Device(id) => self.registry.contains_device(id).await,
        }
    }

    /// Queue the job once `delay` has elapsed
    fn schedule(self: &Arc<Self>, job: Job, delay: Duration) {
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if job.cancelled.load(Ordering::SeqCst) {
                return;
            }
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let id = job.id;
            if shared.tx.send(job).await.is_err() {
                shared.forget(id);
            }
        });
    }

    async fn run(self: &Arc<Self>, job: Job) {
        if job.cancelled.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            self.forget(job.id);
            return;
        }

        if !self.target_exists(job.target).await {
            debug!(poll_target = %job.target, "Poll target gone, dropping job");
            self.forget(job.id);
            return;
        }

        if timeout(self.max_duration, (job.run)()).await.is_err() {
            warn!(
                poll_target = %job.target,
                max_duration_ms = self.max_duration.as_millis() as u64,
                "Poll job exceeded its maximum duration"
            );
        }

        if job.cancelled.load(Ordering::SeqCst) {
            self.forget(job.id);
            return;
        }
        let interval = job.interval;
        self.schedule(job, interval);
    }
}

/// Cancels a scheduled job
pub struct PollHandle {
    id: u64,
    target: PollTarget,
    cancelled: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl PollHandle {
    pub fn target(&self) -> PollTarget {
        self.target
    }

    /// Suppress every future run. A run already in flight completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(shared) = self.shared.upgrade() {
            shared.forget(self.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollHandle")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Periodic job scheduler
pub struct Poller {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Poller {
    /// Create the poller and spawn its workers on the current runtime
    pub fn new(config: PollerConfig, registry: Arc<Registry>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            registry,
            tx,
            max_duration: Duration::from_millis(config.max_duration_ms),
            jobs: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..config.workers)
            .map(|worker| {
                let rx = rx.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        shared.run(job).await;
                    }
                    debug!(worker, "Poll worker exiting");
                })
            })
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Poller started"
        );

        Self {
            shared,
            workers: Mutex::new(workers),
            next_id: AtomicU64::new(0),
        }
    }

    /// Schedule `job` to run every `interval` against `target`
    pub fn add<F>(&self, target: PollTarget, interval: Duration, job: F) -> PollHandle
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let interval = interval.max(MIN_INTERVAL);

        self.shared
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (target, cancelled.clone()));

        let delay = jitter(interval);
        debug!(poll_target = %target, interval_ms = interval.as_millis() as u64, delay_ms = delay.as_millis() as u64, "Poll job added");

        self.shared.schedule(
            Job {
                id,
                target,
                interval,
                run: Arc::new(job),
                cancelled: cancelled.clone(),
            },
            delay,
        );

        PollHandle {
            id,
            target,
            cancelled,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of jobs still scheduled
    pub fn active_jobs(&self) -> usize {
        self.shared
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn active_jobs_for(&self, target: PollTarget) -> usize {
        self.shared
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(t, _)| *t == target)
            .count()
    }

    /// Cancel every job and shut the workers down
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        for (_, (_, cancelled)) in self
            .shared
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            cancelled.store(true, Ordering::SeqCst);
        }
        for worker in self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            worker.abort();
        }
        info!("Poller stopped");
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        for worker in self
            .workers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            worker.abort();
        }
    }
}

/// Random initial delay in `[0, interval)`
pub fn jitter(interval: Duration) -> Duration {
    let millis = interval.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}
