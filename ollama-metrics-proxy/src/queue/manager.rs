//! Admission-control queue with a fixed worker pool.
//!
//! `submit` never waits for space: a unit is admitted or rejected under a
//! single lock that also guards the statistics. Admitted units wait in a
//! priority heap until one of the workers pops them.

use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::QueueConfig;
use super::priority::{Prioritized, Priority};
use crate::metrics::Collector;

/// Error types for queue operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    #[error("Queue is shutting down")]
    ShuttingDown,

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    #[error("Workers did not drain within {timeout:?}")]
    ShutdownTimeout { timeout: Duration },

    #[error("Unit of work ended without delivering an outcome")]
    WorkLost,
}

impl QueueError {
    pub fn reason(&self) -> &'static str {
        match self {
            QueueError::QueueFull { .. } => "queue_full",
            QueueError::ShuttingDown => "shutting_down",
            QueueError::Cancelled => "cancelled",
            QueueError::DeadlineExceeded => "deadline_exceeded",
            QueueError::ShutdownTimeout { .. } => "shutdown_timeout",
            QueueError::WorkLost => "work_lost",
        }
    }
}

/// Cancellation and deadline source of a submitter.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { token: CancellationToken::new(), deadline: timeout.map(|t| Instant::now() + t) }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The context's error if it has already fired.
    ///
    /// A passed deadline wins over cancellation, since the submitter cancels
    /// its token on the way out after a deadline.
    pub fn err(&self) -> Option<QueueError> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(QueueError::DeadlineExceeded)
        } else if self.token.is_cancelled() {
            Some(QueueError::Cancelled)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> QueueError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => QueueError::DeadlineExceeded,
                _ = self.token.cancelled() => match self.err() {
                    Some(err) => err,
                    None => QueueError::Cancelled,
                },
            },
            None => {
                self.token.cancelled().await;
                QueueError::Cancelled
            }
        }
    }
}

/// Type-erased unit of work held in the heap.
trait Job: Send {
    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;
    fn reject(self: Box<Self>, err: QueueError);
}

struct TypedJob<F, T, E> {
    work: F,
    outcome: oneshot::Sender<Result<T, E>>,
}

impl<F, Fut, T, E> Job for TypedJob<F, T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<QueueError> + Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let TypedJob { work, outcome } = *self;
        Box::pin(async move {
            let result = work().await;
            // Receiver may be gone; the result is simply discarded
            let _ = outcome.send(result);
        })
    }

    fn reject(self: Box<Self>, err: QueueError) {
        let _ = self.outcome.send(Err(E::from(err)));
    }
}

struct QueuedUnit {
    id: Uuid,
    model: String,
    ctx: CallerContext,
    job: Box<dyn Job>,
}

/// Counters mutated together with the heap.
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    peak: usize,
    admitted: u64,
    completed: u64,
    rejected: u64,
    high: usize,
    normal: usize,
}

impl Counters {
    fn resident_mut(&mut self, priority: Priority) -> &mut usize {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
        }
    }
}

struct QueueState {
    heap: BinaryHeap<Prioritized<QueuedUnit>>,
    next_sequence: u64,
    counters: Counters,
    closed: bool,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub current_size: usize,
    pub peak_size: usize,
    pub capacity: usize,
    pub workers: usize,
    pub total_admitted: u64,
    pub total_completed: u64,
    pub total_rejected: u64,
    pub high_priority: usize,
    pub normal_priority: usize,
}

struct Shared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// One permit per admitted unit; closed at shutdown
    signal: Semaphore,
    stopped: CancellationToken,
    collector: Arc<Collector>,
}

impl Shared {
    fn snapshot_locked(&self, state: &QueueState) -> QueueSnapshot {
        let c = state.counters;
        QueueSnapshot {
            current_size: state.heap.len(),
            peak_size: c.peak,
            capacity: self.config.capacity,
            workers: self.config.workers,
            total_admitted: c.admitted,
            total_completed: c.completed,
            total_rejected: c.rejected,
            high_priority: c.high,
            normal_priority: c.normal,
        }
    }

    fn publish_depth(&self, snapshot: &QueueSnapshot) {
        self.collector.set_queue_depth(
            snapshot.current_size,
            snapshot.peak_size,
            snapshot.high_priority,
            snapshot.normal_priority,
        );
    }

    fn pop(&self) -> Option<Prioritized<QueuedUnit>> {
        let mut state = self.state.lock();
        let entry = state.heap.pop()?;
        let resident = state.counters.resident_mut(entry.priority);
        *resident = resident.saturating_sub(1);
        let snapshot = self.snapshot_locked(&state);
        drop(state);

        self.publish_depth(&snapshot);
        Some(entry)
    }

    /// Remove a unit whose submitter gave up before it was dequeued.
    fn withdraw(&self, id: Uuid) {
        let mut state = self.state.lock();
        let mut removed = None;
        state.heap.retain(|e| {
            if e.item.id == id {
                removed = Some(e.priority);
                false
            } else {
                true
            }
        });
        let Some(priority) = removed else { return };
        let resident = state.counters.resident_mut(priority);
        *resident = resident.saturating_sub(1);
        let snapshot = self.snapshot_locked(&state);
        drop(state);

        self.publish_depth(&snapshot);
    }
}

/// Removes a unit from the heap when its submitter goes away.
///
/// A no-op once a worker has popped the unit.
struct Withdraw<'a> {
    shared: &'a Shared,
    id: Uuid,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        self.shared.withdraw(self.id);
    }
}

/// Bounded priority queue served by a fixed pool of workers.
pub struct AdmissionQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AdmissionQueue {
    /// Build the queue and spawn its workers and rate sampler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: QueueConfig, collector: Arc<Collector>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::with_capacity(config.capacity),
                next_sequence: 0,
                counters: Counters::default(),
                closed: false,
            }),
            signal: Semaphore::new(0),
            stopped: CancellationToken::new(),
            collector,
            config,
        });

        let mut handles: Vec<JoinHandle<()>> = (0..shared.config.workers)
            .map(|index| tokio::spawn(worker_loop(index, shared.clone())))
            .collect();
        handles.push(tokio::spawn(rate_sampler(shared.clone())));

        info!(
            capacity = shared.config.capacity,
            workers = shared.config.workers,
            "Admission queue started"
        );

        Arc::new(Self { shared, workers: Mutex::new(handles) })
    }

    /// Submit a unit of work and wait for its outcome.
    ///
    /// Fails immediately with [`QueueError::QueueFull`] when the queue is at
    /// capacity. Returns the context's error as soon as `ctx` fires, even if
    /// the unit is still resident or running.
    pub async fn submit<F, Fut, T, E>(
        &self,
        ctx: &CallerContext,
        model: &str,
        priority: Priority,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<QueueError> + Send + 'static,
    {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let unit = QueuedUnit {
            id,
            model: model.to_string(),
            ctx: ctx.clone(),
            job: Box::new(TypedJob { work, outcome: tx }),
        };
        self.admit(unit, priority)?;
        // Dropping the submitter takes the unit out of the heap as well
        let _withdraw = Withdraw { shared: &*self.shared, id };

        tokio::select! {
            biased;
            outcome = rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(QueueError::WorkLost.into()),
            },
            err = ctx.done() => {
                debug!(id = %id, model = %model, reason = err.reason(), "Submitter stopped waiting");
                Err(err.into())
            }
        }
    }

    fn admit(&self, unit: QueuedUnit, priority: Priority) -> Result<(), QueueError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state.closed {
            return Err(QueueError::ShuttingDown);
        }

        if state.heap.len() >= shared.config.capacity {
            state.counters.rejected += 1;
            drop(state);
            shared.collector.record_rejection();
            warn!(model = %unit.model, priority = %priority, "Queue full, request rejected");
            return Err(QueueError::QueueFull { capacity: shared.config.capacity });
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let (id, model) = (unit.id, unit.model.clone());
        state.heap.push(Prioritized { priority, submitted_at: Instant::now(), sequence, item: unit });
        state.counters.admitted += 1;
        *state.counters.resident_mut(priority) += 1;
        state.counters.peak = state.counters.peak.max(state.heap.len());
        let snapshot = shared.snapshot_locked(&state);
        drop(state);

        shared.signal.add_permits(1);
        shared.publish_depth(&snapshot);
        debug!(id = %id, model = %model, priority = %priority, depth = snapshot.current_size, "Request admitted");
        Ok(())
    }

    /// Current statistics.
    pub fn stats(&self) -> QueueSnapshot {
        let state = self.shared.state.lock();
        self.shared.snapshot_locked(&state)
    }

    /// Stop admitting work, fail resident units and wait for the workers.
    ///
    /// Returns [`QueueError::ShutdownTimeout`] if running units do not finish
    /// within `timeout`. Calling it again after it returned is a no-op.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError> {
        let drained: Vec<Prioritized<QueuedUnit>> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                Vec::new()
            } else {
                state.closed = true;
                state.counters.high = 0;
                state.counters.normal = 0;
                state.heap.drain().collect()
            }
        };

        self.shared.signal.close();
        self.shared.stopped.cancel();

        if !drained.is_empty() {
            info!(count = drained.len(), "Failing queued requests at shutdown");
        }
        for entry in drained {
            entry.item.job.reject(QueueError::ShuttingDown);
        }
        self.shared.publish_depth(&self.stats());

        let handles = std::mem::take(&mut *self.workers.lock());
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("Admission queue drained");
                Ok(())
            }
            Err(_) => {
                warn!(timeout = ?timeout, "Admission queue did not drain in time");
                Err(QueueError::ShutdownTimeout { timeout })
            }
        }
    }
}

async fn worker_loop(index: usize, shared: Arc<Shared>) {
    debug!(worker = index, "Worker started");

    loop {
        match shared.signal.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => break,
        }

        // A withdrawn unit leaves a spare permit behind
        let Some(entry) = shared.pop() else { continue };

        let wait = entry.submitted_at.elapsed();
        let unit = entry.item;
        shared.collector.record_queue_wait(&unit.model, entry.priority, wait);

        if let Some(err) = unit.ctx.err() {
            debug!(worker = index, id = %unit.id, reason = err.reason(), "Skipping expired request");
            unit.job.reject(err);
            continue;
        }

        debug!(worker = index, id = %unit.id, model = %unit.model, wait_ms = wait.as_millis() as u64, "Executing request");
        if AssertUnwindSafe(unit.job.run()).catch_unwind().await.is_err() {
            error!(worker = index, id = %unit.id, model = %unit.model, "Request handler panicked");
        }

        shared.state.lock().counters.completed += 1;
    }

    debug!(worker = index, "Worker stopped");
}

/// Completions per second between two samples of the completion counter.
pub fn processing_rate(previous: u64, current: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    current.saturating_sub(previous) as f64 / secs
}

async fn rate_sampler(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.sample_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_count = 0u64;
    let mut last_at = Instant::now();

    loop {
        tokio::select! {
            _ = shared.stopped.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let completed = shared.state.lock().counters.completed;
        let now = Instant::now();
        shared.collector.set_processing_rate(processing_rate(last_count, completed, now - last_at));
        last_count = completed;
        last_at = now;
    }

    shared.collector.set_processing_rate(0.0);
}
