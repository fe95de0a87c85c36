//! Worker pool — a fixed number of slots pulling customization jobs off the
//! queue and driving them through the [`Pipeline`].
//!
//! While an attempt runs its slot heartbeats both the queue lease and the
//! resume lock. Shutdown happens in two phases: `stop` ends dequeuing and
//! lets in-flight attempts finish within the grace period, then `abort`
//! interrupts whatever is left. Interrupted jobs are nacked so another
//! worker picks them up.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::pipeline::{Backoff, Claim, Disposition, Pipeline, Settlement};
use crate::queue::{Delivery, JobQueue, LockToken};

/// Shortest allowed heartbeat period.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub pool_size: usize,
    /// Lease taken on each dequeued job. Heartbeats renew it every third.
    pub lease: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    /// Delay schedule while the queue is unreachable.
    pub reconnect_backoff: Backoff,
}

impl WorkerSettings {
    fn heartbeat(&self) -> Duration {
        (self.lease / 3).max(MIN_HEARTBEAT)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Health
// ────────────────────────────────────────────────────────────────────────────

/// Live counters shared between the slots and the health endpoint.
#[derive(Debug, Default)]
pub struct PoolHealth {
    slots: AtomicUsize,
    busy: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    released: AtomicU64,
    infrastructure_failures: AtomicU64,
    queue_errors: AtomicU64,
    stopping: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub slots: usize,
    pub busy: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub released: u64,
    pub infrastructure_failures: u64,
    pub queue_errors: u64,
    pub stopping: bool,
}

impl PoolHealth {
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            slots: self.slots.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            infrastructure_failures: self.infrastructure_failures.load(Ordering::Relaxed),
            queue_errors: self.queue_errors.load(Ordering::Relaxed),
            stopping: self.stopping.load(Ordering::Relaxed),
        }
    }

    fn record(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::Completed => &self.completed,
            Disposition::Failed => &self.failed,
            Disposition::RetryLater(_) => &self.retried,
            Disposition::Busy(_) | Disposition::Interrupted => &self.released,
            Disposition::Infrastructure(_) => &self.infrastructure_failures,
            Disposition::AlreadyTerminal | Disposition::Missing => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrements the busy gauge even if the slot's future is dropped.
struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pool
// ────────────────────────────────────────────────────────────────────────────

struct Slot {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    settings: WorkerSettings,
    health: Arc<PoolHealth>,
    stop: CancellationToken,
    abort: CancellationToken,
}

pub struct WorkerPool {
    tasks: JoinSet<()>,
    stop: CancellationToken,
    abort: CancellationToken,
    grace: Duration,
    health: Arc<PoolHealth>,
}

impl WorkerPool {
    /// Spawns `settings.pool_size` slots on the current runtime.
    pub fn start(
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<Pipeline>,
        settings: WorkerSettings,
        health: Arc<PoolHealth>,
    ) -> Self {
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let pool_size = settings.pool_size.max(1);
        let grace = settings.shutdown_grace;

        let slot = Arc::new(Slot {
            queue,
            pipeline,
            settings,
            health: Arc::clone(&health),
            stop: stop.clone(),
            abort: abort.clone(),
        });

        let mut tasks = JoinSet::new();
        for slot_id in 0..pool_size {
            let slot = Arc::clone(&slot);
            tasks.spawn(async move { slot.run(slot_id).await });
        }
        health.slots.store(pool_size, Ordering::Relaxed);
        info!("Started {pool_size} customization workers");

        Self {
            tasks,
            stop,
            abort,
            grace,
            health,
        }
    }

    /// Stops dequeuing, waits up to the grace period for in-flight attempts,
    /// then interrupts the rest and waits for their jobs to be released.
    pub async fn shutdown(mut self) {
        info!("Shutting down worker pool...");
        self.health.stopping.store(true, Ordering::Relaxed);
        self.stop.cancel();

        let drained = tokio::time::timeout(self.grace, join_all(&mut self.tasks)).await;
        if drained.is_err() {
            warn!(
                "Workers still busy after {}ms; interrupting in-flight attempts",
                self.grace.as_millis()
            );
            self.abort.cancel();
            join_all(&mut self.tasks).await;
        }

        self.health.slots.store(0, Ordering::Relaxed);
        info!("All workers have stopped");
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("Worker task panicked: {e}");
        }
    }
}

impl Slot {
    async fn run(&self, slot_id: usize) {
        debug!("Worker {slot_id} started");
        let mut consecutive_errors = 0u32;

        while !self.stop.is_cancelled() {
            // Not raced against `stop`: a dequeue cut short could strand an
            // already leased job until its lease expires.
            match self.queue.dequeue(self.settings.lease).await {
                Ok(Some(delivery)) => {
                    consecutive_errors = 0;
                    self.handle(slot_id, delivery).await;
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    self.pause(self.settings.poll_interval).await;
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    self.health.queue_errors.fetch_add(1, Ordering::Relaxed);
                    let delay = self.settings.reconnect_backoff.delay(consecutive_errors);
                    error!(
                        "Worker {slot_id} failed to dequeue (retrying in {}ms): {e}",
                        delay.as_millis()
                    );
                    self.pause(delay).await;
                }
            }
        }

        debug!("Worker {slot_id} stopped");
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn handle(&self, slot_id: usize, delivery: Delivery) {
        let _busy = BusyGuard::enter(&self.health.busy);
        let span = info_span!(
            "job",
            worker = slot_id,
            job_id = %delivery.job.job_id,
            resume_id = %delivery.job.resume_id,
            delivery = delivery.job.attempt
        );

        async {
            let disposition = match self.pipeline.claim(&delivery.job).await {
                Claim::Skip(disposition) => disposition,
                Claim::Ready { record, lock } => {
                    let attempt = self.pipeline.run_attempt(record);
                    let disposition = self.supervise(&delivery, &lock, attempt).await;
                    self.pipeline.release(&lock).await;
                    disposition
                }
            };

            debug!(?disposition, "Attempt settled");
            self.health.record(&disposition);
            self.settle(&delivery, disposition.settlement()).await;
        }
        .instrument(span)
        .await
    }

    /// Drives `attempt` while renewing the lease and lock. Cuts it short when
    /// the pool is aborted or the lock is lost to another worker.
    async fn supervise(
        &self,
        delivery: &Delivery,
        lock: &LockToken,
        attempt: impl Future<Output = Disposition>,
    ) -> Disposition {
        tokio::pin!(attempt);
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                disposition = &mut attempt => return disposition,
                _ = self.abort.cancelled() => {
                    warn!("Attempt interrupted by shutdown; releasing job");
                    return Disposition::Interrupted;
                }
                _ = heartbeat.tick() => {
                    match self.queue.extend_lease(delivery, self.settings.lease).await {
                        Ok(true) => {}
                        Ok(false) => warn!("Queue lease lost; job may be redelivered"),
                        Err(e) => warn!("Failed to extend queue lease: {e}"),
                    }
                    match self.pipeline.extend_lock(lock).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("Resume lock lost; abandoning attempt");
                            return Disposition::Interrupted;
                        }
                        Err(e) => warn!("Failed to extend resume lock: {e}"),
                    }
                }
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, settlement: Settlement) {
        let result = match settlement {
            Settlement::Ack => self.queue.ack(delivery).await,
            Settlement::Nack(delay) => self.queue.nack(delivery, delay).await,
        };
        match result {
            Ok(true) => {}
            Ok(false) => warn!(?settlement, "Lease expired before settlement; job will be redelivered"),
            Err(e) => error!(?settlement, "Failed to settle job, lease expiry will redeliver it: {e}"),
        }
    }
}
