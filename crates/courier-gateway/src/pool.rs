//! Dynamically scaled worker pool.
//!
//! A bounded job queue drained by a resizable set of worker tasks. A
//! periodic controller compares queue backlog with the worker count and
//! adds or retires one worker per tick, staying inside
//! `[min_workers, max_workers]`.
//!
//! Each worker owns a child [`CancellationToken`] of the pool token. A
//! worker only observes its token while waiting for the next job, so a
//! retired or shut-down worker always finishes the job it already took.

use crate::config::PoolConfig;
use crate::metrics::{POOL_JOBS_FAILED, POOL_WORKERS_ACTIVE};
use courier_core::{CourierError, CourierResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Processes jobs taken from a [`WorkerPool`].
pub trait JobHandler<J>: Send + Sync + 'static {
    /// Handle one job. Errors are logged and counted, never retried.
    fn handle(&self, job: J) -> impl Future<Output = CourierResult<()>> + Send;

    /// Release resources once every worker has exited.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

struct Worker {
    id: usize,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    running: Vec<Worker>,
    /// Retired workers that may still be finishing a job.
    retiring: Vec<JoinHandle<()>>,
    next_id: usize,
}

pub struct WorkerPool<J, H> {
    name: String,
    config: PoolConfig,
    handler: Arc<H>,
    tx: mpsc::Sender<J>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<J>>>,
    workers: Mutex<Workers>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<J, H> WorkerPool<J, H>
where
    J: Send + 'static,
    H: JobHandler<J>,
{
    /// Create the pool and start `min_workers` workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>, config: PoolConfig, handler: H) -> CourierResult<Arc<Self>> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_size);
        let pool = Arc::new(Self {
            name: name.into(),
            handler: Arc::new(handler),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Mutex::new(Workers::default()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            config,
        });
        pool.scale_to(pool.config.min_workers);
        info!(
            pool = %pool.name,
            min = pool.config.min_workers,
            max = pool.config.max_workers,
            queue = pool.config.queue_size,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Jobs waiting in the queue.
    pub fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Workers currently running (retired workers excluded).
    pub fn worker_count(&self) -> usize {
        self.lock_workers().running.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue a job, waiting for space while the queue is full.
    pub async fn submit(&self, job: J) -> CourierResult<()> {
        if self.is_closed() {
            return Err(CourierError::PoolClosed);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CourierError::PoolClosed),
            sent = self.tx.send(job) => sent.map_err(|_| CourierError::PoolClosed),
        }
    }

    /// Resize to `target` workers, clamped to the configured bounds.
    /// Returns the resulting worker count.
    pub fn scale_to(&self, target: usize) -> usize {
        let target = target.clamp(self.config.min_workers, self.config.max_workers);
        let mut workers = self.lock_workers();
        if self.is_closed() {
            return workers.running.len();
        }

        while workers.running.len() < target {
            let id = workers.next_id;
            workers.next_id += 1;
            let stop = self.cancel.child_token();
            let task = tokio::spawn(run_worker(
                self.name.clone(),
                id,
                Arc::clone(&self.rx),
                Arc::clone(&self.handler),
                stop.clone(),
            ));
            workers.running.push(Worker { id, stop, task });
        }
        while workers.running.len() > target {
            if let Some(worker) = workers.running.pop() {
                debug!(pool = %self.name, worker = worker.id, "retiring worker");
                worker.stop.cancel();
                workers.retiring.push(worker.task);
            }
        }
        workers.retiring.retain(|task| !task.is_finished());

        let count = workers.running.len();
        metrics::gauge!(POOL_WORKERS_ACTIVE, "pool" => self.name.clone()).set(count as f64);
        count
    }

    /// One controller step: grow by one when backlog exceeds the worker
    /// count, shrink by one when more than one worker would sit idle.
    pub fn autoscale(&self) -> usize {
        let backlog = self.backlog();
        let active = self.worker_count();

        if backlog > active && active < self.config.max_workers {
            let count = self.scale_to(active + 1);
            debug!(pool = %self.name, backlog, workers = count, "scaled up");
            count
        } else if backlog + 1 < active && active > self.config.min_workers {
            let count = self.scale_to(active - 1);
            debug!(pool = %self.name, backlog, workers = count, "scaled down");
            count
        } else {
            active
        }
    }

    /// Spawn the periodic controller. It stops when the pool shuts down.
    pub fn spawn_scaler(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.scale_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.autoscale();
                    }
                }
            }
            debug!(pool = %pool.name, "scaler stopped");
        })
    }

    /// Stop every worker, wait for in-flight jobs, then close the handler.
    ///
    /// Jobs still queued are discarded. Calling this again is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut workers = self.lock_workers();
            let running = std::mem::take(&mut workers.running);
            let mut tasks = std::mem::take(&mut workers.retiring);
            tasks.extend(running.into_iter().map(|w| w.task));
            tasks
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(pool = %self.name, error = %e, "worker task failed");
            }
        }

        let dropped = self.backlog();
        metrics::gauge!(POOL_WORKERS_ACTIVE, "pool" => self.name.clone()).set(0.0);
        self.handler.close().await;
        info!(pool = %self.name, dropped, "worker pool stopped");
    }

    fn lock_workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_worker<J, H>(
    pool: String,
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<J>>>,
    handler: Arc<H>,
    stop: CancellationToken,
) where
    J: Send + 'static,
    H: JobHandler<J>,
{
    debug!(pool = %pool, worker = id, "worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            job = next_job(&rx) => job,
        };
        let Some(job) = job else { break };

        if let Err(e) = handler.handle(job).await {
            metrics::counter!(POOL_JOBS_FAILED, "pool" => pool.clone()).increment(1);
            warn!(pool = %pool, worker = id, error = %e, "job failed");
        }
    }
    debug!(pool = %pool, worker = id, "worker stopped");
}

async fn next_job<J>(rx: &tokio::sync::Mutex<mpsc::Receiver<J>>) -> Option<J> {
    rx.lock().await.recv().await
}
