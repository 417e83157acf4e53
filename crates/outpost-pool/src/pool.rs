use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::worker::Worker;

/// Opaque job payload. The adapter installed by [`Pool::register`] downcasts
/// it back to the handler's concrete type.
pub(crate) type JobPayload = Box<dyn Any + Send>;

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub(crate) type Handler = dyn Fn(JobPayload) -> HandlerFuture + Send + Sync;

pub(crate) struct Job {
    pub action: String,
    pub payload: JobPayload,
}

/// Admission failures surfaced to submitters.
///
/// The display strings are part of the HTTP contract: they are returned
/// verbatim in 503 response bodies.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("queue is full")]
    QueueFull,
}

/// Interval at which [`Pool::shutdown`] re-checks the drain condition.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// A fixed-size worker pool over a bounded job queue.
///
/// Lifecycle: [`new`](Pool::new) → [`register`](Pool::register) (repeat) →
/// [`start`](Pool::start) → [`submit`](Pool::submit) from any task →
/// [`shutdown`](Pool::shutdown).
pub struct Pool {
    size: usize,
    queue_cap: usize,
    handlers: HashMap<String, Arc<Handler>>,
    jobs_tx: mpsc::Sender<Job>,
    jobs_rx: Mutex<Option<mpsc::Receiver<Job>>>,
    idle_tx: mpsc::Sender<mpsc::Sender<Job>>,
    idle_rx: Mutex<Option<mpsc::Receiver<mpsc::Sender<Job>>>>,
    closing: AtomicBool,
    /// Jobs admitted but not yet handed to a worker slot. Strictly greater
    /// than or equal to the queue occupancy: it also covers the one job the
    /// dispatcher may hold between dequeue and hand-off, which is what lets
    /// `shutdown` avoid stopping a worker that is still owed a job.
    pending: Arc<AtomicUsize>,
    dispatcher_stop: Arc<Notify>,
    stops: Mutex<Vec<mpsc::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Creates a pool with `size` workers and room for `queue_cap` queued
    /// jobs. Neither may be zero.
    pub fn new(size: usize, queue_cap: usize) -> Self {
        assert!(size > 0, "pool size must be non-zero");
        assert!(queue_cap > 0, "queue capacity must be non-zero");
        let (jobs_tx, jobs_rx) = mpsc::channel(queue_cap);
        let (idle_tx, idle_rx) = mpsc::channel(size);
        Self {
            size,
            queue_cap,
            handlers: HashMap::new(),
            jobs_tx,
            jobs_rx: Mutex::new(Some(jobs_rx)),
            idle_tx,
            idle_rx: Mutex::new(Some(idle_rx)),
            closing: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
            dispatcher_stop: Arc::new(Notify::new()),
            stops: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers `handler` for jobs submitted under `action`.
    ///
    /// The payload submitted for this action must be exactly `T`; a
    /// mismatched submission becomes a handler error, not a panic.
    /// Registration must happen before [`start`](Pool::start).
    pub fn register<T, H, Fut>(&mut self, action: &str, handler: H)
    where
        T: Send + 'static,
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let adapter: Arc<Handler> = Arc::new(move |payload: JobPayload| -> HandlerFuture {
            match payload.downcast::<T>() {
                Ok(typed) => Box::pin(handler(*typed)),
                Err(_) => Box::pin(async {
                    Err(anyhow::anyhow!(
                        "payload does not match the registered handler type"
                    ))
                }),
            }
        });
        self.handlers.insert(action.to_string(), adapter);
    }

    /// Spawns the worker tasks and the dispatcher.
    pub fn start(&self) {
        let handlers = Arc::new(self.handlers.clone());
        let mut tasks = self.tasks.lock().unwrap();
        let mut stops = self.stops.lock().unwrap();

        for id in 0..self.size {
            let (stop_tx, stop_rx) = mpsc::channel(1);
            let worker = Worker::new(id, handlers.clone(), self.idle_tx.clone(), stop_rx);
            stops.push(stop_tx);
            tasks.push(tokio::spawn(worker.run()));
        }

        let jobs_rx = self
            .jobs_rx
            .lock()
            .unwrap()
            .take()
            .expect("start() called twice");
        let idle_rx = self.idle_rx.lock().unwrap().take().expect("start() called twice");
        tasks.push(tokio::spawn(dispatch(
            jobs_rx,
            idle_rx,
            self.pending.clone(),
            self.dispatcher_stop.clone(),
        )));
    }

    /// Admits a job without blocking.
    ///
    /// Returns [`PoolError::Closed`] once shutdown has begun and
    /// [`PoolError::QueueFull`] when the queue is at capacity.
    pub fn submit<T: Send + 'static>(&self, action: &str, payload: T) -> Result<(), PoolError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let job = Job {
            action: action.to_string(),
            payload: Box::new(payload),
        };
        // Counted before the send so the drain loop can never observe zero
        // while a job it should wait for sits in the queue.
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.jobs_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Err(PoolError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Err(PoolError::Closed)
            }
        }
    }

    /// Number of jobs currently sitting in the queue.
    pub fn queue_len(&self) -> usize {
        self.jobs_tx.max_capacity() - self.jobs_tx.capacity()
    }

    /// Number of workers not currently waiting for a job.
    pub fn active_workers(&self) -> usize {
        self.size - (self.idle_tx.max_capacity() - self.idle_tx.capacity())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn queue_cap(&self) -> usize {
        self.queue_cap
    }

    /// Whether shutdown has begun. The web front uses this to refuse work
    /// before spending effort on parsing.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Drains the queue and stops all workers.
    ///
    /// New submissions are rejected immediately; queued jobs run to
    /// completion. Returns once every worker task has exited, so afterwards
    /// no handler is executing and [`active_workers`](Pool::active_workers)
    /// reads zero.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("finishing all jobs");
        while self.pending.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        self.dispatcher_stop.notify_one();
        let stops: Vec<_> = self.stops.lock().unwrap().drain(..).collect();
        for stop in stops {
            let _ = stop.send(()).await;
        }
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("worker pool stopped");
    }
}

/// Pairs queued jobs with idle workers, FIFO over jobs.
async fn dispatch(
    mut jobs_rx: mpsc::Receiver<Job>,
    mut idle_rx: mpsc::Receiver<mpsc::Sender<Job>>,
    pending: Arc<AtomicUsize>,
    stop: Arc<Notify>,
) {
    loop {
        let job = tokio::select! {
            biased;
            job = jobs_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = stop.notified() => break,
        };
        let Some(slot) = idle_rx.recv().await else {
            break;
        };
        if slot.send(job).await.is_err() {
            tracing::warn!("idle worker vanished before hand-off; job dropped");
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}
