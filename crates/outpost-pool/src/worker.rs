use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::pool::{Handler, Job};

/// A single pool worker.
///
/// The worker advertises availability by sending its job slot into the
/// pool's idle channel, then waits on the slot. The select is biased toward
/// the slot so that a job the dispatcher has already handed off always wins
/// over a concurrently arriving stop signal.
pub(crate) struct Worker {
    id: usize,
    handlers: Arc<HashMap<String, Arc<Handler>>>,
    idle_tx: mpsc::Sender<mpsc::Sender<Job>>,
    slot_tx: mpsc::Sender<Job>,
    slot_rx: mpsc::Receiver<Job>,
    stop_rx: mpsc::Receiver<()>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        handlers: Arc<HashMap<String, Arc<Handler>>>,
        idle_tx: mpsc::Sender<mpsc::Sender<Job>>,
        stop_rx: mpsc::Receiver<()>,
    ) -> Self {
        let (slot_tx, slot_rx) = mpsc::channel(1);
        Self {
            id,
            handlers,
            idle_tx,
            slot_tx,
            slot_rx,
            stop_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            if self.idle_tx.send(self.slot_tx.clone()).await.is_err() {
                break;
            }
            tokio::select! {
                biased;
                job = self.slot_rx.recv() => match job {
                    Some(job) => self.run_job(job).await,
                    None => break,
                },
                _ = self.stop_rx.recv() => break,
            }
        }
        tracing::debug!(worker = self.id, "worker stopped");
    }

    async fn run_job(&self, job: Job) {
        let Some(handler) = self.handlers.get(&job.action) else {
            tracing::warn!(action = %job.action, "unknown job action");
            return;
        };
        // The handler runs in its own task so a panic surfaces as a join
        // error here instead of unwinding through the worker loop.
        match tokio::spawn(handler(job.payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(action = %job.action, error = %err, "job failed");
            }
            Err(join_err) if join_err.is_panic() => {
                tracing::error!(
                    worker = self.id,
                    action = %job.action,
                    "panic in job handler: {}",
                    panic_message(join_err)
                );
            }
            Err(_) => {}
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "opaque panic payload".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}
