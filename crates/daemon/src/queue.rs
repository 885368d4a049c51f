//! Dispatcher: bounded job queue, worker pool and crash recovery.
//!
//! Job ids flow through one bounded multi-consumer channel; each worker
//! takes ids off it and runs them through the [`Processor`]. `enqueue` is
//! the only back-pressure point: it gives up after a fixed timeout when the
//! channel stays full.

use crate::broadcast::{SubscriberId, Subscription};
use crate::concurrency::QueuePlan;
use crate::jobs::{create_job, Job, NewJob, ValidationError};
use crate::processor::Processor;
use crate::store::StoreError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default capacity of the pending job channel.
pub const DEFAULT_CAPACITY: usize = 100;
/// Default time `enqueue` waits on a full channel.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is full (waited {0:?})")]
    EnqueueTimeout(Duration),

    #[error("job queue is closed")]
    Closed,

    #[error("job {0} not found or not active")]
    NotActive(String),

    #[error("invalid job request: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Dispatcher {
    processor: Arc<Processor>,
    tx: async_channel::Sender<String>,
    rx: async_channel::Receiver<String>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    enqueue_timeout: Duration,
}

impl Dispatcher {
    pub fn new(processor: Arc<Processor>, capacity: usize, enqueue_timeout: Duration) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self {
            processor,
            tx,
            rx,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            enqueue_timeout,
        }
    }

    pub fn from_plan(processor: Arc<Processor>, plan: &QueuePlan) -> Self {
        Self::new(processor, plan.capacity, plan.enqueue_timeout)
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    /// Launches `workers` worker tasks, then re-enqueues every unfinished
    /// job found in the store.
    ///
    /// # Returns
    /// The recovery task; it resolves to the number of re-enqueued jobs.
    pub fn start(&self, workers: u32) -> JoinHandle<usize> {
        {
            let mut handles = self.workers.lock();
            for worker in 0..workers {
                handles.push(tokio::spawn(worker_loop(
                    worker,
                    self.processor.clone(),
                    self.rx.clone(),
                    self.shutdown.clone(),
                )));
            }
        }
        info!(workers, "job workers started");

        let processor = self.processor.clone();
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { recover(processor, tx, shutdown).await })
    }

    /// Puts a job id on the queue, waiting at most the enqueue timeout for
    /// room.
    pub async fn enqueue(&self, job_id: &str) -> Result<(), QueueError> {
        match tokio::time::timeout(self.enqueue_timeout, self.tx.send(job_id.to_string())).await {
            Ok(Ok(())) => {
                debug!(job_id, "job enqueued");
                Ok(())
            }
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => {
                warn!(job_id, timeout = ?self.enqueue_timeout, "job queue full, enqueue timed out");
                Err(QueueError::EnqueueTimeout(self.enqueue_timeout))
            }
        }
    }

    /// Validates a request, stores it as a Queued job and enqueues it.
    ///
    /// On `EnqueueTimeout` the record stays Queued; recovery picks it up on
    /// the next start.
    pub async fn submit(&self, request: NewJob) -> Result<Job, QueueError> {
        let job = create_job(request)?;
        self.processor.store().insert(&job).await?;
        info!(job_id = %job.id, media_id = %job.media_id, mode = %job.transcode_mode, "job created");
        self.enqueue(&job.id).await?;
        Ok(job)
    }

    /// Cancels a job a worker is currently processing.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), QueueError> {
        if self.processor.cancel_job(job_id).await {
            Ok(())
        } else {
            Err(QueueError::NotActive(job_id.to_string()))
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.processor.broadcaster().subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.processor.broadcaster().unsubscribe(id)
    }

    /// Job ids waiting for a worker.
    pub fn queued_len(&self) -> usize {
        self.rx.len()
    }

    /// Signals shutdown and waits for every worker to finish its current job.
    ///
    /// In-flight jobs are not interrupted. Ids still queued stay Queued in
    /// the store.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tx.close();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("job workers stopped");
    }
}

async fn worker_loop(
    worker: u32,
    processor: Arc<Processor>,
    rx: async_channel::Receiver<String>,
    shutdown: CancellationToken,
) {
    debug!(worker, "worker started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Ok(job_id) => {
                    debug!(worker, job_id = %job_id, "worker picked up job");
                    processor.process(&job_id).await;
                }
                Err(_) => break,
            },
        }
    }
    debug!(worker, "worker stopped");
}

/// Re-enqueues jobs left unfinished by a previous run.
///
/// Interrupted encodes restart from the beginning.
async fn recover(
    processor: Arc<Processor>,
    tx: async_channel::Sender<String>,
    shutdown: CancellationToken,
) -> usize {
    let jobs = match processor.store().list_unfinished().await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(error = %e, "failed to list unfinished jobs for recovery");
            return 0;
        }
    };

    let mut recovered = 0;
    for job in jobs {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = tx.send(job.id.clone()) => {
                if sent.is_err() {
                    break;
                }
                debug!(job_id = %job.id, stage = %job.stage, "re-enqueued unfinished job");
                recovered += 1;
            }
        }
    }
    if recovered > 0 {
        info!(recovered, "recovered unfinished jobs");
    }
    recovered
}
