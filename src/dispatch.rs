//! Bounded worker pool that feeds queued job ids to the orchestrator.
//!
//! Submissions reserve a queue slot first and only then insert the job row,
//! so a closed queue never leaves an orphan `pending` record behind. Each
//! run is wrapped in a timeout; when it fires the pipeline future is dropped,
//! which kills any external tool it was waiting on.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::JobId;
use crate::pipeline::{JobOutcome, Orchestrator};

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub job_timeout: Duration,
}

/// A reserved place in the job queue.
pub struct QueueSlot {
    permit: mpsc::OwnedPermit<JobId>,
}

impl QueueSlot {
    pub fn submit(self, id: JobId) {
        self.permit.send(id);
    }
}

pub struct Dispatcher {
    sender: Mutex<Option<mpsc::Sender<JobId>>>,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawns `worker_count` workers on the current runtime.
    pub fn start(orchestrator: Arc<Orchestrator>, config: DispatchConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let (stop, _) = watch::channel(false);

        let workers = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&receiver),
                    stop.subscribe(),
                    Arc::clone(&orchestrator),
                    config.job_timeout,
                ))
            })
            .collect();

        info!(
            workers = worker_count,
            capacity = config.queue_capacity,
            timeout_secs = config.job_timeout.as_secs(),
            "job dispatcher started"
        );

        Self {
            sender: Mutex::new(Some(sender)),
            stop,
            workers: Mutex::new(workers),
        }
    }

    /// Waits for room in the queue. Fails once the dispatcher is shut down.
    pub async fn reserve(&self) -> Result<QueueSlot> {
        let sender = self.sender.lock().clone().ok_or(Error::QueueClosed)?;
        let permit = sender.reserve_owned().await.map_err(|_| Error::QueueClosed)?;
        Ok(QueueSlot { permit })
    }

    /// Queues an existing job id, e.g. a job left `pending` by a previous run.
    pub async fn enqueue(&self, id: JobId) -> Result<()> {
        self.reserve().await?.submit(id);
        Ok(())
    }

    /// Stops accepting work and waits for in-flight jobs to finish. Jobs still
    /// queued stay `pending` and are picked up again on the next start.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        self.stop.send_replace(true);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for (worker_id, handle) in workers.into_iter().enumerate() {
            if let Err(err) = handle.await {
                error!(worker_id, "worker panicked: {err}");
            }
        }
        info!("job dispatcher stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<JobId>>>,
    mut stop: watch::Receiver<bool>,
    orchestrator: Arc<Orchestrator>,
    job_timeout: Duration,
) {
    debug!(worker_id, "worker started");
    loop {
        if *stop.borrow() {
            break;
        }
        let next = tokio::select! {
            _ = stop.changed() => None,
            id = async { receiver.lock().await.recv().await } => id,
        };
        let Some(id) = next else {
            break;
        };

        debug!(worker_id, job_id = id, "worker picked up job");
        match tokio::time::timeout(job_timeout, orchestrator.run(id)).await {
            Ok(JobOutcome::Completed) => {}
            Ok(JobOutcome::Failed(message)) => debug!(worker_id, job_id = id, "job failed: {message}"),
            Ok(JobOutcome::Skipped) => debug!(worker_id, job_id = id, "job skipped"),
            Err(_) => {
                let message = format!(
                    "processing timed out after {} seconds",
                    job_timeout.as_secs()
                );
                warn!(worker_id, job_id = id, "{message}");
                orchestrator.record_failure(id, &message).await;
            }
        }
    }
    debug!(worker_id, "worker stopped");
}
