//! Bounded pool running crash analysis sessions.
//!
//! Submissions go into a bounded queue; a single pump task takes them out as
//! soon as a worker permit is free. A full queue rejects the submission
//! instead of blocking the trace reader.

use crashwatch_core::CrashAnalysisWorker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::metrics;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("crash analysis queue full, dropping {0}")]
    QueueFull(String),
    #[error("crash analysis dispatcher is shut down")]
    Closed,
}

pub struct CrashDispatcher {
    tx: mpsc::Sender<CrashAnalysisWorker>,
    pump: JoinHandle<()>,
}

impl CrashDispatcher {
    pub fn start(max_workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(max_workers.max(1)));
        let pump = tokio::spawn(pump(rx, permits, max_workers.max(1)));
        info!(
            "Crash dispatcher started: {} workers, queue of {}",
            max_workers, queue_capacity
        );
        Self { tx, pump }
    }

    /// Queue a session without waiting.
    pub fn submit(&self, worker: CrashAnalysisWorker) -> Result<(), DispatchError> {
        match self.tx.try_send(worker) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(worker)) => {
                metrics::record_dispatch_rejected();
                Err(DispatchError::QueueFull(worker.name().to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Stop accepting work and wait for queued and running sessions.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.pump.await {
            error!("Dispatcher pump failed: {}", e);
        }
        info!("Crash dispatcher drained");
    }
}

async fn pump(mut rx: mpsc::Receiver<CrashAnalysisWorker>, permits: Arc<Semaphore>, max_workers: usize) {
    let in_flight = Arc::new(AtomicUsize::new(0));

    while let Some(worker) = rx.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let name = worker.name().to_string();
        metrics::update_sessions_in_flight(in_flight.fetch_add(1, Ordering::SeqCst) + 1);

        let session = tokio::spawn(worker.run());
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            match session.await {
                Ok(outcome) => {
                    info!("{} finished: {:?}", name, outcome);
                    metrics::record_session(&outcome);
                }
                Err(e) => error!("{} did not complete: {}", name, e),
            }
            metrics::update_sessions_in_flight(in_flight.fetch_sub(1, Ordering::SeqCst) - 1);
            drop(permit);
        });
    }

    // Every permit back means every session is done.
    match permits.acquire_many(max_workers as u32).await {
        Ok(_) => {}
        Err(e) => warn!("Could not wait for running sessions: {}", e),
    }
}
