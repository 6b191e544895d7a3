//! Worker loop: N concurrent claim loops over the job queue with graceful
//! ctrl-c shutdown. Claims dispatch on the job payload; every failure is
//! recorded with its error class and cascades to dependents.

use metrics::gauge;
use pipeline_core::config::WorkerConfig;
use pipeline_core::{Error, Result};
use rand::Rng;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::archive;
use crate::model::{Job, JobPayload};
use crate::queue;
use crate::sync::SyncRunner;
use crate::transform::TransformEngine;

pub struct Worker {
    db: PgPool,
    sync: Arc<SyncRunner>,
    transforms: Arc<TransformEngine>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        db: PgPool,
        sync: Arc<SyncRunner>,
        transforms: Arc<TransformEngine>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            db,
            sync,
            transforms,
            config,
        }
    }

    /// Run claim loops until ctrl-c. In-flight jobs finish before return;
    /// nothing is claimed after the signal.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops = JoinSet::new();

        for worker_id in 0..self.config.concurrency {
            let worker = Arc::clone(&self);
            let shutdown = shutdown_rx.clone();
            loops.spawn(async move { worker.claim_loop(worker_id, shutdown).await });
        }

        gauge!("pipeline_worker_concurrency").set(self.config.concurrency as f64);
        info!(concurrency = self.config.concurrency, "Worker started");

        tokio::signal::ctrl_c().await.map_err(Error::Io)?;
        info!("Shutdown signal received, draining in-flight jobs");
        let _ = shutdown_tx.send(true);

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Claim loop panicked");
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    async fn claim_loop(&self, worker_id: usize, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            match queue::claim_next(&self.db).await {
                Ok(Some(job)) => self.execute(&job).await,
                Ok(None) => self.idle().await,
                Err(e) => {
                    warn!(worker_id, error = %e, "Claim failed");
                    self.idle().await;
                }
            }
        }
    }

    /// Empty-queue pause with jitter so concurrent loops don't poll in
    /// lockstep.
    async fn idle(&self) {
        let jitter = rand::thread_rng().gen_range(0..=self.config.claim_jitter_ms);
        tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs) + Duration::from_millis(jitter))
            .await;
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    async fn execute(&self, job: &Job) {
        let result = self.dispatch(job).await;

        match result {
            Ok(Outcome::Finished(records)) => {
                if let Err(e) = queue::complete(&self.db, job.id, records).await {
                    warn!(job_id = %job.id, error = %e, "Could not mark job succeeded");
                }
            }
            Ok(Outcome::Cancelled) => {
                // The row is already terminal; nothing to record.
                info!(job_id = %job.id, "Job stopped after external cancellation");
            }
            Err(e) => {
                if let Err(record_err) = queue::fail(
                    &self.db,
                    job.id,
                    e.class(),
                    &e.to_string(),
                    e.is_retryable(),
                )
                .await
                {
                    // Lost the race with a concurrent cancel; the job is
                    // terminal either way.
                    warn!(
                        job_id = %job.id,
                        error = %record_err,
                        "Could not record job failure"
                    );
                }
            }
        }
    }

    async fn dispatch(&self, job: &Job) -> Result<Outcome> {
        match job.payload()? {
            JobPayload::Sync { .. } => {
                let outcome = self.sync.run(job).await?;
                if outcome.cancelled {
                    Ok(Outcome::Cancelled)
                } else {
                    Ok(Outcome::Finished(outcome.records_synced as i64))
                }
            }
            JobPayload::Transform { .. } => {
                let outcome = self.transforms.run(job).await?;
                if outcome.cancelled {
                    Ok(Outcome::Cancelled)
                } else {
                    Ok(Outcome::Finished(outcome.records_loaded as i64))
                }
            }
            JobPayload::Archive => {
                let reconciled = archive::reconcile(&self.db).await?;
                Ok(Outcome::Finished(reconciled as i64))
            }
        }
    }
}

enum Outcome {
    Finished(i64),
    Cancelled,
}
