use crate::archive::Archiver;
use crate::storage::{ObjectStore, S3Store};
use crate::sync::{HttpProviderFactory, SyncRunner};
use crate::transform::TransformEngine;
use crate::worker::Worker;
use crate::scheduler;
use pipeline_core::{Config, Result};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Long-running worker process: object store, archiver, runners, scheduler.
/// One-shot CLI commands talk to the pool directly and never build this.
pub struct App {
    db: PgPool,
    worker: Arc<Worker>,
    scheduler_interval: Duration,
}

impl App {
    #[instrument(skip(config, pool))]
    pub async fn new(config: Config, pool: PgPool) -> Result<Self> {
        info!("Initializing pipeline worker");

        let store: Arc<dyn ObjectStore> = Arc::new(
            S3Store::new(
                config.storage.s3_bucket.clone(),
                config.storage.region.clone(),
                config.storage.aws_profile.clone(),
            )
            .await?,
        );

        info!("Performing health checks");
        sqlx::query("SELECT 1").execute(&pool).await?;
        store.health_check().await?;

        let archiver = Arc::new(Archiver::new(
            pool.clone(),
            Arc::clone(&store),
            config.archive.max_retries,
            config.archive.retry_base_delay_ms,
            Duration::from_secs(config.storage.write_timeout_secs),
        ));

        let factory = Arc::new(HttpProviderFactory::new(&config.sync));
        let sync = Arc::new(SyncRunner::new(
            pool.clone(),
            archiver,
            factory,
            config.sync.clone(),
        ));

        let transforms = Arc::new(TransformEngine::new(pool.clone(), store));

        let worker = Arc::new(Worker::new(
            pool.clone(),
            sync,
            transforms,
            config.worker.clone(),
        ));

        Ok(Self {
            db: pool,
            worker,
            scheduler_interval: Duration::from_secs(config.worker.poll_interval_secs.max(30)),
        })
    }

    /// Claim loops plus the cron trigger, until ctrl-c.
    pub async fn run_worker(&self) -> Result<()> {
        let scheduler = tokio::spawn(scheduler::run(self.db.clone(), self.scheduler_interval));

        let result = Arc::clone(&self.worker).run().await;

        scheduler.abort();
        result
    }
}
