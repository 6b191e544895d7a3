//! Incremental sync: pull paginated records from a provider, archive each
//! page durably, then and only then advance the stream cursor.
//!
//! The cursor is opaque to us. Crash recovery leans entirely on write
//! ordering: a crash between archive and cursor update refetches one page,
//! and the content-derived storage key collapses the refetch into the
//! already-archived object.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use metrics::counter;
use pipeline_core::backoff::retry_transient;
use pipeline_core::config::SyncConfig;
use pipeline_core::{Error, Result};
use sqlx::PgPool;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::archive::Archiver;
use crate::model::{Job, JobPayload, JobSpec, JobStatus, ProviderPage, Source, SyncMode};
use crate::provider::{HttpProvider, Provider};
use crate::{queue, registry, transform};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Builds a provider client for a source at claim time, so rotated
/// credentials take effect on the next sync without a restart.
pub trait ProviderFactory: Send + Sync {
    fn provider_for(&self, source: &Source) -> Result<Arc<dyn Provider>>;
}

pub struct HttpProviderFactory {
    base_urls: std::collections::HashMap<String, String>,
    timeout: Duration,
}

impl HttpProviderFactory {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            base_urls: config.provider_base_urls.clone(),
            timeout: Duration::from_secs(config.provider_timeout_secs),
        }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn provider_for(&self, source: &Source) -> Result<Arc<dyn Provider>> {
        let base_url = self.base_urls.get(&source.provider).ok_or_else(|| {
            Error::Config(format!(
                "no base URL configured for provider '{}'",
                source.provider
            ))
        })?;

        // OAuth sources carry an access token, paired devices a device token.
        let bearer = source
            .access_token
            .clone()
            .or_else(|| source.device_token.clone());

        Ok(Arc::new(HttpProvider::new(
            source.provider.clone(),
            base_url.clone(),
            bearer,
            self.timeout,
        )?))
    }
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub records_synced: u64,
    pub pages_fetched: u32,
    pub objects_written: u32,
    pub cancelled: bool,
}

/// What the page loop does after handling one page.
#[derive(Debug, PartialEq, Eq)]
enum PageStep {
    Continue,
    Done,
}

fn next_page_step(page: &ProviderPage) -> PageStep {
    // A provider claiming more data without a cursor to resume from would
    // loop on the same page forever.
    if page.has_more && page.next_cursor.is_some() {
        PageStep::Continue
    } else {
        PageStep::Done
    }
}

pub struct SyncRunner {
    db: PgPool,
    archiver: Arc<Archiver>,
    factory: Arc<dyn ProviderFactory>,
    config: SyncConfig,
    limiter: Arc<DirectRateLimiter>,
}

impl SyncRunner {
    pub fn new(
        db: PgPool,
        archiver: Arc<Archiver>,
        factory: Arc<dyn ProviderFactory>,
        config: SyncConfig,
    ) -> Self {
        let rate = NonZeroU32::new(config.provider_rate_per_minute)
            .unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rate)));

        Self {
            db,
            archiver,
            factory,
            config,
            limiter,
        }
    }

    /// Execute a claimed sync job to completion.
    ///
    /// Between pages the job row is re-read; an external cancel stops the
    /// loop at the next page boundary with everything archived so far kept.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn run(&self, job: &Job) -> Result<SyncOutcome> {
        let (source_id, stream_name, mode) = match job.payload()? {
            JobPayload::Sync {
                source_id,
                stream_name,
                mode,
            } => (source_id, stream_name, mode),
            _ => {
                return Err(Error::Validation(format!(
                    "job {} is not a sync job",
                    job.id
                )))
            }
        };

        let source = registry::get_source(&self.db, source_id).await?;
        if !source.is_active {
            return Err(Error::Validation(format!(
                "source {} is disabled",
                source_id
            )));
        }

        let stream = registry::get_stream(&self.db, source_id, &stream_name).await?;
        let provider = self.factory.provider_for(&source)?;

        let mut cursor: Option<String> = match mode {
            SyncMode::FullRefresh => None,
            SyncMode::Incremental => stream.last_sync_token.clone(),
        };

        info!(
            source_id = %source_id,
            stream_name,
            mode = %mode,
            resuming = cursor.is_some(),
            "Sync started"
        );

        let mut outcome = SyncOutcome::default();

        loop {
            if queue::job_status(&self.db, job.id).await? == JobStatus::Cancelled {
                info!(job_id = %job.id, "Sync cancelled, stopping at page boundary");
                outcome.cancelled = true;
                return Ok(outcome);
            }

            self.limiter.until_ready().await;

            let page = match self
                .fetch_page_with_retry(provider.as_ref(), &stream_name, cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    if matches!(e, Error::Provider { .. } | Error::Auth { .. }) {
                        registry::record_source_error(&self.db, source_id, &e.to_string())
                            .await?;
                    }
                    return Err(e);
                }
            };

            outcome.pages_fetched += 1;
            counter!("pipeline_sync_pages_fetched", "provider" => source.provider.clone())
                .increment(1);

            if !page.records.is_empty() {
                self.archiver
                    .flush(
                        Some(job.id),
                        source_id,
                        &source.provider,
                        &stream_name,
                        &page.records,
                    )
                    .await?;

                outcome.objects_written += 1;
                outcome.records_synced += page.records.len() as u64;
            }

            // The page is durable (or empty); advancing the cursor now can
            // no longer lose data.
            if let Some(next) = &page.next_cursor {
                cursor = Some(next.clone());
                registry::update_stream_cursor(&self.db, source_id, &stream_name, Some(next))
                    .await?;
            }

            match next_page_step(&page) {
                PageStep::Continue => {}
                PageStep::Done => {
                    if page.has_more {
                        warn!(
                            stream_name,
                            "Provider reported more data without a cursor, stopping"
                        );
                    }
                    break;
                }
            }
        }

        // Stamp last_sync_at even when the final page carried no cursor;
        // `cursor` holds the newest token seen (or None on a tokenless
        // full refresh) so this never regresses it.
        registry::update_stream_cursor(&self.db, source_id, &stream_name, cursor.as_deref())
            .await?;

        self.chain_transforms(job, source_id, &stream_name).await?;

        counter!("pipeline_sync_records", "provider" => source.provider.clone())
            .increment(outcome.records_synced);

        info!(
            source_id = %source_id,
            stream_name,
            records = outcome.records_synced,
            pages = outcome.pages_fetched,
            "Sync finished"
        );

        Ok(outcome)
    }

    /// Fetch one page, retrying transient failures with backoff. Structural
    /// and auth errors surface immediately.
    async fn fetch_page_with_retry(
        &self,
        provider: &dyn Provider,
        stream_name: &str,
        cursor: Option<&str>,
    ) -> Result<ProviderPage> {
        let timeout = Duration::from_secs(self.config.provider_timeout_secs);

        retry_transient(
            || async {
                tokio::time::timeout(
                    timeout,
                    provider.fetch_page(stream_name, cursor, self.config.page_size),
                )
                .await
                .map_err(|_| Error::Timeout(timeout.as_secs()))
                .and_then(|r| r)
            },
            self.config.max_retries,
            self.config.retry_base_delay_ms,
            "fetch_page",
        )
        .await
    }

    /// Enqueue the transforms registered for this stream, gated on this sync
    /// job succeeding.
    async fn chain_transforms(&self, job: &Job, source_id: uuid::Uuid, stream_name: &str) -> Result<()> {
        for transform_name in transform::transforms_for_stream(stream_name) {
            let mut spec =
                JobSpec::transform(source_id, stream_name, transform_name).depends_on(job.id);
            spec.parent_job_id = Some(job.id);

            let transform_job = queue::enqueue(&self.db, spec).await?;

            info!(
                sync_job_id = %job.id,
                transform_job_id = %transform_job.id,
                transform_name,
                "Chained transform job"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn page(has_more: bool, next_cursor: Option<&str>) -> ProviderPage {
        ProviderPage {
            records: Vec::new(),
            next_cursor: next_cursor.map(Into::into),
            has_more,
        }
    }

    #[test]
    fn last_page_stops() {
        assert_eq!(next_page_step(&page(false, None)), PageStep::Done);
        assert_eq!(next_page_step(&page(false, Some("t"))), PageStep::Done);
    }

    #[test]
    fn continues_with_new_cursor() {
        assert_eq!(next_page_step(&page(true, Some("abc"))), PageStep::Continue);
    }

    #[test]
    fn more_without_cursor_stops() {
        assert_eq!(next_page_step(&page(true, None)), PageStep::Done);
    }
}
