//! Provider boundary: pull-style, paginated record feeds with an opaque
//! incremental cursor the pipeline echoes back but never interprets.

pub mod http;

use async_trait::async_trait;
use pipeline_core::Result;

use crate::model::ProviderPage;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Fetch one page of records for `stream_name`, resuming from `cursor`.
    /// `cursor = None` starts from the beginning (full refresh or first sync).
    async fn fetch_page(
        &self,
        stream_name: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ProviderPage>;

    fn provider_id(&self) -> &str;

    async fn health_check(&self) -> Result<()>;
}

pub use http::HttpProvider;
