//! HTTP fetchers for upstream JSON sources.
//!
//! Each configured job polls one URL; the broadcaster may also fall back to
//! a topic source for topics nobody prefetches. Fetchers never retry on their
//! own, the scheduler owns retries.

use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use quoteflow_core::{JobDefinition, TopicSpec};
use reqwest::{Client, header};
use serde_json::Value;

use crate::config::JobConfig;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Shared HTTP client for all upstream fetches.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self { client })
    }

    /// GET `url` and parse the body as JSON.
    pub async fn fetch_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Value, UpstreamError> {
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                url,
                status = status.as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Upstream fetch failed with HTTP error"
            );
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value = response.json::<Value>().await?;
        tracing::debug!(
            url,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Upstream fetch succeeded"
        );
        Ok(value)
    }

    /// Build the refresh job for one configured upstream.
    pub fn job_definition(&self, job: &JobConfig) -> JobDefinition {
        let client = self.clone();
        let url = job.url.clone();
        let definition = JobDefinition::json(job.name.clone(), job.interval(), move || {
            let client = client.clone();
            let url = url.clone();
            async move { Ok::<_, anyhow::Error>(client.fetch_json(&url, &[]).await?) }
        });
        job.configure(definition)
    }

    /// Fetcher resolving a topic as `{base_url}/{topic}?symbols=A,B`.
    pub fn topic_fetcher(
        &self,
        base_url: &str,
    ) -> impl Fn(TopicSpec) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static {
        let client = self.clone();
        let base_url = base_url.trim_end_matches('/').to_string();
        move |spec: TopicSpec| -> BoxFuture<'static, anyhow::Result<Value>> {
            let client = client.clone();
            let url = format!("{base_url}/{}", spec.topic);
            Box::pin(async move {
                let query = if spec.symbols.is_empty() {
                    Vec::new()
                } else {
                    vec![("symbols", spec.symbols.join(","))]
                };
                Ok::<_, anyhow::Error>(client.fetch_json(&url, &query).await?)
            })
        }
    }
}
