//! Top-level entry point chaining dispatch and aggregation.

use std::sync::Arc;
use std::time::Instant;

use crate::aggregate::{AggregateOptions, BatchResult, aggregate};
use crate::batch::Batch;
use crate::config::{Environment, UploaderConfig};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::http::{HttpClient, ReqwestHttpClient};

/// Uploads batches of images with one validated configuration.
///
/// # Example
/// ```ignore
/// let config = UploaderConfig::from_json(serde_json::json!({
///     "app-name": "app", "cert-name": "cert", "dev-name": "dev",
///     "siteid": "77", "auth-token": token,
/// }))?;
/// let uploader = Uploader::connect(config, Environment::Live);
/// let result = uploader.upload(batch).await?;
/// if !result.global_state {
///     for (key, failed) in result.failed() {
///         eprintln!("{key}: {} after {} attempt(s)", failed.error, failed.attempts_made);
///     }
/// }
/// ```
pub struct Uploader<H = ReqwestHttpClient>
where
    H: HttpClient,
{
    config: Arc<UploaderConfig>,
    http_client: Arc<H>,
}

impl Uploader<ReqwestHttpClient> {
    /// Create an uploader talking to the live or sandbox API over reqwest.
    pub fn connect(config: UploaderConfig, environment: Environment) -> Self {
        Self::new(config, Arc::new(ReqwestHttpClient::new(environment)))
    }
}

impl<H> Uploader<H>
where
    H: HttpClient + 'static,
{
    pub fn new(config: UploaderConfig, http_client: Arc<H>) -> Self {
        Self {
            config: Arc::new(config),
            http_client,
        }
    }

    /// Swap the transport, keeping the configuration.
    pub fn with_client<C: HttpClient + 'static>(self, http_client: Arc<C>) -> Uploader<C> {
        Uploader {
            config: self.config,
            http_client,
        }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Upload every image of `batch`.
    ///
    /// Per-item problems never fail the call; they show up as failed items
    /// and a `false` global state.
    ///
    /// # Errors
    /// Returns [`crate::VolleyError::Systemic`] if the batch is non-empty and
    /// no item produced any outcome.
    #[tracing::instrument(skip_all, fields(items = batch.len()))]
    pub async fn upload(&self, batch: Batch) -> Result<BatchResult> {
        let started = Instant::now();
        let dispatcher = Dispatcher::new(self.http_client.clone(), self.config.clone());
        let outcomes = dispatcher.dispatch(batch).await?;
        let result = aggregate(outcomes, &AggregateOptions::from(self.config.as_ref()));

        let failed = result.failed().count();
        tracing::info!(
            items = result.items.len(),
            uploaded = result.items.len() - failed,
            failed,
            global_state = result.global_state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch upload finished"
        );

        Ok(result)
    }
}
