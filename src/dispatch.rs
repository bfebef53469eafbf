//! Dispatcher: executes upload requests under a concurrency bound with
//! per-item retries.
//!
//! Two disciplines share the same per-item attempt loop:
//!
//! - **Concurrent**: every item runs as its own task, and each attempt holds
//!   a permit from a shared semaphore for the duration of the send. A finished
//!   send frees its permit straight away for the next waiting item, and a
//!   retried item queues for a permit again once its wait has elapsed.
//! - **Sequential**: items are processed one after the other in batch order,
//!   each running its full retry loop before the next starts. Each item still
//!   runs in its own task so a dying item cannot take the batch with it.
//!
//! Completed attempts are reported as `(key, outcome)` pairs over a channel,
//! so correlation never depends on completion order or on response contents.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use indexmap::IndexMap;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::batch::{Batch, ItemKey};
use crate::config::UploaderConfig;
use crate::error::{Result, VolleyError};
use crate::http::HttpClient;
use crate::request::build_request;
use crate::response::{Classification, classify};
use crate::retry::RetryPolicy;

/// Execution discipline for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Concurrent,
    Sequential,
}

/// Final classification of an item together with the attempt it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub classification: Classification,
    /// 1-based number of the attempt that produced `classification`
    pub attempt: u32,
}

/// One entry per batch key, in batch order. `None` means the item never
/// reported an outcome (its task died).
pub type DispatchOutcomes = IndexMap<ItemKey, Option<AttemptOutcome>>;

/// Everything an item task needs, shared between all tasks of a batch.
struct ItemContext<H> {
    http_client: Arc<H>,
    config: Arc<UploaderConfig>,
    policy: RetryPolicy,
}

pub struct Dispatcher<H>
where
    H: HttpClient,
{
    http_client: Arc<H>,
    config: Arc<UploaderConfig>,
    policy: RetryPolicy,
    mode: DispatchMode,
    concurrency: usize,
}

impl<H> Dispatcher<H>
where
    H: HttpClient + 'static,
{
    /// Create a dispatcher using the mode, concurrency and retry settings of
    /// `config`.
    pub fn new(http_client: Arc<H>, config: Arc<UploaderConfig>) -> Self {
        Self {
            policy: config.retry_policy(),
            mode: config.mode(),
            concurrency: config.concurrency(),
            http_client,
            config,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Upload every item of `batch` and return one outcome slot per key.
    ///
    /// # Errors
    /// Returns [`VolleyError::Systemic`] if the batch is non-empty and not a
    /// single item produced an outcome.
    #[tracing::instrument(skip_all, fields(items = batch.len(), mode = ?self.mode, concurrency = self.concurrency))]
    pub async fn dispatch(&self, batch: Batch) -> Result<DispatchOutcomes> {
        let total = batch.len();
        let mut outcomes: DispatchOutcomes = batch.keys().map(|k| (k.clone(), None)).collect();

        let ctx = Arc::new(ItemContext {
            http_client: self.http_client.clone(),
            config: self.config.clone(),
            policy: self.policy,
        });

        match self.mode {
            DispatchMode::Sequential => {
                for (key, image) in batch {
                    let ctx = ctx.clone();
                    let item_key = key.clone();
                    let span = tracing::info_span!("upload_item", item_key = %key);
                    let handle = tokio::spawn(
                        async move { run_item(&item_key, image, &ctx, None).await }.instrument(span),
                    );
                    match handle.await {
                        Ok(outcome) => record(&mut outcomes, key, outcome),
                        Err(join_error) => {
                            tracing::error!(item_key = %key, error = %join_error, "Upload task panicked");
                        }
                    }
                }
            }
            DispatchMode::Concurrent => {
                let slots = Arc::new(Semaphore::new(self.concurrency));
                let (tx, mut rx) = mpsc::unbounded_channel::<(ItemKey, AttemptOutcome)>();
                let mut join_set: JoinSet<()> = JoinSet::new();

                for (key, image) in batch {
                    let ctx = ctx.clone();
                    let slots = slots.clone();
                    let tx = tx.clone();
                    let span = tracing::info_span!("upload_item", item_key = %key);
                    join_set.spawn(
                        async move {
                            let outcome = run_item(&key, image, &ctx, Some(slots.as_ref())).await;
                            // Receiver lives until every sender is gone
                            let _ = tx.send((key, outcome));
                        }
                        .instrument(span),
                    );
                }
                drop(tx);

                while let Some((key, outcome)) = rx.recv().await {
                    record(&mut outcomes, key, outcome);
                }

                while let Some(result) = join_set.join_next().await {
                    if let Err(join_error) = result {
                        tracing::error!(error = %join_error, "Upload task panicked");
                    }
                }
            }
        }

        let reported = outcomes.values().filter(|o| o.is_some()).count();
        if total > 0 && reported == 0 {
            tracing::error!(items = total, "No item produced any outcome");
            return Err(VolleyError::Systemic { items: total });
        }

        tracing::debug!(items = total, reported, "Dispatch finished");
        Ok(outcomes)
    }
}

fn record(outcomes: &mut DispatchOutcomes, key: ItemKey, outcome: AttemptOutcome) {
    match outcomes.get_mut(&key) {
        Some(slot) if slot.is_none() => *slot = Some(outcome),
        Some(_) => {
            tracing::error!(item_key = %key, "Duplicate outcome for item, keeping the first one");
        }
        None => {
            tracing::error!(item_key = %key, "Outcome for a key that is not part of the batch");
        }
    }
}

/// Run the attempt loop for one item until it succeeds or runs out of
/// attempts. Attempts for the same item never overlap.
async fn run_item<H: HttpClient>(
    key: &ItemKey,
    image: Bytes,
    ctx: &ItemContext<H>,
    slots: Option<&Semaphore>,
) -> AttemptOutcome {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let classification = match slots {
            Some(slots) => {
                let Ok(_permit) = slots.acquire().await else {
                    return AttemptOutcome {
                        classification: Classification::TransportError(
                            "dispatcher concurrency pool closed".to_string(),
                        ),
                        attempt,
                    };
                };
                send_once(key, image.clone(), ctx, attempt).await
            }
            None => send_once(key, image.clone(), ctx, attempt).await,
        };

        let decision = ctx.policy.should_retry(&classification, attempt);
        if !decision.retry {
            if !classification.is_terminal_success() {
                tracing::warn!(
                    item_key = %key,
                    attempt,
                    classification = classification.label(),
                    "Upload failed permanently (no attempts remaining)"
                );
            }
            return AttemptOutcome {
                classification,
                attempt,
            };
        }

        tracing::warn!(
            item_key = %key,
            attempt,
            classification = classification.label(),
            wait_ms = decision.wait_before.as_millis() as u64,
            "Upload attempt failed, retrying"
        );
        if !decision.wait_before.is_zero() {
            tokio::time::sleep(decision.wait_before).await;
        }
    }
}

async fn send_once<H: HttpClient>(
    key: &ItemKey,
    image: Bytes,
    ctx: &ItemContext<H>,
    attempt: u32,
) -> Classification {
    let request = build_request(key, image, &ctx.config);
    let timeout = ctx.config.timeout();
    let started = Instant::now();

    tracing::debug!(item_key = %key, attempt, "Sending upload request");

    let result = match tokio::time::timeout(timeout, ctx.http_client.execute(&request, timeout))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(VolleyError::Other(anyhow::anyhow!(
            "request timed out after {}",
            format_duration(timeout)
        ))),
    };

    histogram!("volley_upload_duration_seconds").record(started.elapsed().as_secs_f64());

    let classification = classify(result);
    counter!(
        "volley_upload_attempts_total",
        "classification" => classification.label()
    )
    .increment(1);

    match &classification {
        Classification::Success(details) | Classification::Warning(details, _) => {
            if details.picture_name.as_deref() != Some(key.as_str()) {
                tracing::warn!(
                    item_key = %key,
                    picture_name = ?details.picture_name,
                    "Echoed picture name does not match the item key"
                );
            }
            tracing::info!(item_key = %key, attempt, ack = classification.label(), "Picture uploaded");
        }
        Classification::Unparseable { reason, body } if ctx.config.debug() => {
            tracing::debug!(item_key = %key, attempt, reason = %reason, body = %body, "Raw unparseable response");
        }
        _ => {}
    }

    classification
}

fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, MockHttpClient};
    use crate::retry::WaitStrategy;
    use serde_json::json;

    fn config(extra: serde_json::Value) -> Arc<UploaderConfig> {
        let mut value = json!({
            "app-name": "app",
            "cert-name": "cert",
            "dev-name": "dev",
            "siteid": "0",
            "auth-token": "token",
            "max-retry": 3,
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        Arc::new(UploaderConfig::from_json(value).unwrap())
    }

    fn success(key: &str) -> crate::error::Result<HttpResponse> {
        Ok(HttpResponse {
            status: 200,
            body: format!(
                "<UploadSiteHostedPicturesResponse><Ack>Success</Ack><SiteHostedPictureDetails><PictureName>{key}</PictureName><FullURL>https://i.example/{key}.jpg</FullURL></SiteHostedPictureDetails></UploadSiteHostedPicturesResponse>"
            ),
        })
    }

    fn refused() -> crate::error::Result<HttpResponse> {
        Err(VolleyError::Other(anyhow::anyhow!("connection refused")))
    }

    fn batch(keys: &[&str]) -> Batch {
        keys.iter()
            .map(|k| (k.to_string(), Bytes::from_static(b"img")))
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn test_every_key_gets_exactly_one_outcome() {
        let http = Arc::new(MockHttpClient::new());
        for key in ["1", "5", "8"] {
            http.add_response(key, success(key));
        }

        let dispatcher = Dispatcher::new(http.clone(), config(json!({})));
        let outcomes = dispatcher.dispatch(batch(&["1", "5", "8"])).await.unwrap();

        let keys: Vec<_> = outcomes.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["1", "5", "8"]);
        for (key, outcome) in &outcomes {
            let outcome = outcome.as_ref().unwrap();
            assert_eq!(outcome.attempt, 1);
            match &outcome.classification {
                Classification::Success(details) => {
                    assert_eq!(details.picture_name.as_deref(), Some(key.as_str()))
                }
                other => panic!("expected success, got {other:?}"),
            }
        }
        assert_eq!(http.call_count(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_retries_until_success() {
        let http = Arc::new(MockHttpClient::new());
        http.add_response("0", refused());
        http.add_response("0", refused());
        http.add_response("0", success("0"));

        let dispatcher = Dispatcher::new(http.clone(), config(json!({})));
        let outcomes = dispatcher.dispatch(batch(&["0"])).await.unwrap();

        let outcome = outcomes[&ItemKey::from("0")].clone().unwrap();
        assert_eq!(outcome.attempt, 3);
        assert!(outcome.classification.is_terminal_success());
        assert_eq!(http.call_count_for("0"), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_attempts_never_exceed_max() {
        let http = Arc::new(MockHttpClient::new());
        http.set_fallback(|_| refused());

        let dispatcher = Dispatcher::new(http.clone(), config(json!({ "max-retry": 4 })));
        let outcomes = dispatcher.dispatch(batch(&["a", "b"])).await.unwrap();

        for outcome in outcomes.values() {
            let outcome = outcome.as_ref().unwrap();
            assert_eq!(outcome.attempt, 4);
            assert_eq!(outcome.classification.label(), "transport_error");
        }
        assert_eq!(http.call_count_for("a"), 4);
        assert_eq!(http.call_count_for("b"), 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_no_retry_policy_sends_once() {
        let http = Arc::new(MockHttpClient::new());
        http.set_fallback(|_| refused());

        let dispatcher =
            Dispatcher::new(http.clone(), config(json!({}))).with_policy(RetryPolicy::no_retry());
        let outcomes = dispatcher.dispatch(batch(&["a"])).await.unwrap();

        assert_eq!(outcomes[&ItemKey::from("a")].as_ref().unwrap().attempt, 1);
        assert_eq!(http.call_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrency_bound_respected_and_saturated() {
        let http = Arc::new(MockHttpClient::new());
        http.set_latency(Duration::from_millis(20));
        http.set_fallback(|request| success(request.key.as_str()));

        let keys: Vec<String> = (0..12).map(|i| i.to_string()).collect();
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();

        let dispatcher = Dispatcher::new(http.clone(), config(json!({}))).with_concurrency(3);
        let outcomes = dispatcher.dispatch(batch(&keys)).await.unwrap();

        assert_eq!(outcomes.len(), 12);
        assert!(outcomes.values().all(|o| o.is_some()));
        assert_eq!(http.peak_in_flight(), 3);
        assert_eq!(http.in_flight_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_freed_slot_goes_to_next_item_without_waiting_for_wave() {
        let http = Arc::new(MockHttpClient::new());
        // Item "slow" blocks until triggered; the other items must still flow
        // through the second slot.
        let trigger = http.add_response_with_trigger("slow", success("slow"));
        for key in ["a", "b", "c"] {
            http.add_response(key, success(key));
        }

        let dispatcher = Arc::new(Dispatcher::new(http.clone(), config(json!({}))).with_concurrency(2));
        let handle = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(batch(&["slow", "a", "b", "c"])).await })
        };

        let start = tokio::time::Instant::now();
        while http.call_count() < 4 && start.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(http.call_count(), 4, "all fast items should run while 'slow' is in flight");
        assert!(!handle.is_finished());

        trigger.send(()).unwrap();
        let outcomes = handle.await.unwrap().unwrap();
        assert!(outcomes.values().all(|o| o.as_ref().unwrap().classification.is_terminal_success()));
    }

    #[test_log::test(tokio::test)]
    async fn test_sequential_mode_runs_one_item_at_a_time_in_order() {
        let http = Arc::new(MockHttpClient::new());
        http.set_latency(Duration::from_millis(5));
        http.add_response("2", refused());
        http.set_fallback(|request| success(request.key.as_str()));

        let dispatcher = Dispatcher::new(http.clone(), config(json!({ "mode": "sequential" })));
        let outcomes = dispatcher.dispatch(batch(&["3", "2", "1"])).await.unwrap();

        assert_eq!(http.peak_in_flight(), 1);
        let order: Vec<_> = http.get_calls().iter().map(|c| c.key.to_string()).collect();
        assert_eq!(order, vec!["3", "2", "2", "1"]);
        assert_eq!(outcomes[&ItemKey::from("2")].as_ref().unwrap().attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_send_is_retried_as_transport_error() {
        let http = Arc::new(MockHttpClient::new());
        // Never triggered: the first attempt can only end by timing out
        let _trigger = http.add_response_with_trigger("0", success("0"));
        http.add_response("0", success("0"));

        let dispatcher = Dispatcher::new(http.clone(), config(json!({ "timeout": 1 })));
        let outcomes = dispatcher.dispatch(batch(&["0"])).await.unwrap();

        let outcome = outcomes[&ItemKey::from("0")].clone().unwrap();
        assert_eq!(outcome.attempt, 2);
        assert!(outcome.classification.is_terminal_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_applied_between_attempts_only() {
        let http = Arc::new(MockHttpClient::new());
        http.add_response("0", refused());
        http.add_response("0", success("0"));

        let dispatcher = Dispatcher::new(http.clone(), config(json!({})))
            .with_policy(RetryPolicy::new(2, WaitStrategy::Fixed(Duration::from_secs(30))));

        let start = tokio::time::Instant::now();
        let outcomes = dispatcher.dispatch(batch(&["0"])).await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30), "waited only {elapsed:?}");
        assert!(elapsed < Duration::from_secs(31), "waited {elapsed:?}");
        assert_eq!(outcomes[&ItemKey::from("0")].as_ref().unwrap().attempt, 2);
    }

    #[derive(Clone)]
    struct PanickingClient;

    #[async_trait::async_trait]
    impl HttpClient for PanickingClient {
        async fn execute(
            &self,
            _request: &crate::request::UploadRequest,
            _timeout: Duration,
        ) -> crate::error::Result<HttpResponse> {
            panic!("transport blew up");
        }
    }

    #[tokio::test]
    async fn test_zero_outcomes_is_systemic_failure() {
        let dispatcher = Dispatcher::new(Arc::new(PanickingClient), config(json!({})));
        let err = dispatcher.dispatch(batch(&["a", "b"])).await.unwrap_err();
        assert!(matches!(err, VolleyError::Systemic { items: 2 }));
    }

    #[tokio::test]
    async fn test_zero_outcomes_is_systemic_failure_in_sequential_mode() {
        let dispatcher = Dispatcher::new(
            Arc::new(PanickingClient),
            config(json!({ "mode": "sequential" })),
        );
        let err = dispatcher.dispatch(batch(&["a", "b"])).await.unwrap_err();
        assert!(matches!(err, VolleyError::Systemic { items: 2 }));
    }

    /// Panics for one key and delegates every other key to the mock.
    #[derive(Clone)]
    struct PanicsForKey {
        key: &'static str,
        inner: MockHttpClient,
    }

    #[async_trait::async_trait]
    impl HttpClient for PanicsForKey {
        async fn execute(
            &self,
            request: &crate::request::UploadRequest,
            timeout: Duration,
        ) -> crate::error::Result<HttpResponse> {
            if request.key.as_str() == self.key {
                panic!("transport blew up for {}", self.key);
            }
            self.inner.execute(request, timeout).await
        }
    }

    #[tokio::test]
    async fn test_dead_item_does_not_lose_other_outcomes() {
        for mode in ["sequential", "concurrent"] {
            let inner = MockHttpClient::new();
            inner.set_fallback(|request| success(request.key.as_str()));
            let http = Arc::new(PanicsForKey { key: "2", inner });

            let dispatcher = Dispatcher::new(http, config(json!({ "mode": mode })));
            let outcomes = dispatcher.dispatch(batch(&["1", "2", "3"])).await.unwrap();

            assert_eq!(outcomes.len(), 3, "{mode}");
            assert!(outcomes[&ItemKey::from("2")].is_none(), "{mode}");
            for key in ["1", "3"] {
                let outcome = outcomes[&ItemKey::from(key)].as_ref().unwrap();
                assert!(outcome.classification.is_terminal_success(), "{mode}: {key}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_wait_from_config_bounds_retry_delay() {
        let http = Arc::new(MockHttpClient::new());
        let keys: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        for key in &keys {
            http.add_response(key.as_str(), refused());
            http.add_response(key.as_str(), success(key));
        }
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();

        let dispatcher = Dispatcher::new(http.clone(), config(json!({ "random-wait": 5 })));
        let start = tokio::time::Instant::now();
        let outcomes = dispatcher.dispatch(batch(&keys)).await.unwrap();
        let elapsed = start.elapsed();

        // Twenty independent draws from 0..=5s: at least one is non-zero
        assert!(elapsed > Duration::ZERO, "no wait applied");
        assert!(elapsed <= Duration::from_secs(5), "waited {elapsed:?}");
        for outcome in outcomes.values() {
            let outcome = outcome.as_ref().unwrap();
            assert_eq!(outcome.attempt, 2);
            assert!(outcome.classification.is_terminal_success());
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_debug_flag_logs_unparseable_body() {
        let http = Arc::new(MockHttpClient::new());
        http.add_response(
            "0",
            Ok(HttpResponse {
                status: 200,
                body: "<html>maintenance</html>".to_string(),
            }),
        );

        let dispatcher =
            Dispatcher::new(http.clone(), config(json!({ "debug": true, "max-retry": 1 })));
        let outcomes = dispatcher.dispatch(batch(&["0"])).await.unwrap();

        let outcome = outcomes[&ItemKey::from("0")].as_ref().unwrap();
        assert_eq!(outcome.classification.label(), "unparseable");
        assert_eq!(http.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_systemic() {
        let dispatcher = Dispatcher::new(Arc::new(MockHttpClient::new()), config(json!({})));
        let outcomes = dispatcher.dispatch(Batch::new()).await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(60)), "60s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }
}
