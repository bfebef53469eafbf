//! HTTP client abstraction for sending upload requests.
//!
//! This module defines the `HttpClient` trait the dispatcher sends through,
//! enabling testability with mock implementations.

use crate::config::Environment;
use crate::error::Result;
use crate::request::UploadRequest;
use async_trait::async_trait;
use std::time::Duration;

/// Response from an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

/// Trait for executing upload requests.
///
/// This abstraction allows for different implementations (production vs. testing)
/// and makes the dispatch logic testable without making real HTTP calls.
///
/// # Example
/// ```ignore
/// let client = ReqwestHttpClient::new(Environment::Sandbox);
/// let response = client.execute(&request, Duration::from_secs(60)).await?;
/// println!("Status: {}, Body: {}", response.status, response.body);
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync + Clone {
    /// Send a request and buffer the whole response.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The request fails due to network issues
    /// - The request times out
    /// - The URL or a header value is invalid
    async fn execute(&self, request: &UploadRequest, timeout: Duration) -> Result<HttpResponse>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestHttpClient {
    /// Create a client targeting the live or sandbox API.
    pub fn new(environment: Environment) -> Self {
        Self::with_client(reqwest::Client::new(), environment.base_url())
    }

    /// Use a preconfigured reqwest client (proxies, TLS roots, pooling) and
    /// an arbitrary base URL.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn form(request: &UploadRequest) -> reqwest::multipart::Form {
        request
            .parts
            .iter()
            .fold(reqwest::multipart::Form::new(), |form, part| {
                let length = part.data.len() as u64;
                let mut body =
                    reqwest::multipart::Part::stream_with_length(part.data.clone(), length);
                if let Some(file_name) = &part.file_name {
                    body = body.file_name(file_name.clone());
                }
                form.part(part.name.clone(), body)
            })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(item_key = %request.key, method = %request.method))]
    async fn execute(&self, request: &UploadRequest, timeout: Duration) -> Result<HttpResponse> {
        let url = format!("{}{}", self.base_url, request.path);

        tracing::debug!(
            url = %url,
            timeout_ms = timeout.as_millis() as u64,
            "Executing HTTP request"
        );

        let method: reqwest::Method = request.method.parse().map_err(|e| {
            tracing::error!(method = %request.method, error = %e, "Invalid HTTP method");
            anyhow::anyhow!("Invalid HTTP method '{}': {}", request.method, e)
        })?;

        let mut req = self.client.request(method, &url).timeout(timeout);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req = req.multipart(Self::form(request));

        let response = req.send().await.map_err(|e| {
            tracing::error!(
                item_key = %request.key,
                url = %url,
                error = %e,
                "HTTP request failed"
            );
            e
        })?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::info!(
            item_key = %request.key,
            status = status,
            response_len = body.len(),
            "HTTP request completed"
        );

        Ok(HttpResponse { status, body })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

use crate::batch::ItemKey;

type FallbackFn = Arc<dyn Fn(&UploadRequest) -> Result<HttpResponse> + Send + Sync>;

/// Mock HTTP client for testing.
///
/// Responses are scripted per item key and consumed in FIFO order, so tests
/// can describe exactly what each attempt for each item sees.
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response(
///     "7",
///     Ok(HttpResponse { status: 200, body: success_document("7") }),
/// );
/// ```
#[derive(Clone)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<ItemKey, Vec<MockResponse>>>>,
    fallback: Arc<Mutex<Option<FallbackFn>>>,
    latency: Arc<Mutex<Duration>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally wait for a trigger before completing.
enum MockResponse {
    /// Immediate response
    Immediate(Result<HttpResponse>),
    /// Response that waits for a trigger signal before completing
    Triggered {
        response: Result<HttpResponse>,
        trigger: oneshot::Receiver<()>,
    },
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub key: ItemKey,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub xml_payload: String,
    pub image_len: usize,
    pub timeout: Duration,
}

impl MockHttpClient {
    /// Create a new mock HTTP client.
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            fallback: Arc::new(Mutex::new(None)),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add a predetermined response for an item key.
    ///
    /// Multiple responses can be added for the same key - they will be
    /// returned in FIFO order, one per attempt.
    pub fn add_response(&self, key: impl Into<ItemKey>, response: Result<HttpResponse>) {
        self.responses
            .lock()
            .entry(key.into())
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Add a response that will wait for a manual trigger before completing.
    ///
    /// Returns a sender that when triggered (by sending `()` or dropping) will
    /// cause the HTTP request to complete with the given response.
    pub fn add_response_with_trigger(
        &self,
        key: impl Into<ItemKey>,
        response: Result<HttpResponse>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(key.into())
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    /// Answer every request that has no scripted response left.
    pub fn set_fallback<F>(&self, fallback: F)
    where
        F: Fn(&UploadRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        *self.fallback.lock() = Some(Arc::new(fallback));
    }

    /// Delay every response by `latency`, so concurrent sends overlap.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls made for one item key.
    pub fn call_count_for(&self, key: impl Into<ItemKey>) -> usize {
        let key = key.into();
        self.calls.lock().iter().filter(|c| c.key == key).count()
    }

    /// Get the number of requests currently in-flight (executing).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of requests that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &UploadRequest, timeout: Duration) -> Result<HttpResponse> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        // Guard to ensure we decrement even if cancelled/panicked
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let xml_payload = request
            .part(crate::request::XML_PART_NAME)
            .map(|p| String::from_utf8_lossy(&p.data).into_owned())
            .unwrap_or_default();
        let image_len = request
            .part(crate::request::IMAGE_PART_NAME)
            .map(|p| p.data.len())
            .unwrap_or_default();

        self.calls.lock().push(MockCall {
            key: request.key.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            headers: request.headers.clone(),
            xml_payload,
            image_len,
            timeout,
        });

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mock_response = {
            let mut responses = self.responses.lock();
            responses
                .get_mut(&request.key)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        match mock_response {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                // Wait for trigger (ignore the result - we proceed either way)
                let _ = trigger.await;
                response
            }
            None => {
                let fallback = self.fallback.lock().clone();
                match fallback {
                    Some(fallback) => fallback(request),
                    None => Err(crate::error::VolleyError::Other(anyhow::anyhow!(
                        "No mock response configured for item {}",
                        request.key
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::build_request;
    use bytes::Bytes;

    fn request(key: &str) -> UploadRequest {
        let config = crate::config::UploaderConfig::from_json(serde_json::json!({
            "app-name": "app",
            "cert-name": "cert",
            "dev-name": "dev",
            "siteid": "0",
            "auth-token": "token",
        }))
        .unwrap();
        build_request(&ItemKey::from(key), Bytes::from_static(b"image"), &config)
    }

    #[tokio::test]
    async fn test_mock_client_basic() {
        let mock = MockHttpClient::new();
        mock.add_response(
            "1",
            Ok(HttpResponse {
                status: 200,
                body: "success".to_string(),
            }),
        );

        let response = mock
            .execute(&request("1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "success");

        let calls = mock.get_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].key, ItemKey::from("1"));
        assert_eq!(calls[0].method, "POST");
        assert_eq!(calls[0].path, "/ws/api.dll");
        assert_eq!(calls[0].image_len, 5);
        assert!(calls[0].xml_payload.contains("<MessageID>1</MessageID>"));
        assert_eq!(calls[0].timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_mock_client_responses_are_per_key_fifo() {
        let mock = MockHttpClient::new();
        for body in ["first", "second"] {
            mock.add_response(
                "a",
                Ok(HttpResponse {
                    status: 200,
                    body: body.to_string(),
                }),
            );
        }
        mock.add_response(
            "b",
            Ok(HttpResponse {
                status: 200,
                body: "other".to_string(),
            }),
        );

        let timeout = Duration::from_secs(1);
        assert_eq!(mock.execute(&request("b"), timeout).await.unwrap().body, "other");
        assert_eq!(mock.execute(&request("a"), timeout).await.unwrap().body, "first");
        assert_eq!(mock.execute(&request("a"), timeout).await.unwrap().body, "second");
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.call_count_for("a"), 2);
    }

    #[tokio::test]
    async fn test_mock_client_no_response() {
        let mock = MockHttpClient::new();
        let result = mock.execute(&request("x"), Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_client_fallback() {
        let mock = MockHttpClient::new();
        mock.set_fallback(|request| {
            Ok(HttpResponse {
                status: 200,
                body: format!("fallback {}", request.key),
            })
        });
        let response = mock.execute(&request("9"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.body, "fallback 9");
    }

    #[tokio::test]
    async fn test_mock_client_with_trigger() {
        let mock = MockHttpClient::new();

        let trigger = mock.add_response_with_trigger(
            "1",
            Ok(HttpResponse {
                status: 200,
                body: "triggered".to_string(),
            }),
        );

        // Spawn the request execution (it will block waiting for trigger)
        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move {
            mock_clone
                .execute(&request("1"), Duration::from_secs(5))
                .await
        });

        // Give it a moment to start executing
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.body, "triggered");
        assert_eq!(mock.in_flight_count(), 0);
        assert_eq!(mock.peak_in_flight(), 1);
    }

    #[test]
    fn test_reqwest_client_base_url() {
        let client = ReqwestHttpClient::new(Environment::Sandbox);
        assert_eq!(client.base_url(), "https://api.sandbox.ebay.com");

        let client = ReqwestHttpClient::with_client(reqwest::Client::new(), "http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
