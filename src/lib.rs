//! Bulk upload of images to a site-hosted picture service.
//!
//! A caller hands over a [`Batch`] of images keyed by arbitrary [`ItemKey`]s.
//! Each image becomes one multipart `UploadSiteHostedPictures` request; the
//! requests are executed under a concurrency bound (or sequentially), retried
//! per item according to a [`RetryPolicy`], classified, and reduced into a
//! single [`BatchResult`] that holds exactly one entry per input key.
//!
//! Per-item failures never abort the batch. Only an invalid configuration or
//! a batch in which no item produced any outcome at all is reported as an
//! error.

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod request;
pub mod response;
pub mod retry;
pub mod uploader;

// Re-export commonly used types
pub use aggregate::{
    AggregateOptions, BatchResult, FailedUpload, ItemResult, UploadError, UploadedPicture,
    aggregate,
};
pub use batch::{Batch, ItemKey};
pub use config::{Environment, RawConfig, UploaderConfig};
pub use dispatch::{AttemptOutcome, DispatchMode, DispatchOutcomes, Dispatcher};
pub use error::{ConfigError, Result, VolleyError};
pub use http::{HttpClient, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use request::{UploadRequest, build_request};
pub use response::{ApiMessage, Classification, PictureDetails, classify};
pub use retry::{RetryDecision, RetryPolicy, WaitStrategy};
pub use uploader::Uploader;
