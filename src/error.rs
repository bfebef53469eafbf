//! Error types for the upload orchestrator.

use thiserror::Error;

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Main error type for the uploader.
///
/// Only conditions that abort a whole batch surface here. Per-item failures
/// (transport errors, remote `Failure` acknowledgements, unparseable bodies)
/// are resolved by the retry policy and end up as `ItemResult::Failed`.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Not a single item in the batch produced an outcome
    #[error("Unable to get any responses for a batch of {items} item(s)")]
    Systemic { items: usize },

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Reasons a configuration is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing config key: {0}")]
    MissingField(&'static str),

    #[error("siteid must be numeric, got '{0}'")]
    InvalidSiteId(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// The supplied document does not have the expected shape
    #[error("malformed config: {0}")]
    Malformed(String),
}

/// Render an error together with its source chain on a single line.
///
/// Transport errors are flattened this way before they are stored in an
/// item result, so the caller sees the root cause (DNS, TLS, timeout...).
pub fn render_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
