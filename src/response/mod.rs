//! Response classification.
//!
//! Every completed attempt, whether the transport answered or not, is mapped
//! onto a small taxonomy that the retry policy and the aggregator work with:
//!
//! | Condition                                   | Classification     |
//! |---------------------------------------------|--------------------|
//! | transport error, timeout, non-2xx status    | `TransportError`   |
//! | body is not a decodable response document   | `Unparseable`      |
//! | document without `Ack`                      | `Unparseable`      |
//! | `Ack` = `Success`                           | `Success`          |
//! | `Ack` = `Warning`                           | `Warning`          |
//! | `Ack` = `Failure`                           | `Failure`          |
//! | any other `Ack`                             | `Unparseable`      |

pub mod schema;

pub use schema::{ApiMessage, PictureDetails, PictureSetMember, ResponseEnvelope};

use crate::error::{Result, render_error_chain};
use crate::http::HttpResponse;

/// Longest body excerpt kept in transport error messages.
const BODY_EXCERPT_LEN: usize = 512;

/// Classification of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success(PictureDetails),
    Warning(PictureDetails, Vec<ApiMessage>),
    Failure(Vec<ApiMessage>),
    TransportError(String),
    Unparseable { reason: String, body: String },
}

impl Classification {
    /// Success and Warning both end the retry loop.
    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self,
            Classification::Success(_) | Classification::Warning(_, _)
        )
    }

    /// Short label used for logs and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Success(_) => "success",
            Classification::Warning(_, _) => "warning",
            Classification::Failure(_) => "failure",
            Classification::TransportError(_) => "transport_error",
            Classification::Unparseable { .. } => "unparseable",
        }
    }
}

fn excerpt(body: &str) -> &str {
    if body.len() <= BODY_EXCERPT_LEN {
        return body;
    }
    let mut end = BODY_EXCERPT_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Classify the result of one send.
pub fn classify(result: Result<HttpResponse>) -> Classification {
    let response = match result {
        Ok(response) => response,
        Err(e) => return Classification::TransportError(render_error_chain(&e)),
    };

    if !(200..300).contains(&response.status) {
        return Classification::TransportError(format!(
            "HTTP status {}: {}",
            response.status,
            excerpt(&response.body)
        ));
    }

    let envelope = match schema::decode(&response.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Classification::Unparseable {
                reason: format!("unable to read response document: {e}"),
                body: response.body,
            };
        }
    };

    let Some(ack) = envelope.ack.as_deref().map(str::trim) else {
        return Classification::Unparseable {
            reason: "response document has no Ack".to_string(),
            body: response.body,
        };
    };

    match ack {
        "Success" | "Warning" => {
            let is_warning = ack == "Warning";
            let Some(details) = envelope.picture_details else {
                return Classification::Unparseable {
                    reason: format!("{ack} acknowledgement without SiteHostedPictureDetails"),
                    body: response.body,
                };
            };
            if is_warning {
                Classification::Warning(details, envelope.errors)
            } else {
                Classification::Success(details)
            }
        }
        "Failure" => Classification::Failure(envelope.errors),
        other => {
            tracing::error!(
                ack = %other,
                version = ?envelope.version,
                "Unrecognized acknowledgement value, the remote API contract may have changed"
            );
            Classification::Unparseable {
                reason: format!("unrecognized acknowledgement '{other}'"),
                body: response.body,
            }
        }
    }
}
