//! Aggregation of per-item outcomes into the final batch result.

use std::collections::HashSet;

use indexmap::IndexMap;
use metrics::counter;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::batch::ItemKey;
use crate::config::UploaderConfig;
use crate::dispatch::{AttemptOutcome, DispatchOutcomes};
use crate::response::{ApiMessage, Classification, PictureDetails};

/// Why an item could not be uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadError {
    /// Network failure, timeout or HTTP error status
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The remote acknowledged the call with `Failure`
    #[error("remote reported failure: {}", join_messages(errors))]
    Protocol { errors: Vec<ApiMessage> },

    /// The response did not match the expected document shape
    #[error("unparseable response: {reason}")]
    Unparseable { reason: String, body: String },

    /// The item never reported an outcome
    #[error("missing response")]
    MissingResponse,
}

fn join_messages(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "no error details".to_string();
    }
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A successfully hosted picture, optionally with the warnings the remote
/// attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedPicture {
    #[serde(flatten)]
    pub details: PictureDetails,
    #[serde(rename = "Warning", skip_serializing_if = "Option::is_none")]
    pub warning: Option<Vec<ApiMessage>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUpload {
    pub error: UploadError,
    pub attempts_made: u32,
}

impl Serialize for FailedUpload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FailedUpload", 3)?;
        state.serialize_field("state", &false)?;
        state.serialize_field("error", &self.error)?;
        state.serialize_field("attempts_made", &self.attempts_made)?;
        state.end()
    }
}

/// Final, post-retry result for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ItemResult {
    Uploaded(UploadedPicture),
    Failed(FailedUpload),
}

impl ItemResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, ItemResult::Failed(_))
    }

    pub fn as_uploaded(&self) -> Option<&UploadedPicture> {
        match self {
            ItemResult::Uploaded(picture) => Some(picture),
            ItemResult::Failed(_) => None,
        }
    }

    pub fn as_failed(&self) -> Option<&FailedUpload> {
        match self {
            ItemResult::Failed(failed) => Some(failed),
            ItemResult::Uploaded(_) => None,
        }
    }

    fn from_outcome(outcome: Option<AttemptOutcome>) -> Self {
        let Some(AttemptOutcome {
            classification,
            attempt,
        }) = outcome
        else {
            return ItemResult::Failed(FailedUpload {
                error: UploadError::MissingResponse,
                attempts_made: 0,
            });
        };

        let error = match classification {
            Classification::Success(details) => {
                return ItemResult::Uploaded(UploadedPicture {
                    details,
                    warning: None,
                });
            }
            Classification::Warning(details, warnings) => {
                return ItemResult::Uploaded(UploadedPicture {
                    details,
                    warning: Some(warnings),
                });
            }
            Classification::Failure(errors) => UploadError::Protocol { errors },
            Classification::TransportError(message) => UploadError::Transport { message },
            Classification::Unparseable { reason, body } => UploadError::Unparseable { reason, body },
        };

        ItemResult::Failed(FailedUpload {
            error,
            attempts_made: attempt,
        })
    }
}

/// Result of a whole upload call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    /// True iff no item failed
    pub global_state: bool,
    pub items: IndexMap<ItemKey, ItemResult>,
}

impl BatchResult {
    pub fn get(&self, key: impl Into<ItemKey>) -> Option<&ItemResult> {
        self.items.get(&key.into())
    }

    pub fn uploaded(&self) -> impl Iterator<Item = (&ItemKey, &UploadedPicture)> {
        self.items
            .iter()
            .filter_map(|(key, result)| result.as_uploaded().map(|p| (key, p)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&ItemKey, &FailedUpload)> {
        self.items
            .iter()
            .filter_map(|(key, result)| result.as_failed().map(|f| (key, f)))
    }
}

/// Aggregation switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    /// Re-key uploaded items by their echoed picture name, ordered numerically
    pub rewrite_index: bool,
    /// Treat a `Warning` acknowledgement as a batch-level failure
    pub warning_fails_batch: bool,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            rewrite_index: true,
            warning_fails_batch: false,
        }
    }
}

impl From<&UploaderConfig> for AggregateOptions {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            rewrite_index: config.rewrite_index(),
            warning_fails_batch: config.warning_fails_batch(),
        }
    }
}

/// Reduce dispatch outcomes into a [`BatchResult`].
///
/// Every key of `outcomes` yields exactly one entry; keys without an outcome
/// become `Failed` with [`UploadError::MissingResponse`].
pub fn aggregate(outcomes: DispatchOutcomes, options: &AggregateOptions) -> BatchResult {
    let mut global_state = true;
    let mut entries = Vec::with_capacity(outcomes.len());

    for (key, outcome) in outcomes {
        let result = ItemResult::from_outcome(outcome);
        let label = match &result {
            ItemResult::Uploaded(picture) if picture.warning.is_some() => {
                if options.warning_fails_batch {
                    global_state = false;
                }
                "warning"
            }
            ItemResult::Uploaded(_) => "uploaded",
            ItemResult::Failed(failed) => {
                global_state = false;
                tracing::debug!(item_key = %key, error = %failed.error, attempts = failed.attempts_made, "Item failed");
                "failed"
            }
        };
        counter!("volley_items_total", "outcome" => label).increment(1);
        entries.push((key, result));
    }

    let items = if options.rewrite_index {
        rewrite_keys(entries)
    } else {
        entries.into_iter().collect()
    };

    BatchResult {
        global_state,
        items,
    }
}

/// Re-key uploaded items by the numeric picture name the remote echoed back
/// and order everything by numeric key. Failed items and items whose echo is
/// not numeric keep their key; non-numeric keys follow the numeric ones in
/// their original order.
fn rewrite_keys(entries: Vec<(ItemKey, ItemResult)>) -> IndexMap<ItemKey, ItemResult> {
    let targets: Vec<ItemKey> = entries
        .iter()
        .map(|(key, result)| echoed_index_key(key, result).unwrap_or_else(|| key.clone()))
        .collect();

    let unique: HashSet<&ItemKey> = targets.iter().collect();
    if unique.len() != targets.len() {
        tracing::warn!("Echoed picture names are not unique, keeping original keys");
        return entries.into_iter().collect();
    }

    let mut rekeyed: Vec<(Option<u64>, ItemKey, ItemResult)> = entries
        .into_iter()
        .zip(targets)
        .map(|((_, result), key)| (key.as_index(), key, result))
        .collect();
    rekeyed.sort_by_key(|(index, _, _)| (index.is_none(), *index));

    rekeyed
        .into_iter()
        .map(|(_, key, result)| (key, result))
        .collect()
}

fn echoed_index_key(key: &ItemKey, result: &ItemResult) -> Option<ItemKey> {
    let picture = result.as_uploaded()?;
    let echoed = picture.details.picture_name.as_deref().map(str::trim);
    match echoed.and_then(|name| ItemKey::from(name).as_index()) {
        Some(index) => Some(ItemKey::from(index)),
        None => {
            tracing::debug!(item_key = %key, echoed = ?echoed, "No numeric picture name to rewrite by");
            None
        }
    }
}
