//! Typed schema for `UploadSiteHostedPicturesResponse` documents.

use serde::{Deserialize, Serialize};

/// Top-level response document. Only the fields the classifier reads are
/// modelled; everything else in the document is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "Ack")]
    pub ack: Option<String>,

    #[serde(rename = "Errors", default)]
    pub errors: Vec<ApiMessage>,

    #[serde(rename = "SiteHostedPictureDetails")]
    pub picture_details: Option<PictureDetails>,

    #[serde(rename = "CorrelationID")]
    pub correlation_id: Option<String>,

    #[serde(rename = "Version")]
    pub version: Option<String>,
}

/// Identifiers and URLs assigned to a hosted picture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PictureDetails {
    #[serde(rename = "PictureName", skip_serializing_if = "Option::is_none")]
    pub picture_name: Option<String>,

    #[serde(rename = "PictureSet", skip_serializing_if = "Option::is_none")]
    pub picture_set: Option<String>,

    #[serde(rename = "PictureFormat", skip_serializing_if = "Option::is_none")]
    pub picture_format: Option<String>,

    #[serde(rename = "FullURL", skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,

    #[serde(rename = "BaseURL", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(
        rename = "PictureSetMember",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub members: Vec<PictureSetMember>,

    #[serde(rename = "ExternalPictureURL", skip_serializing_if = "Option::is_none")]
    pub external_picture_url: Option<String>,

    #[serde(rename = "UseByDate", skip_serializing_if = "Option::is_none")]
    pub use_by_date: Option<String>,
}

/// One rendition of a hosted picture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PictureSetMember {
    #[serde(rename = "MemberURL", skip_serializing_if = "Option::is_none")]
    pub member_url: Option<String>,

    #[serde(rename = "PictureHeight", skip_serializing_if = "Option::is_none")]
    pub picture_height: Option<u32>,

    #[serde(rename = "PictureWidth", skip_serializing_if = "Option::is_none")]
    pub picture_width: Option<u32>,
}

/// An entry of the `Errors` list; used for both failures and warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMessage {
    #[serde(rename = "ShortMessage", skip_serializing_if = "Option::is_none")]
    pub short_message: Option<String>,

    #[serde(rename = "LongMessage", skip_serializing_if = "Option::is_none")]
    pub long_message: Option<String>,

    #[serde(rename = "ErrorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(rename = "SeverityCode", skip_serializing_if = "Option::is_none")]
    pub severity_code: Option<String>,

    #[serde(rename = "ErrorClassification", skip_serializing_if = "Option::is_none")]
    pub error_classification: Option<String>,
}

impl std::fmt::Display for ApiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.error_code.as_deref().unwrap_or("?");
        let message = self
            .long_message
            .as_deref()
            .or(self.short_message.as_deref())
            .unwrap_or("no message");
        write!(f, "[{code}] {message}")
    }
}

/// Decode a response body into the typed envelope.
pub fn decode(body: &str) -> Result<ResponseEnvelope, quick_xml::de::DeError> {
    quick_xml::de::from_str(body)
}
