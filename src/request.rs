//! Request building.
//!
//! Turns one batch item into an [`UploadRequest`]: the header set identifying
//! the API call plus a two-part multipart body (XML control document and the
//! raw image bytes). Building is pure and cheap enough to repeat on every
//! attempt.

use bytes::Bytes;
use quick_xml::escape::escape;

use crate::batch::ItemKey;
use crate::config::UploaderConfig;

pub const CALL_NAME: &str = "UploadSiteHostedPictures";
pub const API_PATH: &str = "/ws/api.dll";
pub const PICTURE_SET: &str = "Standard";
/// Header carrying the item key so completions can be matched to their item.
pub const ITEM_KEY_HEADER: &str = "X-Volley-Item-Key";

pub const XML_PART_NAME: &str = "xml payload";
pub const IMAGE_PART_NAME: &str = "image data";
pub const IMAGE_FILE_NAME: &str = "doesntmatter";

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub data: Bytes,
}

/// Fully formed outbound request for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub key: ItemKey,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub parts: Vec<MultipartPart>,
}

impl UploadRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn part(&self, name: &str) -> Option<&MultipartPart> {
        self.parts.iter().find(|p| p.name == name)
    }
}

fn control_document(key: &ItemKey, config: &UploaderConfig) -> String {
    let key = escape(key.as_str());
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<UploadSiteHostedPicturesRequest xmlns="urn:ebay:apis:eBLBaseComponents">
    <RequesterCredentials>
        <ebl:eBayAuthToken xmlns:ebl="urn:ebay:apis:eBLBaseComponents">{token}</ebl:eBayAuthToken>
    </RequesterCredentials>
    <PictureName>{key}</PictureName>
    <PictureSet>{PICTURE_SET}</PictureSet>
    <ExtensionInDays>{days}</ExtensionInDays>
    <MessageID>{key}</MessageID>
</UploadSiteHostedPicturesRequest>"#,
        token = escape(config.auth_token().expose()),
        days = config.extension_in_days(),
    )
}

/// Build the request for one item.
pub fn build_request(key: &ItemKey, image: Bytes, config: &UploaderConfig) -> UploadRequest {
    let headers = vec![
        (ITEM_KEY_HEADER.to_string(), key.to_string()),
        ("X-EBAY-API-APP-NAME".to_string(), config.app_name().to_string()),
        ("X-EBAY-API-CERT-NAME".to_string(), config.cert_name().to_string()),
        ("X-EBAY-API-DEV-NAME".to_string(), config.dev_name().to_string()),
        ("X-EBAY-API-CALL-NAME".to_string(), CALL_NAME.to_string()),
        (
            "X-EBAY-API-COMPATIBILITY-LEVEL".to_string(),
            config.compatibility_level().to_string(),
        ),
        ("X-EBAY-API-SITEID".to_string(), config.site_id().to_string()),
    ];

    let parts = vec![
        MultipartPart {
            name: XML_PART_NAME.to_string(),
            file_name: None,
            data: Bytes::from(control_document(key, config)),
        },
        MultipartPart {
            name: IMAGE_PART_NAME.to_string(),
            file_name: Some(IMAGE_FILE_NAME.to_string()),
            data: image,
        },
    ];

    UploadRequest {
        key: key.clone(),
        method: "POST".to_string(),
        path: API_PATH.to_string(),
        headers,
        parts,
    }
}
