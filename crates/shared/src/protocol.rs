use serde::{Deserialize, Serialize};

use crate::{
    domain::{Platform, VersionRecord},
    error::StoreErrorCode,
};

/// Structured media type used for the primary request attempt.
pub const JSON_API_MEDIA_TYPE: &str = "application/vnd.api+json";
/// Relaxed `Accept` value used for the one fallback retry after a 415.
pub const JSON_API_ACCEPT_FALLBACK: &str = "application/vnd.api+json, application/json;q=0.9";

/// Fixed resource type identifier the version API expects on upserts.
pub const UPSERT_RESOURCE_TYPE: &str = "user";

/// Response envelope of `GET {base}/mobile-versions/{platform}/{app_type}`.
/// A missing `data` member is treated as an empty list.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct VersionListResponse {
    #[serde(default)]
    pub data: Vec<VersionRecord>,
}

/// Request envelope of `POST {base}/add-update-mobile-version`. The `id` is
/// always null because identity is server-resolved from `(app_name, type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionUpsertEnvelope {
    pub data: VersionUpsertDocument,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionUpsertDocument {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: Option<String>,
    pub attributes: VersionUpsertAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionUpsertAttributes {
    pub app_name: String,
    pub version: String,
    pub is_active: bool,
    #[serde(rename = "type")]
    pub platform: Platform,
}

impl VersionUpsertEnvelope {
    pub fn new(attributes: VersionUpsertAttributes) -> Self {
        Self {
            data: VersionUpsertDocument {
                resource_type: UPSERT_RESOURCE_TYPE.to_string(),
                id: None,
                attributes,
            },
        }
    }
}

/// Frames carried by the registry watch transport. `Changed` is a bare
/// change notice; subscribers re-pull the full collection on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchEvent {
    Changed,
    Error {
        code: StoreErrorCode,
        message: String,
    },
}
