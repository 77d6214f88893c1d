use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mobile platform a version record targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(format!("unknown platform \"{other}\", expected ios or android")),
        }
    }
}

/// A school (tenant) entry as selected by the operator: a display label plus
/// the absolute origin of its version API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationConfig {
    pub name: String,
    pub base_url: String,
}

/// Registry of schools keyed by slug. A `BTreeMap` keeps the key set sorted,
/// which the snapshot de-duplication in the controller relies on.
pub type Registry = BTreeMap<String, OrganizationConfig>;

/// Remote-store document shape for one school. Timestamps are assigned on
/// write by the sync layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationDoc {
    pub name: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrganizationDoc {
    pub fn stamped(config: &OrganizationConfig, now: DateTime<Utc>) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    pub fn into_config(self) -> OrganizationConfig {
        OrganizationConfig {
            name: self.name,
            base_url: self.base_url,
        }
    }
}

/// One mobile app version as reported by a school's version API. Identity for
/// upserts is `(app_name, type)` and is resolved server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    #[serde(rename = "type")]
    pub platform: Platform,
    pub is_active: bool,
    #[serde(default)]
    pub app_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Normalizes an operator-entered school key into a slug: lowercase,
/// whitespace runs collapsed to single hyphens, everything outside
/// `[a-z0-9-]` stripped.
pub fn slugify(raw: &str) -> String {
    raw.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

pub fn is_valid_slug(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
