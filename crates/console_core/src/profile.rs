use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::domain::Registry;

/// Operator-local persisted state: the custom school registry and whether
/// cloud sync is armed. Built-in schools are never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub custom_schools: Registry,
    pub cloud_sync_enabled: bool,
}

/// JSON file store for the operator profile. A missing file reads as the
/// default profile, so first launch needs no setup step.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<Profile> {
        if !self.path.exists() {
            return Ok(Profile::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read profile at {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse profile at {}", self.path.display()))
    }

    pub fn save(&self, profile: &Profile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(profile).context("failed to encode profile")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("failed to write profile at {}", self.path.display()))
    }
}
