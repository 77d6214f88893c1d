//! Orchestration layer of the version console: school selection, version
//! fetch/submit flows, the custom-school registry with local persistence,
//! and the optional cloud mirror with debounced full pushes and a live
//! subscription.

use std::sync::Arc;

use registry_sync::{RegistrySnapshotCallback, RegistrySync};
use shared::{
    domain::{is_valid_slug, slugify, OrganizationConfig, Platform, Registry, VersionRecord},
    error::StoreError,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{sleep, Duration},
};
use tracing::{debug, info, warn};
use url::Url;
use version_api::{FetchOutcome, VersionApiClient, VersionApiError, VersionSubmission};

mod builtin;
mod profile;

pub use builtin::builtin_registry;
pub use profile::{Profile, ProfileStore};

/// Quiet period after a registry edit before a full push runs. Edits made in
/// quick succession collapse into one reconciliation.
pub const PUSH_DEBOUNCE: Duration = Duration::from_millis(2_000);

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("select a school and an app type first")]
    MissingSelection,
    #[error("unknown school \"{0}\"")]
    UnknownSchool(String),
    #[error("\"{0}\" is not a valid school key")]
    InvalidKey(String),
    #[error("school name must not be empty")]
    MissingName,
    #[error("\"{0}\" is not a valid http(s) base URL")]
    InvalidBaseUrl(String),
    #[error("\"{0}\" is a built-in school and cannot be modified")]
    BuiltInSchool(String),
    #[error(transparent)]
    Api(#[from] VersionApiError),
    #[error("profile persistence failed: {0}")]
    Profile(String),
    #[error("cloud registry operation failed: {0}")]
    Sync(#[source] StoreError),
    /// The school was removed locally, the cloud delete failed, and the
    /// local removal was rolled back to keep both sides consistent.
    #[error("cloud delete failed, local removal rolled back: {0}")]
    DeleteNotMirrored(#[source] StoreError),
}

/// How far a school addition propagated. Additions never roll back: a
/// failed cloud mirror leaves the school local-only and reports so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored locally; cloud sync is off.
    Applied,
    /// Stored locally and mirrored to the cloud registry.
    AppliedAndMirrored,
    /// Stored locally; the cloud mirror failed and was not retried.
    AppliedLocalOnly,
}

#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    RegistryUpdated,
    VersionsUpdated { count: usize },
    Error(String),
}

#[derive(Default)]
struct ControllerState {
    selected_school: Option<String>,
    selected_app_type: Option<String>,
    versions: Vec<VersionRecord>,
    error: Option<String>,
    custom: Registry,
    cloud_sync_enabled: bool,
    pending_push: Option<JoinHandle<()>>,
}

pub struct ConsoleController {
    api: VersionApiClient,
    sync: Arc<RegistrySync>,
    profile_store: ProfileStore,
    builtin: Registry,
    inner: Mutex<ControllerState>,
    events: broadcast::Sender<ConsoleEvent>,
}

impl ConsoleController {
    pub fn new(
        api: VersionApiClient,
        sync: Arc<RegistrySync>,
        profile_store: ProfileStore,
    ) -> Result<Arc<Self>, ControllerError> {
        Self::with_builtin(api, sync, profile_store, builtin_registry())
    }

    /// Same as [`new`](Self::new) with a caller-supplied built-in table.
    pub fn with_builtin(
        api: VersionApiClient,
        sync: Arc<RegistrySync>,
        profile_store: ProfileStore,
        builtin: Registry,
    ) -> Result<Arc<Self>, ControllerError> {
        let profile = profile_store
            .load()
            .map_err(|err| ControllerError::Profile(err.to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            api,
            sync,
            profile_store,
            builtin,
            inner: Mutex::new(ControllerState {
                custom: profile.custom_schools,
                cloud_sync_enabled: profile.cloud_sync_enabled,
                ..ControllerState::default()
            }),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    /// Re-arms cloud sync on startup when the persisted profile has it
    /// enabled. A no-op otherwise.
    pub async fn resume_cloud_sync(self: &Arc<Self>) -> Result<(), ControllerError> {
        let enabled = self.inner.lock().await.cloud_sync_enabled;
        if enabled {
            self.enable_cloud_sync().await?;
        }
        Ok(())
    }

    /// Built-ins overlaid with the custom registry; a custom entry shadows a
    /// built-in with the same key.
    pub async fn merged_registry(&self) -> Registry {
        let guard = self.inner.lock().await;
        let mut merged = self.builtin.clone();
        merged.extend(guard.custom.clone());
        merged
    }

    /// Changing the school resets the version list and any stale error.
    pub async fn select_school(&self, key: Option<&str>) -> Result<(), ControllerError> {
        let mut guard = self.inner.lock().await;
        if let Some(key) = key {
            if !self.builtin.contains_key(key) && !guard.custom.contains_key(key) {
                return Err(ControllerError::UnknownSchool(key.to_string()));
            }
        }
        guard.selected_school = key.map(str::to_string);
        guard.versions.clear();
        guard.error = None;
        Ok(())
    }

    pub async fn select_app_type(&self, app_type: Option<&str>) {
        let mut guard = self.inner.lock().await;
        guard.selected_app_type = app_type.map(str::to_string);
        guard.versions.clear();
        guard.error = None;
    }

    pub async fn selected_school(&self) -> Option<String> {
        self.inner.lock().await.selected_school.clone()
    }

    pub async fn versions(&self) -> Vec<VersionRecord> {
        self.inner.lock().await.versions.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.error.clone()
    }

    pub async fn cloud_sync_enabled(&self) -> bool {
        self.inner.lock().await.cloud_sync_enabled
    }

    pub async fn custom_schools(&self) -> Registry {
        self.inner.lock().await.custom.clone()
    }

    /// Fetches the version list for the current selection and `platform`,
    /// replacing the cached list.
    pub async fn fetch_versions(
        &self,
        platform: Platform,
    ) -> Result<FetchOutcome, ControllerError> {
        let (config, app_type) = self.current_selection().await?;
        let outcome = self
            .api
            .fetch_versions(&config.base_url, platform, &app_type)
            .await?;

        let mut guard = self.inner.lock().await;
        guard.versions = outcome.versions.clone();
        guard.error = outcome.error.clone();
        drop(guard);

        if let Some(message) = &outcome.error {
            self.emit(ConsoleEvent::Error(message.clone()));
        }
        self.emit(ConsoleEvent::VersionsUpdated {
            count: outcome.versions.len(),
        });
        Ok(outcome)
    }

    /// Submits a version upsert, then re-fetches the list so the cached
    /// state reflects what the server resolved.
    pub async fn submit_version(
        &self,
        submission: &VersionSubmission,
    ) -> Result<FetchOutcome, ControllerError> {
        let (config, app_type) = self.current_selection().await?;
        self.api
            .submit_version(&config.base_url, &app_type, submission)
            .await?;

        // submit_version validated the platform, so this branch always runs.
        if let Some(platform) = submission.platform {
            self.fetch_versions(platform).await
        } else {
            Ok(FetchOutcome::default())
        }
    }

    /// Flips the active flag of an existing record by resubmitting it.
    pub async fn toggle_status(
        &self,
        record: &VersionRecord,
    ) -> Result<FetchOutcome, ControllerError> {
        self.submit_version(&VersionSubmission {
            version: record.version.clone(),
            platform: Some(record.platform),
            is_active: Some(!record.is_active),
        })
        .await
    }

    /// Adds a custom school. The key is derived from `raw_key` by slugging;
    /// built-in keys are rejected rather than shadowed.
    pub async fn add_school(
        self: &Arc<Self>,
        name: &str,
        raw_key: &str,
        base_url: &str,
    ) -> Result<(String, AddOutcome), ControllerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ControllerError::MissingName);
        }
        let key = slugify(raw_key);
        if !is_valid_slug(&key) {
            return Err(ControllerError::InvalidKey(raw_key.to_string()));
        }
        if self.builtin.contains_key(&key) {
            return Err(ControllerError::BuiltInSchool(key));
        }
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        let parsed = Url::parse(&base_url)
            .map_err(|_| ControllerError::InvalidBaseUrl(base_url.clone()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ControllerError::InvalidBaseUrl(base_url));
        }

        let config = OrganizationConfig {
            name: name.to_string(),
            base_url,
        };

        let mut guard = self.inner.lock().await;
        guard.custom.insert(key.clone(), config.clone());
        if let Err(err) = self.persist_locked(&guard) {
            guard.custom.remove(&key);
            return Err(err);
        }
        let cloud_enabled = guard.cloud_sync_enabled;
        if cloud_enabled {
            self.schedule_push(&mut guard);
        }
        drop(guard);
        self.emit(ConsoleEvent::RegistryUpdated);

        if !cloud_enabled {
            return Ok((key, AddOutcome::Applied));
        }
        match self.sync.save_one(&key, &config).await {
            Ok(()) => Ok((key, AddOutcome::AppliedAndMirrored)),
            Err(err) => {
                warn!(%key, %err, "cloud mirror of added school failed, keeping it local-only");
                self.emit(ConsoleEvent::Error(err.sanitized(true).to_string()));
                Ok((key, AddOutcome::AppliedLocalOnly))
            }
        }
    }

    /// Removes a custom school. When cloud sync is on and the cloud delete
    /// fails, the local removal is rolled back so a later push cannot
    /// resurrect a half-deleted entry.
    pub async fn remove_school(self: &Arc<Self>, key: &str) -> Result<(), ControllerError> {
        if self.builtin.contains_key(key) {
            return Err(ControllerError::BuiltInSchool(key.to_string()));
        }
        let mut guard = self.inner.lock().await;
        let Some(removed) = guard.custom.remove(key) else {
            return Err(ControllerError::UnknownSchool(key.to_string()));
        };
        self.persist_locked(&guard)?;
        let cloud_enabled = guard.cloud_sync_enabled;
        drop(guard);

        if cloud_enabled {
            if let Err(err) = self.sync.delete_one(key).await {
                let mut guard = self.inner.lock().await;
                guard.custom.insert(key.to_string(), removed);
                self.persist_locked(&guard)?;
                drop(guard);
                return Err(ControllerError::DeleteNotMirrored(err));
            }
        }

        let mut guard = self.inner.lock().await;
        if guard.selected_school.as_deref() == Some(key) {
            guard.selected_school = None;
            guard.versions.clear();
            guard.error = None;
        }
        if cloud_enabled {
            self.schedule_push(&mut guard);
        }
        drop(guard);
        self.emit(ConsoleEvent::RegistryUpdated);
        Ok(())
    }

    pub async fn set_cloud_sync(self: &Arc<Self>, enabled: bool) -> Result<(), ControllerError> {
        {
            let mut guard = self.inner.lock().await;
            guard.cloud_sync_enabled = enabled;
            self.persist_locked(&guard)?;
            if !enabled {
                if let Some(pending) = guard.pending_push.take() {
                    pending.abort();
                }
            }
        }
        if enabled {
            self.enable_cloud_sync().await?;
        } else {
            self.sync.unsubscribe().await;
            info!("cloud sync disabled");
        }
        Ok(())
    }

    /// Immediate full reconciliation of the cloud registry with the local
    /// custom set.
    pub async fn push_now(&self) -> Result<(), ControllerError> {
        let custom = self.inner.lock().await.custom.clone();
        self.sync
            .push_all(&custom)
            .await
            .map_err(|err| self.report_store_error(err))
    }

    /// Immediate full pull, replacing the local custom set when it differs.
    pub async fn pull_now(self: &Arc<Self>) -> Result<(), ControllerError> {
        let snapshot = self
            .sync
            .get_all()
            .await
            .map_err(|err| self.report_store_error(err))?;
        self.apply_remote_snapshot(snapshot).await;
        Ok(())
    }

    async fn enable_cloud_sync(self: &Arc<Self>) -> Result<(), ControllerError> {
        let weak = Arc::downgrade(self);
        let callback: RegistrySnapshotCallback = Arc::new(move |snapshot| {
            if let Some(controller) = weak.upgrade() {
                tokio::spawn(async move {
                    controller.apply_remote_snapshot(snapshot).await;
                });
            }
        });
        self.sync.subscribe(callback).await;
        info!("cloud sync enabled");
        self.pull_now().await
    }

    /// Installs a remote snapshot as the custom registry. A snapshot whose
    /// key set equals the current one is dropped without persisting or
    /// notifying, which breaks the echo loop of our own pushes.
    async fn apply_remote_snapshot(&self, snapshot: Registry) {
        let mut guard = self.inner.lock().await;
        if guard.custom.keys().eq(snapshot.keys()) {
            debug!("remote snapshot matches local key set, skipping");
            return;
        }
        info!(schools = snapshot.len(), "installing remote registry snapshot");
        guard.custom = snapshot;
        if let Err(err) = self.persist_locked(&guard) {
            warn!(%err, "failed to persist remote registry snapshot");
        }
        drop(guard);
        self.emit(ConsoleEvent::RegistryUpdated);
    }

    /// Arms a delayed full push, replacing any not-yet-fired one.
    fn schedule_push(self: &Arc<Self>, guard: &mut ControllerState) {
        if let Some(pending) = guard.pending_push.take() {
            pending.abort();
        }
        let weak = Arc::downgrade(self);
        guard.pending_push = Some(tokio::spawn(async move {
            sleep(PUSH_DEBOUNCE).await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            if let Err(err) = controller.push_now().await {
                warn!(%err, "debounced registry push failed");
            }
        }));
    }

    async fn current_selection(&self) -> Result<(OrganizationConfig, String), ControllerError> {
        let guard = self.inner.lock().await;
        let (Some(school), Some(app_type)) = (
            guard.selected_school.clone(),
            guard.selected_app_type.clone(),
        ) else {
            return Err(ControllerError::MissingSelection);
        };
        let config = guard
            .custom
            .get(&school)
            .or_else(|| self.builtin.get(&school))
            .cloned()
            .ok_or(ControllerError::UnknownSchool(school))?;
        Ok((config, app_type))
    }

    fn persist_locked(&self, guard: &ControllerState) -> Result<(), ControllerError> {
        let profile = Profile {
            custom_schools: guard.custom.clone(),
            cloud_sync_enabled: guard.cloud_sync_enabled,
        };
        self.profile_store
            .save(&profile)
            .map_err(|err| ControllerError::Profile(err.to_string()))
    }

    fn report_store_error(&self, err: StoreError) -> ControllerError {
        let sanitized = err.sanitized(true);
        self.emit(ConsoleEvent::Error(sanitized.to_string()));
        ControllerError::Sync(sanitized)
    }

    fn emit(&self, event: ConsoleEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
