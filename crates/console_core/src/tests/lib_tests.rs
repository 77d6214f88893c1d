use std::sync::{Arc, Mutex as StdMutex};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use registry_sync::{MemoryRegistryStore, RegistryStore, RegistrySync};
use shared::error::StoreErrorCode;
use tempfile::TempDir;
use throttle::{RateLimiter, SyncThrottle};
use tokio::net::TcpListener;

use super::*;

fn config(name: &str) -> OrganizationConfig {
    OrganizationConfig {
        name: name.to_string(),
        base_url: format!("https://{name}.example.com"),
    }
}

struct Harness {
    store: Arc<MemoryRegistryStore>,
    controller: Arc<ConsoleController>,
    profile_path: std::path::PathBuf,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let profile_path = dir.path().join("profile.json");
    let store = Arc::new(MemoryRegistryStore::new());
    let sync = Arc::new(RegistrySync::new(
        Arc::clone(&store) as Arc<dyn RegistryStore>,
        Arc::new(SyncThrottle::default()),
    ));
    let api = VersionApiClient::new(RateLimiter::default()).expect("build client");
    let controller = ConsoleController::new(api, sync, ProfileStore::new(&profile_path))
        .expect("build controller");
    Harness {
        store,
        controller,
        profile_path,
        _dir: dir,
    }
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn changing_the_selection_clears_cached_versions_and_errors() {
    let h = harness();
    {
        let mut guard = h.controller.inner.lock().await;
        guard.versions.push(VersionRecord {
            version: "1.0.0".to_string(),
            platform: Platform::Ios,
            is_active: true,
            app_name: "employee".to_string(),
            created_at: None,
            updated_at: None,
        });
        guard.error = Some("stale failure".to_string());
    }

    h.controller
        .select_school(Some("testing"))
        .await
        .expect("built-in school is selectable");

    assert!(h.controller.versions().await.is_empty());
    assert!(h.controller.last_error().await.is_none());
}

#[tokio::test]
async fn selecting_an_unknown_school_is_rejected() {
    let h = harness();
    let err = h
        .controller
        .select_school(Some("no-such-school"))
        .await
        .expect_err("unknown school");
    assert!(matches!(err, ControllerError::UnknownSchool(_)));
}

#[tokio::test]
async fn add_school_with_cloud_off_stays_local_and_persists() {
    let h = harness();

    let (key, outcome) = h
        .controller
        .add_school("Al Noor", "Al Noor", "https://api.al-noor.example.com/")
        .await
        .expect("add succeeds");

    assert_eq!(key, "al-noor");
    assert_eq!(outcome, AddOutcome::Applied);
    assert!(h.store.keys().is_empty());

    let reloaded = ProfileStore::new(&h.profile_path)
        .load()
        .expect("profile reloads");
    let stored = reloaded.custom_schools.get("al-noor").expect("persisted");
    assert_eq!(stored.name, "Al Noor");
    assert_eq!(stored.base_url, "https://api.al-noor.example.com");
}

#[tokio::test]
async fn add_school_validates_name_key_and_url() {
    let h = harness();

    let err = h
        .controller
        .add_school("  ", "some-key", "https://x.example.com")
        .await
        .expect_err("empty name");
    assert!(matches!(err, ControllerError::MissingName));

    let err = h
        .controller
        .add_school("School", "!!!", "https://x.example.com")
        .await
        .expect_err("key slugs to nothing");
    assert!(matches!(err, ControllerError::InvalidKey(_)));

    let err = h
        .controller
        .add_school("School", "school", "ftp://x.example.com")
        .await
        .expect_err("non-http scheme");
    assert!(matches!(err, ControllerError::InvalidBaseUrl(_)));

    let err = h
        .controller
        .add_school("School", "Testing", "https://x.example.com")
        .await
        .expect_err("built-in key");
    assert!(matches!(err, ControllerError::BuiltInSchool(_)));
}

#[tokio::test]
async fn add_school_with_cloud_on_mirrors_to_the_store() {
    let h = harness();
    h.controller
        .set_cloud_sync(true)
        .await
        .expect("enable sync");

    let (key, outcome) = h
        .controller
        .add_school("Al Noor", "al noor", "https://api.al-noor.example.com")
        .await
        .expect("add succeeds");

    assert_eq!(outcome, AddOutcome::AppliedAndMirrored);
    let doc = h
        .store
        .get(&key)
        .await
        .expect("get succeeds")
        .expect("mirrored");
    assert_eq!(doc.name, "Al Noor");
}

#[tokio::test]
async fn failed_cloud_mirror_keeps_the_school_local_only() {
    let h = harness();
    h.controller
        .set_cloud_sync(true)
        .await
        .expect("enable sync");
    h.store.set_put_failure(Some(StoreError::new(
        StoreErrorCode::PermissionDenied,
        "registry write denied",
    )));

    let (key, outcome) = h
        .controller
        .add_school("Al Noor", "al-noor", "https://api.al-noor.example.com")
        .await
        .expect("add still succeeds");

    assert_eq!(outcome, AddOutcome::AppliedLocalOnly);
    assert!(h.controller.custom_schools().await.contains_key(&key));
    assert!(h.store.get(&key).await.expect("get succeeds").is_none());
}

#[tokio::test]
async fn failed_cloud_delete_rolls_the_local_removal_back() {
    let h = harness();
    h.controller
        .set_cloud_sync(true)
        .await
        .expect("enable sync");
    let (key, _) = h
        .controller
        .add_school("Al Noor", "al-noor", "https://api.al-noor.example.com")
        .await
        .expect("add succeeds");

    h.store.set_delete_failure(Some(StoreError::new(
        StoreErrorCode::Unavailable,
        "store offline",
    )));
    let err = h
        .controller
        .remove_school(&key)
        .await
        .expect_err("delete fails");

    assert!(matches!(err, ControllerError::DeleteNotMirrored(_)));
    assert!(h.controller.custom_schools().await.contains_key(&key));
    assert!(h.store.get(&key).await.expect("get succeeds").is_some());
}

#[tokio::test]
async fn remove_school_deletes_locally_and_remotely() {
    let h = harness();
    h.controller
        .set_cloud_sync(true)
        .await
        .expect("enable sync");
    let (key, _) = h
        .controller
        .add_school("Al Noor", "al-noor", "https://api.al-noor.example.com")
        .await
        .expect("add succeeds");

    h.controller.remove_school(&key).await.expect("remove");

    assert!(!h.controller.custom_schools().await.contains_key(&key));
    assert!(h.store.get(&key).await.expect("get succeeds").is_none());

    let err = h
        .controller
        .remove_school("testing")
        .await
        .expect_err("built-in removal");
    assert!(matches!(err, ControllerError::BuiltInSchool(_)));
}

#[tokio::test]
async fn remote_snapshots_with_an_unchanged_key_set_are_dropped() {
    let h = harness();
    {
        let mut guard = h.controller.inner.lock().await;
        guard.custom.insert("al-noor".to_string(), config("al-noor"));
    }
    let mut events = h.controller.subscribe_events();

    let mut echoed = Registry::new();
    echoed.insert(
        "al-noor".to_string(),
        OrganizationConfig {
            name: "Renamed Elsewhere".to_string(),
            base_url: "https://other.example.com".to_string(),
        },
    );
    h.controller.apply_remote_snapshot(echoed).await;

    // Same key set: nothing installed, nothing announced.
    assert_eq!(
        h.controller.custom_schools().await.get("al-noor"),
        Some(&config("al-noor"))
    );
    assert!(events.try_recv().is_err());

    let mut grown = Registry::new();
    grown.insert("al-noor".to_string(), config("al-noor"));
    grown.insert("beta".to_string(), config("beta"));
    h.controller.apply_remote_snapshot(grown).await;

    assert_eq!(h.controller.custom_schools().await.len(), 2);
    assert!(matches!(
        events.try_recv(),
        Ok(ConsoleEvent::RegistryUpdated)
    ));
}

#[tokio::test(start_paused = true)]
async fn debounced_push_reconciles_entries_added_elsewhere() {
    let h = harness();
    // Arm the flag without installing the live subscription so the debounced
    // push is observed in isolation.
    {
        let mut guard = h.controller.inner.lock().await;
        guard.cloud_sync_enabled = true;
    }

    h.controller
        .add_school("Alpha", "alpha", "https://alpha.example.com")
        .await
        .expect("add alpha");
    h.controller
        .add_school("Beta", "beta", "https://beta.example.com")
        .await
        .expect("add beta");

    // Written by another client; the debounced push removes it because it is
    // absent from the local set.
    h.store.insert_doc(
        "ghost",
        shared::domain::OrganizationDoc::stamped(&config("ghost"), Utc::now()),
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;

    assert_eq!(
        h.store.keys(),
        vec!["alpha".to_string(), "beta".to_string()]
    );
    let custom = h.controller.custom_schools().await;
    assert_eq!(
        custom.keys().cloned().collect::<Vec<_>>(),
        vec!["alpha".to_string(), "beta".to_string()]
    );
}

#[derive(Clone, Default)]
struct VersionServer {
    is_active: Arc<StdMutex<bool>>,
    upserts: Arc<StdMutex<Vec<serde_json::Value>>>,
}

async fn list_versions(State(state): State<VersionServer>) -> Json<serde_json::Value> {
    let is_active = *state.is_active.lock().unwrap();
    Json(serde_json::json!({
        "data": [
            {"version": "3.4.0", "type": "ios", "is_active": is_active, "app_name": "employee"}
        ]
    }))
}

async fn upsert_version(
    State(state): State<VersionServer>,
    Json(payload): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    if let Some(is_active) = payload["data"]["attributes"]["is_active"].as_bool() {
        *state.is_active.lock().unwrap() = is_active;
    }
    state.upserts.lock().unwrap().push(payload);
    Json(serde_json::json!({"status": "ok"}))
}

#[tokio::test]
async fn fetch_and_toggle_round_trip_against_a_version_server() {
    let server = VersionServer {
        is_active: Arc::new(StdMutex::new(true)),
        upserts: Arc::default(),
    };
    let router = Router::new()
        .route("/mobile-versions/:platform/:app_type", get(list_versions))
        .route("/add-update-mobile-version", post(upsert_version))
        .with_state(server.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock server");
    });

    // Built-in table rebased onto the mock server.
    let dir = TempDir::new().expect("temp dir");
    let mut builtin = Registry::new();
    builtin.insert(
        "dar-al-ahfad".to_string(),
        OrganizationConfig {
            name: "دار الاحفاد".to_string(),
            base_url: format!("http://{addr}"),
        },
    );
    let sync = Arc::new(RegistrySync::new(
        Arc::new(MemoryRegistryStore::new()) as Arc<dyn RegistryStore>,
        Arc::new(SyncThrottle::default()),
    ));
    let api = VersionApiClient::new(RateLimiter::default()).expect("build client");
    let controller = ConsoleController::with_builtin(
        api,
        sync,
        ProfileStore::new(dir.path().join("profile.json")),
        builtin,
    )
    .expect("build controller");

    controller
        .select_school(Some("dar-al-ahfad"))
        .await
        .expect("select school");
    controller.select_app_type(Some("employee")).await;

    let outcome = controller
        .fetch_versions(Platform::Ios)
        .await
        .expect("fetch succeeds");
    assert_eq!(outcome.versions.len(), 1);
    assert!(outcome.versions[0].is_active);

    let record = outcome.versions[0].clone();
    let refreshed = controller
        .toggle_status(&record)
        .await
        .expect("toggle succeeds");

    assert_eq!(refreshed.versions.len(), 1);
    assert!(!refreshed.versions[0].is_active);

    let upserts = server.upserts.lock().unwrap();
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0]["data"]["type"], "user");
    assert_eq!(upserts[0]["data"]["attributes"]["version"], "3.4.0");
    assert_eq!(upserts[0]["data"]["attributes"]["is_active"], false);
}

#[tokio::test]
async fn missing_selection_blocks_version_operations() {
    let h = harness();
    let err = h
        .controller
        .fetch_versions(Platform::Ios)
        .await
        .expect_err("no selection");
    assert!(matches!(err, ControllerError::MissingSelection));
}
