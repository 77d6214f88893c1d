use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{Parser, Subcommand};
use console_core::{AddOutcome, ConsoleController, ProfileStore};
use registry_sync::{
    HttpRegistryStore, MemoryRegistryStore, RegistryStore, RegistrySync,
    DEFAULT_SYNC_MAX_REQUESTS,
};
use shared::domain::Platform;
use throttle::{RateLimiter, SyncThrottle, DEFAULT_WINDOW};
use version_api::{VersionApiClient, VersionSubmission};

#[derive(Parser, Debug)]
#[command(about = "Admin console for school mobile-app versions")]
struct Args {
    /// Path of the operator profile file.
    #[arg(long, default_value = "console-profile.json")]
    profile: PathBuf,
    /// Base URL of the cloud registry store. Without it the registry is
    /// local-only and sync commands operate on an in-memory store.
    #[arg(long)]
    registry_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all selectable schools.
    Schools,
    /// Add a custom school to the registry.
    AddSchool {
        name: String,
        key: String,
        base_url: String,
    },
    /// Remove a custom school from the registry.
    RemoveSchool { key: String },
    /// Fetch the version list for one school, platform, and app type.
    Versions {
        school: String,
        app_type: String,
        platform: Platform,
    },
    /// Create or update a version record.
    Submit {
        school: String,
        app_type: String,
        version: String,
        platform: Platform,
        #[arg(long)]
        active: bool,
    },
    /// Push the local custom registry to the cloud store now.
    Push,
    /// Pull the cloud registry into the local custom set now.
    Pull,
    /// Enable cloud sync and run the initial pull.
    EnableSync,
    /// Disable cloud sync.
    DisableSync,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let store: Arc<dyn RegistryStore> = match &args.registry_url {
        Some(url) => Arc::new(HttpRegistryStore::new(
            url,
            RateLimiter::new(DEFAULT_SYNC_MAX_REQUESTS, DEFAULT_WINDOW),
        )?),
        None => Arc::new(MemoryRegistryStore::new()),
    };
    let sync = Arc::new(RegistrySync::new(store, Arc::new(SyncThrottle::default())));
    let api = VersionApiClient::new(RateLimiter::default())?;
    let controller = ConsoleController::new(api, sync, ProfileStore::new(args.profile))?;

    match args.command {
        Command::Schools => {
            let custom = controller.custom_schools().await;
            for (key, config) in controller.merged_registry().await {
                let origin = if custom.contains_key(&key) {
                    "custom"
                } else {
                    "built-in"
                };
                println!("{key:<20} {origin:<9} {} ({})", config.name, config.base_url);
            }
        }
        Command::AddSchool {
            name,
            key,
            base_url,
        } => {
            let (key, outcome) = controller.add_school(&name, &key, &base_url).await?;
            match outcome {
                AddOutcome::Applied => println!("Added {key}."),
                AddOutcome::AppliedAndMirrored => println!("Added {key} and mirrored to cloud."),
                AddOutcome::AppliedLocalOnly => {
                    println!("Added {key} locally; cloud mirror failed, will sync later.")
                }
            }
        }
        Command::RemoveSchool { key } => {
            controller.remove_school(&key).await?;
            println!("Removed {key}.");
        }
        Command::Versions {
            school,
            app_type,
            platform,
        } => {
            controller.select_school(Some(&school)).await?;
            controller.select_app_type(Some(&app_type)).await;
            let outcome = controller.fetch_versions(platform).await?;
            if let Some(message) = outcome.error {
                println!("Fetch failed: {message}");
            }
            for record in outcome.versions {
                let status = if record.is_active { "active" } else { "inactive" };
                println!("{:<12} {:<8} {status}", record.version, record.platform);
            }
        }
        Command::Submit {
            school,
            app_type,
            version,
            platform,
            active,
        } => {
            controller.select_school(Some(&school)).await?;
            controller.select_app_type(Some(&app_type)).await;
            let outcome = controller
                .submit_version(&VersionSubmission {
                    version,
                    platform: Some(platform),
                    is_active: Some(active),
                })
                .await?;
            println!("Submitted; server now lists {} versions.", outcome.versions.len());
        }
        Command::Push => {
            controller.push_now().await?;
            println!("Registry pushed.");
        }
        Command::Pull => {
            controller.pull_now().await?;
            println!("Registry pulled.");
        }
        Command::EnableSync => {
            controller.set_cloud_sync(true).await?;
            println!("Cloud sync enabled.");
        }
        Command::DisableSync => {
            controller.set_cloud_sync(false).await?;
            println!("Cloud sync disabled.");
        }
    }

    Ok(())
}
