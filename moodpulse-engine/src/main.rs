//! moodpulse - adaptive emotion consensus service
//!
//! Polls a content source for a fixed population of entities, classifies the
//! items it finds and keeps one consensus emotion per entity up to date. Runs as
//! a long-lived control loop until Ctrl+C / SIGTERM, or a single cycle with
//! `--once`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use moodpulse_common::config::{
    load_toml_config, write_toml_config, RootFolderInitializer, RootFolderResolver,
};
use moodpulse_common::db::init_database;
use moodpulse_common::events::EventBus;
use moodpulse_engine::collaborators::{HttpFetcher, KeywordClusterer, LexiconLoader, TextNormalizer};
use moodpulse_engine::registry::registry_from_config;
use moodpulse_engine::{Collaborators, PipelineOrchestrator};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for moodpulse
#[derive(Parser, Debug)]
#[command(name = "moodpulse")]
#[command(about = "Adaptive emotion consensus control loop")]
#[command(version)]
struct Args {
    /// Root folder holding the database (overrides MOODPULSE_ROOT and the config file)
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Config file (default: <root folder>/moodpulse.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single cycle, print its report and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config is read before logging starts so its level can seed the filter
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => RootFolderInitializer::new(RootFolderResolver::new(args.root_folder.clone()).resolve())
            .config_path(),
    };
    let config_found = config_path.exists();
    let config = load_toml_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let default_filter = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting moodpulse");
    info!(
        "Version: {} ({} built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    if config_found {
        info!("Config: {}", config_path.display());
    } else {
        info!("Config: {} not found, using defaults", config_path.display());
    }

    // Root folder: CLI, then environment, then the config file, then the OS default
    let root_folder = RootFolderResolver::new(args.root_folder.clone())
        .with_toml_root(config.root_folder.clone())
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    // Seed a config file with the defaults so there is something to edit (best-effort)
    if !config_found {
        match write_toml_config(&config, &config_path) {
            Ok(()) => info!("Wrote default config to {}", config_path.display()),
            Err(e) => warn!("Could not write default config: {}", e),
        }
    }

    let db_path = initializer.database_path(&config);
    info!("Database: {}", db_path.display());
    let db_pool = init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let event_bus = EventBus::new(256);
    spawn_event_logger(&event_bus);

    let base_url = config.source.base_url.clone().with_context(|| {
        format!("No content source configured: set [source] base_url in {}", config_path.display())
    })?;
    let fetcher = HttpFetcher::new(base_url.as_str(), &config.source)
        .context("Failed to create content source client")?;
    info!("Content source: {}", base_url);

    let collaborators = Collaborators {
        fetcher: Arc::new(fetcher),
        enricher: Arc::new(TextNormalizer::new()),
        clusterer: Arc::new(KeywordClusterer::new()),
        classifier_loader: Arc::new(LexiconLoader::new(config.classifier.lexicon_path.clone())),
    };

    let entities = registry_from_config(&config.entities);
    info!("Monitoring {} entities", entities.len());

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        db_pool,
        event_bus,
        entities,
        collaborators,
        &config,
    ));
    orchestrator
        .restore_state()
        .await
        .context("Failed to restore persisted state")?;

    if args.once {
        let report = orchestrator.run_cycle().await.context("Pipeline cycle failed")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        info!("{}", orchestrator.status().display_string());
        return Ok(());
    }

    let handle = Arc::clone(&orchestrator).start();
    shutdown_signal().await;

    handle.stop().await;
    info!("{}", orchestrator.status().display_string());
    info!("Shutdown complete");
    Ok(())
}

/// Log every control loop event at debug level
fn spawn_event_logger(event_bus: &EventBus) {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => debug!(event = event.event_type(), ?event, "Event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
