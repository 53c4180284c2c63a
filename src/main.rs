//! Scriptorium - collaborative edition gateway for CTI knowledge entities

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scriptorium::{
    config::Args,
    connectors::ConnectorRegistry,
    logging::AuditLogger,
    server,
    services::{EditingConfig, EditingService},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("scriptorium={},info", log_level).into()),
        )
        .with(args.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Scriptorium - collaborative edition");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Capability matching: {}", args.capability_match);
    info!(
        "Presence TTL: {}s (reaper every {}s)",
        args.presence_ttl_secs, args.presence_reap_interval_secs
    );
    info!("======================================");

    let connectors = match &args.connectors_file {
        Some(path) => match ConnectorRegistry::load(path).await {
            Ok(registry) => {
                info!(
                    "Loaded {} export connector(s) from {}",
                    registry.records().len(),
                    path.display()
                );
                registry
            }
            Err(e) => {
                error!("Failed to load connectors from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No connectors file - export registry is empty");
            ConnectorRegistry::empty()
        }
    };

    let audit = AuditLogger::new(args.node_id.clone());
    if let Some(path) = &args.audit_log_path {
        match audit.init_file(path).await {
            Ok(()) => info!("Edit audit log: {}", path.display()),
            Err(e) => warn!("Audit log disabled, cannot open {}: {}", path.display(), e),
        }
    }

    let editing = EditingService::new(EditingConfig::from_args(&args))
        .with_connectors(connectors)
        .with_audit(audit);
    let state = server::AppState::with_service(args, Arc::new(editing))?;

    server::run(Arc::new(state)).await?;

    Ok(())
}
