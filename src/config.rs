//! Configuration for Scriptorium
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::MatchMode;
use crate::presence::PresenceConfig;

/// Scriptorium - collaborative edition gateway for CTI knowledge entities
#[derive(Parser, Debug, Clone)]
#[command(name = "scriptorium")]
#[command(about = "Collaborative edition gateway for CTI knowledge entities")]
pub struct Args {
    /// Identifier of this gateway instance (shows up in audit records)
    #[arg(long, env = "NODE_ID", default_value = "scriptorium-0")]
    pub node_id: String,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (requests without a token act as admin)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines instead of the human-readable format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// JWT secret for token verification (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// JWT token expiry in seconds
    #[arg(long, env = "JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// Seconds a presence entry survives without keep-alive
    #[arg(long, env = "PRESENCE_TTL_SECS", default_value = "300")]
    pub presence_ttl_secs: u64,

    /// Seconds between presence reaper runs
    #[arg(long, env = "PRESENCE_REAP_INTERVAL_SECS", default_value = "30")]
    pub presence_reap_interval_secs: u64,

    /// Capacity of each per-entity broadcast channel
    #[arg(long, env = "BROADCAST_CAPACITY", default_value = "64")]
    pub broadcast_capacity: usize,

    /// Page size used by `entities` when `first` is omitted
    #[arg(long, env = "DEFAULT_PAGE_SIZE", default_value = "25")]
    pub default_page_size: usize,

    /// Capability matching: `segment` (prefix of `_` segments) or `containment`
    #[arg(long, env = "CAPABILITY_MATCH", value_enum, default_value = "segment")]
    pub capability_match: MatchMode,

    /// JSON file listing export connectors
    #[arg(long, env = "CONNECTORS_FILE")]
    pub connectors_file: Option<PathBuf>,

    /// JSONL edit audit log path (disabled when unset)
    #[arg(long, env = "AUDIT_LOG_PATH")]
    pub audit_log_path: Option<PathBuf>,
}

impl Args {
    /// Get effective JWT secret (uses default in dev mode)
    pub fn jwt_secret(&self) -> Option<String> {
        match &self.jwt_secret {
            Some(secret) => Some(secret.clone()),
            None if self.dev_mode => Some("dev-only-insecure-secret-for-scriptorium".to_string()),
            None => None,
        }
    }

    /// Presence settings derived from the CLI
    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            ttl: Duration::from_secs(self.presence_ttl_secs),
            reap_interval: Duration::from_secs(self.presence_reap_interval_secs),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.jwt_secret.is_none() {
            return Err("JWT_SECRET is required in production mode".to_string());
        }

        if self.presence_ttl_secs == 0 {
            return Err("PRESENCE_TTL_SECS must be greater than zero".to_string());
        }

        if self.presence_reap_interval_secs == 0 {
            return Err("PRESENCE_REAP_INTERVAL_SECS must be greater than zero".to_string());
        }

        if self.broadcast_capacity == 0 {
            return Err("BROADCAST_CAPACITY must be greater than zero".to_string());
        }

        if self.default_page_size == 0 {
            return Err("DEFAULT_PAGE_SIZE must be greater than zero".to_string());
        }

        Ok(())
    }
}
