/// Configuration management for the casegate service
///
/// Handles server binding, the workflow database, the downstream
/// notification and case-record services, and next-step evaluation limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Downstream side-effect services
    pub services: ServicesConfig,
    /// Next-step evaluation
    pub next_steps: NextStepConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Workflow database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (default: "sqlite://data/casegate.db")
    pub url: String,
}

/// Notification and case-record services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Public URL of the workflow UI, used to build links in notifications
    pub base_url: String,
    /// Endpoint notifications are posted to. Unset means log only.
    pub notify_url: Option<String>,
    /// Endpoint case records are posted to. Unset means log only.
    pub case_record_url: Option<String>,
    /// Upper bound on any single downstream call
    pub timeout_secs: u64,
}

impl ServicesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Next-step catalog and evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextStepConfig {
    /// JSON file holding the next-step option catalog
    pub options_path: String,
    /// Most pending next steps evaluated per approval transition
    pub batch_limit: usize,
}

/// Default number of pending next steps evaluated per transition
pub const DEFAULT_BATCH_LIMIT: usize = 10;

/// Default timeout for downstream calls, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("CASEGATE_HOST", "0.0.0.0"),
                port: env_parsed("CASEGATE_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_or("CASEGATE_DATABASE_URL", "sqlite://data/casegate.db"),
            },
            services: ServicesConfig {
                base_url: env_or("CASEGATE_BASE_URL", "http://localhost:3000"),
                notify_url: env_optional("CASEGATE_NOTIFY_URL"),
                case_record_url: env_optional("CASEGATE_CASE_RECORD_URL"),
                timeout_secs: env_parsed("CASEGATE_SIDE_EFFECT_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS),
            },
            next_steps: NextStepConfig {
                options_path: env_or("CASEGATE_NEXT_STEP_OPTIONS", "config/next_step_options.json"),
                batch_limit: env_parsed("CASEGATE_NEXT_STEP_BATCH_LIMIT", DEFAULT_BATCH_LIMIT),
            },
        }
    }
}
