//! Server configuration and environment handling.
//!
//! Everything tunable comes from the environment with sensible defaults:
//! `PORT`, `SQLGATE_HOME_DIR`, and `SQLGATE_NO_RESTRICTION`. The home
//! directory holds the default project's `env.yaml`, `roles.yaml`, and
//! `.tokens` files.

pub mod credentials;

use std::path::PathBuf;
use std::time::Duration;

pub use credentials::{ConnectionDescriptor, CredentialStore};

/// Environment variable naming the listen port.
pub const ENV_PORT: &str = "PORT";
/// Environment variable overriding the home directory.
pub const ENV_HOME_DIR: &str = "SQLGATE_HOME_DIR";
/// Environment variable disabling token enforcement when truthy.
pub const ENV_NO_RESTRICTION: &str = "SQLGATE_NO_RESTRICTION";
/// Environment variable exported for driver layers that pool internally.
pub const ENV_USE_POOL: &str = "USE_POOL";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 1323;

/// Runtime configuration for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port.
    pub port: u16,
    /// Directory of the default project.
    pub home_dir: PathBuf,
    /// When set, any caller gets full access without a token.
    pub no_restriction: bool,
    /// How long a long-poll request waits before answering `202`.
    pub long_poll_window: Duration,
    /// How long an untouched query survives in the registry.
    pub query_ttl: Duration,
    /// How often the janitor sweeps the query registries.
    pub janitor_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            home_dir: default_home_dir(),
            no_restriction: false,
            long_poll_window: Duration::from_secs(90),
            query_ttl: Duration::from_secs(600),
            janitor_interval: Duration::from_secs(600),
        }
    }
}

impl ServerConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything absent or unparseable.
    pub fn from_env() -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Some(port) = env_parse::<u16>(ENV_PORT) {
            config.port = port;
        }
        if let Ok(dir) = std::env::var(ENV_HOME_DIR) {
            if !dir.is_empty() {
                config.home_dir = PathBuf::from(dir);
            }
        }
        if let Ok(value) = std::env::var(ENV_NO_RESTRICTION) {
            config.no_restriction = is_truthy(&value);
        }
        config
    }
}

/// `~/.sqlgate`, or `./.sqlgate` when no home directory is known.
pub fn default_home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sqlgate")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Truthiness used by boolean environment flags.
pub fn is_truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
