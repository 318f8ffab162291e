//! Runtime configuration loaded from environment variables.
//!
//! Every knob has a typed default so the service boots with no environment
//! at all (in-memory store, anonymous connections allowed).

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_UPLOAD_DIR: &str = "./uploads";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_HISTORY_MAX_LIMIT: usize = 500;
const DEFAULT_TYPING_TTL_MS: u64 = 5_000;
const DEFAULT_TYPING_SWEEP_MS: u64 = 1_000;

/// Parse an environment variable, falling back to `default` when it is unset
/// or malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse a boolean flag. Accepts `1/true/yes/on` and `0/false/no/off`.
pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|raw| parse_bool(&raw))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Chat core settings shared by the socket handlers and HTTP routes.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Postgres URL. `None` runs the in-memory store.
    pub database_url: Option<String>,
    pub port: u16,
    pub db_max_connections: u32,
    /// Directory that receives uploaded files.
    pub upload_dir: PathBuf,
    /// Hard cap on a single uploaded file, checked before any write.
    pub max_upload_bytes: usize,
    pub history_default_limit: usize,
    pub history_max_limit: usize,
    /// How long a typing entry survives without a refresh.
    pub typing_ttl: Duration,
    pub typing_sweep_interval: Duration,
    /// Accept websocket upgrades without a ticket as anonymous connections.
    pub allow_anonymous: bool,
    /// Enables `POST /api/dev/ws-ticket` for local development.
    pub dev_auth_bypass: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            port: DEFAULT_PORT,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            history_default_limit: DEFAULT_HISTORY_LIMIT,
            history_max_limit: DEFAULT_HISTORY_MAX_LIMIT,
            typing_ttl: Duration::from_millis(DEFAULT_TYPING_TTL_MS),
            typing_sweep_interval: Duration::from_millis(DEFAULT_TYPING_SWEEP_MS),
            allow_anonymous: true,
            dev_auth_bypass: false,
        }
    }
}

impl ChatConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let upload_dir = std::env::var("CHAT_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_UPLOAD_DIR));

        Self {
            database_url,
            port: env_parse("PORT", DEFAULT_PORT),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            upload_dir,
            max_upload_bytes: env_parse("CHAT_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            history_default_limit: env_parse("CHAT_HISTORY_DEFAULT_LIMIT", DEFAULT_HISTORY_LIMIT),
            history_max_limit: env_parse("CHAT_HISTORY_MAX_LIMIT", DEFAULT_HISTORY_MAX_LIMIT),
            typing_ttl: Duration::from_millis(env_parse("CHAT_TYPING_TTL_MS", DEFAULT_TYPING_TTL_MS)),
            typing_sweep_interval: Duration::from_millis(env_parse("CHAT_TYPING_SWEEP_MS", DEFAULT_TYPING_SWEEP_MS)),
            allow_anonymous: env_bool("CHAT_ALLOW_ANONYMOUS").unwrap_or(true),
            dev_auth_bypass: env_bool("CHAT_DEV_AUTH_BYPASS").unwrap_or(false),
        }
    }

    /// Resolve a requested history size: missing → default, otherwise clamped
    /// to `1..=history_max_limit`.
    #[must_use]
    pub fn history_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.history_default_limit)
            .clamp(1, self.history_max_limit.max(1))
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
