//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FIELDOPS_PARALLELISM=6                                             │
//! │     FIELDOPS_CHUNK_SIZE=500                                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fieldops/sync.toml (Linux)                               │
//! │     ~/Library/Application Support/app.fieldops.fieldops/sync.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The session (server URL, bearer token, principal) is not part of this
//! file: it comes from login and is handed to `SyncEngine::configure`.
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [engine]
//! parallelism = 4
//!
//! [push]
//! batch_size = 100
//! max_attempts = 5
//!
//! [bulk]
//! chunk_size = 200
//! min_chunk_size = 1
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//!
//! [checklists]
//! concurrency = 2
//! max_retries = 3
//! retry_delay_ms = 500
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use fieldops_core::validation::validate_page_size;
use fieldops_core::DEFAULT_PAGE_SIZE;

// =============================================================================
// Session
// =============================================================================

/// Credentials of the logged-in principal.
///
/// Created at login, dropped at logout. Never persisted by the engine.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Server base URL, e.g. `https://api.fieldops.app/v1/`.
    pub base_url: String,
    /// Bearer token.
    pub token: String,
    /// Technician or user id the device acts for.
    pub principal_id: String,
}

impl Session {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        principal_id: impl Into<String>,
    ) -> Self {
        Session {
            base_url: base_url.into(),
            token: token.into(),
            principal_id: principal_id.into(),
        }
    }

    /// Validates the base URL.
    pub fn validate(&self) -> SyncResult<()> {
        let url = url::Url::parse(&self.base_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "Server URL must start with http:// or https://, got: {}",
                self.base_url
            )));
        }
        if self.token.is_empty() {
            return Err(SyncError::InvalidConfig("token must not be empty".into()));
        }
        Ok(())
    }
}

// Keeps the token out of logs.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .field("principal_id", &self.principal_id)
            .finish()
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Entity pulls in flight at once during phase 1.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

/// Push pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSettings {
    /// Mutations fetched from the queue per drain iteration.
    #[serde(default = "default_push_batch_size")]
    pub batch_size: u32,

    /// Attempts after which a retryable mutation is left failed.
    #[serde(default = "default_push_max_attempts")]
    pub max_attempts: u32,
}

/// Pull pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullSettings {
    /// Page size for entities that do not declare one.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
}

/// Bulk writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSettings {
    /// Rows per local transaction.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Bisection stops at this size and skips the remaining rows.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
}

/// `sync_with_retry` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    #[serde(default = "default_retry_count")]
    pub max_retries: u32,

    /// Delay before the first retry; doubled before each further retry.
    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,
}

/// Checklist batch pull settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistSettings {
    /// Work orders fetched concurrently. Must stay below `engine.parallelism`.
    #[serde(default = "default_checklist_concurrency")]
    pub concurrency: usize,

    /// Attempts per work order.
    #[serde(default = "default_checklist_retries")]
    pub max_retries: u32,

    /// Linear backoff unit: attempt N waits `N * retry_delay_ms`.
    #[serde(default = "default_checklist_delay")]
    pub retry_delay_ms: u64,
}

/// Fast push settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPushSettings {
    /// A trigger within this many seconds of a completed full sync only
    /// pushes.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Per-request timeout (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Retries of transport faults and 5xx responses per request.
    #[serde(default = "default_transport_retries")]
    pub max_retries: u32,

    /// Initial backoff (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

/// Metrics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Cycles kept in history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_parallelism() -> usize {
    4
}
fn default_push_batch_size() -> u32 {
    100
}
fn default_push_max_attempts() -> u32 {
    5
}
fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}
fn default_chunk_size() -> usize {
    200
}
fn default_min_chunk_size() -> usize {
    1
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    1000
}
fn default_checklist_concurrency() -> usize {
    2
}
fn default_checklist_retries() -> u32 {
    3
}
fn default_checklist_delay() -> u64 {
    500
}
fn default_cooldown() -> u64 {
    60
}
fn default_timeout() -> u64 {
    30
}
fn default_transport_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    10_000
}
fn default_history_limit() -> usize {
    50
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            parallelism: default_parallelism(),
        }
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        PushSettings {
            batch_size: default_push_batch_size(),
            max_attempts: default_push_max_attempts(),
        }
    }
}

impl Default for PullSettings {
    fn default() -> Self {
        PullSettings {
            default_page_size: default_page_size(),
        }
    }
}

impl Default for BulkSettings {
    fn default() -> Self {
        BulkSettings {
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_retries: default_retry_count(),
            base_delay_ms: default_retry_base_delay(),
        }
    }
}

impl RetrySettings {
    /// Delay before retry `retry` (1-based): 1s, 2s, 4s, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl Default for ChecklistSettings {
    fn default() -> Self {
        ChecklistSettings {
            concurrency: default_checklist_concurrency(),
            max_retries: default_checklist_retries(),
            retry_delay_ms: default_checklist_delay(),
        }
    }
}

impl Default for FastPushSettings {
    fn default() -> Self {
        FastPushSettings {
            cooldown_secs: default_cooldown(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            timeout_secs: default_timeout(),
            max_retries: default_transport_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl TransportSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        MetricsSettings {
            history_limit: default_history_limit(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub push: PushSettings,

    #[serde(default)]
    pub pull: PullSettings,

    #[serde(default)]
    pub bulk: BulkSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub checklists: ChecklistSettings,

    #[serde(default)]
    pub fast_push: FastPushSettings,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let non_zero = [
            ("engine.parallelism", self.engine.parallelism as u64),
            ("push.batch_size", u64::from(self.push.batch_size)),
            ("push.max_attempts", u64::from(self.push.max_attempts)),
            ("bulk.chunk_size", self.bulk.chunk_size as u64),
            ("bulk.min_chunk_size", self.bulk.min_chunk_size as u64),
            ("retry.max_retries", u64::from(self.retry.max_retries)),
            ("checklists.concurrency", self.checklists.concurrency as u64),
            ("checklists.max_retries", u64::from(self.checklists.max_retries)),
            ("transport.timeout_secs", self.transport.timeout_secs),
            ("metrics.history_limit", self.metrics.history_limit as u64),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::InvalidConfig(format!(
                "{} must be greater than 0",
                name
            )));
        }

        validate_page_size(self.pull.default_page_size)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        if self.bulk.min_chunk_size > self.bulk.chunk_size {
            return Err(SyncError::InvalidConfig(
                "bulk.min_chunk_size must not exceed bulk.chunk_size".into(),
            ));
        }

        // The checklist pool runs beside the main pool, never as large
        if self.checklists.concurrency >= self.engine.parallelism {
            return Err(SyncError::InvalidConfig(format!(
                "checklists.concurrency ({}) must be smaller than engine.parallelism ({})",
                self.checklists.concurrency, self.engine.parallelism
            )));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from a key lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.parse() {
                Ok(value) => {
                    debug!(key, value = %raw, "Overriding config from environment");
                    Some(value)
                }
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparsable environment override");
                    None
                }
            }
        }

        if let Some(v) = parsed(&lookup, "FIELDOPS_PARALLELISM") {
            self.engine.parallelism = v;
        }
        if let Some(v) = parsed(&lookup, "FIELDOPS_PUSH_BATCH_SIZE") {
            self.push.batch_size = v;
        }
        if let Some(v) = parsed(&lookup, "FIELDOPS_PUSH_MAX_ATTEMPTS") {
            self.push.max_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "FIELDOPS_PAGE_SIZE") {
            self.pull.default_page_size = v;
        }
        if let Some(v) = parsed(&lookup, "FIELDOPS_CHUNK_SIZE") {
            self.bulk.chunk_size = v;
        }
        if let Some(v) = parsed(&lookup, "FIELDOPS_SYNC_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = parsed(&lookup, "FIELDOPS_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = parsed(&lookup, "FIELDOPS_CHECKLIST_CONCURRENCY") {
            self.checklists.concurrency = v;
        }
        if let Some(v) = parsed(&lookup, "FIELDOPS_FAST_PUSH_COOLDOWN_SECS") {
            self.fast_push.cooldown_secs = v;
        }
        if let Some(v) = parsed(&lookup, "FIELDOPS_REQUEST_TIMEOUT_SECS") {
            self.transport.timeout_secs = v;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("app", "fieldops", "fieldops")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }
}
