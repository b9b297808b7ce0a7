//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Server              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Transport      │  │  ServerRejection (4xx)  │ │
//! │  │  Unregistered   │  │  Timeout        │  │  ServerFault (5xx)      │ │
//! │  │  NotConfigured  │  │  Offline        │  │  NotFound (404)         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Local storage  │  │    Payload      │  │      Retry              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  DatabaseError  │  │  InvalidPayload │  │  RetriesExhausted       │ │
//! │  │  LocalWrite     │  │  Serialization  │  │  RetryCancelled         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Handling Strategy
//! - Configuration errors are returned to the caller synchronously.
//! - Transport, timeout and 5xx errors are retryable: the transport retries
//!   them in place and the mutation queue retries them on the next cycle.
//! - 4xx rejections are terminal for the mutation they concern.
//! - Per-entity errors become a failed `EntitySyncResult`; they never abort
//!   sibling entities.

use thiserror::Error;

use fieldops_core::CoreError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration or entity registration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Operation on an entity that was never registered.
    #[error("Entity '{0}' is not registered")]
    UnregisteredEntity(String),

    /// No session configured (call `configure` first).
    #[error("Sync engine is not configured")]
    NotConfigured,

    /// Invalid server URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Network-level failure (DNS, connect, reset).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request timeout.
    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    /// Device is offline; no request was made.
    #[error("Device is offline")]
    Offline,

    // =========================================================================
    // Server Errors
    // =========================================================================
    /// The server refused the request (4xx). Never retried.
    #[error("Server rejected request ({status}): {message}")]
    ServerRejection { status: u16, message: String },

    /// The server failed to handle the request (5xx).
    #[error("Server fault ({status}): {message}")]
    ServerFault { status: u16, message: String },

    /// The resource does not exist on the server (404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server answered with a body we cannot interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// A record failed its schema at the serialization boundary.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Failed to serialize or deserialize JSON.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Local Storage Errors
    // =========================================================================
    /// Local database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A chunk write failed and could not be isolated.
    #[error("Local write failed for {entity}: {message}")]
    LocalWrite { entity: String, message: String },

    // =========================================================================
    // Retry Errors
    // =========================================================================
    /// All sync attempts failed.
    #[error("Sync failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// A backoff sleep was cancelled because connectivity dropped.
    #[error("Retry cancelled: device went offline")]
    RetryCancelled,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<fieldops_db::DbError> for SyncError {
    fn from(err: fieldops_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DependencyCycle { .. } => SyncError::InvalidConfig(err.to_string()),
            other => SyncError::InvalidPayload(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SyncError::Timeout(0);
        }
        if err.is_decode() {
            return SyncError::InvalidResponse(err.to_string());
        }
        match err.status() {
            Some(status) => SyncError::from_status(status.as_u16(), err.to_string()),
            None => SyncError::Transport(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for SyncError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        SyncError::ChannelError(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Maps an HTTP status to the matching error class.
    ///
    /// ```text
    /// 404      → NotFound
    /// 4xx      → ServerRejection (terminal)
    /// 5xx      → ServerFault (retryable)
    /// other    → Transport
    /// ```
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => SyncError::NotFound(message),
            400..=499 => SyncError::ServerRejection { status, message },
            500..=599 => SyncError::ServerFault { status, message },
            _ => SyncError::Transport(message),
        }
    }

    /// Returns true if the operation may succeed when repeated later.
    ///
    /// ## Retryable Errors
    /// - Transport failures and timeouts
    /// - 5xx server faults
    /// - Local database errors (busy, pool exhausted)
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - 4xx rejections and invalid payloads
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_)
                | SyncError::Timeout(_)
                | SyncError::Offline
                | SyncError::ServerFault { .. }
                | SyncError::DatabaseError(_)
                | SyncError::ChannelError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::UnregisteredEntity(_)
                | SyncError::NotConfigured
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
