//! # Error Types
//!
//! Domain-specific error types for fieldops-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fieldops-core errors (this file)                                      │
//! │  ├── CoreError        - Domain model errors (graph, parsing)           │
//! │  └── ValidationError  - Record / identifier validation failures        │
//! │                                                                         │
//! │  fieldops-db errors (separate crate)                                   │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  fieldops-sync errors (separate crate)                                 │
//! │  └── SyncError        - Transport, server, local write, config         │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → events/state          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An entity depends on itself, directly or transitively.
    ///
    /// ## When This Occurs
    /// - `quotes` depends on `work_orders` which depends on `quotes`
    /// - An entity lists itself in `depends_on`
    #[error("Dependency cycle detected involving: {entities:?}")]
    DependencyCycle { entities: Vec<String> },

    /// A stored enum value could not be parsed.
    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    /// Stored payload is not valid JSON for its entity.
    #[error("Invalid payload for {entity}: {reason}")]
    InvalidPayload { entity: String, reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised at the serialization boundary, before anything reaches the
/// mutation queue or the local store.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., invalid identifier, invalid date).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value has the wrong JSON shape.
    #[error("{field} must be {expected}")]
    WrongType { field: String, expected: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
