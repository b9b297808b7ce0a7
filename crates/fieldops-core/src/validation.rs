//! # Validation Module
//!
//! Validation utilities for entity registration and record schemas.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Registration (EntityConfig)                                  │
//! │  ├── Entity / table names are SQL-safe identifiers                     │
//! │  └── Page size within server limits                                    │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Serialization boundary (EntityRecord)                        │
//! │  └── Required ids and parent references                                │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── NOT NULL id                                                       │
//! │  └── CHECK (json_valid(payload))                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Table names are interpolated into SQL, so they must pass
//! [`validate_identifier`] before they reach the database layer.

use crate::error::ValidationError;
use crate::MAX_PAGE_SIZE;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum length of an entity or table identifier.
const MAX_IDENTIFIER_LEN: usize = 64;

/// Validates that a string field is present.
pub fn validate_non_empty(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates an entity or table identifier.
///
/// ## Rules
/// - Must not be empty, at most 64 characters
/// - Starts with a lowercase letter or underscore
/// - Contains only lowercase letters, digits, underscores
///
/// ## Example
/// ```rust
/// use fieldops_core::validation::validate_identifier;
///
/// assert!(validate_identifier("table", "work_orders").is_ok());
/// assert!(validate_identifier("table", "orders; DROP TABLE x").is_err());
/// ```
pub fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    validate_non_empty(field, value)?;

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_IDENTIFIER_LEN,
        });
    }

    let mut chars = value.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);

    if !first_ok || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only lowercase letters, digits and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates a pull page size.
pub fn validate_page_size(page_size: u32) -> ValidationResult<()> {
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(ValidationError::OutOfRange {
            field: "page_size".to_string(),
            min: 1,
            max: i64::from(MAX_PAGE_SIZE),
        });
    }
    Ok(())
}

/// Validates a relative endpoint path such as `sync/clients`.
pub fn validate_endpoint(field: &str, endpoint: &str) -> ValidationResult<()> {
    validate_non_empty(field, endpoint)?;

    if endpoint.chars().any(char::is_whitespace) || endpoint.contains("://") {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must be a relative path without whitespace".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("entity", "clients").is_ok());
        assert!(validate_identifier("entity", "_internal").is_ok());
        assert!(validate_identifier("table", "work_orders_v2").is_ok());

        assert!(validate_identifier("entity", "").is_err());
        assert!(validate_identifier("entity", "Clients").is_err());
        assert!(validate_identifier("entity", "2fa").is_err());
        assert!(validate_identifier("table", "a-b").is_err());
        assert!(validate_identifier("table", &"a".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_page_size() {
        assert!(validate_page_size(1).is_ok());
        assert!(validate_page_size(50).is_ok());
        assert!(validate_page_size(MAX_PAGE_SIZE).is_ok());

        assert!(validate_page_size(0).is_err());
        assert!(validate_page_size(MAX_PAGE_SIZE + 1).is_err());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("pull_endpoint", "sync/clients").is_ok());
        assert!(validate_endpoint("pull_endpoint", "").is_err());
        assert!(validate_endpoint("pull_endpoint", "sync/cli ents").is_err());
        assert!(validate_endpoint("pull_endpoint", "https://evil/x").is_err());
    }
}
