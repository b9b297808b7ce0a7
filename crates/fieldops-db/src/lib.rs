//! # fieldops-db: Local Storage for the fieldops Sync Engine
//!
//! This crate provides database access for the device side of fieldops.
//! It uses SQLite for local storage with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        fieldops Data Flow                               │
//! │                                                                         │
//! │  SyncEngine (push / pull / bulk writer)                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   fieldops-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │  │   │
//! │  │   │               │    │ MutationQueue  │   │              │  │   │
//! │  │   │ SqlitePool    │◄───│ SyncMeta       │   │ 001_sync_    │  │   │
//! │  │   │ Connection    │    │ Records        │   │   schema.sql │  │   │
//! │  │   │ Management    │    │                │   │              │  │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (on device)                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Mutation queue, sync meta and record tables
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldops_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/fieldops.db")).await?;
//!
//! db.records().ensure_table("clients").await?;
//! let unsynced = db.mutation_queue().pending_count().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::mutation_queue::{MutationQueueRepository, QueueCounts};
pub use repository::records::{LocalRow, RecordRepository};
pub use repository::sync_meta::SyncMetaRepository;
