//! # fieldops-core: Pure Domain Types for the fieldops Sync Engine
//!
//! This crate holds the domain model shared by the database layer and the
//! sync engine, as pure types and functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        fieldops Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              Business layer (screens, forms)                    │   │
//! │  │    create client ──► edit quote ──► close work order            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ enqueue(entity, op, record)            │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                fieldops-sync (SyncEngine)                       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ fieldops-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  records  │  │   graph   │  │ validation│  │   │
//! │  │   │ Mutation  │  │  Client   │  │ push order│  │ identifier│  │   │
//! │  │   │ SyncState │  │  Quote    │  │ topo sort │  │ page size │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Mutation, sync meta, sync state and result types
//! - [`records`] - Typed record union validated at the serialization boundary
//! - [`graph`] - Entity dependency graph and push ordering
//! - [`error`] - Domain error types
//! - [`validation`] - Identifier, endpoint and page size validation
//!
//! ## Example Usage
//!
//! ```rust
//! use fieldops_core::{compose_mutation_id, MutationOperation};
//!
//! let create = compose_mutation_id("client-1", MutationOperation::Create, 1);
//! let delete = compose_mutation_id("client-1", MutationOperation::Delete, 2);
//! assert_ne!(create, delete);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod graph;
pub mod records;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use graph::{sort_by_dependency_order, DependencyGraph};
pub use records::{entities, record_id, EntityRecord};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Largest page size a pull may request.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Default page size when an entity does not declare one.
pub const DEFAULT_PAGE_SIZE: u32 = 100;
