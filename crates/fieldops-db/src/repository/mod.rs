//! # Repository Module
//!
//! Database repository implementations for the sync engine.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  SyncEngine / pipelines                                                │
//! │       │                                                                 │
//! │       │  db.mutation_queue().fetch_pushable(50, cycle_start, 5)        │
//! │       ▼                                                                 │
//! │  MutationQueueRepository                                               │
//! │  ├── enqueue(&self, entity, id, op, payload)                           │
//! │  ├── mark_processing(&self, ids)  ← atomic claim                       │
//! │  └── mark_completed / mark_failed                                      │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  SQL stays in this module; callers work with domain types.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`MutationQueueRepository`](mutation_queue::MutationQueueRepository) - Local writes awaiting push
//! - [`SyncMetaRepository`](sync_meta::SyncMetaRepository) - Per-entity pull bookkeeping
//! - [`RecordRepository`](records::RecordRepository) - Per-entity record tables

pub mod mutation_queue;
pub mod records;
pub mod sync_meta;
