//! # Sync Protocol Envelopes
//!
//! Request and response bodies exchanged with the server's sync endpoints.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol Messages                             │
//! │                                                                         │
//! │  PULL (per entity, paged)                                              │
//! │  ────────────────────────                                              │
//! │  DEVICE ───► GET sync/clients?limit=50&since=...&cursor=...            │
//! │  SERVER ◄─── { items: [...], nextCursor, hasMore, total }              │
//! │                                                                         │
//! │  PUSH (per entity, batched)                                            │
//! │  ──────────────────────────                                            │
//! │  DEVICE ───► POST sync/clients/push                                    │
//! │              { mutations: [{ mutationId, action, record,               │
//! │                              clientUpdatedAt }] }                      │
//! │  SERVER ◄─── { results: [{ mutationId, status, error? }] }             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! camelCase JSON. Older server builds answer pulls with `data` and
//! `cursor`; both spellings are accepted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fieldops_core::{MutationOperation, MutationQueueItem};

/// Result status meaning the server stored the mutation.
pub const STATUS_APPLIED: &str = "applied";

// =============================================================================
// Pull
// =============================================================================

/// Query of one pull page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub limit: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,

    /// Only records changed after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

impl PullRequest {
    /// First page of a cycle. The cursor is never carried over.
    pub fn first_page(limit: u32, since: Option<DateTime<Utc>>) -> Self {
        PullRequest {
            limit,
            cursor: None,
            since,
        }
    }

    /// Request for the page after `cursor`.
    pub fn next_page(&self, cursor: String) -> Self {
        PullRequest {
            limit: self.limit,
            cursor: Some(cursor),
            since: self.since,
        }
    }
}

/// One page of server records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    #[serde(default, alias = "data")]
    pub items: Vec<Value>,

    #[serde(default, alias = "cursor", alias = "next_cursor")]
    pub next_cursor: Option<String>,

    #[serde(default, alias = "has_more")]
    pub has_more: bool,

    #[serde(default)]
    pub total: Option<u64>,
}

// =============================================================================
// Push
// =============================================================================

/// One mutation as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMutation {
    /// `entityId-operation-localQueueId`
    pub mutation_id: String,
    pub action: MutationOperation,
    pub record: Value,
    pub client_updated_at: DateTime<Utc>,
}

impl PushMutation {
    /// Builds the wire form of a queued mutation with an already-validated
    /// record body.
    ///
    /// `clientUpdatedAt` is the time of the local edit (the queue row's
    /// `created_at`). The row's `updated_at` moves with every claim and
    /// failure.
    pub fn from_item(item: &MutationQueueItem, record: Value) -> Self {
        PushMutation {
            mutation_id: item.mutation_id(),
            action: item.operation,
            record,
            client_updated_at: item.created_at,
        }
    }
}

/// Batch of mutations for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub mutations: Vec<PushMutation>,
}

/// Server verdict for one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub mutation_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushResult {
    pub fn applied(mutation_id: impl Into<String>) -> Self {
        PushResult {
            mutation_id: mutation_id.into(),
            status: STATUS_APPLIED.to_string(),
            error: None,
        }
    }

    pub fn rejected(mutation_id: impl Into<String>, error: impl Into<String>) -> Self {
        PushResult {
            mutation_id: mutation_id.into(),
            status: "rejected".to_string(),
            error: Some(error.into()),
        }
    }

    pub fn is_applied(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_APPLIED)
    }
}

/// Verdicts for a push batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    #[serde(default)]
    pub results: Vec<PushResult>,
}

impl PushResponse {
    /// Indexes results by mutation id.
    pub fn by_mutation_id(&self) -> HashMap<&str, &PushResult> {
        self.results
            .iter()
            .map(|result| (result.mutation_id.as_str(), result))
            .collect()
    }
}
