//! # Secondary Sub-Syncs
//!
//! Work that runs after every entity pull of a full cycle, in a fixed
//! order:
//!
//! ```text
//! templates ─► checklists (per work order) ─► execution sessions
//!           ─► attachments ─► customer signatures ─► technician signatures
//! ```
//!
//! The engine only knows the [`SecondarySync`] seam. The upload and
//! download mechanics of each kind live with the collaborator.

use async_trait::async_trait;
use serde::Serialize;

use fieldops_db::Database;

use crate::config::Session;
use crate::error::SyncResult;
use crate::events::SyncEventEmitter;
use crate::network::Connectivity;

/// Kinds of secondary sub-sync, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryKind {
    Templates,
    Checklists,
    ExecutionSessions,
    Attachments,
    CustomerSignatures,
    TechnicianSignatures,
}

impl SecondaryKind {
    /// Execution order within a cycle.
    pub const ORDER: [SecondaryKind; 6] = [
        SecondaryKind::Templates,
        SecondaryKind::Checklists,
        SecondaryKind::ExecutionSessions,
        SecondaryKind::Attachments,
        SecondaryKind::CustomerSignatures,
        SecondaryKind::TechnicianSignatures,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            SecondaryKind::Templates => "templates",
            SecondaryKind::Checklists => "checklists",
            SecondaryKind::ExecutionSessions => "execution_sessions",
            SecondaryKind::Attachments => "attachments",
            SecondaryKind::CustomerSignatures => "customer_signatures",
            SecondaryKind::TechnicianSignatures => "technician_signatures",
        }
    }

    /// Position in [`ORDER`](Self::ORDER).
    pub fn position(&self) -> usize {
        Self::ORDER.iter().position(|k| k == self).unwrap_or(Self::ORDER.len())
    }
}

impl std::fmt::Display for SecondaryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a sub-sync has to work with.
pub struct SecondaryContext<'a> {
    pub db: &'a Database,
    pub session: &'a Session,
    pub connectivity: &'a Connectivity,
    pub emitter: &'a dyn SyncEventEmitter,
}

/// Tally of one sub-sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecondaryReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Units not started because the device went offline.
    pub skipped: usize,
}

/// A sub-sync run after the entity pulls.
#[async_trait]
pub trait SecondarySync: Send + Sync {
    fn kind(&self) -> SecondaryKind;

    async fn run(&self, ctx: &SecondaryContext<'_>) -> SyncResult<SecondaryReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order() {
        assert_eq!(SecondaryKind::ORDER[0], SecondaryKind::Templates);
        assert!(SecondaryKind::Checklists.position() < SecondaryKind::ExecutionSessions.position());
        assert!(
            SecondaryKind::CustomerSignatures.position()
                < SecondaryKind::TechnicianSignatures.position()
        );
        assert_eq!(SecondaryKind::Attachments.to_string(), "attachments");
    }
}
