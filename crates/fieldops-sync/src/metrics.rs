//! # Sync Metrics
//!
//! Telemetry for sync cycles. Nothing here affects correctness; a lost
//! sample only makes the numbers less complete.
//!
//! ## Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CycleMetrics  (id, trigger, timings, pushed/failed)                    │
//! │    └── EntityMetrics  (pages, records, errors)                          │
//! │          └── ChunkMetrics  (size, written, bisections, skipped)         │
//! │                                                                         │
//! │  current cycle ──end_cycle──► history (capped, oldest dropped)          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Samples recorded while no cycle is open are dropped.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use fieldops_core::EntitySyncResult;

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// `sync_all` called directly.
    Manual,
    /// An attempt inside `sync_with_retry`.
    Retry,
    /// `sync_entity` for a single entity.
    Targeted,
}

/// One committed (or skipped) chunk of a bulk write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChunkMetrics {
    pub size: usize,
    pub written: usize,
    pub bisections: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityMetrics {
    pub entity: String,
    pub pages: usize,
    pub records: usize,
    pub errors: Vec<String>,
    pub chunks: Vec<ChunkMetrics>,
    pub duration_ms: u64,
}

impl EntityMetrics {
    pub fn bisections(&self) -> usize {
        self.chunks.iter().map(|c| c.bisections).sum()
    }

    pub fn skipped(&self) -> usize {
        self.chunks.iter().map(|c| c.skipped).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleMetrics {
    pub id: Uuid,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub success: bool,
    pub pushed: usize,
    pub push_failed: usize,
    pub entities: Vec<EntityMetrics>,
}

impl CycleMetrics {
    fn new(trigger: SyncTrigger) -> Self {
        CycleMetrics {
            id: Uuid::new_v4(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            success: false,
            pushed: 0,
            push_failed: 0,
            entities: Vec::new(),
        }
    }

    fn entity_mut(&mut self, entity: &str) -> &mut EntityMetrics {
        let index = match self.entities.iter().position(|e| e.entity == entity) {
            Some(index) => index,
            None => {
                self.entities.push(EntityMetrics {
                    entity: entity.to_string(),
                    ..Default::default()
                });
                self.entities.len() - 1
            }
        };
        &mut self.entities[index]
    }

    /// Records written locally across all entities.
    pub fn records(&self) -> usize {
        self.entities.iter().map(|e| e.records).sum()
    }
}

/// Aggregate over the retained history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub cycles: usize,
    pub successful: usize,
    /// 0.0 ..= 1.0; 0.0 when there is no history.
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub total_records: usize,
}

#[derive(Debug, Default)]
struct MetricsInner {
    current: Option<CycleMetrics>,
    history: VecDeque<CycleMetrics>,
}

/// Collects per-cycle, per-entity and per-chunk telemetry.
#[derive(Debug)]
pub struct MetricsCollector {
    history_limit: usize,
    inner: Mutex<MetricsInner>,
}

impl MetricsCollector {
    pub fn new(history_limit: usize) -> Self {
        MetricsCollector {
            history_limit: history_limit.max(1),
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    /// Opens a cycle. An unfinished previous cycle is closed as failed.
    pub async fn begin_cycle(&self, trigger: SyncTrigger) -> Uuid {
        let mut inner = self.inner.lock().await;
        if let Some(stale) = inner.current.take() {
            Self::archive(&mut inner, stale, false, self.history_limit);
        }

        let cycle = CycleMetrics::new(trigger);
        let id = cycle.id;
        inner.current = Some(cycle);
        debug!(cycle_id = %id, ?trigger, "Metrics cycle opened");
        id
    }

    pub async fn record_push(&self, pushed: usize, failed: usize) {
        if let Some(cycle) = self.inner.lock().await.current.as_mut() {
            cycle.pushed += pushed;
            cycle.push_failed += failed;
        }
    }

    pub async fn record_page(&self, entity: &str, records: usize) {
        if let Some(cycle) = self.inner.lock().await.current.as_mut() {
            let metrics = cycle.entity_mut(entity);
            metrics.pages += 1;
            metrics.records += records;
        }
    }

    pub async fn record_chunk(&self, entity: &str, chunk: ChunkMetrics) {
        if let Some(cycle) = self.inner.lock().await.current.as_mut() {
            cycle.entity_mut(entity).chunks.push(chunk);
        }
    }

    /// Folds an entity's final result into the open cycle.
    pub async fn record_entity(&self, result: &EntitySyncResult) {
        if let Some(cycle) = self.inner.lock().await.current.as_mut() {
            let metrics = cycle.entity_mut(&result.entity);
            metrics.duration_ms = result.duration_ms;
            if let Some(error) = &result.error {
                metrics.errors.push(error.clone());
            }
        }
    }

    /// Closes the open cycle and moves it into history.
    pub async fn end_cycle(&self, success: bool) -> Option<CycleMetrics> {
        let mut inner = self.inner.lock().await;
        let cycle = inner.current.take()?;
        Some(Self::archive(&mut inner, cycle, success, self.history_limit))
    }

    fn archive(
        inner: &mut MetricsInner,
        mut cycle: CycleMetrics,
        success: bool,
        limit: usize,
    ) -> CycleMetrics {
        let now = Utc::now();
        cycle.success = success;
        cycle.finished_at = Some(now);
        cycle.duration_ms = (now - cycle.started_at).num_milliseconds().max(0) as u64;

        inner.history.push_back(cycle.clone());
        while inner.history.len() > limit {
            inner.history.pop_front();
        }
        cycle
    }

    pub async fn current(&self) -> Option<CycleMetrics> {
        self.inner.lock().await.current.clone()
    }

    /// Finished cycles, oldest first.
    pub async fn history(&self) -> Vec<CycleMetrics> {
        self.inner.lock().await.history.iter().cloned().collect()
    }

    pub async fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock().await;
        let cycles = inner.history.len();
        if cycles == 0 {
            return MetricsSummary::default();
        }

        let successful = inner.history.iter().filter(|c| c.success).count();
        let total_duration: u64 = inner.history.iter().map(|c| c.duration_ms).sum();

        MetricsSummary {
            cycles,
            successful,
            success_rate: successful as f64 / cycles as f64,
            average_duration_ms: total_duration as f64 / cycles as f64,
            total_records: inner.history.iter().map(|c| c.records()).sum(),
        }
    }

    pub async fn clear(&self) {
        *self.inner.lock().await = MetricsInner::default();
    }
}
