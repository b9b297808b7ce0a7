//! # Concurrency Scheduler
//!
//! Runs per-entity pulls with bounded parallelism.
//!
//! ## Phases
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Phase 1: parallel-safe entities, N workers                             │
//! │                                                                         │
//! │     worker 1 ──► next index ──► pull ──► next index ──► ...             │
//! │     worker 2 ──► next index ──► pull ──► ...                            │
//! │     worker N ──► ...                 (shared AtomicUsize index)         │
//! │                                                                         │
//! │  ─────────────── phase 1 fully resolves ───────────────                 │
//! │                                                                         │
//! │  Phase 2: sequential + unclassified entities, one at a time             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Results come back in input order whatever order they finished in. A
//! failed entity is just a failed result. Once connectivity drops, entities
//! that have not started are reported as skipped.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info};

use fieldops_core::EntitySyncResult;

use crate::registry::EntityConfig;

/// Error recorded for entities that were never started.
pub const SKIPPED_OFFLINE: &str = "Skipped: device went offline";

/// Runs `task` over `items` with at most `workers` in flight.
///
/// Each worker takes the next unclaimed index until none remain. Before an
/// item starts, `should_continue` is checked; when it returns false the item
/// gets `skip(item)` instead. The output is in input order.
pub async fn run_bounded<T, R, F, Fut, C, S>(
    items: &[T],
    workers: usize,
    should_continue: C,
    skip: S,
    task: F,
) -> Vec<R>
where
    F: Fn(&T) -> Fut,
    Fut: Future<Output = R>,
    C: Fn() -> bool,
    S: Fn(&T) -> R,
{
    if items.is_empty() {
        return Vec::new();
    }

    let next = &AtomicUsize::new(0);
    let task = &task;
    let should_continue = &should_continue;
    let skip = &skip;
    let workers = workers.clamp(1, items.len());

    let outputs = join_all((0..workers).map(|_| async move {
        let mut done = Vec::new();
        loop {
            let index = next.fetch_add(1, Ordering::SeqCst);
            let Some(item) = items.get(index) else {
                break;
            };
            let result = if should_continue() {
                task(item).await
            } else {
                skip(item)
            };
            done.push((index, result));
        }
        done
    }))
    .await;

    let mut slots: Vec<Option<R>> = items.iter().map(|_| None).collect();
    for (index, result) in outputs.into_iter().flatten() {
        slots[index] = Some(result);
    }
    slots.into_iter().flatten().collect()
}

/// Two-phase entity scheduler.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyScheduler {
    parallelism: usize,
}

impl ConcurrencyScheduler {
    pub fn new(parallelism: usize) -> Self {
        ConcurrencyScheduler {
            parallelism: parallelism.max(1),
        }
    }

    /// Pulls every entity and returns one result per entity, in input order.
    pub async fn run<F, Fut, C>(
        &self,
        entities: &[Arc<EntityConfig>],
        is_online: C,
        pull: F,
    ) -> Vec<EntitySyncResult>
    where
        F: Fn(Arc<EntityConfig>) -> Fut,
        Fut: Future<Output = EntitySyncResult>,
        C: Fn() -> bool,
    {
        let (parallel, sequential): (Vec<_>, Vec<_>) = entities
            .iter()
            .cloned()
            .enumerate()
            .partition(|(_, config)| config.concurrency.is_parallel_safe());

        info!(
            parallel = parallel.len(),
            sequential = sequential.len(),
            workers = self.parallelism,
            "Scheduling entity pulls"
        );

        let skip = |(_, config): &(usize, Arc<EntityConfig>)| {
            debug!(entity = %config.name, "Entity skipped");
            EntitySyncResult::failed(config.name.clone(), SKIPPED_OFFLINE)
        };
        let pull = &pull;
        let task = |(_, config): &(usize, Arc<EntityConfig>)| pull(config.clone());

        let phase_one = run_bounded(&parallel, self.parallelism, &is_online, skip, task).await;
        let phase_two = run_bounded(&sequential, 1, &is_online, skip, task).await;

        let mut slots: Vec<Option<EntitySyncResult>> = entities.iter().map(|_| None).collect();
        let placed = parallel
            .iter()
            .zip(phase_one)
            .chain(sequential.iter().zip(phase_two));
        for ((index, _), result) in placed {
            slots[*index] = Some(result);
        }
        slots.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_run_bounded_limits_in_flight_and_keeps_order() {
        let in_flight = &AtomicUsize::new(0);
        let peak = &AtomicUsize::new(0);
        let items: Vec<u64> = vec![30, 10, 20, 5, 25, 15];

        let results = run_bounded(
            &items,
            2,
            || true,
            |_| 0,
            |delay| {
                let delay = *delay;
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    delay * 2
                }
            },
        )
        .await;

        assert_eq!(results, vec![60, 20, 40, 10, 50, 30]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_bounded_skips_after_stop() {
        let online = &AtomicBool::new(true);
        let items = vec![1, 2, 3, 4];

        let results = run_bounded(
            &items,
            1,
            || online.load(Ordering::SeqCst),
            |n| -*n,
            |n| {
                let n = *n;
                async move {
                    if n == 2 {
                        online.store(false, Ordering::SeqCst);
                    }
                    n
                }
            },
        )
        .await;

        assert_eq!(results, vec![1, 2, -3, -4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_phase_finishes_before_sequential() {
        let entities: Vec<Arc<EntityConfig>> = vec![
            Arc::new(EntityConfig::new("templates").sequential()),
            Arc::new(EntityConfig::new("clients").parallel_safe()),
            Arc::new(EntityConfig::new("notes")),
            Arc::new(EntityConfig::new("quotes").parallel_safe()),
        ];
        let log = &Mutex::new(Vec::new());

        let results = ConcurrencyScheduler::new(4)
            .run(&entities, || true, |config| async move {
                log.lock().unwrap().push(format!("start:{}", config.name));
                tokio::time::sleep(Duration::from_millis(10)).await;
                log.lock().unwrap().push(format!("end:{}", config.name));
                EntitySyncResult::succeeded(config.name.clone())
            })
            .await;

        let names: Vec<_> = results.iter().map(|r| r.entity.as_str()).collect();
        assert_eq!(names, ["templates", "clients", "notes", "quotes"]);

        let log = log.lock().unwrap().clone();
        let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        let last_parallel_end = position("end:clients").max(position("end:quotes"));
        assert!(last_parallel_end < position("start:templates"));
        assert!(last_parallel_end < position("start:notes"));
        // Parallel-safe entities overlapped.
        assert!(position("start:quotes") < position("end:clients"));
        // Sequential entities did not.
        assert!(position("end:templates") < position("start:notes"));
    }

    #[tokio::test]
    async fn test_offline_entities_reported_as_skipped() {
        let entities = vec![
            Arc::new(EntityConfig::new("clients").parallel_safe()),
            Arc::new(EntityConfig::new("quotes").sequential()),
        ];

        let results = ConcurrencyScheduler::new(2)
            .run(&entities, || false, |config| async move {
                EntitySyncResult::succeeded(config.name.clone())
            })
            .await;

        assert!(results.iter().all(|r| !r.success));
        assert_eq!(results[1].error.as_deref(), Some(SKIPPED_OFFLINE));
    }
}
