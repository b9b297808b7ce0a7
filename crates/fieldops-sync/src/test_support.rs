//! In-memory server and event recorder shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldops_core::records::timestamp_field;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::Session;
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncEventEmitter};
use crate::protocol::{PullRequest, PullResponse, PushRequest, PushResponse, PushResult};
use crate::transport::SyncTransport;

/// Entity name behind a conventional `sync/{entity}[/push]` endpoint.
fn entity_of(endpoint: &str) -> &str {
    endpoint
        .trim_start_matches("sync/")
        .trim_end_matches("/push")
}

/// Whether `record` changed after `since`. Records without an
/// `updated_at` only show up in full pulls.
fn changed_since(record: &Value, since: Option<DateTime<Utc>>) -> bool {
    let Some(since) = since else {
        return true;
    };
    timestamp_field(record, "updated_at", "updatedAt")
        .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .is_some_and(|t| t > since)
}

/// Rebuilds an equivalent error for every scripted call.
fn replay(err: &SyncError) -> SyncError {
    match err {
        SyncError::ServerRejection { status, message } | SyncError::ServerFault { status, message } => {
            SyncError::from_status(*status, message.clone())
        }
        SyncError::NotFound(m) => SyncError::NotFound(m.clone()),
        SyncError::Transport(m) => SyncError::Transport(m.clone()),
        SyncError::Timeout(s) => SyncError::Timeout(*s),
        SyncError::Offline => SyncError::Offline,
        SyncError::InvalidResponse(m) => SyncError::InvalidResponse(m.clone()),
        other => SyncError::Internal(other.to_string()),
    }
}

struct Failure {
    error: SyncError,
    /// `None` fails every call.
    remaining: Option<usize>,
}

impl Failure {
    fn take(&mut self) -> Option<SyncError> {
        match &mut self.remaining {
            None => Some(replay(&self.error)),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(replay(&self.error))
            }
        }
    }
}

#[derive(Default)]
struct ServerState {
    records: HashMap<String, Vec<Value>>,
    pulls: Vec<(String, PullRequest)>,
    pushes: Vec<(String, PushRequest)>,
    push_scripts: VecDeque<Vec<PushResult>>,
    pull_failures: HashMap<String, Failure>,
    push_failures: HashMap<String, Failure>,
    pull_delay: Duration,
}

/// Paged pull endpoints and a push endpoint that applies everything
/// unless told otherwise. Cursors are offsets into the `since`-filtered
/// record list.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records served by `sync/{entity}`.
    pub async fn seed(&self, entity: &str, records: Vec<Value>) {
        self.state.lock().await.records.insert(entity.to_string(), records);
    }

    /// Holds every pull request for `delay` before answering.
    pub async fn set_pull_delay(&self, delay: Duration) {
        self.state.lock().await.pull_delay = delay;
    }

    /// Fails every pull of `entity`.
    pub async fn fail_pull(&self, entity: &str, error: SyncError) {
        self.fail_pull_times(entity, error, None).await;
    }

    /// Fails the next `times` pulls of `entity` (all of them for `None`).
    pub async fn fail_pull_times(&self, entity: &str, error: SyncError, times: Option<usize>) {
        self.state.lock().await.pull_failures.insert(
            entity.to_string(),
            Failure {
                error,
                remaining: times,
            },
        );
    }

    /// Fails every push of `entity`.
    pub async fn fail_push(&self, entity: &str, error: SyncError) {
        self.state.lock().await.push_failures.insert(
            entity.to_string(),
            Failure {
                error,
                remaining: None,
            },
        );
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.pull_failures.clear();
        state.push_failures.clear();
    }

    /// Answers the next push request with exactly `results`.
    pub async fn respond_push_with(&self, results: Vec<PushResult>) {
        self.state.lock().await.push_scripts.push_back(results);
    }

    pub async fn pull_requests(&self) -> Vec<(String, PullRequest)> {
        self.state.lock().await.pulls.clone()
    }

    pub async fn push_requests(&self) -> Vec<(String, PushRequest)> {
        self.state.lock().await.pushes.clone()
    }

    pub async fn pull_count(&self, entity: &str) -> usize {
        self.state
            .lock()
            .await
            .pulls
            .iter()
            .filter(|(endpoint, _)| entity_of(endpoint) == entity)
            .count()
    }
}

#[async_trait]
impl SyncTransport for FakeServer {
    async fn pull(
        &self,
        _session: &Session,
        endpoint: &str,
        request: &PullRequest,
    ) -> SyncResult<PullResponse> {
        let delay = {
            let mut state = self.state.lock().await;
            state.pulls.push((endpoint.to_string(), request.clone()));
            state.pull_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        let entity = entity_of(endpoint);
        if let Some(err) = state.pull_failures.get_mut(entity).and_then(Failure::take) {
            return Err(err);
        }

        let records: Vec<Value> = state
            .records
            .get(entity)
            .map(|all| {
                all.iter()
                    .filter(|record| changed_since(record, request.since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let offset: usize = match &request.cursor {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| SyncError::from_status(400, format!("bad cursor {}", cursor)))?,
            None => 0,
        };
        let end = (offset + request.limit as usize).min(records.len());
        let has_more = end < records.len();

        Ok(PullResponse {
            items: records.get(offset..end).map(<[Value]>::to_vec).unwrap_or_default(),
            next_cursor: has_more.then(|| end.to_string()),
            has_more,
            total: Some(records.len() as u64),
        })
    }

    async fn push(
        &self,
        _session: &Session,
        endpoint: &str,
        request: &PushRequest,
    ) -> SyncResult<PushResponse> {
        let mut state = self.state.lock().await;
        state.pushes.push((endpoint.to_string(), request.clone()));

        if let Some(err) = state
            .push_failures
            .get_mut(entity_of(endpoint))
            .and_then(Failure::take)
        {
            return Err(err);
        }

        let results = match state.push_scripts.pop_front() {
            Some(results) => results,
            None => request
                .mutations
                .iter()
                .map(|m| PushResult::applied(m.mutation_id.clone()))
                .collect(),
        };
        Ok(PushResponse { results })
    }
}

/// Keeps every emitted event in order.
#[derive(Default)]
pub struct RecordingEmitter {
    events: StdMutex<Vec<SyncEvent>>,
}

impl RecordingEmitter {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(SyncEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl SyncEventEmitter for RecordingEmitter {
    fn emit(&self, event: SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
