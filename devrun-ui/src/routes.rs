//! HTTP route handlers for the UI API.

use std::collections::BTreeMap;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use chrono::{DateTime, Utc};
use devrun::core::boundary::{current_iteration_statuses, current_window};
use devrun::core::types::{IterationStatus, RunEvent, RunStatus};
use devrun::io::store::Store;
use devrun::orchestrator::{RunSummary, summarize_run};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(get_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/events", get(get_events))
        .route("/runs/{run_id}/iteration-statuses", get(get_iteration_statuses))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunListEntry {
    pub id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub current_iteration: u32,
    pub total_iterations: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only events with a greater sequence.
    #[serde(default)]
    pub after: u64,
    /// Drop events superseded by the latest retry boundary.
    #[serde(default)]
    pub current: bool,
}

/// GET /api/runs - every run, newest first.
async fn get_runs(State(state): State<AppState>) -> Result<Json<Vec<RunListEntry>>, StatusCode> {
    load_runs(&state).map(Json)
}

/// GET /api/runs/:run_id - run summary with iterations and gate results.
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSummary>, StatusCode> {
    load_summary(&state, &run_id).map(Json)
}

/// GET /api/runs/:run_id/events?after=N&current=true - ordered run events.
async fn get_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<RunEvent>>, StatusCode> {
    load_events(&state, &run_id, &query).map(Json)
}

/// GET /api/runs/:run_id/iteration-statuses - iteration id to status, as
/// replayed from events after the latest retry boundary.
async fn get_iteration_statuses(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<BTreeMap<String, IterationStatus>>, StatusCode> {
    load_iteration_statuses(&state, &run_id).map(Json)
}

pub fn load_runs(state: &AppState) -> Result<Vec<RunListEntry>, StatusCode> {
    let store = open(state)?;
    let mut runs: Vec<RunListEntry> = store
        .list_runs()
        .map_err(internal)?
        .into_iter()
        .map(|run| RunListEntry {
            id: run.id,
            project_id: run.project_id,
            status: run.status,
            current_iteration: run.current_iteration,
            total_iterations: run.total_iterations,
            created_at: run.created_at,
        })
        .collect();
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(runs)
}

pub fn load_summary(state: &AppState, run_id: &str) -> Result<RunSummary, StatusCode> {
    let store = open(state)?;
    ensure_run(&store, run_id)?;
    summarize_run(&store, run_id).map_err(internal)
}

pub fn load_events(
    state: &AppState,
    run_id: &str,
    query: &EventsQuery,
) -> Result<Vec<RunEvent>, StatusCode> {
    let store = open(state)?;
    ensure_run(&store, run_id)?;
    let events = store.list_events_after(run_id, query.after).map_err(internal)?;
    if !query.current {
        return Ok(events);
    }
    // The boundary may predate `after`; then everything fetched is current.
    let all = store.list_events_after(run_id, 0).map_err(internal)?;
    let first_current = current_window(&all).first().map_or(0, |event| event.sequence);
    Ok(events
        .into_iter()
        .filter(|event| event.sequence >= first_current)
        .collect())
}

pub fn load_iteration_statuses(
    state: &AppState,
    run_id: &str,
) -> Result<BTreeMap<String, IterationStatus>, StatusCode> {
    let store = open(state)?;
    ensure_run(&store, run_id)?;
    let events = store.list_events_after(run_id, 0).map_err(internal)?;
    Ok(current_iteration_statuses(&events))
}

fn open(state: &AppState) -> Result<devrun::io::store::JsonStore, StatusCode> {
    state.open_store().map_err(internal)
}

fn ensure_run(store: &dyn Store, run_id: &str) -> Result<(), StatusCode> {
    let known = store.list_runs().map_err(internal)?.iter().any(|run| run.id == run_id);
    if known { Ok(()) } else { Err(StatusCode::NOT_FOUND) }
}

fn internal(err: anyhow::Error) -> StatusCode {
    warn!(error = %format!("{err:#}"), "store read failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use devrun::core::types::EventType;
    use devrun::io::store::{JsonStore, NewEvent};
    use devrun::test_support::queued_run;
    use serde_json::json;

    use super::*;

    fn seeded() -> (tempfile::TempDir, AppState) {
        let temp = tempfile::tempdir().expect("tempdir");
        let path: PathBuf = temp.path().join("state.json");
        let store = JsonStore::open(&path).expect("open");
        store.insert_run(queued_run("run-a", "proj-1")).expect("insert");
        let status = |status: &str, boundary: Option<&str>| {
            let mut payload = json!({ "status": status });
            if let Some(kind) = boundary {
                payload["boundary"] = json!(kind);
            }
            NewEvent {
                run_id: "run-a".to_string(),
                iteration_id: None,
                event_type: EventType::RunStatus,
                message: None,
                payload: Some(payload),
            }
        };
        for event in [
            status("QUEUED", None),
            status("RUNNING", None),
            status("WAITING_CHECKPOINT", None),
            status("QUEUED", Some("retry")),
            status("RUNNING", None),
        ] {
            store.append_event(event).expect("append");
        }
        (temp, AppState::new(path))
    }

    #[test]
    fn lists_runs_from_store_file() {
        let (_temp, state) = seeded();
        let runs = load_runs(&state).expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, "run-a");
        assert_eq!(runs[0].status, RunStatus::Queued);
    }

    #[test]
    fn unknown_run_is_not_found() {
        let (_temp, state) = seeded();
        assert_eq!(load_summary(&state, "nope").expect_err("missing"), StatusCode::NOT_FOUND);
        let query = EventsQuery::default();
        assert_eq!(
            load_events(&state, "nope", &query).expect_err("missing"),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn events_honor_after_and_current_window() {
        let (_temp, state) = seeded();
        let all = load_events(&state, "run-a", &EventsQuery::default()).expect("events");
        assert_eq!(all.len(), 5);

        let after = EventsQuery { after: 2, current: false };
        let seqs: Vec<u64> = load_events(&state, "run-a", &after)
            .expect("events")
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let current = EventsQuery { after: 0, current: true };
        let seqs: Vec<u64> = load_events(&state, "run-a", &current)
            .expect("events")
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn statuses_from_a_superseded_attempt_are_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let store = JsonStore::open(&path).expect("open");
        store.insert_run(queued_run("run-b", "proj-1")).expect("insert");
        let event = |iteration: Option<&str>, event_type, payload| NewEvent {
            run_id: "run-b".to_string(),
            iteration_id: iteration.map(str::to_string),
            event_type,
            message: None,
            payload: Some(payload),
        };
        for new in [
            event(Some("it-1"), EventType::IterationStatus, json!({ "status": "FAILED" })),
            event(None, EventType::RunStatus, json!({ "status": "QUEUED", "boundary": "retry" })),
            event(Some("it-2"), EventType::IterationStatus, json!({ "status": "RUNNING" })),
        ] {
            store.append_event(new).expect("append");
        }
        let state = AppState::new(path);

        let statuses = load_iteration_statuses(&state, "run-b").expect("statuses");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses.get("it-2"), Some(&IterationStatus::Running));
        assert_eq!(
            load_iteration_statuses(&state, "nope").expect_err("missing"),
            StatusCode::NOT_FOUND
        );
    }
}
