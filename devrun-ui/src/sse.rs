//! Server-Sent Events stream and store file watcher.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use devrun::core::types::RunStatus;
use devrun::io::store::{JsonStore, Store};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

/// Per-run view used to detect changes between two reads of the store.
pub type Snapshot = BTreeMap<String, (RunStatus, u64)>;

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SsePayload {
    #[serde(rename = "type")]
    event_type: &'static str,
    run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_sequence: Option<u64>,
}

impl From<&ChangeEvent> for SsePayload {
    fn from(event: &ChangeEvent) -> Self {
        match event {
            ChangeEvent::RunCreated { run_id } => SsePayload {
                event_type: "run_created",
                run_id: run_id.clone(),
                status: None,
                latest_sequence: None,
            },
            ChangeEvent::RunUpdated {
                run_id,
                status,
                latest_sequence,
            } => SsePayload {
                event_type: "run_updated",
                run_id: run_id.clone(),
                status: Some(*status),
                latest_sequence: Some(*latest_sequence),
            },
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    let payload = SsePayload::from(&change_event);
                    if let Ok(json) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the store watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(250)),
    )?;

    // The store is replaced by rename, so watch the directory, not the file.
    let watch_dir = state.watch_dir().to_path_buf();
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    info!(path = %watch_dir.display(), "watching store directory");

    let mut known = read_snapshot(&state).unwrap_or_default();
    let mut dirty = false;
    let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                dirty |= touches_store(&state, &event);
            }
            _ = flush_tick.tick() => {
                if !dirty {
                    continue;
                }
                dirty = false;
                match read_snapshot(&state) {
                    Ok(current) => {
                        for change in diff_snapshots(&known, &current) {
                            debug!(?change, "broadcasting run change");
                            let _ = state.event_tx.send(change);
                        }
                        known = current;
                    }
                    // A torn read is retried on the next write.
                    Err(e) => warn!(error = %format!("{e:#}"), "store reload failed"),
                }
            }
        }
    }
}

fn touches_store(state: &AppState, event: &NotifyEvent) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    let Some(name) = state.state_path.file_name() else {
        return false;
    };
    event.paths.iter().any(|path| path.file_name() == Some(name))
}

fn read_snapshot(state: &AppState) -> anyhow::Result<Snapshot> {
    snapshot(&state.open_store()?)
}

pub fn snapshot(store: &JsonStore) -> anyhow::Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    for run in store.list_runs()? {
        let latest = store
            .list_events_after(&run.id, 0)?
            .last()
            .map_or(0, |event| event.sequence);
        snapshot.insert(run.id, (run.status, latest));
    }
    Ok(snapshot)
}

/// Changes between two snapshots, in run id order. A new run yields a
/// creation followed by its current state.
pub fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> Vec<ChangeEvent> {
    let mut changes = Vec::new();
    for (run_id, &(status, latest_sequence)) in current {
        match previous.get(run_id) {
            Some(&before) if before == (status, latest_sequence) => continue,
            Some(_) => {}
            None => changes.push(ChangeEvent::RunCreated {
                run_id: run_id.clone(),
            }),
        }
        changes.push(ChangeEvent::RunUpdated {
            run_id: run_id.clone(),
            status,
            latest_sequence,
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use devrun::test_support::queued_run;

    use super::*;

    fn snap(entries: &[(&str, RunStatus, u64)]) -> Snapshot {
        entries
            .iter()
            .map(|(id, status, seq)| (id.to_string(), (*status, *seq)))
            .collect()
    }

    #[test]
    fn new_run_emits_created_then_updated() {
        let changes = diff_snapshots(&Snapshot::new(), &snap(&[("run-a", RunStatus::Queued, 1)]));
        assert_eq!(
            changes,
            vec![
                ChangeEvent::RunCreated {
                    run_id: "run-a".to_string()
                },
                ChangeEvent::RunUpdated {
                    run_id: "run-a".to_string(),
                    status: RunStatus::Queued,
                    latest_sequence: 1,
                },
            ]
        );
    }

    #[test]
    fn only_changed_runs_are_reported() {
        let before = snap(&[
            ("run-a", RunStatus::Running, 4),
            ("run-b", RunStatus::Queued, 1),
        ]);
        let after = snap(&[
            ("run-a", RunStatus::Running, 6),
            ("run-b", RunStatus::Queued, 1),
        ]);
        assert_eq!(
            diff_snapshots(&before, &after),
            vec![ChangeEvent::RunUpdated {
                run_id: "run-a".to_string(),
                status: RunStatus::Running,
                latest_sequence: 6,
            }]
        );
        assert!(diff_snapshots(&after, &after).is_empty());
    }

    #[test]
    fn snapshot_reads_status_and_latest_sequence() {
        let store = JsonStore::in_memory();
        store.insert_run(queued_run("run-a", "proj-1")).expect("insert");
        assert_eq!(
            snapshot(&store).expect("snapshot"),
            snap(&[("run-a", RunStatus::Queued, 0)])
        );
    }

    #[test]
    fn watcher_ignores_unrelated_files() {
        let state = AppState::new(PathBuf::from("/tmp/devrun-ui/state.json"));
        let event = |name: &str| NotifyEvent {
            kind: EventKind::Modify(notify::event::ModifyKind::Any),
            paths: vec![PathBuf::from("/tmp/devrun-ui").join(name)],
            attrs: Default::default(),
        };
        assert!(touches_store(&state, &event("state.json")));
        assert!(!touches_store(&state, &event("notes.txt")));
    }

    #[test]
    fn payload_is_camel_case() {
        let payload = SsePayload::from(&ChangeEvent::RunUpdated {
            run_id: "run-a".to_string(),
            status: RunStatus::WaitingCheckpoint,
            latest_sequence: 9,
        });
        let json = serde_json::to_value(&payload).expect("json");
        assert_eq!(
            json,
            serde_json::json!({
                "type": "run_updated",
                "runId": "run-a",
                "status": "WAITING_CHECKPOINT",
                "latestSequence": 9,
            })
        );
    }
}
