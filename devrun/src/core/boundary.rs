//! Retry-boundary detection over the run event stream.
//!
//! Viewers reconstruct "what is currently true" from the append-only event
//! log. A manual retry, resume, recover or approve restarts part of the run,
//! so events older than the latest boundary describe a superseded attempt
//! and must be ignored when computing current state.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::types::{EventType, IterationStatus, RunEvent};

/// Payload key marking a RUN_STATUS event as a retry boundary.
pub const BOUNDARY_KEY: &str = "boundary";

/// Kinds of manual restart that open a new attempt window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    Retry,
    Resume,
    Recover,
    Approve,
}

impl BoundaryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BoundaryKind::Retry => "retry",
            BoundaryKind::Resume => "resume",
            BoundaryKind::Recover => "recover",
            BoundaryKind::Approve => "approve",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "retry" => Some(BoundaryKind::Retry),
            "resume" => Some(BoundaryKind::Resume),
            "recover" => Some(BoundaryKind::Recover),
            "approve" => Some(BoundaryKind::Approve),
            _ => None,
        }
    }
}

/// The boundary kind if `event` is a RUN_STATUS retry boundary.
pub fn boundary_kind(event: &RunEvent) -> Option<BoundaryKind> {
    if event.event_type != EventType::RunStatus {
        return None;
    }
    event
        .payload
        .as_ref()
        .and_then(|p| p.get(BOUNDARY_KEY))
        .and_then(Value::as_str)
        .and_then(BoundaryKind::parse)
}

/// Sequence of the most recent retry boundary, if any.
pub fn latest_boundary(events: &[RunEvent]) -> Option<u64> {
    events
        .iter()
        .rev()
        .find(|event| boundary_kind(event).is_some())
        .map(|event| event.sequence)
}

/// Events belonging to the current attempt window (boundary event included).
pub fn current_window(events: &[RunEvent]) -> &[RunEvent] {
    match latest_boundary(events) {
        Some(sequence) => {
            let start = events
                .iter()
                .position(|event| event.sequence == sequence)
                .unwrap_or(0);
            &events[start..]
        }
        None => events,
    }
}

/// Latest iteration status per iteration id within the current window.
pub fn current_iteration_statuses(events: &[RunEvent]) -> BTreeMap<String, IterationStatus> {
    let mut statuses = BTreeMap::new();
    for event in current_window(events) {
        if event.event_type != EventType::IterationStatus {
            continue;
        }
        let (Some(iteration_id), Some(payload)) = (&event.iteration_id, &event.payload) else {
            continue;
        };
        let status = payload
            .get("status")
            .cloned()
            .and_then(|s| serde_json::from_value::<IterationStatus>(s).ok());
        if let Some(status) = status {
            statuses.insert(iteration_id.clone(), status);
        }
    }
    statuses
}
