//! Persistence for runs, iterations, gate results, agent tasks and events.
//!
//! [`Store`] is the seam the orchestrator talks to. [`JsonStore`] keeps the
//! whole state in memory behind a mutex. When opened with a path, the CLI, the
//! worker and the UI share one JSON file: every call takes an advisory lock on
//! a sibling `.lock` file, reloads the snapshot, and mutations rewrite it
//! atomically before the lock is released. Mutations validate before touching
//! state so a rejected call leaves nothing half-written.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::types::{
    AgentTaskRun, AgentTaskStatus, DevelopmentRun, EventType, IterationRun, QualityGateRun,
    RunEvent,
};

/// An event before the store assigns its sequence number and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub run_id: String,
    pub iteration_id: Option<String>,
    pub event_type: EventType,
    pub message: Option<String>,
    pub payload: Option<Value>,
}

/// Persistence interface consumed by the orchestrator.
pub trait Store: Send + Sync {
    fn insert_run(&self, run: DevelopmentRun) -> Result<()>;
    fn get_run(&self, run_id: &str) -> Result<DevelopmentRun>;
    /// Apply `apply` to the stored run in one atomic step and return the result.
    /// An error from `apply` leaves the run untouched.
    fn update_run(
        &self,
        run_id: &str,
        apply: &mut dyn FnMut(&mut DevelopmentRun) -> Result<()>,
    ) -> Result<DevelopmentRun>;
    fn list_runs(&self) -> Result<Vec<DevelopmentRun>>;

    /// Create every iteration of a run in one step. Fails if the run already has iterations.
    fn create_iterations(&self, run_id: &str, iterations: Vec<IterationRun>) -> Result<()>;
    /// Iterations ordered by index.
    fn list_iterations(&self, run_id: &str) -> Result<Vec<IterationRun>>;
    fn update_iteration(&self, iteration: &IterationRun) -> Result<()>;

    /// Insert or replace the result keyed by `(iteration_id, gate_type)`.
    fn upsert_gate(&self, gate: QualityGateRun) -> Result<()>;
    fn list_gates(&self, iteration_id: &str) -> Result<Vec<QualityGateRun>>;

    /// Record a RUNNING task; returns the assigned task id.
    fn start_agent_task(&self, task: AgentTaskRun) -> Result<String>;
    /// Close a RUNNING task. Closed tasks are immutable.
    fn close_agent_task(&self, task: &AgentTaskRun) -> Result<()>;
    fn list_agent_tasks(&self, run_id: &str) -> Result<Vec<AgentTaskRun>>;

    /// Append an event with the next per-run sequence number.
    fn append_event(&self, event: NewEvent) -> Result<RunEvent>;
    /// Events with `sequence > after`, in sequence order.
    fn list_events_after(&self, run_id: &str, after: u64) -> Result<Vec<RunEvent>>;

    fn mark_project_live(&self, project_id: &str, url: &str) -> Result<()>;
    fn project_live_url(&self, project_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoreState {
    runs: BTreeMap<String, DevelopmentRun>,
    iterations: BTreeMap<String, Vec<IterationRun>>,
    gates: Vec<QualityGateRun>,
    agent_tasks: Vec<AgentTaskRun>,
    events: BTreeMap<String, Vec<RunEvent>>,
    live_projects: BTreeMap<String, String>,
    next_task_id: u64,
}

/// In-memory store with optional JSON file persistence.
#[derive(Debug)]
pub struct JsonStore {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            path: None,
        }
    }

    /// Open a file-backed store. A missing file starts empty.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self {
            state: Mutex::new(StoreState::default()),
            path: Some(path.to_path_buf()),
        };
        // Fail early on an unreadable or corrupt file.
        store.read(|_| Ok(()))?;
        debug!(path = %path.display(), "store opened");
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.lock()?;
        let Some(path) = &self.path else {
            return f(&state);
        };
        let file_lock = open_lock_file(path)?;
        let _shared = file_lock
            .read()
            .with_context(|| format!("lock store {} for reading", path.display()))?;
        *state = load_state(path)?;
        f(&state)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.lock()?;
        let Some(path) = &self.path else {
            return f(&mut state);
        };
        let mut file_lock = open_lock_file(path)?;
        let _exclusive = file_lock
            .write()
            .with_context(|| format!("lock store {} for writing", path.display()))?;
        // Apply against what is on disk now, not what this process saw last.
        let mut fresh = load_state(path)?;
        let value = f(&mut fresh)?;
        let mut buf = serde_json::to_string_pretty(&fresh).context("serialize store")?;
        buf.push('\n');
        write_atomic(path, &buf)?;
        *state = fresh;
        Ok(value)
    }
}

/// Advisory lock guarding the store file. The data file itself is replaced by
/// rename, so the lock lives beside it.
fn open_lock_file(path: &Path) -> Result<RwLock<File>> {
    let lock_path = sibling(path, ".lock");
    if let Some(parent) = lock_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("open lock file {}", lock_path.display()))?;
    Ok(RwLock::new(file))
}

fn load_state(path: &Path) -> Result<StoreState> {
    if !path.exists() {
        return Ok(StoreState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read store {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse store {}", path.display()))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl StoreState {
    fn run_mut(&mut self, run_id: &str) -> Result<&mut DevelopmentRun> {
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow!("run {run_id} not found"))
    }

    fn ensure_run(&self, run_id: &str) -> Result<()> {
        if self.runs.contains_key(run_id) {
            Ok(())
        } else {
            Err(anyhow!("run {run_id} not found"))
        }
    }
}

impl Store for JsonStore {
    fn insert_run(&self, run: DevelopmentRun) -> Result<()> {
        self.mutate(|state| {
            if state.runs.contains_key(&run.id) {
                bail!("run {} already exists", run.id);
            }
            state.runs.insert(run.id.clone(), run);
            Ok(())
        })
    }

    fn get_run(&self, run_id: &str) -> Result<DevelopmentRun> {
        self.read(|state| {
            state
                .runs
                .get(run_id)
                .cloned()
                .ok_or_else(|| anyhow!("run {run_id} not found"))
        })
    }

    fn update_run(
        &self,
        run_id: &str,
        apply: &mut dyn FnMut(&mut DevelopmentRun) -> Result<()>,
    ) -> Result<DevelopmentRun> {
        self.mutate(|state| {
            let mut run = state.run_mut(run_id)?.clone();
            apply(&mut run)?;
            if run.id != run_id {
                bail!("run {run_id} id is immutable");
            }
            *state.run_mut(run_id)? = run.clone();
            Ok(run)
        })
    }

    fn list_runs(&self) -> Result<Vec<DevelopmentRun>> {
        self.read(|state| {
            let mut runs: Vec<_> = state.runs.values().cloned().collect();
            runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(runs)
        })
    }

    fn create_iterations(&self, run_id: &str, mut iterations: Vec<IterationRun>) -> Result<()> {
        self.mutate(|state| {
            state.ensure_run(run_id)?;
            if state.iterations.get(run_id).is_some_and(|its| !its.is_empty()) {
                bail!("run {run_id} already has iterations");
            }
            iterations.sort_by_key(|it| it.index);
            for (pos, iteration) in iterations.iter().enumerate() {
                if iteration.run_id != run_id {
                    bail!("iteration {} belongs to run {}", iteration.id, iteration.run_id);
                }
                if iteration.index as usize != pos + 1 {
                    bail!("iteration indexes must be contiguous from 1 (got {})", iteration.index);
                }
            }
            state.iterations.insert(run_id.to_string(), iterations);
            Ok(())
        })
    }

    fn list_iterations(&self, run_id: &str) -> Result<Vec<IterationRun>> {
        self.read(|state| Ok(state.iterations.get(run_id).cloned().unwrap_or_default()))
    }

    fn update_iteration(&self, iteration: &IterationRun) -> Result<()> {
        self.mutate(|state| {
            let slot = state
                .iterations
                .get_mut(&iteration.run_id)
                .and_then(|its| its.iter_mut().find(|it| it.id == iteration.id))
                .ok_or_else(|| anyhow!("iteration {} not found", iteration.id))?;
            if slot.index != iteration.index {
                bail!("iteration {} index is immutable", iteration.id);
            }
            *slot = iteration.clone();
            Ok(())
        })
    }

    fn upsert_gate(&self, gate: QualityGateRun) -> Result<()> {
        self.mutate(|state| {
            match state
                .gates
                .iter_mut()
                .find(|g| g.iteration_id == gate.iteration_id && g.gate_type == gate.gate_type)
            {
                Some(existing) => *existing = gate,
                None => state.gates.push(gate),
            }
            Ok(())
        })
    }

    fn list_gates(&self, iteration_id: &str) -> Result<Vec<QualityGateRun>> {
        self.read(|state| {
            let mut gates: Vec<_> = state
                .gates
                .iter()
                .filter(|g| g.iteration_id == iteration_id)
                .cloned()
                .collect();
            gates.sort_by_key(|g| g.gate_type);
            Ok(gates)
        })
    }

    fn start_agent_task(&self, mut task: AgentTaskRun) -> Result<String> {
        self.mutate(|state| {
            state.ensure_run(&task.run_id)?;
            if task.status != AgentTaskStatus::Running {
                bail!("agent task must start RUNNING");
            }
            state.next_task_id += 1;
            task.id = format!("task-{}", state.next_task_id);
            let id = task.id.clone();
            state.agent_tasks.push(task);
            Ok(id)
        })
    }

    fn close_agent_task(&self, task: &AgentTaskRun) -> Result<()> {
        self.mutate(|state| {
            let slot = state
                .agent_tasks
                .iter_mut()
                .find(|t| t.id == task.id)
                .ok_or_else(|| anyhow!("agent task {} not found", task.id))?;
            if slot.status != AgentTaskStatus::Running {
                bail!("agent task {} is already closed", task.id);
            }
            if task.status == AgentTaskStatus::Running {
                bail!("agent task {} must close SUCCEEDED or FAILED", task.id);
            }
            *slot = task.clone();
            Ok(())
        })
    }

    fn list_agent_tasks(&self, run_id: &str) -> Result<Vec<AgentTaskRun>> {
        self.read(|state| {
            Ok(state
                .agent_tasks
                .iter()
                .filter(|t| t.run_id == run_id)
                .cloned()
                .collect())
        })
    }

    fn append_event(&self, event: NewEvent) -> Result<RunEvent> {
        self.mutate(|state| {
            state.ensure_run(&event.run_id)?;
            let stream = state.events.entry(event.run_id.clone()).or_default();
            let sequence = stream.last().map_or(1, |last| last.sequence + 1);
            let stored = RunEvent {
                run_id: event.run_id,
                sequence,
                iteration_id: event.iteration_id,
                event_type: event.event_type,
                message: event.message,
                payload: event.payload,
                created_at: Utc::now(),
            };
            stream.push(stored.clone());
            Ok(stored)
        })
    }

    fn list_events_after(&self, run_id: &str, after: u64) -> Result<Vec<RunEvent>> {
        self.read(|state| {
            Ok(state
                .events
                .get(run_id)
                .map(|stream| {
                    stream
                        .iter()
                        .filter(|event| event.sequence > after)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn mark_project_live(&self, project_id: &str, url: &str) -> Result<()> {
        self.mutate(|state| {
            state
                .live_projects
                .insert(project_id.to_string(), url.to_string());
            Ok(())
        })
    }

    fn project_live_url(&self, project_id: &str) -> Result<Option<String>> {
        self.read(|state| Ok(state.live_projects.get(project_id).cloned()))
    }
}

/// Write `contents` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = sibling(path, ".tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        GateStatus, GateType, IterationScope, IterationStatus, PlansSnapshot, RunStatus,
    };
    use serde_json::json;

    fn run(id: &str) -> DevelopmentRun {
        DevelopmentRun {
            id: id.to_string(),
            project_id: "proj".to_string(),
            status: RunStatus::Queued,
            current_iteration: 0,
            total_iterations: 0,
            plans_snapshot: PlansSnapshot::default(),
            worker_sandbox_path: None,
            error_summary: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            canceled_at: None,
        }
    }

    fn iteration(run_id: &str, index: u32) -> IterationRun {
        IterationRun {
            id: format!("{run_id}-it{index}"),
            run_id: run_id.to_string(),
            index,
            name: format!("Iteration {index}"),
            status: IterationStatus::Pending,
            scope: IterationScope::default(),
            gherkin_path: None,
            branch_name: None,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    fn event(run_id: &str, message: &str) -> NewEvent {
        NewEvent {
            run_id: run_id.to_string(),
            iteration_id: None,
            event_type: EventType::Info,
            message: Some(message.to_string()),
            payload: None,
        }
    }

    #[test]
    fn event_sequences_are_per_run_and_gap_free() {
        let store = JsonStore::in_memory();
        store.insert_run(run("a")).expect("insert");
        store.insert_run(run("b")).expect("insert");
        for msg in ["one", "two", "three"] {
            store.append_event(event("a", msg)).expect("append");
        }
        store.append_event(event("b", "other")).expect("append");

        let a = store.list_events_after("a", 0).expect("list");
        assert_eq!(a.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        let tail = store.list_events_after("a", 2).expect("list");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message.as_deref(), Some("three"));
        assert_eq!(store.list_events_after("b", 0).expect("list")[0].sequence, 1);
    }

    #[test]
    fn iteration_creation_is_all_or_nothing() {
        let store = JsonStore::in_memory();
        store.insert_run(run("r")).expect("insert");
        let err = store
            .create_iterations("r", vec![iteration("r", 1), iteration("r", 3)])
            .expect_err("gap in indexes");
        assert!(err.to_string().contains("contiguous"));
        assert!(store.list_iterations("r").expect("list").is_empty());

        store
            .create_iterations("r", vec![iteration("r", 2), iteration("r", 1)])
            .expect("create");
        let its = store.list_iterations("r").expect("list");
        assert_eq!(its.iter().map(|i| i.index).collect::<Vec<_>>(), vec![1, 2]);
        assert!(store.create_iterations("r", vec![iteration("r", 1)]).is_err());
    }

    #[test]
    fn gates_upsert_by_iteration_and_type() {
        let store = JsonStore::in_memory();
        let mut gate = QualityGateRun {
            iteration_id: "it".to_string(),
            run_id: "r".to_string(),
            gate_type: GateType::Build,
            status: GateStatus::Failed,
            reason: Some("command_failed".to_string()),
            report: json!({}),
            duration_ms: 10,
            updated_at: Utc::now(),
        };
        store.upsert_gate(gate.clone()).expect("upsert");
        gate.status = GateStatus::Passed;
        gate.reason = None;
        store.upsert_gate(gate.clone()).expect("upsert");
        let gates = store.list_gates("it").expect("list");
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].status, GateStatus::Passed);
    }

    #[test]
    fn closed_agent_tasks_are_immutable() {
        let store = JsonStore::in_memory();
        store.insert_run(run("r")).expect("insert");
        let mut task = AgentTaskRun {
            id: String::new(),
            run_id: "r".to_string(),
            iteration_id: None,
            agent_name: "SpecAgent".to_string(),
            input_hash: "abc".to_string(),
            status: AgentTaskStatus::Running,
            output: None,
            token_usage: None,
            cost: None,
            duration_ms: None,
            error_message: None,
            error_details: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        task.id = store.start_agent_task(task.clone()).expect("start");
        assert_eq!(task.id, "task-1");
        task.status = AgentTaskStatus::Succeeded;
        store.close_agent_task(&task).expect("close");
        assert!(store.close_agent_task(&task).is_err());
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("store.json");
        {
            let store = JsonStore::open(&path).expect("open");
            store.insert_run(run("r")).expect("insert");
            store.append_event(event("r", "hello")).expect("append");
            store.mark_project_live("proj", "https://example.test").expect("live");
        }
        let reopened = JsonStore::open(&path).expect("reopen");
        assert_eq!(reopened.get_run("r").expect("run").status, RunStatus::Queued);
        assert_eq!(reopened.list_events_after("r", 0).expect("events").len(), 1);
        assert_eq!(
            reopened.project_live_url("proj").expect("live").as_deref(),
            Some("https://example.test")
        );
        reopened.append_event(event("r", "again")).expect("append");
        assert_eq!(reopened.list_events_after("r", 1).expect("events")[0].sequence, 2);
    }

    #[test]
    fn stores_sharing_a_file_see_each_others_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let worker = JsonStore::open(&path).expect("open worker");
        let cli = JsonStore::open(&path).expect("open cli");

        worker.insert_run(run("a")).expect("insert");
        worker.append_event(event("a", "worker-1")).expect("append");

        cli.insert_run(run("b")).expect("insert");
        cli.update_run("a", &mut |run| {
            run.status = RunStatus::Canceled;
            Ok(())
        })
        .expect("cancel");
        let canceled = cli.append_event(event("a", "Run canceled")).expect("append");
        assert_eq!(canceled.sequence, 2);

        assert!(worker.get_run("b").is_ok(), "runs created elsewhere are visible");
        assert_eq!(worker.get_run("a").expect("run").status, RunStatus::Canceled);
        let next = worker.append_event(event("a", "worker-2")).expect("append");
        assert_eq!(next.sequence, 3);

        let on_disk = JsonStore::open(&path).expect("reopen");
        assert_eq!(on_disk.list_runs().expect("runs").len(), 2);
        let messages: Vec<(u64, String)> = on_disk
            .list_events_after("a", 0)
            .expect("events")
            .into_iter()
            .map(|e| (e.sequence, e.message.unwrap_or_default()))
            .collect();
        assert_eq!(
            messages,
            vec![
                (1, "worker-1".to_string()),
                (2, "Run canceled".to_string()),
                (3, "worker-2".to_string()),
            ]
        );
    }

    #[test]
    fn rejected_run_update_changes_nothing() {
        let store = JsonStore::in_memory();
        store.insert_run(run("r")).expect("insert");
        let err = store
            .update_run("r", &mut |run| {
                run.current_iteration = 7;
                bail!("not allowed")
            })
            .expect_err("rejected");
        assert!(err.to_string().contains("not allowed"));
        assert_eq!(store.get_run("r").expect("run").current_iteration, 0);

        let updated = store
            .update_run("r", &mut |run| {
                run.current_iteration = 2;
                Ok(())
            })
            .expect("update");
        assert_eq!(updated.current_iteration, 2);
        assert!(store.update_run("nope", &mut |_| Ok(())).is_err());
    }

    #[test]
    fn missing_run_is_an_error() {
        let store = JsonStore::in_memory();
        assert!(store.get_run("nope").is_err());
        assert!(store.append_event(event("nope", "x")).is_err());
    }
}
