//! Worker supervisor state machine types.
//!
//! A supervisor owns exactly one [`WorkerState`]; the task-handling path
//! and the status publisher both read it, and only the transition methods
//! mutate it. The methods uphold the invariant that a current task exists
//! iff the status is `working`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::WorkerHeartbeat;

/// Lifecycle states of a worker supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerStatus {
    /// Connecting and running startup checks.
    Starting,
    /// Connected, subscribed, no task in flight.
    Idle,
    /// Executing a subprocess.
    Working,
    /// Draining after a termination signal.
    ShuttingDown,
    /// Final state announced before exit.
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Working => "working",
            WorkerStatus::ShuttingDown => "shutting-down",
            WorkerStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// The task currently being executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentTask {
    /// Task identifier.
    pub task_id: Uuid,

    /// When execution began.
    pub started_at: DateTime<Utc>,
}

/// A supervisor's single-valued state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    /// Lifecycle state.
    pub status: WorkerStatus,

    /// In-flight task; non-empty iff `status` is [`WorkerStatus::Working`].
    pub current: Option<CurrentTask>,

    /// Tasks completed since process start.
    pub completed_count: u64,

    /// Process start instant.
    pub uptime_started_at: DateTime<Utc>,
}

impl WorkerState {
    /// Fresh state in `starting`.
    pub fn new() -> Self {
        Self {
            status: WorkerStatus::Starting,
            current: None,
            completed_count: 0,
            uptime_started_at: Utc::now(),
        }
    }

    /// Startup checks passed; the supervisor is ready for tasks.
    pub fn ready(&mut self) {
        self.status = WorkerStatus::Idle;
        self.current = None;
    }

    /// Accept a task. Returns `false` without changing state when the
    /// supervisor is not idle (the caller then rejects the task).
    pub fn begin_task(&mut self, task_id: Uuid) -> bool {
        if self.status != WorkerStatus::Idle {
            return false;
        }
        self.status = WorkerStatus::Working;
        self.current = Some(CurrentTask {
            task_id,
            started_at: Utc::now(),
        });
        true
    }

    /// The subprocess exited; back to idle.
    pub fn finish_task(&mut self) {
        self.current = None;
        self.completed_count += 1;
        // A shutdown signal mid-task wins over returning to idle.
        if self.status == WorkerStatus::Working {
            self.status = WorkerStatus::Idle;
        }
    }

    /// A termination signal arrived.
    pub fn begin_shutdown(&mut self) {
        self.status = WorkerStatus::ShuttingDown;
    }

    /// The supervisor is about to exit.
    pub fn offline(&mut self) {
        self.status = WorkerStatus::Offline;
        self.current = None;
    }

    /// Whether a subprocess is in flight.
    pub fn is_working(&self) -> bool {
        self.current.is_some()
    }

    /// Seconds since process start.
    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.uptime_started_at).num_seconds().max(0) as u64
    }

    /// Snapshot for the periodic `agent:status` heartbeat.
    pub fn heartbeat(&self) -> WorkerHeartbeat {
        WorkerHeartbeat {
            status: self.status,
            current_task_id: self.current.as_ref().map(|t| t.task_id),
            completed_count: self.completed_count,
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_starting_with_no_task() {
        let state = WorkerState::new();
        assert_eq!(state.status, WorkerStatus::Starting);
        assert!(state.current.is_none());
        assert_eq!(state.completed_count, 0);
    }

    #[test]
    fn ready_transitions_to_idle() {
        let mut state = WorkerState::new();
        state.ready();
        assert_eq!(state.status, WorkerStatus::Idle);
    }

    #[test]
    fn begin_task_only_from_idle() {
        let mut state = WorkerState::new();
        let id = Uuid::new_v4();
        assert!(!state.begin_task(id), "starting must not accept tasks");

        state.ready();
        assert!(state.begin_task(id));
        assert_eq!(state.status, WorkerStatus::Working);
        assert_eq!(state.current.as_ref().unwrap().task_id, id);
    }

    #[test]
    fn second_task_rejected_while_working() {
        let mut state = WorkerState::new();
        state.ready();
        assert!(state.begin_task(Uuid::new_v4()));
        assert!(!state.begin_task(Uuid::new_v4()));
    }

    #[test]
    fn finish_task_returns_to_idle_and_counts() {
        let mut state = WorkerState::new();
        state.ready();
        state.begin_task(Uuid::new_v4());
        state.finish_task();
        assert_eq!(state.status, WorkerStatus::Idle);
        assert!(state.current.is_none());
        assert_eq!(state.completed_count, 1);
    }

    #[test]
    fn finish_during_shutdown_stays_shutting_down() {
        let mut state = WorkerState::new();
        state.ready();
        state.begin_task(Uuid::new_v4());
        state.begin_shutdown();
        state.finish_task();
        assert_eq!(state.status, WorkerStatus::ShuttingDown);
        assert!(state.current.is_none());
    }

    #[test]
    fn current_iff_working_invariant() {
        let mut state = WorkerState::new();
        state.ready();
        assert!(state.current.is_none());

        state.begin_task(Uuid::new_v4());
        assert_eq!(state.status, WorkerStatus::Working);
        assert!(state.current.is_some());

        state.finish_task();
        assert!(state.current.is_none());

        state.offline();
        assert!(state.current.is_none());
    }

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&WorkerStatus::ShuttingDown).unwrap(),
            r#""shutting-down""#
        );
    }

    #[test]
    fn heartbeat_reflects_state() {
        let mut state = WorkerState::new();
        state.ready();
        let id = Uuid::new_v4();
        state.begin_task(id);

        let hb = state.heartbeat();
        assert_eq!(hb.status, WorkerStatus::Working);
        assert_eq!(hb.current_task_id, Some(id));
        assert_eq!(hb.completed_count, 0);
    }
}
