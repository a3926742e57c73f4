//! Typed payloads carried inside envelopes.
//!
//! The bus itself only sees [`serde_json::Value`] payloads; these structs
//! give the services a shared schema for the channels they exchange on.
//! Free-form payloads (e.g. the questions an LLM composes for a sibling
//! agent) stay untyped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::WorkerStatus;

/// A human message stamped by the gateway and published on `human-input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanInput {
    /// Stable conversation-partner identifier. Falls back to the
    /// WebSocket client id when the client supplies none.
    pub user_id: String,

    /// Raw message text.
    pub content: String,

    /// When the gateway accepted the message.
    pub timestamp: DateTime<Utc>,

    /// Origin of the message (e.g. `"websocket"`).
    pub source: String,
}

/// An orchestrator reply published on `chatter-output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutput {
    /// The conversation partner this reply is bound for.
    pub user_id: String,

    /// Reply text.
    pub content: String,

    /// When the reply was produced.
    pub timestamp: DateTime<Utc>,

    /// Set when the reply is an error report rather than an answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A task hand-off published on a worker's agent channel.
///
/// `command_file` is the full command document; the worker materializes
/// it verbatim to its configured scratch path before spawning the tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Task identifier, echoed in progress and outcome payloads.
    pub task_id: Uuid,

    /// The command document to write into the target repository.
    pub command_file: String,

    /// Optional scheduling hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    /// Optional human-readable duration estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,

    /// Per-task execution timeout override, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Which subprocess stream a progress chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output.
    #[default]
    Stdout,
    /// Standard error.
    Stderr,
}

/// A streamed subprocess output chunk, published on `agent:progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    /// The task the output belongs to.
    pub task_id: Uuid,

    /// Raw output chunk.
    pub output: String,

    /// Which stream produced the chunk.
    #[serde(default)]
    pub stream: OutputStream,
}

/// Terminal disposition of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// The subprocess exited successfully.
    Completed,
    /// The subprocess failed or timed out.
    Failed,
    /// The worker was busy and never started the task.
    Rejected,
}

/// Captured subprocess results attached to a completed or failed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Subprocess exit code (`-1` when killed by signal).
    pub exit_code: i32,

    /// Captured standard output (bounded).
    pub stdout: String,

    /// Captured standard error (bounded).
    pub stderr: String,
}

/// The payload of a task's terminal response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// The task this outcome ends.
    pub task_id: Uuid,

    /// Terminal disposition.
    pub status: TaskStatus,

    /// Set for rejections (e.g. `"Worker is busy"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Captured subprocess results, absent for rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,

    /// Wall-clock task duration, absent for rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A worker's periodic state announcement on `agent:status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    /// Current supervisor state.
    pub status: WorkerStatus,

    /// The task in flight, when `status = working`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Uuid>,

    /// Tasks completed since process start.
    pub completed_count: u64,

    /// Seconds since process start.
    pub uptime_seconds: u64,
}
