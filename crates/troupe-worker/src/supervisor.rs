//! The worker supervisor.
//!
//! Consumes task envelopes from the worker's own agent channel,
//! enforces one task at a time, materializes the command document,
//! spawns the external tool, streams both output streams as progress
//! envelopes, and publishes a terminal response on the same channel the
//! task arrived on, correlated by `in_response_to`.
//!
//! # Timeouts
//!
//! Each task carries a deadline (its own, or the configured default).
//! On expiry the subprocess gets a termination signal; if it is still
//! alive five seconds later it is killed outright.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use troupe_bus::{handler, Bus, BusError};
use troupe_types::config::WorkerConfig;
use troupe_types::envelope::{channels, Envelope, MessageType};
use troupe_types::payload::{
    OutputStream, TaskAssignment, TaskOutcome, TaskProgress, TaskResult, TaskStatus,
};
use troupe_types::worker::WorkerState;

/// Cadence of `agent:status` heartbeats.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Grace between the termination signal and the forceful kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Cap on captured output per stream in the terminal envelope.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// One agent identity, one subprocess at a time.
pub struct Supervisor {
    agent_name: String,
    channel: String,
    bus: Arc<dyn Bus>,
    state: Mutex<WorkerState>,
    repo_path: PathBuf,
    command_file: String,
    tool_bin: String,
    default_timeout: Duration,
    status_interval: Duration,
    task_done: Notify,
}

impl Supervisor {
    /// Build a supervisor for the configured agent identity.
    pub fn new(config: &WorkerConfig, bus: Arc<dyn Bus>) -> Self {
        Self {
            agent_name: config.agent_name.clone(),
            channel: channels::agent_channel(&config.agent_name),
            bus,
            state: Mutex::new(WorkerState::new()),
            repo_path: config.repo_path.clone(),
            command_file: config.command_file.clone(),
            tool_bin: config.tool_bin.clone(),
            default_timeout: config.task_timeout,
            status_interval: STATUS_INTERVAL,
            task_done: Notify::new(),
        }
    }

    /// Override the heartbeat cadence (tests use a short one).
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe the task and broadcast channels, declare readiness,
    /// and start the heartbeat loop.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), BusError> {
        let task_self = self.clone();
        self.bus
            .subscribe(
                &self.channel,
                handler(move |envelope| {
                    let this = task_self.clone();
                    async move { this.handle_task(envelope).await }
                }),
            )
            .await?;

        let broadcast_cancel = cancel.clone();
        self.bus
            .subscribe(
                channels::BROADCAST,
                handler(move |envelope| {
                    let cancel = broadcast_cancel.clone();
                    async move {
                        let command = envelope.payload.get("command").and_then(|v| v.as_str());
                        if command == Some("shutdown") {
                            info!("shutdown command received on broadcast channel");
                            cancel.cancel();
                        }
                    }
                }),
            )
            .await?;

        self.state().ready();
        self.publish_status().await;
        info!(agent = %self.agent_name, channel = %self.channel, "worker ready");

        let status_self = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(status_self.status_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => status_self.publish_status().await,
                }
            }
        });
        Ok(())
    }

    /// Validate an inbound task and either start it or reject it.
    ///
    /// Runs on the subscription dispatch path, so the busy rejection
    /// goes out immediately even while a task is executing.
    pub async fn handle_task(self: &Arc<Self>, envelope: Envelope) {
        // Our own responses echo on this channel; only tasks matter.
        if envelope.kind != MessageType::Task {
            return;
        }

        let assignment: TaskAssignment = match serde_json::from_value(envelope.payload.clone()) {
            Ok(assignment) => assignment,
            Err(e) => {
                error!(id = %envelope.id, error = %e, "invalid task payload discarded");
                return;
            }
        };

        if !self.state().begin_task(assignment.task_id) {
            warn!(task = %assignment.task_id, "task rejected, worker busy");
            self.publish_outcome(
                &envelope,
                TaskOutcome {
                    task_id: assignment.task_id,
                    status: TaskStatus::Rejected,
                    reason: Some("Worker is busy".into()),
                    result: None,
                    duration_ms: None,
                },
            )
            .await;
            return;
        }
        self.publish_status().await;

        let this = self.clone();
        tokio::spawn(async move { this.run_task(envelope, assignment).await });
    }

    async fn run_task(self: Arc<Self>, request: Envelope, assignment: TaskAssignment) {
        let task_id = assignment.task_id;
        let started = Instant::now();
        info!(task = %task_id, "task started");

        let outcome = match self.execute(&assignment).await {
            Ok(outcome) => outcome,
            Err(reason) => {
                error!(task = %task_id, error = %reason, "task failed before completion");
                TaskOutcome {
                    task_id,
                    status: TaskStatus::Failed,
                    reason: Some(reason),
                    result: None,
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                }
            }
        };

        self.publish_outcome(&request, outcome).await;
        self.state().finish_task();
        self.publish_status().await;
        self.task_done.notify_waiters();
        info!(task = %task_id, duration_ms = started.elapsed().as_millis() as u64, "task finished");
    }

    /// Write the command document, run the tool, clean up the scratch
    /// file regardless of outcome.
    async fn execute(&self, assignment: &TaskAssignment) -> Result<TaskOutcome, String> {
        let scratch = self.repo_path.join(&self.command_file);
        tokio::fs::write(&scratch, &assignment.command_file)
            .await
            .map_err(|e| format!("failed to write command file: {e}"))?;

        let result = self.run_child(assignment, &scratch).await;

        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            warn!(path = %scratch.display(), error = %e, "failed to remove command file");
        }
        result
    }

    async fn run_child(
        &self,
        assignment: &TaskAssignment,
        scratch: &Path,
    ) -> Result<TaskOutcome, String> {
        let task_id = assignment.task_id;
        let started = Instant::now();
        let deadline = assignment
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut child = Command::new(&self.tool_bin)
            .arg(scratch)
            .current_dir(&self.repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", self.tool_bin))?;

        let stdout_capture = Arc::new(Mutex::new(String::new()));
        let stderr_capture = Arc::new(Mutex::new(String::new()));
        let stdout_reader = child
            .stdout
            .take()
            .map(|out| self.spawn_reader(out, OutputStream::Stdout, task_id, stdout_capture.clone()));
        let stderr_reader = child
            .stderr
            .take()
            .map(|err| self.spawn_reader(err, OutputStream::Stderr, task_id, stderr_capture.clone()));

        let mut timed_out = false;
        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(result) => result.map_err(|e| format!("subprocess wait failed: {e}"))?,
            Err(_) => {
                timed_out = true;
                warn!(
                    task = %task_id,
                    timeout_ms = deadline.as_millis() as u64,
                    "task deadline expired, terminating subprocess"
                );
                terminate(&mut child).await?
            }
        };

        // Drain both streams before the terminal envelope so no
        // progress for this task can follow it.
        if let Some(reader) = stdout_reader {
            let _ = reader.await;
        }
        if let Some(reader) = stderr_reader {
            let _ = reader.await;
        }

        let exit_code = status.code().unwrap_or(-1);
        let success = !timed_out && status.success();
        Ok(TaskOutcome {
            task_id,
            status: if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            reason: timed_out
                .then(|| format!("task exceeded its {} ms deadline", deadline.as_millis())),
            result: Some(TaskResult {
                exit_code,
                stdout: take_capture(&stdout_capture),
                stderr: take_capture(&stderr_capture),
            }),
            duration_ms: Some(started.elapsed().as_millis() as u64),
        })
    }

    /// Pump one output stream: log each line, capture it (bounded), and
    /// publish it as a progress envelope.
    fn spawn_reader<R>(
        &self,
        reader: R,
        stream: OutputStream,
        task_id: Uuid,
        capture: Arc<Mutex<String>>,
    ) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let bus = self.bus.clone();
        let agent = self.agent_name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        match stream {
                            OutputStream::Stdout => {
                                debug!(task = %task_id, line = %line, "task output")
                            }
                            OutputStream::Stderr => {
                                warn!(task = %task_id, line = %line, "task stderr")
                            }
                        }
                        {
                            let mut buffer = capture
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                            if buffer.len() < CAPTURE_LIMIT {
                                buffer.push_str(&line);
                                buffer.push('\n');
                            }
                        }

                        let progress = TaskProgress {
                            task_id,
                            output: line,
                            stream,
                        };
                        let payload = match serde_json::to_value(&progress) {
                            Ok(payload) => payload,
                            Err(_) => continue,
                        };
                        let envelope =
                            Envelope::new(&agent, "*", MessageType::Progress, payload);
                        if let Err(e) = bus.publish(channels::AGENT_PROGRESS, &envelope).await {
                            warn!(task = %task_id, error = %e, "failed to publish progress");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(task = %task_id, error = %e, "output stream read error");
                        break;
                    }
                }
            }
        })
    }

    /// Publish the current state on `agent:status`.
    pub async fn publish_status(&self) {
        let heartbeat = self.state().heartbeat();
        let payload = match serde_json::to_value(&heartbeat) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode heartbeat");
                return;
            }
        };
        let envelope = Envelope::new(&self.agent_name, "*", MessageType::Status, payload);
        if let Err(e) = self.bus.publish(channels::AGENT_STATUS, &envelope).await {
            warn!(error = %e, "failed to publish status heartbeat");
        }
    }

    async fn publish_outcome(&self, request: &Envelope, outcome: TaskOutcome) {
        let payload = match serde_json::to_value(&outcome) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode task outcome");
                return;
            }
        };
        let envelope = Envelope::response_to(request, &self.agent_name, payload);
        if let Err(e) = self.bus.publish(&self.channel, &envelope).await {
            error!(task_request = %request.id, error = %e, "failed to publish task outcome");
        }
    }

    /// Whether a subprocess is in flight.
    pub fn is_working(&self) -> bool {
        self.state().is_working()
    }

    /// Snapshot of the supervisor state.
    pub fn snapshot(&self) -> WorkerState {
        self.state().clone()
    }

    /// Enter the shutting-down state; new tasks will be rejected.
    pub fn begin_shutdown(&self) {
        self.state().begin_shutdown();
    }

    /// Wait up to `grace` for the running task to finish naturally.
    ///
    /// Returns `true` when the supervisor is idle, `false` when the
    /// grace period expired with the task still running.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, async {
            loop {
                let notified = self.task_done.notified();
                if !self.is_working() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Announce the final offline state before exit.
    pub async fn go_offline(&self) {
        self.state().offline();
        self.publish_status().await;
    }
}

async fn terminate(child: &mut Child) -> Result<ExitStatus, String> {
    eprintln!("DEBUG terminate: sending SIGTERM");
    send_term(child);
    eprintln!("DEBUG terminate: sent, waiting up to grace");
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(result) => {
            eprintln!("DEBUG terminate: child exited within grace: {:?}", result);
            result.map_err(|e| format!("subprocess wait failed: {e}"))
        }
        Err(_) => {
            eprintln!("DEBUG terminate: grace expired, killing");
            warn!("subprocess ignored the termination signal, killing");
            child
                .kill()
                .await
                .map_err(|e| format!("failed to kill subprocess: {e}"))?;
            eprintln!("DEBUG terminate: kill() sent, waiting");
            let r = child
                .wait()
                .await
                .map_err(|e| format!("subprocess wait failed: {e}"));
            eprintln!("DEBUG terminate: wait after kill result: {:?}", r);
            r
        }
    }
}

#[cfg(unix)]
fn send_term(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "failed to send SIGTERM");
            }
        }
        None => debug!("subprocess already reaped before termination signal"),
    }
}

#[cfg(not(unix))]
fn send_term(child: &mut Child) {
    let _ = child.start_kill();
}

fn take_capture(capture: &Arc<Mutex<String>>) -> String {
    capture
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_bus::InMemoryBus;

    fn supervisor() -> Arc<Supervisor> {
        let config = WorkerConfig::from_lookup(&|name| match name {
            "AGENT_NAME" => Some("frontend".to_string()),
            "REDIS_URL" => Some("redis://unused".to_string()),
            "REPO_PATH" => Some("/tmp".to_string()),
            _ => None,
        })
        .unwrap();
        Arc::new(Supervisor::new(&config, Arc::new(InMemoryBus::new())))
    }

    #[tokio::test]
    async fn non_task_envelopes_are_ignored() {
        let sup = supervisor();
        sup.state().ready();
        let envelope = Envelope::new(
            "chatter",
            "frontend",
            MessageType::Question,
            serde_json::json!({"question": "ignored"}),
        );
        sup.handle_task(envelope).await;
        assert!(!sup.is_working());
    }

    #[tokio::test]
    async fn invalid_task_payload_is_discarded() {
        let sup = supervisor();
        sup.state().ready();
        let envelope = Envelope::new(
            "chatter",
            "frontend",
            MessageType::Task,
            serde_json::json!({"no_task_id": true}),
        );
        sup.handle_task(envelope).await;
        assert!(!sup.is_working());
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_idle() {
        let sup = supervisor();
        sup.state().ready();
        assert!(sup.wait_idle(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn shutdown_state_rejects_new_tasks() {
        let sup = supervisor();
        sup.state().ready();
        sup.begin_shutdown();
        assert!(!sup.state().begin_task(Uuid::new_v4()));
    }
}
