//! Supervisor tests against real subprocesses in a temporary repo.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use troupe_bus::{handler, Bus, InMemoryBus};
use troupe_types::config::WorkerConfig;
use troupe_types::envelope::{channels, Envelope, MessageType};
use troupe_types::payload::TaskAssignment;
use troupe_types::worker::WorkerStatus;
use troupe_worker::Supervisor;

fn write_tool(dir: &Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("tool.sh");
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

struct Harness {
    bus: Arc<InMemoryBus>,
    supervisor: Arc<Supervisor>,
    repo: TempDir,
    responses: mpsc::UnboundedReceiver<Envelope>,
    progress: mpsc::UnboundedReceiver<Envelope>,
    _tool_dir: TempDir,
    _cancel: CancellationToken,
}

async fn spawn_worker(script: &str) -> Harness {
    let repo = TempDir::new().unwrap();
    let tool_dir = TempDir::new().unwrap();
    let tool = write_tool(tool_dir.path(), script);

    let repo_path = repo.path().to_string_lossy().to_string();
    let tool_path = tool.to_string_lossy().to_string();
    let config = WorkerConfig::from_lookup(&move |name| match name {
        "AGENT_NAME" => Some("frontend".to_string()),
        "REDIS_URL" => Some("redis://unused".to_string()),
        "REPO_PATH" => Some(repo_path.clone()),
        "CLAUDE_BIN" => Some(tool_path.clone()),
        _ => None,
    })
    .unwrap();

    let bus = Arc::new(InMemoryBus::new());
    let supervisor = Arc::new(
        Supervisor::new(&config, bus.clone()).with_status_interval(Duration::from_secs(3600)),
    );
    let cancel = CancellationToken::new();
    supervisor.start(cancel.clone()).await.unwrap();

    let (response_tx, responses) = mpsc::unbounded_channel::<Envelope>();
    bus.subscribe(
        &channels::agent_channel("frontend"),
        handler(move |envelope| {
            let tx = response_tx.clone();
            async move {
                if envelope.kind == MessageType::Response {
                    let _ = tx.send(envelope);
                }
            }
        }),
    )
    .await
    .unwrap();

    let (progress_tx, progress) = mpsc::unbounded_channel::<Envelope>();
    bus.subscribe(
        channels::AGENT_PROGRESS,
        handler(move |envelope| {
            let tx = progress_tx.clone();
            async move {
                let _ = tx.send(envelope);
            }
        }),
    )
    .await
    .unwrap();

    Harness {
        bus,
        supervisor,
        repo,
        responses,
        progress,
        _tool_dir: tool_dir,
        _cancel: cancel,
    }
}

fn task_envelope(command_file: &str, timeout_ms: Option<u64>) -> Envelope {
    let assignment = TaskAssignment {
        task_id: Uuid::new_v4(),
        command_file: command_file.to_string(),
        priority: None,
        estimated_duration: None,
        timeout_ms,
    };
    Envelope::new(
        "chatter",
        "frontend",
        MessageType::Task,
        serde_json::to_value(&assignment).unwrap(),
    )
}

async fn next_response(harness: &mut Harness) -> Envelope {
    timeout(Duration::from_secs(10), harness.responses.recv())
        .await
        .expect("timed out waiting for task response")
        .expect("response channel closed")
}

async fn wait_until_working(supervisor: &Supervisor) {
    timeout(Duration::from_secs(5), async {
        while !supervisor.is_working() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker never started the task");
}

/// The terminal envelope goes out just before the idle transition, so
/// assertions on the state give the supervisor a beat to settle.
async fn wait_until_idle(supervisor: &Supervisor) {
    timeout(Duration::from_secs(5), async {
        while supervisor.snapshot().status != WorkerStatus::Idle {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker never returned to idle");
}

#[tokio::test]
async fn completed_task_streams_output_and_reports() {
    let mut harness = spawn_worker("#!/bin/sh\ncat \"$1\"\n").await;

    let request = task_envelope("# build the login page", None);
    harness
        .bus
        .publish(&channels::agent_channel("frontend"), &request)
        .await
        .unwrap();

    let response = next_response(&mut harness).await;
    assert_eq!(response.in_response_to, Some(request.id));
    assert_eq!(response.payload["status"], "completed");
    assert_eq!(response.payload["result"]["exit_code"], 0);
    assert!(response.payload["result"]["stdout"]
        .as_str()
        .unwrap()
        .contains("# build the login page"));
    assert!(response.payload["duration_ms"].as_u64().is_some());

    // The command document was streamed back line-by-line as progress.
    let progress = timeout(Duration::from_secs(5), harness.progress.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.kind, MessageType::Progress);
    assert_eq!(progress.payload["output"], "# build the login page");
    assert_eq!(progress.payload["stream"], "stdout");

    // Scratch file removed, supervisor idle again, work counted.
    assert!(!harness.repo.path().join(".claude-command.md").exists());
    wait_until_idle(&harness.supervisor).await;
    assert_eq!(harness.supervisor.snapshot().completed_count, 1);
}

#[tokio::test]
async fn busy_worker_rejects_second_task_quickly() {
    let mut harness = spawn_worker("#!/bin/sh\nsleep 2\n").await;

    let first = task_envelope("# long running job", None);
    harness
        .bus
        .publish(&channels::agent_channel("frontend"), &first)
        .await
        .unwrap();
    wait_until_working(&harness.supervisor).await;

    let second = task_envelope("# should be rejected", None);
    let sent = Instant::now();
    harness
        .bus
        .publish(&channels::agent_channel("frontend"), &second)
        .await
        .unwrap();

    let rejection = next_response(&mut harness).await;
    assert!(sent.elapsed() < Duration::from_millis(500), "rejection was slow");
    assert_eq!(rejection.in_response_to, Some(second.id));
    assert_eq!(rejection.payload["status"], "rejected");
    assert_eq!(rejection.payload["reason"], "Worker is busy");

    // The first task is unaffected and completes.
    let completion = next_response(&mut harness).await;
    assert_eq!(completion.in_response_to, Some(first.id));
    assert_eq!(completion.payload["status"], "completed");
}

#[tokio::test]
async fn failed_task_captures_stderr_and_exit_code() {
    let mut harness = spawn_worker("#!/bin/sh\necho boom >&2\nexit 3\n").await;

    let request = task_envelope("# doomed", None);
    harness
        .bus
        .publish(&channels::agent_channel("frontend"), &request)
        .await
        .unwrap();

    let response = next_response(&mut harness).await;
    assert_eq!(response.payload["status"], "failed");
    assert_eq!(response.payload["result"]["exit_code"], 3);
    assert!(response.payload["result"]["stderr"]
        .as_str()
        .unwrap()
        .contains("boom"));

    // Stderr lines are progress envelopes marked as such.
    let progress = timeout(Duration::from_secs(5), harness.progress.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.payload["stream"], "stderr");
    assert_eq!(progress.payload["output"], "boom");
}

#[tokio::test]
async fn deadline_expiry_terminates_the_subprocess() {
    let mut harness = spawn_worker("#!/bin/sh\nsleep 30\n").await;

    let request = task_envelope("# never finishes", Some(500));
    let started = Instant::now();
    harness
        .bus
        .publish(&channels::agent_channel("frontend"), &request)
        .await
        .unwrap();

    let response = next_response(&mut harness).await;
    assert!(started.elapsed() < Duration::from_secs(8), "kill escalation too slow");
    assert_eq!(response.payload["status"], "failed");
    assert!(response.payload["reason"]
        .as_str()
        .unwrap()
        .contains("deadline"));
    wait_until_idle(&harness.supervisor).await;
}

#[tokio::test]
async fn invalid_task_is_discarded_without_response() {
    let mut harness = spawn_worker("#!/bin/sh\nexit 0\n").await;

    let envelope = Envelope::new(
        "chatter",
        "frontend",
        MessageType::Task,
        json!({"command_file_missing": true}),
    );
    harness
        .bus
        .publish(&channels::agent_channel("frontend"), &envelope)
        .await
        .unwrap();

    let result = timeout(Duration::from_millis(300), harness.responses.recv()).await;
    assert!(result.is_err(), "invalid task must elicit no response");
    assert!(!harness.supervisor.is_working());
}

#[tokio::test]
async fn graceful_shutdown_lets_the_task_finish() {
    let mut harness = spawn_worker("#!/bin/sh\nsleep 1\n").await;

    let request = task_envelope("# finishing up", None);
    harness
        .bus
        .publish(&channels::agent_channel("frontend"), &request)
        .await
        .unwrap();
    wait_until_working(&harness.supervisor).await;

    harness.supervisor.begin_shutdown();
    assert!(
        harness.supervisor.wait_idle(Duration::from_secs(10)).await,
        "task should finish within the grace period"
    );

    // The terminal envelope went out before we went offline.
    let completion = next_response(&mut harness).await;
    assert_eq!(completion.in_response_to, Some(request.id));
    assert_eq!(completion.payload["status"], "completed");

    harness.supervisor.go_offline().await;
    assert_eq!(harness.supervisor.snapshot().status, WorkerStatus::Offline);
}

#[tokio::test]
async fn status_heartbeats_reflect_lifecycle() {
    let repo = TempDir::new().unwrap();
    let tool_dir = TempDir::new().unwrap();
    let tool = write_tool(tool_dir.path(), "#!/bin/sh\nexit 0\n");

    let repo_path = repo.path().to_string_lossy().to_string();
    let tool_path = tool.to_string_lossy().to_string();
    let config = WorkerConfig::from_lookup(&move |name| match name {
        "AGENT_NAME" => Some("backend".to_string()),
        "REDIS_URL" => Some("redis://unused".to_string()),
        "REPO_PATH" => Some(repo_path.clone()),
        "CLAUDE_BIN" => Some(tool_path.clone()),
        _ => None,
    })
    .unwrap();

    let bus = Arc::new(InMemoryBus::new());
    let (status_tx, mut statuses) = mpsc::unbounded_channel::<Envelope>();
    bus.subscribe(
        channels::AGENT_STATUS,
        handler(move |envelope| {
            let tx = status_tx.clone();
            async move {
                let _ = tx.send(envelope);
            }
        }),
    )
    .await
    .unwrap();

    let supervisor = Arc::new(
        Supervisor::new(&config, bus.clone()).with_status_interval(Duration::from_millis(100)),
    );
    let cancel = CancellationToken::new();
    supervisor.start(cancel.clone()).await.unwrap();

    // Readiness announcement plus at least two periodic heartbeats.
    let first = timeout(Duration::from_secs(2), statuses.recv()).await.unwrap().unwrap();
    assert_eq!(first.from, "backend");
    assert_eq!(first.payload["status"], "idle");
    let _second = timeout(Duration::from_secs(2), statuses.recv()).await.unwrap().unwrap();
    let third = timeout(Duration::from_secs(2), statuses.recv()).await.unwrap().unwrap();
    assert_eq!(third.kind, MessageType::Status);
    assert!(third.payload["uptime_seconds"].as_u64().is_some());

    cancel.cancel();
}
