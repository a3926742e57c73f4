//! The conversational turn loop.
//!
//! One inbound `human-input` envelope becomes one turn: the model is
//! called with the conversation, the fixed tool catalog, and the system
//! directive; tool calls execute in source order (consultations as
//! correlated bus requests, task hand-offs as fire-and-forget task
//! envelopes); the loop repeats until the model concludes, and exactly
//! one user-visible reply goes out on `chatter-output` -- an answer or
//! an apology.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use troupe_bus::{handler, Bus, BusError, RequestTracker};
use troupe_llm::{ChatModel, LlmError};
use troupe_store::{spawn_record_log, spawn_record_message, ActivityStore};
use troupe_types::activity::{ActivityRecord, LogLevel, LogRecord};
use troupe_types::config::OrchestratorConfig;
use troupe_types::envelope::{channels, Envelope, MessageType};
use troupe_types::payload::{ChatOutput, HumanInput, TaskAssignment};

use crate::catalog::{
    consult_target, format_escalation, tool_catalog, ASSIGN_TASK, CHECK_AGENT_STATUS,
    ESCALATE_TO_HUMAN, SYSTEM_PROMPT,
};
use crate::conversation::ConversationStore;
use crate::registry::StatusRegistry;

/// Sibling agents whose channels the orchestrator listens on for
/// correlated responses.
pub const SIBLING_AGENTS: &[&str] = &["planner", "researcher", "frontend", "backend", "archivist"];

/// Worker agents eligible for task assignment.
const WORKER_AGENTS: &[&str] = &["frontend", "backend"];

/// Back-pressure bound on queued human input.
const INPUT_QUEUE_CAPACITY: usize = 64;

/// Safety bound on model round-trips within one turn.
const MAX_MODEL_CALLS: u32 = 16;

/// Cadence of the tracker/conversation sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Errors that abort a turn.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The model call failed.
    #[error("model call failed: {0}")]
    Llm(#[from] LlmError),

    /// The model kept requesting tools without concluding.
    #[error("model requested tools {0} times without concluding")]
    TurnLimit(u32),
}

/// The orchestrator agent.
pub struct Orchestrator {
    agent_name: String,
    bus: Arc<dyn Bus>,
    store: Arc<dyn ActivityStore>,
    model: Arc<dyn ChatModel>,
    tracker: RequestTracker,
    conversations: ConversationStore,
    statuses: StatusRegistry,
    tool_timeout: Duration,
    task_timeout: Duration,
    idle_timeout: Duration,
}

impl Orchestrator {
    /// Assemble the orchestrator around the injected transports.
    pub fn new(
        config: &OrchestratorConfig,
        bus: Arc<dyn Bus>,
        store: Arc<dyn ActivityStore>,
        model: Arc<dyn ChatModel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_name: config.agent_name.clone(),
            bus,
            store,
            model,
            tracker: RequestTracker::new(),
            conversations: ConversationStore::new(config.history_limit),
            statuses: StatusRegistry::new(),
            tool_timeout: config.tool_timeout,
            task_timeout: config.task_timeout,
            idle_timeout: config.idle_timeout,
        })
    }

    /// Subscribe all channels, start the sweeper, and spawn the turn
    /// loop. The returned handle completes when the loop stops.
    pub async fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let (input_tx, mut input_rx) = mpsc::channel::<Envelope>(INPUT_QUEUE_CAPACITY);

        // Human input feeds the bounded turn queue; a full queue
        // back-pressures the subscription dispatcher, not the bus.
        self.bus
            .subscribe(
                channels::HUMAN_INPUT,
                handler(move |envelope| {
                    let input_tx = input_tx.clone();
                    async move {
                        if input_tx.send(envelope).await.is_err() {
                            warn!("input queue closed, dropping human input");
                        }
                    }
                }),
            )
            .await?;

        // Responses from siblings arrive on their own agent channels;
        // our outbound requests echo there too and are skipped by type.
        for agent in SIBLING_AGENTS {
            let tracker = self.tracker.clone();
            self.bus
                .subscribe(
                    &channels::agent_channel(agent),
                    handler(move |envelope| {
                        let tracker = tracker.clone();
                        async move {
                            if envelope.kind != MessageType::Response {
                                return;
                            }
                            if let Some(request_id) = envelope.in_response_to {
                                tracker.deliver(request_id, envelope.payload);
                            }
                        }
                    }),
                )
                .await?;
        }

        // Status heartbeats feed the registry behind check-agent-status.
        let statuses_self = self.clone();
        self.bus
            .subscribe(
                channels::AGENT_STATUS,
                handler(move |envelope| {
                    let this = statuses_self.clone();
                    async move {
                        this.statuses.observe(&envelope);
                    }
                }),
            )
            .await?;

        // Periodic sweep: expired tracker entries and idle conversations.
        let sweeper_self = self.clone();
        let sweeper_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = sweeper_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let swept = sweeper_self.tracker.sweep();
                        let evicted = sweeper_self
                            .conversations
                            .sweep_idle(sweeper_self.idle_timeout);
                        if swept > 0 || evicted > 0 {
                            debug!(swept, evicted, "sweep pass");
                        }
                    }
                }
            }
        });

        let turn_self = self.clone();
        let handle = tokio::spawn(async move {
            info!(agent = %turn_self.agent_name, "orchestrator ready");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    envelope = input_rx.recv() => match envelope {
                        Some(envelope) => turn_self.handle_input(envelope).await,
                        None => break,
                    },
                }
            }
            info!("orchestrator turn loop stopped");
        });
        Ok(handle)
    }

    /// Validate and run one inbound turn; failures become apologies.
    pub async fn handle_input(&self, envelope: Envelope) {
        let input: HumanInput = match serde_json::from_value(envelope.payload.clone()) {
            Ok(input) => input,
            Err(e) => {
                error!(id = %envelope.id, error = %e, "invalid human-input payload discarded");
                return;
            }
        };

        info!(user_id = %input.user_id, "handling turn");
        if let Err(e) = self.run_turn(&input, &envelope).await {
            error!(user_id = %input.user_id, error = %e, "turn failed");
            self.send_reply(&input, &envelope, format!("I encountered an error: {e}"), Some(e.to_string()))
                .await;
            spawn_record_log(
                self.store.clone(),
                LogRecord::new(
                    &self.agent_name,
                    LogLevel::Error,
                    format!("turn failed: {e}"),
                    json!({"user_id": input.user_id}),
                ),
            );
        }
    }

    async fn run_turn(&self, input: &HumanInput, request: &Envelope) -> Result<(), TurnError> {
        self.conversations.append(
            &input.user_id,
            json!({"role": "user", "content": input.content}),
        );
        let tools = tool_catalog();

        for _ in 0..MAX_MODEL_CALLS {
            let messages = self.conversations.history(&input.user_id);
            let reply = self.model.complete(SYSTEM_PROMPT, &messages, &tools).await?;

            self.conversations.append(
                &input.user_id,
                json!({"role": "assistant", "content": reply.content.clone()}),
            );

            if !reply.wants_tools() {
                self.send_reply(input, request, reply.text(), None).await;
                return Ok(());
            }

            // Execute tool calls in source order; the next model call
            // happens only once every result is collected.
            let mut results: Vec<Value> = Vec::new();
            for call in reply.tool_calls() {
                let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
                let tool_id = call.get("id").and_then(|v| v.as_str()).unwrap_or("unknown");
                let args = call.get("input").cloned().unwrap_or(Value::Null);

                debug!(tool = name, id = tool_id, "executing tool call");
                match self.execute_tool(name, &args).await {
                    Ok(text) => results.push(json!({
                        "type": "tool_result",
                        "tool_use_id": tool_id,
                        "content": text,
                    })),
                    Err(text) => {
                        warn!(tool = name, error = %text, "tool call failed");
                        results.push(json!({
                            "type": "tool_result",
                            "tool_use_id": tool_id,
                            "is_error": true,
                            "content": text,
                        }));
                    }
                }
            }
            self.conversations
                .append(&input.user_id, json!({"role": "user", "content": results}));
        }

        Err(TurnError::TurnLimit(MAX_MODEL_CALLS))
    }

    /// Dispatch one tool call. `Err` becomes an error-flagged tool
    /// result for the model to recover from.
    pub async fn execute_tool(&self, name: &str, args: &Value) -> Result<String, String> {
        if let Some(target) = consult_target(name) {
            return self.consult(target, args).await;
        }
        match name {
            ASSIGN_TASK => self.assign_task(args).await,
            CHECK_AGENT_STATUS => {
                let agent = args
                    .get("agent")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "missing required field: agent".to_string())?;
                Ok(self.statuses.describe(agent))
            }
            ESCALATE_TO_HUMAN => Ok(format_escalation(args)),
            other => Err(format!("unknown tool: {other}")),
        }
    }

    /// Issue a correlated question to a sibling agent and await its
    /// response or the per-tool deadline.
    async fn consult(&self, target: &str, args: &Value) -> Result<String, String> {
        let envelope = Envelope::new(&self.agent_name, target, MessageType::Question, args.clone());
        // Track before publishing so a fast responder cannot race us.
        let pending = self.tracker.track(envelope.id, target, self.tool_timeout);

        if let Err(e) = self
            .bus
            .publish(&channels::agent_channel(target), &envelope)
            .await
        {
            self.tracker
                .reject(envelope.id, format!("publish failed: {e}"));
            return Err(format!("could not reach {target}: {e}"));
        }
        spawn_record_message(self.store.clone(), ActivityRecord::from_envelope(&envelope));

        match pending.wait().await {
            Ok(payload) => Ok(payload.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Publish a task envelope to a worker and acknowledge immediately;
    /// completion arrives later over the bus, not within this turn.
    async fn assign_task(&self, args: &Value) -> Result<String, String> {
        let agent = args
            .get("agent")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required field: agent".to_string())?;
        if !WORKER_AGENTS.contains(&agent) {
            return Err(format!("unknown worker agent: {agent}"));
        }
        let command_file = args
            .get("command_file")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required field: command_file".to_string())?;

        let assignment = TaskAssignment {
            task_id: Uuid::new_v4(),
            command_file: command_file.to_string(),
            priority: args
                .get("priority")
                .and_then(|v| v.as_str())
                .map(String::from),
            estimated_duration: args
                .get("estimated_duration")
                .and_then(|v| v.as_str())
                .map(String::from),
            timeout_ms: Some(self.task_timeout.as_millis() as u64),
        };
        let payload = serde_json::to_value(&assignment).map_err(|e| e.to_string())?;

        let envelope = Envelope::new(&self.agent_name, agent, MessageType::Task, payload);
        self.bus
            .publish(&channels::agent_channel(agent), &envelope)
            .await
            .map_err(|e| format!("could not reach {agent}: {e}"))?;
        spawn_record_message(self.store.clone(), ActivityRecord::from_envelope(&envelope));

        Ok(format!(
            "Task {task_id} assigned to {agent}. The worker streams progress on \
             {progress} and publishes a terminal response on {channel} when it finishes.",
            task_id = assignment.task_id,
            progress = channels::AGENT_PROGRESS,
            channel = channels::agent_channel(agent),
        ))
    }

    /// Publish the user-visible reply for this turn and log it.
    async fn send_reply(
        &self,
        input: &HumanInput,
        request: &Envelope,
        content: String,
        error: Option<String>,
    ) {
        let output = ChatOutput {
            user_id: input.user_id.clone(),
            content,
            timestamp: Utc::now(),
            error,
        };
        let payload = match serde_json::to_value(&output) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode chat output");
                return;
            }
        };

        let envelope = Envelope::response_to(request, &self.agent_name, payload);
        if let Err(e) = self.bus.publish(channels::CHATTER_OUTPUT, &envelope).await {
            error!(user_id = %input.user_id, error = %e, "failed to publish reply");
            return;
        }
        spawn_record_message(self.store.clone(), ActivityRecord::from_envelope(&envelope));
    }
}
