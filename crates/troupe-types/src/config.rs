//! Environment-driven service configuration.
//!
//! Each service reads its configuration once at startup. Every missing
//! required variable is collected so the abort message lists all of them
//! at once instead of failing one variable at a time.
//!
//! The `from_env` constructors delegate to `from_lookup`, which takes the
//! variable source as a closure so tests never touch process-global state.

use std::path::PathBuf;
use std::time::Duration;

use crate::envelope::channels;

/// Default scratch file name, relative to the repository path.
pub const DEFAULT_COMMAND_FILE: &str = ".claude-command.md";

/// Default external tool invoked by workers.
pub const DEFAULT_TOOL_BIN: &str = "claude";

/// Default model identifier for the LLM provider.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

const DEFAULT_GATEWAY_PORT: u16 = 8080;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 300;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 1800;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// One or more required variables are unset or empty.
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),

    /// A variable is set but cannot be parsed.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name.
        name: String,
        /// Why parsing failed.
        reason: String,
    },
}

/// Bus transport endpoint and credentials.
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Transport URL, e.g. `redis://localhost:6379`.
    pub url: String,

    /// Optional transport password.
    pub password: Option<String>,
}

/// Activity-log backend endpoint and credentials.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// REST base URL of the relational store.
    pub url: String,

    /// Service API key.
    pub api_key: String,
}

/// LLM provider credentials and model selection.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Provider API key.
    pub api_key: String,

    /// Model identifier.
    pub model: String,
}

/// Gateway service configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identity claimed on the bus.
    pub agent_name: String,

    /// HTTP listen port.
    pub port: u16,

    /// CORS allow-list (`*` allows any origin).
    pub cors_origins: Vec<String>,

    /// Bus channels forwarded to every WebSocket client.
    pub forward_channels: Vec<String>,

    /// Optional dashboard directory served at `/`.
    pub static_dir: Option<PathBuf>,

    /// Bus transport settings.
    pub bus: BusSettings,

    /// Activity-log settings; `None` disables persistence.
    pub store: Option<StoreSettings>,
}

/// Orchestrator service configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identity claimed on the bus.
    pub agent_name: String,

    /// Bus transport settings.
    pub bus: BusSettings,

    /// Activity-log settings; `None` disables persistence.
    pub store: Option<StoreSettings>,

    /// LLM provider settings.
    pub llm: LlmSettings,

    /// Maximum turns retained per conversation.
    pub history_limit: usize,

    /// Conversations idle longer than this are evicted.
    pub idle_timeout: Duration,

    /// Deadline for each agent-consultation tool call.
    pub tool_timeout: Duration,

    /// Execution timeout attached to assigned tasks.
    pub task_timeout: Duration,
}

/// Worker supervisor configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity claimed on the bus (e.g. `frontend`, `backend`).
    pub agent_name: String,

    /// Bus transport settings.
    pub bus: BusSettings,

    /// Target repository the external tool runs in.
    pub repo_path: PathBuf,

    /// Scratch file name, relative to `repo_path`.
    pub command_file: String,

    /// External tool executable name or absolute path.
    pub tool_bin: String,

    /// Default per-task execution timeout.
    pub task_timeout: Duration,
}

/// Collects required/optional variables from a lookup closure,
/// accumulating every missing name for a single error report.
struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
    missing: Vec<String>,
}

impl<'a> Env<'a> {
    fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self {
            lookup,
            missing: Vec::new(),
        }
    }

    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn required(&mut self, name: &str) -> String {
        match self.optional(name) {
            Some(value) => value,
            None => {
                self.missing.push(name.to_string());
                String::new()
            }
        }
    }

    fn or_default(&self, name: &str, default: &str) -> String {
        self.optional(name)
            .unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn secs_or(&self, name: &str, default_secs: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parse_or(name, default_secs)?))
    }

    fn finish(self) -> Result<(), ConfigError> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(self.missing))
        }
    }
}

fn bus_settings(env: &mut Env<'_>) -> BusSettings {
    BusSettings {
        url: env.required("REDIS_URL"),
        password: env.optional("REDIS_PASSWORD"),
    }
}

/// The store is optional as a pair: setting only one of the two
/// variables is a configuration mistake worth aborting on.
fn store_settings(env: &Env<'_>) -> Result<Option<StoreSettings>, ConfigError> {
    match (env.optional("ACTIVITY_STORE_URL"), env.optional("ACTIVITY_STORE_KEY")) {
        (Some(url), Some(api_key)) => Ok(Some(StoreSettings { url, api_key })),
        (None, None) => Ok(None),
        (Some(_), None) => Err(ConfigError::Invalid {
            name: "ACTIVITY_STORE_KEY".into(),
            reason: "ACTIVITY_STORE_URL is set but ACTIVITY_STORE_KEY is not".into(),
        }),
        (None, Some(_)) => Err(ConfigError::Invalid {
            name: "ACTIVITY_STORE_URL".into(),
            reason: "ACTIVITY_STORE_KEY is set but ACTIVITY_STORE_URL is not".into(),
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl GatewayConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut env = Env::new(lookup);

        let agent_name = env.or_default("AGENT_NAME", "gateway");
        let port = env.parse_or("GATEWAY_PORT", DEFAULT_GATEWAY_PORT)?;
        let cors_origins = split_list(&env.or_default("CORS_ALLOW_ORIGINS", "*"));
        let forward_channels = split_list(&env.or_default(
            "FORWARD_CHANNELS",
            &format!("{},system", channels::CHATTER_OUTPUT),
        ));
        let static_dir = env.optional("DASHBOARD_DIR").map(PathBuf::from);
        let bus = bus_settings(&mut env);
        let store = store_settings(&env)?;

        env.finish()?;
        Ok(Self {
            agent_name,
            port,
            cors_origins,
            forward_channels,
            static_dir,
            bus,
            store,
        })
    }
}

impl OrchestratorConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut env = Env::new(lookup);

        let agent_name = env.or_default("AGENT_NAME", "chatter");
        let bus = bus_settings(&mut env);
        let store = store_settings(&env)?;
        let llm = LlmSettings {
            api_key: env.required("ANTHROPIC_API_KEY"),
            model: env.or_default("ANTHROPIC_MODEL", DEFAULT_MODEL),
        };
        let history_limit = env.parse_or("HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?;
        let idle_timeout = env.secs_or("CONVERSATION_IDLE_SECS", DEFAULT_IDLE_TIMEOUT_SECS)?;
        let tool_timeout = env.secs_or("TOOL_CALL_TIMEOUT_SECS", DEFAULT_TOOL_TIMEOUT_SECS)?;
        let task_timeout = env.secs_or("TASK_TIMEOUT_SECS", DEFAULT_TASK_TIMEOUT_SECS)?;

        env.finish()?;
        Ok(Self {
            agent_name,
            bus,
            store,
            llm,
            history_limit,
            idle_timeout,
            tool_timeout,
            task_timeout,
        })
    }
}

impl WorkerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut env = Env::new(lookup);

        let agent_name = env.required("AGENT_NAME");
        let bus = bus_settings(&mut env);
        let repo_path = PathBuf::from(env.required("REPO_PATH"));
        let command_file = env.or_default("COMMAND_FILE", DEFAULT_COMMAND_FILE);
        let tool_bin = env.or_default("CLAUDE_BIN", DEFAULT_TOOL_BIN);
        let task_timeout = env.secs_or("TASK_TIMEOUT_SECS", DEFAULT_TASK_TIMEOUT_SECS)?;

        env.finish()?;
        Ok(Self {
            agent_name,
            bus,
            repo_path,
            command_file,
            tool_bin,
            task_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn gateway_defaults() {
        let env = lookup(&[("REDIS_URL", "redis://localhost:6379")]);
        let config = GatewayConfig::from_lookup(&env).unwrap();
        assert_eq!(config.agent_name, "gateway");
        assert_eq!(config.port, 8080);
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.forward_channels, vec!["chatter-output", "system"]);
        assert!(config.store.is_none());
    }

    #[test]
    fn gateway_missing_bus_url_is_listed() {
        let env = lookup(&[]);
        let err = GatewayConfig::from_lookup(&env).unwrap_err();
        match err {
            ConfigError::Missing(names) => assert_eq!(names, vec!["REDIS_URL"]),
            other => panic!("expected Missing, got: {other}"),
        }
    }

    #[test]
    fn orchestrator_collects_all_missing_names() {
        let env = lookup(&[]);
        let err = OrchestratorConfig::from_lookup(&env).unwrap_err();
        match err {
            ConfigError::Missing(names) => {
                assert!(names.contains(&"REDIS_URL".to_string()));
                assert!(names.contains(&"ANTHROPIC_API_KEY".to_string()));
            }
            other => panic!("expected Missing, got: {other}"),
        }
    }

    #[test]
    fn orchestrator_knob_defaults() {
        let env = lookup(&[
            ("REDIS_URL", "redis://localhost:6379"),
            ("ANTHROPIC_API_KEY", "sk-ant-test"),
        ]);
        let config = OrchestratorConfig::from_lookup(&env).unwrap();
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.idle_timeout, Duration::from_secs(3600));
        assert_eq!(config.tool_timeout, Duration::from_secs(300));
        assert_eq!(config.task_timeout, Duration::from_secs(1800));
        assert_eq!(config.llm.model, DEFAULT_MODEL);
    }

    #[test]
    fn worker_requires_name_and_repo() {
        let env = lookup(&[("REDIS_URL", "redis://localhost:6379")]);
        let err = WorkerConfig::from_lookup(&env).unwrap_err();
        match err {
            ConfigError::Missing(names) => {
                assert_eq!(names, vec!["AGENT_NAME", "REPO_PATH"]);
            }
            other => panic!("expected Missing, got: {other}"),
        }
    }

    #[test]
    fn worker_defaults() {
        let env = lookup(&[
            ("AGENT_NAME", "frontend"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("REPO_PATH", "/srv/repos/frontend"),
        ]);
        let config = WorkerConfig::from_lookup(&env).unwrap();
        assert_eq!(config.command_file, ".claude-command.md");
        assert_eq!(config.tool_bin, "claude");
        assert_eq!(config.task_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn invalid_number_is_a_precise_diagnostic() {
        let env = lookup(&[
            ("REDIS_URL", "redis://localhost:6379"),
            ("GATEWAY_PORT", "not-a-port"),
        ]);
        let err = GatewayConfig::from_lookup(&env).unwrap_err();
        match err {
            ConfigError::Invalid { name, .. } => assert_eq!(name, "GATEWAY_PORT"),
            other => panic!("expected Invalid, got: {other}"),
        }
    }

    #[test]
    fn half_configured_store_is_rejected() {
        let env = lookup(&[
            ("REDIS_URL", "redis://localhost:6379"),
            ("ACTIVITY_STORE_URL", "https://store.example.com"),
        ]);
        let err = GatewayConfig::from_lookup(&env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn empty_values_count_as_missing() {
        let env = lookup(&[("REDIS_URL", "")]);
        let err = GatewayConfig::from_lookup(&env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn forward_channels_list_is_split_and_trimmed() {
        let env = lookup(&[
            ("REDIS_URL", "redis://localhost:6379"),
            ("FORWARD_CHANNELS", "chatter-output, system , agent:progress"),
        ]);
        let config = GatewayConfig::from_lookup(&env).unwrap();
        assert_eq!(
            config.forward_channels,
            vec!["chatter-output", "system", "agent:progress"]
        );
    }
}
