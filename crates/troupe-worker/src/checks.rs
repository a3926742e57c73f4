//! Startup checks.
//!
//! A supervisor declares readiness only after verifying that the
//! external tool is invocable, the target repository exists, the
//! scratch file name stays inside it, and the bus answers a liveness
//! probe. Any failure aborts startup with a precise diagnostic.

use std::path::{Component, Path, PathBuf};

use tracing::info;

use troupe_bus::Bus;
use troupe_types::config::WorkerConfig;

/// Errors that abort supervisor startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The external tool could not be invoked.
    #[error("external tool '{tool}' is not invocable: {reason}")]
    ToolNotInvocable {
        /// Configured executable.
        tool: String,
        /// What went wrong.
        reason: String,
    },

    /// The repository path does not exist or is not a directory.
    #[error("repository path does not exist or is not a directory: {0}")]
    RepoMissing(PathBuf),

    /// The scratch file name would escape the repository.
    #[error("invalid command file name '{0}': must be a relative path inside the repository")]
    CommandFileInvalid(String),

    /// The bus did not answer the liveness probe.
    #[error("bus liveness probe failed: {0}")]
    Bus(String),
}

/// Reject absolute scratch paths and `..` traversal.
fn validate_command_file(name: &str) -> Result<(), StartupError> {
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(StartupError::CommandFileInvalid(name.to_string()));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(StartupError::CommandFileInvalid(name.to_string()));
        }
    }
    Ok(())
}

/// Run every startup check in order, failing on the first problem.
pub async fn run_startup_checks(config: &WorkerConfig, bus: &dyn Bus) -> Result<(), StartupError> {
    validate_command_file(&config.command_file)?;

    if !config.repo_path.is_dir() {
        return Err(StartupError::RepoMissing(config.repo_path.clone()));
    }

    let probe = tokio::process::Command::new(&config.tool_bin)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map_err(|e| StartupError::ToolNotInvocable {
            tool: config.tool_bin.clone(),
            reason: e.to_string(),
        })?;
    if !probe.success() {
        return Err(StartupError::ToolNotInvocable {
            tool: config.tool_bin.clone(),
            reason: format!("version probe exited with {probe}"),
        });
    }

    let latency = bus
        .ping()
        .await
        .map_err(|e| StartupError::Bus(e.to_string()))?;

    info!(
        tool = %config.tool_bin,
        repo = %config.repo_path.display(),
        bus_latency_ms = latency.as_millis() as u64,
        "startup checks passed"
    );
    Ok(())
}
