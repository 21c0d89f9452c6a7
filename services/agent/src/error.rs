//! Error types for the agent.

use std::path::PathBuf;
use std::process::ExitStatus;

use dt_netfault::FaultError;
use thiserror::Error;

use crate::exec::ExecError;

/// Agent errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The configured instance directory does not exist or is not a directory.
    #[error("instance directory unavailable: {path}: {detail}")]
    InstanceDirMissing { path: PathBuf, detail: String },

    /// The configured launch target does not exist.
    #[error("launch target unavailable: {path}: {detail}")]
    LaunchTargetMissing { path: PathBuf, detail: String },

    /// The instance log sink could not be opened.
    #[error("log sink {path}: {source}")]
    LogSink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP client for the controller could not be built.
    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Launching, signalling or waiting on the instance failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Start while a process is already tracked.
    #[error("instance already running: pid {pid}")]
    InstanceAlreadyRunning { pid: u32 },

    /// Stop found that the tracked process had already exited.
    #[error("instance pid {pid} already exited: {status}")]
    InstanceAlreadyExited { pid: u32, status: ExitStatus },

    /// Copying the instance directory failed.
    #[error("backup of {src} to {dest} failed: {detail}")]
    Backup {
        src: PathBuf,
        dest: PathBuf,
        detail: String,
    },

    /// Removing the instance directory failed.
    #[error("cleanup of {path} failed: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error returned by the fault provider.
    #[error(transparent)]
    Fault(#[from] FaultError),

    /// The agent has been shut down.
    #[error("agent is shutting down")]
    ShuttingDown,
}

impl AgentError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AgentError::InstanceDirMissing { .. } => "instance_dir_missing",
            AgentError::LaunchTargetMissing { .. } => "launch_target_missing",
            AgentError::LogSink { .. } => "log_sink_failed",
            AgentError::HttpClient(_) => "http_client_failed",
            AgentError::Exec(_) => "exec_failed",
            AgentError::InstanceAlreadyRunning { .. } => "instance_already_running",
            AgentError::InstanceAlreadyExited { .. } => "instance_already_exited",
            AgentError::Backup { .. } => "backup_failed",
            AgentError::Cleanup { .. } => "cleanup_failed",
            AgentError::Fault(FaultError::InvalidPort(_)) => "invalid_port",
            AgentError::Fault(_) => "fault_injection_failed",
            AgentError::ShuttingDown => "shutting_down",
        }
    }

    /// Returns true if the request conflicts with the instance's current state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AgentError::InstanceAlreadyRunning { .. }
                | AgentError::InstanceAlreadyExited { .. }
                | AgentError::ShuttingDown
        )
    }
}
