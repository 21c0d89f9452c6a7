//! Lifecycle controller for the managed instance.
//!
//! The controller:
//! - Owns the instance state machine and the tracked process
//! - Serializes every lifecycle operation behind one mutex
//! - Routes all process and signal actions through the [`CommandExecutor`]
//!
//! The process handle lives inside the `Started`/`Paused` variants of the
//! internal lifecycle, so a pid exists exactly when the instance is running.

use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::AgentError;
use crate::exec::{CommandExecutor, ProcessSignal};

/// Externally visible instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Uninitialized,
    Started,
    Stopped,
    Paused,
}

impl InstanceState {
    /// Whether a process is tracked in this state.
    pub fn is_running(self) -> bool {
        matches!(self, InstanceState::Started | InstanceState::Paused)
    }

    /// Decide what `op` does from this state.
    pub fn plan(self, op: Operation) -> Transition {
        use InstanceState::*;

        match (self, op) {
            (Uninitialized | Stopped, Operation::Start) => Transition::To(Started),
            (Started | Paused, Operation::Start) => Transition::Reject,
            (Started | Paused, Operation::Stop) => Transition::To(Stopped),
            (Uninitialized | Stopped, Operation::Stop) => Transition::Noop,
            (Started, Operation::Pause) => Transition::To(Paused),
            (Uninitialized | Stopped | Paused, Operation::Pause) => Transition::Noop,
            (Paused, Operation::Continue) => Transition::To(Started),
            (Uninitialized | Stopped | Started, Operation::Continue) => Transition::Noop,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Uninitialized => "uninitialized",
            InstanceState::Started => "started",
            InstanceState::Stopped => "stopped",
            InstanceState::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

/// State-changing lifecycle operations. Restart is Stop followed by Start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Pause,
    Continue,
}

/// Outcome of [`InstanceState::plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Act, then move to the given state.
    To(InstanceState),
    /// Succeed without acting.
    Noop,
    /// Refuse: acting would track a second process.
    Reject,
}

/// Snapshot of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub pid: Option<u32>,
}

/// Settings the controller needs from the agent configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub instance_dir: PathBuf,
    pub launch_target: PathBuf,
    pub default_args: Vec<String>,
    pub backup_root: PathBuf,
    pub stop_timeout: Duration,
}

#[derive(Debug)]
struct TrackedProcess {
    pid: u32,
    child: Child,
}

#[derive(Debug)]
enum Lifecycle {
    Uninitialized,
    Stopped,
    Started(TrackedProcess),
    Paused(TrackedProcess),
}

impl Lifecycle {
    fn state(&self) -> InstanceState {
        match self {
            Lifecycle::Uninitialized => InstanceState::Uninitialized,
            Lifecycle::Stopped => InstanceState::Stopped,
            Lifecycle::Started(_) => InstanceState::Started,
            Lifecycle::Paused(_) => InstanceState::Paused,
        }
    }

    fn pid(&self) -> Option<u32> {
        match self {
            Lifecycle::Started(p) | Lifecycle::Paused(p) => Some(p.pid),
            Lifecycle::Uninitialized | Lifecycle::Stopped => None,
        }
    }

    fn paused(self) -> Self {
        match self {
            Lifecycle::Started(p) => Lifecycle::Paused(p),
            other => other,
        }
    }

    fn resumed(self) -> Self {
        match self {
            Lifecycle::Paused(p) => Lifecycle::Started(p),
            other => other,
        }
    }
}

#[derive(Debug)]
struct Inner {
    lifecycle: Lifecycle,
    closed: bool,
}

impl Inner {
    fn status(&self) -> InstanceStatus {
        InstanceStatus {
            state: self.lifecycle.state(),
            pid: self.lifecycle.pid(),
        }
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.closed {
            return Err(AgentError::ShuttingDown);
        }
        Ok(())
    }
}

/// Instance lifecycle controller.
#[derive(Debug)]
pub struct InstanceController {
    config: ControllerConfig,
    exec: CommandExecutor,
    inner: Mutex<Inner>,
}

impl InstanceController {
    /// Create a controller in the `Uninitialized` state.
    pub fn new(config: ControllerConfig, exec: CommandExecutor) -> Self {
        Self {
            config,
            exec,
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Uninitialized,
                closed: false,
            }),
        }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.config.instance_dir
    }

    pub async fn status(&self) -> InstanceStatus {
        self.inner.lock().await.status()
    }

    pub async fn state(&self) -> InstanceState {
        self.inner.lock().await.lifecycle.state()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.lifecycle.pid()
    }

    /// Launch the instance. Empty `args` fall back to the configured defaults.
    pub async fn start(&self, args: &[String]) -> Result<InstanceStatus, AgentError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        self.start_locked(&mut inner, args)?;
        Ok(inner.status())
    }

    /// Terminate the instance and wait for it to exit.
    pub async fn stop(&self) -> Result<InstanceStatus, AgentError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        self.stop_locked(&mut inner).await?;
        Ok(inner.status())
    }

    /// Stop (if running) then start, as one serialized operation.
    pub async fn restart(&self, args: &[String]) -> Result<InstanceStatus, AgentError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        self.stop_locked(&mut inner).await?;
        self.start_locked(&mut inner, args)?;
        Ok(inner.status())
    }

    /// Suspend the instance. No-op unless started.
    pub async fn pause(&self) -> Result<InstanceStatus, AgentError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;

        let state = inner.lifecycle.state();
        match state.plan(Operation::Pause) {
            Transition::To(_) => {
                if let Some(pid) = inner.lifecycle.pid() {
                    self.exec.signal(pid, ProcessSignal::Stop)?;
                    let current = mem::replace(&mut inner.lifecycle, Lifecycle::Uninitialized);
                    inner.lifecycle = current.paused();
                    info!(pid, "Instance paused");
                }
            }
            Transition::Noop | Transition::Reject => {
                debug!(%state, "Pause ignored");
            }
        }

        Ok(inner.status())
    }

    /// Resume a paused instance. No-op unless paused.
    pub async fn resume(&self) -> Result<InstanceStatus, AgentError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;

        let state = inner.lifecycle.state();
        match state.plan(Operation::Continue) {
            Transition::To(_) => {
                if let Some(pid) = inner.lifecycle.pid() {
                    self.exec.signal(pid, ProcessSignal::Cont)?;
                    let current = mem::replace(&mut inner.lifecycle, Lifecycle::Uninitialized);
                    inner.lifecycle = current.resumed();
                    info!(pid, "Instance resumed");
                }
            }
            Transition::Noop | Transition::Reject => {
                debug!(%state, "Continue ignored");
            }
        }

        Ok(inner.status())
    }

    /// Copy the instance directory to `dest` (or a timestamped default).
    ///
    /// Returns the destination. Never changes the lifecycle.
    pub async fn backup(&self, dest: Option<PathBuf>) -> Result<PathBuf, AgentError> {
        let inner = self.inner.lock().await;
        inner.ensure_open()?;

        let src = self.config.instance_dir.clone();
        let dest = dest.unwrap_or_else(|| self.default_backup_dest());
        self.exec
            .record(&format!("backup {} -> {}", src.display(), dest.display()))?;

        let backup_err = |detail: String| AgentError::Backup {
            src: src.clone(),
            dest: dest.clone(),
            detail,
        };

        let (task_src, task_dest) = (src.clone(), dest.clone());
        let copied = tokio::task::spawn_blocking(move || copy_tree(&task_src, &task_dest))
            .await
            .map_err(|e| backup_err(e.to_string()))?
            .map_err(|e| backup_err(e.to_string()))?;

        info!(
            src = %src.display(),
            dest = %dest.display(),
            files = copied,
            state = %inner.lifecycle.state(),
            "Instance data backed up"
        );
        Ok(dest)
    }

    /// Remove the instance directory.
    ///
    /// When no process is tracked the lifecycle returns to `Uninitialized`;
    /// a running instance keeps its state.
    pub async fn cleanup(&self) -> Result<InstanceStatus, AgentError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;

        let dir = self.config.instance_dir.clone();
        self.exec.record(&format!("cleanup {}", dir.display()))?;

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|source| AgentError::Cleanup {
                path: dir.clone(),
                source,
            })?;

        if inner.lifecycle.state().is_running() {
            warn!(
                dir = %dir.display(),
                pid = inner.lifecycle.pid(),
                "Instance data removed while the instance is running"
            );
        } else {
            inner.lifecycle = Lifecycle::Uninitialized;
        }

        info!(dir = %dir.display(), "Instance data cleaned up");
        Ok(inner.status())
    }

    /// Stop the instance if it is running and refuse further operations.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        let stop_result = self.stop_locked(&mut inner).await;
        if let Err(e) = self.exec.sink().flush() {
            warn!(error = %e, "Failed to flush instance log sink");
        }

        info!(state = %inner.lifecycle.state(), "Instance controller shut down");
        stop_result
    }

    fn start_locked(&self, inner: &mut Inner, args: &[String]) -> Result<(), AgentError> {
        let state = inner.lifecycle.state();
        match state.plan(Operation::Start) {
            Transition::To(_) => {}
            Transition::Reject | Transition::Noop => {
                let pid = inner.lifecycle.pid().unwrap_or_default();
                return Err(AgentError::InstanceAlreadyRunning { pid });
            }
        }

        let args = if args.is_empty() {
            self.config.default_args.as_slice()
        } else {
            args
        };

        let (child, pid) = self.exec.spawn(
            &self.config.launch_target,
            args,
            &self.config.instance_dir,
        )?;

        inner.lifecycle = Lifecycle::Started(TrackedProcess { pid, child });
        info!(pid, from = %state, "Instance started");
        Ok(())
    }

    async fn stop_locked(&self, inner: &mut Inner) -> Result<(), AgentError> {
        let state = inner.lifecycle.state();
        if state.plan(Operation::Stop) == Transition::Noop {
            debug!(%state, "Stop ignored");
            return Ok(());
        }

        let paused = state == InstanceState::Paused;
        let process = match &mut inner.lifecycle {
            Lifecycle::Started(p) | Lifecycle::Paused(p) => p,
            Lifecycle::Uninitialized | Lifecycle::Stopped => return Ok(()),
        };
        let pid = process.pid;

        let exited = process
            .child
            .try_wait()
            .map_err(|source| crate::exec::ExecError::Wait { pid, source })?;
        if let Some(status) = exited {
            warn!(pid, %status, "Instance exited before stop");
            self.exec
                .record(&format!("exit pid={} {} (before stop)", pid, status))?;
            inner.lifecycle = Lifecycle::Stopped;
            return Err(AgentError::InstanceAlreadyExited { pid, status });
        }

        let status = self
            .exec
            .terminate(&mut process.child, pid, self.config.stop_timeout, paused)
            .await?;

        inner.lifecycle = Lifecycle::Stopped;
        info!(pid, %status, "Instance stopped");
        Ok(())
    }

    fn default_backup_dest(&self) -> PathBuf {
        let name = self
            .config
            .instance_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "instance".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        self.config.backup_root.join(format!("{name}-{stamp}"))
    }
}

/// Recursively copy `src` into a new directory `dest`. Returns files copied.
///
/// `dest` must not exist and must not lie inside `src`. A failed copy removes
/// whatever it had written under `dest`.
fn copy_tree(src: &Path, dest: &Path) -> io::Result<u64> {
    if !src.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", src.display()),
        ));
    }
    if dest.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", dest.display()),
        ));
    }
    if resolve_path(dest)?.starts_with(src.canonicalize()?) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is inside {}", dest.display(), src.display()),
        ));
    }

    match copy_entries(src, dest) {
        Ok(copied) => Ok(copied),
        Err(e) => {
            if let Err(rm) = fs::remove_dir_all(dest) {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!(dest = %dest.display(), error = %rm, "Failed to remove partial backup");
                }
            }
            Err(e)
        }
    }
}

fn copy_entries(src: &Path, dest: &Path) -> io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Absolute form of a path that may not exist yet: the deepest existing
/// ancestor is canonicalized and the missing components are appended.
fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(base) => {
                return Ok(missing
                    .iter()
                    .rev()
                    .fold(base, |acc: PathBuf, name| acc.join(name)));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let name = existing.file_name().ok_or(e)?;
                missing.push(name.to_os_string());
                existing = match existing.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent,
                    _ => Path::new("."),
                };
            }
            Err(e) => return Err(e),
        }
    }
}
