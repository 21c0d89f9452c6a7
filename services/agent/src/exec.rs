//! Command execution for the managed instance.
//!
//! Every action the agent takes against the instance goes through the
//! [`CommandExecutor`]:
//! 1. The launched process gets the log sink as both stdout and stderr
//! 2. Signals are delivered natively (no shell, no string interpolation)
//! 3. Each action appends a record line to the same sink
//!
//! The sink is therefore the single observable trail of the instance.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::logging::LogSink;

/// Errors from launching, signalling or waiting on a process.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited before its pid could be read")]
    NoPid { program: String },

    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited unsuccessfully: {status}")]
    ExitStatus { program: String, status: ExitStatus },

    #[error("failed to send SIG{signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("log sink write failed: {0}")]
    Sink(#[source] std::io::Error),
}

/// Signals the agent delivers to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Term,
    Kill,
    Stop,
    Cont,
}

impl ProcessSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessSignal::Term => "TERM",
            ProcessSignal::Kill => "KILL",
            ProcessSignal::Stop => "STOP",
            ProcessSignal::Cont => "CONT",
        }
    }

    fn as_nix(self) -> Signal {
        match self {
            ProcessSignal::Term => Signal::SIGTERM,
            ProcessSignal::Kill => Signal::SIGKILL,
            ProcessSignal::Stop => Signal::SIGSTOP,
            ProcessSignal::Cont => Signal::SIGCONT,
        }
    }
}

/// Runs and signals instance processes, logging everything to one sink.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    sink: Arc<LogSink>,
}

impl CommandExecutor {
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<LogSink> {
        &self.sink
    }

    /// Append an action record to the sink.
    pub fn record(&self, action: &str) -> Result<(), ExecError> {
        self.sink.record(action).map_err(ExecError::Sink)
    }

    /// Launch `program` in `cwd` with its output streamed to the sink.
    ///
    /// Returns the child and its pid. The child is killed if the handle is
    /// dropped while it is still running.
    pub fn spawn(
        &self,
        program: &Path,
        args: &[String],
        cwd: &Path,
    ) -> Result<(Child, u32), ExecError> {
        let program_name = program.display().to_string();
        let spawn_err = |source| ExecError::Spawn {
            program: program_name.clone(),
            source,
        };

        self.record(&format!("start {} {}", program_name, args.join(" ")))?;

        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(self.sink.stdio().map_err(spawn_err)?)
            .stderr(self.sink.stdio().map_err(spawn_err)?)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let pid = child.id().ok_or_else(|| ExecError::NoPid {
            program: program_name.clone(),
        })?;

        info!(program = %program_name, args = ?args, pid, "Process spawned");
        Ok((child, pid))
    }

    /// Run `program` to completion with its output streamed to the sink.
    ///
    /// A non-zero exit is an error carrying the exit status.
    pub async fn run(&self, program: &Path, args: &[String], cwd: &Path) -> Result<(), ExecError> {
        let (mut child, pid) = self.spawn(program, args, cwd)?;
        let status = self.wait(&mut child, pid).await?;

        if !status.success() {
            return Err(ExecError::ExitStatus {
                program: program.display().to_string(),
                status,
            });
        }
        Ok(())
    }

    /// Deliver `signal` to `pid`.
    pub fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), ExecError> {
        self.record(&format!("signal SIG{} pid={}", signal.as_str(), pid))?;

        let raw = i32::try_from(pid).map_err(|_| ExecError::Signal {
            pid,
            signal: signal.as_str(),
            source: nix::Error::EINVAL,
        })?;

        kill(Pid::from_raw(raw), signal.as_nix()).map_err(|source| ExecError::Signal {
            pid,
            signal: signal.as_str(),
            source,
        })?;

        debug!(pid, signal = signal.as_str(), "Signal delivered");
        Ok(())
    }

    /// Block until `child` exits.
    pub async fn wait(&self, child: &mut Child, pid: u32) -> Result<ExitStatus, ExecError> {
        let status = child
            .wait()
            .await
            .map_err(|source| ExecError::Wait { pid, source })?;

        self.record(&format!("exit pid={} {}", pid, status))?;
        Ok(status)
    }

    /// Terminate `child`: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// A suspended process only acts on SIGTERM once resumed, so `resume`
    /// sends SIGCONT right after SIGTERM.
    pub async fn terminate(
        &self,
        child: &mut Child,
        pid: u32,
        grace: Duration,
        resume: bool,
    ) -> Result<ExitStatus, ExecError> {
        self.signal(pid, ProcessSignal::Term)?;
        if resume {
            self.signal(pid, ProcessSignal::Cont)?;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                let status = status.map_err(|source| ExecError::Wait { pid, source })?;
                self.record(&format!("exit pid={} {}", pid, status))?;
                Ok(status)
            }
            Err(_) => {
                warn!(
                    pid,
                    grace_secs = grace.as_secs_f64(),
                    "Process ignored SIGTERM, escalating to SIGKILL"
                );
                self.signal(pid, ProcessSignal::Kill)?;
                self.wait(child, pid).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn executor(dir: &Path) -> CommandExecutor {
        let sink = LogSink::open(&dir.join("instance.log")).unwrap();
        CommandExecutor::new(Arc::new(sink))
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(ProcessSignal::Stop.as_str(), "STOP");
        assert_eq!(ProcessSignal::Cont.as_nix(), Signal::SIGCONT);
        assert_eq!(ProcessSignal::Kill.as_str(), "KILL");
    }

    #[tokio::test]
    async fn test_spawn_streams_output_to_sink() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path());

        let (mut child, pid) = exec
            .spawn(
                Path::new("sh"),
                &["-c".to_string(), "echo out; echo err >&2".to_string()],
                dir.path(),
            )
            .unwrap();
        let status = exec.wait(&mut child, pid).await.unwrap();
        assert!(status.success());

        let log = fs::read_to_string(dir.path().join("instance.log")).unwrap();
        assert!(log.contains("dt-agent: start sh -c"));
        assert!(log.contains("out\n"));
        assert!(log.contains("err\n"));
        assert!(log.contains(&format!("dt-agent: exit pid={pid}")));
    }

    #[tokio::test]
    async fn test_run_reports_exit_status() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path());

        exec.run(Path::new("true"), &[], dir.path()).await.unwrap();

        let err = exec
            .run(
                Path::new("sh"),
                &["-c".to_string(), "echo failing; exit 3".to_string()],
                dir.path(),
            )
            .await
            .unwrap_err();
        match err {
            ExecError::ExitStatus { program, status } => {
                assert_eq!(program, "sh");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let log = fs::read_to_string(dir.path().join("instance.log")).unwrap();
        assert!(log.contains("failing\n"));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path());

        let err = exec
            .spawn(Path::new("/nonexistent/binary"), &[], dir.path())
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path());

        let (mut child, pid) = exec
            .spawn(Path::new("sleep"), &["30".to_string()], dir.path())
            .unwrap();
        let status = exec
            .terminate(&mut child, pid, Duration::from_secs(5), false)
            .await
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path());

        let (mut child, pid) = exec
            .spawn(
                Path::new("sh"),
                &["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
                dir.path(),
            )
            .unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        exec.terminate(&mut child, pid, Duration::from_millis(200), false)
            .await
            .unwrap();

        let log = fs::read_to_string(dir.path().join("instance.log")).unwrap();
        assert!(log.contains(&format!("signal SIGKILL pid={pid}")));
    }
}
