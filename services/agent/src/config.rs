//! Configuration for the agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Which port fault provider backs drop/recover requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultProviderKind {
    /// Host firewall via iptables.
    Iptables,
    /// Record requests only.
    Noop,
}

impl FromStr for FaultProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iptables" => Ok(Self::Iptables),
            "noop" | "none" => Ok(Self::Noop),
            other => bail!("unknown fault provider {other:?} (expected iptables or noop)"),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// IP address announced to the controller.
    pub ip: String,

    /// Port the control endpoint listens on.
    pub port: u16,

    /// Controller base URL.
    pub controller_url: String,

    /// Working directory of the managed instance.
    pub instance_dir: PathBuf,

    /// Program launched as the instance.
    pub instance_bin: PathBuf,

    /// Arguments used when a start request carries none.
    pub instance_args: Vec<String>,

    /// Log sink receiving the instance's combined output.
    pub instance_log: PathBuf,

    /// Root directory for backups without an explicit destination.
    pub backup_dir: PathBuf,

    /// How long stop waits after SIGTERM before escalating to SIGKILL.
    pub stop_timeout: Duration,

    /// Registration attempts (at least one).
    pub register_attempts: u32,

    /// Per-attempt registration timeout.
    pub register_timeout: Duration,

    /// Port fault provider.
    pub fault_provider: FaultProviderKind,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let ip = lookup("DT_AGENT_IP").unwrap_or_else(|| "127.0.0.1".to_string());

        let port: u16 = lookup("DT_AGENT_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("DT_AGENT_PORT must be a port number.")?
            .unwrap_or(9001);

        let controller_url = lookup("DT_CONTROLLER_URL")
            .unwrap_or_else(|| "http://127.0.0.1:9000".to_string())
            .trim_end_matches('/')
            .to_string();

        let instance_dir = lookup("DT_INSTANCE_DIR")
            .map(PathBuf::from)
            .context("Missing instance directory. Set DT_INSTANCE_DIR.")?;

        let instance_bin = lookup("DT_INSTANCE_BIN")
            .map(PathBuf::from)
            .context("Missing launch target. Set DT_INSTANCE_BIN.")?;

        let instance_args = lookup("DT_INSTANCE_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let instance_log = lookup("DT_INSTANCE_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("instance.log"));

        let backup_dir = lookup("DT_BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let mut dir = instance_dir.clone().into_os_string();
                dir.push(".backup");
                PathBuf::from(dir)
            });

        let stop_timeout_secs: u64 = lookup("DT_STOP_TIMEOUT_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("DT_STOP_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(10);

        let register_attempts: u32 = lookup("DT_REGISTER_ATTEMPTS")
            .map(|v| v.parse())
            .transpose()
            .context("DT_REGISTER_ATTEMPTS must be an integer.")?
            .unwrap_or(3)
            .clamp(1, 100);

        let register_timeout_secs: u64 = lookup("DT_REGISTER_TIMEOUT_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("DT_REGISTER_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(5);

        let fault_provider = lookup("DT_FAULT_PROVIDER")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(FaultProviderKind::Iptables);

        let log_level = lookup("DT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            ip,
            port,
            controller_url,
            instance_dir,
            instance_bin,
            instance_args,
            instance_log,
            backup_dir,
            stop_timeout: Duration::from_secs(stop_timeout_secs),
            register_attempts,
            register_timeout: Duration::from_secs(register_timeout_secs.max(1)),
            fault_provider,
            log_level,
        })
    }

    /// Address announced to the controller and bound by the control endpoint.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Launch target, resolved against the instance directory when relative.
    pub fn launch_target(&self) -> PathBuf {
        if self.instance_bin.is_absolute() {
            self.instance_bin.clone()
        } else {
            self.instance_dir.join(&self.instance_bin)
        }
    }
}
