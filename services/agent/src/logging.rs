//! Logging for the agent.
//!
//! Two destinations:
//! - The agent's own structured logs (tracing, JSON to stderr)
//! - The instance log sink: one append-only file that receives the managed
//!   process's stdout and stderr plus a record line for every action the
//!   agent takes against the instance

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing (prefer RUST_LOG, fall back to the configured level).
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
        .init();
}

/// Append-only destination for instance output.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogSink {
    /// Open (or create) the sink at `path` in append mode.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A handle a child process can write its output to.
    pub fn stdio(&self) -> io::Result<Stdio> {
        let file = self.lock().try_clone()?;
        Ok(Stdio::from(file))
    }

    /// Append an action record line.
    pub fn record(&self, action: &str) -> io::Result<()> {
        let mut file = self.lock();
        writeln!(file, "[{}] dt-agent: {}", Utc::now().to_rfc3339(), action)
    }

    /// Flush buffered data to disk.
    pub fn flush(&self) -> io::Result<()> {
        let mut file = self.lock();
        file.flush()?;
        file.sync_data()
    }
}
