//! Registration with the controller.
//!
//! The agent announces its reachable address once at startup with
//! `POST <controller>/api/agent/register?addr=<ip:port>`, where the port is
//! the one the control endpoint actually bound. Failed attempts are
//! retried with exponential backoff up to the configured attempt count.
//! Registration is best effort: the caller keeps serving either way.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Path of the registration endpoint on the controller.
pub const REGISTER_PATH: &str = "api/agent/register";

/// Delay before the second attempt; doubles after each failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Registration errors.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("registration request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("controller rejected registration: {status} - {body}")]
    Rejected { status: u16, body: String },
}

/// Client for the controller's registration endpoint.
#[derive(Debug, Clone)]
pub struct Registrar {
    client: reqwest::Client,
    register_url: String,
    attempts: u32,
    initial_backoff: Duration,
}

impl Registrar {
    /// Create a registrar from the agent configuration.
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.register_timeout)
            .build()?;

        Ok(Self {
            client,
            register_url: format!("{}/{}", config.controller_url, REGISTER_PATH),
            attempts: config.register_attempts.max(1),
            initial_backoff: INITIAL_BACKOFF,
        })
    }

    /// Override the initial retry delay.
    pub fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn register_url(&self) -> &str {
        &self.register_url
    }

    /// Send a single registration request announcing `addr`.
    pub async fn register_once(&self, addr: &str) -> Result<(), RegisterError> {
        debug!(url = %self.register_url, addr, "Registering with controller");

        let response = self
            .client
            .post(&self.register_url)
            .query(&[("addr", addr)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RegisterError::Rejected { status, body });
        }

        Ok(())
    }

    /// Register, retrying with backoff. Returns the attempt that succeeded.
    pub async fn register(&self, addr: &str) -> Result<u32, RegisterError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.register_once(addr).await {
                Ok(()) => {
                    info!(addr, attempt, "Registered with controller");
                    return Ok(attempt);
                }
                Err(e) if attempt < self.attempts => {
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.attempts,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Registration failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
