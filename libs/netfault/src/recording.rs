//! Recording provider for tests and dry runs.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::{FaultError, PortFaultProvider};

/// A call observed by [`RecordingProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultCall {
    Drop(String),
    Recover(String),
}

/// Provider that records requests instead of touching the firewall.
#[derive(Debug, Default)]
pub struct RecordingProvider {
    calls: Mutex<Vec<FaultCall>>,
    fail_with: Option<String>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider that records calls and then fails every one of them.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(message.into()),
        }
    }

    /// Calls observed so far, oldest first.
    pub fn calls(&self) -> Vec<FaultCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, call: FaultCall) -> Result<(), FaultError> {
        info!(call = ?call, "[RECORDING] Port fault request");
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);

        match &self.fail_with {
            Some(message) => Err(FaultError::Injected(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PortFaultProvider for RecordingProvider {
    async fn drop_port(&self, port: &str) -> Result<(), FaultError> {
        self.record(FaultCall::Drop(port.to_string()))
    }

    async fn recover_port(&self, port: &str) -> Result<(), FaultError> {
        self.record(FaultCall::Recover(port.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_in_order() {
        let provider = RecordingProvider::new();

        provider.drop_port("9090").await.unwrap();
        provider.recover_port("9090").await.unwrap();

        assert_eq!(
            provider.calls(),
            vec![
                FaultCall::Drop("9090".to_string()),
                FaultCall::Recover("9090".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_still_records() {
        let provider = RecordingProvider::failing("boom");

        let err = provider.drop_port("1").await.unwrap_err();
        assert_eq!(err.to_string(), "fault provider failure: boom");
        assert_eq!(provider.calls().len(), 1);
    }
}
