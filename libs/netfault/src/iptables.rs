//! iptables-backed port faults.
//!
//! Dropping a port inserts two rules at the head of the filter table:
//! - `INPUT -p tcp --dport <port> -j DROP` (nothing reaches the listener)
//! - `OUTPUT -p tcp --sport <port> -j DROP` (nothing leaves it)
//!
//! Recovering deletes the same two rules. Deleting a rule that is not
//! installed makes iptables exit non-zero, which is reported to the caller.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{FaultError, Port, PortFaultProvider};

const DEFAULT_PROGRAM: &str = "iptables";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleOp {
    Insert,
    Delete,
}

impl RuleOp {
    fn flag(self) -> &'static str {
        match self {
            RuleOp::Insert => "-I",
            RuleOp::Delete => "-D",
        }
    }
}

/// Build the argument lists for the INPUT and OUTPUT rules of `port`.
fn rule_args(op: RuleOp, port: Port) -> [Vec<String>; 2] {
    let port = port.to_string();
    [
        vec![
            op.flag().to_string(),
            "INPUT".to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            port.clone(),
            "-j".to_string(),
            "DROP".to_string(),
        ],
        vec![
            op.flag().to_string(),
            "OUTPUT".to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "--sport".to_string(),
            port,
            "-j".to_string(),
            "DROP".to_string(),
        ],
    ]
}

/// Port fault provider driving the host firewall.
#[derive(Debug, Clone)]
pub struct IptablesProvider {
    program: String,
}

impl IptablesProvider {
    /// Create a provider that runs the system `iptables`.
    pub fn new() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
        }
    }

    /// Use a different firewall binary (e.g. `ip6tables` or a wrapper).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: &[String]) -> Result<(), FaultError> {
        debug!(program = %self.program, args = ?args, "Running firewall command");

        let output = Command::new(&self.program).args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FaultError::Command {
                program: self.program.clone(),
                args: args.join(" "),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

impl Default for IptablesProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortFaultProvider for IptablesProvider {
    async fn drop_port(&self, port: &str) -> Result<(), FaultError> {
        let port: Port = port.parse()?;
        info!(port = port.get(), "Dropping traffic on port");

        let [input, output] = rule_args(RuleOp::Insert, port);
        self.run(&input).await?;

        if let Err(e) = self.run(&output).await {
            // Roll back the half-installed fault
            let [undo, _] = rule_args(RuleOp::Delete, port);
            if let Err(undo_err) = self.run(&undo).await {
                warn!(port = port.get(), error = %undo_err, "Failed to roll back INPUT rule");
            }
            return Err(e);
        }

        Ok(())
    }

    async fn recover_port(&self, port: &str) -> Result<(), FaultError> {
        let port: Port = port.parse()?;
        info!(port = port.get(), "Recovering traffic on port");

        let [input, output] = rule_args(RuleOp::Delete, port);
        let input_result = self.run(&input).await;
        let output_result = self.run(&output).await;

        input_result.and(output_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_args_insert() {
        let port: Port = "9090".parse().unwrap();
        let [input, output] = rule_args(RuleOp::Insert, port);

        assert_eq!(
            input.join(" "),
            "-I INPUT -p tcp --dport 9090 -j DROP"
        );
        assert_eq!(
            output.join(" "),
            "-I OUTPUT -p tcp --sport 9090 -j DROP"
        );
    }

    #[test]
    fn test_rule_args_delete() {
        let port: Port = "22".parse().unwrap();
        let [input, output] = rule_args(RuleOp::Delete, port);

        assert_eq!(input[0], "-D");
        assert_eq!(output[0], "-D");
        assert_eq!(input[5], "22");
    }

    #[test]
    fn test_default_program() {
        assert_eq!(IptablesProvider::default().program(), "iptables");
        assert_eq!(
            IptablesProvider::new().with_program("ip6tables").program(),
            "ip6tables"
        );
    }

    #[tokio::test]
    async fn test_invalid_port_never_runs_command() {
        // A program that cannot exist: reaching it would yield Io, not InvalidPort
        let provider = IptablesProvider::new().with_program("/nonexistent/iptables");

        let err = provider.drop_port("not-a-port").await.unwrap_err();
        assert!(matches!(err, FaultError::InvalidPort(_)));
    }

    #[tokio::test]
    async fn test_successful_command() {
        let provider = IptablesProvider::new().with_program("true");

        provider.drop_port("9090").await.unwrap();
        provider.recover_port("9090").await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_command_is_reported() {
        let provider = IptablesProvider::new().with_program("false");

        let err = provider.drop_port("9090").await.unwrap_err();
        match err {
            FaultError::Command { program, args, .. } => {
                assert_eq!(program, "false");
                assert!(args.contains("--dport 9090"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let provider = IptablesProvider::new().with_program("/nonexistent/iptables");

        let err = provider.recover_port("9090").await.unwrap_err();
        assert!(matches!(err, FaultError::Io(_)));
    }
}
