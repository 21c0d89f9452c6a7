//! The agent: one managed instance, one controller, one control endpoint.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dt_netfault::{IptablesProvider, PortFaultProvider, RecordingProvider};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api;
use crate::config::{Config, FaultProviderKind};
use crate::error::AgentError;
use crate::exec::CommandExecutor;
use crate::instance::{ControllerConfig, InstanceController, InstanceStatus};
use crate::logging::LogSink;
use crate::registrar::Registrar;

/// Per-host agent supervising a single instance.
pub struct Agent {
    config: Config,
    instance: InstanceController,
    faults: Arc<dyn PortFaultProvider>,
    registrar: Registrar,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Build an agent with the fault provider selected by the configuration.
    pub fn from_config(config: Config) -> Result<Self, AgentError> {
        let faults: Arc<dyn PortFaultProvider> = match config.fault_provider {
            FaultProviderKind::Iptables => Arc::new(IptablesProvider::new()),
            FaultProviderKind::Noop => Arc::new(RecordingProvider::new()),
        };
        Self::new(config, faults)
    }

    /// Build an agent.
    ///
    /// Fails if the instance directory or launch target is missing, or the
    /// log sink cannot be opened.
    pub fn new(config: Config, faults: Arc<dyn PortFaultProvider>) -> Result<Self, AgentError> {
        let instance_dir = config.instance_dir.clone();
        match fs::metadata(&instance_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(AgentError::InstanceDirMissing {
                    path: instance_dir,
                    detail: "not a directory".to_string(),
                })
            }
            Err(e) => {
                return Err(AgentError::InstanceDirMissing {
                    path: instance_dir,
                    detail: e.to_string(),
                })
            }
        }

        let launch_target = config.launch_target();
        if let Err(e) = fs::metadata(&launch_target) {
            return Err(AgentError::LaunchTargetMissing {
                path: launch_target,
                detail: e.to_string(),
            });
        }

        let sink = LogSink::open(&config.instance_log).map_err(|source| AgentError::LogSink {
            path: config.instance_log.clone(),
            source,
        })?;

        let registrar = Registrar::new(&config)?;

        let instance = InstanceController::new(
            ControllerConfig {
                instance_dir,
                launch_target,
                default_args: config.instance_args.clone(),
                backup_root: config.backup_dir.clone(),
                stop_timeout: config.stop_timeout,
            },
            CommandExecutor::new(Arc::new(sink)),
        );

        let (shutdown_tx, _) = watch::channel(false);

        info!(
            addr = %config.addr(),
            instance_dir = %config.instance_dir.display(),
            log = %config.instance_log.display(),
            "Agent created"
        );

        Ok(Self {
            config,
            instance,
            faults,
            registrar,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn addr(&self) -> String {
        self.config.addr()
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub async fn status(&self) -> InstanceStatus {
        self.instance.status().await
    }

    pub async fn start_instance(&self, args: &[String]) -> Result<InstanceStatus, AgentError> {
        self.instance.start(args).await
    }

    pub async fn stop_instance(&self) -> Result<InstanceStatus, AgentError> {
        self.instance.stop().await
    }

    pub async fn restart_instance(&self, args: &[String]) -> Result<InstanceStatus, AgentError> {
        self.instance.restart(args).await
    }

    pub async fn pause_instance(&self) -> Result<InstanceStatus, AgentError> {
        self.instance.pause().await
    }

    pub async fn continue_instance(&self) -> Result<InstanceStatus, AgentError> {
        self.instance.resume().await
    }

    pub async fn backup_instance(&self, dest: Option<PathBuf>) -> Result<PathBuf, AgentError> {
        self.instance.backup(dest).await
    }

    pub async fn cleanup_instance(&self) -> Result<InstanceStatus, AgentError> {
        self.instance.cleanup().await
    }

    /// Forward a drop request for `port` to the fault provider.
    pub async fn drop_port(&self, port: &str) -> Result<(), AgentError> {
        info!(port, "Drop port requested");
        Ok(self.faults.drop_port(port).await?)
    }

    /// Forward a recover request for `port` to the fault provider.
    pub async fn recover_port(&self, port: &str) -> Result<(), AgentError> {
        info!(port, "Recover port requested");
        Ok(self.faults.recover_port(port).await?)
    }

    /// Register `addr` with the controller. Failure is logged, never fatal.
    pub async fn register(&self, addr: &str) -> bool {
        match self.registrar.register(addr).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    error = %e,
                    controller = %self.config.controller_url,
                    "Registration failed, serving anyway"
                );
                false
            }
        }
    }

    /// Orderly teardown: stop the instance, flush the sink, stop serving.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!("Agent shutting down");
        let result = self.instance.shutdown().await;
        self.shutdown_tx.send_replace(true);
        result
    }

    /// Receiver that flips to `true` once shutdown has been requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Bind the configured address, register, and serve until shutdown.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr = self.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind control endpoint on {addr}"))?;
        self.serve_on(listener).await
    }

    /// Register, then serve the control endpoint on `listener` until shutdown.
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Control endpoint listening");

        // Bound port, not the configured one (which may be 0)
        let announced = format!("{}:{}", self.config.ip, local_addr.port());
        self.register(&announced).await;

        let mut shutdown_rx = self.shutdown_signal();
        let app = api::create_router(Arc::clone(&self));

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("Control endpoint shutting down");
            })
            .await?;

        Ok(())
    }
}
