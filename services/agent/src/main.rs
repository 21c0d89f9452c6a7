//! dt Agent
//!
//! Supervises one managed instance on this host for a remote controller.
//! Registers with the controller, serves the control endpoint, and on
//! SIGINT/SIGTERM stops the instance before exiting.

use std::sync::Arc;

use anyhow::Result;
use dt_agent::{logging, Agent, Config};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    logging::init(&config.log_level);

    info!("Starting dt agent");
    info!(
        addr = %config.addr(),
        controller_url = %config.controller_url,
        instance_dir = %config.instance_dir.display(),
        launch_target = %config.launch_target().display(),
        "Configuration loaded"
    );

    let agent = Arc::new(Agent::from_config(config)?);

    let mut server_handle = tokio::spawn(Arc::clone(&agent).serve());
    let mut sigterm = signal(SignalKind::terminate())?;

    // Wait for a shutdown signal or the server finishing on its own
    // (e.g. after a shutdown request from the controller)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Control endpoint exited"),
                Ok(Err(e)) => error!(error = %e, "Control endpoint error"),
                Err(e) => error!(error = %e, "Control endpoint task panicked"),
            }
            agent.shutdown().await?;
            info!("Agent shutdown complete");
            return Ok(());
        }
    }

    if let Err(e) = agent.shutdown().await {
        error!(error = %e, "Instance did not stop cleanly");
    }

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Control endpoint error"),
        Err(e) => error!(error = %e, "Control endpoint task panicked"),
    }

    info!("Agent shutdown complete");
    Ok(())
}
