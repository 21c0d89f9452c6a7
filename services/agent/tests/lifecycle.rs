#![cfg(target_os = "linux")]


use std::fs;

use dt_agent::{AgentError, InstanceState, InstanceStatus};
use dt_netfault::{FaultCall, FaultError, RecordingProvider};
use harness::{agent_with_provider, agent_with_script, sleeping_agent, wait_for_state};

#[tokio::test]
async fn new_agent_is_uninitialized() {
    let t = sleeping_agent();

    let status = t.agent.status().await;
    assert_eq!(
        status,
        InstanceStatus {
            state: InstanceState::Uninitialized,
            pid: None
        }
    );
    assert!(t.log_path().exists());
}

#[tokio::test]
async fn full_lifecycle_walk() {
    let t = sleeping_agent();

    // Start with no arguments
    let started = t.agent.start_instance(&[]).await.unwrap();
    assert_eq!(started.state, InstanceState::Started);
    let pid = started.pid.expect("started instance has a pid");
    assert!(pid > 0);
    assert!(wait_for_state(pid, |s| s.is_some()).await.is_some());

    // Pause: the process is stopped by the kernel
    let paused = t.agent.pause_instance().await.unwrap();
    assert_eq!(paused.state, InstanceState::Paused);
    assert_eq!(paused.pid, Some(pid));
    assert_eq!(wait_for_state(pid, |s| s == Some('T')).await, Some('T'));

    // Continue: same pid, running again
    let resumed = t.agent.continue_instance().await.unwrap();
    assert_eq!(resumed.state, InstanceState::Started);
    assert_eq!(resumed.pid, Some(pid));
    let state = wait_for_state(pid, |s| s.is_some() && s != Some('T')).await;
    assert!(matches!(state, Some(c) if c != 'T'));

    // Stop: process is gone and reaped
    let stopped = t.agent.stop_instance().await.unwrap();
    assert_eq!(stopped.state, InstanceState::Stopped);
    assert_eq!(stopped.pid, None);
    assert_eq!(wait_for_state(pid, |s| s.is_none()).await, None);

    let log = t.log();
    assert!(log.contains(&format!("signal SIGSTOP pid={pid}")));
    assert!(log.contains(&format!("signal SIGCONT pid={pid}")));
    assert!(log.contains(&format!("signal SIGTERM pid={pid}")));
}

#[tokio::test]
async fn pause_and_continue_are_noops_before_start() {
    let t = sleeping_agent();

    let paused = t.agent.pause_instance().await.unwrap();
    let resumed = t.agent.continue_instance().await.unwrap();

    assert_eq!(paused.state, InstanceState::Uninitialized);
    assert_eq!(resumed.state, InstanceState::Uninitialized);
    assert_eq!(resumed.pid, None);
    assert!(!t.log().contains("signal"));
}

#[tokio::test]
async fn continue_while_started_keeps_process_running() {
    let t = sleeping_agent();
    let started = t.agent.start_instance(&[]).await.unwrap();

    let status = t.agent.continue_instance().await.unwrap();
    assert_eq!(status, started);

    t.agent.stop_instance().await.unwrap();
}

#[tokio::test]
async fn start_passes_arguments_and_captures_output() {
    let t = agent_with_script("echo \"args: $*\"; exec sleep 30", "http://127.0.0.1:9");

    t.agent
        .start_instance(&["--role".to_string(), "leader".to_string()])
        .await
        .unwrap();

    let mut echoed = false;
    for _ in 0..250 {
        if t.log().contains("args: --role leader") {
            echoed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    t.agent.stop_instance().await.unwrap();

    assert!(echoed);
    assert!(t.log().contains("start "));
}

#[tokio::test]
async fn stop_escalates_when_instance_ignores_sigterm() {
    let t = agent_with_script("trap '' TERM\nwhile true; do sleep 1; done", "http://127.0.0.1:9");

    let started = t.agent.start_instance(&[]).await.unwrap();
    let pid = started.pid.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let stopped = t.agent.stop_instance().await.unwrap();
    assert_eq!(stopped.state, InstanceState::Stopped);
    assert!(t.log().contains(&format!("signal SIGKILL pid={pid}")));
}

#[tokio::test]
async fn restart_while_running_swaps_the_process() {
    let t = sleeping_agent();
    let first = t.agent.start_instance(&[]).await.unwrap().pid.unwrap();

    let restarted = t.agent.restart_instance(&[]).await.unwrap();
    let second = restarted.pid.unwrap();

    assert_ne!(first, second);
    assert_eq!(wait_for_state(first, |s| s.is_none()).await, None);
    assert!(wait_for_state(second, |s| s.is_some()).await.is_some());

    t.agent.stop_instance().await.unwrap();
}

#[tokio::test]
async fn backup_and_cleanup_round() {
    let t = sleeping_agent();
    fs::write(t.instance_dir().join("state.db"), b"snapshot").unwrap();

    let dest = t.agent.backup_instance(None).await.unwrap();
    assert_eq!(fs::read(dest.join("state.db")).unwrap(), b"snapshot");
    assert!(dest.join("run.sh").exists());

    let status = t.agent.cleanup_instance().await.unwrap();
    assert_eq!(status.state, InstanceState::Uninitialized);
    assert!(!t.instance_dir().exists());

    // The launch target went with the directory
    let err = t.agent.start_instance(&[]).await.unwrap_err();
    assert!(matches!(err, AgentError::Exec(_)));
    assert_eq!(t.agent.status().await.state, InstanceState::Uninitialized);
}

#[tokio::test]
async fn drop_port_reaches_provider_unchanged() {
    let t = sleeping_agent();

    t.agent.drop_port("9090").await.unwrap();
    t.agent.recover_port("9090").await.unwrap();

    assert_eq!(
        t.faults.calls(),
        vec![
            FaultCall::Drop("9090".to_string()),
            FaultCall::Recover("9090".to_string())
        ]
    );
}

#[tokio::test]
async fn provider_failure_is_returned_unchanged() {
    let t = agent_with_provider(
        "exec sleep 30",
        "http://127.0.0.1:9",
        RecordingProvider::failing("iptables unavailable"),
    );

    let err = t.agent.drop_port("9090").await.unwrap_err();
    match err {
        AgentError::Fault(FaultError::Injected(message)) => {
            assert_eq!(message, "iptables unavailable");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(t.faults.calls(), vec![FaultCall::Drop("9090".to_string())]);
    assert_eq!(t.agent.status().await.state, InstanceState::Uninitialized);
}

#[tokio::test]
async fn shutdown_stops_running_instance_and_signals_server() {
    let t = sleeping_agent();
    let pid = t.agent.start_instance(&[]).await.unwrap().pid.unwrap();
    let signal = t.agent.shutdown_signal();

    t.agent.shutdown().await.unwrap();

    assert!(*signal.borrow());
    assert_eq!(t.agent.status().await.state, InstanceState::Stopped);
    assert_eq!(wait_for_state(pid, |s| s.is_none()).await, None);

    let err = t.agent.start_instance(&[]).await.unwrap_err();
    assert!(matches!(err, AgentError::ShuttingDown));
}

#[tokio::test]
async fn construction_fails_without_instance_dir() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let config = dt_agent::Config::from_lookup(|key| match key {
        "DT_INSTANCE_DIR" => Some(missing.display().to_string()),
        "DT_INSTANCE_BIN" => Some("run.sh".to_string()),
        "DT_INSTANCE_LOG" => Some(dir.path().join("i.log").display().to_string()),
        _ => None,
    })
    .unwrap();

    let err = match dt_agent::Agent::from_config(config) {
        Ok(_) => panic!("agent built without an instance directory"),
        Err(e) => e,
    };
    assert_eq!(err.reason_code(), "instance_dir_missing");
}

#[tokio::test]
async fn construction_fails_without_launch_target() {
    let dir = tempfile::tempdir().unwrap();
    let config = dt_agent::Config::from_lookup(|key| match key {
        "DT_INSTANCE_DIR" => Some(dir.path().display().to_string()),
        "DT_INSTANCE_BIN" => Some("absent.sh".to_string()),
        "DT_INSTANCE_LOG" => Some(dir.path().join("i.log").display().to_string()),
        _ => None,
    })
    .unwrap();

    let err = match dt_agent::Agent::from_config(config) {
        Ok(_) => panic!("agent built without a launch target"),
        Err(e) => e,
    };
    assert_eq!(err.reason_code(), "launch_target_missing");
}
