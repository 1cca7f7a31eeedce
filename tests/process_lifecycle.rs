//! Start, stop and restart of real server processes.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use clusterrig::command::{run_command, AdminCommand, CommandClient, HttpCommandClient};
use clusterrig::options::{DataNodeOptions, LaunchSpec};
use clusterrig::ports::PortAllocator;
use clusterrig::process::{ProcessLauncher, ProcessSpec, RestartOptions, StartOptions};

use common::{rig_node, test_config};

fn standalone() -> LaunchSpec {
    LaunchSpec::Data(DataNodeOptions::default())
}

#[tokio::test]
async fn test_restart_preserves_or_wipes_data() {
    let config = test_config();
    let dir = tempfile::tempdir().unwrap();
    let ports = PortAllocator::init_global(&config.ports).lease(1).unwrap();
    let launcher = ProcessLauncher::new(&config.timeouts, None, CancellationToken::new());
    let client = HttpCommandClient::new(Duration::from_secs(2)).unwrap();

    let spec = ProcessSpec::server(
        "solo",
        rig_node(),
        ports.ports()[0],
        Some(dir.path().join("solo")),
        standalone(),
        Vec::new(),
    )
    .unwrap();
    let mut node = launcher.start(spec, StartOptions::default()).await.unwrap();
    assert!(node.is_running());
    let first_pid = node.pid();

    run_command(&client, node.addr(), &AdminCommand::insert("k", json!("v1")))
        .await
        .unwrap();

    launcher
        .restart(&mut node, RestartOptions::preserve())
        .await
        .unwrap();
    assert_eq!(node.restarts(), 1);
    assert_ne!(node.pid(), first_pid);
    let reply = run_command(&client, node.addr(), &AdminCommand::find("k"))
        .await
        .unwrap();
    assert_eq!(reply.get("value"), Some(&json!("v1")));

    launcher.restart(&mut node, RestartOptions::wipe()).await.unwrap();
    assert_eq!(node.restarts(), 2);
    let reply = run_command(&client, node.addr(), &AdminCommand::find("k"))
        .await
        .unwrap();
    assert_eq!(reply.get("found"), Some(&json!(false)));

    launcher.stop(&mut node).await.unwrap();
    assert!(!node.is_running());
    // Stopping twice is a no-op.
    launcher.stop(&mut node).await.unwrap();

    let err = client
        .send(node.addr(), &AdminCommand::ping())
        .await
        .unwrap_err();
    assert!(err.is_connection_failure());
}

#[tokio::test]
async fn test_restart_with_new_launch_spec() {
    let config = test_config();
    let dir = tempfile::tempdir().unwrap();
    let ports = PortAllocator::init_global(&config.ports).lease(1).unwrap();
    let launcher = ProcessLauncher::new(&config.timeouts, None, CancellationToken::new());
    let client = HttpCommandClient::new(Duration::from_secs(2)).unwrap();

    let spec = ProcessSpec::server(
        "shard0",
        rig_node(),
        ports.ports()[0],
        Some(dir.path().join("shard0")),
        LaunchSpec::Data(DataNodeOptions {
            shard_server: true,
            ..DataNodeOptions::default()
        }),
        Vec::new(),
    )
    .unwrap();
    let mut node = launcher.start(spec, StartOptions::default()).await.unwrap();
    let reply = run_command(&client, node.addr(), &AdminCommand::is_master())
        .await
        .unwrap();
    assert_eq!(reply.get("shardServer"), Some(&json!(true)));

    let port = node.port();
    launcher
        .restart(&mut node, RestartOptions::preserve().with_launch(standalone()))
        .await
        .unwrap();
    assert_eq!(node.port(), port);
    let reply = run_command(&client, node.addr(), &AdminCommand::is_master())
        .await
        .unwrap();
    assert_eq!(reply.get("shardServer"), None);

    launcher.stop(&mut node).await.unwrap();
}

#[tokio::test]
async fn test_bad_flags_fail_fast() {
    let config = test_config();
    let ports = PortAllocator::init_global(&config.ports).lease(1).unwrap();
    let launcher = ProcessLauncher::new(&config.timeouts, None, CancellationToken::new());

    // rig-node rejects --set-parameter values without '=' and exits.
    let mut spec = ProcessSpec::server(
        "broken",
        rig_node(),
        ports.ports()[0],
        None,
        standalone(),
        Vec::new(),
    )
    .unwrap();
    spec.args.push("--set-parameter".to_string());
    spec.args.push("no-equals-sign".to_string());

    let started = std::time::Instant::now();
    let err = match launcher.start(spec, StartOptions::default()).await {
        Ok(_) => panic!("started with invalid flags"),
        Err(e) => e,
    };
    assert_eq!(err.code(), "ProcessExited");
    assert!(started.elapsed() < Duration::from_secs(15));
}
