//! Routed cluster provisioning and partition moves against real processes.

mod common;

use std::time::Duration;

use clusterrig::cluster::{Cluster, ClusterTopology, ShardSpec, CONFIG_SERVER};
use clusterrig::command::AdminCommand;
use clusterrig::process::RestartOptions;
use clusterrig::retry::with_deadline;

use common::test_config;

const DEADLINE: Duration = Duration::from_secs(120);

#[tokio::test]
async fn test_provision_and_move_partition() {
    let config = test_config();
    let topology = ClusterTopology {
        shards: vec![ShardSpec::new("shard0"), ShardSpec::new("shard1")],
        routers: 2,
        ..ClusterTopology::default()
    };
    let mut cluster = Cluster::provision(&config, &topology).await.unwrap();

    let outcome = with_deadline(DEADLINE, async {
        let names: Vec<String> = cluster.address_map().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, [CONFIG_SERVER, "shard0", "shard1", "router0", "router1"]);

        cluster.enable_routing("app").await?;
        cluster.shard_collection("app.users", "uid").await?;
        assert_eq!(cluster.locate_owner("app.users", 42).await?, "shard0");

        cluster.move_partition("app.users", 42, "shard1").await?;
        assert_eq!(cluster.locate_owner("app.users", 42).await?, "shard1");
        assert_eq!(cluster.locate_owner("app.users", 43).await?, "shard0");

        let err = cluster
            .move_partition("app.users", 42, "shard9")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UnknownNode");

        // Metadata lives on the owner, so a shard restart leaves it intact.
        cluster.restart_shard("shard1", RestartOptions::preserve()).await?;
        assert_eq!(cluster.locate_owner("app.users", 42).await?, "shard1");

        let err = cluster
            .route_admin_command(&AdminCommand::new("frobnicate", 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CommandFailed");
        Ok(())
    })
    .await;

    cluster.stop_all().await.unwrap();
    outcome.unwrap();
}

#[tokio::test]
async fn test_invalid_topology_launches_nothing() {
    let config = test_config();
    let topology = ClusterTopology {
        shards: vec![ShardSpec::new("dup"), ShardSpec::new("dup")],
        ..ClusterTopology::default()
    };
    let err = match Cluster::provision(&config, &topology).await {
        Ok(_) => panic!("provisioned an invalid topology"),
        Err(e) => e,
    };
    assert_eq!(err.code(), "InvalidTopology");
}
