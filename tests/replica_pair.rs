//! Replica pair convergence, failover and healing against real processes.

mod common;

use std::time::Duration;

use serde_json::json;

use clusterrig::command::AdminCommand;
use clusterrig::process::RestartOptions;
use clusterrig::replica_pair::{ReplicaPair, ARBITER, LEFT, RIGHT};
use clusterrig::retry::with_deadline;
use clusterrig::role::{
    dual_primary, no_primary, primary_is, single_primary, steady_state, ObservedRole,
};

use common::test_config;

const DEADLINE: Duration = Duration::from_secs(180);

#[tokio::test]
async fn test_failover_and_heal() {
    let config = test_config();
    let mut pair = ReplicaPair::start(&config).await.unwrap();

    let outcome = with_deadline(DEADLINE, async {
        let primary = pair.wait_for_primary().await?;
        assert!(primary == LEFT || primary == RIGHT);
        let successor = if primary == LEFT { RIGHT } else { LEFT };

        pair.run_command(&primary, &AdminCommand::insert("k", 1)).await?;
        let err = pair
            .run_command(successor, &AdminCommand::insert("k", 2))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CommandFailed");

        let links = pair.isolation_links(&primary)?;
        assert_eq!(links.len(), 4);
        pair.partition(&links).await?;

        let timeout = config.timeouts.convergence();
        let snapshot = pair
            .wait_for_state_where("failover", |s| primary_is(s, successor), timeout)
            .await?;
        let graph = pair.graph();
        assert!(!dual_primary(&snapshot, |a, b| graph.is_up(a, b)));
        assert_eq!(snapshot.role(ARBITER), ObservedRole::Secondary);

        pair.heal_all().await?;
        let healed = pair
            .wait_for_state_where("healed", steady_state, timeout)
            .await?;
        assert!(primary_is(&healed, successor));
        Ok(())
    })
    .await;

    pair.stop_all().await.unwrap();
    outcome.unwrap();
}

#[tokio::test]
async fn test_one_way_partition_moves_primary() {
    let config = test_config();
    let mut pair = ReplicaPair::start(&config).await.unwrap();

    let outcome = with_deadline(DEADLINE, async {
        let primary = pair.wait_for_primary().await?;
        let successor = if primary == LEFT { RIGHT } else { LEFT };

        // Only the primary's outbound links are cut; it still answers
        // heartbeats from the others.
        let links = [pair.link(&primary, ARBITER)?, pair.link(&primary, successor)?];
        pair.partition(&links).await?;
        assert!(pair.graph().is_up(successor, &primary));

        let timeout = config.timeouts.convergence();
        let snapshot = pair
            .wait_for_state_where("one-way failover", |s| primary_is(s, successor), timeout)
            .await?;
        assert_ne!(snapshot.role(&primary), ObservedRole::Primary);
        let graph = pair.graph();
        assert!(!dual_primary(&snapshot, |a, b| graph.is_up(a, b)));

        pair.heal_all().await?;
        let healed = pair
            .wait_for_state_where("healed", steady_state, timeout)
            .await?;
        assert!(single_primary(&healed));
        Ok(())
    })
    .await;

    pair.stop_all().await.unwrap();
    outcome.unwrap();
}

#[tokio::test]
async fn test_no_primary_without_majority() {
    let config = test_config();
    let mut pair = ReplicaPair::start(&config).await.unwrap();

    let outcome = with_deadline(DEADLINE, async {
        let primary = pair.wait_for_primary().await?;
        let successor = if primary == LEFT { RIGHT } else { LEFT };

        pair.stop_member(successor).await?;
        pair.stop_member(ARBITER).await?;
        let snapshot = pair
            .wait_for_no_primary(config.timeouts.convergence())
            .await?;
        assert!(no_primary(&snapshot));
        assert_eq!(snapshot.role(successor), ObservedRole::Unreachable);

        pair.start_member(successor).await?;
        pair.start_member(ARBITER).await?;
        pair.wait_for_primary().await?;
        Ok(())
    })
    .await;

    pair.stop_all().await.unwrap();
    outcome.unwrap();
}

#[tokio::test]
async fn test_member_restart_keeps_data() {
    let config = test_config();
    let mut pair = ReplicaPair::start(&config).await.unwrap();

    let outcome = with_deadline(DEADLINE, async {
        let primary = pair.wait_for_primary().await?;
        pair.run_command(&primary, &AdminCommand::insert("k", "kept")).await?;

        pair.restart_member(&primary, RestartOptions::preserve()).await?;
        assert_eq!(pair.member(&primary)?.restarts(), 1);
        let reply = pair.run_command(&primary, &AdminCommand::find("k")).await?;
        assert_eq!(reply.get("value"), Some(&json!("kept")));

        pair.wait_for_primary().await?;
        Ok(())
    })
    .await;

    pair.stop_all().await.unwrap();
    outcome.unwrap();
}
