//! clusterrig -- operator CLI for the cluster test harness.
//!
//! Runs the canonical scenarios against real processes described by a YAML
//! config file.  Every scenario is bounded by an overall deadline and tears
//! its processes down on the way out, whether it succeeded or not.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use clusterrig::cluster::Cluster;
use clusterrig::config::{load_config, Config};
use clusterrig::errors::Result;
use clusterrig::replica_pair::{ReplicaPair, ARBITER, LEFT, RIGHT};
use clusterrig::retry::{with_deadline, Deadline};
use clusterrig::role::{dual_primary, primary_is, steady_state};
use clusterrig::signal::shutdown_signal;

#[derive(Parser, Debug)]
#[command(name = "clusterrig", version, about = "Launch and exercise database test clusters")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overall deadline for the scenario, in seconds.
    #[arg(long, default_value_t = 1800)]
    deadline_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a replica pair and wait for a primary.
    ReplicaPair {
        /// Also isolate the primary, wait for failover, then heal.
        #[arg(long, default_value_t = false)]
        failover: bool,
    },
    /// Provision the configured routed cluster and keep it up until Ctrl-C.
    Cluster,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    clusterrig::logging::init(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path.display());
    }

    let deadline = Duration::from_secs(cli.deadline_secs);
    match cli.command {
        Commands::ReplicaPair { failover } => run_replica_pair(&config, failover, deadline).await?,
        Commands::Cluster => run_cluster(&config, deadline).await?,
    }
    Ok(())
}

async fn run_replica_pair(config: &Config, failover: bool, deadline: Duration) -> Result<()> {
    let deadline = Deadline::after(deadline);
    let mut pair = deadline.run(ReplicaPair::start(config)).await?;
    let outcome = deadline.run(replica_pair_scenario(&mut pair, failover)).await;
    let stopped = pair.stop_all().await;
    outcome?;
    stopped
}

async fn replica_pair_scenario(pair: &mut ReplicaPair, failover: bool) -> Result<()> {
    let primary = pair.wait_for_primary().await?;
    println!("steady state: {}", pair.poll().await);
    if !failover {
        return Ok(());
    }

    let successor = if primary == LEFT { RIGHT } else { LEFT };
    info!("Isolating primary {} from {} and {}", primary, successor, ARBITER);
    let links = pair.isolation_links(&primary)?;
    pair.partition(&links).await?;

    let isolated = pair
        .wait_for_state_where(
            "failover",
            |s| primary_is(s, successor),
            pair_convergence(pair),
        )
        .await?;
    println!("after partition: {isolated}");

    // Two primaries that can still reach each other and the arbiter would
    // be a split brain.
    let graph = pair.graph();
    if dual_primary(&isolated, |a, b| graph.is_up(a, b)) {
        warn!("Two reachable primaries observed: {}", isolated);
    }

    pair.heal_all().await?;
    let healed = pair
        .wait_for_state_where("steady state after heal", steady_state, pair_convergence(pair))
        .await?;
    println!("after heal: {healed}");
    Ok(())
}

fn pair_convergence(pair: &ReplicaPair) -> Duration {
    pair.config().timeouts.convergence()
}

async fn run_cluster(config: &Config, deadline: Duration) -> Result<()> {
    let mut cluster = with_deadline(deadline, Cluster::provision(config, &config.cluster)).await?;
    for (name, addr) in cluster.address_map() {
        println!("{name}\t{addr}");
    }
    info!("Cluster is up; press Ctrl-C to stop");
    shutdown_signal().await;
    cluster.stop_all().await
}
