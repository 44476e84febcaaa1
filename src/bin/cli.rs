//! CLI for cluster operations
//!
//! Drives the orchestrator against a simulated fleet and prints every
//! report as JSON.

use clap::{Parser, Subcommand, ValueEnum};
use clusterkit::common::{parse_duration, Config, SchemaVersion};
use clusterkit::coordinator::{
    FailoverOptions, Orchestrator, RejoinClusterOptions, RejoinInstanceOptions,
    SwitchoverOptions, UpgradeMetadataOptions,
};
use clusterkit::metadata::{classify, migration_path, DurableState, UpgradeState};
use clusterkit::testing::{build_cluster, build_clusterset, Fleet};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "clusterkit")]
#[command(about = "clusterkit cluster and ClusterSet orchestrator")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./clusterkit.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config,

    /// Run a scenario on a simulated fleet
    Demo {
        #[arg(value_enum)]
        scenario: Scenario,

        /// Switchover timeout (e.g. "500ms", "30s")
        #[arg(long, value_parser = duration_arg)]
        timeout: Option<Duration>,
    },

    /// Decide what upgradeMetadata would do for a durable state
    Classify {
        /// Upgrade marker (SETTING_UPGRADE_VERSION, UPGRADING, DONE)
        #[arg(long)]
        marker: Option<UpgradeState>,

        /// Live schema version
        #[arg(long)]
        live: Option<SchemaVersion>,

        /// Backup schema version
        #[arg(long)]
        backup: Option<SchemaVersion>,
    },

    /// Print the migration hops from a metadata version
    MigrationPath {
        /// Starting version
        from: SchemaVersion,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    /// Three-member cluster, then status
    Cluster,
    /// Lose two of three members, force quorum, rejoin
    QuorumLoss,
    /// Two-cluster ClusterSet, then a controlled switchover
    Switchover,
    /// Lose the primary cluster, fail over, rejoin the old primary
    Failover,
    /// Upgrade metadata written by an older release
    Upgrade,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn print<T: Serialize>(label: &str, value: &T) -> anyhow::Result<()> {
    println!("# {}", label);
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

const P: [&str; 3] = ["p1:3306", "p2:3306", "p3:3306"];
const R: [&str; 3] = ["r1:3306", "r2:3306", "r3:3306"];

async fn run_scenario(
    scenario: Scenario,
    timeout: Option<Duration>,
    config: Config,
) -> anyhow::Result<()> {
    let fleet = Fleet::new();
    for address in P.iter().chain(R.iter()) {
        fleet.add_instance(address);
    }
    let orch = Orchestrator::new(Arc::new(fleet.clone()), config.orchestrator);

    match scenario {
        Scenario::Cluster => {
            let cluster = build_cluster(&orch, "main", P[0], &P[1..]).await?;
            fleet.write_transactions(P[0], 10)?;
            print("status", &cluster.status().await?)?;
            print("describe", &cluster.describe().await?)?;
        }

        Scenario::QuorumLoss => {
            let cluster = build_cluster(&orch, "main", P[0], &P[1..]).await?;
            fleet.kill_all(&P[1..]);
            print("status after losing two members", &cluster.status().await?)?;
            print(
                "forceQuorumUsingPartitionOf",
                &cluster.force_quorum_using_partition_of(P[0]).await?,
            )?;
            for address in &P[1..] {
                fleet.restart(address);
                print(
                    "rejoinInstance",
                    &cluster
                        .rejoin_instance(address, RejoinInstanceOptions::default())
                        .await?,
                )?;
            }
            print("status", &cluster.status().await?)?;
        }

        Scenario::Switchover => {
            let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..])).await?;
            fleet.write_transactions(P[0], 5)?;
            print("status", &set.status().await?)?;
            print(
                "setPrimaryCluster",
                &set.set_primary_cluster(
                    "R",
                    SwitchoverOptions {
                        timeout,
                        ..Default::default()
                    },
                )
                .await?,
            )?;
            print("status after switchover", &set.status().await?)?;
        }

        Scenario::Failover => {
            build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..])).await?;
            fleet.kill_all(&P);
            let survivor = orch.get_clusterset(R[0]).await?;
            print("status with the primary cluster down", &survivor.status().await?)?;
            print(
                "forcePrimaryCluster",
                &survivor
                    .force_primary_cluster(Some("R"), FailoverOptions::default())
                    .await?,
            )?;
            for address in &P {
                fleet.restart(address);
            }
            print(
                "rejoinCluster",
                &survivor
                    .rejoin_cluster("P", RejoinClusterOptions::default())
                    .await?,
            )?;
            print("status", &survivor.status().await?)?;
        }

        Scenario::Upgrade => {
            build_cluster(&orch, "main", P[0], &P[1..]).await?;
            fleet.force_metadata_version(P[0], SchemaVersion::new(1, 0, 1));
            print(
                "upgradeMetadata (dry run)",
                &orch
                    .upgrade_metadata(P[0], UpgradeMetadataOptions { dry_run: true })
                    .await?,
            )?;
            print(
                "upgradeMetadata",
                &orch
                    .upgrade_metadata(P[0], UpgradeMetadataOptions::default())
                    .await?,
            )?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    config.orchestrator.validate()?;

    match cli.command {
        Commands::Config => print("config", &config)?,

        Commands::Demo { scenario, timeout } => run_scenario(scenario, timeout, config).await?,

        Commands::Classify {
            marker,
            live,
            backup,
        } => {
            let state = DurableState {
                marker,
                live,
                backup,
            };
            print(&state.to_string(), &classify(&state))?;
        }

        Commands::MigrationPath { from } => {
            let hops: Vec<String> = migration_path(from)?
                .into_iter()
                .map(|(f, t)| format!("{} -> {}", f, t))
                .collect();
            print("migration path", &hops)?;
        }
    }

    Ok(())
}
