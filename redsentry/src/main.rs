mod logging;
mod settings;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use redsentry_cluster::{
    CoordinationClient, ManagerConfig, MemoryCoordination, NodeManager, RedisCoordination,
    RedisCoordinationConfig,
};
use redsentry_core::{HostConfig, LowestMeanLatency, RedisConnectionFactory, SimpleMajority};

use settings::Settings;

#[derive(Parser)]
#[command(name = "redsentry", about = "Redis failover coordinator", version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the failover coordinator (the default)
    Run,
    /// Ask the current leader to promote the given instance
    Failover {
        /// Target instance as `host:port`
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings =
        Settings::load(cli.config.as_deref()).context("loading configuration failed")?;
    logging::init_logging(&settings.logging)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&settings).await,
        Command::Failover { target } => failover(&settings, &target).await,
    }
}

async fn run(settings: &Settings) -> Result<()> {
    let hosts = settings.hosts().context("invalid instance address")?;
    if hosts.is_empty() {
        bail!("no instances configured; set cluster.instances or REDSENTRY_CLUSTER_INSTANCES");
    }

    let manager_config = settings.manager_config();
    let coordination = build_coordination(settings, &manager_config)?;

    info!(
        node_id = %manager_config.node_id,
        instances = hosts.len(),
        "redsentry starting"
    );

    let manager = NodeManager::new(
        manager_config,
        hosts,
        Arc::new(RedisConnectionFactory),
        coordination,
        Arc::new(SimpleMajority),
        Arc::new(LowestMeanLatency),
    );

    manager.clone().start().await.context("coordinator startup failed")?;
    wait_for_shutdown().await;

    manager.stop().await;
    info!("redsentry stopped");
    Ok(())
}

async fn failover(settings: &Settings, target: &str) -> Result<()> {
    if settings.coordination.url.is_empty() {
        bail!("manual failover requires a Redis coordination url");
    }

    let target = HostConfig::parse(target).context("invalid failover target")?;
    let config = RedisCoordinationConfig {
        namespace: settings.coordination.namespace.clone(),
        ..RedisCoordinationConfig::new(
            settings.coordination.url.clone(),
            redsentry_cluster::generate_node_id(),
        )
    };

    let coordination = RedisCoordination::connect(config)?;
    coordination.request_manual_failover(&target).await?;
    coordination.close().await?;

    println!("manual failover to {target} requested");
    Ok(())
}

fn build_coordination(
    settings: &Settings,
    manager_config: &ManagerConfig,
) -> Result<Arc<dyn CoordinationClient>> {
    if settings.coordination.url.is_empty() {
        info!("no coordination url configured, running single-node");
        return Ok(Arc::new(MemoryCoordination::new()));
    }

    let config = RedisCoordinationConfig {
        namespace: settings.coordination.namespace.clone(),
        ..RedisCoordinationConfig::new(
            settings.coordination.url.clone(),
            manager_config.node_id.clone(),
        )
    };

    let coordination = RedisCoordination::connect(config)?;
    Ok(coordination)
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "installing SIGTERM handler failed");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received shutdown signal");
}
