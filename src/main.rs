//! CLI entry point: parse the action, load the config file, assemble the
//! provider, control-plane, and SSH collaborators, and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use perf_fleet_provisioner::commands::Orchestrator;
use perf_fleet_provisioner::config::load_config;
use perf_fleet_provisioner::control_plane::RestControlPlane;
use perf_fleet_provisioner::provider::gcp::GcpCompute;
use perf_fleet_provisioner::remote::SshTaskRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    /// Cloud config, pool, engines, virtual service, and clients in order
    CreateAll,
    /// Controller-side cloud config (network, IPAM, connector user)
    CreateCloud,
    /// Datascript, pool, and virtual service
    CreateVs,
    /// Load-generator instances
    CreateClient,
    /// Service-engine instances, registered and waited healthy
    CreateEngines,
    /// Pool backend instances with their serving containers
    CreatePool,
    StartTest,
    StopTest,
    DeleteVs,
    DeleteClient,
    DeleteEngines,
    DeletePool,
    DeleteCloud,
    /// Everything, reverse of create-all
    DeleteAll,
}

#[derive(Debug, Parser)]
#[command(name = "perf-fleet-provisioner", version, about)]
struct Args {
    /// What to do
    #[arg(long, value_enum)]
    action: Action,

    /// Config file (.yaml, .yml, or .json)
    #[arg(long, default_value = "perf.yaml")]
    file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perf_fleet_provisioner=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.file)?;
    let cloud = &config.cloud;
    anyhow::ensure!(
        cloud.kind == "gcp",
        "unsupported provider kind {:?}",
        cloud.kind
    );

    let provider = GcpCompute::new()
        .await
        .context("initializing compute client")?;
    let control_plane = RestControlPlane::new(
        &cloud.controller.api_endpoint,
        &cloud.controller.username,
        &cloud.controller.password,
        &cloud.controller.tenant,
    )
    .context("initializing controller client")?;
    let runner = SshTaskRunner::new(
        &cloud.ssh_username,
        &cloud.ssh_private_key,
        cloud.controller.ssh_pool_size,
    )
    .context("initializing ssh runner")?;

    let orchestrator = Orchestrator {
        cloud,
        provider: &provider,
        control_plane: &control_plane,
        runner: &runner,
    };

    info!("running action {:?}", args.action);
    match args.action {
        Action::CreateAll => orchestrator.create_all().await,
        Action::CreateCloud => orchestrator.create_cloud().await,
        Action::CreateVs => orchestrator.create_virtual_service().await,
        Action::CreateClient => {
            orchestrator.create_client().await;
        }
        Action::CreateEngines => {
            orchestrator.create_engines().await;
        }
        Action::CreatePool => {
            orchestrator.create_pool().await;
        }
        Action::StartTest => orchestrator.start_test().await,
        Action::StopTest => orchestrator.stop_test().await,
        Action::DeleteVs => orchestrator.delete_virtual_service().await,
        Action::DeleteClient => orchestrator.delete_client().await,
        Action::DeleteEngines => orchestrator.delete_engines().await,
        Action::DeletePool => orchestrator.delete_pool().await,
        Action::DeleteCloud => orchestrator.delete_cloud().await,
        Action::DeleteAll => orchestrator.delete_all().await,
    }

    Ok(())
}
