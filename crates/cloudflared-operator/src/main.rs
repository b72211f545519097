//! cloudflared operator - exposes cluster workloads through Cloudflare tunnels

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use cloudflared_api::CloudflareClientProvider;
use cloudflared_common::telemetry::init_logging;
use cloudflared_operator::config::{Cli, Commands, OperatorConfig};
use cloudflared_operator::controller_runner::{build_ingress_controllers, build_tunnel_controllers};
use cloudflared_operator::startup::{crd_manifests, ensure_crds_installed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_logging(cli.log_format)?;

    match cli.command.unwrap_or(Commands::Controller) {
        Commands::Controller => run_controller(OperatorConfig::from(&cli)).await,
    }
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        api_url = %config.cloudflare_api_url,
        "Starting cloudflared operator"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    if config.install_crds {
        ensure_crds_installed(&client).await?;
    } else {
        tracing::info!("Skipping CRD installation");
    }

    let cloudflare = Arc::new(CloudflareClientProvider::new(
        config.cloudflare_api_url.clone(),
        config.cloudflare_api_token.clone(),
    )?);

    tracing::info!("Starting controllers:");
    let mut controllers = build_tunnel_controllers(client.clone(), cloudflare, config.tunnel);
    if let Some(controller_name) = config.ingress_controller {
        controllers.extend(build_ingress_controllers(client, controller_name));
    } else {
        tracing::info!("Ingress controller disabled");
    }

    futures::future::join_all(controllers).await;

    tracing::info!("Controllers stopped, shutting down");
    Ok(())
}
