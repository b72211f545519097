//! Command line and environment configuration
//!
//! Every flag has an environment fallback so the operator can be configured
//! entirely from its Deployment manifest.

use std::time::Duration;

use clap::{Parser, Subcommand};

use cloudflared_api::DEFAULT_BASE_URL;
use cloudflared_common::telemetry::LogFormat;
use cloudflared_common::INGRESS_CONTROLLER_NAME;
use cloudflared_tunnel::{TunnelControllerConfig, DEFAULT_CLOUDFLARED_IMAGE};

/// cloudflared operator - exposes cluster workloads through Cloudflare tunnels
#[derive(Parser, Debug)]
#[command(name = "cloudflared-operator", version, about, long_about = None)]
pub struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Log output format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// API token used instead of the service key embedded in origin certificates
    #[arg(long, env = "CF_API_TOKEN", hide_env_values = true)]
    pub cloudflare_api_token: Option<String>,

    /// Cloudflare API base URL
    #[arg(long, env = "CF_API_URL", default_value = DEFAULT_BASE_URL)]
    pub cloudflare_api_url: String,

    /// Image run by the cloudflared Deployment of each Tunnel
    #[arg(long, env = "CLOUDFLARED_IMAGE", default_value = DEFAULT_CLOUDFLARED_IMAGE)]
    pub cloudflared_image: String,

    /// IngressClass `spec.controller` value served by the ingress controller
    #[arg(long, env = "INGRESS_CONTROLLER", default_value = INGRESS_CONTROLLER_NAME)]
    pub ingress_controller: String,

    /// Run only the Tunnel controller
    #[arg(long, env = "DISABLE_INGRESS")]
    pub disable_ingress: bool,

    /// Assume CRDs are managed externally
    #[arg(long, env = "SKIP_CRD_INSTALL")]
    pub skip_crd_install: bool,

    /// Seconds before retrying a pass that failed with a transient error
    #[arg(long, env = "RETRY_REQUEUE_SECS", default_value_t = 30)]
    pub retry_requeue_secs: u64,

    /// Seconds before retrying a pass that failed permanently
    #[arg(long, env = "FAILURE_REQUEUE_SECS", default_value_t = 300)]
    pub failure_requeue_secs: u64,

    /// Mode to run, defaults to `controller`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Operator subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the controllers (default mode)
    Controller,
}

/// Settings handed to the controller builders once the CLI is parsed
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Cloudflare API base URL
    pub cloudflare_api_url: String,
    /// Optional account-wide API token
    pub cloudflare_api_token: Option<String>,
    /// Tunnel controller tuning
    pub tunnel: TunnelControllerConfig,
    /// Ingress controller name, `None` when the ingress controller is disabled
    pub ingress_controller: Option<String>,
    /// Whether CRDs are applied on startup
    pub install_crds: bool,
}

impl From<&Cli> for OperatorConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            cloudflare_api_url: cli.cloudflare_api_url.clone(),
            cloudflare_api_token: cli
                .cloudflare_api_token
                .clone()
                .filter(|token| !token.is_empty()),
            tunnel: TunnelControllerConfig {
                default_image: cli.cloudflared_image.clone(),
                retry_requeue: Duration::from_secs(cli.retry_requeue_secs),
                failure_requeue: Duration::from_secs(cli.failure_requeue_secs),
            },
            ingress_controller: (!cli.disable_ingress).then(|| cli.ingress_controller.clone()),
            install_crds: !cli.skip_crd_install,
        }
    }
}
