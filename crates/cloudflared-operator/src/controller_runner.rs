//! Controller runner - builds controller futures for each resource kind
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use cloudflared_api::TunnelApiProvider;
use cloudflared_common::crd::Tunnel;
use cloudflared_common::MANAGED_BY_LABEL;
use cloudflared_ingress::IngressContext;
use cloudflared_tunnel::{TunnelContext, TunnelControllerConfig};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller loop ready to be awaited
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Watcher config for the children a controller owns
///
/// Only objects carrying the managed-by label are watched, which keeps
/// unrelated ConfigMaps and Deployments out of the reflector cache.
fn owned_watcher_config() -> WatcherConfig {
    WatcherConfig::default()
        .labels(MANAGED_BY_LABEL)
        .timeout(WATCH_TIMEOUT_SECS)
}

/// Build the Tunnel controller future
///
/// Changes to owned ConfigMaps and Deployments requeue the owning Tunnel, so
/// out-of-band edits are reverted.
pub fn build_tunnel_controllers(
    client: Client,
    cloudflare: Arc<dyn TunnelApiProvider>,
    config: TunnelControllerConfig,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(
        TunnelContext::builder(client.clone(), cloudflare)
            .config(config)
            .build(),
    );

    let tunnels: Api<Tunnel> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client);

    tracing::info!("- Tunnel controller");

    vec![Box::pin(
        Controller::new(tunnels, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(config_maps, owned_watcher_config())
            .owns(deployments, owned_watcher_config())
            .shutdown_on_signal()
            .run(
                cloudflared_tunnel::reconcile,
                cloudflared_tunnel::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("Tunnel")),
    )]
}

/// Build the Ingress controller future
///
/// Owned Tunnels requeue their Ingress once the Tunnel controller publishes a
/// zone, which is what the Ingress status reports.
pub fn build_ingress_controllers(client: Client, controller_name: String) -> Vec<ControllerFuture> {
    let ctx = Arc::new(IngressContext::new(client.clone(), controller_name.as_str()));

    let ingresses: Api<Ingress> = Api::all(client.clone());
    let tunnels: Api<Tunnel> = Api::all(client);

    tracing::info!(controller = %controller_name, "- Ingress controller");

    vec![Box::pin(
        Controller::new(ingresses, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(tunnels, owned_watcher_config())
            .shutdown_on_signal()
            .run(
                cloudflared_ingress::reconcile,
                cloudflared_ingress::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("Ingress")),
    )]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_children_are_filtered_by_managed_by_label() {
        let config = owned_watcher_config();
        assert_eq!(config.label_selector.as_deref(), Some(MANAGED_BY_LABEL));
        assert_eq!(config.timeout, Some(WATCH_TIMEOUT_SECS));
    }

    #[test]
    fn watch_timeout_is_below_client_read_timeout() {
        assert!(WATCH_TIMEOUT_SECS < 30);
    }
}
