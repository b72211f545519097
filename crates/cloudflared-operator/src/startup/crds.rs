//! CRD installation utilities
//!
//! CRDs are installed on startup with server-side apply so upgrades of the
//! operator also upgrade the schemas it reconciles.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use cloudflared_common::crd::{Tunnel, TunnelConfiguration};
use cloudflared_common::FIELD_MANAGER;

/// Every CRD owned by the operator, in install order
fn operator_crds() -> Vec<CustomResourceDefinition> {
    vec![Tunnel::crd(), TunnelConfiguration::crd()]
}

/// Render all CRDs as a multi-document YAML stream
pub fn crd_manifests() -> Result<String, serde_yaml::Error> {
    let docs = operator_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}

/// Ensure the Tunnel and TunnelConfiguration CRDs are installed
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in operator_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}
