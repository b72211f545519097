//! Ingress controller implementation
//!
//! Ingresses whose class belongs to this controller are turned into a Tunnel
//! of the same name. Once the Tunnel reports its zone, the zone is published
//! as the Ingress load-balancer hostname.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{
    Ingress, IngressClass, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
};
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use cloudflared_common::crd::{Tunnel, TunnelConfiguration};
use cloudflared_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use cloudflared_common::kube_utils::not_found_to_none;
use cloudflared_common::{
    KubeMergePatch, MergePatchApi, ObjectKey, PatchScope, ScopedPatcher, INGRESS_CONTROLLER_NAME,
};

use crate::translate::{
    desired_tunnel, is_controlled, parameters_namespace, tunnel_configuration_ref,
};
use crate::IngressError;

/// Requeue delay while the Tunnel has not reported a zone
pub const ZONE_REQUEUE: Duration = Duration::from_secs(10);

/// Object kinds the ingress controller patches
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngressPatchTarget {
    Ingress,
    Tunnel,
}

/// Kubernetes operations needed by the ingress controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngressKubeClient: Send + Sync {
    async fn get_ingress_class(&self, name: &str) -> Result<Option<IngressClass>, kube::Error>;

    async fn get_tunnel_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TunnelConfiguration>, kube::Error>;

    async fn get_tunnel(&self, namespace: &str, name: &str)
        -> Result<Option<Tunnel>, kube::Error>;

    async fn create_tunnel(&self, namespace: &str, tunnel: &Tunnel) -> Result<(), kube::Error>;

    async fn merge_patch(
        &self,
        target: IngressPatchTarget,
        key: &ObjectKey,
        scope: PatchScope,
        patch: &Value,
    ) -> Result<(), kube::Error>;
}

/// Real Kubernetes client implementation
pub struct IngressKubeClientImpl {
    client: Client,
    ingresses: KubeMergePatch,
    tunnels: KubeMergePatch,
}

impl IngressKubeClientImpl {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            ingresses: KubeMergePatch::for_resource::<Ingress>(client.clone(), field_manager),
            tunnels: KubeMergePatch::for_resource::<Tunnel>(client.clone(), field_manager),
            client,
        }
    }
}

#[async_trait]
impl IngressKubeClient for IngressKubeClientImpl {
    async fn get_ingress_class(&self, name: &str) -> Result<Option<IngressClass>, kube::Error> {
        let api: Api<IngressClass> = Api::all(self.client.clone());
        not_found_to_none(api.get(name).await)
    }

    async fn get_tunnel_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TunnelConfiguration>, kube::Error> {
        let api: Api<TunnelConfiguration> = Api::namespaced(self.client.clone(), namespace);
        not_found_to_none(api.get(name).await)
    }

    async fn get_tunnel(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Tunnel>, kube::Error> {
        let api: Api<Tunnel> = Api::namespaced(self.client.clone(), namespace);
        not_found_to_none(api.get(name).await)
    }

    async fn create_tunnel(&self, namespace: &str, tunnel: &Tunnel) -> Result<(), kube::Error> {
        let api: Api<Tunnel> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), tunnel).await?;
        Ok(())
    }

    async fn merge_patch(
        &self,
        target: IngressPatchTarget,
        key: &ObjectKey,
        scope: PatchScope,
        patch: &Value,
    ) -> Result<(), kube::Error> {
        let api = match target {
            IngressPatchTarget::Ingress => &self.ingresses,
            IngressPatchTarget::Tunnel => &self.tunnels,
        };
        api.merge_patch(key, scope, patch).await
    }
}

struct TargetPatchApi<'a> {
    kube: &'a dyn IngressKubeClient,
    target: IngressPatchTarget,
}

#[async_trait]
impl<'a> MergePatchApi for TargetPatchApi<'a> {
    async fn merge_patch(
        &self,
        key: &ObjectKey,
        scope: PatchScope,
        patch: &Value,
    ) -> Result<(), kube::Error> {
        self.kube.merge_patch(self.target, key, scope, patch).await
    }
}

/// Shared context for the Ingress controller
pub struct IngressContext {
    pub kube: Arc<dyn IngressKubeClient>,
    pub events: Arc<dyn EventPublisher>,
    /// IngressClass `spec.controller` value this controller serves
    pub controller_name: String,
}

impl IngressContext {
    /// Context serving IngressClasses whose controller is `controller_name`
    pub fn new(client: Client, controller_name: impl Into<String>) -> Self {
        let controller_name = controller_name.into();
        Self {
            kube: Arc::new(IngressKubeClientImpl::new(
                client.clone(),
                &controller_name,
            )),
            events: Arc::new(KubeEventPublisher::new(client, INGRESS_CONTROLLER_NAME)),
            controller_name,
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn IngressKubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(cloudflared_common::events::NoopEventPublisher),
            controller_name: INGRESS_CONTROLLER_NAME.to_string(),
        }
    }

    fn patch_api(&self, target: IngressPatchTarget) -> TargetPatchApi<'_> {
        TargetPatchApi {
            kube: self.kube.as_ref(),
            target,
        }
    }
}

/// Reconcile an Ingress resource
///
/// Ingresses of other classes are ignored.
#[instrument(skip(ingress, ctx), fields(ingress = %ingress.name_any()))]
pub async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<IngressContext>) -> Result<Action, IngressError> {
    let Some(class_name) = ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref())
    else {
        debug!("Ingress has no class, skipping");
        return Ok(Action::await_change());
    };

    let Some(class) = ctx.kube.get_ingress_class(class_name).await? else {
        debug!(class = class_name, "IngressClass not found, skipping");
        return Ok(Action::await_change());
    };
    if !is_controlled(&class, &ctx.controller_name) {
        debug!(class = class_name, "IngressClass belongs to another controller");
        return Ok(Action::await_change());
    }
    if ingress.metadata.deletion_timestamp.is_some() {
        // The owned Tunnel is garbage-collected with the Ingress.
        return Ok(Action::await_change());
    }

    let namespace = ingress.namespace().ok_or(IngressError::MissingNamespace)?;
    let params = tunnel_configuration_ref(&class)?;
    let config_namespace = parameters_namespace(params, &namespace);
    let config = ctx
        .kube
        .get_tunnel_configuration(config_namespace, &params.name)
        .await?
        .ok_or_else(|| {
            IngressError::invalid_parameters(format!(
                "TunnelConfiguration {}/{} not found",
                config_namespace, params.name
            ))
        })?;

    let desired = desired_tunnel(&ingress, &config)?;
    let zone = sync_tunnel(&ingress, desired, &namespace, &ctx).await?;

    let Some(zone) = zone else {
        debug!("Tunnel has no zone yet");
        return Ok(Action::requeue(ZONE_REQUEUE));
    };

    let patcher = ScopedPatcher::open(ingress.as_ref())?;
    let mut updated = ingress.as_ref().clone();
    updated.status = Some(IngressStatus {
        load_balancer: Some(IngressLoadBalancerStatus {
            ingress: Some(vec![IngressLoadBalancerIngress {
                hostname: Some(zone),
                ..Default::default()
            }]),
        }),
    });
    patcher
        .commit(&ctx.patch_api(IngressPatchTarget::Ingress), &updated)
        .await?;
    Ok(Action::await_change())
}

/// Create or patch the Tunnel, returning the zone it reports
async fn sync_tunnel(
    ingress: &Ingress,
    desired: Tunnel,
    namespace: &str,
    ctx: &IngressContext,
) -> Result<Option<String>, IngressError> {
    let name = desired.name_any();
    let Some(existing) = ctx.kube.get_tunnel(namespace, &name).await? else {
        info!(tunnel = %name, "Creating Tunnel");
        ctx.kube.create_tunnel(namespace, &desired).await?;
        publish_synced(ingress, ctx, format!("created Tunnel {name}")).await;
        return Ok(None);
    };

    let patcher = ScopedPatcher::open(&existing)?;
    let mut updated = existing.clone();
    updated.spec = desired.spec;
    if let Some(labels) = desired.metadata.labels {
        updated
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels);
    }
    updated.metadata.owner_references = desired.metadata.owner_references;

    let patched = patcher
        .commit(&ctx.patch_api(IngressPatchTarget::Tunnel), &updated)
        .await?;
    if !patched.is_empty() {
        info!(tunnel = %name, "Updated Tunnel");
        publish_synced(ingress, ctx, format!("updated Tunnel {name}")).await;
    }

    Ok(existing.status.and_then(|s| s.zone).filter(|z| !z.is_empty()))
}

async fn publish_synced(ingress: &Ingress, ctx: &IngressContext, note: String) {
    ctx.events
        .publish(
            &ingress.object_ref(&()),
            EventType::Normal,
            reasons::TUNNEL_SYNCED,
            actions::RECONCILE,
            Some(note),
        )
        .await;
}

/// Requeue policy for failed passes
pub fn error_policy(ingress: Arc<Ingress>, error: &IngressError, _ctx: Arc<IngressContext>) -> Action {
    error!(
        ?error,
        ingress = %ingress.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::requeue(Duration::from_secs(300))
    }
}
