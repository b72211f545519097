//! Tunnel controller implementation
//!
//! A Tunnel moves through three states:
//!
//! - **Converging**: the Cloudflare tunnel, its routes and the cloudflared
//!   child resources are brought in line with the Tunnel spec
//! - **Draining**: once `deletionTimestamp` is set, cloudflared is scaled to
//!   zero before the Cloudflare tunnel is deleted
//! - **Deleted**: the finalizer is removed and Kubernetes garbage-collects the
//!   owned children
//!
//! Every write goes through a [`ScopedPatcher`], so a pass that changes
//! nothing issues no requests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use cloudflared_api::{TunnelApi, TunnelApiProvider, TunnelCredentials, TunnelRecord};
use cloudflared_common::crd::{
    set_condition, Condition, ConditionStatus, Tunnel, TunnelStatus, READY_CONDITION,
};
use cloudflared_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use cloudflared_common::kube_utils::{
    add_finalizer, has_finalizer, not_found_to_none, remove_finalizer,
};
use cloudflared_common::{
    KubeMergePatch, MergePatchApi, ObjectKey, PatchScope, ScopedPatcher, RESTARTED_AT_ANNOTATION,
    TUNNEL_CONTROLLER_NAME, TUNNEL_FINALIZER,
};

use crate::resources::{ChildNames, OwnedResources, TunnelResources, DEFAULT_CLOUDFLARED_IMAGE};
use crate::routes::{desired_routes_or_apex, routes_to_register};
use crate::TunnelError;

/// Requeue delay while waiting on an external condition (zone, drain)
pub const WAIT_REQUEUE: Duration = Duration::from_secs(10);

/// Ready condition reasons
pub mod ready_reasons {
    /// Everything the Tunnel asks for is in place
    pub const CONVERGED: &str = "Converged";
    /// The zone named by the origin certificate could not be resolved yet
    pub const ZONE_UNRESOLVED: &str = "ZoneUnresolved";
    /// cloudflared is being scaled down ahead of deletion
    pub const DRAINING: &str = "Draining";
    /// The last pass hit an error that needs attention
    pub const FAILED: &str = "Failed";
}

/// Result of a successful pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until the object changes
    Settled,
    /// Progress depends on something outside our control; look again later
    RetryAfter(Duration),
}

impl From<Outcome> for Action {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Settled => Action::await_change(),
            Outcome::RetryAfter(delay) => Action::requeue(delay),
        }
    }
}

/// Object kinds the tunnel controller patches
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchTarget {
    Tunnel,
    ConfigMap,
    Deployment,
}

/// Kubernetes operations needed by the tunnel controller
///
/// Reads return `Ok(None)` for objects that do not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelKubeClient: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, kube::Error>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), kube::Error>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, kube::Error>;

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), kube::Error>;

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube::Error>;

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), kube::Error>;

    /// Apply a JSON merge patch to one scope of an object
    async fn merge_patch(
        &self,
        target: PatchTarget,
        key: &ObjectKey,
        scope: PatchScope,
        patch: &Value,
    ) -> Result<(), kube::Error>;
}

/// Real Kubernetes client implementation
pub struct TunnelKubeClientImpl {
    client: Client,
    tunnels: KubeMergePatch,
    config_maps: KubeMergePatch,
    deployments: KubeMergePatch,
}

impl TunnelKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self {
            tunnels: KubeMergePatch::for_resource::<Tunnel>(client.clone(), TUNNEL_CONTROLLER_NAME),
            config_maps: KubeMergePatch::for_resource::<ConfigMap>(
                client.clone(),
                TUNNEL_CONTROLLER_NAME,
            ),
            deployments: KubeMergePatch::for_resource::<Deployment>(
                client.clone(),
                TUNNEL_CONTROLLER_NAME,
            ),
            client,
        }
    }
}

#[async_trait]
impl TunnelKubeClient for TunnelKubeClientImpl {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        not_found_to_none(api.get(name).await)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, kube::Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        not_found_to_none(api.get(name).await)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), kube::Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), config_map).await?;
        Ok(())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        not_found_to_none(api.get(name).await)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn merge_patch(
        &self,
        target: PatchTarget,
        key: &ObjectKey,
        scope: PatchScope,
        patch: &Value,
    ) -> Result<(), kube::Error> {
        let api = match target {
            PatchTarget::Tunnel => &self.tunnels,
            PatchTarget::ConfigMap => &self.config_maps,
            PatchTarget::Deployment => &self.deployments,
        };
        api.merge_patch(key, scope, patch).await
    }
}

/// [`MergePatchApi`] view of a [`TunnelKubeClient`] for one object kind
struct TargetPatchApi<'a> {
    kube: &'a dyn TunnelKubeClient,
    target: PatchTarget,
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

/// Tunables for the tunnel controller
#[derive(Clone, Debug)]
pub struct TunnelControllerConfig {
    /// cloudflared image used when a Tunnel does not name one
    pub default_image: String,
    /// Requeue delay after an error that may clear on its own
    pub retry_requeue: Duration,
    /// Requeue delay after an error that needs a user fix
    pub failure_requeue: Duration,
}

impl Default for TunnelControllerConfig {
    fn default() -> Self {
        Self {
            default_image: DEFAULT_CLOUDFLARED_IMAGE.to_string(),
            retry_requeue: Duration::from_secs(30),
            failure_requeue: Duration::from_secs(300),
        }
    }
}

/// Shared context for the Tunnel controller
///
/// Use [`TunnelContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = TunnelContext::builder(client, provider)
///     .config(config)
///     .build();
/// ```
pub struct TunnelContext {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn TunnelKubeClient>,
    /// Builds a Cloudflare client from an origin certificate
    pub cloudflare: Arc<dyn TunnelApiProvider>,
    /// Event publisher for Tunnel events
    pub events: Arc<dyn EventPublisher>,
    pub config: TunnelControllerConfig,
}

impl TunnelContext {
    /// Create a builder for constructing a TunnelContext
    pub fn builder(client: Client, cloudflare: Arc<dyn TunnelApiProvider>) -> TunnelContextBuilder {
        TunnelContextBuilder::new(client, cloudflare)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn TunnelKubeClient>,
        cloudflare: Arc<dyn TunnelApiProvider>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            cloudflare,
            events,
            config: TunnelControllerConfig::default(),
        }
    }

    fn patch_api(&self, target: PatchTarget) -> TargetPatchApi<'_> {
        TargetPatchApi {
            kube: self.kube.as_ref(),
            target,
        }
    }

    async fn publish(
        &self,
        tunnel: &Tunnel,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(&tunnel.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }
}

/// Builder for [`TunnelContext`]
pub struct TunnelContextBuilder {
    client: Client,
    cloudflare: Arc<dyn TunnelApiProvider>,
    kube: Option<Arc<dyn TunnelKubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: TunnelControllerConfig,
}

impl TunnelContextBuilder {
    fn new(client: Client, cloudflare: Arc<dyn TunnelApiProvider>) -> Self {
        Self {
            client,
            cloudflare,
            kube: None,
            events: None,
            config: TunnelControllerConfig::default(),
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn TunnelKubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: TunnelControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the TunnelContext
    pub fn build(self) -> TunnelContext {
        TunnelContext {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(TunnelKubeClientImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(
                    self.client.clone(),
                    TUNNEL_CONTROLLER_NAME,
                ))
            }),
            cloudflare: self.cloudflare,
            config: self.config,
        }
    }
}

/// What happened to a child object during a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChildOperation {
    Created,
    Updated,
    Unchanged,
}

/// Reconcile a Tunnel resource
///
/// Failures are returned after being reported as events; the pass is
/// retried by [`error_policy`].
#[instrument(skip(tunnel, ctx), fields(tunnel = %tunnel.name_any()))]
pub async fn reconcile(tunnel: Arc<Tunnel>, ctx: Arc<TunnelContext>) -> Result<Action, TunnelError> {
    let result = if tunnel.metadata.deletion_timestamp.is_some() {
        drain(&tunnel, &ctx).await
    } else {
        converge(&tunnel, &ctx).await
    };

    match result {
        Ok(outcome) => Ok(outcome.into()),
        Err(e) => {
            let reason = if matches!(e, TunnelError::InvariantViolation { .. }) {
                reasons::INVARIANT_VIOLATION
            } else {
                reasons::RECONCILE_FAILED
            };
            ctx.publish(
                &tunnel,
                EventType::Warning,
                reason,
                actions::RECONCILE,
                e.to_string(),
            )
            .await;
            Err(e)
        }
    }
}

/// Requeue policy for failed passes
pub fn error_policy(tunnel: Arc<Tunnel>, error: &TunnelError, ctx: Arc<TunnelContext>) -> Action {
    error!(
        ?error,
        tunnel = %tunnel.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.config.retry_requeue)
    } else {
        Action::requeue(ctx.config.failure_requeue)
    }
}

async fn converge(tunnel: &Tunnel, ctx: &TunnelContext) -> Result<Outcome, TunnelError> {
    let namespace = tunnel.namespace().ok_or(TunnelError::MissingNamespace)?;
    let resources = TunnelResources::new(tunnel, &ctx.config.default_image)?;
    let names = resources.child_names();
    info!("Reconciling");

    if !has_finalizer(&tunnel.metadata, TUNNEL_FINALIZER) {
        info!("Adding finalizer");
        let patcher = ScopedPatcher::open(tunnel)?.with_optimistic_lock();
        let mut updated = tunnel.clone();
        add_finalizer(&mut updated.metadata, TUNNEL_FINALIZER);
        patcher
            .commit(&ctx.patch_api(PatchTarget::Tunnel), &updated)
            .await?;
    }

    let mut status = tunnel.status.clone().unwrap_or_default();
    let cloudflare = connect_cloudflare(tunnel, &namespace, ctx).await?;

    debug!(zone_id = cloudflare.zone_id(), "Resolving zone");
    let zone = match cloudflare.get_zone(cloudflare.zone_id()).await {
        Ok(zone) if !zone.name.is_empty() => zone,
        Ok(_) => return zone_unresolved(tunnel, ctx, status).await,
        Err(e) if e.is_not_found() => return zone_unresolved(tunnel, ctx, status).await,
        Err(e) => return Err(e.into()),
    };
    status.zone = Some(zone.name.clone());

    let record = match cloudflare.find_by_name(&names.external).await {
        Ok(record) => {
            let secret = ctx.kube.get_secret(&namespace, &names.secret).await?;
            if let Some(problem) = credentials_problem(secret.as_ref(), names, &record) {
                let message = format!(
                    "cloudflare tunnel {} ({}): {problem}; \
                     delete the cloudflare tunnel or the Tunnel to recover",
                    names.external, record.id
                );
                error!(tunnel_id = %record.id, "{message}");
                set_ready(&mut status, ConditionStatus::False, ready_reasons::FAILED, &message);
                persist_status_before_failing(tunnel, ctx, status).await;
                return Err(TunnelError::InvariantViolation {
                    tunnel: ObjectKey::of(tunnel).to_string(),
                    message,
                });
            }
            record
        }
        Err(e) if e.is_not_found() => {
            info!(name = %names.external, "Creating cloudflare tunnel");
            let created = cloudflare.create(&names.external).await?;
            // The credentials are only returned once; the secret is written
            // before anything else can fail.
            let secret = resources.build_secret(&created.credentials)?;
            ctx.kube.create_secret(&namespace, &secret).await?;
            ctx.publish(
                tunnel,
                EventType::Normal,
                reasons::TUNNEL_CREATED,
                actions::RECONCILE,
                format!("created cloudflare tunnel {} ({})", names.external, created.record.id),
            )
            .await;
            created.record
        }
        Err(e) => return Err(e.into()),
    };
    status.tunnel_id = Some(record.id.clone());

    for hostname in routes_to_register(&tunnel.spec.rules, &status.routes, &zone.name) {
        info!(%hostname, "Registering route");
        if let Err(e) = cloudflare.register_route(&record.id, &hostname).await {
            warn!(%hostname, error = %e, "Route registration failed");
            persist_status_before_failing(tunnel, ctx, status).await;
            return Err(e.into());
        }
        status.add_route(&hostname);
        ctx.publish(
            tunnel,
            EventType::Normal,
            reasons::ROUTE_REGISTERED,
            actions::RECONCILE,
            format!("routed {hostname} to tunnel {}", record.id),
        )
        .await;
    }
    status.routes = desired_routes_or_apex(&tunnel.spec.rules, &zone.name)
        .into_iter()
        .collect();

    let config_op = apply_config_map(&resources, &namespace, ctx).await?;
    debug!(operation = ?config_op, "Reconciled tunnel config map");
    if config_op == ChildOperation::Updated {
        ctx.publish(
            tunnel,
            EventType::Normal,
            reasons::CONFIG_UPDATED,
            actions::RECONCILE,
            format!("config map {} updated, restarting cloudflared", names.config_map),
        )
        .await;
    }

    let deployment_op = apply_deployment(&resources, &namespace, config_op, ctx).await?;
    debug!(operation = ?deployment_op, "Reconciled tunnel deployment");

    set_ready(
        &mut status,
        ConditionStatus::True,
        ready_reasons::CONVERGED,
        "tunnel is routed and cloudflared is running",
    );
    persist_status(tunnel, ctx, status).await?;
    Ok(Outcome::Settled)
}

async fn drain(tunnel: &Tunnel, ctx: &TunnelContext) -> Result<Outcome, TunnelError> {
    if !has_finalizer(&tunnel.metadata, TUNNEL_FINALIZER) {
        return Ok(Outcome::Settled);
    }
    let namespace = tunnel.namespace().ok_or(TunnelError::MissingNamespace)?;
    let resources = TunnelResources::new(tunnel, &ctx.config.default_image)?;
    let names = resources.child_names();
    info!("Reconciling deletion");

    if let Some(deployment) = ctx
        .kube
        .get_deployment(&namespace, &names.deployment)
        .await?
    {
        let replicas = deployment.spec.as_ref().and_then(|s| s.replicas);
        if replicas != Some(0) {
            info!(?replicas, "Scaling cloudflared to 0");
            let patcher = ScopedPatcher::open(&deployment)?;
            let mut updated = deployment.clone();
            updated.spec.get_or_insert_with(Default::default).replicas = Some(0);
            patcher
                .commit(&ctx.patch_api(PatchTarget::Deployment), &updated)
                .await?;

            let mut status = tunnel.status.clone().unwrap_or_default();
            set_ready(
                &mut status,
                ConditionStatus::False,
                ready_reasons::DRAINING,
                "waiting for cloudflared to stop",
            );
            persist_status(tunnel, ctx, status).await?;
            ctx.publish(
                tunnel,
                EventType::Normal,
                reasons::DRAINING,
                actions::DELETE,
                format!("scaled {} to 0 ahead of tunnel deletion", names.deployment),
            )
            .await;
            return Ok(Outcome::RetryAfter(WAIT_REQUEUE));
        }
    }

    let cloudflare = connect_cloudflare(tunnel, &namespace, ctx).await?;
    match cloudflare.find_by_name(&names.external).await {
        Ok(record) => {
            info!(tunnel_id = %record.id, "Deleting cloudflare tunnel");
            match cloudflare.delete(&record.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("Cloudflare tunnel already deleted"),
                Err(e) => return Err(e.into()),
            }
            ctx.publish(
                tunnel,
                EventType::Normal,
                reasons::TUNNEL_DELETED,
                actions::DELETE,
                format!("deleted cloudflare tunnel {} ({})", names.external, record.id),
            )
            .await;
        }
        Err(e) if e.is_not_found() => debug!("Cloudflare tunnel already gone"),
        Err(e) => return Err(e.into()),
    }

    info!("Removing finalizer");
    let patcher = ScopedPatcher::open(tunnel)?.with_optimistic_lock();
    let mut updated = tunnel.clone();
    remove_finalizer(&mut updated.metadata, TUNNEL_FINALIZER);
    patcher
        .commit(&ctx.patch_api(PatchTarget::Tunnel), &updated)
        .await?;
    Ok(Outcome::Settled)
}

/// Build a Cloudflare client from the Tunnel's origin certificate
async fn connect_cloudflare(
    tunnel: &Tunnel,
    namespace: &str,
    ctx: &TunnelContext,
) -> Result<Arc<dyn TunnelApi>, TunnelError> {
    let reference = &tunnel.spec.origin_cert;
    reference.validate()?;

    let resource = ObjectKey::of(tunnel).to_string();
    let secret = ctx
        .kube
        .get_secret(namespace, &reference.name)
        .await?
        .ok_or_else(|| {
            cloudflared_common::Error::validation_for_field(
                resource.clone(),
                "spec.originCert.name",
                format!("origin certificate secret {} not found", reference.name),
            )
        })?;

    let cert = secret
        .data
        .as_ref()
        .and_then(|data| data.get(reference.key()))
        .ok_or_else(|| {
            cloudflared_common::Error::validation_for_field(
                resource,
                "spec.originCert.key",
                format!(
                    "origin certificate secret {} has no key {}",
                    reference.name,
                    reference.key()
                ),
            )
        })?;

    Ok(ctx.cloudflare.connect(&cert.0)?)
}

async fn zone_unresolved(
    tunnel: &Tunnel,
    ctx: &TunnelContext,
    mut status: TunnelStatus,
) -> Result<Outcome, TunnelError> {
    warn!("Zone not resolved yet");
    set_ready(
        &mut status,
        ConditionStatus::False,
        ready_reasons::ZONE_UNRESOLVED,
        "the zone named by the origin certificate could not be resolved",
    );
    persist_status(tunnel, ctx, status).await?;
    Ok(Outcome::RetryAfter(WAIT_REQUEUE))
}

fn set_ready(status: &mut TunnelStatus, value: ConditionStatus, reason: &str, message: &str) {
    set_condition(
        &mut status.conditions,
        Condition::new(READY_CONDITION, value, reason, message),
    );
}

/// Persist `status` as a patch against the Tunnel as it was read
async fn persist_status(
    tunnel: &Tunnel,
    ctx: &TunnelContext,
    status: TunnelStatus,
) -> Result<(), TunnelError> {
    let patcher = ScopedPatcher::open(tunnel)?;
    let mut updated = tunnel.clone();
    updated.status = Some(status);
    patcher
        .commit(&ctx.patch_api(PatchTarget::Tunnel), &updated)
        .await?;
    Ok(())
}

/// Record progress ahead of returning a pass error
///
/// A failed write is logged, never returned, so the caller's error is the one
/// that reaches `error_policy`.
async fn persist_status_before_failing(tunnel: &Tunnel, ctx: &TunnelContext, status: TunnelStatus) {
    if let Err(e) = persist_status(tunnel, ctx, status).await {
        warn!(error = %e, "Failed to persist status of failed pass");
    }
}

/// Why the credential Secret cannot run `record`, or `None` when it can
fn credentials_problem(
    secret: Option<&Secret>,
    names: &ChildNames,
    record: &TunnelRecord,
) -> Option<String> {
    let Some(secret) = secret else {
        return Some(format!("credential secret {} is missing", names.secret));
    };
    let file = names.credentials_file();
    let Some(bytes) = secret.data.as_ref().and_then(|data| data.get(&file)) else {
        return Some(format!("credential secret {} has no key {file}", names.secret));
    };
    match serde_json::from_slice::<TunnelCredentials>(&bytes.0) {
        Ok(credentials) if credentials.tunnel_id == record.id => None,
        Ok(credentials) => Some(format!(
            "credential secret {} belongs to tunnel {}",
            names.secret, credentials.tunnel_id
        )),
        Err(e) => Some(format!(
            "credential secret {} holds undecodable {file}: {e}",
            names.secret
        )),
    }
}

fn merge_labels(existing: &mut Option<BTreeMap<String, String>>, desired: Option<BTreeMap<String, String>>) {
    if let Some(desired) = desired {
        existing.get_or_insert_with(BTreeMap::new).extend(desired);
    }
}

async fn apply_config_map(
    resources: &TunnelResources<'_>,
    namespace: &str,
    ctx: &TunnelContext,
) -> Result<ChildOperation, TunnelError> {
    let desired = resources.build_config_map()?;
    let name = &resources.child_names().config_map;

    let Some(existing) = ctx.kube.get_config_map(namespace, name).await? else {
        ctx.kube.create_config_map(namespace, &desired).await?;
        return Ok(ChildOperation::Created);
    };

    let data_changed = existing.data != desired.data;
    let patcher = ScopedPatcher::open(&existing)?;
    let mut updated = existing.clone();
    updated.data = desired.data;
    merge_labels(&mut updated.metadata.labels, desired.metadata.labels);
    updated.metadata.owner_references = desired.metadata.owner_references;

    // A metadata-only patch does not count as an update: cloudflared only
    // needs a restart when the config document changed.
    patcher
        .commit(&ctx.patch_api(PatchTarget::ConfigMap), &updated)
        .await?;
    Ok(if data_changed {
        ChildOperation::Updated
    } else {
        ChildOperation::Unchanged
    })
}

/// Ensure the Deployment runs one replica of the desired image
///
/// The pod template is stamped with a restart annotation when the config map
/// was updated, so running pods pick up the new configuration.
async fn apply_deployment(
    resources: &TunnelResources<'_>,
    namespace: &str,
    config_op: ChildOperation,
    ctx: &TunnelContext,
) -> Result<ChildOperation, TunnelError> {
    let mut desired = resources.build_deployment();
    let name = &resources.child_names().deployment;

    let Some(existing) = ctx.kube.get_deployment(namespace, name).await? else {
        if let Some(spec) = desired.spec.as_mut() {
            spec.replicas = Some(1);
        }
        ctx.kube.create_deployment(namespace, &desired).await?;
        return Ok(ChildOperation::Created);
    };

    let patcher = ScopedPatcher::open(&existing)?;
    let mut updated = existing.clone();
    merge_labels(&mut updated.metadata.labels, desired.metadata.labels.take());
    updated.metadata.owner_references = desired.metadata.owner_references.take();

    let desired_image = desired
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.clone());

    let spec = updated.spec.get_or_insert_with(Default::default);
    spec.replicas = Some(1);
    if let Some(pod) = spec.template.spec.as_mut() {
        for container in pod.containers.iter_mut() {
            if container.name == "cloudflared" && desired_image.is_some() {
                container.image = desired_image.clone();
            }
        }
    }
    if config_op == ChildOperation::Updated {
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(RESTARTED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());
    }

    let patched = patcher
        .commit(&ctx.patch_api(PatchTarget::Deployment), &updated)
        .await?;
    Ok(if patched.is_empty() {
        ChildOperation::Unchanged
    } else {
        ChildOperation::Updated
    })
}
