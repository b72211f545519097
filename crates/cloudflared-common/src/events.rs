//! Kubernetes Event recording for the cloudflared controllers.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What the controller was doing (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Cloudflare tunnel record created
    pub const TUNNEL_CREATED: &str = "TunnelCreated";
    /// A hostname was routed to the tunnel
    pub const ROUTE_REGISTERED: &str = "RouteRegistered";
    /// cloudflared configuration changed and the deployment was restarted
    pub const CONFIG_UPDATED: &str = "ConfigUpdated";
    /// cloudflared is being scaled down ahead of deletion
    pub const DRAINING: &str = "Draining";
    /// Cloudflare tunnel record deleted
    pub const TUNNEL_DELETED: &str = "TunnelDeleted";
    /// Local state contradicts the external record and needs an operator
    pub const INVARIANT_VIOLATION: &str = "InvariantViolation";
    /// A reconcile pass failed
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// Tunnel generated or updated from an Ingress
    pub const TUNNEL_SYNCED: &str = "TunnelSynced";
}

/// Well-known event action strings.
pub mod actions {
    /// Normal convergence
    pub const RECONCILE: &str = "Reconcile";
    /// Teardown ahead of deletion
    pub const DELETE: &str = "Delete";
}
