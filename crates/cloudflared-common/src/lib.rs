//! Common types for the cloudflared operator: CRDs, errors, scoped patching and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod patch;
pub mod telemetry;

pub use error::Error;
pub use patch::{KubeMergePatch, MergePatchApi, ObjectKey, PatchError, PatchScope, ScopedPatcher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by every CRD and label this operator owns
pub const API_GROUP: &str = "cloudflared.cloudflare.com";

/// Label attached to every child resource, valued with the owning object's name
pub const MANAGED_BY_LABEL: &str = "cloudflared.cloudflare.com/managed-by";

/// Pod template annotation stamped to force a rollout after a config change
pub const RESTARTED_AT_ANNOTATION: &str = "cloudflared.cloudflare.com/restarted-at";

/// Finalizer that holds a Tunnel until its external record is gone
pub const TUNNEL_FINALIZER: &str = "tunnel.cloudflared.cloudflare.com";

/// Controller name reported on Tunnel events and field managers
pub const TUNNEL_CONTROLLER_NAME: &str = "cloudflared.cloudflare.com/tunnel-controller";

/// IngressClass controller value handled by the ingress controller
pub const INGRESS_CONTROLLER_NAME: &str = "cloudflared.cloudflare.com/ingress-controller";

/// Field manager used for server-side apply of CRDs
pub const FIELD_MANAGER: &str = "cloudflared-operator";
