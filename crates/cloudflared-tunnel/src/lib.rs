//! Tunnel controller: keeps a Cloudflare tunnel, its DNS routes and the
//! cloudflared workload serving it converged with a `Tunnel` resource.
//!
//! - [`routes`] computes which hostnames still need registering
//! - [`resources`] derives the Secret, ConfigMap and Deployment owned by a Tunnel
//! - [`controller`] is the reconcile state machine run by `kube::runtime`

pub mod controller;
mod error;
pub mod resources;
pub mod routes;

pub use controller::{
    error_policy, reconcile, Outcome, TunnelContext, TunnelControllerConfig, TunnelKubeClient,
};
pub use error::TunnelError;
pub use resources::{ChildNames, OwnedResources, TunnelResources, DEFAULT_CLOUDFLARED_IMAGE};
