//! Ingress support: turns Ingresses of a cloudflared IngressClass into Tunnels

pub mod controller;
mod error;
pub mod translate;

pub use controller::{error_policy, reconcile, IngressContext, IngressKubeClient};
pub use error::IngressError;
