//! cloudflared operator: runs the Tunnel and Ingress controllers

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod config;
/// Controller runner - builds controller futures for each resource kind
pub mod controller_runner;
/// Startup utilities (CRD install)
pub mod startup;
