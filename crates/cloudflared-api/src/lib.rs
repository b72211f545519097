//! Cloudflare tunnel API client
//!
//! [`TunnelApi`] is the capability the tunnel controller needs from
//! Cloudflare. [`CloudflareClient`] implements it over the v4 REST API and
//! [`TunnelApiProvider`] builds one per origin certificate, since each
//! certificate names its own zone and account.

#![deny(missing_docs)]

mod client;
mod error;
mod origin_cert;
mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use client::{CloudflareClient, CloudflareClientProvider, API_TOKEN_ENV, DEFAULT_BASE_URL};
pub use error::ApiError;
pub use origin_cert::OriginCert;
pub use types::{CreatedTunnel, TunnelCredentials, TunnelRecord, Zone};

/// Operations on Cloudflare tunnels for one zone and account
#[async_trait]
pub trait TunnelApi: Send + Sync {
    /// Zone id this client routes hostnames in
    fn zone_id(&self) -> &str;

    /// Account id this client creates tunnels in
    fn account_id(&self) -> &str;

    /// Look up a zone by id
    async fn get_zone(&self, zone_id: &str) -> Result<Zone, ApiError>;

    /// Find the single live tunnel with this name
    ///
    /// Fails with [`ApiError::NotFound`] when none exists and
    /// [`ApiError::MultipleTunnels`] when the name is ambiguous.
    async fn find_by_name(&self, name: &str) -> Result<TunnelRecord, ApiError>;

    /// Create a tunnel, returning its one-time credentials
    async fn create(&self, name: &str) -> Result<CreatedTunnel, ApiError>;

    /// Delete a tunnel
    async fn delete(&self, tunnel_id: &str) -> Result<(), ApiError>;

    /// Point a DNS hostname at the tunnel, overwriting any existing record
    async fn register_route(&self, tunnel_id: &str, hostname: &str) -> Result<(), ApiError>;
}

/// Builds a [`TunnelApi`] from origin certificate PEM data
pub trait TunnelApiProvider: Send + Sync {
    /// Connect using the zone, account and credentials in the certificate
    fn connect(&self, origin_cert: &[u8]) -> Result<Arc<dyn TunnelApi>, ApiError>;
}
