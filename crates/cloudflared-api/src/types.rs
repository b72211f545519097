//! Cloudflare tunnel API objects

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tunnel as listed by Cloudflare
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TunnelRecord {
    /// Tunnel UUID
    pub id: String,
    /// Tunnel name, unique per account among live tunnels
    pub name: String,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Deletion time, set for soft-deleted tunnels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// The cloudflared credentials file for one tunnel
///
/// Cloudflare only reveals the secret at creation, so this must be stored
/// right away.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TunnelCredentials {
    /// Account id owning the tunnel
    pub account_tag: String,
    /// Base64 of the 32-byte tunnel secret
    pub tunnel_secret: String,
    /// Tunnel UUID
    #[serde(rename = "TunnelID")]
    pub tunnel_id: String,
    /// Tunnel name
    pub tunnel_name: String,
}

/// Result of creating a tunnel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedTunnel {
    /// The new tunnel
    pub record: TunnelRecord,
    /// One-time credentials for it
    pub credentials: TunnelCredentials,
}

/// A DNS zone
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Zone {
    /// Zone id
    pub id: String,
    /// Zone apex name (e.g. "example.com")
    pub name: String,
}
