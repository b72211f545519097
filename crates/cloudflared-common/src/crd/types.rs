//! Shared types used across the Tunnel and TunnelConfiguration CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default Secret data key holding the origin certificate
pub const DEFAULT_ORIGIN_CERT_KEY: &str = "cert.pem";

/// Reference to the Secret holding the Cloudflare origin certificate
///
/// Mirrors a typed local object reference: the object lives in the same
/// namespace as the referrer.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OriginCertReference {
    /// API group of the referenced object; empty for the core group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,

    /// Kind of the referenced object; only `Secret` is supported
    #[serde(default = "default_origin_cert_kind")]
    pub kind: String,

    /// Name of the referenced Secret
    pub name: String,

    /// Data key within the Secret (defaults to `cert.pem`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

fn default_origin_cert_kind() -> String {
    "Secret".to_string()
}

impl OriginCertReference {
    /// Reference a Secret by name with the default key
    pub fn secret(name: impl Into<String>) -> Self {
        Self {
            api_group: None,
            kind: default_origin_cert_kind(),
            name: name.into(),
            key: None,
        }
    }

    /// The Secret data key to read
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or(DEFAULT_ORIGIN_CERT_KEY)
    }

    /// Validate that the reference points at a core Secret
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.api_group.as_deref().is_some_and(|g| !g.is_empty()) || self.kind != "Secret" {
            return Err(crate::Error::validation_for_field(
                self.name.clone(),
                "spec.originCert",
                format!(
                    "origin certificate must reference a core Secret, got {}",
                    self.kind
                ),
            ));
        }
        if self.name.is_empty() {
            return Err(crate::Error::validation_for_field(
                UNNAMED,
                "spec.originCert.name",
                "origin certificate reference has no name",
            ));
        }
        Ok(())
    }
}

const UNNAMED: &str = "<unnamed>";

/// Connection tuning for traffic from cloudflared to an origin
///
/// Field names match the cloudflared configuration file, so the struct is
/// rendered into `config.yaml` as-is.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OriginRequest {
    /// Timeout for establishing a new TCP connection (e.g. "30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<String>,

    /// Timeout for completing a TLS handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_timeout: Option<String>,

    /// TCP keep-alive interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_keep_alive: Option<String>,

    /// Disable happy-eyeballs IPv4/IPv6 fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_happy_eyeballs: Option<bool>,

    /// Maximum idle keep-alive connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_connections: Option<u32>,

    /// Idle timeout for keep-alive connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_timeout: Option<String>,

    /// Host header sent to the origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_host_header: Option<String>,

    /// Hostname expected on the origin's certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_name: Option<String>,

    /// Path to a CA bundle used to verify the origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pool: Option<String>,

    /// Skip TLS verification of the origin
    #[serde(
        default,
        rename = "noTLSVerify",
        skip_serializing_if = "Option::is_none"
    )]
    pub no_tls_verify: Option<bool>,

    /// Disable chunked transfer encoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_chunked_encoding: Option<bool>,

    /// Address cloudflared listens on when acting as a proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<String>,

    /// Port cloudflared listens on when acting as a proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,

    /// Proxy type ("" or "socks")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_type: Option<String>,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or replace a condition by type
///
/// The previous transition time is kept when status, reason and message are
/// unchanged, so re-asserting a condition is a structural no-op.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status
                || existing.reason != condition.reason
                || existing.message != condition.message
            {
                *existing = condition;
            }
        }
        None => conditions.push(condition),
    }
}
