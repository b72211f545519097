//! Tunnel CRD: a Cloudflare tunnel plus the cloudflared workload serving it

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::tunnel_configuration::TunnelConfigurationSpec;
use super::types::{Condition, OriginCertReference, OriginRequest};

/// Condition type reported on every Tunnel
pub const READY_CONDITION: &str = "Ready";

/// Tunnel declares the hostnames a cloudflared deployment should serve.
///
/// Example:
/// ```yaml
/// apiVersion: cloudflared.cloudflare.com/v1alpha1
/// kind: Tunnel
/// metadata:
///   name: web
/// spec:
///   originCert:
///     kind: Secret
///     name: cloudflared-cert
///   rules:
///     - hostname: web.example.com
///       service: http://web:80
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudflared.cloudflare.com",
    version = "v1alpha1",
    kind = "Tunnel",
    namespaced,
    status = "TunnelStatus",
    printcolumn = r#"{"name":"Zone","type":"string","jsonPath":".status.zone"}"#,
    printcolumn = r#"{"name":"Tunnel ID","type":"string","jsonPath":".status.tunnelId"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    /// Secret holding the Cloudflare origin certificate
    pub origin_cert: OriginCertReference,

    /// Connection tuning applied to rules that do not set their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequest>,

    /// cloudflared image override for this tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Ordered ingress rules; the first match wins
    #[serde(default)]
    pub rules: Vec<TunnelIngressRule>,
}

impl TunnelSpec {
    /// Build a Tunnel spec from a shared configuration and a rule list
    pub fn from_configuration(config: &TunnelConfigurationSpec, rules: Vec<TunnelIngressRule>) -> Self {
        Self {
            origin_cert: config.origin_cert.clone(),
            origin_request: config.origin_request.clone(),
            image: config.image.clone(),
            rules,
        }
    }
}

/// One cloudflared ingress rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelIngressRule {
    /// Hostname to match; absent or empty matches every host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Path regex to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Origin service URL (e.g. "http://web:80") or a cloudflared builtin
    pub service: String,

    /// Per-rule connection tuning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequest>,
}

impl TunnelIngressRule {
    /// Rule routing a hostname to a service
    pub fn new(hostname: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            service: service.into(),
            ..Default::default()
        }
    }

    /// Rule matching every request
    pub fn catch_all(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }

    /// Hostname if set and non-empty
    pub fn routable_hostname(&self) -> Option<&str> {
        self.hostname.as_deref().filter(|h| !h.is_empty())
    }

    /// True when the rule matches any host and any path
    pub fn is_catch_all(&self) -> bool {
        self.routable_hostname().is_none() && self.path.as_deref().is_none_or(str::is_empty)
    }
}

/// Reconciler-owned view of what has been achieved for a Tunnel
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    /// Name of the Cloudflare zone the tunnel routes in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    /// Hostnames registered at Cloudflare, kept sorted and unique
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,

    /// Cloudflare tunnel id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl TunnelStatus {
    /// Record a hostname as routed, keeping the list sorted and unique
    ///
    /// The list is normalized first since the stored order is not trusted.
    pub fn add_route(&mut self, hostname: &str) {
        let mut routes: BTreeSet<String> = std::mem::take(&mut self.routes).into_iter().collect();
        routes.insert(hostname.to_string());
        self.routes = routes.into_iter().collect();
    }

    /// The Ready condition, if reported
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == READY_CONDITION)
    }
}
