//! TunnelConfiguration CRD: shared tunnel settings referenced by an IngressClass

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{OriginCertReference, OriginRequest};

/// TunnelConfiguration holds the settings every Tunnel created for an
/// IngressClass inherits.
///
/// Example:
/// ```yaml
/// apiVersion: networking.k8s.io/v1
/// kind: IngressClass
/// metadata:
///   name: cloudflared
/// spec:
///   controller: cloudflared.cloudflare.com/ingress-controller
///   parameters:
///     apiGroup: cloudflared.cloudflare.com
///     kind: TunnelConfiguration
///     name: default
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudflared.cloudflare.com",
    version = "v1alpha1",
    kind = "TunnelConfiguration",
    namespaced,
    printcolumn = r#"{"name":"Origin Cert","type":"string","jsonPath":".spec.originCert.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfigurationSpec {
    /// Secret holding the Cloudflare origin certificate
    pub origin_cert: OriginCertReference,

    /// Connection tuning inherited by generated Tunnels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequest>,

    /// cloudflared image override inherited by generated Tunnels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}
