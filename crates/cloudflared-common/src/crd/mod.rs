//! Custom Resource Definitions for the cloudflared operator

mod tunnel;
mod tunnel_configuration;
mod types;

pub use tunnel::{Tunnel, TunnelIngressRule, TunnelSpec, TunnelStatus, READY_CONDITION};
pub use tunnel_configuration::{TunnelConfiguration, TunnelConfigurationSpec};
pub use types::{
    set_condition, Condition, ConditionStatus, OriginCertReference, OriginRequest,
    DEFAULT_ORIGIN_CERT_KEY,
};
