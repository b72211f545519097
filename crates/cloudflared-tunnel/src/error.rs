//! Tunnel controller error types

use cloudflared_api::ApiError;
use cloudflared_common::kube_utils::is_transient;
use cloudflared_common::PatchError;

/// Errors that abort a Tunnel reconcile pass
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Common(#[from] cloudflared_common::Error),

    #[error("cloudflare error: {0}")]
    Cloudflare(#[from] ApiError),

    #[error("{0}")]
    Patch(#[from] PatchError),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local state contradicts Cloudflare in a way only an operator can resolve
    #[error("tunnel {tunnel} needs manual remediation: {message}")]
    InvariantViolation { tunnel: String, message: String },

    #[error("missing namespace on Tunnel")]
    MissingNamespace,
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for TunnelError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl TunnelError {
    /// Whether retrying soon can help
    ///
    /// Permanent errors are still retried by the controller, just slowly, so a
    /// user fix is picked up without an edit to the Tunnel.
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::Kube(e) => is_transient(e),
            TunnelError::Common(e) => e.is_retryable(),
            TunnelError::Cloudflare(e) => e.is_retryable(),
            TunnelError::Patch(e) => e.is_retryable(),
            TunnelError::Serialization(_) => false,
            TunnelError::InvariantViolation { .. } => false,
            TunnelError::MissingNamespace => false,
        }
    }
}
