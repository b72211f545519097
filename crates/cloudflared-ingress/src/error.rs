//! Ingress controller error types

use cloudflared_common::kube_utils::is_transient;
use cloudflared_common::PatchError;

/// Errors that abort an Ingress reconcile pass
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Common(#[from] cloudflared_common::Error),

    #[error("{0}")]
    Patch(#[from] PatchError),

    /// The IngressClass parameters do not point at a usable TunnelConfiguration
    #[error("invalid ingress class parameters: {message}")]
    InvalidParameters { message: String },

    #[error("missing namespace on Ingress")]
    MissingNamespace,
}

impl IngressError {
    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::InvalidParameters {
            message: message.into(),
        }
    }

    /// Whether retrying soon can help
    pub fn is_retryable(&self) -> bool {
        match self {
            IngressError::Kube(e) => is_transient(e),
            IngressError::Common(e) => e.is_retryable(),
            IngressError::Patch(e) => e.is_retryable(),
            IngressError::InvalidParameters { .. } | IngressError::MissingNamespace => false,
        }
    }
}
