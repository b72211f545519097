//! Errors from talking to the Cloudflare API

use thiserror::Error;

/// Errors returned by [`crate::TunnelApi`] implementations
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested object does not exist
    #[error("not found")]
    NotFound,

    /// A name lookup matched more than one tunnel
    #[error("expected at most one tunnel named {name}, found {count}")]
    MultipleTunnels {
        /// Name looked up
        name: String,
        /// Number of live tunnels with that name
        count: usize,
    },

    /// Cloudflare answered with an error envelope or unexpected status
    #[error("cloudflare API error (HTTP {status}, code {code:?}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// First Cloudflare error code, if any
        code: Option<u64>,
        /// Error message
        message: String,
    },

    /// Transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The origin certificate could not be decoded
    #[error("invalid origin certificate: {0}")]
    InvalidOriginCert(String),

    /// No usable credentials
    #[error("no API credentials: configure an API token or use an origin certificate with a service key")]
    MissingCredentials,

    /// A response body could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// True when the object is absent, a branch-selecting condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound)
    }

    /// True when a later attempt can succeed
    ///
    /// Network failures, rate limits, server errors and auth failures (which
    /// clear once a token is rotated) are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(_) => true,
            ApiError::Api { status, .. } => {
                *status >= 500 || matches!(*status, 401 | 403 | 408 | 429)
            }
            ApiError::NotFound
            | ApiError::MultipleTunnels { .. }
            | ApiError::InvalidOriginCert(_)
            | ApiError::MissingCredentials
            | ApiError::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> ApiError {
        ApiError::Api {
            status,
            code: Some(1000),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_not_found_is_branch_not_failure() {
        assert!(ApiError::NotFound.is_not_found());
        assert!(!ApiError::NotFound.is_retryable());
        assert!(!api(404).is_not_found());
    }

    #[test]
    fn test_server_and_auth_errors_retry() {
        assert!(api(502).is_retryable());
        assert!(api(429).is_retryable());
        assert!(api(403).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!ApiError::MultipleTunnels {
            name: "t-web".to_string(),
            count: 2
        }
        .is_retryable());
    }

    #[test]
    fn test_api_error_message() {
        assert_eq!(
            api(400).to_string(),
            "cloudflare API error (HTTP 400, code Some(1000)): boom"
        );
    }
}
