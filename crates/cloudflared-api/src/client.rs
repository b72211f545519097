//! reqwest client for the Cloudflare v4 API

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    ApiError, CreatedTunnel, OriginCert, TunnelApi, TunnelApiProvider, TunnelCredentials,
    TunnelRecord, Zone,
};

/// Production API endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// Environment variable conventionally holding the API token
pub const API_TOKEN_ENV: &str = "CF_API_TOKEN";

const SERVICE_KEY_HEADER: &str = "X-Auth-User-Service-Key";
const TUNNEL_API_ACCEPT: &str = "application/json;version=1";
const TUNNEL_SECRET_LEN: usize = 32;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<EnvelopeError>,
    result: Option<T>,
}

#[derive(Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    code: u64,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct CreateTunnelPayload<'a> {
    name: &'a str,
    tunnel_secret: &'a str,
}

#[derive(Serialize)]
struct DnsRoutePayload<'a> {
    #[serde(rename = "type")]
    type_: &'static str,
    user_hostname: &'a str,
    overwrite_existing: bool,
}

/// [`TunnelApi`] over the Cloudflare REST API
pub struct CloudflareClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    service_key: Option<String>,
    account_id: String,
    zone_id: String,
}

impl CloudflareClient {
    /// Client for the zone and account named by `cert`
    ///
    /// An explicit `api_token` takes precedence over one embedded in the
    /// certificate. The certificate's service key is sent alongside when present.
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_token: Option<String>,
        cert: OriginCert,
    ) -> Result<Self, ApiError> {
        let api_token = api_token.filter(|t| !t.is_empty()).or(cert.api_token);
        if api_token.is_none() && cert.service_key.is_none() {
            return Err(ApiError::MissingCredentials);
        }
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            service_key: cert.service_key,
            account_id: cert.account_id,
            zone_id: cert.zone_id,
        })
    }

    fn url(&self, segments: &[&str]) -> String {
        format!("{}/{}", self.base_url, segments.join("/"))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let mut req = req.header(ACCEPT, TUNNEL_API_ACCEPT);
        if let Some(token) = &self.api_token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(key) = &self.service_key {
            req = req.header(SERVICE_KEY_HEADER, key);
        }
        req
    }

    /// Send a request and unwrap the response envelope
    ///
    /// HTTP 404 maps to [`ApiError::NotFound`]. `Ok(None)` means the call
    /// succeeded without a `result`.
    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<Option<T>, ApiError> {
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound);
        }
        let body = resp.bytes().await?;

        let envelope: Envelope<T> = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => {
                return Err(ApiError::Api {
                    status: status.as_u16(),
                    code: None,
                    message: String::from_utf8_lossy(&body).into_owned(),
                })
            }
        };

        if !status.is_success() || !envelope.success {
            let first = envelope.errors.into_iter().next();
            return Err(ApiError::Api {
                status: status.as_u16(),
                code: first.as_ref().map(|e| e.code),
                message: first
                    .map(|e| e.message)
                    .unwrap_or_else(|| "request was not successful".to_string()),
            });
        }
        Ok(envelope.result)
    }

    async fn send_expecting<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        self.send(req).await?.ok_or_else(|| ApiError::Api {
            status: StatusCode::OK.as_u16(),
            code: None,
            message: "response has no result".to_string(),
        })
    }
}

#[async_trait]
impl TunnelApi for CloudflareClient {
    fn zone_id(&self) -> &str {
        &self.zone_id
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn get_zone(&self, zone_id: &str) -> Result<Zone, ApiError> {
        debug!(zone_id, "Getting zone");
        self.send_expecting(self.http.get(self.url(&["zones", zone_id])))
            .await
    }

    async fn find_by_name(&self, name: &str) -> Result<TunnelRecord, ApiError> {
        debug!(name, "Getting tunnel by name");
        let req = self
            .http
            .get(self.url(&["accounts", &self.account_id, "tunnels"]))
            .query(&[("name", name), ("is_deleted", "false")]);
        let tunnels: Vec<TunnelRecord> = self.send(req).await?.unwrap_or_default();

        let count = tunnels.len();
        let mut iter = tunnels.into_iter();
        match (iter.next(), count) {
            (Some(tunnel), 1) => Ok(tunnel),
            (None, _) => Err(ApiError::NotFound),
            _ => Err(ApiError::MultipleTunnels {
                name: name.to_string(),
                count,
            }),
        }
    }

    async fn create(&self, name: &str) -> Result<CreatedTunnel, ApiError> {
        debug!(name, "Creating tunnel");
        let mut secret = [0u8; TUNNEL_SECRET_LEN];
        rand::rng().fill_bytes(&mut secret);
        let tunnel_secret = STANDARD.encode(secret);

        let req = self
            .http
            .post(self.url(&["accounts", &self.account_id, "tunnels"]))
            .json(&CreateTunnelPayload {
                name,
                tunnel_secret: &tunnel_secret,
            });
        let record: TunnelRecord = self.send_expecting(req).await?;

        let credentials = TunnelCredentials {
            account_tag: self.account_id.clone(),
            tunnel_secret,
            tunnel_id: record.id.clone(),
            tunnel_name: record.name.clone(),
        };
        Ok(CreatedTunnel {
            record,
            credentials,
        })
    }

    async fn delete(&self, tunnel_id: &str) -> Result<(), ApiError> {
        debug!(tunnel_id, "Deleting tunnel");
        let req = self
            .http
            .delete(self.url(&["accounts", &self.account_id, "tunnels", tunnel_id]));
        self.send::<serde_json::Value>(req).await.map(|_| ())
    }

    async fn register_route(&self, tunnel_id: &str, hostname: &str) -> Result<(), ApiError> {
        debug!(tunnel_id, hostname, "Routing tunnel");
        let req = self
            .http
            .put(self.url(&["zones", &self.zone_id, "tunnels", tunnel_id, "routes"]))
            .json(&DnsRoutePayload {
                type_: "dns",
                user_hostname: hostname,
                overwrite_existing: true,
            });
        self.send::<serde_json::Value>(req).await.map(|_| ())
    }
}

/// Builds a [`CloudflareClient`] per origin certificate, sharing one HTTP pool
pub struct CloudflareClientProvider {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl CloudflareClientProvider {
    /// Provider for `base_url`, optionally authenticating with an API token
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("cloudflared-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_token,
        })
    }
}

impl TunnelApiProvider for CloudflareClientProvider {
    fn connect(&self, origin_cert: &[u8]) -> Result<Arc<dyn TunnelApi>, ApiError> {
        let cert = OriginCert::decode(origin_cert)?;
        let client = CloudflareClient::new(
            self.http.clone(),
            &self.base_url,
            self.api_token.clone(),
            cert,
        )?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(service_key: Option<&str>, api_token: Option<&str>) -> OriginCert {
        OriginCert {
            zone_id: "zone-1".to_string(),
            account_id: "acct-1".to_string(),
            service_key: service_key.map(str::to_string),
            api_token: api_token.map(str::to_string),
        }
    }

    #[test]
    fn test_requires_some_credential() {
        let err = CloudflareClient::new(
            reqwest::Client::new(),
            DEFAULT_BASE_URL,
            None,
            cert(None, None),
        )
        .err();
        assert!(matches!(err, Some(ApiError::MissingCredentials)));

        let err = CloudflareClient::new(
            reqwest::Client::new(),
            DEFAULT_BASE_URL,
            Some(String::new()),
            cert(None, None),
        )
        .err();
        assert!(matches!(err, Some(ApiError::MissingCredentials)));
    }

    #[test]
    fn test_explicit_token_wins_over_certificate_token() {
        let client = CloudflareClient::new(
            reqwest::Client::new(),
            "http://localhost:1234/",
            Some("explicit".to_string()),
            cert(None, Some("embedded")),
        )
        .unwrap();
        assert_eq!(client.api_token.as_deref(), Some("explicit"));
        assert_eq!(client.url(&["zones", "z"]), "http://localhost:1234/zones/z");
        assert_eq!(client.zone_id(), "zone-1");
        assert_eq!(client.account_id(), "acct-1");
    }

    #[test]
    fn test_provider_rejects_bad_certificate() {
        let provider = CloudflareClientProvider::new(DEFAULT_BASE_URL, None).unwrap();
        assert!(matches!(
            provider.connect(b"not a cert").err(),
            Some(ApiError::InvalidOriginCert(_))
        ));
    }

    #[test]
    fn test_provider_connects_with_service_key_only() {
        let provider = CloudflareClientProvider::new(DEFAULT_BASE_URL, None).unwrap();
        let pem = crate::origin_cert::encode_test_cert(
            r#"{"zoneID":"zone-9","accountID":"acct-9","serviceKey":"v1.0-key"}"#,
        );
        let api = provider.connect(&pem).unwrap();
        assert_eq!(api.zone_id(), "zone-9");
    }
}
