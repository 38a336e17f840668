//! Pluggable client authentication.
//!
//! The authenticator runs against the auth map carried in the client's
//! HELLO, before the proxy opens an upstream connection. Picking a strategy
//! is an environment decision so the backend can stay auth-free while an
//! external service owns the credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::ProxyError;
use crate::packstream::value::require_str;
use crate::packstream::Map;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Verifies the credentials of a client HELLO.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Returns `Ok(())` to accept the client, an error to reject it.
    async fn authenticate(&self, auth: &Map) -> Result<(), ProxyError>;
}

/// Builds the authenticator selected by `AUTH_METHOD`, if any.
///
/// `BASIC_AUTH` requires `BASIC_AUTH_URL`; `AAD_TOKEN_AUTH` requires
/// `AAD_TOKEN_PROVIDER` and `AAD_TOKEN_CLIENT_ID`. No method means every
/// client is accepted.
pub fn from_env() -> Result<Option<Arc<dyn Authenticator>>, ProxyError> {
    match std::env::var("AUTH_METHOD").ok().as_deref() {
        Some("BASIC_AUTH") => {
            let url = std::env::var("BASIC_AUTH_URL").map_err(|_| {
                ProxyError::Config("BASIC_AUTH_URL must be set when using BASIC_AUTH".into())
            })?;
            Ok(Some(Arc::new(BasicAuth::new(url)?)))
        }
        Some("AAD_TOKEN_AUTH") => {
            let provider = std::env::var("AAD_TOKEN_PROVIDER").ok();
            let client_id = std::env::var("AAD_TOKEN_CLIENT_ID").ok();
            match (provider, client_id) {
                (Some(provider), Some(client_id)) => {
                    Ok(Some(Arc::new(IdTokenAuth::new(provider, client_id)?)))
                }
                _ => Err(ProxyError::Config(
                    "AAD_TOKEN_PROVIDER and AAD_TOKEN_CLIENT_ID must be set \
                     when using AAD_TOKEN_AUTH"
                        .into(),
                )),
            }
        }
        _ => Ok(None),
    }
}

/// Pulls `principal` and `credentials` out of the HELLO auth map.
fn credentials_from(auth: &Map) -> Result<(&str, &str), ProxyError> {
    let principal = require_str(auth, "principal")
        .map_err(|_| ProxyError::AuthRejected("no principal".into()))?;
    let credentials = require_str(auth, "credentials")
        .map_err(|_| ProxyError::AuthRejected("no credentials".into()))?;
    Ok((principal, credentials))
}

/// Checks `principal:credentials` against an HTTP endpoint with basic auth.
/// Status 200 accepts; anything else rejects, transport failures included.
pub struct BasicAuth {
    url: String,
    client: reqwest::Client,
}

impl BasicAuth {
    pub fn new(url: String) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Config(format!("http client: {e}")))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl Authenticator for BasicAuth {
    async fn authenticate(&self, auth: &Map) -> Result<(), ProxyError> {
        let (principal, credentials) = credentials_from(auth)?;

        let response = self
            .client
            .get(&self.url)
            .basic_auth(principal, Some(credentials))
            .send()
            .await
            .map_err(|e| ProxyError::AuthRejected(format!("auth endpoint unreachable: {e}")))?;

        if response.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(ProxyError::AuthRejected("unauthorized creds".into()))
        }
    }
}

#[derive(Deserialize)]
struct ProviderMetadata {
    issuer: String,
    jwks_uri: String,
}

/// Verifies the `credentials` field as an OIDC ID token: the provider's
/// JWKS signs it and the audience matches the configured client id.
pub struct IdTokenAuth {
    provider: String,
    client_id: String,
    client: reqwest::Client,
}

impl IdTokenAuth {
    pub fn new(provider: String, client_id: String) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Config(format!("http client: {e}")))?;
        Ok(Self {
            provider,
            client_id,
            client,
        })
    }

    async fn discover(&self) -> Result<ProviderMetadata, ProxyError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.provider.trim_end_matches('/')
        );
        self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProxyError::AuthRejected(format!("oidc discovery failed: {e}")))?
            .json::<ProviderMetadata>()
            .await
            .map_err(|e| ProxyError::AuthRejected(format!("bad oidc provider metadata: {e}")))
    }

    async fn fetch_jwks(&self, uri: &str) -> Result<JwkSet, ProxyError> {
        self.client
            .get(uri)
            .send()
            .await
            .map_err(|e| ProxyError::AuthRejected(format!("jwks fetch failed: {e}")))?
            .json::<JwkSet>()
            .await
            .map_err(|e| ProxyError::AuthRejected(format!("bad jwks document: {e}")))
    }
}

#[async_trait]
impl Authenticator for IdTokenAuth {
    async fn authenticate(&self, auth: &Map) -> Result<(), ProxyError> {
        let token = require_str(auth, "credentials")
            .map_err(|_| ProxyError::AuthRejected("no credentials".into()))?;

        let metadata = self.discover().await?;
        let jwks = self.fetch_jwks(&metadata.jwks_uri).await?;

        let header = decode_header(token)
            .map_err(|e| ProxyError::AuthRejected(format!("bad token header: {e}")))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| ProxyError::AuthRejected("token has no key id".into()))?;
        let jwk = jwks
            .find(kid)
            .ok_or_else(|| ProxyError::AuthRejected(format!("no jwk for key id {kid}")))?;
        let key = DecodingKey::from_jwk(jwk)
            .map_err(|e| ProxyError::AuthRejected(format!("unusable jwk: {e}")))?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[&metadata.issuer]);

        decode::<serde_json::Value>(token, &key, &validation)
            .map_err(|e| ProxyError::AuthRejected(format!("token verification failed: {e}")))?;
        Ok(())
    }
}
