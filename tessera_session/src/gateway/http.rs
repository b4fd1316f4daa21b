//! An authority client built on `reqwest`

use std::time::Duration;

use async_trait::async_trait;

use super::{AuthorityClient, Registration, TokenRequest, TokenRequestError, TokenResponse};

/// A request timeout suited to interactive token requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Endpoints of the authority
#[derive(Clone, Debug)]
pub struct AuthorityConfig {
    token_url: reqwest::Url,
    registration_url: reqwest::Url,
}

impl AuthorityConfig {
    /// Constructs a configuration from explicit endpoint URLs
    pub fn new(token_url: reqwest::Url, registration_url: reqwest::Url) -> Self {
        Self {
            token_url,
            registration_url,
        }
    }

    /// Constructs a configuration for an authority using the conventional
    /// `connect/token` and `account/register` endpoint paths under `base`
    pub fn for_issuer(base: &reqwest::Url) -> Result<Self, url::ParseError> {
        Ok(Self {
            token_url: base.join("connect/token")?,
            registration_url: base.join("account/register")?,
        })
    }

    /// The token endpoint
    pub fn token_url(&self) -> &reqwest::Url {
        &self.token_url
    }

    /// The registration endpoint
    pub fn registration_url(&self) -> &reqwest::Url {
        &self.registration_url
    }
}

/// Talks to the authority over HTTP
#[derive(Clone, Debug)]
pub struct ReqwestAuthority {
    client: reqwest::Client,
    config: AuthorityConfig,
}

impl ReqwestAuthority {
    /// Constructs a new authority client from an existing HTTP client
    ///
    /// Refreshes for a session are serialized behind the request in flight, so
    /// `client` should carry a request timeout. A client without one can stall
    /// renewal indefinitely if the authority never answers.
    pub fn new(client: reqwest::Client, config: AuthorityConfig) -> Self {
        Self { client, config }
    }

    /// Constructs a new authority client whose requests give up after `timeout`
    pub fn with_timeout(config: AuthorityConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::new(client, config))
    }
}

#[async_trait]
impl AuthorityClient for ReqwestAuthority {
    async fn request_token(
        &self,
        request: &TokenRequest<'_>,
    ) -> Result<TokenResponse, TokenRequestError> {
        request_token(&self.client, &self.config.token_url, request).await
    }

    #[tracing::instrument(
        err,
        skip(self, registration),
        fields(registration_url = %self.config.registration_url),
    )]
    async fn register(&self, registration: &Registration) -> Result<(), TokenRequestError> {
        let resp = self
            .client
            .post(self.config.registration_url.clone())
            .json(registration)
            .send()
            .await
            .map_err(|e| TokenRequestError::RequestSend(e.into()))?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received registration response from authority"
        );

        error_for_status(resp).await.map(drop)
    }
}

#[tracing::instrument(
    err,
    skip(client, token_url, request),
    fields(
        token_url = %token_url,
        grant_type = request.grant.grant_type(),
        scope = request.scope,
    ),
)]
async fn request_token(
    client: &reqwest::Client,
    token_url: &reqwest::Url,
    request: &TokenRequest<'_>,
) -> Result<TokenResponse, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let resp = client
        .post(token_url.clone())
        .form(request)
        .send()
        .await
        .map_err(|e| TokenRequestError::RequestSend(e.into()))?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from issuing authority"
    );

    let resp = error_for_status(resp).await?;

    let body = resp
        .bytes()
        .await
        .map_err(|e| TokenRequestError::BodyReadError(e.into()))?;
    let resp: TokenResponse = serde_json::from_slice(&body)?;

    tracing::debug!(
        has_id_token = resp.id_token.is_some(),
        has_refresh_token = resp.refresh_token.is_some(),
        lifetime = resp.expires_in,
        "parsed token response"
    );

    Ok(resp)
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, TokenRequestError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp
        .text()
        .await
        .map_err(|e| TokenRequestError::BodyReadError(e.into()))?;
    Err(TokenRequestError::ErrorWithBody {
        status: status.as_u16(),
        body,
    })
}
