//! Token acquisition against an OAuth2 authority

use std::{error, fmt, sync::Arc};

use async_trait::async_trait;
use tessera_clock::Clock;
use thiserror::Error;

use crate::{AuthError, RefreshTokenRef, TokenSet};

pub mod dto;
#[cfg(feature = "reqwest")]
pub mod http;

pub use dto::{Grant, PasswordGrant, Registration, TokenRequest, TokenResponse};
#[cfg(feature = "reqwest")]
pub use http::{AuthorityConfig, ReqwestAuthority, DEFAULT_REQUEST_TIMEOUT};

/// The scope requested with every grant unless configured otherwise
pub const DEFAULT_SCOPE: &str = "openid offline_access";

type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// An error while attempting to talk to the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The authority answered with an error status
    #[error("error response from authority ({status}): {body}")]
    ErrorWithBody {
        /// The HTTP status code
        status: u16,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// The token response lacked a token the session requires
    #[error("token response did not include `{0}`")]
    MissingToken(&'static str),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] BoxError),
    /// Unable to send a request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] BoxError),
}

impl TokenRequestError {
    /// The payload to surface to a user for this failure
    ///
    /// An authority error body is passed on as JSON if it parses as JSON;
    /// anything else is described as a string.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::ErrorWithBody { body, .. } => serde_json::from_str(body)
                .unwrap_or_else(|_| serde_json::Value::String(body.clone())),
            other => serde_json::Value::String(other.to_string()),
        }
    }
}

/// An HTTP client capable of talking to the authority
#[async_trait]
pub trait AuthorityClient: Send + Sync {
    /// Posts a form-encoded token request to the token endpoint
    async fn request_token(
        &self,
        request: &TokenRequest<'_>,
    ) -> Result<TokenResponse, TokenRequestError>;

    /// Posts a JSON registration payload to the registration endpoint
    async fn register(&self, registration: &Registration) -> Result<(), TokenRequestError>;
}

/// Performs grants against the authority and normalizes the results
///
/// The absolute expiration of every token set is computed locally from the
/// reported lifetime at the moment the response arrives.
#[derive(Clone)]
pub struct TokenGateway {
    authority: Arc<dyn AuthorityClient>,
    clock: Arc<dyn Clock + Send + Sync>,
    scope: String,
}

impl TokenGateway {
    /// Constructs a new gateway requesting the default scope
    pub fn new(authority: Arc<dyn AuthorityClient>, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            authority,
            clock,
            scope: DEFAULT_SCOPE.to_owned(),
        }
    }

    /// Sets the scope sent with each grant
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// The scope sent with each grant
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Exchanges resource owner credentials for a token set
    ///
    /// Any failure is reported as [`AuthError::AuthRejected`].
    pub async fn acquire(&self, credentials: &PasswordGrant) -> Result<TokenSet, AuthError> {
        let request = TokenRequest {
            grant: Grant::Password(credentials),
            scope: &self.scope,
        };

        let result = self.request(&request).await.and_then(|resp| {
            let refresh_token = resp
                .refresh_token
                .clone()
                .ok_or(TokenRequestError::MissingToken("refresh_token"))?;
            self.token_set(resp, refresh_token)
        });

        result.map_err(|error| {
            tracing::info!(
                username = %credentials.username,
                error = (&error as &dyn error::Error),
                "password grant rejected"
            );
            AuthError::rejected(error.payload())
        })
    }

    /// Exchanges a refresh token for a new token set
    ///
    /// Any failure is reported as [`AuthError::SessionExpired`]. If the
    /// authority does not rotate the refresh token, the current one is kept.
    pub async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenSet, AuthError> {
        let request = TokenRequest {
            grant: Grant::RefreshToken(refresh_token),
            scope: &self.scope,
        };

        let result = self.request(&request).await.and_then(|resp| {
            let refresh_token = resp
                .refresh_token
                .clone()
                .unwrap_or_else(|| refresh_token.to_owned());
            self.token_set(resp, refresh_token)
        });

        result.map_err(|error| {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "refresh grant failed"
            );
            AuthError::SessionExpired
        })
    }

    /// Registers a new account with the authority
    ///
    /// Any failure is reported as [`AuthError::AuthRejected`].
    pub async fn register(&self, registration: &Registration) -> Result<(), AuthError> {
        self.authority.register(registration).await.map_err(|error| {
            tracing::info!(
                error = (&error as &dyn error::Error),
                "registration rejected"
            );
            AuthError::rejected(error.payload())
        })
    }

    async fn request(&self, request: &TokenRequest<'_>) -> Result<TokenResponse, TokenRequestError> {
        tracing::debug!(grant_type = request.grant.grant_type(), "requesting tokens");
        self.authority.request_token(request).await
    }

    fn token_set(
        &self,
        resp: TokenResponse,
        refresh_token: crate::RefreshToken,
    ) -> Result<TokenSet, TokenRequestError> {
        let id_token = resp
            .id_token
            .ok_or(TokenRequestError::MissingToken("id_token"))?;

        let tokens = TokenSet::issue(
            resp.access_token,
            refresh_token,
            id_token,
            resp.expires_in,
            &*self.clock,
        );

        tracing::info!(
            lifetime = resp.expires_in,
            expiry = tokens.expiration_date().0,
            "received new tokens"
        );

        Ok(tokens)
    }
}

impl fmt::Debug for TokenGateway {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenGateway")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use color_eyre::Result;
    use tessera_clock::{TestClock, UnixMillis};

    use super::*;
    use crate::{AccessToken, IdToken, RefreshToken};

    /// A scripted authority that records what it was asked
    ///
    /// Each token request takes the next scripted response as it arrives, then
    /// waits out the configured delay before answering.
    #[derive(Debug, Default)]
    pub(crate) struct FakeAuthority {
        responses: Mutex<VecDeque<Result<TokenResponse, TokenRequestError>>>,
        requests: Mutex<Vec<serde_json::Value>>,
        token_calls: AtomicUsize,
        registrations: Mutex<Vec<serde_json::Value>>,
        register_error: Mutex<Option<TokenRequestError>>,
        delay: Mutex<Option<Duration>>,
    }

    impl FakeAuthority {
        pub(crate) fn push(&self, response: Result<TokenResponse, TokenRequestError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        pub(crate) fn push_tokens(&self, access: &str, refresh: &str, id_token: IdToken, expires_in: u64) {
            self.push(Ok(TokenResponse {
                access_token: AccessToken::new(access.to_owned()),
                refresh_token: Some(RefreshToken::new(refresh.to_owned())),
                id_token: Some(id_token),
                expires_in,
            }));
        }

        pub(crate) fn push_rejection(&self, status: u16, body: &str) {
            self.push(Err(TokenRequestError::ErrorWithBody {
                status,
                body: body.to_owned(),
            }));
        }

        pub(crate) fn reject_registration(&self, status: u16, body: &str) {
            *self.register_error.lock().unwrap() = Some(TokenRequestError::ErrorWithBody {
                status,
                body: body.to_owned(),
            });
        }

        pub(crate) fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub(crate) fn token_calls(&self) -> usize {
            self.token_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn requests(&self) -> Vec<serde_json::Value> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn registrations(&self) -> Vec<serde_json::Value> {
            self.registrations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuthorityClient for FakeAuthority {
        async fn request_token(
            &self,
            request: &TokenRequest<'_>,
        ) -> Result<TokenResponse, TokenRequestError> {
            self.token_calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .unwrap()
                .push(serde_json::to_value(request).unwrap());

            let response = self.responses.lock().unwrap().pop_front();

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            response.unwrap_or(Err(TokenRequestError::ErrorWithBody {
                status: 500,
                body: "no scripted response".to_owned(),
            }))
        }

        async fn register(&self, registration: &Registration) -> Result<(), TokenRequestError> {
            self.registrations
                .lock()
                .unwrap()
                .push(serde_json::to_value(registration).unwrap());
            match self.register_error.lock().unwrap().take() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    fn gateway(authority: &Arc<FakeAuthority>, clock: &TestClock) -> TokenGateway {
        TokenGateway::new(authority.clone(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn acquire_stamps_local_expiration() -> Result<()> {
        let authority = Arc::new(FakeAuthority::default());
        let clock = TestClock::new(UnixMillis(10_000));
        authority.push_tokens("a-1", "r-1", IdToken::from_static("i-1"), 120);

        let tokens = gateway(&authority, &clock)
            .acquire(&PasswordGrant::new("ada", "hunter2"))
            .await?;

        assert_eq!(tokens.access_token().as_str(), "a-1");
        assert_eq!(tokens.expiration_date(), UnixMillis(130_000));
        assert_eq!(authority.requests()[0]["grant_type"], "password");
        assert_eq!(authority.requests()[0]["scope"], DEFAULT_SCOPE);
        Ok(())
    }

    #[tokio::test]
    async fn acquire_surfaces_json_error_payload() {
        let authority = Arc::new(FakeAuthority::default());
        let clock = TestClock::new(UnixMillis(0));
        authority.push_rejection(400, r#"{"error":"invalid_grant","error_description":"bad password"}"#);

        let err = gateway(&authority, &clock)
            .acquire(&PasswordGrant::new("ada", "wrong"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AuthError::AuthRejected {
                payload: serde_json::json!({
                    "error": "invalid_grant",
                    "error_description": "bad password",
                })
            }
        );
    }

    #[tokio::test]
    async fn acquire_without_refresh_token_is_rejected() {
        let authority = Arc::new(FakeAuthority::default());
        let clock = TestClock::new(UnixMillis(0));
        authority.push(Ok(TokenResponse {
            access_token: AccessToken::from_static("a"),
            refresh_token: None,
            id_token: Some(IdToken::from_static("i")),
            expires_in: 60,
        }));

        let err = gateway(&authority, &clock)
            .acquire(&PasswordGrant::new("ada", "hunter2"))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::AuthRejected { .. }));
    }

    #[tokio::test]
    async fn refresh_failure_is_session_expired() {
        let authority = Arc::new(FakeAuthority::default());
        let clock = TestClock::new(UnixMillis(0));
        authority.push_rejection(400, r#"{"error":"invalid_grant"}"#);

        let err = gateway(&authority, &clock)
            .refresh(RefreshTokenRef::from_str("r-1"))
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::SessionExpired);
        assert_eq!(authority.requests()[0]["grant_type"], "refresh_token");
        assert_eq!(authority.requests()[0]["refresh_token"], "r-1");
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token_when_not_rotated() -> Result<()> {
        let authority = Arc::new(FakeAuthority::default());
        let clock = TestClock::new(UnixMillis(0));
        authority.push(Ok(TokenResponse {
            access_token: AccessToken::from_static("a-2"),
            refresh_token: None,
            id_token: Some(IdToken::from_static("i-2")),
            expires_in: 60,
        }));

        let tokens = gateway(&authority, &clock)
            .refresh(RefreshTokenRef::from_str("r-1"))
            .await?;

        assert_eq!(tokens.refresh_token().as_str(), "r-1");
        Ok(())
    }

    #[tokio::test]
    async fn custom_scope_is_sent() -> Result<()> {
        let authority = Arc::new(FakeAuthority::default());
        let clock = TestClock::new(UnixMillis(0));
        authority.push_tokens("a", "r", IdToken::from_static("i"), 60);

        let gateway = gateway(&authority, &clock).with_scope("openid");
        assert_eq!(gateway.scope(), "openid");

        gateway
            .acquire(&PasswordGrant::new("ada", "hunter2"))
            .await?;

        assert_eq!(authority.requests()[0]["scope"], "openid");
        Ok(())
    }

    #[tokio::test]
    async fn registration_rejection_carries_text_payload() {
        let authority = Arc::new(FakeAuthority::default());
        let clock = TestClock::new(UnixMillis(0));
        authority.reject_registration(409, "email already taken");

        let err = gateway(&authority, &clock)
            .register(&Registration::new("ada@example.com", "hunter2"))
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::rejected("email already taken"));
        assert_eq!(authority.registrations().len(), 1);
    }
}
