//! Client-side management of an OAuth2/OpenID Connect session
//!
//! This library keeps a user logged in against an OAuth2 authority that issues
//! access, refresh, and identity tokens through the resource owner password and
//! refresh token grants. It owns the whole lifecycle of a session: acquiring
//! tokens, persisting them across restarts, restoring them on start-up, renewing
//! them before the access token expires, and discarding them on logout or when
//! the authority will no longer renew them.
//!
//! The current state is published to any number of observers. Every observer
//! receives the latest state as soon as it subscribes, and none of the derived
//! views report anything until start-up recovery has finished, so "not logged
//! in yet" is never confused with "logged out".
//!
//! # General Flow
//!
//! On application start-up, construct a single [`AuthStateMachine`] from an
//! authority client and a durable key-value store, then call
//! [`init`][AuthStateMachine::init] to restore any prior session. If there was
//! nothing to restore, log in with the user's credentials.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use tessera_session::{
//!     gateway::{AuthorityConfig, ReqwestAuthority, DEFAULT_REQUEST_TIMEOUT},
//!     store::FileStore,
//!     AuthError, AuthStateMachine, PasswordGrant,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let issuer = reqwest::Url::parse("https://auth.example.com/")?;
//! let authority = ReqwestAuthority::with_timeout(
//!     AuthorityConfig::for_issuer(&issuer)?,
//!     DEFAULT_REQUEST_TIMEOUT,
//! )?;
//!
//! let session = AuthStateMachine::new(
//!     Arc::new(authority),
//!     Arc::new(FileStore::new(".session")),
//! );
//!
//! match session.init().await {
//!     Ok(_) => {}
//!     Err(AuthError::NoStoredSession | AuthError::SessionExpired) => {
//!         session.login(&PasswordGrant::new("ada", "hunter2")).await?;
//!     }
//!     Err(other) => return Err(other.into()),
//! }
//!
//! let mut admin = session.is_in_role("admin");
//! while let Some(is_admin) = admin.next().await {
//!     tracing::info!(is_admin, "role membership changed");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Once a token set has been acquired, a refresh is scheduled for half of the
//! time remaining until the access token expires. Renewed tokens replace the
//! old ones everywhere at once. If the authority refuses to renew the session,
//! the session ends.
//!
//! This crate includes an example of a password login backed by a file store
//! in the examples folder.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `reqwest`: Provides an authority client built on the [reqwest] HTTP client.
//! * `file`: Provides a key-value store on the local filesystem.
//!
//! The `rustls-tls` and `default-tls` features select the TLS backend used by
//! `reqwest`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod claims;
mod error;
pub mod gateway;
mod machine;
mod state;
pub mod store;
mod tokens;

pub use braids::*;
pub use claims::{ClaimsDecoder, DecodeError, Profile, UnverifiedJwtDecoder};
pub use error::AuthError;
pub use gateway::{AuthorityClient, PasswordGrant, Registration, TokenGateway};
pub use machine::{AuthStateMachine, RefreshSchedule, ScheduledRefresh, SessionConfig};
pub use state::{AuthState, Session, StatePublisherQuit, StateWatcher};
pub use store::{KeyValueStore, TokenStore};
pub use tokens::{TokenSet, TokenStatus};
