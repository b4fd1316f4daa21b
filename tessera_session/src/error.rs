use thiserror::Error;

use crate::claims::DecodeError;

/// The ways a session operation can fail
///
/// Transport, storage, and decoding details never escape the session; every
/// failure is reported as one of these kinds.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum AuthError {
    /// The authority rejected the credentials or the registration
    ///
    /// Carries the authority's error payload verbatim when it was JSON, or
    /// the response text otherwise.
    #[error("rejected by authority: {payload}")]
    AuthRejected {
        /// The authority's error payload
        payload: serde_json::Value,
    },

    /// The refresh token is no longer accepted; the session is over
    #[error("session expired")]
    SessionExpired,

    /// There is no persisted session to restore
    ///
    /// This is the normal outcome of starting up without ever having logged in.
    #[error("no stored session")]
    NoStoredSession,

    /// An identity token could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl AuthError {
    pub(crate) fn rejected(payload: impl Into<serde_json::Value>) -> Self {
        Self::AuthRejected {
            payload: payload.into(),
        }
    }

    /// Whether this is the informational "never logged in" outcome
    pub fn is_no_stored_session(&self) -> bool {
        matches!(self, Self::NoStoredSession)
    }
}
