use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_clock::{Clock, UnixMillis};

use crate::{AccessToken, AccessTokenRef, IdToken, IdTokenRef, RefreshToken, RefreshTokenRef};

/// A token set as issued by the authority, stamped with an absolute expiration
///
/// The expiration is always computed locally at the time the set is received;
/// the authority only reports a relative lifetime. A set is never mutated, a
/// refresh produces a new one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    access_token: AccessToken,
    refresh_token: RefreshToken,
    id_token: IdToken,
    expires_in: u64,
    #[serde(with = "stringified_millis")]
    expiration_date: UnixMillis,
}

/// A token set's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The access token can still be used
    Valid,
    /// The access token is no longer valid
    Expired,
}

impl TokenSet {
    /// Constructs a token set that was issued just now according to `clock`
    pub fn issue<C: Clock + ?Sized>(
        access_token: AccessToken,
        refresh_token: RefreshToken,
        id_token: IdToken,
        expires_in: u64,
        clock: &C,
    ) -> Self {
        let expiration_date = clock.now() + Duration::from_secs(expires_in);
        Self {
            access_token,
            refresh_token,
            id_token,
            expires_in,
            expiration_date,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Gets the identity token
    #[inline]
    pub fn id_token(&self) -> &IdTokenRef {
        &self.id_token
    }

    /// The lifetime reported by the authority when the set was issued
    #[inline]
    pub fn expires_in(&self) -> Duration {
        Duration::from_secs(self.expires_in)
    }

    /// The absolute time at which the access token expires
    #[inline]
    pub fn expiration_date(&self) -> UnixMillis {
        self.expiration_date
    }

    /// Gets the token set's status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixMillis) -> TokenStatus {
        if time < self.expiration_date {
            TokenStatus::Valid
        } else {
            TokenStatus::Expired
        }
    }

    /// Whether the access token has expired as of the provided time
    #[inline]
    pub fn is_expired_at(&self, time: UnixMillis) -> bool {
        self.token_status_at(time) == TokenStatus::Expired
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixMillis) -> Duration {
        self.expiration_date - time
    }
}

/// The persisted record keeps the expiration as a string of epoch millis
mod stringified_millis {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use tessera_clock::UnixMillis;

    pub fn serialize<S: Serializer>(value: &UnixMillis, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UnixMillis, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(ms) => Ok(UnixMillis(ms)),
            Repr::Text(s) => s.trim().parse().map(UnixMillis).map_err(de::Error::custom),
        }
    }
}
