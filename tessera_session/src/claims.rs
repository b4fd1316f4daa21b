//! Identity claims carried by an OpenID Connect identity token

use aliri_base64::Base64Url;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::IdTokenRef;

/// The profile of the authenticated user, as claimed by the identity token
///
/// The profile is always derived from the current identity token and is never
/// persisted on its own.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Subject identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Full name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Preferred user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,

    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Roles granted to the user
    ///
    /// Authorities emit a bare string when the user holds a single role.
    #[serde(default, deserialize_with = "one_or_many")]
    pub role: Vec<String>,

    /// All other claims
    #[serde(flatten)]
    pub additional: serde_json::Map<String, serde_json::Value>,
}

impl Profile {
    /// Whether the profile carries the given role
    pub fn has_role(&self, role: &str) -> bool {
        self.role.iter().any(|r| r == role)
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(r)) => vec![r],
        Some(OneOrMany::Many(r)) => r,
    })
}

/// An identity token could not be decoded into a profile
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The token is not a compact JWS with a header, payload, and signature
    #[error("malformed identity token")]
    MalformedToken,

    /// The header section is not base64url-encoded JSON
    #[error("malformed identity token header")]
    MalformedHeader,

    /// The payload section is not base64url-encoded
    #[error("malformed identity token payload")]
    MalformedPayload,

    /// The payload does not hold a claims object
    #[error("unable to parse identity token claims: {0}")]
    MalformedClaims(String),
}

/// Extracts a [`Profile`] from an identity token
pub trait ClaimsDecoder: Send + Sync {
    /// Decodes the identity token's claims
    fn decode(&self, id_token: &IdTokenRef) -> Result<Profile, DecodeError>;
}

/// Decodes identity token claims without verifying the token's signature
///
/// The token is received directly from the authority over a secured channel,
/// so only its structure is checked.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnverifiedJwtDecoder;

macro_rules! expect_three {
    ($iter:expr) => {{
        let mut i = $iter;
        match (i.next(), i.next(), i.next(), i.next()) {
            (Some(first), Some(second), Some(third), None) => Some((first, second, third)),
            _ => None,
        }
    }};
}

impl ClaimsDecoder for UnverifiedJwtDecoder {
    fn decode(&self, id_token: &IdTokenRef) -> Result<Profile, DecodeError> {
        let (header, payload, _signature) =
            expect_three!(id_token.as_str().split('.')).ok_or(DecodeError::MalformedToken)?;

        let h_raw = Base64Url::from_encoded(header).map_err(|_| DecodeError::MalformedHeader)?;
        serde_json::from_slice::<serde::de::IgnoredAny>(h_raw.as_slice())
            .map_err(|_| DecodeError::MalformedHeader)?;

        let p_raw = Base64Url::from_encoded(payload).map_err(|_| DecodeError::MalformedPayload)?;
        serde_json::from_slice(p_raw.as_slice())
            .map_err(|e| DecodeError::MalformedClaims(e.to_string()))
    }
}
