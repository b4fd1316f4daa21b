//! DTOs for interacting with the authority's token and registration endpoints

use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessToken, IdToken, Password, RefreshToken, RefreshTokenRef, Username};

/// Resource owner credentials for the password grant
#[derive(Clone, Debug, Serialize)]
pub struct PasswordGrant {
    /// The user name
    pub username: Username,

    /// The password
    pub password: Password,
}

impl PasswordGrant {
    /// Constructs a new set of password grant credentials
    pub fn new(username: impl Into<Username>, password: impl Into<Password>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// A new account to register with the authority
#[derive(Clone, Debug, Serialize)]
pub struct Registration {
    /// The email address of the new account
    pub email: String,

    /// The password of the new account
    pub password: Password,

    /// Any additional fields the authority expects
    #[serde(flatten)]
    pub additional: serde_json::Map<String, serde_json::Value>,
}

impl Registration {
    /// Constructs a registration with no additional fields
    pub fn new(email: impl Into<String>, password: impl Into<Password>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            additional: serde_json::Map::new(),
        }
    }

    /// Adds an additional field to the registration payload
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.additional.insert(name.into(), value.into());
        self
    }
}

/// The grant being exchanged for tokens
#[derive(Clone, Copy, Debug)]
pub enum Grant<'a> {
    /// The resource owner password credentials grant
    Password(&'a PasswordGrant),

    /// The refresh token grant
    RefreshToken(&'a RefreshTokenRef),
}

impl Grant<'_> {
    /// The value sent as `grant_type`
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::RefreshToken(_) => "refresh_token",
        }
    }
}

/// A token request body: the grant plus the fixed `grant_type` and `scope`
#[derive(Clone, Copy, Debug)]
pub struct TokenRequest<'a> {
    /// The grant being exchanged
    pub grant: Grant<'a>,

    /// The requested scope
    pub scope: &'a str,
}

impl Serialize for TokenRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("TokenRequest", 4)?;
        match self.grant {
            Grant::Password(credentials) => {
                ser.serialize_field("username", &credentials.username)?;
                ser.serialize_field("password", &credentials.password)?;
                ser.skip_field("refresh_token")?;
            }
            Grant::RefreshToken(refresh_token) => {
                ser.skip_field("username")?;
                ser.skip_field("password")?;
                ser.serialize_field("refresh_token", refresh_token)?;
            }
        }
        ser.serialize_field("grant_type", self.grant.grant_type())?;
        ser.serialize_field("scope", self.scope)?;
        ser.end()
    }
}

/// A successful token endpoint response
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// The access token
    pub access_token: AccessToken,

    /// The refresh token, if one was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,

    /// The identity token, if one was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdToken>,

    /// The access token's lifetime in seconds
    pub expires_in: u64,
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    #[test]
    fn password_request_carries_fixed_parameters() -> Result<()> {
        let credentials = PasswordGrant::new("ada", "hunter2");
        let request = TokenRequest {
            grant: Grant::Password(&credentials),
            scope: "openid offline_access",
        };

        let value = serde_json::to_value(request)?;
        assert_eq!(
            value,
            serde_json::json!({
                "username": "ada",
                "password": "hunter2",
                "grant_type": "password",
                "scope": "openid offline_access",
            })
        );
        Ok(())
    }

    #[test]
    fn refresh_request_carries_only_the_refresh_token() -> Result<()> {
        let request = TokenRequest {
            grant: Grant::RefreshToken(RefreshTokenRef::from_str("r-1")),
            scope: "openid offline_access",
        };

        let value = serde_json::to_value(request)?;
        assert_eq!(
            value,
            serde_json::json!({
                "refresh_token": "r-1",
                "grant_type": "refresh_token",
                "scope": "openid offline_access",
            })
        );
        Ok(())
    }

    #[test]
    fn token_response_ignores_unknown_fields() -> Result<()> {
        let data = r#"{
                "token_type": "Bearer",
                "access_token": "a",
                "refresh_token": "r",
                "id_token": "i",
                "expires_in": 3600
            }"#;

        let resp: TokenResponse = serde_json::from_str(data)?;
        assert_eq!(resp.expires_in, 3600);
        assert!(resp.refresh_token.is_some());
        Ok(())
    }

    #[test]
    fn registration_flattens_additional_fields() -> Result<()> {
        let registration =
            Registration::new("ada@example.com", "hunter2").with_field("first_name", "Ada");

        let value = serde_json::to_value(&registration)?;
        assert_eq!(value["email"], "ada@example.com");
        assert_eq!(value["password"], "hunter2");
        assert_eq!(value["first_name"], "Ada");
        Ok(())
    }
}
