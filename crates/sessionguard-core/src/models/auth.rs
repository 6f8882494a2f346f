use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::UserProfile;

/// Access and refresh bearer tokens. Both are opaque to the client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// What the user typed into the sign-in form.
#[derive(Clone)]
pub struct LoginCredentials {
    pub identifier: String,
    pub secret: String,
    pub bot_verification_token: Option<String>,
}

impl LoginCredentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
            bot_verification_token: None,
        }
    }

    pub fn with_bot_token(mut self, token: impl Into<String>) -> Self {
        self.bot_verification_token = Some(token.into());
        self
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .field("bot_verification_token", &self.bot_verification_token.is_some())
            .finish()
    }
}

/// Body of the login request
#[derive(Debug, Serialize)]
pub(crate) struct LoginBody<'a> {
    pub identifier: &'a str,
    pub secret: &'a str,
    #[serde(rename = "rememberMe")]
    pub remember_me: bool,
    #[serde(rename = "botVerificationToken", skip_serializing_if = "Option::is_none")]
    pub bot_verification_token: Option<&'a str>,
}

/// Body of the refresh request
#[derive(Debug, Serialize)]
pub(crate) struct RefreshBody<'a> {
    #[serde(rename = "refreshToken")]
    pub refresh_token: &'a str,
}

/// Registration form data. Unknown fields are forwarded to the server as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationData {
    pub email: String,
    pub secret: String,
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Response of the login and registration endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    pub user: UserProfile,
}

impl AuthResponse {
    pub fn credentials(&self) -> CredentialPair {
        CredentialPair::new(self.access_token.clone(), self.refresh_token.clone())
    }
}
