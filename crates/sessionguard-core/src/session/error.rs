use thiserror::Error;

use crate::api::ApiError;
use crate::auth::RefreshError;

/// Error `code` the login endpoint returns when bot verification fails
pub const BOT_VERIFICATION_FAILED_CODE: &str = "BOT_VERIFICATION_FAILED";

/// Error `code` the login endpoint returns for a wrong identifier or secret
pub const INVALID_CREDENTIALS_CODE: &str = "INVALID_CREDENTIALS";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No refresh credential stored")]
    NoRefreshCredential,

    #[error("Session expired: {0}")]
    RefreshRejected(String),

    #[error("Authorization failed")]
    AuthorizationFailure,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Bot verification failed")]
    BotVerificationFailure,

    #[error(transparent)]
    NetworkOrServerFailure(ApiError),

    #[error("Failed to store credentials: {0}")]
    Storage(String),

    /// A logout or another login replaced the session mid-request
    #[error("Session changed while the request was in flight")]
    SessionChanged,
}

impl AuthError {
    /// Fatal failures end the session; the rest are shown inline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AuthError::NoRefreshCredential | AuthError::RefreshRejected(_) | AuthError::AuthorizationFailure
        )
    }

    /// Classify an error from the login or registration endpoint.
    pub(crate) fn from_login(error: ApiError) -> Self {
        match error.error_code().as_deref() {
            Some(BOT_VERIFICATION_FAILED_CODE) => AuthError::BotVerificationFailure,
            Some(INVALID_CREDENTIALS_CODE) => AuthError::InvalidCredentials,
            _ if error.is_unauthorized() => AuthError::InvalidCredentials,
            _ => AuthError::from(error),
        }
    }
}

impl From<ApiError> for AuthError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Refresh(RefreshError::NoRefreshCredential) => AuthError::NoRefreshCredential,
            ApiError::Refresh(RefreshError::Superseded) => AuthError::SessionChanged,
            ApiError::Refresh(e) => AuthError::RefreshRejected(e.to_string()),
            ApiError::Unauthorized(_) => AuthError::AuthorizationFailure,
            other => AuthError::NetworkOrServerFailure(other),
        }
    }
}
