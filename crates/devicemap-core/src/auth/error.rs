use thiserror::Error;

use crate::api::ApiError;

/// Failures a session-dependent caller has to route on.
///
/// Every variant except `Api` means the user must authenticate again.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Not logged in")]
    NoSession,

    #[error("Session renewal failed: {0}")]
    RenewalFailed(String),

    #[error("Request unauthorized after session renewal")]
    RequestUnauthorized,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl AuthError {
    /// True when the session is gone and a fresh login is required.
    pub fn requires_login(&self) -> bool {
        match self {
            AuthError::NoSession | AuthError::RenewalFailed(_) | AuthError::RequestUnauthorized => {
                true
            }
            AuthError::Api(e) => e.is_unauthorized(),
        }
    }
}
