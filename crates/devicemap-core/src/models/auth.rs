//! Wire types for the authentication endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated account as returned by login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl User {
    /// Name for display, falling back to the email address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&self.email)
    }
}

/// A single token with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token: String,
    pub expires: DateTime<Utc>,
}

/// Access/refresh pair minted by login or renewal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access: TokenInfo,
    pub refresh: TokenInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user: User,
    pub tokens: AuthTokens,
}

/// The renewal endpoint answers either `{tokens: {...}}` or the bare pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RefreshResponse {
    Wrapped { tokens: AuthTokens },
    Bare(AuthTokens),
}

impl RefreshResponse {
    pub fn into_tokens(self) -> AuthTokens {
        match self {
            RefreshResponse::Wrapped { tokens } => tokens,
            RefreshResponse::Bare(tokens) => tokens,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}
