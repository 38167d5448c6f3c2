//! HTTP client for the devicemap backend.
//!
//! This module provides the `ApiClient` struct for the authentication
//! endpoints and for raw bearer-authorized requests. Token lifecycle is not
//! handled here; see `SessionManager` and `MapDataClient`.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::ApiError;
use crate::models::auth::{LoginRequest, RefreshRequest};
use crate::models::{AuthTokens, LoginResponse, RefreshResponse};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// This is the only bound on a hanging renewal call.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const LOGIN_PATH: &str = "/auth/login";
const REFRESH_PATH: &str = "/auth/refresh-tokens";
const LOGOUT_PATH: &str = "/auth/logout";

/// API client for the devicemap backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client rooted at `base_url`
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Authenticate with email and password
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        Self::parse_json(response, "login").await
    }

    /// Exchange a refresh token for a new token pair
    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<AuthTokens, ApiError> {
        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let parsed: RefreshResponse = Self::parse_json(response, "refresh").await?;
        Ok(parsed.into_tokens())
    }

    /// Revoke a refresh token server-side
    pub async fn logout(&self, refresh_token: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(LOGOUT_PATH))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        Self::check_response(response).await?;
        Ok(())
    }

    /// GET `path` with a bearer token.
    ///
    /// 429 responses are retried with exponential backoff; any other status is
    /// returned to the caller unchecked so it can decide what 401 means.
    pub async fn get_authorized(&self, path: &str, token: &str) -> Result<Response, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.client.get(&url).bearer_auth(token).send().await?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                debug!(url = %url, status = %response.status(), "GET completed");
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// Check if response is successful, returning an error with body if not.
    pub async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Parse a JSON body, reporting shape mismatches as `InvalidResponse`.
    pub async fn parse_json<T: DeserializeOwned>(
        response: Response,
        what: &str,
    ) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Malformed {} response: {}", what, e)))
    }
}
