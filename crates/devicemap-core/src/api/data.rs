//! Device data requests.
//!
//! Every request goes through `SessionManager::ensure_fresh` first and gets
//! exactly one renew-and-retry if the backend still answers 401.

use std::sync::Arc;

use reqwest::{Response, StatusCode};
use tracing::{info, warn};

use super::ApiClient;
use crate::auth::{AuthError, SessionManager};
use crate::models::DeviceCollection;

const GEOJSON_PATH: &str = "/locations/geojson";
const TILE_PATH: &str = "/locations/tiles";

/// Client for the map's data endpoints.
/// Clone is cheap - the session is shared, the HTTP client pools connections.
#[derive(Clone)]
pub struct MapDataClient {
    api: ApiClient,
    session: Arc<SessionManager>,
}

impl MapDataClient {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            api: session.api().clone(),
            session,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Fetch all device locations as GeoJSON
    pub async fn fetch_devices(&self) -> Result<DeviceCollection, AuthError> {
        let response = self.get(GEOJSON_PATH).await?;
        Ok(ApiClient::parse_json(response, "device GeoJSON").await?)
    }

    /// Fetch one vector tile as raw bytes
    pub async fn fetch_tile(&self, z: u32, x: u32, y: u32) -> Result<Vec<u8>, AuthError> {
        let path = format!("{}/{}/{}/{}", TILE_PATH, z, x, y);
        let response = self.get(&path).await?;
        let bytes = response.bytes().await.map_err(crate::api::ApiError::from)?;
        Ok(bytes.to_vec())
    }

    async fn get(&self, path: &str) -> Result<Response, AuthError> {
        self.session.ensure_fresh().await?;

        let response = self.send(path).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(ApiClient::check_response(response).await?);
        }

        info!(path, "Request unauthorized, renewing session and retrying once");
        self.session.renew().await?;

        let response = self.send(path).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path, "Request unauthorized after renewal, ending session");
            self.session.clear();
            return Err(AuthError::RequestUnauthorized);
        }
        Ok(ApiClient::check_response(response).await?)
    }

    async fn send(&self, path: &str) -> Result<Response, AuthError> {
        let token = self.session.access_token().ok_or(AuthError::NoSession)?;
        Ok(self.api.get_authorized(path, &token).await?)
    }
}
