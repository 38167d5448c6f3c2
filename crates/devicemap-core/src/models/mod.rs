//! Data models for the devicemap backend.
//!
//! - `auth`: login/renewal request and response envelopes
//! - `geo`: GeoJSON device locations and the bounding-box filter

pub mod auth;
pub mod geo;

pub use auth::{AuthTokens, LoginResponse, RefreshResponse, TokenInfo, User};
pub use geo::{BoundingBox, BoundingBoxError, DeviceCollection, DeviceFeature};
