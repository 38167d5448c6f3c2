//! Core library for devicemap.
//!
//! Session token lifecycle, the backend API client and the device-location
//! models a map front end consumes.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError, MapDataClient};
pub use auth::{AuthError, SessionManager, SessionStatus};
pub use config::Config;
