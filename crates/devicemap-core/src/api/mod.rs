//! REST API client module for the devicemap backend.
//!
//! - `ApiClient`: login, token renewal, logout and raw bearer requests
//! - `MapDataClient`: device data requests gated on a fresh session, with a
//!   single renew-and-retry on 401

pub mod client;
pub mod data;
pub mod error;

pub use client::ApiClient;
pub use data::MapDataClient;
pub use error::ApiError;
