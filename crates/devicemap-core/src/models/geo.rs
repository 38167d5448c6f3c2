//! GeoJSON device-location models.
//!
//! Only `Point` geometry is interpreted; everything else is carried through
//! untouched so the renderer still sees it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFeature {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub geometry: Option<Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl DeviceFeature {
    /// `(lon, lat)` for point features.
    pub fn point(&self) -> Option<(f64, f64)> {
        let geometry = self.geometry.as_ref()?.as_object()?;
        if geometry.get("type")?.as_str()? != "Point" {
            return None;
        }
        let coords = geometry.get("coordinates")?.as_array()?;
        let lon = coords.first()?.as_f64()?;
        let lat = coords.get(1)?.as_f64()?;
        Some((lon, lat))
    }

    pub fn device_id(&self) -> Option<&str> {
        self.properties
            .get("deviceId")
            .or_else(|| self.properties.get("device_id"))
            .and_then(Value::as_str)
    }
}

/// A GeoJSON `FeatureCollection` of device locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCollection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub features: Vec<DeviceFeature>,
}

impl DeviceCollection {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Keep only point features inside `bbox`.
    pub fn within(&self, bbox: &BoundingBox) -> DeviceCollection {
        let features = self
            .features
            .iter()
            .filter(|f| f.point().is_some_and(|(lon, lat)| bbox.contains(lon, lat)))
            .cloned()
            .collect();
        DeviceCollection {
            kind: self.kind.clone(),
            features,
        }
    }

    /// Number of distinct device ids in the collection.
    pub fn device_count(&self) -> usize {
        let mut ids: Vec<&str> = self.features.iter().filter_map(|f| f.device_id()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

/// Longitude/latitude rectangle, edges inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BoundingBoxError {
    #[error("expected 4 comma-separated numbers (minLon,minLat,maxLon,maxLat), got {0}")]
    WrongArity(usize),
    #[error("invalid coordinate: {0}")]
    InvalidNumber(String),
    #[error("minimum exceeds maximum")]
    Inverted,
}

impl FromStr for BoundingBox {
    type Err = BoundingBoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [min_lon, min_lat, max_lon, max_lat] = parts.as_slice() else {
            return Err(BoundingBoxError::WrongArity(parts.len()));
        };
        let parse = |raw: &str| {
            raw.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| BoundingBoxError::InvalidNumber(raw.to_string()))
        };
        let bbox = BoundingBox {
            min_lon: parse(*min_lon)?,
            min_lat: parse(*min_lat)?,
            max_lon: parse(*max_lon)?,
            max_lat: parse(*max_lat)?,
        };
        if bbox.min_lon > bbox.max_lon || bbox.min_lat > bbox.max_lat {
            return Err(BoundingBoxError::Inverted);
        }
        Ok(bbox)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.min_lon, self.min_lat, self.max_lon, self.max_lat)
    }
}
