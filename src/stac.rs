//! STAC item model and local shape validation.
//!
//! Rendered templates must produce a document that passes
//! [`StacItem::validate`] before it is allowed anywhere near the catalog
//! service. The validation is structural: required fields present and
//! well-formed, geometry type known, bbox dimensionality correct,
//! `properties.datetime` parseable.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RenderError;

const GEOMETRY_TYPES: &[&str] = &[
    "Point",
    "MultiPoint",
    "LineString",
    "MultiLineString",
    "Polygon",
    "MultiPolygon",
    "GeometryCollection",
];

/// One asset referenced by a STAC item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    /// Location of the asset.
    pub href: String,
    /// Media type of the asset.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Roles the asset plays (e.g. "data", "thumbnail").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Extension fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A rendered STAC item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacItem {
    /// Must be `"Feature"`.
    #[serde(rename = "type")]
    pub item_type: String,
    /// STAC spec version the item conforms to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stac_version: Option<String>,
    /// Extension schema URIs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stac_extensions: Vec<String>,
    /// Item identifier, unique within the target collection.
    pub id: String,
    /// GeoJSON geometry.
    pub geometry: Value,
    /// Bounding box of the geometry.
    pub bbox: Vec<f64>,
    /// Item properties; must contain a `datetime`.
    pub properties: BTreeMap<String, Value>,
    /// Links to related entities.
    pub links: Vec<Value>,
    /// Assets keyed by asset name.
    pub assets: BTreeMap<String, Asset>,
    /// Target collection, if the template sets it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl StacItem {
    /// Builds an item from a rendered JSON document.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Stac` when the document does not have the
    /// STAC item shape.
    pub fn from_value(value: Value) -> Result<Self, RenderError> {
        let item: StacItem = serde_json::from_value(value)
            .map_err(|e| RenderError::Stac(format!("not a STAC item: {e}")))?;
        item.validate()?;
        Ok(item)
    }

    /// Validates the item shape. Called automatically by
    /// [`StacItem::from_value`]; exposed for items built elsewhere.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.item_type != "Feature" {
            return Err(RenderError::Stac(format!(
                "type must be 'Feature', got '{}'",
                self.item_type
            )));
        }

        if self.id.trim().is_empty() {
            return Err(RenderError::Stac("id must not be empty".to_string()));
        }

        self.validate_geometry()?;

        if self.bbox.len() != 4 && self.bbox.len() != 6 {
            return Err(RenderError::Stac(format!(
                "bbox must have 4 or 6 values, got {}",
                self.bbox.len()
            )));
        }
        if self.bbox.iter().any(|v| !v.is_finite()) {
            return Err(RenderError::Stac("bbox contains non-finite values".to_string()));
        }

        match self.properties.get("datetime") {
            Some(Value::String(dt)) => {
                DateTime::parse_from_rfc3339(dt).map_err(|e| {
                    RenderError::Stac(format!("properties.datetime '{dt}' is not RFC 3339: {e}"))
                })?;
            }
            Some(Value::Null) | None => {
                return Err(RenderError::Stac(
                    "properties.datetime is required".to_string(),
                ));
            }
            Some(other) => {
                return Err(RenderError::Stac(format!(
                    "properties.datetime must be a string, got {other}"
                )));
            }
        }

        if self.assets.is_empty() {
            return Err(RenderError::Stac("assets must not be empty".to_string()));
        }
        for (key, asset) in &self.assets {
            if asset.href.trim().is_empty() {
                return Err(RenderError::Stac(format!("asset '{key}' has an empty href")));
            }
        }

        Ok(())
    }

    fn validate_geometry(&self) -> Result<(), RenderError> {
        let obj = self
            .geometry
            .as_object()
            .ok_or_else(|| RenderError::Stac("geometry must be an object".to_string()))?;
        let gtype = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RenderError::Stac("geometry.type is required".to_string()))?;
        if !GEOMETRY_TYPES.contains(&gtype) {
            return Err(RenderError::Stac(format!(
                "unknown geometry type '{gtype}'"
            )));
        }
        if gtype != "GeometryCollection" && !obj.contains_key("coordinates") {
            return Err(RenderError::Stac(
                "geometry.coordinates is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Serializes the item back to JSON.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
