//! OME-NGFF attribute model.
//!
//! All metadata lives under the `ome` key of the node attributes, with
//! `version` alongside the node-specific block.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

pub const NGFF_VERSION: &str = "0.5";
pub const OME_KEY: &str = "ome";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Axis {
    fn channel() -> Self {
        Self {
            name: "c".to_string(),
            kind: "channel".to_string(),
            unit: None,
        }
    }

    fn space(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "space".to_string(),
            unit: Some("micrometer".to_string()),
        }
    }
}

/// (c, z, y, x) axes of an intensity image.
pub fn intensity_axes() -> Vec<Axis> {
    vec![Axis::channel(), Axis::space("z"), Axis::space("y"), Axis::space("x")]
}

/// (z, y, x) axes of a label image.
pub fn label_axes() -> Vec<Axis> {
    vec![Axis::space("z"), Axis::space("y"), Axis::space("x")]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateTransformation {
    #[serde(rename = "type")]
    pub kind: String,
    pub scale: Vec<f64>,
}

impl CoordinateTransformation {
    pub fn scale(scale: Vec<f64>) -> Self {
        Self {
            kind: "scale".to_string(),
            scale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub path: String,
    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

impl Dataset {
    /// First `scale` transformation of the level.
    pub fn scale(&self) -> Option<&[f64]> {
        self.coordinate_transformations
            .iter()
            .find(|t| t.kind == "scale")
            .map(|t| t.scale.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multiscale {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub axes: Vec<Axis>,
    pub datasets: Vec<Dataset>,
}

impl Multiscale {
    /// One dataset per scale vector, at paths `0`, `1`, ...
    pub fn new(name: Option<String>, axes: Vec<Axis>, scales: Vec<Vec<f64>>) -> Self {
        let datasets = scales
            .into_iter()
            .enumerate()
            .map(|(level, scale)| Dataset {
                path: level.to_string(),
                coordinate_transformations: vec![CoordinateTransformation::scale(scale)],
            })
            .collect();
        Self {
            name,
            axes,
            datasets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub min: f64,
    pub max: f64,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmeroChannel {
    pub label: String,
    pub wavelength_id: String,
    pub color: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_coefficient")]
    pub coefficient: f64,
    #[serde(default = "default_family")]
    pub family: String,
    #[serde(default)]
    pub inverted: bool,
    pub window: Window,
}

fn default_true() -> bool {
    true
}

fn default_coefficient() -> f64 {
    1.0
}

fn default_family() -> String {
    "linear".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Omero {
    pub channels: Vec<OmeroChannel>,
}

/// `ome` block of an intensity image group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub version: String,
    pub multiscales: Vec<Multiscale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omero: Option<Omero>,
}

impl ImageMeta {
    pub fn channels(&self) -> &[OmeroChannel] {
        self.omero.as_ref().map(|o| o.channels.as_slice()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSource {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLabel {
    pub source: LabelSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretrained_model: Option<String>,
}

/// `ome` block of a label image group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelImageMeta {
    pub version: String,
    pub multiscales: Vec<Multiscale>,
    #[serde(rename = "image-label")]
    pub image_label: ImageLabel,
}

/// `ome` block of the `labels` group.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LabelsMeta {
    pub version: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellImage {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquisition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Well {
    pub images: Vec<WellImage>,
}

/// `ome` block of a well group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellMeta {
    pub version: String,
    pub well: Well,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Named {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateWell {
    pub path: String,
    #[serde(rename = "rowIndex")]
    pub row_index: usize,
    #[serde(rename = "columnIndex")]
    pub column_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateAcquisition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plate {
    pub name: String,
    pub rows: Vec<Named>,
    pub columns: Vec<Named>,
    pub wells: Vec<PlateWell>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acquisitions: Vec<PlateAcquisition>,
}

/// `ome` block of the plate root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateMeta {
    pub version: String,
    pub plate: Plate,
}

/// Wrap a metadata block under the `ome` key.
pub fn to_attributes<T: Serialize>(
    meta: &T,
) -> Result<serde_json::Map<String, serde_json::Value>, serde_json::Error> {
    let mut attrs = serde_json::Map::new();
    attrs.insert(OME_KEY.to_string(), serde_json::to_value(meta)?);
    Ok(attrs)
}

/// Read the metadata block stored under the `ome` key at `path`.
pub fn from_attributes<T: DeserializeOwned>(
    attrs: &serde_json::Map<String, serde_json::Value>,
    path: &str,
) -> Result<T, SchemaError> {
    let malformed = || SchemaError::Metadata {
        path: path.to_string(),
        key: OME_KEY.to_string(),
    };
    let value = attrs.get(OME_KEY).ok_or_else(malformed)?;
    serde_json::from_value(value.clone()).map_err(|_| malformed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_meta_serializes_ngff_keys() {
        let meta = ImageMeta {
            version: NGFF_VERSION.to_string(),
            multiscales: vec![Multiscale::new(
                None,
                intensity_axes(),
                vec![vec![1.0, 1.0, 0.65, 0.65], vec![1.0, 1.0, 1.3, 1.3]],
            )],
            omero: None,
        };
        let attrs = to_attributes(&meta).unwrap();
        let json = serde_json::Value::Object(attrs.clone());
        assert_eq!(json["ome"]["multiscales"][0]["datasets"][1]["path"], "1");
        assert_eq!(
            json["ome"]["multiscales"][0]["datasets"][0]["coordinateTransformations"][0]["type"],
            "scale"
        );
        assert_eq!(json["ome"]["multiscales"][0]["axes"][0]["type"], "channel");
        assert!(json["ome"].get("omero").is_none());

        let back: ImageMeta = from_attributes(&attrs, "B/03/0").unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.multiscales[0].datasets[1].scale(), Some(&[1.0, 1.0, 1.3, 1.3][..]));
    }

    #[test]
    fn missing_ome_block_is_reported() {
        let err = from_attributes::<WellMeta>(&serde_json::Map::new(), "B/03").unwrap_err();
        assert_eq!(
            err,
            SchemaError::Metadata {
                path: "B/03".to_string(),
                key: "ome".to_string()
            }
        );
    }

    #[test]
    fn omero_channel_defaults() {
        let channel: OmeroChannel = serde_json::from_value(serde_json::json!({
            "label": "DAPI",
            "wavelength_id": "A01_C01",
            "color": "00FFFF",
            "window": {"min": 0.0, "max": 65535.0, "start": 110.0, "end": 800.0}
        }))
        .unwrap();
        assert!(channel.active);
        assert_eq!(channel.family, "linear");
        assert_eq!(channel.coefficient, 1.0);
    }
}
