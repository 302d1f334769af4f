//! TOML description of a plate conversion.
//!
//! ```toml
//! # plate.toml
//! plate_name = "210305NAR005AAN"   # optional, taken from the filenames otherwise
//! bit_depth = 12
//!
//! [pixel_size]
//! x = 0.1625
//! y = 0.1625
//! z = 1.0
//!
//! [pyramid]
//! num_levels = 5
//! coarsening_xy = 2
//!
//! [overlap]
//! tolerance_px = 0
//! mode = "flexible"
//!
//! [fovs]
//! mode = "grid"
//! columns = 3
//!
//! [[acquisitions]]
//! id = "0"
//! path = "cycle0"
//! roi_table = "rois/{well}.csv"   # optional, derived from the layout otherwise
//! channels = [
//!     { wavelength_id = "A01_C01", label = "DAPI", colormap = "00FFFF" },
//!     { wavelength_id = "A02_C02", label = "GFP" },
//! ]
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::channels::ChannelParameters;
use crate::error::{Error, Result};
use crate::layout::{OverlapConfig, PixelSize, RawFov};
use crate::pyramid::PyramidSpec;
use crate::wells::{AcquisitionId, WellId};

#[derive(Debug, Clone, Deserialize)]
pub struct ConvertConfig {
    /// Overrides the plate name derived from the filenames.
    #[serde(default)]
    pub plate_name: Option<String>,

    pub pixel_size: PixelSize,

    #[serde(default)]
    pub pyramid: PyramidSpec,

    #[serde(default)]
    pub overlap: OverlapConfig,

    /// Accept FOV tiles smaller than the nominal size.
    #[serde(default)]
    pub pad_with_zeros: bool,

    /// Significant bits of the camera; sets the display window.
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u32,

    #[serde(default = "default_extension")]
    pub image_extension: String,

    /// (y, x) chunk size of level arrays; the nominal FOV size when unset.
    #[serde(default)]
    pub chunk_yx: Option<[u64; 2]>,

    /// Prefix for channels that have no label.
    #[serde(default)]
    pub label_prefix: Option<String>,

    #[serde(default)]
    pub fovs: FovLayout,

    pub acquisitions: Vec<AcquisitionConfig>,

    /// Directory relative acquisition paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_bit_depth() -> u32 {
    16
}

fn default_extension() -> String {
    "tif".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    /// Required when the plate has more than one acquisition.
    #[serde(default)]
    pub id: Option<AcquisitionId>,
    pub path: PathBuf,
    pub channels: ChannelParameters,
    /// Pre-made FOV ROI tables, one CSV per well; `{well}` expands to the
    /// well id, e.g. `rois/{well}.csv`.
    #[serde(default)]
    pub roi_table: Option<String>,
}

/// Where each field of view sits inside its well, in pixels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum FovLayout {
    /// Fields fill a row-major grid in field order.
    Grid {
        columns: u32,
        #[serde(default)]
        overlap_px: u64,
    },
    /// Positions as reported by the instrument.
    Explicit { positions: Vec<FovPosition> },
}

impl Default for FovLayout {
    fn default() -> Self {
        FovLayout::Grid {
            columns: 1,
            overlap_px: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FovPosition {
    pub field: u32,
    pub x: i64,
    pub y: i64,
    #[serde(default)]
    pub z: i64,
}

impl FovLayout {
    /// Raw boxes for `fields`, each `width` x `height` x `depth` pixels.
    pub fn raw_fovs(&self, fields: &[u32], width: u64, height: u64, depth: u64) -> Result<Vec<RawFov>> {
        let raw = |field, x, y, z| RawFov {
            field,
            x,
            y,
            z,
            width,
            height,
            depth,
        };
        match self {
            FovLayout::Grid { columns, overlap_px } => {
                if *overlap_px >= width.min(height) {
                    return Err(Error::Config(format!(
                        "grid overlap of {overlap_px} px does not fit a {width}x{height} field"
                    )));
                }
                let step_x = (width - overlap_px) as i64;
                let step_y = (height - overlap_px) as i64;
                let columns = (*columns).max(1) as usize;
                Ok(fields
                    .iter()
                    .enumerate()
                    .map(|(i, &field)| raw(field, (i % columns) as i64 * step_x, (i / columns) as i64 * step_y, 0))
                    .collect())
            }
            FovLayout::Explicit { positions } => fields
                .iter()
                .map(|&field| {
                    positions
                        .iter()
                        .find(|p| p.field == field)
                        .map(|p| raw(field, p.x, p.y, p.z))
                        .ok_or_else(|| Error::Config(format!("no position given for field {field}")))
                })
                .collect(),
        }
    }
}

impl ConvertConfig {
    /// Load configuration from a TOML file; relative paths are taken from
    /// the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        let mut config = Self::from_str(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|err| Error::Config(format!("failed to parse TOML configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=16).contains(&self.bit_depth) {
            return Err(Error::Config(format!("bit_depth must be in 1..=16, got {}", self.bit_depth)));
        }
        if !self.pixel_size.is_valid() {
            return Err(Error::Config("pixel sizes must be positive".into()));
        }
        if self.acquisitions.is_empty() {
            return Err(Error::Config("at least one acquisition is required".into()));
        }
        if let FovLayout::Grid { columns: 0, .. } = self.fovs {
            return Err(Error::Config("grid needs at least one column".into()));
        }
        self.pyramid.validate()?;
        Ok(())
    }

    pub fn acquisition_dir(&self, acquisition: &AcquisitionConfig) -> PathBuf {
        self.base_dir.join(&acquisition.path)
    }

    /// CSV holding the pre-made FOV ROI table of `well`, if one is configured.
    pub fn roi_table_path(&self, acquisition: &AcquisitionConfig, well: &WellId) -> Option<PathBuf> {
        let template = acquisition.roi_table.as_ref()?;
        Some(self.base_dir.join(template.replace("{well}", &well.to_string())))
    }
}
