//! Channel definitions and channel/acquisition resolution.
//!
//! Channels are declared per acquisition, keyed by wavelength id. Once an
//! image is written its channel order is fixed and is the only way to map a
//! label or wavelength back to a position on the `c` axis.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ChannelNotFoundError, Result, SchemaError};
use crate::ngff::{self, ImageMeta, OmeroChannel, Window, WellMeta};
use crate::wells::WellId;
use crate::zarr::{self, Store};

/// Colors handed out, in order, to channels that do not declare one.
const DEFAULT_COLORS: [&str; 3] = ["FFFF00", "FF00FF", "00FFFF"];
const FALLBACK_COLOR: &str = "808080";

/// User-declared parameters of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelParams {
    pub wavelength_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, alias = "colormap")]
    pub color: Option<String>,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
}

impl ChannelParams {
    pub fn new(wavelength_id: &str, label: Option<&str>) -> Self {
        Self {
            wavelength_id: wavelength_id.to_string(),
            label: label.map(str::to_string),
            color: None,
            start: None,
            end: None,
        }
    }
}

/// Channel parameters of one acquisition, unique per wavelength id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<ChannelParams>", into = "Vec<ChannelParams>")]
pub struct ChannelParameters(Vec<ChannelParams>);

impl ChannelParameters {
    pub fn new(params: Vec<ChannelParams>) -> std::result::Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for p in &params {
            if p.wavelength_id.is_empty() || !seen.insert(p.wavelength_id.as_str()) {
                return Err(SchemaError::DuplicateWavelength(p.wavelength_id.clone()));
            }
        }
        Ok(Self(params))
    }

    pub fn get(&self, wavelength_id: &str) -> Option<&ChannelParams> {
        self.0.iter().find(|p| p.wavelength_id == wavelength_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelParams> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parameters of the given wavelengths, in declaration order.
    pub fn select(&self, wavelength_ids: &[String]) -> Vec<ChannelParams> {
        self.0
            .iter()
            .filter(|p| wavelength_ids.contains(&p.wavelength_id))
            .cloned()
            .collect()
    }
}

impl TryFrom<Vec<ChannelParams>> for ChannelParameters {
    type Error = SchemaError;

    fn try_from(value: Vec<ChannelParams>) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChannelParameters> for Vec<ChannelParams> {
    fn from(value: ChannelParameters) -> Self {
        value.0
    }
}

/// Build the `omero` channel list of an image.
pub fn define_omero_channels(
    params: &[ChannelParams],
    bit_depth: u32,
    label_prefix: Option<&str>,
) -> std::result::Result<Vec<OmeroChannel>, SchemaError> {
    let max = 2f64.powi(bit_depth as i32) - 1.0;
    let mut palette = DEFAULT_COLORS.iter();
    let mut channels: Vec<OmeroChannel> = Vec::with_capacity(params.len());
    for p in params {
        let label = match &p.label {
            Some(label) => label.clone(),
            None => {
                let label = match label_prefix {
                    Some(prefix) => format!("{prefix}_{}", p.wavelength_id),
                    None => p.wavelength_id.clone(),
                };
                warn!("missing label for channel {}, using {label}", p.wavelength_id);
                label
            }
        };
        if channels.iter().any(|c| c.label == label) {
            return Err(SchemaError::DuplicateLabel {
                image: "channel parameters".to_string(),
                label,
            });
        }
        let color = p
            .color
            .clone()
            .unwrap_or_else(|| palette.next().copied().unwrap_or(FALLBACK_COLOR).to_string());
        channels.push(OmeroChannel {
            label,
            wavelength_id: p.wavelength_id.clone(),
            color,
            active: true,
            coefficient: 1.0,
            family: "linear".to_string(),
            inverted: false,
            window: Window {
                min: 0.0,
                max,
                start: p.start.unwrap_or(0.0),
                end: p.end.unwrap_or(max),
            },
        });
    }
    Ok(channels)
}

/// Label given to a channel whose label is shared by several acquisitions.
pub fn disambiguate(label: &str, acquisition: &str) -> String {
    format!("{label}_{acquisition}")
}

/// How a caller addresses a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSpec {
    /// Try label, then wavelength id, then numeric index.
    Any(String),
    Label(String),
    WavelengthId(String),
    Index(usize),
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelSpec::Any(s) => f.write_str(s),
            ChannelSpec::Label(s) => write!(f, "label={s}"),
            ChannelSpec::WavelengthId(s) => write!(f, "wavelength_id={s}"),
            ChannelSpec::Index(i) => write!(f, "index={i}"),
        }
    }
}

impl FromStr for ChannelSpec {
    type Err = std::convert::Infallible;

    /// `label=DAPI`, `wavelength_id=A01_C01`, `index=0`, or a bare value.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let spec = match s.split_once('=') {
            Some(("label", v)) => ChannelSpec::Label(v.to_string()),
            Some(("wavelength_id", v)) => ChannelSpec::WavelengthId(v.to_string()),
            Some(("index", v)) => match v.parse() {
                Ok(i) => ChannelSpec::Index(i),
                Err(_) => ChannelSpec::Any(s.to_string()),
            },
            _ => ChannelSpec::Any(s.to_string()),
        };
        Ok(spec)
    }
}

/// Channels of one image of a well.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageChannels {
    /// Path relative to the well group.
    pub path: String,
    pub acquisition: Option<String>,
    pub channels: Vec<OmeroChannel>,
}

impl ImageChannels {
    fn find(&self, spec: &ChannelSpec) -> Option<usize> {
        match spec {
            ChannelSpec::Label(label) => self.channels.iter().position(|c| {
                c.label == *label
                    || self
                        .acquisition
                        .as_deref()
                        .is_some_and(|a| c.label == disambiguate(label, a))
            }),
            ChannelSpec::WavelengthId(id) => self.channels.iter().position(|c| c.wavelength_id == *id),
            ChannelSpec::Index(i) => (*i < self.channels.len()).then_some(*i),
            ChannelSpec::Any(_) => None,
        }
    }
}

/// Where a channel lives on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Image group, relative to the plate root.
    pub image_path: String,
    /// Level-0 array, relative to the plate root.
    pub array_path: String,
    pub channel_index: usize,
    pub channel: OmeroChannel,
}

/// Channel lists of every image of one well, in well order.
#[derive(Debug, Clone, PartialEq)]
pub struct WellChannels {
    pub well: WellId,
    pub images: Vec<ImageChannels>,
}

impl WellChannels {
    pub fn load(store: &Store, well: &WellId) -> Result<Self> {
        let well_path = well.path();
        let well_meta: WellMeta = ngff::from_attributes(&zarr::group_attributes(store, &well_path)?, &well_path)?;
        let mut images = Vec::with_capacity(well_meta.well.images.len());
        for image in well_meta.well.images {
            let image_path = format!("{well_path}/{}", image.path);
            let meta: ImageMeta = ngff::from_attributes(&zarr::group_attributes(store, &image_path)?, &image_path)?;
            images.push(ImageChannels {
                path: image.path,
                acquisition: image.acquisition,
                channels: meta.channels().to_vec(),
            });
        }
        Ok(Self {
            well: well.clone(),
            images,
        })
    }

    /// Find the channel matching `spec`, restricted to one acquisition if given.
    pub fn resolve(
        &self,
        spec: &ChannelSpec,
        acquisition: Option<&str>,
    ) -> std::result::Result<Resolution, ChannelNotFoundError> {
        let not_found = || ChannelNotFoundError {
            spec: spec.to_string(),
            well: self.well.path(),
            acquisition: acquisition.map(str::to_string),
        };
        let candidates: Vec<&ImageChannels> = match acquisition {
            Some(a) => self
                .images
                .iter()
                .filter(|img| img.acquisition.as_deref() == Some(a))
                .collect(),
            None => self.images.iter().collect(),
        };

        let attempts = match spec {
            ChannelSpec::Any(value) => {
                let mut attempts = vec![
                    ChannelSpec::Label(value.clone()),
                    ChannelSpec::WavelengthId(value.clone()),
                ];
                if let Ok(i) = value.parse() {
                    attempts.push(ChannelSpec::Index(i));
                }
                attempts
            }
            other => vec![other.clone()],
        };

        for attempt in &attempts {
            for image in &candidates {
                if let Some(index) = image.find(attempt) {
                    let image_path = format!("{}/{}", self.well.path(), image.path);
                    debug!("resolved {spec} to channel {index} of {image_path}");
                    return Ok(Resolution {
                        array_path: format!("{image_path}/0"),
                        image_path,
                        channel_index: index,
                        channel: image.channels[index].clone(),
                    });
                }
            }
        }
        Err(not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(label: &str, wavelength_id: &str) -> OmeroChannel {
        define_omero_channels(&[ChannelParams::new(wavelength_id, Some(label))], 16, None)
            .unwrap()
            .remove(0)
    }

    fn multiplexed() -> WellChannels {
        WellChannels {
            well: WellId::parse("B03").unwrap(),
            images: vec![
                ImageChannels {
                    path: "0".into(),
                    acquisition: Some("0".into()),
                    channels: vec![channel("DAPI_0", "A01_C01"), channel("GFP", "A02_C02")],
                },
                ImageChannels {
                    path: "1".into(),
                    acquisition: Some("1".into()),
                    channels: vec![channel("DAPI_1", "A01_C01"), channel("RFP", "A03_C03")],
                },
            ],
        }
    }

    #[test]
    fn fills_in_missing_labels_and_colors() {
        let params = vec![
            ChannelParams::new("A01_C01", Some("DAPI")),
            ChannelParams::new("A02_C02", None),
            ChannelParams::new("A03_C03", None),
            ChannelParams::new("A04_C04", None),
            ChannelParams::new("A05_C05", None),
        ];
        let channels = define_omero_channels(&params, 12, Some("cycle1")).unwrap();
        let labels: Vec<&str> = channels.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["DAPI", "cycle1_A02_C02", "cycle1_A03_C03", "cycle1_A04_C04", "cycle1_A05_C05"]
        );
        let colors: Vec<&str> = channels.iter().map(|c| c.color.as_str()).collect();
        assert_eq!(colors, vec!["FFFF00", "FF00FF", "00FFFF", "808080", "808080"]);
        assert_eq!(channels[0].window.max, 4095.0);
        assert_eq!(channels[0].window.start, 0.0);
        assert_eq!(channels[0].window.end, 4095.0);
    }

    #[test]
    fn explicit_colors_and_window_are_kept() {
        let mut p = ChannelParams::new("A01_C01", Some("DAPI"));
        p.color = Some("0000FF".into());
        p.start = Some(110.0);
        p.end = Some(800.0);
        let channels = define_omero_channels(&[p, ChannelParams::new("A02_C02", Some("GFP"))], 16, None).unwrap();
        assert_eq!(channels[0].color, "0000FF");
        assert_eq!(channels[0].window.start, 110.0);
        assert_eq!(channels[0].window.end, 800.0);
        assert_eq!(channels[1].color, "FFFF00");
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let params = vec![
            ChannelParams::new("A01_C01", Some("DAPI")),
            ChannelParams::new("A02_C02", Some("DAPI")),
        ];
        assert!(matches!(
            define_omero_channels(&params, 16, None),
            Err(SchemaError::DuplicateLabel { .. })
        ));
    }

    #[test]
    fn duplicate_wavelengths_are_rejected() {
        let err = ChannelParameters::new(vec![
            ChannelParams::new("A01_C01", Some("DAPI")),
            ChannelParams::new("A01_C01", Some("GFP")),
        ])
        .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateWavelength("A01_C01".into()));
    }

    #[test]
    fn resolves_disambiguated_labels_per_acquisition() {
        let well = multiplexed();
        let res = well.resolve(&ChannelSpec::Label("DAPI".into()), Some("1")).unwrap();
        assert_eq!(res.image_path, "B/03/1");
        assert_eq!(res.array_path, "B/03/1/0");
        assert_eq!(res.channel_index, 0);
        assert_eq!(res.channel.label, "DAPI_1");

        let res = well.resolve(&ChannelSpec::Any("RFP".into()), None).unwrap();
        assert_eq!((res.image_path.as_str(), res.channel_index), ("B/03/1", 1));
    }

    #[test]
    fn any_falls_back_to_wavelength_then_index() {
        let well = multiplexed();
        let res = well.resolve(&ChannelSpec::Any("A03_C03".into()), None).unwrap();
        assert_eq!(res.channel.label, "RFP");
        let res = well.resolve(&"1".parse().unwrap(), Some("0")).unwrap();
        assert_eq!(res.channel.label, "GFP");
    }

    #[test]
    fn missing_channel_reports_context() {
        let well = multiplexed();
        let err = well.resolve(&ChannelSpec::Label("GFP".into()), Some("1")).unwrap_err();
        assert_eq!(err.well, "B/03");
        assert_eq!(err.acquisition.as_deref(), Some("1"));
        assert!(well.resolve(&ChannelSpec::Index(5), None).is_err());
    }

    #[test]
    fn parses_channel_specs() {
        assert_eq!("label=DAPI".parse::<ChannelSpec>().unwrap(), ChannelSpec::Label("DAPI".into()));
        assert_eq!("index=2".parse::<ChannelSpec>().unwrap(), ChannelSpec::Index(2));
        assert_eq!("DAPI".parse::<ChannelSpec>().unwrap(), ChannelSpec::Any("DAPI".into()));
    }
}
