//! Yokogawa CellVoyager image filenames.
//!
//! Images are named `<plate_prefix>_<well>_T0001F001L01A01Z01C01.tif`: the
//! plate prefix may itself contain underscores, the well is the second to
//! last field and the last field packs time point, field of view, timeline,
//! action, Z plane and channel. Numeric tokens are parsed as integers, so
//! ordering never depends on zero padding.

use std::cmp::Ordering;
use std::path::Path;

use regex::Regex;
use tracing::warn;

use crate::error::ParseSkip;
use crate::wells::{AcquisitionId, WellId};

const METADATA_RE: &str = r"^T(\d+)F(\d+)L(\d+)A(\d+)Z(\d+)C(\d+)$";

/// Canonical address of one image plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub plate_prefix: String,
    pub plate: String,
    pub well: WellId,
    pub time: u32,
    pub fov: u32,
    pub line: u32,
    pub action: u32,
    pub z: u32,
    pub channel: u32,
    /// Set by the batch the file belongs to, not by the filename.
    pub acquisition: Option<AcquisitionId>,
}

impl ImageKey {
    /// Channel identity used to look up channel parameters, e.g. `A01_C01`.
    pub fn wavelength_id(&self) -> String {
        format!("A{:02}_C{:02}", self.action, self.channel)
    }
}

impl Ord for ImageKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.acquisition
            .cmp(&other.acquisition)
            .then_with(|| self.well.cmp(&other.well))
            .then_with(|| self.time.cmp(&other.time))
            .then_with(|| self.fov.cmp(&other.fov))
            .then_with(|| self.z.cmp(&other.z))
            .then_with(|| self.action.cmp(&other.action))
            .then_with(|| self.channel.cmp(&other.channel))
            .then_with(|| self.line.cmp(&other.line))
            .then_with(|| self.plate_prefix.cmp(&other.plate_prefix))
    }
}

impl PartialOrd for ImageKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One file that parsed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFile {
    pub name: String,
    pub key: ImageKey,
}

/// Result of parsing the file listing of one acquisition folder.
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    pub files: Vec<ParsedFile>,
    pub skipped: Vec<ParseSkip>,
}

impl ParsedBatch {
    pub fn keys(&self) -> impl Iterator<Item = &ImageKey> {
        self.files.iter().map(|f| &f.key)
    }
}

/// Plate name from a filename prefix, following the FMI barcode conventions.
///
/// `210305NAR005AAN_210416_164828` is a successful barcode read and gives
/// `210305NAR005AAN`; `220304_172545_220304_175557` is a failed read and
/// gives `RS220304172545`. Anything else is returned unchanged.
pub fn plate_name(prefix: &str) -> String {
    let fields: Vec<&str> = prefix.split('_').collect();
    let stamp = |s: &str| s.len() == 6 && s.chars().all(|c| c.is_ascii_digit());
    match fields.as_slice() {
        [barcode, date, time] if stamp(date) && stamp(time) => barcode.to_string(),
        [scan_date, scan_time, date, time]
            if stamp(scan_date) && stamp(scan_time) && stamp(date) && stamp(time) =>
        {
            format!("RS{scan_date}{scan_time}")
        }
        _ => prefix.to_string(),
    }
}

pub struct FilenameParser {
    metadata: Regex,
    extension: Option<String>,
}

impl FilenameParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            metadata: Regex::new(METADATA_RE)?,
            extension: None,
        })
    }

    /// Only accept files with this extension (case-insensitive).
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = Some(extension.trim_start_matches('.').to_ascii_lowercase());
        self
    }

    /// Parse one filename. Pure: never touches the filesystem.
    pub fn parse_filename(&self, filename: &str) -> Result<ImageKey, ParseSkip> {
        let path = Path::new(filename);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ParseSkip::new(filename, "not a file name"))?;

        if let Some(expected) = &self.extension {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            if ext.as_deref() != Some(expected.as_str()) {
                return Err(ParseSkip::new(filename, format!("extension is not .{expected}")));
            }
        }

        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);
        let fields: Vec<&str> = stem.split('_').collect();
        if fields.len() < 3 {
            return Err(ParseSkip::new(
                filename,
                "expected <plate>_<well>_<TFLAZC> fields",
            ));
        }
        let plate_prefix = fields[..fields.len() - 2].join("_");
        let well_token = fields[fields.len() - 2];
        let tflazc = fields[fields.len() - 1];

        let well = WellId::parse(well_token)
            .map_err(|_| ParseSkip::new(filename, format!("invalid well `{well_token}`")))?;

        let caps = self
            .metadata
            .captures(tflazc)
            .ok_or_else(|| ParseSkip::new(filename, format!("invalid metadata block `{tflazc}`")))?;
        let number = |i: usize| -> Result<u32, ParseSkip> {
            caps[i]
                .parse::<u32>()
                .map_err(|_| ParseSkip::new(filename, format!("number `{}` out of range", &caps[i])))
        };

        Ok(ImageKey {
            plate: plate_name(&plate_prefix),
            plate_prefix,
            well,
            time: number(1)?,
            fov: number(2)?,
            line: number(3)?,
            action: number(4)?,
            z: number(5)?,
            channel: number(6)?,
            acquisition: None,
        })
    }

    /// Parse a listing, keeping input order and logging every skipped name.
    pub fn parse_batch<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
        acquisition: Option<&AcquisitionId>,
    ) -> ParsedBatch {
        let mut batch = ParsedBatch::default();
        for name in names {
            match self.parse_filename(name) {
                Ok(mut key) => {
                    key.acquisition = acquisition.cloned();
                    batch.files.push(ParsedFile {
                        name: name.to_string(),
                        key,
                    });
                }
                Err(skip) => {
                    warn!("{skip}");
                    batch.skipped.push(skip);
                }
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parser() -> FilenameParser {
        FilenameParser::new().unwrap()
    }

    #[test]
    fn parses_instrument_filenames() {
        let cases = [
            (
                "20200812-CardiomyocyteDifferentiation14-Cycle1_B03_T0001F036L01A01Z18C01.png",
                "20200812-CardiomyocyteDifferentiation14-Cycle1",
                1,
                1,
                18,
            ),
            ("210305NAR005AAN_210416_164828_B11_T0001F006L01A04Z14C01.tif", "210305NAR005AAN", 4, 1, 14),
            ("220304_172545_220304_175557_L06_T0277F004L277A04Z07C04.tif", "RS220304172545", 4, 4, 7),
            ("220517CS001XXXIl_220715_151525_D05_T0001F001L01A01Z01C04.tif", "220517CS001XXXIl", 1, 4, 1),
            ("AssayPlate_Greiner_#655090_B02_T0001F004L01A01Z01C01.tif", "AssayPlate_Greiner_#655090", 1, 1, 1),
            (
                "AssayPlate_Greiner_#655090_B02_T0001F004L01A01Z000000001C01.tif",
                "AssayPlate_Greiner_#655090",
                1,
                1,
                1,
            ),
            ("Prefix_01-20-20_12-43-22_H12.d4_T0001F001L01A02Z01C02.tif", "Prefix_01-20-20_12-43-22", 2, 2, 1),
        ];
        let p = parser();
        for (name, plate, action, channel, z) in cases {
            let key = p.parse_filename(name).unwrap();
            assert_eq!(key.plate, plate, "{name}");
            assert_eq!(key.action, action, "{name}");
            assert_eq!(key.channel, channel, "{name}");
            assert_eq!(key.z, z, "{name}");
        }
    }

    #[test]
    fn extra_metadata_token_is_skipped() {
        let err = parser()
            .parse_filename("210305NAR005AAN_210416_164828_B11_T0001F006L01A04Z14C01K01.tif")
            .unwrap_err();
        assert!(err.reason.contains("metadata"));
    }

    #[test]
    fn wavelength_id_is_zero_padded() {
        let key = parser()
            .parse_filename("plate_B03_T0001F001L01A2Z01C3.tif")
            .unwrap();
        assert_eq!(key.wavelength_id(), "A02_C03");
    }

    #[test]
    fn z_planes_sort_numerically() {
        let p = parser();
        let a = p.parse_filename("plate_B03_T0001F001L01A01Z099C01.tif").unwrap();
        let b = p.parse_filename("plate_B03_T0001F001L01A01Z100C01.tif").unwrap();
        let c = p.parse_filename("plate_B03_T0001F001L01A01Z99C01.tif").unwrap();
        assert!(a < b);
        assert!(c < b);
        assert_eq!(a.cmp(&c), Ordering::Equal);
    }

    #[test]
    fn batch_skips_bad_names_and_keeps_order() {
        let names = [
            "plate_B03_T0001F002L01A01Z01C01.tif",
            "IMG_badformat.tif",
            "plate_B03_T0001F001L01A01Z01C01.tif",
            "MeasurementData.mlf",
        ];
        let acquisition = AcquisitionId::new("1").unwrap();
        let batch = parser()
            .with_extension("tif")
            .parse_batch(names, Some(&acquisition));
        assert_eq!(batch.files.len(), 2);
        assert_eq!(batch.files[0].key.fov, 2);
        assert_eq!(batch.files[1].key.fov, 1);
        assert!(batch.keys().all(|k| k.acquisition.as_ref() == Some(&acquisition)));
        let skipped: Vec<&str> = batch.skipped.iter().map(|s| s.filename.as_str()).collect();
        assert_eq!(skipped, vec!["IMG_badformat.tif", "MeasurementData.mlf"]);
    }

    #[test]
    fn plate_name_conventions() {
        assert_eq!(plate_name("210305NAR005AAN_210416_164828"), "210305NAR005AAN");
        assert_eq!(plate_name("220304_172545_220304_175557"), "RS220304172545");
        assert_eq!(plate_name("my_plate"), "my_plate");
    }

    proptest! {
        #[test]
        fn key_order_matches_numeric_order(z1 in 0u32..5000, z2 in 0u32..5000, pad1 in 2usize..5, pad2 in 2usize..5) {
            let p = parser();
            let a = p.parse_filename(&format!("plate_B03_T0001F001L01A01Z{z1:0pad1$}C01.tif")).unwrap();
            let b = p.parse_filename(&format!("plate_B03_T0001F001L01A01Z{z2:0pad2$}C01.tif")).unwrap();
            prop_assert_eq!(a.cmp(&b), z1.cmp(&z2));
        }

        #[test]
        fn parsing_is_deterministic(fov in 1u32..500, z in 1u32..300, c in 1u32..10) {
            let p = parser();
            let name = format!("plate_C07_T0001F{fov:03}L01A01Z{z:02}C{c:02}.tif");
            let first = p.parse_filename(&name).unwrap();
            let second = p.parse_filename(&name).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.fov, fov);
            prop_assert_eq!(first.z, z);
        }
    }
}
