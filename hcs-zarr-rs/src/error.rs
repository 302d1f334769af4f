use std::fmt;

use thiserror::Error;

use crate::layout::Axis;
use crate::tables::ColumnType;

/// A filename that does not follow the instrument naming scheme.
///
/// Not fatal: the file is excluded from the batch and the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("skipping {filename}: {reason}")]
pub struct ParseSkip {
    pub filename: String,
    pub reason: String,
}

impl ParseSkip {
    pub(crate) fn new(filename: &str, reason: impl Into<String>) -> Self {
        Self {
            filename: filename.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while resolving the field-of-view layout of an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("no fields of view to lay out")]
    Empty,

    #[error("field {0} appears more than once")]
    DuplicateField(u32),

    #[error("field {0} has a zero extent")]
    ZeroExtent(u32),

    /// Trimming an overlap would leave the field with nothing to write.
    #[error("trimming field {field} against field {against} along {axis} leaves an extent of {extent} px")]
    CollapsedFov {
        field: u32,
        against: u32,
        axis: Axis,
        extent: i64,
    },
}

/// Structural inconsistencies detected before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid well id `{0}` (expected e.g. B03 or B03.a1)")]
    InvalidWellId(String),

    #[error("invalid acquisition id `{0}` (expected a non-empty [A-Za-z0-9._-] string)")]
    InvalidAcquisitionId(String),

    #[error("plate has no images")]
    EmptyPlate,

    #[error("acquisitions must either all carry an id or be a single unnamed acquisition")]
    MixedAcquisitions,

    #[error("acquisition `{0}` is declared more than once")]
    DuplicateAcquisition(String),

    #[error("image references unknown acquisition `{0}`")]
    UnknownAcquisition(String),

    #[error("well {well} has more than one image for acquisition `{image}`")]
    DuplicateImage { well: String, image: String },

    #[error("wavelength `{wavelength_id}` has no channel parameters in acquisition `{acquisition}`")]
    UnknownWavelength {
        acquisition: String,
        wavelength_id: String,
    },

    #[error("wavelength `{0}` is declared more than once")]
    DuplicateWavelength(String),

    #[error("channel label `{label}` appears more than once in {image}")]
    DuplicateLabel { image: String, label: String },

    #[error("well {well} in acquisition `{acquisition}` has channels {found:?}, expected {expected:?}")]
    InconsistentChannels {
        acquisition: String,
        well: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("non-unique channel labels across images of well {well}: {labels:?}")]
    NonUniqueWellLabels { well: String, labels: Vec<String> },

    #[error("array shape {found:?} is not aligned with {expected:?}")]
    ShapeMismatch { expected: Vec<u64>, found: Vec<u64> },

    #[error("invalid pyramid: {0}")]
    InvalidPyramid(String),

    #[error("missing or malformed `{key}` metadata at {path}")]
    Metadata { path: String, key: String },
}

/// A column whose values do not have the type the schema expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    pub column: String,
    pub expected: ColumnType,
    pub found: String,
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (expected {}, found {})", self.column, self.expected, self.found)
    }
}

/// A caller-supplied table that does not match the expected column schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("table `{table}` does not match its schema: {}", describe_mismatch(.missing, .extra, .wrong_type, .bad_length))]
pub struct SchemaMismatchError {
    pub table: String,
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    pub wrong_type: Vec<TypeMismatch>,
    pub bad_length: Vec<String>,
}

impl SchemaMismatchError {
    pub(crate) fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            missing: Vec::new(),
            extra: Vec::new(),
            wrong_type: Vec::new(),
            bad_length: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.missing.is_empty()
            && self.extra.is_empty()
            && self.wrong_type.is_empty()
            && self.bad_length.is_empty()
    }
}

fn describe_mismatch(
    missing: &[String],
    extra: &[String],
    wrong_type: &[TypeMismatch],
    bad_length: &[String],
) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing columns [{}]", missing.join(", ")));
    }
    if !extra.is_empty() {
        parts.push(format!("extra columns [{}]", extra.join(", ")));
    }
    if !wrong_type.is_empty() {
        let cols: Vec<String> = wrong_type.iter().map(|m| m.to_string()).collect();
        parts.push(format!("wrong types [{}]", cols.join(", ")));
    }
    if !bad_length.is_empty() {
        parts.push(format!("row count differs from index [{}]", bad_length.join(", ")));
    }
    parts.join("; ")
}

/// No channel in the addressed image(s) matches the requested spec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no channel matching `{spec}` in well {well}{}", .acquisition.as_ref().map(|a| format!(" (acquisition `{a}`)")).unwrap_or_default())]
pub struct ChannelNotFoundError {
    pub spec: String,
    pub well: String,
    pub acquisition: Option<String>,
}

/// ROI tables of a multiplexed well that cannot be brought to a common region.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("no reference acquisition `{0}` among the tables")]
    UnknownReference(String),

    #[error("table of acquisition `{acquisition}` lacks columns [{}]", .columns.join(", "))]
    MissingColumns { acquisition: String, columns: Vec<String> },

    #[error("table of acquisition `{0}` already has translation columns")]
    AlreadyTranslated(String),

    #[error("acquisition `{acquisition}` has ROIs {found:?}, the reference has {expected:?}")]
    RoiMismatch {
        acquisition: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatchError),

    #[error(transparent)]
    ChannelNotFound(#[from] ChannelNotFoundError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("tile for field {field} has shape {found:?} (c, z, y, x), expected {expected:?}")]
    TileShape {
        field: u32,
        expected: Vec<u64>,
        found: Vec<u64>,
    },

    #[error("region {start:?}..{end:?} does not fit array {path} with shape {shape:?}")]
    Region {
        path: String,
        start: Vec<u64>,
        end: Vec<u64>,
        shape: Vec<u64>,
    },

    #[error("image `{0}` is not part of the plate")]
    UnknownImage(String),

    #[error("no parsable images found in {0}")]
    NoImages(String),

    #[error("{path}: unsupported pixel format (need {expected})")]
    PixelFormat { path: String, expected: &'static str },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    /// Wraps an error from the storage engine.
    pub(crate) fn storage(err: impl fmt::Display) -> Self {
        Error::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
