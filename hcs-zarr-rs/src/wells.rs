//! Addressing keys: wells and acquisitions.
//!
//! Wells come as `B03` (96/384-well plates) or `B03.a1` (1536-well plates,
//! row `Ba`, column `031`). Acquisition ids are strings restricted to a
//! path-safe alphabet because they become image group names.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WellId {
    pub row: String,
    pub column: String,
}

impl WellId {
    /// Parse a well id as it appears in instrument filenames.
    pub fn parse(id: &str) -> Result<Self, SchemaError> {
        let invalid = || SchemaError::InvalidWellId(id.to_string());
        match id.split_once('.') {
            None => {
                let mut chars = id.chars();
                let row = chars.next().filter(|c| c.is_ascii_alphabetic()).ok_or_else(invalid)?;
                let column = chars.as_str();
                if column.len() != 2 || !column.chars().all(|c| c.is_ascii_digit()) {
                    return Err(invalid());
                }
                Ok(Self {
                    row: row.to_string(),
                    column: column.to_string(),
                })
            }
            Some((core, suffix)) => {
                let (Some(row_major), Some(row_minor)) = (core.chars().next(), suffix.chars().next())
                else {
                    return Err(invalid());
                };
                let column_major = &core[row_major.len_utf8()..];
                let column_minor = &suffix[row_minor.len_utf8()..];
                let ok = row_major.is_ascii_alphabetic()
                    && row_minor.is_ascii_alphabetic()
                    && column_major.len() == 2
                    && column_minor.len() == 1
                    && column_major.chars().chain(column_minor.chars()).all(|c| c.is_ascii_digit());
                if !ok {
                    return Err(invalid());
                }
                Ok(Self {
                    row: format!("{row_major}{row_minor}"),
                    column: format!("{column_major}{column_minor}"),
                })
            }
        }
    }

    /// Parse either the filename form (`B03`) or the group path form (`B/03`).
    pub fn parse_path(path: &str) -> Result<Self, SchemaError> {
        match path.trim_matches('/').split_once('/') {
            Some((row, column)) if !row.is_empty() && !column.is_empty() && !column.contains('/') => {
                Ok(Self {
                    row: row.to_string(),
                    column: column.to_string(),
                })
            }
            Some(_) => Err(SchemaError::InvalidWellId(path.to_string())),
            None => Self::parse(path),
        }
    }

    /// The id as it appears in instrument filenames.
    pub fn filename_id(&self) -> String {
        if self.row.len() == 2 && self.column.len() == 3 {
            let mut row = self.row.chars();
            let (major, minor) = (row.next().unwrap_or_default(), row.next().unwrap_or_default());
            format!("{major}{}.{minor}{}", &self.column[..2], &self.column[2..])
        } else {
            format!("{}{}", self.row, self.column)
        }
    }

    /// Group path relative to the plate root, e.g. `B/03`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.row, self.column)
    }
}

impl fmt::Display for WellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.filename_id())
    }
}

impl FromStr for WellId {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_path(s)
    }
}

/// Identifier of one imaging round in a multiplexed experiment.
///
/// Ordered numerically when both ids are integers, so `2 < 10`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AcquisitionId(String);

impl AcquisitionId {
    pub fn new(id: impl Into<String>) -> Result<Self, SchemaError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && id != "."
            && id != "..";
        if valid {
            Ok(Self(id))
        } else {
            Err(SchemaError::InvalidAcquisitionId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for AcquisitionId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for AcquisitionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for AcquisitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AcquisitionId {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AcquisitionId> for String {
    fn from(value: AcquisitionId) -> Self {
        value.0
    }
}

impl FromStr for AcquisitionId {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Sorted, de-duplicated (row, column) split of a list of well ids.
pub fn row_col_split(wells: &[&str]) -> Result<Vec<WellId>, SchemaError> {
    let mut out = wells
        .iter()
        .map(|w| WellId::parse(w))
        .collect::<Result<Vec<_>, _>>()?;
    out.sort();
    out.dedup();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_wells() {
        let well = WellId::parse("B03").unwrap();
        assert_eq!(well.row, "B");
        assert_eq!(well.column, "03");
        assert_eq!(well.path(), "B/03");
        assert_eq!(well.filename_id(), "B03");
    }

    #[test]
    fn parses_1536_wells() {
        let well = WellId::parse("H12.d4").unwrap();
        assert_eq!(well.row, "Hd");
        assert_eq!(well.column, "124");
        assert_eq!(well.filename_id(), "H12.d4");
    }

    #[test]
    fn rejects_unknown_well_patterns() {
        for bad in ["B3", "B003", "03B", "B03.a", "B03.12", ""] {
            assert!(WellId::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn parses_group_paths() {
        let well: WellId = "C/05".parse().unwrap();
        assert_eq!(well, WellId::parse("C05").unwrap());
        assert!(WellId::parse_path("C/05/0").is_err());
    }

    #[test]
    fn row_col_split_sorts() {
        let wells = row_col_split(&["C03", "B05", "B03", "B03"]).unwrap();
        let paths: Vec<String> = wells.iter().map(WellId::path).collect();
        assert_eq!(paths, vec!["B/03", "B/05", "C/03"]);
    }

    #[test]
    fn acquisition_ids_sort_numerically() {
        let mut ids: Vec<AcquisitionId> = ["10", "2", "1"]
            .iter()
            .map(|s| AcquisitionId::new(*s).unwrap())
            .collect();
        ids.sort();
        let names: Vec<&str> = ids.iter().map(AcquisitionId::as_str).collect();
        assert_eq!(names, vec!["1", "2", "10"]);
    }

    #[test]
    fn acquisition_ids_are_path_safe() {
        assert!(AcquisitionId::new("cycle_1").is_ok());
        assert!(AcquisitionId::new("").is_err());
        assert!(AcquisitionId::new("a/b").is_err());
        assert!(AcquisitionId::new("..").is_err());
    }
}
