//! Consensus ROIs across the acquisitions of a multiplexed well.
//!
//! Every acquisition's ROI table carries the (z, y, x) translation that
//! aligns it to the reference acquisition. Each ROI is narrowed to the
//! region imaged by all acquisitions and moved by its own translation.

use tracing::info;

use crate::error::{Error, RegistrationError, Result};
use crate::structure::Structure;
use crate::tables::{self, Column, ColumnType, Table, Value};
use crate::wells::WellId;
use crate::zarr::Store;

pub const TRANSLATION_COLUMNS: [&str; 3] = ["translation_z", "translation_y", "translation_x"];
const POSITION_COLUMNS: [&str; 3] = ["z_micrometer", "y_micrometer", "x_micrometer"];
const LENGTH_COLUMNS: [&str; 3] = ["len_z_micrometer", "len_y_micrometer", "len_x_micrometer"];

pub fn registered_table_name(table: &str) -> String {
    format!("registered_{table}")
}

/// The ROI table of one acquisition of a well.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionTable {
    pub acquisition: String,
    pub table: Table,
}

/// Append (z, y, x) translation columns, taking each row's shift from `shift`.
pub fn add_translation_columns(
    acquisition: &str,
    table: &Table,
    shift: impl Fn(&str) -> [f64; 3],
) -> std::result::Result<Table, RegistrationError> {
    if TRANSLATION_COLUMNS.iter().any(|c| table.schema.position(c).is_some()) {
        return Err(RegistrationError::AlreadyTranslated(acquisition.to_string()));
    }
    let mut out = table.clone();
    out.schema.columns.extend(TRANSLATION_COLUMNS.iter().map(|name| Column {
        name: name.to_string(),
        dtype: ColumnType::Float,
    }));
    for row in &mut out.rows {
        row.values.extend(shift(&row.key).map(Value::Float));
    }
    Ok(out)
}

fn positions(acquisition: &str, table: &Table, names: &[&str; 3]) -> std::result::Result<[usize; 3], RegistrationError> {
    let found = names.map(|n| table.schema.position(n));
    match found {
        [Some(z), Some(y), Some(x)] => Ok([z, y, x]),
        _ => Err(RegistrationError::MissingColumns {
            acquisition: acquisition.to_string(),
            columns: names
                .iter()
                .zip(found)
                .filter(|(_, f)| f.is_none())
                .map(|(n, _)| n.to_string())
                .collect(),
        }),
    }
}

/// Move the smallest ROI origin of each axis to zero.
fn reset_origin(table: &mut Table, cols: [usize; 3]) {
    for col in cols {
        let min = table
            .rows
            .iter()
            .map(|r| r.values[col].as_f64())
            .fold(f64::INFINITY, f64::min);
        if min.is_finite() {
            for row in &mut table.rows {
                row.values[col] = Value::Float(row.values[col].as_f64() - min);
            }
        }
    }
}

fn keys(table: &Table) -> Vec<String> {
    table.rows.iter().map(|r| r.key.clone()).collect()
}

/// Narrow the ROIs of every acquisition to the region all of them share.
///
/// The reference acquisition gets zero translations; every other table must
/// already carry them. All tables must list the same ROIs in the same order.
/// For each ROI and axis, with `hi`/`lo` the largest/smallest translation
/// over the acquisitions, the position becomes `p + hi - own` and the length
/// `len - (hi - lo)`.
pub fn consensus_rois(
    tables: &[AcquisitionTable],
    reference: &str,
    name: &str,
) -> std::result::Result<Vec<AcquisitionTable>, RegistrationError> {
    let reference_table = tables
        .iter()
        .find(|t| t.acquisition == reference)
        .ok_or_else(|| RegistrationError::UnknownReference(reference.to_string()))?;
    let expected = keys(&reference_table.table);

    let mut prepared = Vec::with_capacity(tables.len());
    for entry in tables {
        let mut table = if entry.acquisition == reference {
            add_translation_columns(reference, &entry.table, |_| [0.0; 3])?
        } else {
            entry.table.clone()
        };
        let acq = entry.acquisition.as_str();
        let cols = (
            positions(acq, &table, &POSITION_COLUMNS)?,
            positions(acq, &table, &LENGTH_COLUMNS)?,
            positions(acq, &table, &TRANSLATION_COLUMNS)?,
        );
        let found = keys(&table);
        if found != expected {
            return Err(RegistrationError::RoiMismatch {
                acquisition: acq.to_string(),
                expected: expected.clone(),
                found,
            });
        }
        reset_origin(&mut table, cols.0);
        prepared.push((entry.acquisition.clone(), table, cols));
    }

    let mut lo = vec![[f64::INFINITY; 3]; expected.len()];
    let mut hi = vec![[f64::NEG_INFINITY; 3]; expected.len()];
    for (_, table, (_, _, shift)) in &prepared {
        for (r, row) in table.rows.iter().enumerate() {
            for axis in 0..3 {
                let v = row.values[shift[axis]].as_f64();
                lo[r][axis] = lo[r][axis].min(v);
                hi[r][axis] = hi[r][axis].max(v);
            }
        }
    }

    Ok(prepared
        .into_iter()
        .map(|(acquisition, mut table, (pos, len, shift))| {
            for (r, row) in table.rows.iter_mut().enumerate() {
                for axis in 0..3 {
                    let own = row.values[shift[axis]].as_f64();
                    let p = row.values[pos[axis]].as_f64();
                    let l = row.values[len[axis]].as_f64();
                    row.values[pos[axis]] = Value::Float(p + hi[r][axis] - own);
                    row.values[len[axis]] = Value::Float(l - (hi[r][axis] - lo[r][axis]));
                }
            }
            table.name = name.to_string();
            AcquisitionTable { acquisition, table }
        })
        .collect())
}

/// Write `registered_<table>` (or `new_name`) into every image of `well`.
///
/// `reference` defaults to the first image of the well. Returns the paths
/// of the images that received the table.
pub fn register_well(
    store: &Store,
    well: &WellId,
    table: &str,
    reference: Option<&str>,
    new_name: Option<&str>,
) -> Result<Vec<String>> {
    let structure = Structure::open(store)?;
    let images: Vec<_> = structure.well_images(well).collect();
    let first = images.first().ok_or_else(|| Error::UnknownImage(well.path()))?;
    let reference = reference.map_or_else(|| first.name().to_string(), str::to_string);

    let inputs = images
        .iter()
        .map(|image| {
            Ok(AcquisitionTable {
                acquisition: image.name().to_string(),
                table: tables::read_table(store, &image.path(), table)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let name = new_name.map(str::to_string).unwrap_or_else(|| registered_table_name(table));
    let registered = consensus_rois(&inputs, &reference, &name)?;

    let mut written = Vec::with_capacity(images.len());
    for (image, entry) in images.iter().zip(&registered) {
        tables::write_table(store, &image.path(), &entry.table)?;
        written.push(image.path());
    }
    info!(
        "wrote {name} into {} images of well {well} against acquisition {reference}",
        written.len()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{fov_roi_schema, TableKind, FOV_ROI_TABLE};

    fn roi_table(rows: &[(&str, f64)]) -> Table {
        let mut table = Table::new(FOV_ROI_TABLE, TableKind::Roi, fov_roi_schema());
        for (key, x) in rows {
            // x, y, z, len_x, len_y, len_z, x_original, y_original
            let values = [*x, 0.0, 0.0, 10.0, 10.0, 1.0, *x, 0.0];
            table.push(key.to_string(), values.into_iter().map(Value::Float).collect());
        }
        table
    }

    fn cycle(acquisition: &str, table: Table) -> AcquisitionTable {
        AcquisitionTable {
            acquisition: acquisition.to_string(),
            table,
        }
    }

    fn shifted(rows: &[(&str, f64)], fov1_shift: [f64; 3]) -> Table {
        add_translation_columns("1", &roi_table(rows), |key| if key == "FOV_1" { fov1_shift } else { [0.0; 3] })
            .unwrap()
    }

    #[test]
    fn rois_shrink_to_the_shared_region() {
        let rows = [("FOV_1", 0.0), ("FOV_2", 10.0)];
        let tables = [
            cycle("0", roi_table(&rows)),
            cycle("1", shifted(&rows, [0.0, 2.0, -3.0])),
        ];
        let out = consensus_rois(&tables, "0", "registered_FOV_ROI_table").unwrap();
        let (reference, other) = (&out[0].table, &out[1].table);
        assert_eq!(reference.name, "registered_FOV_ROI_table");

        assert_eq!(reference.get("FOV_1", "x_micrometer"), Some(Value::Float(0.0)));
        assert_eq!(reference.get("FOV_1", "y_micrometer"), Some(Value::Float(2.0)));
        assert_eq!(reference.get("FOV_1", "len_x_micrometer"), Some(Value::Float(7.0)));
        assert_eq!(reference.get("FOV_1", "len_y_micrometer"), Some(Value::Float(8.0)));
        assert_eq!(reference.get("FOV_1", "translation_x"), Some(Value::Float(0.0)));

        assert_eq!(other.get("FOV_1", "x_micrometer"), Some(Value::Float(3.0)));
        assert_eq!(other.get("FOV_1", "y_micrometer"), Some(Value::Float(0.0)));
        assert_eq!(other.get("FOV_1", "len_x_micrometer"), Some(Value::Float(7.0)));

        // unshifted ROIs are untouched
        assert_eq!(other.get("FOV_2", "x_micrometer"), Some(Value::Float(10.0)));
        assert_eq!(other.get("FOV_2", "len_x_micrometer"), Some(Value::Float(10.0)));
    }

    #[test]
    fn origins_are_reset_before_shifting() {
        let rows = [("FOV_1", 100.0), ("FOV_2", 110.0)];
        let tables = [cycle("0", roi_table(&rows)), cycle("1", shifted(&rows, [0.0; 3]))];
        let out = consensus_rois(&tables, "0", "registered").unwrap();
        assert_eq!(out[1].table.get("FOV_1", "x_micrometer"), Some(Value::Float(0.0)));
        assert_eq!(out[1].table.get("FOV_2", "x_micrometer"), Some(Value::Float(10.0)));
        assert_eq!(out[1].table.get("FOV_2", "x_micrometer_original"), Some(Value::Float(110.0)));
    }

    #[test]
    fn acquisitions_must_share_their_rois() {
        let tables = [
            cycle("0", roi_table(&[("FOV_1", 0.0), ("FOV_2", 10.0)])),
            cycle("1", shifted(&[("FOV_1", 0.0)], [0.0; 3])),
        ];
        let err = consensus_rois(&tables, "0", "registered").unwrap_err();
        assert_eq!(
            err,
            RegistrationError::RoiMismatch {
                acquisition: "1".into(),
                expected: vec!["FOV_1".into(), "FOV_2".into()],
                found: vec!["FOV_1".into()],
            }
        );
    }

    #[test]
    fn translations_are_required_off_the_reference() {
        let rows = [("FOV_1", 0.0)];
        let missing = [cycle("0", roi_table(&rows)), cycle("1", roi_table(&rows))];
        assert!(matches!(
            consensus_rois(&missing, "0", "registered"),
            Err(RegistrationError::MissingColumns { .. })
        ));

        let translated_reference = [cycle("0", shifted(&rows, [0.0; 3])), cycle("1", shifted(&rows, [0.0; 3]))];
        assert_eq!(
            consensus_rois(&translated_reference, "0", "registered"),
            Err(RegistrationError::AlreadyTranslated("0".into()))
        );
        assert_eq!(
            consensus_rois(&missing, "7", "registered"),
            Err(RegistrationError::UnknownReference("7".into()))
        );
    }
}
