//! Tables attached to images: ROI tables, label bounding boxes, and
//! caller-supplied feature tables.
//!
//! A table is stored at `<image>/tables/<name>` as a group whose attributes
//! carry the column schema and row keys, plus an `X` float64 array of shape
//! (rows, columns). Integer columns are stored as exact floats.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result, SchemaError, SchemaMismatchError, TypeMismatch};
use crate::layout::Layout;
use crate::zarr::{self, Attributes, Store};

pub const FOV_ROI_TABLE: &str = "FOV_ROI_table";
pub const WELL_ROI_TABLE: &str = "well_ROI_table";

const TABLE_KEY: &str = "table";
const TABLES_KEY: &str = "tables";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Float,
    Int,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Float => f.write_str("float"),
            ColumnType::Int => f.write_str("int"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Float(f64),
    Int(i64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Float(v) => *v,
            Value::Int(v) => *v as f64,
        }
    }

    fn from_stored(dtype: ColumnType, v: f64) -> Self {
        match dtype {
            ColumnType::Float => Value::Float(v),
            ColumnType::Int => Value::Int(v as i64),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    #[serde(rename = "roi_table")]
    Roi,
    /// One row per label id, pointing back at a label image.
    #[serde(rename = "masking_roi_table")]
    MaskingRoi,
    #[serde(rename = "feature_table")]
    Feature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub dtype: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub index: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(index: &str, columns: &[(&str, ColumnType)]) -> Self {
        Self {
            index: index.to_string(),
            columns: columns
                .iter()
                .map(|(name, dtype)| Column {
                    name: name.to_string(),
                    dtype: *dtype,
                })
                .collect(),
        }
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }
}

/// Columns shared by every ROI table.
pub const ROI_COLUMNS: [&str; 6] = [
    "x_micrometer",
    "y_micrometer",
    "z_micrometer",
    "len_x_micrometer",
    "len_y_micrometer",
    "len_z_micrometer",
];

pub fn roi_schema() -> TableSchema {
    let columns: Vec<(&str, ColumnType)> = ROI_COLUMNS.iter().map(|c| (*c, ColumnType::Float)).collect();
    TableSchema::new("FieldIndex", &columns)
}

pub fn fov_roi_schema() -> TableSchema {
    let mut schema = roi_schema();
    for name in ["x_micrometer_original", "y_micrometer_original"] {
        schema.columns.push(Column {
            name: name.to_string(),
            dtype: ColumnType::Float,
        });
    }
    schema
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub kind: TableKind,
    pub schema: TableSchema,
    pub rows: Vec<Row>,
    pub attributes: Attributes,
}

impl Table {
    pub fn new(name: &str, kind: TableKind, schema: TableSchema) -> Self {
        Self {
            name: name.to_string(),
            kind,
            schema,
            rows: Vec::new(),
            attributes: Attributes::new(),
        }
    }

    pub(crate) fn push(&mut self, key: String, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.schema.columns.len());
        self.rows.push(Row { key, values });
    }

    pub fn row(&self, key: &str) -> Option<&Row> {
        self.rows.iter().find(|r| r.key == key)
    }

    pub fn get(&self, key: &str, column: &str) -> Option<Value> {
        let col = self.schema.position(column)?;
        self.row(key).map(|r| r.values[col])
    }

    pub fn column(&self, column: &str) -> Option<Vec<Value>> {
        let col = self.schema.position(column)?;
        Some(self.rows.iter().map(|r| r.values[col]).collect())
    }

    /// Write as CSV with the index as first column.
    pub fn to_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut w = csv::Writer::from_writer(writer);
        let mut header = vec![self.schema.index.clone()];
        header.extend(self.schema.columns.iter().map(|c| c.name.clone()));
        w.write_record(&header)?;
        for row in &self.rows {
            let mut record = vec![row.key.clone()];
            record.extend(row.values.iter().map(Value::to_string));
            w.write_record(&record)?;
        }
        w.flush()?;
        Ok(())
    }
}

/// One row per FOV with its resolved placement in micrometers.
pub fn build_well_roi_table(layout: &Layout) -> Table {
    let mut table = Table::new(FOV_ROI_TABLE, TableKind::Roi, fov_roi_schema());
    let px = &layout.pixel_size;
    for placement in &layout.placements {
        let b = placement.physical(px);
        table.push(
            format!("FOV_{}", placement.field),
            vec![
                Value::Float(b.x),
                Value::Float(b.y),
                Value::Float(b.z),
                Value::Float(b.len_x),
                Value::Float(b.len_y),
                Value::Float(b.len_z),
                Value::Float(placement.original_x as f64 * px.x),
                Value::Float(placement.original_y as f64 * px.y),
            ],
        );
    }
    table
}

/// A single row covering the whole well footprint.
pub fn build_well_footprint_table(layout: &Layout) -> Table {
    let mut table = Table::new(WELL_ROI_TABLE, TableKind::Roi, roi_schema());
    let [z, y, x] = layout.footprint();
    let px = &layout.pixel_size;
    table.push(
        "well_1".to_string(),
        vec![
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(x as f64 * px.x),
            Value::Float(y as f64 * px.y),
            Value::Float(z as f64 * px.z),
        ],
    );
    table
}

/// Flatten ROIs to a single Z plane.
pub fn convert_rois_3d_to_2d(table: &Table, pixel_size_z: f64) -> Table {
    let mut out = table.clone();
    let z = out.schema.position("z_micrometer");
    let len_z = out.schema.position("len_z_micrometer");
    for row in &mut out.rows {
        if let Some(i) = z {
            row.values[i] = Value::Float(0.0);
        }
        if let Some(i) = len_z {
            row.values[i] = Value::Float(pixel_size_z);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Text(Vec<String>),
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            ColumnData::Float(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ColumnData::Float(_) => "float",
            ColumnData::Int(_) => "int",
            ColumnData::Text(_) => "text",
        }
    }

    /// Values as `expected`, or `None` if any value does not fit that type.
    fn typed(&self, expected: ColumnType) -> Option<Vec<Value>> {
        match (self, expected) {
            (ColumnData::Float(v), ColumnType::Float) => Some(v.iter().map(|x| Value::Float(*x)).collect()),
            (ColumnData::Int(v), ColumnType::Int) => Some(v.iter().map(|x| Value::Int(*x)).collect()),
            (ColumnData::Text(v), ColumnType::Float) => v
                .iter()
                .map(|s| s.trim().parse::<f64>().ok().map(Value::Float))
                .collect(),
            (ColumnData::Text(v), ColumnType::Int) => v
                .iter()
                .map(|s| s.trim().parse::<i64>().ok().map(Value::Int))
                .collect(),
            _ => None,
        }
    }
}

/// A table produced outside this crate, before schema checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalTable {
    pub name: String,
    pub index: Vec<String>,
    pub columns: Vec<(String, ColumnData)>,
}

impl ExternalTable {
    /// Read a CSV whose first column holds the row keys. Every other column
    /// is kept as text until checked against a schema.
    pub fn from_csv<R: Read>(name: &str, reader: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr.headers()?.clone();
        let mut index = Vec::new();
        let mut columns: Vec<(String, Vec<String>)> =
            headers.iter().skip(1).map(|h| (h.to_string(), Vec::new())).collect();
        for record in rdr.records() {
            let record = record?;
            index.push(record.get(0).unwrap_or_default().to_string());
            for (i, (_, values)) in columns.iter_mut().enumerate() {
                values.push(record.get(i + 1).unwrap_or_default().to_string());
            }
        }
        Ok(Self {
            name: name.to_string(),
            index,
            columns: columns
                .into_iter()
                .map(|(name, values)| (name, ColumnData::Text(values)))
                .collect(),
        })
    }
}

/// Check a caller-supplied table against `expected` and convert it.
///
/// Every problem is collected before failing: missing and extra columns,
/// values that do not parse as the expected type, and columns whose length
/// differs from the index. Int and float are never converted into each other.
pub fn accept_external_table(
    table: ExternalTable,
    expected: &TableSchema,
    kind: TableKind,
) -> std::result::Result<Table, SchemaMismatchError> {
    let mut mismatch = SchemaMismatchError::new(&table.name);
    let provided: HashMap<&str, &ColumnData> = table.columns.iter().map(|(n, d)| (n.as_str(), d)).collect();

    for (name, _) in &table.columns {
        if expected.position(name).is_none() {
            mismatch.extra.push(name.clone());
        }
    }

    let mut typed = Vec::with_capacity(expected.columns.len());
    for column in &expected.columns {
        let Some(data) = provided.get(column.name.as_str()) else {
            mismatch.missing.push(column.name.clone());
            continue;
        };
        if data.len() != table.index.len() {
            mismatch.bad_length.push(column.name.clone());
            continue;
        }
        match data.typed(column.dtype) {
            Some(values) => typed.push(values),
            None => mismatch.wrong_type.push(TypeMismatch {
                column: column.name.clone(),
                expected: column.dtype,
                found: data.type_name().to_string(),
            }),
        }
    }
    if !mismatch.is_empty() {
        return Err(mismatch);
    }

    let mut out = Table::new(&table.name, kind, expected.clone());
    for (row, key) in table.index.into_iter().enumerate() {
        out.push(key, typed.iter().map(|col| col[row]).collect());
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableMeta {
    #[serde(rename = "type")]
    kind: TableKind,
    index: String,
    columns: Vec<Column>,
    rows: Vec<String>,
    #[serde(default)]
    attributes: Attributes,
}

fn tables_group(image_path: &str) -> String {
    format!("{}/tables", image_path.trim_matches('/'))
}

/// Names of the tables attached to an image.
pub fn list_tables(store: &Store, image_path: &str) -> Result<Vec<String>> {
    let group = tables_group(image_path);
    if !store.exists(&group) {
        return Ok(Vec::new());
    }
    let attrs = zarr::group_attributes(store, &group)?;
    let names = match attrs.get(TABLES_KEY) {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Vec::new(),
    };
    Ok(names)
}

/// Persist a table, replacing any table of the same name.
pub fn write_table(store: &Store, image_path: &str, table: &Table) -> Result<()> {
    let group = tables_group(image_path);
    let mut names = list_tables(store, image_path)?;
    if !names.contains(&table.name) {
        names.push(table.name.clone());
    }
    let mut attrs = Attributes::new();
    attrs.insert(TABLES_KEY.to_string(), serde_json::to_value(&names)?);
    zarr::create_group(store, &group, Some(attrs))?;

    let path = format!("{group}/{}", table.name);
    store.remove_node(&path)?;
    let meta = TableMeta {
        kind: table.kind,
        index: table.schema.index.clone(),
        columns: table.schema.columns.clone(),
        rows: table.rows.iter().map(|r| r.key.clone()).collect(),
        attributes: table.attributes.clone(),
    };
    let mut attrs = Attributes::new();
    attrs.insert(TABLE_KEY.to_string(), serde_json::to_value(&meta)?);
    zarr::create_group(store, &path, Some(attrs))?;

    let n_rows = table.rows.len() as u64;
    let n_cols = table.schema.columns.len() as u64;
    let array = zarr::create_array_f64(
        store,
        &format!("{path}/X"),
        vec![n_rows, n_cols],
        vec![n_rows.max(1), n_cols.max(1)],
        None,
    )?;
    if n_rows > 0 && n_cols > 0 {
        let data: Vec<f64> = table
            .rows
            .iter()
            .flat_map(|r| r.values.iter().map(Value::as_f64))
            .collect();
        zarr::store_chunk_f64(&array, &[0, 0], &data)?;
    }
    info!("wrote table {path} ({n_rows} rows)");
    Ok(())
}

pub fn read_table(store: &Store, image_path: &str, name: &str) -> Result<Table> {
    let path = format!("{}/{name}", tables_group(image_path));
    let attrs = zarr::group_attributes(store, &path)?;
    let value = attrs.get(TABLE_KEY).ok_or_else(|| {
        Error::Schema(SchemaError::Metadata {
            path: path.clone(),
            key: TABLE_KEY.to_string(),
        })
    })?;
    let meta: TableMeta = serde_json::from_value(value.clone())?;

    let n_rows = meta.rows.len();
    let n_cols = meta.columns.len();
    let data = if n_rows > 0 && n_cols > 0 {
        let array = zarr::open_array(store, &format!("{path}/X"))?;
        zarr::read_chunk_f64(&array, &[0, 0])?
    } else {
        Vec::new()
    };

    let schema = TableSchema {
        index: meta.index,
        columns: meta.columns,
    };
    let mut table = Table::new(name, meta.kind, schema);
    table.attributes = meta.attributes;
    for (r, key) in meta.rows.into_iter().enumerate() {
        let values = table
            .schema
            .columns
            .iter()
            .enumerate()
            .map(|(c, col)| Value::from_stored(col.dtype, data[r * n_cols + c]))
            .collect();
        table.push(key, values);
    }
    Ok(table)
}
