//! Label images and their bounding-box tables.
//!
//! Labels are `u32` (z, y, x) arrays aligned to level 0 of the intensity
//! image, stored at `<image>/labels/<name>/<level>`. Coarser levels take the
//! first element of each block so ids are never blended.

use std::collections::BTreeMap;

use ndarray::{ArrayView3, ArrayViewD, Axis};
use serde_json::json;
use tracing::info;

use crate::error::{Error, Result, SchemaError};
use crate::layout::PixelSize;
use crate::ngff::{self, ImageLabel, LabelImageMeta, LabelSource, LabelsMeta, Multiscale, NGFF_VERSION};
use crate::pyramid::{self, Downsample};
use crate::structure::{ImageNode, Structure};
use crate::tables::{ColumnType, Table, TableKind, TableSchema, Value};
use crate::zarr::{self, Store};

const BBOX_COLUMNS: [(&str, ColumnType); 12] = [
    ("z_min", ColumnType::Int),
    ("z_max", ColumnType::Int),
    ("y_min", ColumnType::Int),
    ("y_max", ColumnType::Int),
    ("x_min", ColumnType::Int),
    ("x_max", ColumnType::Int),
    ("x_micrometer", ColumnType::Float),
    ("y_micrometer", ColumnType::Float),
    ("z_micrometer", ColumnType::Float),
    ("len_x_micrometer", ColumnType::Float),
    ("len_y_micrometer", ColumnType::Float),
    ("len_z_micrometer", ColumnType::Float),
];

pub fn label_bbox_schema() -> TableSchema {
    let mut columns = vec![("label", ColumnType::Int)];
    columns.extend(BBOX_COLUMNS);
    TableSchema::new("label", &columns)
}

/// Name of the bounding-box table of a label image.
pub fn bbox_table_name(label_name: &str) -> String {
    format!("{label_name}_ROI_table")
}

fn labels_group(image: &ImageNode) -> String {
    format!("{}/labels", image.path())
}

/// Label images already attached to `image`.
pub fn list_labels(store: &Store, image: &ImageNode) -> Result<Vec<String>> {
    let group = labels_group(image);
    if !store.exists(&group) {
        return Ok(Vec::new());
    }
    let meta: LabelsMeta = ngff::from_attributes(&zarr::group_attributes(store, &group)?, &group)?;
    Ok(meta.labels)
}

/// Write a label image for `image`, replacing any previous one with the same
/// name. `labels` is (y, x) or (z, y, x) in level-0 index space.
pub fn write_label_image(
    store: &Store,
    structure: &Structure,
    image: &ImageNode,
    name: &str,
    labels: ArrayViewD<'_, u32>,
    model: Option<&str>,
) -> Result<()> {
    let labels = match labels.ndim() {
        2 => labels.insert_axis(Axis(0)),
        _ => labels,
    };
    let found: Vec<u64> = labels.shape().iter().map(|d| *d as u64).collect();
    if found != image.shape_zyx {
        return Err(SchemaError::ShapeMismatch {
            expected: image.shape_zyx.to_vec(),
            found,
        }
        .into());
    }

    let group = labels_group(image);
    let mut names = list_labels(store, image)?;
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
    let labels_meta = LabelsMeta {
        version: NGFF_VERSION.to_string(),
        labels: names,
    };
    zarr::create_group(store, &group, Some(ngff::to_attributes(&labels_meta)?))?;

    let path = format!("{group}/{name}");
    store.remove_node(&path)?;
    let scales = structure.level_scales().into_iter().map(|s| s.to_vec()).collect();
    let meta = LabelImageMeta {
        version: NGFF_VERSION.to_string(),
        multiscales: vec![Multiscale::new(Some(name.to_string()), ngff::label_axes(), scales)],
        image_label: ImageLabel {
            source: LabelSource {
                image: "../../".to_string(),
            },
            pretrained_model: model.map(str::to_string),
        },
    };
    zarr::create_group(store, &path, Some(ngff::to_attributes(&meta)?))?;

    let spec = &structure.pyramid;
    let mut arrays = Vec::with_capacity(spec.num_levels as usize);
    for level in 0..spec.num_levels {
        let shape = spec.level_shape(image.shape_zyx, level).to_vec();
        let chunks = structure.label_chunks(&shape);
        arrays.push(zarr::create_array_u32(store, &format!("{path}/{level}"), shape, chunks, None)?);
    }
    let level0 = arrays.first().ok_or_else(|| Error::Config("pyramid has no levels".into()))?;
    zarr::write_region(level0, &[0, 0, 0], labels)?;
    let factors = [spec.coarsening_z, spec.coarsening_xy, spec.coarsening_xy];
    for pair in arrays.windows(2) {
        pyramid::derive_level::<u32>(&pair[0], &pair[1], factors, Downsample::Nearest)?;
    }
    info!("wrote label image {path} ({} levels)", spec.num_levels);
    Ok(())
}

/// One row per nonzero label id with its enclosing box.
///
/// Disconnected pieces of the same id share a single box. Index bounds are
/// inclusive; physical lengths cover whole pixels.
pub fn build_label_bbox_table(
    labels: ArrayView3<'_, u32>,
    pixel_size: &PixelSize,
    image_path: &str,
    well: &str,
    label_name: &str,
) -> Table {
    let mut boxes: BTreeMap<u32, [usize; 6]> = BTreeMap::new();
    for ((z, y, x), &id) in labels.indexed_iter() {
        if id == 0 {
            continue;
        }
        boxes
            .entry(id)
            .and_modify(|b| {
                b[0] = b[0].min(z);
                b[1] = b[1].max(z);
                b[2] = b[2].min(y);
                b[3] = b[3].max(y);
                b[4] = b[4].min(x);
                b[5] = b[5].max(x);
            })
            .or_insert([z, z, y, y, x, x]);
    }

    let mut table = Table::new(&bbox_table_name(label_name), TableKind::MaskingRoi, label_bbox_schema());
    for (id, [z0, z1, y0, y1, x0, x1]) in boxes {
        let int = |v: usize| Value::Int(v as i64);
        table.push(
            id.to_string(),
            vec![
                Value::Int(id as i64),
                int(z0),
                int(z1),
                int(y0),
                int(y1),
                int(x0),
                int(x1),
                Value::Float(x0 as f64 * pixel_size.x),
                Value::Float(y0 as f64 * pixel_size.y),
                Value::Float(z0 as f64 * pixel_size.z),
                Value::Float((x1 - x0 + 1) as f64 * pixel_size.x),
                Value::Float((y1 - y0 + 1) as f64 * pixel_size.y),
                Value::Float((z1 - z0 + 1) as f64 * pixel_size.z),
            ],
        );
    }
    let attrs = json!({
        "region": {"path": format!("../labels/{label_name}")},
        "instance_key": "label",
        "image": image_path,
        "well": well,
        "label_name": label_name,
    });
    if let serde_json::Value::Object(map) = attrs {
        table.attributes = map;
    }
    table
}
