//! Copy the layout of an existing plate into a new one.
//!
//! Only metadata and empty level arrays are written; pixel data is left to
//! whatever step fills the new plate. ROI tables come along so the new plate
//! can be processed region by region straight away.

use tracing::{debug, info};

use crate::error::Result;
use crate::structure::Structure;
use crate::tables::{self, FOV_ROI_TABLE, WELL_ROI_TABLE};
use crate::zarr::Store;

#[derive(Debug, Clone)]
pub struct ReplicateOptions {
    /// Collapse every image to a single z plane.
    pub project_to_2d: bool,
    /// Tables to carry over when the source image has them.
    pub tables: Vec<String>,
    /// Appended to the plate name, e.g. `mip`.
    pub suffix: Option<String>,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self {
            project_to_2d: false,
            tables: vec![FOV_ROI_TABLE.to_string(), WELL_ROI_TABLE.to_string()],
            suffix: None,
        }
    }
}

/// Recreate the structure of `src` in `dst` and return it.
pub fn replicate_structure(src: &Store, dst: &Store, options: &ReplicateOptions) -> Result<Structure> {
    let mut structure = Structure::open(src)?;
    if options.project_to_2d {
        for image in &mut structure.images {
            image.shape_zyx[0] = 1;
        }
    }
    if let Some(suffix) = &options.suffix {
        structure.plate_name = format!("{}_{suffix}", structure.plate_name);
    }
    structure.write(dst)?;

    let mut copied = 0;
    for image in &structure.images {
        let path = image.path();
        let available = tables::list_tables(src, &path)?;
        for name in options.tables.iter().filter(|n| available.contains(n)) {
            let table = tables::read_table(src, &path, name)?;
            let table = if options.project_to_2d {
                tables::convert_rois_3d_to_2d(&table, structure.pixel_size.z)
            } else {
                table
            };
            tables::write_table(dst, &path, &table)?;
            debug!("copied table {name} of {path}");
            copied += 1;
        }
    }
    info!(
        "replicated {} into {} ({} images, {copied} tables)",
        src.root().display(),
        dst.root().display(),
        structure.images.len()
    );
    Ok(structure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelParameters, ChannelParams};
    use crate::layout::{resolve_layout, OverlapConfig, PixelSize, RawFov};
    use crate::pyramid::PyramidSpec;
    use crate::structure::{create_structure, AcquisitionSpec, ImageSpec, StructureRequest};
    use crate::tables::Value;
    use crate::wells::WellId;
    use crate::zarr;
    use tempfile::TempDir;

    fn source(store: &Store) -> Structure {
        let request = StructureRequest {
            plate_name: "plate".into(),
            acquisitions: vec![AcquisitionSpec {
                id: None,
                channels: ChannelParameters::new(vec![
                    ChannelParams::new("A01_C01", Some("DAPI")),
                    ChannelParams::new("A01_C02", Some("GFP")),
                ])
                .unwrap(),
            }],
            images: vec![ImageSpec {
                well: WellId::parse("B03").unwrap(),
                acquisition: None,
                wavelength_ids: vec!["A01_C01".into(), "A01_C02".into()],
                shape_zyx: [4, 8, 16],
            }],
            pixel_size: PixelSize::new(0.5, 0.5, 2.0),
            pyramid: PyramidSpec {
                num_levels: 2,
                coarsening_xy: 2,
                coarsening_z: 1,
            },
            chunk_yx: [8, 8],
            bit_depth: 16,
            label_prefix: None,
        };
        let structure = create_structure(store, &request).unwrap();
        let fovs = [0, 8].map(|x| RawFov {
            field: x as u32 / 8 + 1,
            x,
            y: 0,
            z: 0,
            width: 8,
            height: 8,
            depth: 4,
        });
        let layout = resolve_layout(&fovs, structure.pixel_size, &OverlapConfig::default()).unwrap();
        let path = structure.images[0].path();
        tables::write_table(store, &path, &tables::build_well_roi_table(&layout)).unwrap();
        tables::write_table(store, &path, &tables::build_well_footprint_table(&layout)).unwrap();
        structure
    }

    #[test]
    fn projection_flattens_arrays_and_tables() {
        let (a, b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let src = Store::open(a.path()).unwrap();
        let dst = Store::open(b.path()).unwrap();
        let original = source(&src);

        let options = ReplicateOptions {
            project_to_2d: true,
            suffix: Some("mip".into()),
            ..ReplicateOptions::default()
        };
        let replica = replicate_structure(&src, &dst, &options).unwrap();
        assert_eq!(replica.plate_name, "plate_mip");
        assert_eq!(replica.images[0].shape_zyx, [1, 8, 16]);
        assert_eq!(replica.images[0].channels, original.images[0].channels);

        let level0 = zarr::open_array(&dst, "B/03/0/0").unwrap();
        assert_eq!(level0.shape(), &[2, 1, 8, 16]);
        let reopened = Structure::open(&dst).unwrap();
        assert_eq!(reopened, replica);

        let fov = tables::read_table(&dst, "B/03/0", FOV_ROI_TABLE).unwrap();
        assert_eq!(fov.get("FOV_2", "x_micrometer"), Some(Value::Float(4.0)));
        assert_eq!(fov.get("FOV_2", "len_z_micrometer"), Some(Value::Float(2.0)));
        let well = tables::read_table(&dst, "B/03/0", WELL_ROI_TABLE).unwrap();
        assert_eq!(well.get("well_1", "len_z_micrometer"), Some(Value::Float(2.0)));
        let src_well = tables::read_table(&src, "B/03/0", WELL_ROI_TABLE).unwrap();
        assert_eq!(src_well.get("well_1", "len_z_micrometer"), Some(Value::Float(8.0)));
    }

    #[test]
    fn plain_copy_keeps_depth_and_skips_missing_tables() {
        let (a, b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let src = Store::open(a.path()).unwrap();
        let dst = Store::open(b.path()).unwrap();
        source(&src);

        let options = ReplicateOptions {
            tables: vec![FOV_ROI_TABLE.to_string(), "nuclei_ROI_table".to_string()],
            ..ReplicateOptions::default()
        };
        let replica = replicate_structure(&src, &dst, &options).unwrap();
        assert_eq!(replica.images[0].shape_zyx, [4, 8, 16]);
        assert_eq!(tables::list_tables(&dst, "B/03/0").unwrap(), vec![FOV_ROI_TABLE.to_string()]);
    }
}
