//! Plate layout on disk: `/<row>/<col>/<image>/<level>`.
//!
//! Everything that can be checked is checked before the first group is
//! written. An image group is removed and recreated on rerun, so stale
//! levels, labels or tables never survive a conversion.

use std::collections::{BTreeSet, HashMap, HashSet};

use ndarray::{s, Array4, ArrayView4};
use tracing::{debug, info};

use crate::channels::{define_omero_channels, disambiguate, ChannelParameters};
use crate::error::{Error, Result, SchemaError};
use crate::layout::{PixelSize, Placement};
use crate::ngff::{
    self, ImageMeta, Multiscale, Named, Omero, OmeroChannel, Plate, PlateAcquisition, PlateMeta, PlateWell,
    Well, WellImage, WellMeta, NGFF_VERSION,
};
use crate::pyramid::{self, Downsample, PyramidSpec};
use crate::wells::{AcquisitionId, WellId};
use crate::zarr::{self, Store};

/// Image path used when the plate has a single unnamed acquisition.
pub const SINGLE_IMAGE: &str = "0";

/// One acquisition and the channels it may contain.
#[derive(Debug, Clone)]
pub struct AcquisitionSpec {
    pub id: Option<AcquisitionId>,
    pub channels: ChannelParameters,
}

/// One image to allocate: a well seen in one acquisition.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub well: WellId,
    pub acquisition: Option<AcquisitionId>,
    /// Wavelengths actually found for this image.
    pub wavelength_ids: Vec<String>,
    /// Level-0 (z, y, x) extent.
    pub shape_zyx: [u64; 3],
}

#[derive(Debug, Clone)]
pub struct StructureRequest {
    pub plate_name: String,
    pub acquisitions: Vec<AcquisitionSpec>,
    pub images: Vec<ImageSpec>,
    pub pixel_size: PixelSize,
    pub pyramid: PyramidSpec,
    pub chunk_yx: [u64; 2],
    pub bit_depth: u32,
    pub label_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageNode {
    pub well: WellId,
    pub acquisition: Option<AcquisitionId>,
    pub channels: Vec<OmeroChannel>,
    pub shape_zyx: [u64; 3],
}

impl ImageNode {
    /// Group name inside the well.
    pub fn name(&self) -> &str {
        self.acquisition.as_ref().map(AcquisitionId::as_str).unwrap_or(SINGLE_IMAGE)
    }

    /// Group path relative to the plate root.
    pub fn path(&self) -> String {
        format!("{}/{}", self.well.path(), self.name())
    }

    pub fn level_path(&self, level: u32) -> String {
        format!("{}/{level}", self.path())
    }

    pub fn labels(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.label.as_str()).collect()
    }
}

/// Everything needed to (re)write the groups and arrays of a plate.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub plate_name: String,
    /// Named acquisitions in plate order; empty for single-acquisition plates.
    pub acquisitions: Vec<AcquisitionId>,
    /// Sorted by well, then acquisition order.
    pub images: Vec<ImageNode>,
    pub pixel_size: PixelSize,
    pub pyramid: PyramidSpec,
    pub chunk_yx: [u64; 2],
}

impl Structure {
    pub fn wells(&self) -> Vec<&WellId> {
        let set: BTreeSet<&WellId> = self.images.iter().map(|i| &i.well).collect();
        set.into_iter().collect()
    }

    pub fn image(&self, path: &str) -> Option<&ImageNode> {
        let path = path.trim_matches('/');
        self.images.iter().find(|i| i.path() == path)
    }

    pub fn well_images<'a>(&'a self, well: &'a WellId) -> impl Iterator<Item = &'a ImageNode> + 'a {
        self.images.iter().filter(move |i| &i.well == well)
    }

    /// (c, z, y, x) shape of an image level.
    pub fn level_shape(&self, image: &ImageNode, level: u32) -> Vec<u64> {
        let [z, y, x] = self.pyramid.level_shape(image.shape_zyx, level);
        vec![image.channels.len() as u64, z, y, x]
    }

    fn level_chunks(&self, shape: &[u64]) -> Vec<u64> {
        let n = shape.len();
        let mut chunks = vec![1u64; n];
        chunks[n - 2] = self.chunk_yx[0].min(shape[n - 2]).max(1);
        chunks[n - 1] = self.chunk_yx[1].min(shape[n - 1]).max(1);
        chunks
    }

    /// Per-level (z, y, x) scales; label images reuse them.
    pub fn level_scales(&self) -> Vec<[f64; 3]> {
        let px = &self.pixel_size;
        self.pyramid.level_scales([px.z, px.y, px.x])
    }

    /// Chunk shape for a label level of `image`.
    pub(crate) fn label_chunks(&self, shape_zyx: &[u64]) -> Vec<u64> {
        self.level_chunks(shape_zyx)
    }

    fn plate_meta(&self) -> PlateMeta {
        let wells = self.wells();
        let rows: Vec<String> = wells.iter().map(|w| w.row.clone()).collect::<BTreeSet<_>>().into_iter().collect();
        let columns: Vec<String> =
            wells.iter().map(|w| w.column.clone()).collect::<BTreeSet<_>>().into_iter().collect();
        let plate_wells = wells
            .iter()
            .map(|w| PlateWell {
                path: w.path(),
                row_index: rows.iter().position(|r| *r == w.row).unwrap_or_default(),
                column_index: columns.iter().position(|c| *c == w.column).unwrap_or_default(),
            })
            .collect();
        PlateMeta {
            version: NGFF_VERSION.to_string(),
            plate: Plate {
                name: self.plate_name.clone(),
                rows: rows.into_iter().map(|name| Named { name }).collect(),
                columns: columns.into_iter().map(|name| Named { name }).collect(),
                wells: plate_wells,
                acquisitions: self
                    .acquisitions
                    .iter()
                    .map(|a| PlateAcquisition {
                        id: a.to_string(),
                        name: None,
                    })
                    .collect(),
            },
        }
    }

    fn image_meta(&self, image: &ImageNode) -> ImageMeta {
        let scales = self
            .level_scales()
            .into_iter()
            .map(|[z, y, x]| vec![1.0, z, y, x])
            .collect();
        ImageMeta {
            version: NGFF_VERSION.to_string(),
            multiscales: vec![Multiscale::new(None, ngff::intensity_axes(), scales)],
            omero: Some(Omero {
                channels: image.channels.clone(),
            }),
        }
    }

    /// Remove wells and rows of a previous plate at `store` that this one lacks.
    fn remove_stale_wells(&self, store: &Store) -> Result<()> {
        if !store.exists("/") {
            return Ok(());
        }
        let Ok(previous) = ngff::from_attributes::<PlateMeta>(&zarr::group_attributes(store, "/")?, "/") else {
            return Ok(());
        };
        let wells: HashSet<String> = self.wells().iter().map(|w| w.path()).collect();
        let rows: HashSet<&str> = self.wells().into_iter().map(|w| w.row.as_str()).collect();
        for well in previous.plate.wells {
            if !wells.contains(&well.path) {
                debug!("removing stale well {}", well.path);
                store.remove_node(&well.path)?;
            }
        }
        for row in previous.plate.rows {
            if !rows.contains(row.name.as_str()) {
                store.remove_node(&row.name)?;
            }
        }
        Ok(())
    }

    /// Write every group and allocate every level array.
    pub fn write(&self, store: &Store) -> Result<()> {
        self.remove_stale_wells(store)?;
        zarr::create_group(store, "/", Some(ngff::to_attributes(&self.plate_meta())?))?;
        let wells = self.wells();
        let rows: BTreeSet<&str> = wells.iter().map(|w| w.row.as_str()).collect();
        for row in rows {
            zarr::create_group(store, row, None)?;
        }
        for well in wells {
            let meta = WellMeta {
                version: NGFF_VERSION.to_string(),
                well: Well {
                    images: self
                        .well_images(well)
                        .map(|i| WellImage {
                            path: i.name().to_string(),
                            acquisition: i.acquisition.as_ref().map(|a| a.to_string()),
                        })
                        .collect(),
                },
            };
            zarr::create_group(store, &well.path(), Some(ngff::to_attributes(&meta)?))?;
        }
        for image in &self.images {
            let path = image.path();
            store.remove_node(&path)?;
            zarr::create_group(store, &path, Some(ngff::to_attributes(&self.image_meta(image))?))?;
            for level in 0..self.pyramid.num_levels {
                let shape = self.level_shape(image, level);
                let chunks = self.level_chunks(&shape);
                zarr::create_array_u16(store, &image.level_path(level), shape, chunks, None)?;
            }
            debug!("allocated {path} with {} channels", image.channels.len());
        }
        info!(
            "wrote plate {} with {} images in {} wells",
            self.plate_name,
            self.images.len(),
            self.wells().len()
        );
        Ok(())
    }

    /// Reload a structure from the attributes of an existing plate.
    pub fn open(store: &Store) -> Result<Self> {
        let plate: PlateMeta = ngff::from_attributes(&zarr::group_attributes(store, "/")?, "/")?;
        let acquisitions = plate
            .plate
            .acquisitions
            .iter()
            .map(|a| AcquisitionId::new(a.id.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut images = Vec::new();
        let mut levels: Option<(PixelSize, PyramidSpec, [u64; 2])> = None;
        for plate_well in &plate.plate.wells {
            let well = WellId::parse_path(&plate_well.path)?;
            let well_meta: WellMeta =
                ngff::from_attributes(&zarr::group_attributes(store, &plate_well.path)?, &plate_well.path)?;
            for entry in well_meta.well.images {
                let path = format!("{}/{}", well.path(), entry.path);
                let meta: ImageMeta = ngff::from_attributes(&zarr::group_attributes(store, &path)?, &path)?;
                let level0 = zarr::open_array(store, &format!("{path}/0"))?;
                let shape = level0.shape().to_vec();
                if shape.len() != 4 {
                    return Err(SchemaError::ShapeMismatch {
                        expected: vec![meta.channels().len() as u64, 0, 0, 0],
                        found: shape,
                    }
                    .into());
                }
                if levels.is_none() {
                    let chunks = zarr::chunk_shape(&level0)?;
                    levels = Some(read_levels(&meta, &path, [chunks[2], chunks[3]])?);
                }
                let acquisition = entry.acquisition.map(AcquisitionId::new).transpose()?;
                images.push(ImageNode {
                    well: well.clone(),
                    acquisition,
                    channels: meta.channels().to_vec(),
                    shape_zyx: [shape[1], shape[2], shape[3]],
                });
            }
        }
        let (pixel_size, pyramid, chunk_yx) = levels.ok_or(SchemaError::EmptyPlate)?;
        Ok(Self {
            plate_name: plate.plate.name,
            acquisitions,
            images,
            pixel_size,
            pyramid,
            chunk_yx,
        })
    }
}

fn read_levels(meta: &ImageMeta, path: &str, chunk_yx: [u64; 2]) -> Result<(PixelSize, PyramidSpec, [u64; 2])> {
    let malformed = || SchemaError::Metadata {
        path: path.to_string(),
        key: "multiscales".to_string(),
    };
    let multiscale = meta.multiscales.first().ok_or_else(malformed)?;
    let scale0 = multiscale
        .datasets
        .first()
        .and_then(|d| d.scale())
        .filter(|s| s.len() == 4)
        .ok_or_else(malformed)?;
    let mut pyramid = PyramidSpec {
        num_levels: multiscale.datasets.len() as u32,
        coarsening_xy: 1,
        coarsening_z: 1,
    };
    if let Some(scale1) = multiscale.datasets.get(1).and_then(|d| d.scale()).filter(|s| s.len() == 4) {
        pyramid.coarsening_z = (scale1[1] / scale0[1]).round() as u64;
        pyramid.coarsening_xy = (scale1[3] / scale0[3]).round() as u64;
    } else {
        pyramid.coarsening_xy = PyramidSpec::default().coarsening_xy;
    }
    Ok((PixelSize::new(scale0[3], scale0[2], scale0[1]), pyramid, chunk_yx))
}

/// Channel labels must not repeat across the images of one well.
pub fn check_well_channel_labels(well: &WellId, images: &[&ImageNode]) -> std::result::Result<(), SchemaError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut clashes: BTreeSet<String> = BTreeSet::new();
    for image in images {
        let labels: HashSet<&str> = image.labels().into_iter().collect();
        clashes.extend(labels.intersection(&seen).map(|l| l.to_string()));
        seen.extend(labels);
    }
    if clashes.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::NonUniqueWellLabels {
            well: well.path(),
            labels: clashes.into_iter().collect(),
        })
    }
}

fn acquisition_name(id: Option<&AcquisitionId>) -> String {
    id.map(|a| a.to_string()).unwrap_or_else(|| SINGLE_IMAGE.to_string())
}

/// Validate a request and build its structure without touching the store.
pub fn plan_structure(request: &StructureRequest) -> std::result::Result<Structure, SchemaError> {
    request.pyramid.validate()?;
    if request.chunk_yx.contains(&0) {
        return Err(SchemaError::InvalidPyramid("chunk size must be positive".into()));
    }
    if request.acquisitions.is_empty() || request.images.is_empty() {
        return Err(SchemaError::EmptyPlate);
    }

    let named = request.acquisitions.iter().filter(|a| a.id.is_some()).count();
    let n_acq = request.acquisitions.len();
    if (named > 0 && named < n_acq) || (named == 0 && n_acq > 1) {
        return Err(SchemaError::MixedAcquisitions);
    }
    let mut ids = HashSet::new();
    for acq in &request.acquisitions {
        if let Some(id) = &acq.id {
            if !ids.insert(id) {
                return Err(SchemaError::DuplicateAcquisition(id.to_string()));
            }
        }
    }

    // Wavelengths of the first image of each acquisition; the rest must agree.
    let mut reference: HashMap<usize, Vec<String>> = HashMap::new();
    let mut seen_images = HashSet::new();
    let mut placed: Vec<(usize, &ImageSpec)> = Vec::with_capacity(request.images.len());
    for image in &request.images {
        let acq_name = acquisition_name(image.acquisition.as_ref());
        let acq_index = request
            .acquisitions
            .iter()
            .position(|a| a.id == image.acquisition)
            .ok_or_else(|| SchemaError::UnknownAcquisition(acq_name.clone()))?;
        if !seen_images.insert((&image.well, acq_index)) {
            return Err(SchemaError::DuplicateImage {
                well: image.well.path(),
                image: acq_name,
            });
        }

        let mut wavelengths = HashSet::new();
        for wid in &image.wavelength_ids {
            if !wavelengths.insert(wid) {
                return Err(SchemaError::DuplicateWavelength(wid.clone()));
            }
            if request.acquisitions[acq_index].channels.get(wid).is_none() {
                return Err(SchemaError::UnknownWavelength {
                    acquisition: acq_name,
                    wavelength_id: wid.clone(),
                });
            }
        }

        let mut sorted = image.wavelength_ids.clone();
        sorted.sort();
        match reference.get(&acq_index) {
            Some(expected) if *expected != sorted => {
                return Err(SchemaError::InconsistentChannels {
                    acquisition: acq_name,
                    well: image.well.path(),
                    expected: expected.clone(),
                    found: sorted,
                });
            }
            Some(_) => {}
            None => {
                reference.insert(acq_index, sorted);
            }
        }
        placed.push((acq_index, image));
    }

    let mut channels_by_acq: Vec<Vec<OmeroChannel>> = Vec::with_capacity(n_acq);
    for (i, acq) in request.acquisitions.iter().enumerate() {
        let present = reference.get(&i).cloned().unwrap_or_default();
        let channels = define_omero_channels(
            &acq.channels.select(&present),
            request.bit_depth,
            request.label_prefix.as_deref(),
        )
        .map_err(|err| match err {
            SchemaError::DuplicateLabel { label, .. } => SchemaError::DuplicateLabel {
                image: format!("acquisition {}", acquisition_name(acq.id.as_ref())),
                label,
            },
            other => other,
        })?;
        channels_by_acq.push(channels);
    }

    if n_acq > 1 {
        let mut owners: HashMap<String, usize> = HashMap::new();
        for channels in &channels_by_acq {
            for c in channels {
                *owners.entry(c.label.clone()).or_default() += 1;
            }
        }
        for (i, channels) in channels_by_acq.iter_mut().enumerate() {
            let acq = acquisition_name(request.acquisitions[i].id.as_ref());
            for c in channels.iter_mut() {
                if owners.get(&c.label).copied().unwrap_or_default() > 1 {
                    let renamed = disambiguate(&c.label, &acq);
                    debug!("channel label {} renamed to {renamed}", c.label);
                    c.label = renamed;
                }
            }
            // a renamed label may collide with one declared verbatim
            let mut labels = HashSet::new();
            for c in channels.iter() {
                if !labels.insert(c.label.as_str()) {
                    return Err(SchemaError::DuplicateLabel {
                        image: format!("acquisition {acq}"),
                        label: c.label.clone(),
                    });
                }
            }
        }
    }

    placed.sort_by(|a, b| a.1.well.cmp(&b.1.well).then(a.0.cmp(&b.0)));
    let images: Vec<ImageNode> = placed
        .into_iter()
        .map(|(acq_index, spec)| ImageNode {
            well: spec.well.clone(),
            acquisition: spec.acquisition.clone(),
            channels: channels_by_acq[acq_index].clone(),
            shape_zyx: spec.shape_zyx,
        })
        .collect();

    let structure = Structure {
        plate_name: request.plate_name.clone(),
        acquisitions: request.acquisitions.iter().filter_map(|a| a.id.clone()).collect(),
        images,
        pixel_size: request.pixel_size,
        pyramid: request.pyramid,
        chunk_yx: request.chunk_yx,
    };
    for well in structure.wells() {
        let images: Vec<&ImageNode> = structure.well_images(well).collect();
        check_well_channel_labels(well, &images)?;
    }
    Ok(structure)
}

/// Validate, then write the plate, wells, images and empty level arrays.
pub fn create_structure(store: &Store, request: &StructureRequest) -> Result<Structure> {
    let structure = plan_structure(request)?;
    structure.write(store)?;
    Ok(structure)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Accept tiles smaller than the nominal FOV, filling the rest with zeros.
    pub pad_with_zeros: bool,
}

/// Write one FOV tile (c, z, y, x) into level 0 of `image`.
pub fn write_level0(
    store: &Store,
    image: &ImageNode,
    placement: &Placement,
    tile: ArrayView4<'_, u16>,
    options: &WriteOptions,
) -> Result<()> {
    let (c, z, y, x) = tile.dim();
    let nominal = (
        image.channels.len(),
        placement.depth as usize,
        placement.nominal_height as usize,
        placement.nominal_width as usize,
    );
    let shape_error = || Error::TileShape {
        field: placement.field,
        expected: vec![nominal.0 as u64, nominal.1 as u64, nominal.2 as u64, nominal.3 as u64],
        found: vec![c as u64, z as u64, y as u64, x as u64],
    };
    if c != nominal.0 || z != nominal.1 || y > nominal.2 || x > nominal.3 {
        return Err(shape_error());
    }
    let short = y < nominal.2 || x < nominal.3;
    if short && !options.pad_with_zeros {
        return Err(shape_error());
    }

    let padded;
    let full = if short {
        let mut p = Array4::<u16>::zeros(nominal);
        p.slice_mut(s![.., .., ..y, ..x]).assign(&tile);
        padded = p;
        padded.view()
    } else {
        tile
    };

    let (sy, sx) = (placement.source_y as usize, placement.source_x as usize);
    let region = full.slice(s![
        ..,
        ..,
        sy..sy + placement.height as usize,
        sx..sx + placement.width as usize
    ]);
    let array = zarr::open_array(store, &image.level_path(0))?;
    zarr::write_region(&array, &[0, placement.z, placement.y, placement.x], region.into_dyn())?;
    debug!("wrote field {} into {}", placement.field, image.path());
    Ok(())
}

/// Rebuild levels 1.. of `image` from level 0.
pub fn derive_pyramid(store: &Store, structure: &Structure, image: &ImageNode) -> Result<()> {
    let spec = &structure.pyramid;
    let factors = [spec.coarsening_z, spec.coarsening_xy, spec.coarsening_xy];
    for level in 1..spec.num_levels {
        let src = zarr::open_array(store, &image.level_path(level - 1))?;
        let dst = zarr::open_array(store, &image.level_path(level))?;
        pyramid::derive_level::<u16>(&src, &dst, factors, Downsample::Mean)?;
    }
    info!("built {} pyramid levels for {}", spec.num_levels, image.path());
    Ok(())
}
