use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use ndarray::{s, Array4};
use tracing::{info, warn};

use crate::config::ConvertConfig;
use crate::error::{Error, Result};
use crate::filename::{FilenameParser, ImageKey};
use crate::frames;
use crate::layout::{resolve_layout, Layout, OverlapMode};
use crate::structure::{
    create_structure, derive_pyramid, write_level0, AcquisitionSpec, ImageNode, ImageSpec, Structure,
    StructureRequest, WriteOptions,
};
use crate::tables::{self, ExternalTable, Table, TableKind};
use crate::wells::WellId;
use crate::zarr::Store;

#[derive(Args, Clone)]
pub struct ConvertArgs {
    /// TOML file describing pixel size, channels and acquisition folders
    #[arg(long)]
    pub config: PathBuf,

    /// Output plate directory, e.g. plate.zarr
    #[arg(long)]
    pub output: PathBuf,

    /// Override the plate name
    #[arg(long)]
    pub plate_name: Option<String>,

    /// Override the number of pyramid levels
    #[arg(long)]
    pub num_levels: Option<u32>,

    /// Override the tolerated FOV overlap, in pixels
    #[arg(long)]
    pub tolerance_px: Option<u64>,

    /// Trim whichever overlapping FOV keeps the covered area intact
    #[arg(long)]
    pub flexible: bool,

    /// Accept FOV tiles smaller than the nominal size
    #[arg(long)]
    pub pad_with_zeros: bool,
}

pub fn run(args: ConvertArgs, progress: impl Fn(f64, &str)) -> Result<Structure> {
    let mut config = ConvertConfig::from_file(&args.config)?;
    if let Some(name) = args.plate_name {
        config.plate_name = Some(name);
    }
    if let Some(levels) = args.num_levels {
        config.pyramid.num_levels = levels;
    }
    if let Some(tolerance) = args.tolerance_px {
        config.overlap.tolerance_px = tolerance;
    }
    if args.flexible {
        config.overlap.mode = OverlapMode::Flexible;
    }
    config.pad_with_zeros |= args.pad_with_zeros;
    convert_plate(&config, &args.output, progress)
}

/// Files of one acquisition folder, after filename parsing.
struct SourceFile {
    acquisition: usize,
    path: PathBuf,
    key: ImageKey,
}

/// One well of one acquisition, ready to be written.
struct PlannedImage {
    well: WellId,
    acquisition: usize,
    layout: Layout,
    z_planes: Vec<u32>,
    nominal_yx: [u64; 2],
    fields: BTreeMap<u32, Vec<SourceFile>>,
}

fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names)
}

fn collect_files(config: &ConvertConfig) -> Result<Vec<SourceFile>> {
    let parser = FilenameParser::new()?.with_extension(&config.image_extension);
    let mut files = Vec::new();
    for (index, acquisition) in config.acquisitions.iter().enumerate() {
        let dir = config.acquisition_dir(acquisition);
        let names = list_files(&dir)?;
        let batch = parser.parse_batch(names.iter().map(String::as_str), acquisition.id.as_ref());
        if batch.files.is_empty() {
            return Err(Error::NoImages(dir.display().to_string()));
        }
        info!(
            "{}: {} images, {} skipped",
            dir.display(),
            batch.files.len(),
            batch.skipped.len()
        );
        files.extend(batch.files.into_iter().map(|f| SourceFile {
            acquisition: index,
            path: dir.join(&f.name),
            key: f.key,
        }));
    }

    // Only the first time point is converted.
    let first = files.iter().map(|f| f.key.time).min();
    if let Some(t0) = first {
        let before = files.len();
        files.retain(|f| f.key.time == t0);
        if files.len() < before {
            warn!("keeping time point {t0} only, {} later images ignored", before - files.len());
        }
    }
    Ok(files)
}

fn plan_image(
    config: &ConvertConfig,
    well: WellId,
    acquisition: usize,
    fields: BTreeMap<u32, Vec<SourceFile>>,
) -> Result<PlannedImage> {
    let (mut width, mut height) = (0u32, 0u32);
    for file in fields.values().flatten() {
        let (w, h) = frames::tiff_dimensions(&file.path)?;
        width = width.max(w);
        height = height.max(h);
    }
    let z_planes: Vec<u32> = fields
        .values()
        .flatten()
        .map(|f| f.key.z)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let field_ids: Vec<u32> = fields.keys().copied().collect();
    let raw = config
        .fovs
        .raw_fovs(&field_ids, width as u64, height as u64, z_planes.len() as u64)?;
    let layout = resolve_layout(&raw, config.pixel_size, &config.overlap)?;
    Ok(PlannedImage {
        well,
        acquisition,
        layout,
        z_planes,
        nominal_yx: [height as u64, width as u64],
        fields,
    })
}

/// FOV ROI table of one planned image: the configured CSV, checked against
/// the FOV schema, or one derived from the layout.
fn fov_roi_table(config: &ConvertConfig, plan: &PlannedImage) -> Result<Table> {
    let acquisition = &config.acquisitions[plan.acquisition];
    let Some(path) = config.roi_table_path(acquisition, &plan.well) else {
        return Ok(tables::build_well_roi_table(&plan.layout));
    };
    let file = fs::File::open(&path)
        .map_err(|err| Error::Config(format!("failed to open ROI table {}: {err}", path.display())))?;
    let external = ExternalTable::from_csv(tables::FOV_ROI_TABLE, file)?;
    let table = tables::accept_external_table(external, &tables::fov_roi_schema(), TableKind::Roi)?;
    info!("{}: using {} ROIs from {}", plan.well, table.rows.len(), path.display());
    Ok(table)
}

/// Stack the planes of one field into a (c, z, y, x) tile in channel order.
fn assemble_tile(image: &ImageNode, z_planes: &[u32], files: &[SourceFile]) -> Result<Array4<u16>> {
    let mut tile: Option<Array4<u16>> = None;
    let mut filled = 0;
    for file in files {
        let wavelength_id = file.key.wavelength_id();
        let (Some(c), Some(z)) = (
            image.channels.iter().position(|ch| ch.wavelength_id == wavelength_id),
            z_planes.iter().position(|z| *z == file.key.z),
        ) else {
            continue;
        };
        let plane = frames::read_frame_u16(&file.path)?;
        let (h, w) = plane.dim();
        let tile = tile.get_or_insert_with(|| Array4::zeros((image.channels.len(), z_planes.len(), h, w)));
        if tile.dim().2 != h || tile.dim().3 != w {
            return Err(Error::TileShape {
                field: file.key.fov,
                expected: vec![tile.dim().2 as u64, tile.dim().3 as u64],
                found: vec![h as u64, w as u64],
            });
        }
        tile.slice_mut(s![c, z, .., ..]).assign(&plane);
        filled += 1;
    }
    let expected = image.channels.len() * z_planes.len();
    if filled < expected {
        warn!("{}: {filled} of {expected} planes found, the rest stay zero", image.path());
    }
    tile.ok_or_else(|| Error::NoImages(image.path()))
}

/// Convert the acquisition folders of `config` into a plate at `output`.
pub fn convert_plate(config: &ConvertConfig, output: &Path, progress: impl Fn(f64, &str)) -> Result<Structure> {
    config.validate()?;
    let files = collect_files(config)?;
    let plate_name = match (&config.plate_name, files.first()) {
        (Some(name), _) => name.clone(),
        (None, Some(file)) => file.key.plate.clone(),
        (None, None) => return Err(Error::NoImages(config.base_dir.display().to_string())),
    };
    let plates: BTreeSet<&str> = files.iter().map(|f| f.key.plate.as_str()).collect();
    if plates.len() > 1 {
        warn!("files name {} plates, writing them all as {plate_name}", plates.len());
    }

    let mut groups: BTreeMap<(WellId, usize), BTreeMap<u32, Vec<SourceFile>>> = BTreeMap::new();
    for file in files {
        groups
            .entry((file.key.well.clone(), file.acquisition))
            .or_default()
            .entry(file.key.fov)
            .or_default()
            .push(file);
    }

    let mut planned = Vec::with_capacity(groups.len());
    let mut images = Vec::with_capacity(groups.len());
    for ((well, acquisition), fields) in groups {
        let plan = plan_image(config, well, acquisition, fields)?;
        let wavelength_ids: BTreeSet<String> = plan.fields.values().flatten().map(|f| f.key.wavelength_id()).collect();
        images.push(ImageSpec {
            well: plan.well.clone(),
            acquisition: config.acquisitions[acquisition].id.clone(),
            wavelength_ids: wavelength_ids.into_iter().collect(),
            shape_zyx: plan.layout.footprint(),
        });
        planned.push(plan);
    }
    let chunk_yx = config
        .chunk_yx
        .or_else(|| planned.first().map(|p| p.nominal_yx))
        .unwrap_or([1, 1]);
    let fov_tables = planned
        .iter()
        .map(|plan| fov_roi_table(config, plan))
        .collect::<Result<Vec<_>>>()?;

    let request = StructureRequest {
        plate_name,
        acquisitions: config
            .acquisitions
            .iter()
            .map(|a| AcquisitionSpec {
                id: a.id.clone(),
                channels: a.channels.clone(),
            })
            .collect(),
        images,
        pixel_size: config.pixel_size,
        pyramid: config.pyramid,
        chunk_yx,
        bit_depth: config.bit_depth,
        label_prefix: config.label_prefix.clone(),
    };
    let store = Store::open(output)?;
    let structure = create_structure(&store, &request)?;
    progress(0.0, &format!("Created plate {}", structure.plate_name));

    let options = WriteOptions {
        pad_with_zeros: config.pad_with_zeros,
    };
    let total: usize = planned.iter().map(|p| p.fields.len() + 1).sum();
    let mut done = 0;
    for (plan, fov_table) in planned.iter().zip(&fov_tables) {
        let acquisition = config.acquisitions[plan.acquisition].id.as_ref();
        let node = structure
            .images
            .iter()
            .find(|n| n.well == plan.well && n.acquisition.as_ref() == acquisition)
            .ok_or_else(|| Error::UnknownImage(plan.well.path()))?;
        for (field, files) in &plan.fields {
            let placement = plan
                .layout
                .get(*field)
                .ok_or_else(|| Error::UnknownImage(format!("{} field {field}", node.path())))?;
            let tile = assemble_tile(node, &plan.z_planes, files)?;
            write_level0(&store, node, placement, tile.view(), &options)?;
            done += 1;
            progress(done as f64 / total as f64, &format!("Writing {} field {field}", node.path()));
        }
        derive_pyramid(&store, &structure, node)?;
        tables::write_table(&store, &node.path(), fov_table)?;
        tables::write_table(&store, &node.path(), &tables::build_well_footprint_table(&plan.layout))?;
        done += 1;
        progress(done as f64 / total as f64, &format!("Built pyramid for {}", node.path()));
    }

    progress(1.0, &format!("Wrote {}", output.display()));
    Ok(structure)
}
