use std::fs;
use std::path::PathBuf;

use clap::{Args, ValueEnum};

use crate::channels::{ChannelSpec, WellChannels};
use crate::error::{Error, Result};
use crate::frames;
use crate::labels;
use crate::registration;
use crate::replicate::{replicate_structure, ReplicateOptions};
use crate::structure::{ImageNode, Structure};
use crate::tables::{self, ColumnType, ExternalTable, TableKind, TableSchema};
use crate::wells::WellId;
use crate::zarr::Store;

fn find_image<'a>(structure: &'a Structure, path: &str) -> Result<&'a ImageNode> {
    structure.image(path).ok_or_else(|| Error::UnknownImage(path.to_string()))
}

#[derive(Args, Clone)]
pub struct LabelsArgs {
    /// Plate directory
    #[arg(long)]
    pub zarr: PathBuf,

    /// Image inside the plate, e.g. B/03/0
    #[arg(long)]
    pub image: String,

    /// Label image name, e.g. nuclei
    #[arg(long)]
    pub name: String,

    /// Label TIFF aligned to level 0; one page per z plane
    #[arg(long)]
    pub input: PathBuf,

    /// Model that produced the labels
    #[arg(long)]
    pub model: Option<String>,

    /// Do not write the bounding-box table
    #[arg(long)]
    pub no_table: bool,
}

pub fn run_labels(args: LabelsArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let store = Store::open(&args.zarr)?;
    let structure = Structure::open(&store)?;
    let image = find_image(&structure, &args.image)?;
    let stack = frames::read_label_stack(&args.input)?;
    progress(0.2, &format!("Read {} label planes", stack.dim().0));

    labels::write_label_image(
        &store,
        &structure,
        image,
        &args.name,
        stack.view().into_dyn(),
        args.model.as_deref(),
    )?;
    progress(0.8, &format!("Wrote labels/{}", args.name));

    if !args.no_table {
        let table = labels::build_label_bbox_table(
            stack.view(),
            &structure.pixel_size,
            &image.path(),
            &image.well.path(),
            &args.name,
        );
        tables::write_table(&store, &image.path(), &table)?;
    }
    progress(1.0, &format!("Labelled {}", image.path()));
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImportKind {
    /// ROI table with the standard micrometer columns
    Roi,
    /// FOV ROI table, with the original positions
    FovRoi,
    /// Feature table with the columns given by --columns
    Feature,
}

#[derive(Args, Clone)]
pub struct ImportTableArgs {
    /// Plate directory
    #[arg(long)]
    pub zarr: PathBuf,

    /// Image inside the plate, e.g. B/03/0
    #[arg(long)]
    pub image: String,

    /// Table name
    #[arg(long)]
    pub name: String,

    /// CSV whose first column holds the row keys
    #[arg(long)]
    pub csv: PathBuf,

    #[arg(long, value_enum, default_value = "roi")]
    pub kind: ImportKind,

    /// Feature columns as name:type pairs, e.g. "area:int,mean:float"
    #[arg(long)]
    pub columns: Option<String>,

    /// Name of the index column of feature tables
    #[arg(long, default_value = "label")]
    pub index: String,
}

fn parse_columns(spec: &str) -> Result<Vec<(String, ColumnType)>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, dtype) = pair
                .split_once(':')
                .ok_or_else(|| Error::Config(format!("column `{pair}` needs a type, e.g. {pair}:float")))?;
            let dtype = match dtype.trim() {
                "float" => ColumnType::Float,
                "int" => ColumnType::Int,
                other => return Err(Error::Config(format!("unknown column type `{other}`"))),
            };
            Ok((name.trim().to_string(), dtype))
        })
        .collect()
}

pub fn run_import_table(args: ImportTableArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let store = Store::open(&args.zarr)?;
    let structure = Structure::open(&store)?;
    let image = find_image(&structure, &args.image)?;

    let (schema, kind) = match args.kind {
        ImportKind::Roi => (tables::roi_schema(), TableKind::Roi),
        ImportKind::FovRoi => (tables::fov_roi_schema(), TableKind::Roi),
        ImportKind::Feature => {
            let spec = args
                .columns
                .as_deref()
                .ok_or_else(|| Error::Config("feature tables need --columns".into()))?;
            let columns = parse_columns(spec)?;
            let borrowed: Vec<(&str, ColumnType)> = columns.iter().map(|(n, t)| (n.as_str(), *t)).collect();
            (TableSchema::new(&args.index, &borrowed), TableKind::Feature)
        }
    };

    let external = ExternalTable::from_csv(&args.name, fs::File::open(&args.csv)?)?;
    let table = tables::accept_external_table(external, &schema, kind)?;
    progress(0.5, &format!("Checked {} rows against the schema", table.rows.len()));
    tables::write_table(&store, &image.path(), &table)?;
    progress(1.0, &format!("Wrote {}/tables/{}", image.path(), args.name));
    Ok(())
}

#[derive(Args, Clone)]
pub struct ResolveArgs {
    /// Plate directory
    #[arg(long)]
    pub zarr: PathBuf,

    /// Well, e.g. B/03 or B03
    #[arg(long)]
    pub well: String,

    /// Channel: a bare value, label=..., wavelength_id=... or index=...
    #[arg(long)]
    pub channel: String,

    /// Restrict the search to one acquisition
    #[arg(long)]
    pub acquisition: Option<String>,
}

/// Print where a channel lives as one JSON object on stdout.
pub fn run_resolve(args: ResolveArgs) -> Result<()> {
    let store = Store::open(&args.zarr)?;
    let well: WellId = WellId::parse_path(&args.well)?;
    let spec: ChannelSpec = match args.channel.parse() {
        Ok(spec) => spec,
        Err(never) => match never {},
    };
    let resolution = WellChannels::load(&store, &well)?.resolve(&spec, args.acquisition.as_deref())?;
    println!(
        "{}",
        serde_json::json!({
            "image_path": resolution.image_path,
            "array_path": resolution.array_path,
            "channel_index": resolution.channel_index,
            "label": resolution.channel.label,
            "wavelength_id": resolution.channel.wavelength_id,
        })
    );
    Ok(())
}

#[derive(Args, Clone)]
pub struct ReplicateArgs {
    /// Source plate directory
    #[arg(long)]
    pub input: PathBuf,

    /// New plate directory
    #[arg(long)]
    pub output: PathBuf,

    /// Collapse every image to one z plane
    #[arg(long)]
    pub project_to_2d: bool,

    /// Suffix for the new plate name, e.g. mip
    #[arg(long)]
    pub suffix: Option<String>,

    /// Tables to copy, comma separated
    #[arg(long, value_delimiter = ',')]
    pub tables: Option<Vec<String>>,
}

pub fn run_replicate(args: ReplicateArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let src = Store::open(&args.input)?;
    let dst = Store::open(&args.output)?;
    let mut options = ReplicateOptions {
        project_to_2d: args.project_to_2d,
        suffix: args.suffix,
        ..ReplicateOptions::default()
    };
    if let Some(tables) = args.tables {
        options.tables = tables;
    }
    let structure = replicate_structure(&src, &dst, &options)?;
    progress(
        1.0,
        &format!("Replicated {} images into {}", structure.images.len(), args.output.display()),
    );
    Ok(())
}

#[derive(Args, Clone)]
pub struct RegisterArgs {
    /// Plate directory
    #[arg(long)]
    pub zarr: PathBuf,

    /// Well, e.g. B/03 or B03
    #[arg(long)]
    pub well: String,

    /// ROI table carrying the per-acquisition translations
    #[arg(long, default_value = tables::FOV_ROI_TABLE)]
    pub table: String,

    /// Reference acquisition; the first image of the well when unset
    #[arg(long)]
    pub reference: Option<String>,

    /// Name of the new table; registered_<table> when unset
    #[arg(long)]
    pub new_table: Option<String>,
}

pub fn run_register(args: RegisterArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let store = Store::open(&args.zarr)?;
    let well = WellId::parse_path(&args.well)?;
    let written = registration::register_well(
        &store,
        &well,
        &args.table,
        args.reference.as_deref(),
        args.new_table.as_deref(),
    )?;
    progress(1.0, &format!("Registered {} across {} images", args.table, written.len()));
    Ok(())
}
