use std::fs;
use std::io::BufWriter;
use std::path::Path;

use hcs_zarr::channels::{ChannelSpec, WellChannels};
use hcs_zarr::config::ConvertConfig;
use hcs_zarr::convert::convert_plate;
use hcs_zarr::error::Error;
use hcs_zarr::filename::FilenameParser;
use hcs_zarr::labels;
use hcs_zarr::registration::{self, add_translation_columns};
use hcs_zarr::replicate::{replicate_structure, ReplicateOptions};
use hcs_zarr::structure::Structure;
use hcs_zarr::tables::{self, Value, FOV_ROI_TABLE, WELL_ROI_TABLE};
use hcs_zarr::wells::WellId;
use hcs_zarr::zarr::{self, Store};
use ndarray::Array3;
use tempfile::TempDir;
use tiff::encoder::{colortype::Gray16, TiffEncoder};

const PREFIX: &str = "210305NAR005AAN_210416_164828";

fn write_plane(path: &Path, width: u32, height: u32, value: impl Fn(u32, u32) -> u16) {
    let data: Vec<u16> = (0..height).flat_map(|y| (0..width).map(move |x| (y, x))).map(|(y, x)| value(y, x)).collect();
    let mut writer = BufWriter::new(fs::File::create(path).unwrap());
    let mut encoder = TiffEncoder::new(&mut writer).unwrap();
    encoder.write_image::<Gray16>(width, height, &data).unwrap();
}

fn plane_name(well: &str, time: u32, field: u32, z: u32, channel: u32) -> String {
    format!("{PREFIX}_{well}_T{time:04}F{field:03}L01A01Z{z:02}C{channel:02}.tif")
}

/// Constant planes: acquisition * 1000 + field * 100 + channel * 10 + z.
fn plane_value(acquisition: u16, field: u32, channel: u32, z: u32) -> u16 {
    acquisition * 1000 + (field * 100 + channel * 10 + z) as u16
}

const CONFIG: &str = r#"
    [pixel_size]
    x = 0.5
    y = 0.5
    z = 2.0

    [pyramid]
    num_levels = 2

    [fovs]
    mode = "grid"
    columns = 2

    [[acquisitions]]
    id = "0"
    path = "cycle0"
    channels = [
        { wavelength_id = "A01_C01", label = "DAPI" },
        { wavelength_id = "A01_C02", label = "GFP" },
    ]

    [[acquisitions]]
    id = "1"
    path = "cycle1"
    channels = [
        { wavelength_id = "A01_C01", label = "DAPI" },
        { wavelength_id = "A01_C03", label = "RFP" },
    ]
"#;

/// Two cycles: cycle 0 images B03 (two fields) and C05 (one field) in 3D,
/// cycle 1 images B03 (two fields) in 2D.
fn write_plate_sources(root: &Path) {
    let cycle0 = root.join("cycle0");
    let cycle1 = root.join("cycle1");
    fs::create_dir_all(&cycle0).unwrap();
    fs::create_dir_all(&cycle1).unwrap();

    for (well, fields) in [("B03", 2), ("C05", 1)] {
        for field in 1..=fields {
            for z in 1..=2 {
                for channel in [1, 2] {
                    write_plane(&cycle0.join(plane_name(well, 1, field, z, channel)), 8, 8, |_, _| {
                        plane_value(0, field, channel, z)
                    });
                }
            }
        }
    }
    for field in 1..=2 {
        for channel in [1, 3] {
            write_plane(&cycle1.join(plane_name("B03", 1, field, 1, channel)), 8, 8, |_, _| {
                plane_value(1, field, channel, 1)
            });
        }
    }
    // later time point and an unparsable file
    write_plane(&cycle1.join(plane_name("B03", 2, 1, 1, 1)), 8, 8, |_, _| 9999);
    write_plane(&cycle0.join("IMG_badformat.tif"), 8, 8, |_, _| 9999);
}

fn convert(root: &Path) -> (Store, Structure) {
    let config_path = root.join("plate.toml");
    fs::write(&config_path, CONFIG).unwrap();
    let config = ConvertConfig::from_file(&config_path).unwrap();
    let output = root.join("plate.zarr");
    let structure = convert_plate(&config, &output, |_, _| {}).unwrap();
    (Store::open(&output).unwrap(), structure)
}

fn read_all(store: &Store, path: &str) -> ndarray::ArrayD<u16> {
    let array = zarr::open_array(store, path).unwrap();
    let shape = array.shape().to_vec();
    zarr::read_region::<u16>(&array, &vec![0; shape.len()], &shape).unwrap()
}

#[test]
fn converts_a_multiplexed_plate() {
    let dir = TempDir::new().unwrap();
    write_plate_sources(dir.path());
    let (store, structure) = convert(dir.path());

    assert_eq!(structure.plate_name, "210305NAR005AAN");
    let paths: Vec<String> = structure.images.iter().map(|i| i.path()).collect();
    assert_eq!(paths, vec!["B/03/0", "B/03/1", "C/05/0"]);
    assert_eq!(structure.images[0].labels(), vec!["DAPI_0", "GFP"]);
    assert_eq!(structure.images[1].labels(), vec!["DAPI_1", "RFP"]);
    assert_eq!(Structure::open(&store).unwrap(), structure);

    let level0 = read_all(&store, "B/03/0/0");
    assert_eq!(level0.shape(), &[2, 2, 8, 16]);
    assert_eq!(level0[[0, 0, 3, 3]], plane_value(0, 1, 1, 1));
    assert_eq!(level0[[1, 1, 3, 12]], plane_value(0, 2, 2, 2));

    let level1 = read_all(&store, "B/03/0/1");
    assert_eq!(level1.shape(), &[2, 2, 4, 8]);
    assert_eq!(level1[[1, 1, 0, 5]], plane_value(0, 2, 2, 2));

    // the second time point is not converted
    let cycle1 = read_all(&store, "B/03/1/0");
    assert_eq!(cycle1.shape(), &[2, 1, 8, 16]);
    assert!(cycle1.iter().all(|v| *v != 9999));

    assert_eq!(read_all(&store, "C/05/0/0").shape(), &[2, 2, 8, 8]);

    let fov = tables::read_table(&store, "B/03/0", FOV_ROI_TABLE).unwrap();
    assert_eq!(fov.rows.len(), 2);
    assert_eq!(fov.get("FOV_2", "x_micrometer"), Some(Value::Float(4.0)));
    assert_eq!(fov.get("FOV_2", "len_z_micrometer"), Some(Value::Float(4.0)));
    let well = tables::read_table(&store, "B/03/0", WELL_ROI_TABLE).unwrap();
    assert_eq!(well.get("well_1", "len_x_micrometer"), Some(Value::Float(8.0)));
}

#[test]
fn unparsable_files_are_skipped() {
    let parser = FilenameParser::new().unwrap().with_extension("tif");
    let valid = plane_name("B03", 1, 1, 1, 1);
    let names = ["IMG_badformat.tif", valid.as_str()];
    let batch = parser.parse_batch(names.iter().copied(), None);
    assert_eq!(batch.files.len(), 1);
    assert_eq!(batch.skipped.len(), 1);
    assert_eq!(batch.skipped[0].filename, "IMG_badformat.tif");
}

#[test]
fn channels_resolve_back_to_their_pixels() {
    let dir = TempDir::new().unwrap();
    write_plate_sources(dir.path());
    let (store, _) = convert(dir.path());
    let well = WellChannels::load(&store, &WellId::parse("B03").unwrap()).unwrap();

    let dapi = well.resolve(&"DAPI".parse::<ChannelSpec>().unwrap(), Some("1")).unwrap();
    assert_eq!(dapi.image_path, "B/03/1");
    assert_eq!(dapi.array_path, "B/03/1/0");
    assert_eq!(dapi.channel.label, "DAPI_1");
    let pixels = read_all(&store, &dapi.array_path);
    assert_eq!(pixels[[dapi.channel_index, 0, 0, 0]], plane_value(1, 1, 1, 1));

    let rfp = well.resolve(&"RFP".parse::<ChannelSpec>().unwrap(), None).unwrap();
    assert_eq!(rfp.image_path, "B/03/1");
    assert_eq!(pixels[[rfp.channel_index, 0, 0, 9]], plane_value(1, 2, 3, 1));

    let gfp = well.resolve(&ChannelSpec::WavelengthId("A01_C02".into()), None).unwrap();
    assert_eq!((gfp.image_path.as_str(), gfp.channel_index), ("B/03/0", 1));

    let missing = well.resolve(&ChannelSpec::Label("GFP".into()), Some("1")).unwrap_err();
    assert_eq!(missing.acquisition.as_deref(), Some("1"));
}

#[test]
fn reconversion_overwrites_the_plate() {
    let dir = TempDir::new().unwrap();
    write_plate_sources(dir.path());
    let (store, first) = convert(dir.path());
    let image = &first.images[0];
    let labels = Array3::<u32>::from_elem((2, 8, 16), 1);
    labels::write_label_image(&store, &first, image, "nuclei", labels.view().into_dyn(), None).unwrap();

    let (store, second) = convert(dir.path());
    assert_eq!(first, second);
    assert!(labels::list_labels(&store, &second.images[0]).unwrap().is_empty());
}

#[test]
fn labels_and_their_boxes_attach_to_an_image() {
    let dir = TempDir::new().unwrap();
    write_plate_sources(dir.path());
    let (store, structure) = convert(dir.path());
    let image = &structure.images[0];

    let mut labels = Array3::<u32>::zeros((2, 8, 16));
    labels[[0, 1, 1]] = 5;
    labels[[1, 6, 14]] = 5;
    labels[[0, 4, 4]] = 2;
    labels::write_label_image(&store, &structure, image, "nuclei", labels.view().into_dyn(), Some("cellpose")).unwrap();
    let table = labels::build_label_bbox_table(
        labels.view(),
        &structure.pixel_size,
        &image.path(),
        &image.well.path(),
        "nuclei",
    );
    tables::write_table(&store, &image.path(), &table).unwrap();

    let back = tables::read_table(&store, "B/03/0", "nuclei_ROI_table").unwrap();
    let keys: Vec<&str> = back.rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["2", "5"]);
    assert_eq!(back.get("5", "x_min"), Some(Value::Int(1)));
    assert_eq!(back.get("5", "x_max"), Some(Value::Int(14)));
    assert_eq!(back.get("5", "len_z_micrometer"), Some(Value::Float(4.0)));
    assert_eq!(labels::list_labels(&store, image).unwrap(), vec!["nuclei"]);

    let wrong = Array3::<u32>::zeros((1, 8, 16));
    let err = labels::write_label_image(&store, &structure, image, "cells", wrong.view().into_dyn(), None).unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
}

#[test]
fn replicated_plates_are_projected_to_2d() {
    let dir = TempDir::new().unwrap();
    write_plate_sources(dir.path());
    let (store, _) = convert(dir.path());
    let mip = Store::open(&dir.path().join("mip.zarr")).unwrap();

    let options = ReplicateOptions {
        project_to_2d: true,
        suffix: Some("mip".into()),
        ..ReplicateOptions::default()
    };
    let replica = replicate_structure(&store, &mip, &options).unwrap();
    assert_eq!(replica.plate_name, "210305NAR005AAN_mip");
    assert_eq!(zarr::open_array(&mip, "B/03/0/0").unwrap().shape(), &[2, 1, 8, 16]);
    assert_eq!(zarr::open_array(&mip, "C/05/0/1").unwrap().shape(), &[2, 1, 4, 4]);

    let fov = tables::read_table(&mip, "B/03/0", FOV_ROI_TABLE).unwrap();
    assert_eq!(fov.get("FOV_1", "len_z_micrometer"), Some(Value::Float(2.0)));
    assert_eq!(fov.get("FOV_1", "z_micrometer"), Some(Value::Float(0.0)));
}

const ROI_HEADER: &str = "FieldIndex,x_micrometer,y_micrometer,z_micrometer,len_x_micrometer,len_y_micrometer,\
len_z_micrometer,x_micrometer_original,y_micrometer_original";

fn convert_with_rois(root: &Path, b03_rois: &str) -> hcs_zarr::Result<Structure> {
    fs::create_dir_all(root.join("rois")).unwrap();
    fs::write(root.join("rois/B03.csv"), b03_rois).unwrap();
    let config = CONFIG.replacen("path = \"cycle1\"", "path = \"cycle1\"\n    roi_table = \"rois/{well}.csv\"", 1);
    let config_path = root.join("plate.toml");
    fs::write(&config_path, config).unwrap();
    let config = ConvertConfig::from_file(&config_path).unwrap();
    convert_plate(&config, &root.join("plate.zarr"), |_, _| {})
}

#[test]
fn supplied_roi_tables_replace_the_derived_ones() {
    let dir = TempDir::new().unwrap();
    write_plate_sources(dir.path());
    let rois = format!("{ROI_HEADER}\nFOV_1,0,0,0,4,4,2,10.5,20\nFOV_2,4,0,0,4,4,2,14.5,20\n");
    convert_with_rois(dir.path(), &rois).unwrap();

    let store = Store::open(&dir.path().join("plate.zarr")).unwrap();
    let supplied = tables::read_table(&store, "B/03/1", FOV_ROI_TABLE).unwrap();
    assert_eq!(supplied.get("FOV_2", "x_micrometer_original"), Some(Value::Float(14.5)));
    // acquisition 0 has no table configured and keeps the derived one
    let derived = tables::read_table(&store, "B/03/0", FOV_ROI_TABLE).unwrap();
    assert_eq!(derived.get("FOV_2", "x_micrometer"), Some(Value::Float(4.0)));
}

#[test]
fn mismatched_roi_tables_abort_before_writing_pixels() {
    let dir = TempDir::new().unwrap();
    write_plate_sources(dir.path());
    let rois = "FieldIndex,x_micrometer,y_micrometer\nFOV_1,0,0\n";
    let err = convert_with_rois(dir.path(), rois).unwrap_err();
    match err {
        Error::SchemaMismatch(mismatch) => {
            assert!(mismatch.missing.contains(&"len_x_micrometer".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dir.path().join("plate.zarr").join("B").exists());
}

#[test]
fn cycles_of_a_well_register_to_their_shared_region() {
    let dir = TempDir::new().unwrap();
    write_plate_sources(dir.path());
    let (store, _) = convert(dir.path());

    let cycle1 = tables::read_table(&store, "B/03/1", FOV_ROI_TABLE).unwrap();
    let shifts = add_translation_columns("1", &cycle1, |key| if key == "FOV_1" { [0.0, 0.0, -1.0] } else { [0.0; 3] })
        .unwrap();
    tables::write_table(&store, "B/03/1", &shifts).unwrap();

    let well = WellId::parse("B03").unwrap();
    let written = registration::register_well(&store, &well, FOV_ROI_TABLE, None, None).unwrap();
    assert_eq!(written, vec!["B/03/0", "B/03/1"]);

    let reference = tables::read_table(&store, "B/03/0", "registered_FOV_ROI_table").unwrap();
    assert_eq!(reference.get("FOV_1", "x_micrometer"), Some(Value::Float(0.0)));
    assert_eq!(reference.get("FOV_1", "len_x_micrometer"), Some(Value::Float(3.0)));
    assert_eq!(reference.get("FOV_2", "len_x_micrometer"), Some(Value::Float(4.0)));
    let moved = tables::read_table(&store, "B/03/1", "registered_FOV_ROI_table").unwrap();
    assert_eq!(moved.get("FOV_1", "x_micrometer"), Some(Value::Float(1.0)));

    // C05 has a single cycle, so every ROI keeps its extent
    let single = registration::register_well(&store, &WellId::parse("C05").unwrap(), FOV_ROI_TABLE, None, None);
    assert_eq!(single.unwrap(), vec!["C/05/0"]);
}
