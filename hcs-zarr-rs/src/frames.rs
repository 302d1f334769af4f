use std::fs;
use std::io::BufReader;
use std::path::Path;

use ndarray::{Array2, Array3, Axis};
use tiff::decoder::{Decoder, DecodingResult};

use crate::error::{Error, Result};

fn open(path: &Path) -> Result<Decoder<BufReader<fs::File>>> {
    let file = fs::File::open(path)?;
    Ok(Decoder::new(BufReader::new(file))?)
}

/// (width, height) of the first page, without decoding pixels.
pub fn tiff_dimensions(path: &Path) -> Result<(u32, u32)> {
    Ok(open(path)?.dimensions()?)
}

/// Read the first page as a (y, x) `u16` plane. 8-bit images are widened.
pub fn read_frame_u16(path: &Path) -> Result<Array2<u16>> {
    let mut decoder = open(path)?;
    let (width, height) = decoder.dimensions()?;
    let data = match decoder.read_image()? {
        DecodingResult::U8(v) => v.into_iter().map(u16::from).collect(),
        DecodingResult::U16(v) => v,
        _ => return Err(pixel_format(path, "u8 or u16")),
    };
    Array2::from_shape_vec((height as usize, width as usize), data).map_err(|_| pixel_format(path, "one sample per pixel"))
}

/// Read every page as one z plane of a (z, y, x) label stack.
pub fn read_label_stack(path: &Path) -> Result<Array3<u32>> {
    let mut decoder = open(path)?;
    let mut planes: Vec<Array2<u32>> = Vec::new();
    loop {
        let (width, height) = decoder.dimensions()?;
        let data: Vec<u32> = match decoder.read_image()? {
            DecodingResult::U8(v) => v.into_iter().map(u32::from).collect(),
            DecodingResult::U16(v) => v.into_iter().map(u32::from).collect(),
            DecodingResult::U32(v) => v,
            _ => return Err(pixel_format(path, "u8, u16 or u32")),
        };
        let plane = Array2::from_shape_vec((height as usize, width as usize), data)
            .map_err(|_| pixel_format(path, "one sample per pixel"))?;
        if planes.first().is_some_and(|p| p.dim() != plane.dim()) {
            return Err(pixel_format(path, "pages of equal size"));
        }
        planes.push(plane);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }
    let views: Vec<_> = planes.iter().map(|p| p.view().insert_axis(Axis(0))).collect();
    ndarray::concatenate(Axis(0), &views).map_err(|_| pixel_format(path, "pages of equal size"))
}

fn pixel_format(path: &Path, expected: &'static str) -> Error {
    Error::PixelFormat {
        path: path.display().to_string(),
        expected,
    }
}
