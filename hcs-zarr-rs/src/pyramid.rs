//! Multiresolution levels.
//!
//! Level k is derived from level k-1 by coarsening y and x by
//! `coarsening_xy` and z by `coarsening_z`; sizes round up, so edge blocks
//! may be partial.

use ndarray::{ArrayD, ArrayViewD, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::zarr::{self, Pixel, StoreArray};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidSpec {
    #[serde(default = "default_num_levels")]
    pub num_levels: u32,
    #[serde(default = "default_coarsening_xy")]
    pub coarsening_xy: u64,
    #[serde(default = "default_coarsening_z")]
    pub coarsening_z: u64,
}

fn default_num_levels() -> u32 {
    5
}

fn default_coarsening_xy() -> u64 {
    2
}

fn default_coarsening_z() -> u64 {
    1
}

impl Default for PyramidSpec {
    fn default() -> Self {
        Self {
            num_levels: default_num_levels(),
            coarsening_xy: default_coarsening_xy(),
            coarsening_z: default_coarsening_z(),
        }
    }
}

impl PyramidSpec {
    pub fn validate(&self) -> std::result::Result<(), SchemaError> {
        if self.num_levels == 0 {
            return Err(SchemaError::InvalidPyramid("num_levels must be at least 1".into()));
        }
        if self.coarsening_xy == 0 || self.coarsening_z == 0 {
            return Err(SchemaError::InvalidPyramid("coarsening factors must be positive".into()));
        }
        if self.num_levels > 1 && self.coarsening_xy == 1 && self.coarsening_z == 1 {
            return Err(SchemaError::InvalidPyramid(
                "levels beyond 0 need a coarsening factor above 1".into(),
            ));
        }
        let top = self.num_levels - 1;
        if self.coarsening_xy.checked_pow(top).is_none() || self.coarsening_z.checked_pow(top).is_none() {
            return Err(SchemaError::InvalidPyramid(format!(
                "{} levels overflow the coarsening factor",
                self.num_levels
            )));
        }
        Ok(())
    }

    /// (z, y, x) factor between level 0 and `level`.
    pub fn factors(&self, level: u32) -> [u64; 3] {
        [
            self.coarsening_z.pow(level),
            self.coarsening_xy.pow(level),
            self.coarsening_xy.pow(level),
        ]
    }

    /// (z, y, x) shape of `level` given the level-0 shape.
    pub fn level_shape(&self, level0: [u64; 3], level: u32) -> [u64; 3] {
        let f = self.factors(level);
        [
            level0[0].div_ceil(f[0]),
            level0[1].div_ceil(f[1]),
            level0[2].div_ceil(f[2]),
        ]
    }

    /// Per-level (z, y, x) scale in micrometers.
    pub fn level_scales(&self, pixel_zyx: [f64; 3]) -> Vec<[f64; 3]> {
        (0..self.num_levels)
            .map(|level| {
                let f = self.factors(level);
                [
                    pixel_zyx[0] * f[0] as f64,
                    pixel_zyx[1] * f[1] as f64,
                    pixel_zyx[2] * f[2] as f64,
                ]
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downsample {
    /// Mean over the block, rounded half up. Intensity images.
    Mean,
    /// First element of the block. Label images, so ids are never mixed.
    Nearest,
}

/// Coarsen `input` by the per-axis `factors`. Output extent is
/// `ceil(input / factor)` along every axis.
pub fn coarsen<T: Pixel>(input: ArrayViewD<'_, T>, factors: &[usize], mode: Downsample) -> ArrayD<T> {
    let out_dims: Vec<usize> = input
        .shape()
        .iter()
        .zip(factors)
        .map(|(n, f)| n.div_ceil(*f))
        .collect();
    ArrayD::from_shape_fn(IxDyn(&out_dims), |idx| match mode {
        Downsample::Nearest => {
            let src: Vec<usize> = (0..input.ndim()).map(|d| idx[d] * factors[d]).collect();
            input[IxDyn(&src)]
        }
        Downsample::Mean => {
            let block = input.slice_each_axis(|ax| {
                let d = ax.axis.index();
                let start = idx[d] * factors[d];
                Slice::from(start..(start + factors[d]).min(ax.len))
            });
            let n = block.len() as u64;
            let sum: u64 = block.iter().map(|v| v.to_u64()).sum();
            T::from_u64((2 * sum + n) / (2 * n))
        }
    })
}

/// Rebuild `dst` from `src`, one band of output chunk rows at a time.
///
/// Both arrays share their leading axes; the last three are (z, y, x) and
/// are coarsened by `factors_zyx`.
pub fn derive_level<T: Pixel>(
    src: &StoreArray,
    dst: &StoreArray,
    factors_zyx: [u64; 3],
    mode: Downsample,
) -> Result<()> {
    let src_shape = src.shape().to_vec();
    let dst_shape = dst.shape().to_vec();
    let ndim = dst_shape.len();
    let y_axis = ndim - 2;
    let band = zarr::chunk_shape(dst)?[y_axis];

    let mut factors = vec![1usize; ndim];
    factors[ndim - 3] = factors_zyx[0] as usize;
    factors[ndim - 2] = factors_zyx[1] as usize;
    factors[ndim - 1] = factors_zyx[2] as usize;

    let mut y0 = 0;
    while y0 < dst_shape[y_axis] {
        let y1 = (y0 + band).min(dst_shape[y_axis]);
        let sy0 = y0 * factors_zyx[1];
        let sy1 = (y1 * factors_zyx[1]).min(src_shape[y_axis]);

        let mut start = vec![0u64; ndim];
        let mut extent = src_shape.clone();
        start[y_axis] = sy0;
        extent[y_axis] = sy1 - sy0;
        let block = zarr::read_region::<T>(src, &start, &extent)?;
        let coarse = coarsen(block.view(), &factors, mode);

        let mut out_start = vec![0u64; ndim];
        out_start[y_axis] = y0;
        zarr::write_region(dst, &out_start, coarse.view())?;
        y0 = y1;
    }
    debug!("derived {} from {}", dst.path().as_str(), src.path().as_str());
    Ok(())
}
