//! Field-of-view layout: from raw stage positions to non-overlapping placements.
//!
//! FOVs are tiled in the (y, x) plane; every FOV spans the full Z range of the
//! image. Positions are first shifted so the smallest origin is zero, then
//! pairwise overlaps above the tolerance are removed in index order.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LayoutError;

/// Physical size of one level-0 pixel, in micrometers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelSize {
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_pixel_z")]
    pub z: f64,
}

fn default_pixel_z() -> f64 {
    1.0
}

impl PixelSize {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.z].iter().all(|v| v.is_finite() && *v > 0.0)
    }
}

/// One tile as reported by the instrument, in level-0 pixel units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFov {
    pub field: u32,
    pub x: i64,
    pub y: i64,
    #[serde(default)]
    pub z: i64,
    pub width: u64,
    pub height: u64,
    #[serde(default = "default_depth")]
    pub depth: u64,
}

fn default_depth() -> u64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapMode {
    /// Trim the later FOV along the axis with the smaller overlap.
    #[default]
    Fixed,
    /// Trim whichever FOV of the pair, along either axis, loses only pixels
    /// that another FOV still covers. Nothing is moved.
    Flexible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverlapConfig {
    #[serde(default)]
    pub tolerance_px: u64,
    #[serde(default)]
    pub mode: OverlapMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    fn other(self) -> Self {
        match self {
            Axis::X => Axis::Y,
            Axis::Y => Axis::X,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => f.write_str("x"),
            Axis::Y => f.write_str("y"),
        }
    }
}

/// Final position of one FOV inside the level-0 array, in pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub field: u32,
    pub x: u64,
    pub y: u64,
    pub z: u64,
    pub width: u64,
    pub height: u64,
    pub depth: u64,
    /// Pixels dropped from the start of the source tile by trimming.
    pub source_x: u64,
    pub source_y: u64,
    /// Untrimmed tile size.
    pub nominal_width: u64,
    pub nominal_height: u64,
    /// Instrument position before origin reset and overlap removal.
    pub original_x: i64,
    pub original_y: i64,
    pub original_z: i64,
}

/// Bounding box in micrometers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalBox {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub len_x: f64,
    pub len_y: f64,
    pub len_z: f64,
}

impl Placement {
    pub fn physical(&self, pixel_size: &PixelSize) -> PhysicalBox {
        PhysicalBox {
            x: self.x as f64 * pixel_size.x,
            y: self.y as f64 * pixel_size.y,
            z: self.z as f64 * pixel_size.z,
            len_x: self.width as f64 * pixel_size.x,
            len_y: self.height as f64 * pixel_size.y,
            len_z: self.depth as f64 * pixel_size.z,
        }
    }

    pub fn x_end(&self) -> u64 {
        self.x + self.width
    }

    pub fn y_end(&self) -> u64 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub placements: Vec<Placement>,
    pub pixel_size: PixelSize,
}

impl Layout {
    /// Level-0 extent covered by all placements, as (z, y, x).
    pub fn footprint(&self) -> [u64; 3] {
        self.placements.iter().fold([0, 0, 0], |acc, p| {
            [
                acc[0].max(p.z + p.depth),
                acc[1].max(p.y_end()),
                acc[2].max(p.x_end()),
            ]
        })
    }

    /// Largest pairwise overlap, measured along the axis where it is smaller.
    pub fn max_overlap(&self) -> u64 {
        let mut worst = 0;
        for (i, a) in self.placements.iter().enumerate() {
            for b in &self.placements[i + 1..] {
                let ox = overlap(span(a.x, a.width), span(b.x, b.width));
                let oy = overlap(span(a.y, a.height), span(b.y, b.height));
                if ox > 0 && oy > 0 {
                    worst = worst.max(ox.min(oy) as u64);
                }
            }
        }
        worst
    }

    pub fn get(&self, field: u32) -> Option<&Placement> {
        self.placements.iter().find(|p| p.field == field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: i64,
    end: i64,
}

impl Span {
    fn len(&self) -> i64 {
        self.end - self.start
    }
}

fn span(start: u64, len: u64) -> Span {
    Span {
        start: start as i64,
        end: (start + len) as i64,
    }
}

fn overlap(a: Span, b: Span) -> i64 {
    a.end.min(b.end) - a.start.max(b.start)
}

#[derive(Debug, Clone)]
struct Tile {
    fov: RawFov,
    x: Span,
    y: Span,
    z: i64,
    source_x: i64,
    source_y: i64,
}

impl Tile {
    fn span(&self, axis: Axis) -> Span {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
        }
    }

    fn span_mut(&mut self, axis: Axis) -> &mut Span {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
        }
    }

    fn source_mut(&mut self, axis: Axis) -> &mut i64 {
        match axis {
            Axis::X => &mut self.source_x,
            Axis::Y => &mut self.source_y,
        }
    }

    fn rect(&self) -> Rect {
        Rect { x: self.x, y: self.y }
    }

    /// Span left after trimming clear of `bound`, and the strip removed.
    fn trim_plan(&self, bound: Span, axis: Axis) -> (Span, Rect) {
        let current = self.span(axis);
        let (kept, removed) = if current.start >= bound.start {
            (
                Span {
                    start: bound.end,
                    end: current.end,
                },
                Span {
                    start: current.start,
                    end: bound.end.min(current.end),
                },
            )
        } else {
            (
                Span {
                    start: current.start,
                    end: bound.start,
                },
                Span {
                    start: bound.start,
                    end: current.end,
                },
            )
        };
        let strip = match axis {
            Axis::X => Rect { x: removed, y: self.y },
            Axis::Y => Rect { x: self.x, y: removed },
        };
        (kept, strip)
    }

    fn apply_trim(&mut self, axis: Axis, kept: Span) {
        let cut = kept.start - self.span(axis).start;
        *self.source_mut(axis) += cut;
        *self.span_mut(axis) = kept;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: Span,
    y: Span,
}

/// Pieces of `r` outside `o`.
fn subtract(r: Rect, o: Rect) -> Vec<Rect> {
    if overlap(r.x, o.x) <= 0 || overlap(r.y, o.y) <= 0 {
        return vec![r];
    }
    let mut out = Vec::with_capacity(4);
    if r.x.start < o.x.start {
        out.push(Rect {
            x: Span {
                start: r.x.start,
                end: o.x.start,
            },
            y: r.y,
        });
    }
    if o.x.end < r.x.end {
        out.push(Rect {
            x: Span {
                start: o.x.end,
                end: r.x.end,
            },
            y: r.y,
        });
    }
    let mid = Span {
        start: r.x.start.max(o.x.start),
        end: r.x.end.min(o.x.end),
    };
    if r.y.start < o.y.start {
        out.push(Rect {
            x: mid,
            y: Span {
                start: r.y.start,
                end: o.y.start,
            },
        });
    }
    if o.y.end < r.y.end {
        out.push(Rect {
            x: mid,
            y: Span {
                start: o.y.end,
                end: r.y.end,
            },
        });
    }
    out
}

/// Whether the union of `others` contains all of `rect`.
fn covered(rect: Rect, others: impl Iterator<Item = Rect>) -> bool {
    let mut pending = vec![rect];
    for o in others {
        pending = pending.into_iter().flat_map(|r| subtract(r, o)).collect();
        if pending.is_empty() {
            return true;
        }
    }
    pending.is_empty()
}

/// Overlap between two tiles that exceeds the tolerance, as (axis, amount).
fn excess_overlap(later: &Tile, earlier: &Tile, tolerance: i64) -> Option<(Axis, i64)> {
    let ox = overlap(later.x, earlier.x);
    let oy = overlap(later.y, earlier.y);
    if ox <= 0 || oy <= 0 {
        return None;
    }
    let (axis, amount) = if ox <= oy { (Axis::X, ox) } else { (Axis::Y, oy) };
    (amount > tolerance).then_some((axis, amount))
}

/// Compute non-overlapping placements for the FOVs of one image.
pub fn resolve_layout(
    fovs: &[RawFov],
    pixel_size: PixelSize,
    config: &OverlapConfig,
) -> Result<Layout, LayoutError> {
    if fovs.is_empty() {
        return Err(LayoutError::Empty);
    }
    let mut seen = HashSet::new();
    for fov in fovs {
        if !seen.insert(fov.field) {
            return Err(LayoutError::DuplicateField(fov.field));
        }
        if fov.width == 0 || fov.height == 0 || fov.depth == 0 {
            return Err(LayoutError::ZeroExtent(fov.field));
        }
    }

    let mut tiles: Vec<Tile> = fovs
        .iter()
        .map(|fov| Tile {
            fov: fov.clone(),
            x: Span {
                start: fov.x,
                end: fov.x + fov.width as i64,
            },
            y: Span {
                start: fov.y,
                end: fov.y + fov.height as i64,
            },
            z: fov.z,
            source_x: 0,
            source_y: 0,
        })
        .collect();

    reset_origin(&mut tiles);
    let tolerance = config.tolerance_px as i64;
    match config.mode {
        OverlapMode::Fixed => trim_overlaps(&mut tiles, tolerance)?,
        OverlapMode::Flexible => trim_overlaps_covered(&mut tiles, tolerance)?,
    }

    let placements = tiles
        .into_iter()
        .map(|t| Placement {
            field: t.fov.field,
            x: t.x.start as u64,
            y: t.y.start as u64,
            z: t.z as u64,
            width: t.x.len() as u64,
            height: t.y.len() as u64,
            depth: t.fov.depth,
            source_x: t.source_x as u64,
            source_y: t.source_y as u64,
            nominal_width: t.fov.width,
            nominal_height: t.fov.height,
            original_x: t.fov.x,
            original_y: t.fov.y,
            original_z: t.fov.z,
        })
        .collect();
    Ok(Layout {
        placements,
        pixel_size,
    })
}

fn reset_origin(tiles: &mut [Tile]) {
    let min_x = tiles.iter().map(|t| t.x.start).min().unwrap_or(0);
    let min_y = tiles.iter().map(|t| t.y.start).min().unwrap_or(0);
    let min_z = tiles.iter().map(|t| t.z).min().unwrap_or(0);
    for t in tiles.iter_mut() {
        t.x.start -= min_x;
        t.x.end -= min_x;
        t.y.start -= min_y;
        t.y.end -= min_y;
        t.z -= min_z;
    }
}

fn trim_later(tiles: &mut [Tile], later: usize, earlier: usize, axis: Axis) -> Result<(), LayoutError> {
    let (kept, _) = tiles[later].trim_plan(tiles[earlier].span(axis), axis);
    if kept.len() <= 0 {
        return Err(LayoutError::CollapsedFov {
            field: tiles[later].fov.field,
            against: tiles[earlier].fov.field,
            axis,
            extent: kept.len(),
        });
    }
    tiles[later].apply_trim(axis, kept);
    Ok(())
}

fn trim_overlaps(tiles: &mut [Tile], tolerance: i64) -> Result<(), LayoutError> {
    for i in 1..tiles.len() {
        for j in 0..i {
            let Some((axis, amount)) = excess_overlap(&tiles[i], &tiles[j], tolerance) else {
                continue;
            };
            trim_later(tiles, i, j, axis)?;
            debug!(
                "trimmed field {} by {amount} px along {axis} against field {}",
                tiles[i].fov.field, tiles[j].fov.field
            );
        }
    }
    Ok(())
}

/// Like `trim_overlaps`, but each overlap is removed from the FOV and axis
/// whose cut strip stays covered by the other FOVs, so the union of the
/// placements equals the union of the raw tiles.
fn trim_overlaps_covered(tiles: &mut [Tile], tolerance: i64) -> Result<(), LayoutError> {
    for i in 1..tiles.len() {
        for j in 0..i {
            let Some((axis, _)) = excess_overlap(&tiles[i], &tiles[j], tolerance) else {
                continue;
            };
            let candidates = [(i, j, axis), (j, i, axis), (i, j, axis.other()), (j, i, axis.other())];
            let choice = candidates.into_iter().find_map(|(t, u, ax)| {
                let (kept, strip) = tiles[t].trim_plan(tiles[u].span(ax), ax);
                let others = tiles.iter().enumerate().filter(|(k, _)| *k != t).map(|(_, o)| o.rect());
                (kept.len() > 0 && covered(strip, others)).then_some((t, u, ax, kept))
            });
            match choice {
                Some((t, u, ax, kept)) => {
                    debug!(
                        "trimmed field {} along {ax} against field {}",
                        tiles[t].fov.field, tiles[u].fov.field
                    );
                    tiles[t].apply_trim(ax, kept);
                }
                None => {
                    warn!(
                        "no trim keeps fields {} and {} covered, trimming field {} along {axis}",
                        tiles[j].fov.field, tiles[i].fov.field, tiles[i].fov.field
                    );
                    trim_later(tiles, i, j, axis)?;
                }
            }
        }
    }
    Ok(())
}
