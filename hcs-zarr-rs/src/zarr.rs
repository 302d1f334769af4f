use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, IxDyn, Slice};
use zarrs::array::{data_type, Array, ArrayBuilder};
use zarrs::config::MetadataRetrieveVersion;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::ReadableWritableListableStorageTraits;

use crate::error::{Error, Result};

/// Type alias for arrays in the store.
pub type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// A Zarr v3 hierarchy on the local filesystem.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    inner: Arc<FilesystemStore>,
}

impl Store {
    /// Open a store, creating the root directory if needed.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let store = FilesystemStore::new(root).map_err(Error::storage)?;
        Ok(Self {
            root: root.to_path_buf(),
            inner: Arc::new(store),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn storage(&self) -> Arc<dyn ReadableWritableListableStorageTraits> {
        self.inner.clone()
    }

    /// Whether a group or array exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.node_dir(path).join("zarr.json").is_file()
    }

    /// Delete a node and everything below it, so a rewrite starts clean.
    pub fn remove_node(&self, path: &str) -> Result<()> {
        let dir = self.node_dir(path);
        if dir != self.root && dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn node_dir(&self, path: &str) -> PathBuf {
        let rel = path.trim_matches('/');
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

/// Absolute node path as zarrs expects it (`B/03/0` -> `/B/03/0`).
pub fn node_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

pub fn create_group(store: &Store, path: &str, attrs: Option<Attributes>) -> Result<()> {
    let mut builder = GroupBuilder::new();
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let group = builder
        .build(store.storage(), &node_path(path))
        .map_err(Error::storage)?;
    group.store_metadata().map_err(Error::storage)?;
    Ok(())
}

pub fn group_attributes(store: &Store, path: &str) -> Result<Attributes> {
    let group = Group::open(store.storage(), &node_path(path)).map_err(Error::storage)?;
    Ok(group.attributes().clone())
}

/// Open a Zarr v3 array. Rejects v2 data.
pub fn open_array(store: &Store, path: &str) -> Result<StoreArray> {
    Array::open_opt(store.storage(), &node_path(path), &MetadataRetrieveVersion::V3)
        .map_err(Error::storage)
}

/// Regular chunk shape of an array.
pub fn chunk_shape(array: &StoreArray) -> Result<Vec<u64>> {
    let origin = vec![0u64; array.shape().len()];
    let shape = array.chunk_shape_usize(&origin).map_err(Error::storage)?;
    Ok(shape.into_iter().map(|d| d as u64).collect())
}

pub fn create_array_u16(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Option<Attributes>,
) -> Result<StoreArray> {
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::uint16(), 0u16);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder
        .build(store.storage(), &node_path(path))
        .map_err(Error::storage)?;
    array.store_metadata().map_err(Error::storage)?;
    Ok(array)
}

pub fn create_array_u32(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Option<Attributes>,
) -> Result<StoreArray> {
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::uint32(), 0u32);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder
        .build(store.storage(), &node_path(path))
        .map_err(Error::storage)?;
    array.store_metadata().map_err(Error::storage)?;
    Ok(array)
}

pub fn create_array_f64(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Option<Attributes>,
) -> Result<StoreArray> {
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::float64(), 0.0f64);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder
        .build(store.storage(), &node_path(path))
        .map_err(Error::storage)?;
    array.store_metadata().map_err(Error::storage)?;
    Ok(array)
}

pub fn read_chunk_u16(array: &StoreArray, chunk_indices: &[u64]) -> Result<Vec<u16>> {
    array
        .retrieve_chunk::<Vec<u16>>(chunk_indices)
        .map_err(Error::storage)
}

pub fn read_chunk_u32(array: &StoreArray, chunk_indices: &[u64]) -> Result<Vec<u32>> {
    array
        .retrieve_chunk::<Vec<u32>>(chunk_indices)
        .map_err(Error::storage)
}

pub fn read_chunk_f64(array: &StoreArray, chunk_indices: &[u64]) -> Result<Vec<f64>> {
    array
        .retrieve_chunk::<Vec<f64>>(chunk_indices)
        .map_err(Error::storage)
}

pub fn store_chunk_u16(array: &StoreArray, chunk_indices: &[u64], data: &[u16]) -> Result<()> {
    array.store_chunk(chunk_indices, data).map_err(Error::storage)
}

pub fn store_chunk_u32(array: &StoreArray, chunk_indices: &[u64], data: &[u32]) -> Result<()> {
    array.store_chunk(chunk_indices, data).map_err(Error::storage)
}

pub fn store_chunk_f64(array: &StoreArray, chunk_indices: &[u64], data: &[f64]) -> Result<()> {
    array.store_chunk(chunk_indices, data).map_err(Error::storage)
}

/// Element types of image arrays: u16 intensities and u32 label ids.
pub trait Pixel: Copy + Default + PartialEq + Send + Sync + 'static {
    fn read_chunk(array: &StoreArray, chunk_indices: &[u64]) -> Result<Vec<Self>>;
    fn store_chunk(array: &StoreArray, chunk_indices: &[u64], data: &[Self]) -> Result<()>;
    fn to_u64(self) -> u64;
    /// Saturates at the type's maximum.
    fn from_u64(value: u64) -> Self;
}

impl Pixel for u16 {
    fn read_chunk(array: &StoreArray, chunk_indices: &[u64]) -> Result<Vec<Self>> {
        read_chunk_u16(array, chunk_indices)
    }

    fn store_chunk(array: &StoreArray, chunk_indices: &[u64], data: &[Self]) -> Result<()> {
        store_chunk_u16(array, chunk_indices, data)
    }

    fn to_u64(self) -> u64 {
        self as u64
    }

    fn from_u64(value: u64) -> Self {
        value.min(u16::MAX as u64) as u16
    }
}

impl Pixel for u32 {
    fn read_chunk(array: &StoreArray, chunk_indices: &[u64]) -> Result<Vec<Self>> {
        read_chunk_u32(array, chunk_indices)
    }

    fn store_chunk(array: &StoreArray, chunk_indices: &[u64], data: &[Self]) -> Result<()> {
        store_chunk_u32(array, chunk_indices, data)
    }

    fn to_u64(self) -> u64 {
        self as u64
    }

    fn from_u64(value: u64) -> Self {
        value.min(u32::MAX as u64) as u32
    }
}

/// Visit every index in the inclusive box `lo..=hi`, last axis fastest.
pub(crate) fn box_indices(lo: &[u64], hi: &[u64]) -> Vec<Vec<u64>> {
    if lo.iter().zip(hi).any(|(l, h)| l > h) {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut idx = lo.to_vec();
    loop {
        out.push(idx.clone());
        let mut axis = idx.len();
        loop {
            if axis == 0 {
                return out;
            }
            axis -= 1;
            if idx[axis] < hi[axis] {
                idx[axis] += 1;
                break;
            }
            idx[axis] = lo[axis];
        }
    }
}

fn check_region(array: &StoreArray, start: &[u64], extent: &[u64]) -> Result<Vec<u64>> {
    let shape = array.shape();
    let end: Vec<u64> = start.iter().zip(extent).map(|(s, e)| s + e).collect();
    let fits = start.len() == shape.len()
        && extent.len() == shape.len()
        && end.iter().zip(shape).all(|(e, s)| e <= s);
    if !fits {
        return Err(Error::Region {
            path: array.path().as_str().to_string(),
            start: start.to_vec(),
            end,
            shape: shape.to_vec(),
        });
    }
    Ok(end)
}

/// Chunks intersecting `start..end`, with the intersection relative to the
/// chunk origin and to `start`.
struct ChunkOverlap {
    indices: Vec<u64>,
    in_chunk: Vec<(usize, usize)>,
    in_region: Vec<(usize, usize)>,
    full: bool,
}

fn chunk_overlaps(chunks: &[u64], start: &[u64], end: &[u64]) -> Vec<ChunkOverlap> {
    if start.iter().zip(end).any(|(s, e)| s >= e) {
        return Vec::new();
    }
    let lo: Vec<u64> = start.iter().zip(chunks).map(|(s, c)| s / c).collect();
    let hi: Vec<u64> = end.iter().zip(chunks).map(|(e, c)| (e - 1) / c).collect();
    box_indices(&lo, &hi)
        .into_iter()
        .map(|indices| {
            let mut in_chunk = Vec::with_capacity(indices.len());
            let mut in_region = Vec::with_capacity(indices.len());
            let mut full = true;
            for d in 0..indices.len() {
                let origin = indices[d] * chunks[d];
                let a = start[d].max(origin);
                let b = end[d].min(origin + chunks[d]);
                full &= a == origin && b == origin + chunks[d];
                in_chunk.push(((a - origin) as usize, (b - origin) as usize));
                in_region.push(((a - start[d]) as usize, (b - start[d]) as usize));
            }
            ChunkOverlap {
                indices,
                in_chunk,
                in_region,
                full,
            }
        })
        .collect()
}

fn chunk_array<T: Pixel>(chunks: &[u64], data: Vec<T>) -> Result<ArrayD<T>> {
    let dims: Vec<usize> = chunks.iter().map(|c| *c as usize).collect();
    ArrayD::from_shape_vec(IxDyn(&dims), data).map_err(Error::storage)
}

/// Read the hyper-rectangle `start..start+extent` of an array.
pub fn read_region<T: Pixel>(array: &StoreArray, start: &[u64], extent: &[u64]) -> Result<ArrayD<T>> {
    let end = check_region(array, start, extent)?;
    let chunks = chunk_shape(array)?;
    let dims: Vec<usize> = extent.iter().map(|e| *e as usize).collect();
    let mut out = ArrayD::<T>::default(IxDyn(&dims));
    for overlap in chunk_overlaps(&chunks, start, &end) {
        let chunk = chunk_array(&chunks, T::read_chunk(array, &overlap.indices)?)?;
        let src = chunk.slice_each_axis(|ax| {
            let (a, b) = overlap.in_chunk[ax.axis.index()];
            Slice::from(a..b)
        });
        out.slice_each_axis_mut(|ax| {
            let (a, b) = overlap.in_region[ax.axis.index()];
            Slice::from(a..b)
        })
        .assign(&src);
    }
    Ok(out)
}

/// Write `data` at `start`, read-modify-writing partially covered chunks.
pub fn write_region<T: Pixel>(array: &StoreArray, start: &[u64], data: ArrayViewD<'_, T>) -> Result<()> {
    let extent: Vec<u64> = data.shape().iter().map(|d| *d as u64).collect();
    let end = check_region(array, start, &extent)?;
    let chunks = chunk_shape(array)?;
    for overlap in chunk_overlaps(&chunks, start, &end) {
        let mut chunk = if overlap.full {
            let dims: Vec<usize> = chunks.iter().map(|c| *c as usize).collect();
            ArrayD::<T>::default(IxDyn(&dims))
        } else {
            chunk_array(&chunks, T::read_chunk(array, &overlap.indices)?)?
        };
        let src = data.slice_each_axis(|ax| {
            let (a, b) = overlap.in_region[ax.axis.index()];
            Slice::from(a..b)
        });
        chunk
            .slice_each_axis_mut(|ax| {
                let (a, b) = overlap.in_chunk[ax.axis.index()];
                Slice::from(a..b)
            })
            .assign(&src);
        let flat: Vec<T> = chunk.iter().copied().collect();
        T::store_chunk(array, &overlap.indices, &flat)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::TempDir;

    #[test]
    fn box_indices_is_row_major() {
        let idx = box_indices(&[0, 1], &[1, 2]);
        assert_eq!(idx, vec![vec![0, 1], vec![0, 2], vec![1, 1], vec![1, 2]]);
        assert!(box_indices(&[2], &[1]).is_empty());
    }

    #[test]
    fn region_roundtrip_across_chunk_edges() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        create_group(&store, "/", None).unwrap();
        let array = create_array_u16(&store, "img", vec![10, 10], vec![4, 4], None).unwrap();

        let patch = Array2::from_shape_fn((5, 6), |(y, x)| (y * 10 + x) as u16 + 1);
        write_region(&array, &[3, 2], patch.view().into_dyn()).unwrap();

        let back = read_region::<u16>(&array, &[3, 2], &[5, 6]).unwrap();
        assert_eq!(back, patch.into_dyn());

        let around = read_region::<u16>(&array, &[0, 0], &[10, 10]).unwrap();
        assert_eq!(around[[2, 2]], 0);
        assert_eq!(around[[3, 2]], 1);
        assert_eq!(around[[7, 7]], 46);
        assert_eq!(around[[8, 8]], 0);
    }

    #[test]
    fn region_outside_array_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let array = create_array_u32(&store, "lbl", vec![4, 4], vec![2, 2], None).unwrap();
        let err = read_region::<u32>(&array, &[3, 3], &[2, 2]).unwrap_err();
        assert!(matches!(err, Error::Region { .. }));
    }

    #[test]
    fn remove_node_deletes_subtree() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        create_group(&store, "/", None).unwrap();
        create_group(&store, "A", None).unwrap();
        create_array_u16(&store, "A/0", vec![2], vec![2], None).unwrap();
        assert!(store.exists("A/0"));
        store.remove_node("A").unwrap();
        assert!(!store.exists("A"));
        assert!(store.exists("/"));
    }
}
