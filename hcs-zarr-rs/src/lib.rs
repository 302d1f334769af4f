//! Conversion of high-content-screening plates into OME-Zarr.
//!
//! Instrument filenames are parsed into image keys, fields of view are laid
//! out inside their well, and the plate, well and image groups are written
//! with their pyramids, ROI tables and label images.

pub mod channels;
pub mod commands;
pub mod config;
pub mod convert;
pub mod error;
pub mod filename;
pub mod frames;
pub mod labels;
pub mod layout;
pub mod ngff;
pub mod pyramid;
pub mod registration;
pub mod replicate;
pub mod structure;
pub mod tables;
pub mod wells;
pub mod zarr;

pub use error::{Error, Result};
