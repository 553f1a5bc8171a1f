//! EXIF metadata reading and writing.
//!
//! - [`MetadataContainer`]: an EXIF block decoded into sections of typed fields
//! - [`annotate`]: write a caption into an image's `ImageDescription`, in place
//! - [`read_exif`]: summarise existing metadata (description, camera, GPS)
//!
//! The writer handles JPEG (APP1), PNG (`eXIf`) and WebP (`EXIF` chunk). Only
//! the metadata block is replaced; pixel data is copied through untouched.

mod container;
mod reader;
mod writer;

pub use container::{
    ByteOrder, FieldValue, Fields, MetadataContainer, Section, TAG_IMAGE_DESCRIPTION,
};
pub use reader::{ExifData, read_exif};
pub use writer::{annotate, read_container, write_container};

use thiserror::Error;

/// Failure to read, update or save an image's metadata block.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The image format cannot carry an EXIF block.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    /// The file could not be opened, read or replaced.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The image container or its EXIF block could not be parsed.
    #[error("malformed metadata: {0}")]
    Malformed(String),
    /// The caption or the resulting block cannot be encoded.
    #[error("cannot encode metadata: {0}")]
    Encoding(String),
}
