//! # exif-caption
//!
//! Caption images with a locally loaded BLIP model and store the caption in the
//! image's EXIF `ImageDescription` field, leaving every other metadata field
//! and the pixel data untouched.
//!
//! ## Quick Start
//!
//! The pipeline module handles the full read → caption → annotate flow:
//!
//! ```rust,no_run
//! use exif_caption::caption::{BlipCaptioner, default_model_dir};
//! use exif_caption::pipeline::{caption_file, collect_images};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let captioner = BlipCaptioner::load(&default_model_dir()?, false, 20)?;
//!
//!     for path in collect_images(&[PathBuf::from("./photos")]) {
//!         match caption_file(&path, &captioner, true).await {
//!             Ok(outcome) => println!("{}: {}", path.display(), outcome.caption),
//!             Err(e) => eprintln!("Error processing {}: {e}", path.display()),
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Serving
//!
//! [`server::serve`] exposes `POST /generate-caption`, taking a multipart
//! `image` field and answering with `{"caption": ...}`.
//!
//! ## Metadata only
//!
//! ```rust,no_run
//! use exif_caption::exif::{annotate, read_container};
//! use std::path::Path;
//!
//! let path = Path::new("photo.jpg");
//! annotate(path, "a dog running on a beach")?;
//!
//! let container = read_container(path)?.unwrap_or_default();
//! assert_eq!(container.description().as_deref(), Some("a dog running on a beach"));
//! # Ok::<(), exif_caption::exif::MetadataError>(())
//! ```
//!
//! ## Supported Formats
//!
//! | Format | Metadata location |
//! |--------|-------------------|
//! | JPEG (`.jpg`, `.jpeg`) | APP1 `Exif` segment |
//! | PNG (`.png`) | `eXIf` chunk |
//! | WebP | RIFF `EXIF` chunk (library only, not accepted for upload) |
//!
//! ## Modules
//!
//! - [`caption`]: caption provider trait and the BLIP implementation
//! - [`config`]: configuration types and loading/saving
//! - [`exif`]: typed EXIF container, annotator and reader
//! - [`intake`]: upload validation and staging
//! - [`pipeline`]: per-file captioning flow and image collection
//! - [`server`]: the HTTP endpoint

pub mod caption;
pub mod config;
pub mod exif;
pub mod intake;
pub mod pipeline;
pub mod server;
