//! Upload validation and staging.
//!
//! An upload is accepted when it carries a filename whose extension is one
//! of [`ALLOWED_EXTENSIONS`]. Accepted bytes are written under the upload
//! directory with a fresh UUID name, so concurrent uploads of `photo.jpg`
//! never share a path. The client's name survives only as a sanitized
//! display string.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Extensions accepted from clients (compared lowercased).
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Names Windows reserves for devices. A sanitized name matching one of
/// them gets a `_` prefix.
const WINDOWS_DEVICE_FILES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3",
];

/// Why an upload was rejected. The display strings are returned to clients
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Image not provided")]
    ImageNotProvided,
    #[error("No image selected")]
    NoImageSelected,
    #[error("Invalid file format")]
    InvalidFileFormat,
}

/// A file received from a client, before validation.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Name as sent by the client. May be empty.
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// An upload written to disk.
#[derive(Debug, Clone)]
pub struct StagedImage {
    /// Unique on-disk location.
    pub path: PathBuf,
    /// Sanitized client filename, for logs and responses only.
    pub display_name: String,
}

impl Upload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    /// Lowercased text after the last `.`, if any.
    fn extension(&self) -> Option<String> {
        extension_of(&self.file_name)
    }
}

impl StagedImage {
    /// Delete the staged file. A file that is already gone is not an error.
    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn extension_of(name: &str) -> Option<String> {
    name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
}

/// Whether `name` has an allowed image extension.
///
/// ```rust
/// use exif_caption::intake::allowed_file;
///
/// assert!(allowed_file("holiday.JPG"));
/// assert!(!allowed_file("virus.exe"));
/// assert!(!allowed_file("png"));
/// ```
pub fn allowed_file(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

/// Reduce a client-supplied filename to a safe, flat ASCII name.
///
/// The result never contains a path separator and never starts with `.`,
/// so it cannot escape a directory it is joined to. It may be empty.
pub fn secure_filename(name: &str) -> String {
    let flattened: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");

    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');

    let stem = trimmed.split('.').next().unwrap_or_default();
    if !trimmed.is_empty() && WINDOWS_DEVICE_FILES.contains(&stem.to_uppercase().as_str()) {
        format!("_{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Check a possibly-missing upload, in the order clients expect:
/// presence, then a non-empty name, then the extension.
pub fn validate(upload: Option<Upload>) -> Result<Upload, ValidationError> {
    let upload = upload.ok_or(ValidationError::ImageNotProvided)?;
    if upload.file_name.is_empty() {
        return Err(ValidationError::NoImageSelected);
    }
    if !allowed_file(&upload.file_name) {
        return Err(ValidationError::InvalidFileFormat);
    }
    Ok(upload)
}

/// Write a validated upload to `<upload_dir>/<uuid>.<ext>`.
///
/// The directory is created if needed.
pub fn stage(upload_dir: &Path, upload: &Upload) -> io::Result<StagedImage> {
    std::fs::create_dir_all(upload_dir)?;

    let ext = upload.extension().unwrap_or_else(|| "bin".to_string());
    let path = upload_dir.join(format!("{}.{ext}", Uuid::new_v4()));
    std::fs::write(&path, &upload.bytes)?;

    let display_name = secure_filename(&upload.file_name);
    log::debug!("Staged {display_name:?} at {}", path.display());

    Ok(StagedImage { path, display_name })
}
