use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::caption::CaptionProvider;
use crate::exif::{self, MetadataError};
use crate::intake::allowed_file;

/// Why captioning a single file failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The file could not be read.
    #[error("Failed to read image: {0}")]
    Read(#[source] io::Error),
    /// The bytes are not a decodable image.
    #[error("Invalid image data: {0}")]
    Decode(#[source] image::ImageError),
    /// The caption provider failed.
    #[error("Caption generation failed: {0:#}")]
    Inference(anyhow::Error),
    /// The caption could not be written into the file.
    #[error("Metadata write failed: {0}")]
    Metadata(#[from] MetadataError),
}

/// The result of captioning one image.
///
/// # Example
///
/// ```rust,no_run
/// # use exif_caption::caption::BlipCaptioner;
/// # use exif_caption::pipeline::caption_file;
/// # use std::path::Path;
/// # async fn example(provider: BlipCaptioner) -> anyhow::Result<()> {
/// let outcome = caption_file(Path::new("photo.jpg"), &provider, true).await?;
/// println!("{}: {}", outcome.path.display(), outcome.caption);
/// assert!(outcome.embedded);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct CaptionOutcome {
    pub path: PathBuf,
    pub caption: String,
    /// Whether the caption was written into the file's ImageDescription.
    pub embedded: bool,
    /// Name of the provider that produced the caption.
    pub provider: String,
}

/// Caption the image at `path` and, when `embed` is set, store the caption
/// in its EXIF ImageDescription.
///
/// Decoding and the metadata rewrite run on the blocking pool. The file is
/// only modified after a caption has been produced, so a failed inference
/// leaves it untouched.
pub async fn caption_file(
    path: &Path,
    provider: &dyn CaptionProvider,
    embed: bool,
) -> Result<CaptionOutcome, PipelineError> {
    let bytes = tokio::fs::read(path).await.map_err(PipelineError::Read)?;

    let image = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| PipelineError::Read(io::Error::other(e)))?
        .map_err(PipelineError::Decode)?;

    log::debug!(
        "Decoded {} ({}x{}), captioning with {}",
        path.display(),
        image.width(),
        image.height(),
        provider.name()
    );

    let caption = provider
        .caption(image)
        .await
        .map_err(PipelineError::Inference)?;
    let caption = caption.trim().to_string();
    if caption.is_empty() {
        return Err(PipelineError::Inference(anyhow::anyhow!(
            "{} returned an empty caption",
            provider.name()
        )));
    }

    if embed {
        let target = path.to_path_buf();
        let text = caption.clone();
        tokio::task::spawn_blocking(move || exif::annotate(&target, &text))
            .await
            .map_err(|e| MetadataError::Io(io::Error::other(e)))??;
        log::info!("Caption stored in {}", path.display());
    }

    Ok(CaptionOutcome {
        path: path.to_path_buf(),
        caption,
        embedded: embed,
        provider: provider.name().to_string(),
    })
}

/// Collect supported image files from the given paths.
///
/// Accepts a mix of file paths and directory paths. Directories are walked
/// recursively (following symlinks). Only PNG and JPEG files are included.
///
/// # Example
///
/// ```rust,no_run
/// use exif_caption::pipeline::collect_images;
/// use std::path::PathBuf;
///
/// let images = collect_images(&[
///     PathBuf::from("photo.jpg"),       // single file
///     PathBuf::from("./photos/"),        // entire directory
/// ]);
/// println!("Found {} images", images.len());
/// ```
pub fn collect_images(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for path in paths {
        if path.is_file() {
            if is_supported_image(path) {
                images.push(path.clone());
            } else {
                log::warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let p = entry.path();
                if p.is_file() && is_supported_image(p) {
                    images.push(p.to_path_buf());
                }
            }
        } else {
            log::warn!("Path does not exist: {}", path.display());
        }
    }

    images
}

/// Check if a file has a supported image extension.
fn is_supported_image(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(allowed_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exif::{FieldValue, MetadataContainer, Section, read_container, write_container};
    use image::{DynamicImage, Rgb, RgbImage};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Stub {
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl Stub {
        fn replying(text: &'static str) -> Self {
            Self {
                reply: Some(text),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                reply: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl CaptionProvider for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn caption(&self, _image: DynamicImage) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Some(text) => Ok(text.to_string()),
                None => anyhow::bail!("model exploded"),
            }
        }
    }

    fn jpeg(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("photo.jpg");
        RgbImage::from_pixel(8, 8, Rgb([10, 120, 200])).save(&path).unwrap();
        path
    }

    // ── caption_file ─────────────────────────────────────────────────

    #[tokio::test]
    async fn caption_is_embedded_and_existing_fields_kept() {
        let dir = TempDir::new().unwrap();
        let path = jpeg(&dir);
        let mut container = MetadataContainer::new();
        container.set(Section::Primary, 0x0110, FieldValue::Ascii(b"X100V\0".to_vec()));
        write_container(&path, &container).unwrap();

        let stub = Stub::replying("  a blue square  ");
        let outcome = caption_file(&path, &stub, true).await.unwrap();

        assert_eq!(outcome.caption, "a blue square");
        assert!(outcome.embedded);
        assert_eq!(outcome.provider, "stub");

        let stored = read_container(&path).unwrap().unwrap();
        assert_eq!(stored.description().as_deref(), Some("a blue square"));
        assert_eq!(
            stored.get(Section::Primary, 0x0110),
            Some(&FieldValue::Ascii(b"X100V\0".to_vec()))
        );
    }

    #[tokio::test]
    async fn caption_only_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = jpeg(&dir);
        let before = fs::read(&path).unwrap();

        let outcome = caption_file(&path, &Stub::replying("a square"), false)
            .await
            .unwrap();

        assert_eq!(outcome.caption, "a square");
        assert!(!outcome.embedded);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn undecodable_bytes_are_a_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.png");
        fs::write(&path, b"definitely not a png").unwrap();
        let stub = Stub::replying("never");

        let err = caption_file(&path, &stub, true).await.unwrap_err();

        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        let err = caption_file(&dir.path().join("gone.jpg"), &Stub::replying("x"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Read(_)));
    }

    #[tokio::test]
    async fn provider_failure_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = jpeg(&dir);
        let before = fs::read(&path).unwrap();

        let err = caption_file(&path, &Stub::failing(), true).await.unwrap_err();

        assert!(matches!(err, PipelineError::Inference(_)));
        assert!(err.to_string().contains("model exploded"));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn blank_caption_is_an_inference_error() {
        let dir = TempDir::new().unwrap();
        let path = jpeg(&dir);
        let err = caption_file(&path, &Stub::replying("   "), true)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }

    #[tokio::test]
    async fn corrupt_exif_is_a_metadata_error() {
        use img_parts::jpeg::Jpeg;
        use img_parts::{Bytes, ImageEXIF};

        let dir = TempDir::new().unwrap();
        let path = jpeg(&dir);
        let mut parts = Jpeg::from_bytes(Bytes::from(fs::read(&path).unwrap())).unwrap();
        parts.set_exif(Some(Bytes::from_static(b"not a tiff header")));
        fs::write(&path, parts.encoder().bytes()).unwrap();

        let err = caption_file(&path, &Stub::replying("a square"), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Metadata(MetadataError::Malformed(_))
        ));
    }

    // ── is_supported_image ───────────────────────────────────────────

    #[test]
    fn supported_image_extensions() {
        assert!(is_supported_image(Path::new("photo.jpg")));
        assert!(is_supported_image(Path::new("photo.JPEG")));
        assert!(is_supported_image(Path::new("photo.png")));
        assert!(is_supported_image(Path::new("dir/Photo.PnG")));
    }

    #[test]
    fn unsupported_image_extensions() {
        assert!(!is_supported_image(Path::new("photo.webp")));
        assert!(!is_supported_image(Path::new("doc.pdf")));
        assert!(!is_supported_image(Path::new("readme.txt")));
        assert!(!is_supported_image(Path::new("noext")));
    }

    // ── collect_images ───────────────────────────────────────────────

    #[test]
    fn collect_images_single_file() {
        let dir = TempDir::new().unwrap();
        let jpg = dir.path().join("test.jpg");
        fs::write(&jpg, b"fake").unwrap();

        let images = collect_images(&[jpg.clone()]);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0], jpg);
    }

    #[test]
    fn collect_images_skips_unsupported() {
        let dir = TempDir::new().unwrap();
        let txt = dir.path().join("readme.txt");
        fs::write(&txt, b"hello").unwrap();

        let images = collect_images(&[txt]);
        assert!(images.is_empty());
    }

    #[test]
    fn collect_images_directory_recursive() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        fs::write(dir.path().join("a.jpg"), b"fake").unwrap();
        fs::write(sub.join("b.png"), b"fake").unwrap();
        fs::write(sub.join("c.txt"), b"fake").unwrap();

        let images = collect_images(&[dir.path().to_path_buf()]);
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn collect_images_nonexistent_path() {
        let images = collect_images(&[PathBuf::from("/nonexistent/path")]);
        assert!(images.is_empty());
    }
}
