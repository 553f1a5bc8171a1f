use image::ImageFormat;
use img_parts::jpeg::{Jpeg, JpegSegment};
use img_parts::png::Png;
use img_parts::webp::WebP;
use img_parts::{Bytes, ImageEXIF};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use super::{MetadataContainer, MetadataError};

const EXIF_PREFIX: &[u8] = b"Exif\0\0";
const MARKER_APP0: u8 = 0xE0;
const MARKER_APP1: u8 = 0xE1;

// A JPEG segment length is a u16 that counts itself, and the APP1 payload
// also carries the `Exif\0\0` prefix.
const MAX_JPEG_EXIF_LEN: usize = 65_535 - 2 - EXIF_PREFIX.len();

/// An image whose metadata block can be replaced without touching pixel data.
enum EmbeddedImage {
    /// EXIF in an APP1 segment.
    Jpeg(Jpeg),
    /// EXIF in an `eXIf` chunk.
    Png(Png),
    /// EXIF in a RIFF `EXIF` chunk.
    WebP(WebP),
}

impl EmbeddedImage {
    fn open(path: &Path) -> Result<Self, MetadataError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(bytes)
    }

    fn from_bytes(bytes: Vec<u8>) -> Result<Self, MetadataError> {
        let format = image::guess_format(&bytes)
            .map_err(|_| MetadataError::UnsupportedFormat("unrecognised image data".into()))?;
        let bytes = Bytes::from(bytes);

        match format {
            ImageFormat::Jpeg => Jpeg::from_bytes(bytes)
                .map(Self::Jpeg)
                .map_err(|e| MetadataError::Malformed(format!("invalid JPEG structure: {e}"))),
            ImageFormat::Png => Png::from_bytes(bytes)
                .map(Self::Png)
                .map_err(|e| MetadataError::Malformed(format!("invalid PNG structure: {e}"))),
            ImageFormat::WebP => WebP::from_bytes(bytes)
                .map(Self::WebP)
                .map_err(|e| MetadataError::Malformed(format!("invalid WebP structure: {e}"))),
            other => Err(MetadataError::UnsupportedFormat(format!(
                "{other:?} cannot carry an EXIF block"
            ))),
        }
    }

    fn exif(&self) -> Option<Bytes> {
        let exif = match self {
            EmbeddedImage::Jpeg(jpeg) => jpeg.exif(),
            EmbeddedImage::Png(png) => png.exif(),
            EmbeddedImage::WebP(webp) => webp.exif(),
        };
        exif.filter(|bytes| !bytes.is_empty())
    }

    /// The parsed metadata block, or `None` when the image has none.
    fn container(&self) -> Result<Option<MetadataContainer>, MetadataError> {
        self.exif()
            .map(|raw| MetadataContainer::parse(&raw))
            .transpose()
    }

    fn replace_container(&mut self, container: &MetadataContainer) -> Result<(), MetadataError> {
        let tiff = container.to_bytes()?;

        match self {
            EmbeddedImage::Jpeg(jpeg) => {
                if tiff.len() > MAX_JPEG_EXIF_LEN {
                    return Err(MetadataError::Encoding(format!(
                        "metadata block of {} bytes does not fit in a JPEG APP1 segment",
                        tiff.len()
                    )));
                }
                set_jpeg_exif(jpeg, tiff);
            }
            EmbeddedImage::Png(png) => png.set_exif(Some(Bytes::from(tiff))),
            EmbeddedImage::WebP(webp) => webp.set_exif(Some(Bytes::from(tiff))),
        }
        Ok(())
    }

    fn encode(self) -> Bytes {
        match self {
            EmbeddedImage::Jpeg(jpeg) => jpeg.encoder().bytes(),
            EmbeddedImage::Png(png) => png.encoder().bytes(),
            EmbeddedImage::WebP(webp) => webp.encoder().bytes(),
        }
    }

    fn save(self, path: &Path) -> Result<(), MetadataError> {
        let output = self.encode();
        persist_atomically(path, &output)
    }
}

/// Write `caption` into the image's `ImageDescription` field, in place.
///
/// Existing EXIF is parsed and every other field is kept; an image without a
/// metadata block gets a fresh one. Only the metadata segment/chunk changes,
/// pixel data and other embedded blocks are written back untouched. The new
/// file replaces the old one through an atomic rename, so a failure leaves the
/// original intact.
///
/// # Errors
///
/// - [`MetadataError::UnsupportedFormat`]: not a JPEG, PNG or WebP
/// - [`MetadataError::Io`]: the file cannot be read or replaced
/// - [`MetadataError::Malformed`]: the image or its EXIF block cannot be parsed
/// - [`MetadataError::Encoding`]: empty caption, NUL in caption, or block too large
pub fn annotate(path: &Path, caption: &str) -> Result<(), MetadataError> {
    let mut embedded = EmbeddedImage::open(path)?;

    let mut container = match embedded.container()? {
        Some(container) => {
            log::debug!("Loaded existing EXIF from {}", path.display());
            container
        }
        None => {
            log::debug!("No EXIF in {}, creating a new block", path.display());
            MetadataContainer::new()
        }
    };

    container.set_description(caption)?;
    embedded.replace_container(&container)?;
    embedded.save(path)?;

    log::debug!("Caption written to {}", path.display());
    Ok(())
}

/// Read and parse the metadata block of an image, if it has one.
pub fn read_container(path: &Path) -> Result<Option<MetadataContainer>, MetadataError> {
    EmbeddedImage::open(path)?.container()
}

/// Replace the whole metadata block of an image with `container`.
pub fn write_container(path: &Path, container: &MetadataContainer) -> Result<(), MetadataError> {
    let mut embedded = EmbeddedImage::open(path)?;
    embedded.replace_container(container)?;
    embedded.save(path)
}

/// Set the EXIF APP1 segment, keeping it where it was (or right after APP0).
fn set_jpeg_exif(jpeg: &mut Jpeg, tiff: Vec<u8>) {
    let target_pos = find_exif_segment_pos(jpeg.segments()).unwrap_or_else(|| {
        match jpeg.segments().first() {
            Some(first) if first.marker() == MARKER_APP0 => 1,
            _ => 0,
        }
    });

    jpeg.set_exif(Some(Bytes::from(tiff)));

    // set_exif() inserts at a fixed index, which may land after XMP APP1.
    if let Some(new_pos) = find_exif_segment_pos(jpeg.segments()) {
        if new_pos != target_pos {
            let segments = jpeg.segments_mut();
            let segment = segments.remove(new_pos);
            let target_pos = target_pos.min(segments.len());
            segments.insert(target_pos, segment);
        }
    }
}

/// Position of the EXIF APP1 segment (marker 0xE1, contents start with `Exif\0\0`).
fn find_exif_segment_pos(segments: &[JpegSegment]) -> Option<usize> {
    segments
        .iter()
        .position(|s| s.marker() == MARKER_APP1 && s.contents().starts_with(EXIF_PREFIX))
}

/// Write `bytes` to a temporary sibling of `path` and rename it over `path`.
fn persist_atomically(path: &Path, bytes: &[u8]) -> Result<(), MetadataError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let permissions = std::fs::metadata(path)?.permissions();

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.as_file().set_permissions(permissions)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exif::{FieldValue, Section};
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn gradient() -> RgbImage {
        RgbImage::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 128]))
    }

    fn write_image(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        gradient().save(&path).unwrap();
        path
    }

    fn ascii(s: &str) -> FieldValue {
        let mut raw = s.as_bytes().to_vec();
        raw.push(0);
        FieldValue::Ascii(raw)
    }

    fn camera_metadata() -> MetadataContainer {
        let mut c = MetadataContainer::new();
        c.set(Section::Primary, 0x010F, ascii("Canon"));
        c.set(Section::Primary, 0x0110, ascii("Canon EOS R5"));
        c.set(Section::Primary, 0x0112, FieldValue::Short(vec![1]));
        c.set(Section::Exif, 0x9003, ascii("2024:05:01 10:00:00"));
        c.set(Section::Exif, 0x829A, FieldValue::Rational(vec![(1, 250)]));
        c.set(Section::Gps, 0x0001, ascii("N"));
        c.set(
            Section::Gps,
            0x0002,
            FieldValue::Rational(vec![(48, 1), (51, 1), (2400, 100)]),
        );
        c
    }

    fn decoded_pixels(path: &Path) -> Vec<u8> {
        image::open(path).unwrap().to_rgb8().into_raw()
    }

    #[test]
    fn annotate_creates_block_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "plain.jpg");
        assert!(read_container(&path).unwrap().is_none());

        annotate(&path, "a colorful gradient").unwrap();

        let container = read_container(&path).unwrap().unwrap();
        assert_eq!(container.description().as_deref(), Some("a colorful gradient"));
        assert_eq!(container.section(Section::Primary).len(), 1);
        for section in [Section::Exif, Section::Gps, Section::Interop, Section::Thumbnail] {
            assert!(container.section(section).is_empty());
        }
        assert_eq!(container.thumbnail(), None);
    }

    #[test]
    fn annotate_preserves_existing_fields() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "camera.jpg");
        let original = camera_metadata();
        write_container(&path, &original).unwrap();

        annotate(&path, "a dog running on the beach").unwrap();

        let mut expected = original.clone();
        expected.set_description("a dog running on the beach").unwrap();
        assert_eq!(read_container(&path).unwrap().unwrap(), expected);
    }

    #[test]
    fn annotate_overwrites_previous_description() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "photo.jpg");

        annotate(&path, "old caption that is rather long").unwrap();
        annotate(&path, "new").unwrap();

        let container = read_container(&path).unwrap().unwrap();
        assert_eq!(container.description().as_deref(), Some("new"));
    }

    #[test]
    fn annotate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "photo.jpg");
        write_container(&path, &camera_metadata()).unwrap();

        annotate(&path, "two cats on a sofa").unwrap();
        let once = std::fs::read(&path).unwrap();
        annotate(&path, "two cats on a sofa").unwrap();
        let twice = std::fs::read(&path).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn annotate_keeps_pixels_identical() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "photo.jpg");
        let before = decoded_pixels(&path);

        annotate(&path, "a gradient").unwrap();

        assert_eq!(decoded_pixels(&path), before);
    }

    #[test]
    fn annotate_keeps_exif_before_other_app_segments() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "photo.jpg");

        let bytes = std::fs::read(&path).unwrap();
        let mut jpeg = Jpeg::from_bytes(Bytes::from(bytes)).unwrap();
        let xmp = JpegSegment::new_with_contents(
            MARKER_APP1,
            Bytes::from_static(b"http://ns.adobe.com/xap/1.0/\0<x:xmpmeta/>"),
        );
        jpeg.segments_mut().insert(1, xmp);
        std::fs::write(&path, jpeg.encoder().bytes()).unwrap();

        annotate(&path, "a gradient").unwrap();

        let jpeg = Jpeg::from_bytes(Bytes::from(std::fs::read(&path).unwrap())).unwrap();
        let exif_pos = find_exif_segment_pos(jpeg.segments()).unwrap();
        let xmp_pos = jpeg
            .segments()
            .iter()
            .position(|s| s.contents().starts_with(b"http://ns.adobe.com/xap/1.0/\0"))
            .unwrap();
        assert!(exif_pos < xmp_pos);
    }

    #[test]
    fn annotate_png() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "diagram.png");
        let before = decoded_pixels(&path);

        annotate(&path, "a diagram").unwrap();

        let container = read_container(&path).unwrap().unwrap();
        assert_eq!(container.description().as_deref(), Some("a diagram"));
        assert_eq!(decoded_pixels(&path), before);
    }

    #[test]
    fn annotate_rejects_unsupported_formats() {
        let dir = TempDir::new().unwrap();
        let gif = dir.path().join("anim.gif");
        std::fs::write(&gif, b"GIF89a\x01\x00\x01\x00\x00\x00\x00;").unwrap();
        let text = dir.path().join("notes.jpg");
        std::fs::write(&text, b"definitely not an image").unwrap();

        assert!(matches!(
            annotate(&gif, "caption"),
            Err(MetadataError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            annotate(&text, "caption"),
            Err(MetadataError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn annotate_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.jpg");
        assert!(matches!(
            annotate(&missing, "caption"),
            Err(MetadataError::Io(_))
        ));
    }

    #[test]
    fn annotate_empty_caption_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "photo.jpg");
        let before = std::fs::read(&path).unwrap();

        assert!(matches!(annotate(&path, ""), Err(MetadataError::Encoding(_))));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn annotate_refuses_to_discard_corrupt_exif() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "photo.jpg");

        let bytes = std::fs::read(&path).unwrap();
        let mut jpeg = Jpeg::from_bytes(Bytes::from(bytes)).unwrap();
        jpeg.set_exif(Some(Bytes::from_static(b"garbage that is not TIFF")));
        std::fs::write(&path, jpeg.encoder().bytes()).unwrap();
        let before = std::fs::read(&path).unwrap();

        assert!(matches!(
            annotate(&path, "caption"),
            Err(MetadataError::Malformed(_))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn oversized_block_is_rejected_for_jpeg() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "photo.jpg");
        let mut c = MetadataContainer::new();
        c.set(Section::Exif, 0x927C, FieldValue::Undefined(vec![0; 70_000]));

        assert!(matches!(
            write_container(&path, &c),
            Err(MetadataError::Encoding(_))
        ));
    }

    #[test]
    fn annotate_leaves_no_temporary_files() {
        let dir = TempDir::new().unwrap();
        let path = write_image(&dir, "photo.jpg");

        annotate(&path, "a gradient").unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
