use anyhow::{Context, Result};
use nom_exif::*;
use serde::Serialize;
use std::path::Path;

/// Summary of the EXIF metadata already present in an image.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExifData {
    pub description: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub has_gps: bool,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
}

/// Read existing EXIF data from an image file.
///
/// Images without EXIF, or in a format the parser does not handle, yield an
/// empty summary rather than an error.
pub fn read_exif(path: &Path) -> Result<ExifData> {
    let mut parser = MediaParser::new();
    let ms = MediaSource::file_path(path).context("Failed to open image file")?;

    let iter: ExifIter = match parser.parse(ms) {
        Ok(iter) => iter,
        Err(_) => {
            log::debug!("No EXIF data found in {}", path.display());
            return Ok(ExifData::default());
        }
    };

    // Parse GPS info before converting to Exif (consumes the iterator)
    let gps_info = iter.parse_gps_info().ok().flatten();
    let exif: Exif = iter.into();

    let mut data = ExifData {
        description: exif.get(ExifTag::ImageDescription).and_then(entry_to_string),
        make: exif.get(ExifTag::Make).and_then(entry_to_string),
        model: exif.get(ExifTag::Model).and_then(entry_to_string),
        ..ExifData::default()
    };

    if let Some(gps) = gps_info {
        data.has_gps = true;
        data.gps_latitude = Some(latlng_to_decimal(&gps.latitude, gps.latitude_ref));
        data.gps_longitude = Some(latlng_to_decimal(&gps.longitude, gps.longitude_ref));
    }

    Ok(data)
}

fn entry_to_string(val: &EntryValue) -> Option<String> {
    let s = val.to_string();
    let s = s.trim().trim_matches('"').to_string();
    if s.is_empty() { None } else { Some(s) }
}

/// Convert a nom-exif LatLng (3 URationals: deg, min, sec) to decimal degrees.
fn latlng_to_decimal(latlng: &LatLng, reference: char) -> f64 {
    let degrees = latlng.0.0 as f64 / latlng.0.1 as f64;
    let minutes = latlng.1.0 as f64 / latlng.1.1 as f64;
    let seconds = latlng.2.0 as f64 / latlng.2.1 as f64;

    let coord = degrees + minutes / 60.0 + seconds / 3600.0;
    if reference == 'S' || reference == 'W' {
        -coord
    } else {
        coord
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exif::{FieldValue, MetadataContainer, Section, annotate, write_container};
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn jpeg(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("photo.jpg");
        RgbImage::from_pixel(16, 16, Rgb([200, 40, 40])).save(&path).unwrap();
        path
    }

    #[test]
    fn plain_image_has_empty_summary() {
        let dir = TempDir::new().unwrap();
        let data = read_exif(&jpeg(&dir)).unwrap();
        assert!(data.description.is_none());
        assert!(data.make.is_none());
        assert!(!data.has_gps);
    }

    #[test]
    fn annotated_caption_is_visible_to_an_independent_parser() {
        let dir = TempDir::new().unwrap();
        let path = jpeg(&dir);
        let mut container = MetadataContainer::new();
        container.set(Section::Primary, 0x010F, FieldValue::Ascii(b"Canon\0".to_vec()));
        write_container(&path, &container).unwrap();

        annotate(&path, "a red square").unwrap();

        let data = read_exif(&path).unwrap();
        assert_eq!(data.description.as_deref(), Some("a red square"));
        assert_eq!(data.make.as_deref(), Some("Canon"));
    }
}
