//! Caption providers.
//!
//! A [`CaptionProvider`] turns decoded pixels into a short natural-language
//! description. The crate ships [`BlipCaptioner`], which runs BLIP locally.

pub mod blip;

pub use blip::{BlipCaptioner, default_model_dir, download_model};

use anyhow::Result;
use image::DynamicImage;

/// Trait for image captioning backends.
///
/// Implementations are constructed once and shared between requests, so
/// they must be `Send + Sync`.
///
/// # Example
///
/// ```rust
/// use exif_caption::caption::CaptionProvider;
/// use image::DynamicImage;
///
/// struct Fixed;
///
/// #[async_trait::async_trait]
/// impl CaptionProvider for Fixed {
///     fn name(&self) -> &str {
///         "fixed"
///     }
///
///     async fn caption(&self, _image: DynamicImage) -> anyhow::Result<String> {
///         Ok("a photo".to_string())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait CaptionProvider: Send + Sync {
    /// Display name of the backend (e.g. "BLIP (local)").
    fn name(&self) -> &str;

    /// Describe the image in one sentence.
    async fn caption(&self, image: DynamicImage) -> Result<String>;
}
