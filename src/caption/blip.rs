#[cfg(target_os = "macos")]
extern crate accelerate_src;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip;
use image::DynamicImage;
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

use super::CaptionProvider;

/// Default model directory name inside the user's cache.
const MODEL_DIR_NAME: &str = "exif-caption";

/// BLIP model filename (safetensors, loads on Metal too).
pub const MODEL_FILENAME: &str = "model.safetensors";

/// Tokenizer filename.
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// HuggingFace repo for the BLIP model (safetensors format).
const MODEL_REPO: &str = "Salesforce/blip-image-captioning-large";

/// HuggingFace revision that has the safetensors file.
const MODEL_REVISION: &str = "refs/pr/18";

/// SEP token ID used by BLIP to signal end of generation.
const SEP_TOKEN_ID: u32 = 102;

/// BOS token ID used by BLIP to start generation.
const BOS_TOKEN_ID: u32 = 30522;

/// Side length of the square BLIP input.
const IMAGE_SIZE: usize = 384;

/// Generation length used when none is configured.
pub const DEFAULT_MAX_TOKENS: usize = 20;

/// Select the best available device (Metal GPU on macOS, CPU elsewhere).
fn best_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        log::info!("Using CPU for inference (forced by config)");
        return Ok(Device::Cpu);
    }
    #[cfg(target_os = "macos")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("Using Metal GPU for inference");
                return Ok(device);
            }
            Err(e) => {
                log::warn!("Metal GPU not available ({e}), falling back to CPU");
            }
        }
    }
    log::info!("Using CPU for inference");
    Ok(Device::Cpu)
}

/// Local captioner backed by BLIP (image-captioning-large).
///
/// Weights and tokenizer are loaded once by [`BlipCaptioner::load`] and kept
/// for the lifetime of the value. The text decoder carries a mutable KV cache,
/// so generations are serialized behind a mutex and run on tokio's blocking
/// pool.
pub struct BlipCaptioner {
    inner: Arc<BlipModel>,
}

struct BlipModel {
    model: Mutex<blip::BlipForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
    max_tokens: usize,
}

impl BlipCaptioner {
    /// Load the model from `model_dir` (see [`download_model`]).
    pub fn load(model_dir: &Path, force_cpu: bool, max_tokens: usize) -> Result<Self> {
        if !model_files_exist(model_dir) {
            anyhow::bail!(
                "BLIP model not found in {}. Run `exif-caption --download-model` to download it.",
                model_dir.display()
            );
        }

        let device = best_device(force_cpu)?;

        let tokenizer = Tokenizer::from_file(model_dir.join(TOKENIZER_FILENAME))
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {e}"))?;

        let config = blip::Config::image_captioning_large();
        let model_path = model_dir.join(MODEL_FILENAME);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&model_path], DType::F32, &device)
                .context("Failed to map BLIP weights")?
        };
        let model = blip::BlipForConditionalGeneration::new(&config, vb)
            .context("Failed to build BLIP model")?;

        log::info!("Loaded BLIP model from {}", model_dir.display());

        Ok(Self {
            inner: Arc::new(BlipModel {
                model: Mutex::new(model),
                tokenizer,
                device,
                max_tokens: max_tokens.max(1),
            }),
        })
    }
}

#[async_trait::async_trait]
impl CaptionProvider for BlipCaptioner {
    fn name(&self) -> &str {
        "BLIP (local)"
    }

    async fn caption(&self, image: DynamicImage) -> Result<String> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.generate(&image))
            .await
            .context("BLIP inference task failed")?
    }
}

impl BlipModel {
    /// Greedy decoding from BOS until SEP or `max_tokens`.
    fn generate(&self, image: &DynamicImage) -> Result<String> {
        let pixels = preprocess(image, &self.device)?;

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("BLIP model lock poisoned"))?;
        model.reset_kv_cache();

        let image_embeds = pixels.unsqueeze(0)?.apply(model.vision_model())?;

        let mut logits_processor = LogitsProcessor::new(1337, None, None);
        let mut token_ids = vec![BOS_TOKEN_ID];

        for index in 0..self.max_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let logits = logits.to_device(&Device::Cpu)?;
            let token = logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        let caption = self
            .tokenizer
            .decode(&token_ids[1..], true)
            .map_err(|e| anyhow::anyhow!("Failed to decode tokens: {e}"))?;

        Ok(caption.trim().to_string())
    }
}

/// Resize to 384×384, convert to RGB and apply CLIP normalization.
fn preprocess(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let size = IMAGE_SIZE as u32;
    let img = image
        .resize_to_fill(size, size, FilterType::Triangle)
        .to_rgb8();
    let data = img.into_raw();
    let data = Tensor::from_vec(data, (IMAGE_SIZE, IMAGE_SIZE, 3), device)?.permute((2, 0, 1))?;
    let mean =
        Tensor::new(&[0.48145466f32, 0.4578275, 0.40821073], device)?.reshape((3, 1, 1))?;
    let std =
        Tensor::new(&[0.26862954f32, 0.261_302_6, 0.275_777_1], device)?.reshape((3, 1, 1))?;
    let normalized = (data.to_dtype(DType::F32)? / 255.0)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(normalized)
}

/// Whether both model files are present in `dir`.
pub fn model_files_exist(dir: &Path) -> bool {
    dir.join(MODEL_FILENAME).exists() && dir.join(TOKENIZER_FILENAME).exists()
}

/// Get the default model directory path.
pub fn default_model_dir() -> Result<PathBuf> {
    let cache_dir = dirs_cache_dir().context("Could not determine cache directory")?;
    Ok(cache_dir.join(MODEL_DIR_NAME))
}

/// Platform-specific cache directory.
fn dirs_cache_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join("Library/Caches"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("LOCALAPPDATA").map(PathBuf::from)
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache"))
    }
}

/// Download the BLIP model and tokenizer to the specified directory.
///
/// If `model_dir` is `None`, uses the default cache directory. Files that are
/// already present are not fetched again.
pub async fn download_model(model_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match model_dir {
        Some(d) => d.to_path_buf(),
        None => default_model_dir()?,
    };

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create model directory: {}", dir.display()))?;

    let model_dest = dir.join(MODEL_FILENAME);
    let tokenizer_dest = dir.join(TOKENIZER_FILENAME);

    let api = hf_hub::api::tokio::Api::new()?;

    if model_dest.exists() {
        log::info!("Model already exists: {}", model_dest.display());
    } else {
        log::info!("Downloading BLIP model from {} ({})...", MODEL_REPO, MODEL_REVISION);
        let repo = api.repo(hf_hub::Repo::with_revision(
            MODEL_REPO.to_string(),
            hf_hub::RepoType::Model,
            MODEL_REVISION.to_string(),
        ));
        let downloaded = repo
            .get(MODEL_FILENAME)
            .await
            .context("Failed to download BLIP model")?;
        std::fs::copy(&downloaded, &model_dest).context("Failed to copy model to destination")?;
        log::info!("Model saved to: {}", model_dest.display());
    }

    // The tokenizer lives on the main branch
    if tokenizer_dest.exists() {
        log::info!("Tokenizer already exists: {}", tokenizer_dest.display());
    } else {
        log::info!("Downloading tokenizer from {}...", MODEL_REPO);
        let repo = api.model(MODEL_REPO.to_string());
        let downloaded = repo
            .get(TOKENIZER_FILENAME)
            .await
            .context("Failed to download tokenizer")?;
        std::fs::copy(&downloaded, &tokenizer_dest)
            .context("Failed to copy tokenizer to destination")?;
        log::info!("Tokenizer saved to: {}", tokenizer_dest.display());
    }

    log::info!("Model ready at: {}", dir.display());
    Ok(dir)
}
