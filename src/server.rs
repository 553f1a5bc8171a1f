//! HTTP surface: `POST /generate-caption`.
//!
//! The request carries a multipart file field named `image`. The upload is
//! validated, staged under a unique name, captioned, and (unless disabled in
//! config) the caption is written into the staged file's EXIF block.

use anyhow::Context;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::caption::CaptionProvider;
use crate::config::Config;
use crate::intake::{self, Upload, ValidationError};
use crate::pipeline::{self, PipelineError};

/// Multipart field holding the uploaded file.
pub const IMAGE_FIELD: &str = "image";

const STORED_MESSAGE: &str = "Caption stored in image metadata";

/// Shared state handed to every request.
#[derive(Clone)]
pub struct AppState {
    provider: Arc<dyn CaptionProvider>,
    permits: Arc<Semaphore>,
    config: Arc<Config>,
}

impl AppState {
    /// The provider is built once by the caller and shared by all requests.
    pub fn new(config: Config, provider: Arc<dyn CaptionProvider>) -> Self {
        let permits = config.server.max_concurrent_captions.max(1);
        Self {
            provider,
            permits: Arc::new(Semaphore::new(permits)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[derive(Debug, Serialize)]
pub struct CaptionResponse {
    pub caption: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Every way a request can fail, each with a fixed JSON body.
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    Malformed,
    TooLarge,
    InvalidImage,
    Storage,
    Inference(String),
    Metadata(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(e) => (StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
            ApiError::Malformed => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Malformed multipart request" }),
            ),
            ApiError::TooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({ "error": "Image too large" }),
            ),
            ApiError::InvalidImage => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Invalid image data" }),
            ),
            ApiError::Storage => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Failed to store upload" }),
            ),
            ApiError::Inference(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Caption generation failed", "detail": detail }),
            ),
            ApiError::Metadata(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Metadata write failed", "detail": detail }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e)
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Read(e) => {
                log::error!("Staged upload unreadable: {e}");
                ApiError::Storage
            }
            PipelineError::Decode(e) => {
                log::warn!("Rejected undecodable upload: {e}");
                ApiError::InvalidImage
            }
            PipelineError::Inference(e) => {
                log::error!("Caption generation failed: {e:#}");
                ApiError::Inference(format!("{e:#}"))
            }
            PipelineError::Metadata(e) => {
                log::error!("Metadata write failed: {e}");
                ApiError::Metadata(e.to_string())
            }
        }
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::TooLarge
    } else {
        log::warn!("Malformed multipart body: {}", err.body_text());
        ApiError::Malformed
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let limit = state.config.server.max_upload_bytes;
    Router::new()
        .route("/generate-caption", post(generate_caption))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

/// Find the `image` file part. A part named `image` without a filename is a
/// plain form value, not a file, and does not count.
async fn read_image_field(multipart: &mut Multipart) -> Result<Option<Upload>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok(Some(Upload::new(file_name, bytes.to_vec())));
    }
    Ok(None)
}

async fn generate_caption(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<CaptionResponse>, ApiError> {
    let mut multipart = multipart.map_err(|e| {
        log::warn!("Rejected request: {}", e.body_text());
        ApiError::Malformed
    })?;

    let upload = intake::validate(read_image_field(&mut multipart).await?)?;

    let upload_dir = state.config.storage.upload_dir.clone();
    let staging = tokio::task::spawn_blocking(move || intake::stage(&upload_dir, &upload));
    let staged = match staging.await {
        Ok(Ok(staged)) => staged,
        Ok(Err(e)) => {
            log::error!("Failed to stage upload: {e}");
            return Err(ApiError::Storage);
        }
        Err(e) => {
            log::error!("Staging task failed: {e}");
            return Err(ApiError::Storage);
        }
    };

    let embed = state.config.metadata.embed_caption;
    let result = match state.permits.acquire().await {
        Ok(_permit) => {
            pipeline::caption_file(&staged.path, state.provider.as_ref(), embed).await
        }
        Err(e) => Err(PipelineError::Inference(anyhow::anyhow!(e))),
    };

    if !state.config.storage.retain_uploads {
        if let Err(e) = staged.remove() {
            log::warn!("Failed to remove {}: {e}", staged.path.display());
        }
    }

    let outcome = result?;
    log::info!(
        "Captioned {} ({}): {}",
        staged.display_name,
        staged.path.display(),
        outcome.caption
    );

    Ok(Json(CaptionResponse {
        caption: outcome.caption,
        message: embed.then(|| STORED_MESSAGE.to_string()),
    }))
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn serve(config: Config, provider: Arc<dyn CaptionProvider>) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    log::info!(
        "Serving POST /generate-caption on http://{addr} with {}",
        provider.name()
    );

    axum::serve(listener, router(AppState::new(config, provider)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Ctrl-C received, shutting down"),
        Err(e) => {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}
