use crate::assets::AssetLease;
use crate::error::RelayError;
use crate::media::{MediaKind, MediaType, classify};
use crate::staging::StagedFile;
use crate::AppState;
use anyhow::Context as _;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Extension, Multipart};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{Instrument as _, info, info_span};
use uuid::Uuid;

const VIDEO_DESCRIPTION: &str = "Video analysis request";

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub size_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub asset_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub vila_response: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_metadata: Option<ImageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_metadata: Option<VideoMetadata>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Default)]
struct UploadForm {
    file: Option<(String, Bytes)>,
    prompt: Option<String>,
}

pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}

/// `POST /api/process`: run the prompt and uploaded media through the VLM
pub async fn process_media(
    Extension(state): Extension<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!("process", %request_id);

    match handle_process(&state, multipart).instrument(span).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_process(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<ProcessResponse, RelayError> {
    let multipart = multipart.map_err(|_| RelayError::Validation("No file provided"))?;
    let form = read_form(multipart).await?;

    let Some((filename, data)) = form.file else {
        return Err(RelayError::Validation("No file provided"));
    };
    if filename.trim().is_empty() {
        return Err(RelayError::Validation("Empty filename"));
    }
    let Some(prompt) = form.prompt.filter(|p| !p.trim().is_empty()) else {
        return Err(RelayError::Validation("Prompt is required"));
    };
    let Some(media) = classify(&filename, &state.config.allowed_extensions) else {
        return Err(RelayError::Validation("Invalid file type"));
    };

    // removed from disk when `staged` drops, on every path below
    let staged = StagedFile::write(state.staging_dir(), &filename, &data).await?;
    info!(%filename, kind = ?media.kind, bytes = data.len(), "Processing upload");
    drop(data);

    match media.kind {
        MediaKind::Image => relay_image(state, &staged, &prompt).await,
        MediaKind::Video => relay_video(state, &staged, &media, &prompt).await,
    }
}

async fn relay_image(
    state: &AppState,
    staged: &StagedFile,
    prompt: &str,
) -> Result<ProcessResponse, RelayError> {
    let source = tokio::fs::read(staged.path()).await?;
    let fitter = state.fitter.clone();
    let fitted = tokio::task::spawn_blocking(move || fitter.fit(&source))
        .await
        .context("Image fitting task failed")??;
    info!(
        width = fitted.width,
        height = fitted.height,
        bytes = fitted.size_bytes,
        "Image fitted"
    );

    let vila_response = state
        .inference
        .infer(prompt, &fitted.media_tag(), &[])
        .await?;

    Ok(ProcessResponse {
        vila_response,
        image_metadata: Some(ImageMetadata {
            width: fitted.width,
            height: fitted.height,
            size_bytes: fitted.size_bytes,
        }),
        video_metadata: None,
    })
}

async fn relay_video(
    state: &AppState,
    staged: &StagedFile,
    media: &MediaType,
    prompt: &str,
) -> Result<ProcessResponse, RelayError> {
    let data = tokio::fs::read(staged.path()).await?;
    let lease = state
        .assets
        .upload(Bytes::from(data), &media.mime, VIDEO_DESCRIPTION)
        .await?;

    let result = infer_with_asset(state, &lease, media, prompt).await;
    let asset_id = lease.id().to_string();
    lease.release().await;

    Ok(ProcessResponse {
        vila_response: result?,
        image_metadata: None,
        video_metadata: Some(VideoMetadata { asset_id }),
    })
}

async fn infer_with_asset(
    state: &AppState,
    lease: &AssetLease,
    media: &MediaType,
    prompt: &str,
) -> Result<JsonValue, RelayError> {
    let media_tag = format!(
        r#"<video src="data:{};asset_id,{}" />"#,
        media.mime,
        lease.id()
    );
    state
        .inference
        .infer(prompt, &media_tag, &[lease.id()])
        .await
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, RelayError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(form_error)?;
                form.file = Some((filename, data));
            }
            Some("prompt") => {
                form.prompt = Some(field.text().await.map_err(form_error)?);
            }
            _ => {}
        }
    }

    Ok(form)
}

fn form_error(err: MultipartError) -> RelayError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        RelayError::PayloadTooLarge
    } else {
        RelayError::MalformedRequest
    }
}
