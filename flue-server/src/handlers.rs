use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::{ws::WebSocketUpgrade, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use flue_core::{
    gobig, progress_channel, upscale_to, GenerationMode, GenerationRequest, GoBigRequest,
    ImageToImageRequest, InpaintingRequest, TextToImageRequest, UpscaleRequest, ValidationError,
};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    protocol::SessionError,
    session::{self, Session},
    transport::{decode_image, encode_image, ImageArrayResponse, ImageResponse},
    AppState,
};

/// The streaming generation modes, one per websocket route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    TextToImage,
    ImageToImage,
    Inpainting,
    GoBig,
}

impl Endpoint {
    /// Decodes this endpoint's request, runs it, and returns the `result` payload.
    pub async fn handle(
        self,
        session: &mut Session,
        state: &AppState,
        cancel: &CancellationToken,
    ) -> Result<Value, SessionError> {
        match self {
            Self::TextToImage => {
                let request: TextToImageRequest = session.recv_request().await?;
                request.validate()?;
                let mode = request.mode()?;
                generate(session, state, &request.generation, mode, cancel).await
            }
            Self::ImageToImage => {
                let mut request: ImageToImageRequest = session.recv_request().await?;
                request.validate()?;
                let source = std::mem::take(&mut request.source_image);
                let shape = request.clone();
                let mode = blocking(move || Ok(shape.mode(decode_image(&source)?)?)).await?;
                generate(session, state, &request.generation, mode, cancel).await
            }
            Self::Inpainting => {
                let mut request: InpaintingRequest = session.recv_request().await?;
                request.validate()?;
                let source = std::mem::take(&mut request.source_image);
                let mask = request.mask.take();
                let shape = request.clone();
                let mode = blocking(move || {
                    let source = decode_image(&source)?;
                    let mask = mask.as_deref().map(decode_image).transpose()?;
                    Ok(shape.mode(source, mask)?)
                })
                .await?;
                generate(session, state, &request.generation, mode, cancel).await
            }
            Self::GoBig => {
                let mut request: GoBigRequest = session.recv_request().await?;
                request.validate()?;
                let image = std::mem::take(&mut request.image);
                let shape = request.clone();
                let upscaled =
                    blocking(move || Ok(gobig::prepare(&shape, decode_image(&image)?)?)).await?;
                let (progress, receiver) = progress_channel();
                let image = session
                    .drive(
                        gobig::refine(state.scheduler.model(), &request, &upscaled, &progress, cancel),
                        receiver,
                        cancel,
                    )
                    .await?;
                let response = ImageResponse {
                    image: blocking(move || Ok(encode_image(&image)?)).await?,
                };
                Ok(serde_json::to_value(response).map_err(anyhow::Error::from)?)
            }
        }
    }
}

/// Runs image decoding, resizing or encoding off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, SessionError>
where
    F: FnOnce() -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SessionError::Unexpected(anyhow!("image task failed: {e}")))?
}

async fn generate(
    session: &mut Session,
    state: &AppState,
    request: &GenerationRequest,
    mode: GenerationMode,
    cancel: &CancellationToken,
) -> Result<Value, SessionError> {
    let (width, height) = mode.dimensions();
    debug!(
        num_variants = request.num_variants,
        batch_size = request.batch_size,
        width,
        height,
        "Generation request accepted"
    );

    let (progress, receiver) = progress_channel();
    let images = session
        .drive(
            state.scheduler.run(request, Arc::new(mode), &progress, cancel),
            receiver,
            cancel,
        )
        .await?;

    let images = blocking(move || {
        Ok(images.iter().map(encode_image).collect::<anyhow::Result<Vec<_>>>()?)
    })
    .await?;
    Ok(serde_json::to_value(ImageArrayResponse { images }).map_err(anyhow::Error::from)?)
}

pub async fn text_to_image(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| session::serve(socket, state, Endpoint::TextToImage))
}

pub async fn image_to_image(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| session::serve(socket, state, Endpoint::ImageToImage))
}

pub async fn inpainting(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| session::serve(socket, state, Endpoint::Inpainting))
}

pub async fn large_upscale(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| session::serve(socket, state, Endpoint::GoBig))
}

#[derive(Debug, Error)]
enum UpscaleError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Encode(#[from] anyhow::Error),
}

fn run_upscale(request: UpscaleRequest) -> Result<String, UpscaleError> {
    let source = decode_image(&request.image)?;
    let upscaled = upscale_to(
        source,
        request.target_width,
        request.target_height,
        request.maximize,
        request.upscaler,
    )?;
    Ok(encode_image(&upscaled)?)
}

pub async fn upscale(Json(request): Json<UpscaleRequest>) -> Response {
    match tokio::task::spawn_blocking(move || run_upscale(request)).await {
        Ok(Ok(image)) => Json(ImageResponse { image }).into_response(),
        Ok(Err(UpscaleError::Invalid(e))) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Ok(Err(UpscaleError::Encode(e))) => {
            warn!(error = ?e, "Upscale failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Upscale failed").into_response()
        }
        Err(e) => {
            warn!(error = %e, "Upscale task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Upscale failed").into_response()
        }
    }
}

pub async fn ping() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn image_work_leaves_the_runtime_free() {
        let work = blocking(|| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        let ticker = async {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        tokio::select! {
            biased;
            () = ticker => {}
            _ = work => panic!("image work held up the runtime"),
        }
    }

    #[tokio::test]
    async fn panicking_image_work_is_unexpected() {
        let err = blocking::<(), _>(|| panic!("bad pixels")).await.unwrap_err();
        assert!(matches!(err, SessionError::Unexpected(_)));
    }
}
