use std::sync::Arc;

use anyhow::anyhow;
use image::{DynamicImage, GrayImage};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{PipelineError, StepReporter};

/// The mode-specific inputs of one generation request.
#[derive(Clone, Debug)]
pub enum GenerationMode {
    TextToImage {
        width: usize,
        height: usize,
    },
    /// `mask` comes from the source's alpha channel; white marks pixels to regenerate.
    ImageToImage {
        source: DynamicImage,
        strength: f64,
        mask: Option<GrayImage>,
    },
    /// `mask` is the explicit mask combined with the source's alpha mask.
    Inpainting {
        source: DynamicImage,
        strength: f64,
        mask: Option<GrayImage>,
    },
}

impl GenerationMode {
    /// Output size as `(width, height)`.
    pub fn dimensions(&self) -> (usize, usize) {
        match self {
            Self::TextToImage { width, height } => (*width, *height),
            Self::ImageToImage { source, .. } | Self::Inpainting { source, .. } => {
                (source.width() as usize, source.height() as usize)
            }
        }
    }
}

/// One call into the model: `num_images` copies of `prompt` generated together.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub prompt: String,
    pub num_images: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
    pub mode: Arc<GenerationMode>,
    pub cancel: CancellationToken,
}

/// A loaded generative model.
///
/// `run` blocks for the duration of the computation. `on_step` is called
/// before each denoising iteration with a non-decreasing step in
/// `0..num_inference_steps`; runs that skip leading iterations (image-to-image)
/// spread their reports over that range.
/// Implementations should stop with [`PipelineError::Cancelled`] once
/// `invocation.cancel` fires.
pub trait ModelLike: Send {
    fn run(
        &mut self,
        invocation: &Invocation,
        on_step: &mut dyn FnMut(usize),
    ) -> Result<Vec<DynamicImage>, PipelineError>;
}

/// Handle to the single model instance shared by every session.
///
/// The lock is taken per invocation and the guard travels into the blocking
/// task, so it is released when the computation returns even if the session
/// that started it has already been torn down.
#[derive(Clone)]
pub struct SharedModel(Arc<Mutex<Box<dyn ModelLike>>>);

impl SharedModel {
    pub fn new(model: impl ModelLike + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(model))))
    }

    pub async fn run(
        &self,
        invocation: Invocation,
        mut reporter: StepReporter,
    ) -> Result<Vec<DynamicImage>, PipelineError> {
        let cancel = invocation.cancel.clone();
        let mut model = tokio::select! {
            guard = Arc::clone(&self.0).lock_owned() => guard,
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        };
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let expected = invocation.num_images;
        debug!(num_images = expected, seed = ?invocation.seed, "Running generation");
        let images = tokio::task::spawn_blocking(move || {
            model.run(&invocation, &mut |step| reporter.step(step))
        })
        .await
        .map_err(|e| PipelineError::Failed(anyhow!("generation task failed: {e}")))??;

        if images.len() != expected {
            return Err(PipelineError::Failed(anyhow!(
                "model returned {} images, expected {}",
                images.len(),
                expected
            )));
        }
        Ok(images)
    }
}
