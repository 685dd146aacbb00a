use std::sync::Arc;

use image::DynamicImage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    BatchPlan, GenerationMode, GenerationRequest, Invocation, PipelineError, ProgressAggregator,
    ProgressSender, ScheduleError, SharedModel,
};

/// Runs a batched request against the shared model, shrinking the batch size
/// when the device runs out of memory.
#[derive(Clone)]
pub struct BatchScheduler {
    model: SharedModel,
}

impl BatchScheduler {
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    /// Generates `request.num_variants` images, ordered full batches first and
    /// the remainder batch last.
    ///
    /// Candidate batch sizes run from `min(batch_size, num_variants)` down to 1.
    /// Without `try_smaller_batch_on_fail` the first exhausted candidate is
    /// reported as [`ScheduleError::BatchSizeTooLarge`]; otherwise exhausting
    /// every candidate yields [`ScheduleError::InfeasibleConfiguration`].
    pub async fn run(
        &self,
        request: &GenerationRequest,
        mode: Arc<GenerationMode>,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<Vec<DynamicImage>, ScheduleError> {
        let start = request.batch_size.min(request.num_variants);

        for batch_size in (1..=start).rev() {
            let plan = BatchPlan::new(request.num_variants, batch_size);
            debug!(
                batch_size,
                full_batches = plan.num_full_batches,
                remainder = plan.remainder_size,
                "Trying batch plan"
            );

            match self.run_plan(request, &plan, &mode, progress, cancel).await {
                Ok(images) => {
                    info!(
                        batch_size,
                        num_images = images.len(),
                        "Generation finished"
                    );
                    return Ok(images);
                }
                Err(PipelineError::ResourceExhausted) if request.try_smaller_batch_on_fail => {
                    warn!(batch_size, "Batch size was too large, trying smaller");
                }
                Err(PipelineError::ResourceExhausted) => {
                    return Err(ScheduleError::BatchSizeTooLarge(batch_size));
                }
                Err(PipelineError::Cancelled) => return Err(ScheduleError::Cancelled),
                Err(PipelineError::Failed(e)) => return Err(ScheduleError::Pipeline(e)),
            }
        }

        Err(ScheduleError::InfeasibleConfiguration)
    }

    async fn run_plan(
        &self,
        request: &GenerationRequest,
        plan: &BatchPlan,
        mode: &Arc<GenerationMode>,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<Vec<DynamicImage>, PipelineError> {
        let mut aggregator =
            ProgressAggregator::for_plan(plan, request.num_inference_steps, progress.clone());
        let mut images = Vec::with_capacity(request.num_variants);

        for num_images in plan.invocation_sizes() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            // Each invocation gets its own seed so batches do not repeat each other.
            let invocation = Invocation {
                prompt: request.prompt.clone(),
                num_images,
                num_inference_steps: request.num_inference_steps,
                guidance_scale: request.guidance_scale,
                seed: request.seed.map(|seed| seed.wrapping_add(images.len() as u64)),
                mode: Arc::clone(mode),
                cancel: cancel.clone(),
            };
            images.extend(self.model.run(invocation, aggregator.reporter()).await?);
            aggregator.finish_invocation();
        }

        Ok(images)
    }
}
