//! Error types shared by the scheduler, the pipelines and the request decoders.

use thiserror::Error;

/// Failure of a single generation invocation.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The device could not fit the invocation (usually too many images at once).
    #[error("device ran out of memory")]
    ResourceExhausted,

    /// The invocation observed a cancelled token and stopped early.
    #[error("generation cancelled")]
    Cancelled,

    /// Anything else the model or its runtime reported.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl PipelineError {
    /// Classifies a runtime error message, mapping allocator failures to
    /// [`PipelineError::ResourceExhausted`].
    pub fn classify(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        let message = format!("{err:#}").to_lowercase();
        if message.contains("out of memory")
            || message.contains("out_of_memory")
            || message.contains("outofmemory")
            || message.contains("failed to allocate")
        {
            Self::ResourceExhausted
        } else {
            Self::Failed(err)
        }
    }
}

/// Terminal outcome of a batched generation request.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// A batch size failed and shrinking was not permitted.
    #[error(
        "Batch size {0} is too large, try a smaller batch size or enable try_smaller_batch_on_fail"
    )]
    BatchSizeTooLarge(usize),

    /// Even a batch of one did not fit.
    #[error("Requested image size is too large for the device, even a batch size of 1 failed")]
    InfeasibleConfiguration,

    /// The session went away while work was in flight.
    #[error("generation cancelled")]
    Cancelled,

    /// Unclassified pipeline failure.
    #[error("generation failed: {0}")]
    Pipeline(#[source] anyhow::Error),
}

impl ScheduleError {
    /// Domain errors are part of the session contract and are reported to the client verbatim.
    pub fn is_domain(&self) -> bool {
        matches!(self, Self::BatchSizeTooLarge(_) | Self::InfeasibleConfiguration)
    }
}

/// A request message that parsed as JSON but violates a field constraint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_detects_cuda_oom() {
        let err = anyhow::anyhow!("DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\")");
        assert!(matches!(
            PipelineError::classify(err),
            PipelineError::ResourceExhausted
        ));
    }

    #[test]
    fn classify_keeps_other_errors() {
        let err = anyhow::anyhow!("shape mismatch in matmul");
        assert!(matches!(PipelineError::classify(err), PipelineError::Failed(_)));
    }

    #[test]
    fn bounded_batch_message_names_size() {
        let message = ScheduleError::BatchSizeTooLarge(5).to_string();
        assert!(message.starts_with("Batch size 5 is too large"));
    }

    #[test]
    fn only_batch_errors_are_domain_errors() {
        assert!(ScheduleError::BatchSizeTooLarge(2).is_domain());
        assert!(ScheduleError::InfeasibleConfiguration.is_domain());
        assert!(!ScheduleError::Cancelled.is_domain());
    }
}
