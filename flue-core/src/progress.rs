use tokio::sync::mpsc;

use crate::BatchPlan;

/// Receives progress fractions in `[0, 1)` for the request being processed.
pub type ProgressSender = mpsc::UnboundedSender<f64>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<f64>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Tracks step progress across all invocations of one candidate attempt.
///
/// A fresh aggregator is built for every candidate batch size, so a retried
/// request restarts from its own total instead of carrying stale steps over.
#[derive(Debug)]
pub struct ProgressAggregator {
    steps_per_invocation: usize,
    total_steps: usize,
    completed_steps: usize,
    sender: ProgressSender,
}

impl ProgressAggregator {
    pub fn new(num_invocations: usize, steps_per_invocation: usize, sender: ProgressSender) -> Self {
        Self {
            steps_per_invocation,
            total_steps: num_invocations * steps_per_invocation,
            completed_steps: 0,
            sender,
        }
    }

    pub fn for_plan(plan: &BatchPlan, num_inference_steps: usize, sender: ProgressSender) -> Self {
        Self::new(plan.num_invocations(), num_inference_steps, sender)
    }

    /// Reporter for the next invocation. It is `'static` so it can move into a blocking task.
    pub fn reporter(&self) -> StepReporter {
        StepReporter {
            offset: self.completed_steps,
            steps_per_invocation: self.steps_per_invocation,
            total_steps: self.total_steps,
            last: None,
            sender: self.sender.clone(),
        }
    }

    /// Marks the current invocation as finished.
    pub fn finish_invocation(&mut self) {
        self.completed_steps =
            (self.completed_steps + self.steps_per_invocation).min(self.total_steps);
    }

    pub fn completed_steps(&self) -> usize {
        self.completed_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

/// Step callback handed to one generation invocation.
#[derive(Debug)]
pub struct StepReporter {
    offset: usize,
    steps_per_invocation: usize,
    total_steps: usize,
    last: Option<f64>,
    sender: ProgressSender,
}

impl StepReporter {
    /// Called with the zero-based index of the denoising iteration about to run,
    /// which equals the number of steps already completed in this invocation.
    pub fn step(&mut self, step: usize) {
        let done = self.offset + step.min(self.steps_per_invocation);
        if done >= self.total_steps {
            return;
        }
        let fraction = done as f64 / self.total_steps as f64;
        if self.last.is_some_and(|last| fraction < last) {
            return;
        }
        self.last = Some(fraction);
        // A closed receiver means the session is gone; cancellation handles the rest.
        let _ = self.sender.send(fraction);
    }
}
