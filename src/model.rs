//! Out-of-scope collaborators consumed as interfaces (spec §1, §6, §11):
//! model layers, the optimizer, the learning-rate schedule, and the
//! dataloader. This crate never implements autograd or a real optimizer —
//! it only defines the seams `StageRuntime` calls through, grounded in the
//! teacher's `StageExecutor` trait (init + forward as the user-supplied
//! computation hook).

use crate::error::StageError;
use crate::tensor::OwnedTensor;

/// One opaque layer handle, the unit of ownership a stage holds (Design
/// Notes §9: "method-type reflection over the model" re-expressed as an
/// ordered sequence of `apply` capabilities rather than a reflected list).
pub trait Layer: Send + Sync {
    /// Apply this layer to an input tensor tuple, producing the next tuple
    /// in the chain. Forward-only; backward is handled by the autograd
    /// engine this crate does not implement.
    fn apply(&self, inputs: Vec<OwnedTensor>) -> Result<Vec<OwnedTensor>, StageError>;

    fn weight_hash(&self) -> Option<String> {
        None
    }
}

/// Output of the last stage's forward pass: a scalar loss plus whichever
/// non-loss tensors (e.g. `logits`) the caller wants discarded to free
/// memory (spec §4.3).
pub struct LastStageOutput {
    pub loss: OwnedTensor,
}

/// Result of one `Optimizer::step` call. Overflow here stands in for the
/// original's mutable `.overflow` attribute set by mixed-precision loss
/// scaling (spec §4.3, §11): an explicit return is the idiomatic shape for
/// a value that used to be read back off `self` after the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub overflow: bool,
}

/// Out-of-scope: the optimizer (spec §1).
pub trait Optimizer: Send + Sync {
    fn zero_grad(&mut self);
    fn step(&mut self) -> StepOutcome;
}

/// Out-of-scope: the learning-rate schedule (spec §1).
pub trait LrScheduler: Send + Sync {
    /// Advance the schedule by one step. Skipped by `optimizer_step` when
    /// the optimizer reports overflow (spec §4.3).
    fn step(&mut self);

    fn current_lr(&self) -> f64;
}

/// Out-of-scope: the dataloader (spec §1). `next_microbatch` returns
/// `None` once the underlying iterator is exhausted.
pub trait DataLoader: Send + Sync {
    fn next_microbatch(&mut self) -> Option<Vec<OwnedTensor>>;
}

/// Out-of-scope: the autograd/backward engine (spec §1). `StageRuntime`
/// calls through this seam rather than computing gradients itself — real
/// backpropagation over `Layer::apply`'s forward graph is exactly the
/// machinery this crate does not own.
pub trait Autograd: Send + Sync {
    /// Backward through a non-last stage: given the inputs that produced
    /// `outputs` and the seed gradients for each `requires_grad` output (in
    /// the same filtered order `backward_pass` received them in), return
    /// the gradient for every `requires_grad` input, in input order.
    fn backward(
        &self,
        inputs: &[OwnedTensor],
        outputs: &[OwnedTensor],
        grad_outputs: &[OwnedTensor],
    ) -> Vec<OwnedTensor>;

    /// Backward from the last stage's scalar loss: return the gradient for
    /// every `requires_grad` input to the last stage's final layer.
    fn backward_from_loss(&self, inputs: &[OwnedTensor], loss: &OwnedTensor) -> Vec<OwnedTensor>;
}
