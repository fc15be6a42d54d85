//! StageRuntime (C3, spec §4.3): owns the layers resident on one stage, the
//! optimizer, and the learning-rate schedule; executes
//! load/forward/backward/optimizer-step against microbatch buffers.
//!
//! Grounded in the teacher's `StageExecutor`/`StageRuntime` split (the
//! executor owns the user computation, the runtime owns the control flow
//! around it) — generalized from a forward-only inference stage to one
//! that also owns backward and the optimizer.

use std::sync::Arc;

use tracing::debug;

use crate::error::StageError;
use crate::model::{Autograd, DataLoader, LastStageOutput, Layer, LrScheduler, Optimizer};
use crate::tensor::OwnedTensor;

/// Slot holding, for one in-flight microbatch on one stage, the three
/// things spec §3 names: `inputs`, `outputs`, `labels`.
#[derive(Default, Clone)]
pub struct MicrobatchBuffer {
    pub inputs: Vec<OwnedTensor>,
    pub outputs: Vec<OwnedTensor>,
    pub labels: Vec<OwnedTensor>,
}

/// Runtime environment for a single pipeline stage.
pub struct StageRuntime {
    stage_index: usize,
    is_first: bool,
    is_last: bool,
    layers: Vec<Box<dyn Layer>>,
    optimizer: Box<dyn Optimizer>,
    lr_scheduler: Box<dyn LrScheduler>,
    autograd: Arc<dyn Autograd>,
    dataloader: Option<Box<dyn DataLoader>>,
    buffers: Vec<MicrobatchBuffer>,
    /// Running sum over every microbatch in the current batch; only
    /// meaningful (and only ever touched) at the last stage (spec §4.3
    /// supplemented: reset at `train()`'s start, published as a mean).
    total_loss: Option<f64>,
    loss_count: u32,
}

impl StageRuntime {
    pub fn new(
        stage_index: usize,
        is_first: bool,
        is_last: bool,
        layers: Vec<Box<dyn Layer>>,
        optimizer: Box<dyn Optimizer>,
        lr_scheduler: Box<dyn LrScheduler>,
        autograd: Arc<dyn Autograd>,
        dataloader: Option<Box<dyn DataLoader>>,
        num_pipe_buffers: usize,
    ) -> Self {
        Self {
            stage_index,
            is_first,
            is_last,
            layers,
            optimizer,
            lr_scheduler,
            autograd,
            dataloader,
            buffers: vec![MicrobatchBuffer::default(); num_pipe_buffers],
            total_loss: is_last.then_some(0.0),
            loss_count: 0,
        }
    }

    pub fn weight_hashes(&self) -> Vec<String> {
        self.layers.iter().filter_map(|l| l.weight_hash()).collect()
    }

    /// Install tensors received over the wire as `inputs[buf]` (used after a
    /// `Transport::recv_activation`).
    pub fn set_inputs(&mut self, buffer_id: usize, tensors: Vec<OwnedTensor>) {
        self.buffers[buffer_id].inputs = tensors;
    }

    pub fn outputs(&self, buffer_id: usize) -> &[OwnedTensor] {
        &self.buffers[buffer_id].outputs
    }

    /// Clear `inputs[buf]` after a successful SendGradient (spec §3: "its
    /// `inputs` slot is cleared after SendGradient (first stage never sends
    /// gradients)"). A no-op at the first stage, which never reaches this
    /// call since it never emits SendGradient.
    pub fn clear_inputs(&mut self, buffer_id: usize) {
        if !self.is_first {
            self.buffers[buffer_id].inputs.clear();
        }
    }

    /// Reset per-batch accumulators. Called at the top of `Pipeline::train`.
    pub fn begin_batch(&mut self) {
        if self.is_last {
            self.total_loss = Some(0.0);
            self.loss_count = 0;
        }
    }

    /// `load_microbatch(buf)` (spec §4.3): pull the next microbatch from
    /// the dataloader iterator, mark floating-point tensors as
    /// `requires_grad`, and store them in `inputs[buf]`.
    pub fn load_microbatch(&mut self, buffer_id: usize) -> Result<(), StageError> {
        let loader = self
            .dataloader
            .as_mut()
            .ok_or_else(|| StageError::InitFailed("load_microbatch called with no dataloader".into()))?;
        let mut tensors = loader.next_microbatch().ok_or(StageError::IteratorExhausted)?;
        for tensor in &mut tensors {
            tensor.requires_grad = tensor.dtype.is_floating_point();
        }
        if self.is_last {
            self.buffers[buffer_id].labels = tensors;
        } else {
            self.buffers[buffer_id].inputs = tensors;
        }
        Ok(())
    }

    /// `forward_pass(buf)` (spec §4.3): apply every owned layer in order;
    /// at the last stage, extract the scalar loss and accumulate it into
    /// `total_loss`; otherwise write the result into `outputs[buf]`.
    pub fn forward_pass(&mut self, buffer_id: usize) -> Result<(), StageError> {
        let inputs = self.buffers[buffer_id].inputs.clone();
        let mut tuple = inputs;
        for layer in &self.layers {
            tuple = layer.apply(tuple).map_err(|e| StageError::ForwardFailed {
                buffer_id,
                reason: e.to_string(),
            })?;
        }

        if self.is_last {
            let loss = tuple.into_iter().next().ok_or_else(|| StageError::ForwardFailed {
                buffer_id,
                reason: "last stage produced no loss tensor".into(),
            })?;
            // Remaining tuple entries (e.g. logits) are dropped here, per
            // spec §4.3's "extracts a scalar loss ... and discards logits".
            let output = LastStageOutput { loss };
            let scalar = loss_scalar(&output.loss);
            *self.total_loss.get_or_insert(0.0) += scalar;
            self.loss_count += 1;
            self.buffers[buffer_id].outputs = vec![output.loss];
        } else {
            self.buffers[buffer_id].outputs = tuple;
        }

        debug!(stage = self.stage_index, buffer_id, "forward pass complete");
        Ok(())
    }

    /// `backward_pass(buf)` (spec §4.3). On the last stage, backward from
    /// `loss`. Otherwise, backward over `outputs[buf]` filtered to
    /// `requires_grad` entries, using `grad_seeds` (from a prior
    /// RecvGradient) in the same filtered order. Returns the gradient for
    /// this stage's own `inputs[buf]`, filtered to `requires_grad` entries
    /// — `None` at the first stage, which never sends gradients upstream.
    pub fn backward_pass(
        &mut self,
        buffer_id: usize,
        grad_seeds: Option<Vec<OwnedTensor>>,
    ) -> Result<Option<Vec<OwnedTensor>>, StageError> {
        let buf = &self.buffers[buffer_id];
        let input_grads = if self.is_last {
            let loss = buf.outputs.first().ok_or_else(|| StageError::BackwardFailed {
                buffer_id,
                reason: "no loss stored for backward".into(),
            })?;
            self.autograd.backward_from_loss(&buf.inputs, loss)
        } else {
            let seeds = grad_seeds.ok_or_else(|| StageError::BackwardFailed {
                buffer_id,
                reason: "non-last stage backward requires seed gradients".into(),
            })?;
            self.autograd.backward(&buf.inputs, &buf.outputs, &seeds)
        };

        self.buffers[buffer_id].outputs.clear();
        debug!(stage = self.stage_index, buffer_id, "backward pass complete");

        Ok((!self.is_first).then_some(input_grads))
    }

    /// `optimizer_step` (spec §4.3): apply the optimizer, then advance the
    /// learning-rate schedule unless the optimizer reported overflow.
    pub fn optimizer_step(&mut self) {
        self.optimizer.zero_grad();
        let outcome = self.optimizer.step();
        if !outcome.overflow {
            self.lr_scheduler.step();
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_scheduler.current_lr()
    }

    /// Mean per-microbatch loss for the current batch (spec §11
    /// supplemented loss accumulation). `None` on non-last stages.
    pub fn mean_loss(&self) -> Option<f64> {
        match (self.total_loss, self.loss_count) {
            (Some(total), count) if count > 0 => Some(total / count as f64),
            _ => None,
        }
    }
}

/// Extract a scalar from a loss tensor. This crate does not implement
/// tensor reduction; it treats the first element of `data` as an f32.
fn loss_scalar(loss: &OwnedTensor) -> f64 {
    if loss.data.len() >= 4 {
        f32::from_le_bytes([loss.data[0], loss.data[1], loss.data[2], loss.data[3]]) as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fakes::{FakeDataLoader, FakeLrScheduler, FakeOptimizer, IdentityLayer, ZeroAutograd};
    use crate::tensor::DType;

    fn make_runtime(is_first: bool, is_last: bool, buffers: usize) -> StageRuntime {
        StageRuntime::new(
            0,
            is_first,
            is_last,
            vec![Box::new(IdentityLayer)],
            Box::new(FakeOptimizer {
                steps: 0,
                overflow_on_step: None,
            }),
            Box::new(FakeLrScheduler { lr: 0.1, decay: 0.9 }),
            Arc::new(ZeroAutograd),
            Some(Box::new(FakeDataLoader {
                batches: std::collections::VecDeque::from(vec![vec![OwnedTensor::zeros_like(
                    vec![4],
                    DType::F32,
                    false,
                )]]),
            })),
            buffers,
        )
    }

    #[test]
    fn load_sets_requires_grad_on_floating_point() {
        let mut rt = make_runtime(true, false, 2);
        rt.load_microbatch(0).unwrap();
        assert!(rt.buffers[0].inputs[0].requires_grad);
    }

    #[test]
    fn forward_pass_intermediate_stage_fills_outputs() {
        let mut rt = make_runtime(true, false, 2);
        rt.load_microbatch(0).unwrap();
        rt.forward_pass(0).unwrap();
        assert_eq!(rt.buffers[0].outputs.len(), 1);
        assert!(rt.mean_loss().is_none());
    }

    #[test]
    fn first_stage_backward_returns_none() {
        let mut rt = make_runtime(true, false, 2);
        rt.load_microbatch(0).unwrap();
        rt.forward_pass(0).unwrap();
        let seed = vec![OwnedTensor::zeros_like(vec![4], DType::F32, true)];
        let result = rt.backward_pass(0, Some(seed)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn non_first_non_last_backward_returns_some() {
        let mut rt = make_runtime(false, false, 2);
        rt.buffers[0].inputs = vec![OwnedTensor::zeros_like(vec![4], DType::F32, true)];
        rt.forward_pass(0).unwrap();
        let seed = vec![OwnedTensor::zeros_like(vec![4], DType::F32, true)];
        let result = rt.backward_pass(0, Some(seed)).unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn optimizer_step_skips_lr_on_overflow() {
        let mut rt = StageRuntime::new(
            0,
            true,
            false,
            vec![],
            Box::new(FakeOptimizer {
                steps: 0,
                overflow_on_step: Some(1),
            }),
            Box::new(FakeLrScheduler { lr: 1.0, decay: 0.5 }),
            Arc::new(ZeroAutograd),
            None,
            2,
        );
        rt.optimizer_step();
        assert_eq!(rt.current_lr(), 1.0, "lr should not decay on overflow");
    }

    #[test]
    fn outputs_cleared_after_backward() {
        let mut rt = make_runtime(false, false, 2);
        rt.buffers[0].inputs = vec![OwnedTensor::zeros_like(vec![4], DType::F32, true)];
        rt.forward_pass(0).unwrap();
        assert!(!rt.buffers[0].outputs.is_empty());
        let seed = vec![OwnedTensor::zeros_like(vec![4], DType::F32, true)];
        rt.backward_pass(0, Some(seed)).unwrap();
        assert!(rt.buffers[0].outputs.is_empty());
    }

    #[test]
    fn clear_inputs_noop_at_first_stage() {
        let mut rt = make_runtime(true, false, 2);
        rt.buffers[0].inputs = vec![OwnedTensor::zeros_like(vec![4], DType::F32, true)];
        rt.clear_inputs(0);
        assert!(!rt.buffers[0].inputs.is_empty());
    }

    #[test]
    fn clear_inputs_clears_non_first_stage() {
        let mut rt = make_runtime(false, false, 2);
        rt.buffers[0].inputs = vec![OwnedTensor::zeros_like(vec![4], DType::F32, true)];
        rt.clear_inputs(0);
        assert!(rt.buffers[0].inputs.is_empty());
    }

    /// A layer producing two tensors (loss, logits); only the first is kept
    /// on the last stage, matching `LastStageOutput`'s single-field shape.
    struct TwoTensorLayer;

    impl crate::model::Layer for TwoTensorLayer {
        fn apply(&self, inputs: Vec<OwnedTensor>) -> Result<Vec<OwnedTensor>, StageError> {
            let loss = inputs.into_iter().next().unwrap();
            let logits = OwnedTensor::zeros_like(vec![4], DType::F32, false);
            Ok(vec![loss, logits])
        }
    }

    #[test]
    fn last_stage_discards_non_loss_tensors() {
        let mut rt = StageRuntime::new(
            0,
            false,
            true,
            vec![Box::new(TwoTensorLayer)],
            Box::new(FakeOptimizer {
                steps: 0,
                overflow_on_step: None,
            }),
            Box::new(FakeLrScheduler { lr: 0.1, decay: 0.9 }),
            Arc::new(ZeroAutograd),
            None,
            2,
        );
        rt.buffers[0].inputs = vec![OwnedTensor::zeros_like(vec![4], DType::F32, true)];
        rt.forward_pass(0).unwrap();
        assert_eq!(rt.outputs(0).len(), 1, "logits are discarded, only loss kept");
    }
}
