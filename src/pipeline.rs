//! Pipeline (C4, spec §4.4): binds one stage's `Schedule`, `Transport`, and
//! `StageRuntime` together and drives one global batch tick by tick.
//!
//! Grounded in the teacher's `Orchestrator::run_inference` loop (walk a
//! schedule's steps in order, dispatch each to the stage), generalized from
//! inference-only forward ops to the full load/forward/backward/optimizer
//! instruction set.

use tracing::{info, info_span, Instrument};

use crate::error::PipelineError;
use crate::schedule::{Instruction, Schedule};
use crate::stage_runtime::StageRuntime;
use crate::tensor::OwnedTensor;
use crate::transport::Transport;

/// One stage's execution context: its slice of the schedule, its transport
/// links, and its runtime state.
pub struct Pipeline {
    stage_index: usize,
    schedule: Schedule,
    transport: Transport,
    runtime: StageRuntime,
    global_step: u64,
}

impl Pipeline {
    pub fn new(stage_index: usize, schedule: Schedule, transport: Transport, runtime: StageRuntime) -> Self {
        Self {
            stage_index,
            schedule,
            transport,
            runtime,
            global_step: 0,
        }
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Drive one global batch: every tick of this stage's schedule, in
    /// order (spec §4.4). Returns the mean training loss reported by the
    /// last stage, if this pipeline owns it.
    pub async fn train(&mut self) -> Result<Option<f64>, PipelineError> {
        self.runtime.begin_batch();

        let stage_schedule = self
            .schedule
            .stage(self.stage_index)
            .ok_or_else(|| PipelineError::Setup(crate::error::SetupError::WorldTooSmall {
                world_size: self.schedule.num_stages,
                min_nodes: self.stage_index + 1,
                tp_width: 1,
            }))?
            .clone();

        for (tick, instrs) in stage_schedule.steps.iter().enumerate() {
            let span = info_span!("pipeline_tick", stage = self.stage_index, tick, global_step = self.global_step);
            self.run_tick(instrs).instrument(span).await?;
            self.global_step += 1;
        }

        self.runtime.optimizer_step();

        let mean_loss = self.runtime.mean_loss();
        if let Some(loss) = mean_loss {
            info!(stage = self.stage_index, loss, lr = self.runtime.current_lr(), "batch complete");
        }
        Ok(mean_loss)
    }

    async fn run_tick(&mut self, instrs: &[Instruction]) -> Result<(), PipelineError> {
        let mut pending_grad_seeds: Option<Vec<OwnedTensor>> = None;
        let mut pending_input_grads: Option<Vec<OwnedTensor>> = None;

        for instr in instrs {
            match *instr {
                Instruction::LoadMicrobatch { buffer_id } => {
                    self.runtime.load_microbatch(buffer_id)?;
                }
                Instruction::RecvActivation { buffer_id } => {
                    let tensors = self.transport.recv_activation(buffer_id).await?;
                    self.runtime.set_inputs(buffer_id, tensors);
                }
                Instruction::Forward { buffer_id } => {
                    self.runtime.forward_pass(buffer_id)?;
                }
                Instruction::SendActivation { buffer_id } => {
                    let tensors = self.runtime.outputs(buffer_id).to_vec();
                    self.transport.send_activation(buffer_id, &tensors).await?;
                }
                Instruction::RecvGradient { buffer_id } => {
                    pending_grad_seeds = Some(self.transport.recv_gradient(buffer_id).await?);
                }
                Instruction::Backward { buffer_id } => {
                    pending_input_grads = self.runtime.backward_pass(buffer_id, pending_grad_seeds.take())?;
                }
                Instruction::SendGradient { buffer_id } => {
                    let grads = pending_input_grads.take().ok_or_else(|| {
                        PipelineError::UnknownInstruction(instr.kind())
                    })?;
                    self.transport.send_gradient(buffer_id, &grads).await?;
                    self.runtime.clear_inputs(buffer_id);
                }
                Instruction::OptimizerStep => {
                    self.runtime.optimizer_step();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use super::*;
    use crate::model::fakes::{FakeDataLoader, FakeLrScheduler, FakeOptimizer, IdentityLayer, ZeroAutograd};
    use crate::schedule::num_pipe_buffers;
    use crate::tensor::DType;
    use crate::transport::mock::channel_pair;

    fn make_stage_runtime(is_first: bool, is_last: bool, buffers: usize, microbatches: u32) -> StageRuntime {
        let loader: Option<Box<dyn crate::model::DataLoader>> = if is_first || is_last {
            let batches = (0..microbatches)
                .map(|_| vec![OwnedTensor::zeros_like(vec![4], DType::F32, false)])
                .collect::<VecDeque<_>>();
            Some(Box::new(FakeDataLoader { batches }))
        } else {
            None
        };
        StageRuntime::new(
            0,
            is_first,
            is_last,
            vec![Box::new(IdentityLayer)],
            Box::new(FakeOptimizer {
                steps: 0,
                overflow_on_step: None,
            }),
            Box::new(FakeLrScheduler { lr: 0.1, decay: 1.0 }),
            Arc::new(ZeroAutograd),
            loader,
            buffers,
        )
    }

    #[tokio::test]
    async fn two_stage_pipeline_completes_a_batch() {
        let num_stages = 2;
        let num_microbatches = 4;
        let schedule = Schedule::generate(num_stages, num_microbatches).unwrap();

        let (link_a, link_b) = channel_pair();
        let transport_0 = Transport::new(0, None, Some(Box::new(link_a)));
        let transport_1 = Transport::new(1, Some(Box::new(link_b)), None);

        let buf0 = num_pipe_buffers(num_stages, 0, num_microbatches);
        let buf1 = num_pipe_buffers(num_stages, 1, num_microbatches);

        let runtime_0 = make_stage_runtime(true, false, buf0, num_microbatches);
        let runtime_1 = make_stage_runtime(false, true, buf1, num_microbatches);

        let mut pipeline_0 = Pipeline::new(0, schedule.clone(), transport_0, runtime_0);
        let mut pipeline_1 = Pipeline::new(1, schedule, transport_1, runtime_1);

        let (r0, r1) = tokio::join!(pipeline_0.train(), pipeline_1.train());
        assert!(r0.unwrap().is_none(), "non-last stage reports no loss");
        assert!(r1.unwrap().is_some(), "last stage reports a mean loss");
    }
}
