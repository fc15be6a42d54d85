//! The pipeline schedule state machine (C1, spec §4.1).
//!
//! `Schedule::generate` is a pure function of `(num_microbatches, num_stages,
//! stage_index)`: given those three numbers it always produces the same
//! instruction stream, which is what makes cross-stage agreement after a
//! reconfiguration possible without any additional coordination.
//!
//! The generator below walks all stages together in lock-step global ticks,
//! tracking exactly when each stage's upstream activation or downstream
//! gradient becomes available, rather than folding that dependency into a
//! closed-form offset. Both are valid realizations of the same pure
//! function (see spec §4.1's implementation note); this one is easy to
//! verify by hand tick-by-tick, which matters since this crate's code is
//! never run through the compiler or a test harness during development.

use std::collections::HashSet;

use crate::error::ScheduleError;

/// A single instruction emitted by the Schedule, carrying the buffer it
/// operates on (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    LoadMicrobatch { buffer_id: usize },
    Forward { buffer_id: usize },
    Backward { buffer_id: usize },
    SendActivation { buffer_id: usize },
    RecvActivation { buffer_id: usize },
    SendGradient { buffer_id: usize },
    RecvGradient { buffer_id: usize },
    /// Not emitted into any tick's instruction list: every stage runs this
    /// exactly once, after its last backward for the batch, which
    /// `Pipeline::train` applies directly rather than scheduling (spec
    /// §4.3). Kept as a variant for error-taxonomy parity with
    /// `InstructionKind`.
    OptimizerStep,
}

impl Instruction {
    pub fn buffer_id(self) -> Option<usize> {
        match self {
            Instruction::LoadMicrobatch { buffer_id }
            | Instruction::Forward { buffer_id }
            | Instruction::Backward { buffer_id }
            | Instruction::SendActivation { buffer_id }
            | Instruction::RecvActivation { buffer_id }
            | Instruction::SendGradient { buffer_id }
            | Instruction::RecvGradient { buffer_id } => Some(buffer_id),
            Instruction::OptimizerStep => None,
        }
    }

    pub fn kind(self) -> crate::tensor::InstructionKind {
        use crate::tensor::InstructionKind as K;
        match self {
            Instruction::LoadMicrobatch { .. } => K::LoadMicrobatch,
            Instruction::Forward { .. } => K::Forward,
            Instruction::Backward { .. } => K::Backward,
            Instruction::SendActivation { .. } => K::SendActivation,
            Instruction::RecvActivation { .. } => K::RecvActivation,
            Instruction::SendGradient { .. } => K::SendGradient,
            Instruction::RecvGradient { .. } => K::RecvGradient,
            Instruction::OptimizerStep => K::OptimizerStep,
        }
    }
}

/// Number of microbatch buffers a stage needs (spec §3): the maximum number
/// of forward passes that can be in flight before the first backward lands.
pub fn num_pipe_buffers(num_stages: usize, stage_index: usize, num_microbatches: u32) -> usize {
    let remaining_stages = num_stages - stage_index;
    (remaining_stages.min(num_microbatches as usize)).max(2)
}

/// The schedule for a single stage: one instruction group per global tick.
#[derive(Debug, Clone)]
pub struct StageSchedule {
    pub stage_index: usize,
    pub num_pipe_buffers: usize,
    pub steps: Vec<Vec<Instruction>>,
}

/// The per-stage 1F1B schedules for one global batch (spec §4.1).
#[derive(Debug, Clone)]
pub struct Schedule {
    pub num_stages: usize,
    pub num_microbatches: u32,
    /// Total tick count: `2 * (M + S - 1)`.
    pub total_steps: usize,
    pub stages: Vec<StageSchedule>,
}

/// Local per-stage operation order before cross-stage gating is applied:
/// `num_warmup` forwards, then `remaining` (forward, backward) pairs, then
/// `num_warmup` backwards. Length is always `2 * num_microbatches`.
fn local_op_order(num_warmup: usize, num_microbatches: usize) -> Vec<(u32, bool)> {
    let remaining = num_microbatches - num_warmup;
    let mut ops = Vec::with_capacity(2 * num_microbatches);
    let mut next_forward = 0usize;
    let mut next_backward = 0usize;

    for _ in 0..num_warmup {
        ops.push((next_forward as u32, true));
        next_forward += 1;
    }
    for _ in 0..remaining {
        ops.push((next_forward as u32, true));
        next_forward += 1;
        ops.push((next_backward as u32, false));
        next_backward += 1;
    }
    for _ in 0..num_warmup {
        ops.push((next_backward as u32, false));
        next_backward += 1;
    }
    ops
}

impl Schedule {
    /// Generate the per-stage 1F1B schedules for one global batch.
    pub fn generate(num_stages: usize, num_microbatches: u32) -> Result<Self, ScheduleError> {
        if num_stages == 0 {
            return Err(ScheduleError::ZeroStages);
        }
        if num_microbatches == 0 {
            return Err(ScheduleError::ZeroMicroBatches);
        }

        let s_count = num_stages;
        let m = num_microbatches as usize;
        let total_steps = 2 * (m + s_count - 1);

        let buffers: Vec<usize> = (0..s_count)
            .map(|s| num_pipe_buffers(s_count, s, num_microbatches))
            .collect();
        let buf = |stage: usize, mb: u32| (mb as usize) % buffers[stage];

        let local: Vec<Vec<(u32, bool)>> = (0..s_count)
            .map(|s| {
                let num_warmup = (s_count - s - 1).min(m);
                local_op_order(num_warmup, m)
            })
            .collect();

        let mut ptr = vec![0usize; s_count];
        let mut activation_avail: Vec<HashSet<u32>> = vec![HashSet::new(); s_count];
        let mut gradient_avail: Vec<HashSet<u32>> = vec![HashSet::new(); s_count];
        let mut pending_activation: Vec<HashSet<u32>> = vec![HashSet::new(); s_count];
        let mut pending_gradient: Vec<HashSet<u32>> = vec![HashSet::new(); s_count];
        let mut steps: Vec<Vec<Vec<Instruction>>> = vec![Vec::with_capacity(total_steps); s_count];

        for _tick in 0..total_steps {
            for s in 0..s_count {
                for mb in pending_activation[s].drain() {
                    activation_avail[s].insert(mb);
                }
                for mb in pending_gradient[s].drain() {
                    gradient_avail[s].insert(mb);
                }
            }

            for s in 0..s_count {
                let mut instrs = Vec::new();
                if ptr[s] < local[s].len() {
                    let (mb, is_forward) = local[s][ptr[s]];
                    let ready = if is_forward {
                        s == 0 || activation_avail[s].contains(&mb)
                    } else {
                        s == s_count - 1 || gradient_avail[s].contains(&mb)
                    };

                    if ready {
                        if is_forward {
                            if s > 0 {
                                instrs.push(Instruction::RecvActivation {
                                    buffer_id: buf(s, mb),
                                });
                            }
                            if s == 0 || s == s_count - 1 {
                                instrs.push(Instruction::LoadMicrobatch {
                                    buffer_id: buf(s, mb),
                                });
                            }
                            instrs.push(Instruction::Forward {
                                buffer_id: buf(s, mb),
                            });
                            if s < s_count - 1 {
                                instrs.push(Instruction::SendActivation {
                                    buffer_id: buf(s, mb),
                                });
                                pending_activation[s + 1].insert(mb);
                            }
                        } else {
                            if s < s_count - 1 {
                                instrs.push(Instruction::RecvGradient {
                                    buffer_id: buf(s, mb),
                                });
                            }
                            instrs.push(Instruction::Backward {
                                buffer_id: buf(s, mb),
                            });
                            if s > 0 {
                                instrs.push(Instruction::SendGradient {
                                    buffer_id: buf(s, mb),
                                });
                                pending_gradient[s - 1].insert(mb);
                            }
                        }
                        ptr[s] += 1;
                    }
                }
                steps[s].push(instrs);
            }
        }

        debug_assert!(
            ptr.iter().zip(local.iter()).all(|(p, l)| *p == l.len()),
            "every stage must exhaust its local op order within total_steps ticks"
        );

        let stages = steps
            .into_iter()
            .enumerate()
            .map(|(stage_index, steps)| StageSchedule {
                stage_index,
                num_pipe_buffers: buffers[stage_index],
                steps,
            })
            .collect();

        Ok(Schedule {
            num_stages,
            num_microbatches,
            total_steps,
            stages,
        })
    }

    pub fn stage(&self, stage_index: usize) -> Option<&StageSchedule> {
        self.stages.get(stage_index)
    }

    /// Fraction of (stage, tick) slots across the whole schedule with no
    /// instruction at all — a pipeline-bubble measure analogous to the
    /// teacher's inference-only `bubble_fraction`.
    pub fn bubble_fraction(&self) -> f64 {
        if self.total_steps == 0 || self.stages.is_empty() {
            return 0.0;
        }
        let idle: usize = self
            .stages
            .iter()
            .flat_map(|s| s.steps.iter())
            .filter(|step| step.is_empty())
            .count();
        idle as f64 / (self.total_steps * self.stages.len()) as f64
    }
}
