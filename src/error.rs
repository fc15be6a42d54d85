/// Errors from pipeline template construction and validation.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("non-contiguous layer coverage: stage {stage_idx} ends at {end}, next starts at {next_start}")]
    NonContiguousLayers {
        stage_idx: usize,
        end: usize,
        next_start: usize,
    },
    #[error("empty stages list")]
    EmptyStages,
    #[error("stage {stage_idx}: layer_start ({start}) >= layer_end ({end})")]
    InvalidLayerRange {
        stage_idx: usize,
        start: usize,
        end: usize,
    },
    #[error("stages cover {covered} layers but total_layers is {total}")]
    LayerCountMismatch { covered: usize, total: usize },
    #[error("first stage must start at layer 0, but starts at {start}")]
    LayerStartNotZero { start: usize },
    #[error("stage {stage_idx} has wrong stage_idx field: {actual}")]
    WrongStageIndex { stage_idx: usize, actual: usize },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from schedule generation.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("zero stages")]
    ZeroStages,
    #[error("zero microbatches")]
    ZeroMicroBatches,
}

/// Errors from the Instantiator (C5).
#[derive(Debug, thiserror::Error)]
pub enum InstantiatorError {
    #[error("no templates available")]
    EmptyTemplatePool,
    #[error("no admissible template multiset covers {world_size} workers")]
    NoFeasiblePartition { world_size: usize },
    #[error(
        "best partition uses only {found} distinct templates, threshold requires {threshold}"
    )]
    ThresholdNotMet { found: usize, threshold: usize },
    #[error("global microbatch count {global} is not evenly divisible across the chosen replicas")]
    MicrobatchSplitFailed { global: u32 },
}

/// Errors surfaced by the typed P2P transport (C2).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer connection for rank {rank} was torn down: {reason}")]
    CommunicatorTorn { rank: usize, reason: String },
    #[error(
        "shape mismatch on buffer {buffer_id}: cached receive buffer has shape {expected:?}, \
         payload has shape {actual:?}"
    )]
    ShapeMismatch {
        buffer_id: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("dtype mismatch on buffer {buffer_id}: expected {expected:?}, got {actual:?}")]
    DTypeMismatch {
        buffer_id: usize,
        expected: crate::tensor::DType,
        actual: crate::tensor::DType,
    },
    #[error("no peer registered for rank {0}")]
    NoSuchPeer(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors from a pipeline stage's owned compute (C3).
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("executor init failed: {0}")]
    InitFailed(String),
    #[error("forward pass failed for buffer {buffer_id}: {reason}")]
    ForwardFailed { buffer_id: usize, reason: String },
    #[error("backward pass failed for buffer {buffer_id}: {reason}")]
    BackwardFailed { buffer_id: usize, reason: String },
    #[error("dataloader iterator exhausted")]
    IteratorExhausted,
    #[error("optimizer step failed: {0}")]
    OptimizerFailed(String),
}

/// Errors raised during [`ExecutionEngine`](crate::execution_engine::ExecutionEngine) setup.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("prepare() was already called for this engine")]
    AlreadyPrepared,
    #[error("execute() was called before prepare()")]
    NotPrepared,
    #[error("no valid templates remain after the sharding sanity check")]
    NoValidTemplates,
    #[error(
        "world size {world_size} is smaller than min_nodes ({min_nodes}) * tp_width ({tp_width})"
    )]
    WorldTooSmall {
        world_size: usize,
        min_nodes: usize,
        tp_width: usize,
    },
}

/// Top-level pipeline-trainer error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("instantiator error: {0}")]
    Instantiator(#[from] InstantiatorError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("stage error: {0}")]
    Stage(#[from] StageError),
    #[error("setup error: {0}")]
    Setup(#[from] SetupError),
    #[error(
        "dataloader iterator was invalidated by a prior reconfiguration; rebuild it before \
         calling execute() again"
    )]
    IteratorInvalidated,
    #[error("pipeline encountered an instruction with no handler: {0:?}")]
    UnknownInstruction(crate::tensor::InstructionKind),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
