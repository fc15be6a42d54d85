pub mod config_engine;
pub mod error;
pub mod execution_engine;
pub mod instantiator;
pub mod layout;
pub mod model;
pub mod pipeline;
pub mod schedule;
pub mod stage_runtime;
pub mod template;
pub mod tensor;
pub mod transport;

pub use config_engine::{ConfigurationEngine, DistInfo, StaticConfigurationEngine};
pub use error::{
    InstantiatorError, PipelineError, Result, ScheduleError, SetupError, StageError, TemplateError,
    TransportError,
};
pub use execution_engine::ExecutionEngine;
pub use instantiator::Instantiator;
pub use layout::{Layout, ReconfigurableState, ReplicaId};
pub use model::{Autograd, DataLoader, LastStageOutput, Layer, LrScheduler, Optimizer, StepOutcome};
pub use pipeline::Pipeline;
pub use schedule::{Instruction, Schedule, StageSchedule};
pub use stage_runtime::{MicrobatchBuffer, StageRuntime};
pub use template::{PipelineTemplate, StageSpec, TemplatePlanner};
pub use tensor::{DType, InstructionKind, MetadataEnvelope, OwnedTensor, TensorMeta};
pub use transport::{PeerLink, Transport};
