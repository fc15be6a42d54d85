//! Configuration (ambient stack, SPEC_FULL.md §10): where an
//! `ExecutionEngine` gets its rank, world size, base directory, and the
//! channel it listens on for reconfiguration notifications.
//!
//! Grounded in the teacher's `OrchestratorConfig` (a plain struct read once
//! at startup) plus `StageConfig`'s rank/tag fields — generalized into a
//! trait so tests can swap in a fake without touching environment variables
//! or a real rendezvous service.

use std::path::PathBuf;

use tokio::sync::Notify;

use crate::error::PipelineError;

/// Distributed placement info resolved at startup: this process's rank and
/// the total number of ranks in the current world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistInfo {
    pub my_rank: usize,
    pub world_size: usize,
}

/// Out-of-scope collaborator (SPEC_FULL.md §9 decision: `my_rank` is a
/// plain field derived from this trait at `prepare()` time, not recomputed
/// per call).
pub trait ConfigurationEngine: Send + Sync {
    fn is_master(&self) -> bool;
    fn tag(&self) -> &str;
    fn base_dir(&self) -> &std::path::Path;
    fn world_size(&self) -> usize;
    fn dist_info(&self) -> DistInfo;

    /// Block until the distributed communicator for `dist_info()` is ready.
    fn init_distributed(&self) -> Result<(), PipelineError>;

    /// A notification that fires when this process should reconfigure
    /// (SPEC_FULL.md §5: a one-shot notification channel rather than a
    /// polled boolean).
    fn reconfiguration_notify(&self) -> std::sync::Arc<Notify>;
}

/// Minimal production-shaped implementation: rank/world size fixed at
/// construction, reconfiguration fired explicitly by whoever holds the
/// `Notify` handle (e.g. a watcher task in `execution_engine`).
pub struct StaticConfigurationEngine {
    pub tag: String,
    pub base_dir: PathBuf,
    pub dist_info: DistInfo,
    pub notify: std::sync::Arc<Notify>,
}

impl StaticConfigurationEngine {
    pub fn new(tag: impl Into<String>, base_dir: PathBuf, dist_info: DistInfo) -> Self {
        Self {
            tag: tag.into(),
            base_dir,
            dist_info,
            notify: std::sync::Arc::new(Notify::new()),
        }
    }
}

impl ConfigurationEngine for StaticConfigurationEngine {
    fn is_master(&self) -> bool {
        self.dist_info.my_rank == 0
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn base_dir(&self) -> &std::path::Path {
        &self.base_dir
    }

    fn world_size(&self) -> usize {
        self.dist_info.world_size
    }

    fn dist_info(&self) -> DistInfo {
        self.dist_info
    }

    fn init_distributed(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn reconfiguration_notify(&self) -> std::sync::Arc<Notify> {
        self.notify.clone()
    }
}
