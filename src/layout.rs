//! Layout (spec §3): a concrete selection of templates × replica counts ×
//! microbatch assignments for the current worker set, plus the
//! reconfiguration entry point the ExecutionEngine calls into.

use std::collections::BTreeMap;

use crate::template::PipelineTemplate;

/// One running replica of a template: which template, which replica index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplicaId {
    pub template_id: String,
    pub replica_index: usize,
}

/// For one global batch: every replica in play, plus the microbatch count
/// assigned to each. `Σ microbatches == global_batch / microbatch`.
#[derive(Debug, Clone)]
pub struct Layout {
    pub templates: BTreeMap<String, PipelineTemplate>,
    pub replicas: Vec<ReplicaId>,
    pub microbatches: BTreeMap<ReplicaId, u32>,
}

impl Layout {
    pub fn total_microbatches(&self) -> u32 {
        self.microbatches.values().sum()
    }

    pub fn microbatches_for(&self, replica: &ReplicaId) -> Option<u32> {
        self.microbatches.get(replica).copied()
    }

    pub fn template_for(&self, replica: &ReplicaId) -> Option<&PipelineTemplate> {
        self.templates.get(&replica.template_id)
    }

    /// Number of distinct templates actually in use by this layout — the
    /// robustness measure the Instantiator's `threshold` constrains.
    pub fn distinct_template_count(&self) -> usize {
        self.replicas
            .iter()
            .map(|r| &r.template_id)
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }
}

/// Out-of-scope collaborators bundled per spec §11's "boost" seam: the
/// model, optimizer, and dataloader an `ExecutionEngine::reconfigure` call
/// hands back after rebuilding pipelines against a new layout.
pub trait ReconfigurableState: Send {
    type Model;
    type Optimizer;
    type DataLoader;

    /// Rebuild `(model, optimizer, dataloader)` against `templates`,
    /// consuming the current state and producing fresh state bound to a
    /// new communicator (spec §4.6 "Reconfigure").
    fn reconfigure(
        self,
        templates: &BTreeMap<String, PipelineTemplate>,
    ) -> (Self::Model, Self::Optimizer, Self::DataLoader);
}
