//! ExecutionEngine (C6, spec §4.6): orchestrates `prepare`/`execute`/
//! `reconfigure` for one rank, and runs the daemonic watcher task that
//! notices a torn-down peer and signals reconfiguration.
//!
//! Grounded in the teacher's `Orchestrator` (owns the lifecycle: init,
//! establish channels, run, shut down) — re-scoped from a central
//! controller driving every stage over the wire to a per-rank engine that
//! drives its own `Pipeline`, since spec §4.6 describes one engine instance
//! per worker rather than a single host-side conductor.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::config_engine::ConfigurationEngine;
use crate::error::{PipelineError, SetupError, TransportError};
use crate::instantiator::Instantiator;
use crate::layout::Layout;
use crate::pipeline::Pipeline;
use crate::template::{PipelineTemplate, TemplatePlanner};

/// Per-rank lifecycle controller (spec §4.6).
pub struct ExecutionEngine<C: ConfigurationEngine> {
    config: std::sync::Arc<C>,
    planner: Box<dyn TemplatePlanner>,
    instantiator: Instantiator,
    min_nodes: usize,
    max_nodes: usize,
    layout: Option<Layout>,
    /// Set once a `CommunicatorTorn` error surfaces out of `pipeline.train()`
    /// or the reconfiguration flag is observed set at the top of a batch;
    /// cleared by `reconfigure()` (spec §4.6 step 2, §8 testable property).
    iterator_invalidated: bool,
}

impl<C: ConfigurationEngine + 'static> ExecutionEngine<C> {
    pub fn new(
        config: std::sync::Arc<C>,
        planner: Box<dyn TemplatePlanner>,
        instantiator: Instantiator,
        min_nodes: usize,
        max_nodes: usize,
    ) -> Self {
        Self {
            config,
            planner,
            instantiator,
            min_nodes,
            max_nodes,
            layout: None,
            iterator_invalidated: false,
        }
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    /// Whether a prior `CommunicatorTorn` or reconfiguration signal has
    /// invalidated the dataloader iterator (spec §8 testable property).
    pub fn iterator_invalidated(&self) -> bool {
        self.iterator_invalidated
    }

    /// `prepare()` (spec §4.6): enumerate candidate templates, drop any
    /// that fail the sharding sanity check, and instantiate a layout for
    /// the current world size. Fails if called twice without a
    /// `reconfigure()` in between.
    pub fn prepare(&mut self, global_microbatches: u32) -> Result<(), PipelineError> {
        if self.layout.is_some() {
            return Err(SetupError::AlreadyPrepared.into());
        }

        let world_size = self.config.world_size();
        let dist_info = self.config.dist_info();
        if world_size < self.min_nodes {
            return Err(SetupError::WorldTooSmall {
                world_size,
                min_nodes: self.min_nodes,
                tp_width: 1,
            }
            .into());
        }

        let templates = self.valid_templates();
        if templates.is_empty() {
            return Err(SetupError::NoValidTemplates.into());
        }

        let layout = self
            .instantiator
            .instantiate(&templates, world_size, global_microbatches)?;
        info!(
            my_rank = dist_info.my_rank,
            world_size,
            replicas = layout.replicas.len(),
            "execution engine prepared"
        );
        self.layout = Some(layout);
        Ok(())
    }

    /// `reconfigure()` (spec §4.6): recompute a layout from the template
    /// pool without a full restart, discarding the previous one.
    pub fn reconfigure(&mut self, global_microbatches: u32) -> Result<(), PipelineError> {
        self.layout = None;
        self.iterator_invalidated = false;
        let world_size = self.config.world_size();
        warn!(world_size, "reconfiguring after peer loss or resize");
        self.prepare(global_microbatches)
    }

    fn valid_templates(&self) -> BTreeMap<String, PipelineTemplate> {
        self.planner
            .generate_templates(self.min_nodes, self.max_nodes)
            .into_iter()
            .filter_map(|t| match t.validate() {
                Ok(()) => Some((t.template_id.clone(), t)),
                Err(e) => {
                    warn!(template_id = %t.template_id, error = %e, "dropping template that failed sanity check");
                    None
                }
            })
            .collect()
    }

    /// `execute()` (spec §4.6): drive `pipeline` for `num_batches` global
    /// batches. The reconfiguration flag is observed only at the top of
    /// each batch (spec §5: "between instructions is not a cancellation
    /// point") — never raced against an in-flight `pipeline.train()`. A
    /// `CommunicatorTorn` surfacing from `train()` itself (the watcher tore
    /// down the transport mid-batch) is the only recovered transport error
    /// (spec §7): it is converted to a graceful `IteratorInvalidated`
    /// result rather than propagated. Returns the per-batch loss reported
    /// by the last stage (`None` on non-last stages).
    pub async fn execute(
        &mut self,
        pipeline: &mut Pipeline,
        num_batches: u32,
    ) -> Result<Vec<Option<f64>>, PipelineError> {
        if self.layout.is_none() {
            return Err(SetupError::NotPrepared.into());
        }

        let notify = self.config.reconfiguration_notify();
        let mut losses = Vec::with_capacity(num_batches as usize);

        for batch in 0..num_batches {
            if self.iterator_invalidated {
                warn!(batch, "dataloader iterator already invalidated by a prior reconfiguration");
                return Err(PipelineError::IteratorInvalidated);
            }

            // Non-blocking check for an already-fired notification: a
            // `Notify` stores at most one permit, so this completes
            // immediately unless a `notify_one()` truly happened before we
            // got here. It never waits mid-batch.
            if tokio::time::timeout(Duration::from_millis(0), notify.notified())
                .await
                .is_ok()
            {
                warn!(batch, "reconfiguration flag observed at top of batch");
                self.iterator_invalidated = true;
                return Err(PipelineError::IteratorInvalidated);
            }

            match pipeline.train().await {
                Ok(loss) => losses.push(loss),
                Err(PipelineError::Transport(TransportError::CommunicatorTorn { rank, reason })) => {
                    warn!(batch, rank, reason = %reason, "communicator torn down mid-batch; reconfiguration required");
                    self.iterator_invalidated = true;
                    return Err(PipelineError::IteratorInvalidated);
                }
                Err(other) => return Err(other),
            }
        }
        Ok(losses)
    }

    /// Spawn the daemonic watcher task (spec §4.6 "Design Notes"): polls
    /// `detect_failure` and fires the engine's reconfiguration notification
    /// once, then exits. One-shot by construction — `Notify::notify_one`
    /// wakes at most the single `execute()` call waiting on it.
    pub fn spawn_watcher<F>(&self, mut detect_failure: F, poll_interval: Duration) -> tokio::task::JoinHandle<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let notify = self.config.reconfiguration_notify();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                if detect_failure() {
                    notify.notify_one();
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_engine::fakes::FakeConfigurationEngine;
    use crate::template::make_template;

    struct FixedPlanner {
        templates: Vec<PipelineTemplate>,
    }

    impl TemplatePlanner for FixedPlanner {
        fn generate_templates(&self, _min_nodes: usize, _max_nodes: usize) -> Vec<PipelineTemplate> {
            self.templates.clone()
        }
    }

    fn engine(world_size: usize, templates: Vec<PipelineTemplate>) -> ExecutionEngine<FakeConfigurationEngine> {
        let config = std::sync::Arc::new(FakeConfigurationEngine::new(0, world_size));
        ExecutionEngine::new(
            config,
            Box::new(FixedPlanner { templates }),
            Instantiator::new(1),
            1,
            8,
        )
    }

    #[test]
    fn prepare_succeeds_with_valid_templates() {
        let mut eng = engine(2, vec![make_template("t2", 2, 4)]);
        eng.prepare(8).unwrap();
        assert!(eng.layout().is_some());
    }

    #[test]
    fn prepare_twice_without_reconfigure_errors() {
        let mut eng = engine(2, vec![make_template("t2", 2, 4)]);
        eng.prepare(8).unwrap();
        let result = eng.prepare(8);
        assert!(matches!(result, Err(PipelineError::Setup(SetupError::AlreadyPrepared))));
    }

    #[test]
    fn invalid_templates_are_dropped() {
        let mut bad = make_template("broken", 2, 4);
        bad.total_layers = 999;
        let mut eng = engine(2, vec![bad]);
        let result = eng.prepare(8);
        assert!(matches!(result, Err(PipelineError::Setup(SetupError::NoValidTemplates))));
    }

    #[test]
    fn reconfigure_allows_re_instantiation() {
        let mut eng = engine(2, vec![make_template("t2", 2, 4)]);
        eng.prepare(8).unwrap();
        eng.reconfigure(8).unwrap();
        assert!(eng.layout().is_some());
    }

    #[tokio::test]
    async fn watcher_fires_notification_once() {
        let eng = engine(2, vec![make_template("t2", 2, 4)]);
        let notify = eng.config.reconfiguration_notify();
        let waiter = notify.clone();
        let waited = tokio::spawn(async move {
            waiter.notified().await;
        });

        let mut fired = false;
        let handle = eng.spawn_watcher(
            move || {
                if fired {
                    false
                } else {
                    fired = true;
                    true
                }
            },
            Duration::from_millis(1),
        );

        waited.await.unwrap();
        handle.await.unwrap();
    }
}
