//! Pipeline templates (spec §3): immutable, validated plans assigning
//! contiguous layer ranges to stages for a fixed node count.
//!
//! Grounded in the teacher's `ShardManifest`/`StageSpec` validation logic
//! (contiguity, ordering, full coverage), generalized from "one manifest
//! shared by the whole deployment" to "one template per candidate node
//! count", since the Instantiator (C5) picks among many.

use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

/// One stage's slice of the model within a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage_idx: usize,
    /// First layer (inclusive).
    pub layer_start: usize,
    /// Last layer (exclusive).
    pub layer_end: usize,
    /// Accelerators assigned to this stage, per node.
    pub accelerators_per_node: usize,
}

impl StageSpec {
    pub fn num_layers(&self) -> usize {
        self.layer_end - self.layer_start
    }
}

/// An immutable, validated plan: an ordered sequence of stages whose layer
/// ranges tile `[0, total_layers)` without gaps or overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub template_id: String,
    pub total_layers: usize,
    pub stages: Vec<StageSpec>,
}

impl PipelineTemplate {
    /// Number of nodes this template occupies — one node per stage.
    pub fn num_nodes(&self) -> usize {
        self.stages.len()
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Validate that stages are contiguous, correctly indexed, start at
    /// layer 0, and cover exactly `[0, total_layers)`.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.stages.is_empty() {
            return Err(TemplateError::EmptyStages);
        }

        for (i, stage) in self.stages.iter().enumerate() {
            if stage.stage_idx != i {
                return Err(TemplateError::WrongStageIndex {
                    stage_idx: i,
                    actual: stage.stage_idx,
                });
            }
            if stage.layer_start >= stage.layer_end {
                return Err(TemplateError::InvalidLayerRange {
                    stage_idx: i,
                    start: stage.layer_start,
                    end: stage.layer_end,
                });
            }
        }

        for i in 0..self.stages.len() - 1 {
            let end = self.stages[i].layer_end;
            let next_start = self.stages[i + 1].layer_start;
            if end != next_start {
                return Err(TemplateError::NonContiguousLayers {
                    stage_idx: i,
                    end,
                    next_start,
                });
            }
        }

        if self.stages[0].layer_start != 0 {
            return Err(TemplateError::LayerStartNotZero {
                start: self.stages[0].layer_start,
            });
        }

        let last_end = self.stages.last().unwrap().layer_end;
        if last_end != self.total_layers {
            return Err(TemplateError::LayerCountMismatch {
                covered: last_end,
                total: self.total_layers,
            });
        }

        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, TemplateError> {
        let template: Self = serde_json::from_str(json)?;
        template.validate()?;
        Ok(template)
    }

    pub fn to_json(&self) -> Result<String, TemplateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build a template with `num_stages` stages of `layers_per_stage`
    /// layers each, one accelerator per node. A convenience constructor for
    /// fixed, uniform shardings — most real planners will vary stage size.
    pub fn uniform(template_id: impl Into<String>, num_stages: usize, layers_per_stage: usize) -> Self {
        let stages = (0..num_stages)
            .map(|i| StageSpec {
                stage_idx: i,
                layer_start: i * layers_per_stage,
                layer_end: (i + 1) * layers_per_stage,
                accelerators_per_node: 1,
            })
            .collect();
        PipelineTemplate {
            template_id: template_id.into(),
            total_layers: num_stages * layers_per_stage,
            stages,
        }
    }
}

/// Out-of-scope collaborator (spec §1, §11): enumerates candidate templates
/// from a profile. This crate defines the seam; a real planner lives
/// outside it.
pub trait TemplatePlanner: Send + Sync {
    fn generate_templates(&self, min_nodes: usize, max_nodes: usize) -> Vec<PipelineTemplate>;
}

#[cfg(test)]
pub(crate) fn make_template(template_id: &str, num_stages: usize, layers_per_stage: usize) -> PipelineTemplate {
    PipelineTemplate::uniform(template_id, num_stages, layers_per_stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_template() {
        let t = make_template("t3x4", 3, 4);
        assert!(t.validate().is_ok());
        assert_eq!(t.num_nodes(), 3);
    }

    #[test]
    fn json_roundtrip() {
        let t = make_template("t2x6", 2, 6);
        let json = t.to_json().unwrap();
        let t2 = PipelineTemplate::from_json(&json).unwrap();
        assert_eq!(t2.template_id, "t2x6");
        assert_eq!(t2.stages[1].layer_start, 6);
    }

    #[test]
    fn empty_stages() {
        let t = PipelineTemplate {
            template_id: "empty".into(),
            total_layers: 0,
            stages: vec![],
        };
        assert!(matches!(t.validate(), Err(TemplateError::EmptyStages)));
    }

    #[test]
    fn non_contiguous_layers() {
        let mut t = make_template("gap", 2, 4);
        t.stages[1].layer_start = 5;
        assert!(matches!(
            t.validate(),
            Err(TemplateError::NonContiguousLayers { .. })
        ));
    }

    #[test]
    fn wrong_stage_index() {
        let mut t = make_template("bad-idx", 2, 4);
        t.stages[1].stage_idx = 5;
        assert!(matches!(
            t.validate(),
            Err(TemplateError::WrongStageIndex { .. })
        ));
    }

    #[test]
    fn layer_count_mismatch() {
        let mut t = make_template("mismatch", 2, 4);
        t.total_layers = 100;
        assert!(matches!(
            t.validate(),
            Err(TemplateError::LayerCountMismatch { .. })
        ));
    }

    #[test]
    fn layer_start_not_zero() {
        let mut t = make_template("shifted", 2, 5);
        t.stages[0].layer_start = 10;
        t.stages[0].layer_end = 15;
        t.stages[1].layer_start = 15;
        t.stages[1].layer_end = 20;
        assert!(matches!(
            t.validate(),
            Err(TemplateError::LayerStartNotZero { start: 10 })
        ));
    }

    #[test]
    fn invalid_layer_range() {
        let mut t = make_template("inverted", 2, 4);
        t.stages[0].layer_start = 10;
        t.stages[0].layer_end = 5;
        assert!(matches!(
            t.validate(),
            Err(TemplateError::InvalidLayerRange { .. })
        ));
    }
}
