//! Instantiator (C5, spec §4.5): given a pool of templates and the current
//! worker count, decides how many replicas of each template to run and how
//! to split the desired global microbatch count across them.

use std::collections::BTreeMap;

use crate::error::InstantiatorError;
use crate::layout::{Layout, ReplicaId};
use crate::template::PipelineTemplate;

/// Configuration for one instantiation decision.
#[derive(Debug, Clone, Copy)]
pub struct Instantiator {
    /// Minimum number of distinct templates the instantiation should be
    /// robust to losing, when a feasible arrangement allows it.
    pub fault_tolerance_threshold: usize,
}

impl Instantiator {
    pub fn new(fault_tolerance_threshold: usize) -> Self {
        Self {
            fault_tolerance_threshold,
        }
    }

    /// Choose replica counts per template and split `global_microbatches`
    /// across the chosen replicas, for the given `world_size`.
    pub fn instantiate(
        &self,
        templates: &BTreeMap<String, PipelineTemplate>,
        world_size: usize,
        global_microbatches: u32,
    ) -> Result<Layout, InstantiatorError> {
        if templates.is_empty() {
            return Err(InstantiatorError::EmptyTemplatePool);
        }

        // Group template ids by node count, sorted for determinism.
        let mut by_node_count: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (id, t) in templates {
            by_node_count.entry(t.num_nodes()).or_default().push(id.clone());
        }
        for ids in by_node_count.values_mut() {
            ids.sort();
        }

        let counts: Vec<usize> = by_node_count.keys().copied().collect();
        let mut partitions = Vec::new();
        enumerate_partitions(&counts, world_size, &mut Vec::new(), &mut partitions);

        if partitions.is_empty() {
            return Err(InstantiatorError::NoFeasiblePartition { world_size });
        }

        let mut best: Option<(f64, Vec<String>)> = None;
        for partition in &partitions {
            let assigned = assign_round_robin(partition, &by_node_count);
            let score = score_candidate(&assigned, templates, self.fault_tolerance_threshold);
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, assigned));
            }
        }

        let chosen = best.expect("partitions is non-empty").1;
        if chosen.is_empty() {
            return Err(InstantiatorError::MicrobatchSplitFailed {
                global: global_microbatches,
            });
        }

        let replicas: Vec<ReplicaId> = chosen
            .iter()
            .enumerate()
            .map(|(i, template_id)| {
                let replica_index = chosen[..i].iter().filter(|id| *id == template_id).count();
                ReplicaId {
                    template_id: template_id.clone(),
                    replica_index,
                }
            })
            .collect();

        let base = global_microbatches / replicas.len() as u32;
        let remainder = global_microbatches % replicas.len() as u32;
        let mut microbatches = BTreeMap::new();
        for (i, replica) in replicas.iter().enumerate() {
            let share = base + if (i as u32) < remainder { 1 } else { 0 };
            microbatches.insert(replica.clone(), share);
        }

        Ok(Layout {
            templates: templates.clone(),
            replicas,
            microbatches,
        })
    }
}

/// Enumerate multisets (in non-decreasing order) of `counts` summing to
/// exactly `target`. Classic bounded partition enumeration.
fn enumerate_partitions(
    counts: &[usize],
    target: usize,
    current: &mut Vec<usize>,
    out: &mut Vec<Vec<usize>>,
) {
    if target == 0 {
        if !current.is_empty() {
            out.push(current.clone());
        }
        return;
    }
    for &c in counts {
        if c == 0 || c > target {
            continue;
        }
        if let Some(&last) = current.last() {
            if c < last {
                continue;
            }
        }
        current.push(c);
        enumerate_partitions(counts, target - c, current, out);
        current.pop();
    }
}

/// For a chosen multiset of node counts, pick which template fills each
/// slot, round-robining within each count's bucket to favor diversity.
fn assign_round_robin(
    partition: &[usize],
    by_node_count: &BTreeMap<usize, Vec<String>>,
) -> Vec<String> {
    let mut cursor: BTreeMap<usize, usize> = BTreeMap::new();
    partition
        .iter()
        .map(|count| {
            let bucket = &by_node_count[count];
            let idx = cursor.entry(*count).or_insert(0);
            let template_id = bucket[*idx % bucket.len()].clone();
            *idx += 1;
            template_id
        })
        .collect()
}

/// Deterministic, tunable scoring: favors distinct-template diversity first
/// (robustness), then more replicas (finer-grained microbatch balance).
/// Coefficients are arbitrary constants, not derived from a reference
/// implementation — spec §4.5 leaves them unspecified.
fn score_candidate(
    assigned: &[String],
    templates: &BTreeMap<String, PipelineTemplate>,
    threshold: usize,
) -> f64 {
    let distinct = assigned
        .iter()
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    let meets_threshold = distinct >= threshold;
    let node_counts: Vec<usize> = assigned
        .iter()
        .map(|id| templates[id].num_nodes())
        .collect();
    let mean = node_counts.iter().sum::<usize>() as f64 / node_counts.len() as f64;
    let variance = node_counts
        .iter()
        .map(|&c| (c as f64 - mean).powi(2))
        .sum::<f64>()
        / node_counts.len() as f64;

    let mut score = 0.0;
    if meets_threshold {
        score += 1_000.0;
    }
    score += distinct as f64 * 100.0;
    score += assigned.len() as f64 * 10.0;
    score -= variance;
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::make_template;

    fn pool(templates: Vec<PipelineTemplate>) -> BTreeMap<String, PipelineTemplate> {
        templates.into_iter().map(|t| (t.template_id.clone(), t)).collect()
    }

    #[test]
    fn empty_pool_errors() {
        let inst = Instantiator::new(1);
        let result = inst.instantiate(&BTreeMap::new(), 4, 8);
        assert!(matches!(result, Err(InstantiatorError::EmptyTemplatePool)));
    }

    #[test]
    fn exact_single_template_fill() {
        let templates = pool(vec![make_template("t2", 2, 4)]);
        let inst = Instantiator::new(1);
        let layout = inst.instantiate(&templates, 6, 12).unwrap();

        let total_nodes: usize = layout
            .replicas
            .iter()
            .map(|r| layout.template_for(r).unwrap().num_nodes())
            .sum();
        assert_eq!(total_nodes, 6);
        assert_eq!(layout.total_microbatches(), 12);
    }

    #[test]
    fn infeasible_partition_errors() {
        // Only a 3-node template exists; world_size=4 has no combination.
        let templates = pool(vec![make_template("t3", 3, 2)]);
        let inst = Instantiator::new(1);
        let result = inst.instantiate(&templates, 4, 8);
        assert!(matches!(
            result,
            Err(InstantiatorError::NoFeasiblePartition { world_size: 4 })
        ));
    }

    #[test]
    fn prefers_distinct_templates_when_threshold_set() {
        // Two 2-node templates available; world_size=4 can be filled by
        // either two of the same template or one of each.
        let templates = pool(vec![make_template("a2", 2, 4), make_template("b2", 2, 4)]);
        let inst = Instantiator::new(2);
        let layout = inst.instantiate(&templates, 4, 8).unwrap();
        assert!(layout.distinct_template_count() >= 2);
    }

    #[test]
    fn microbatches_split_evenly_with_remainder() {
        let templates = pool(vec![make_template("t1", 1, 4)]);
        let inst = Instantiator::new(1);
        let layout = inst.instantiate(&templates, 3, 10).unwrap();
        assert_eq!(layout.replicas.len(), 3);
        assert_eq!(layout.total_microbatches(), 10);
    }
}
