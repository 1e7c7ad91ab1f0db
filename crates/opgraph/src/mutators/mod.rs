//! Whole-graph rewrite passes.
//!
//! Every mutator checks all of its preconditions for a site before editing
//! the graph, so a rejected site is left exactly as it was. The
//! [`PassManager`] runs structural (`Ir`) passes before memory-layout
//! (`Backend`) passes; within a group, in the order they were appended.

mod depth_concat;
mod fusion;
mod in_place;

use tracing::{debug, info};

use crate::config::GraphConfig;
use crate::error::Result;
use crate::graph::Graph;

pub use depth_concat::DepthConcatSubTensorMutator;
pub use fusion::NodeFusionMutator;
pub use in_place::InPlaceOperationMutator;

/// Ordering tag of a mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MutationType {
    /// Structural rewrites of the operator graph.
    Ir,
    /// Storage and layout rewrites; run after every `Ir` pass.
    Backend,
}

/// Outcome of one mutator run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub changed: bool,
    /// Sites rewritten by the pass.
    pub nodes_rewritten: usize,
}

impl MutationResult {
    pub fn rewritten(count: usize) -> Self {
        MutationResult {
            changed: count > 0,
            nodes_rewritten: count,
        }
    }

    pub fn merge(self, other: MutationResult) -> MutationResult {
        MutationResult {
            changed: self.changed || other.changed,
            nodes_rewritten: self.nodes_rewritten + other.nodes_rewritten,
        }
    }
}

pub trait GraphMutator: Send + Sync {
    fn name(&self) -> &'static str;
    fn mutation_type(&self) -> MutationType;
    fn mutate(&self, graph: &mut Graph) -> Result<MutationResult>;
}

/// Ordered collection of mutators applied once each.
#[derive(Default)]
pub struct PassManager {
    mutators: Vec<Box<dyn GraphMutator>>,
    stats: bool,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default passes minus those `config` disables.
    pub fn from_config(config: &GraphConfig) -> Self {
        let defaults: [Box<dyn GraphMutator>; 3] = [
            Box::new(NodeFusionMutator),
            Box::new(InPlaceOperationMutator),
            Box::new(DepthConcatSubTensorMutator),
        ];
        let mut manager = PassManager::new().with_stats(config.pass_stats);
        for mutator in defaults {
            if config.mutators.allows(mutator.name()) {
                manager.append(mutator);
            } else {
                debug!(pass = mutator.name(), "mutator disabled by config");
            }
        }
        manager
    }

    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.stats = enabled;
        self
    }

    pub fn append(&mut self, mutator: Box<dyn GraphMutator>) -> &mut Self {
        self.mutators.push(mutator);
        self
    }

    /// Names in execution order.
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.ordered().iter().map(|mutator| mutator.name()).collect()
    }

    pub fn run(&self, graph: &mut Graph) -> Result<MutationResult> {
        let mut total = MutationResult::default();
        for mutator in self.ordered() {
            let result = mutator.mutate(graph)?;
            if self.stats {
                info!(
                    pass = mutator.name(),
                    kind = ?mutator.mutation_type(),
                    changed = result.changed,
                    rewritten = result.nodes_rewritten,
                    "mutator pass"
                );
            } else {
                debug!(pass = mutator.name(), rewritten = result.nodes_rewritten, "mutator pass");
            }
            total = total.merge(result);
        }
        Ok(total)
    }

    fn ordered(&self) -> Vec<&dyn GraphMutator> {
        let mut ordered: Vec<&dyn GraphMutator> =
            self.mutators.iter().map(|mutator| mutator.as_ref()).collect();
        ordered.sort_by_key(|mutator| mutator.mutation_type());
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MutatorSelection;

    #[test]
    fn backend_passes_run_after_ir_passes() {
        let mut manager = PassManager::new();
        manager
            .append(Box::new(DepthConcatSubTensorMutator))
            .append(Box::new(NodeFusionMutator))
            .append(Box::new(InPlaceOperationMutator));
        assert_eq!(
            manager.pass_names(),
            ["node_fusion", "in_place_operation", "depth_concat_sub_tensor"]
        );
    }

    #[test]
    fn config_can_drop_named_passes() {
        let config = GraphConfig::default()
            .with_mutators(MutatorSelection::Except(vec!["NODE_FUSION".to_string()]));
        assert_eq!(
            PassManager::from_config(&config).pass_names(),
            ["in_place_operation", "depth_concat_sub_tensor"]
        );
        let config = GraphConfig::default().without_mutators();
        assert!(PassManager::from_config(&config).pass_names().is_empty());
    }

    #[test]
    fn merge_accumulates() {
        let merged = MutationResult::rewritten(2).merge(MutationResult::default());
        assert_eq!(merged, MutationResult::rewritten(2));
    }
}
