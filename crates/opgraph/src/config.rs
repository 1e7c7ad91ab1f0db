use crate::env;

/// How an execution plan dispatches its functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// `run()` executes every function before returning.
    #[default]
    Immediate,
    /// `run()` enqueues functions on a device queue; `sync()` waits for them.
    Queued,
}

/// Which mutator passes the pass manager runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MutatorSelection {
    #[default]
    All,
    None,
    /// Every pass except the named ones.
    Except(Vec<String>),
}

impl MutatorSelection {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            MutatorSelection::All => true,
            MutatorSelection::None => false,
            MutatorSelection::Except(names) => !names.iter().any(|n| n.eq_ignore_ascii_case(name)),
        }
    }

    fn from_list(names: &[String]) -> Self {
        if names.iter().any(|name| name == "all") {
            MutatorSelection::None
        } else {
            MutatorSelection::Except(names.to_vec())
        }
    }
}

/// Knobs applied when a graph is finalized into an execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphConfig {
    pub num_threads: Option<usize>,
    pub mutators: MutatorSelection,
    pub execution_mode: ExecutionMode,
    /// Emit per-pass statistics as `info` events.
    pub pass_stats: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            num_threads: env::threads(),
            mutators: env::disabled_mutators()
                .map(MutatorSelection::from_list)
                .unwrap_or_default(),
            execution_mode: ExecutionMode::Immediate,
            pass_stats: env::pass_stats_enabled(),
        }
    }
}

impl GraphConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.num_threads = Some(threads.max(1));
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_mutators(mut self, mutators: MutatorSelection) -> Self {
        self.mutators = mutators;
        self
    }

    pub fn without_mutators(self) -> Self {
        self.with_mutators(MutatorSelection::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_in_list_disables_everything() {
        let selection = MutatorSelection::from_list(&["all".to_string()]);
        assert!(!selection.allows("depth_concat_sub_tensor"));
    }

    #[test]
    fn except_list_is_case_insensitive() {
        let selection = MutatorSelection::Except(vec!["node_fusion".into()]);
        assert!(!selection.allows("Node_Fusion"));
        assert!(selection.allows("in_place_operation"));
    }
}
