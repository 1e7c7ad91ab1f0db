use std::env;
use std::sync::OnceLock;

static OPGRAPH_THREADS: OnceLock<Option<usize>> = OnceLock::new();
static OPGRAPH_PASS_STATS: OnceLock<bool> = OnceLock::new();
static OPGRAPH_DISABLE_MUTATORS: OnceLock<Option<Vec<String>>> = OnceLock::new();
static OPGRAPH_CPU_FEATURES: OnceLock<Option<Vec<String>>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Splits a comma separated list, dropping blanks and lowercasing entries.
pub(crate) fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn non_empty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Worker count for the CPU scheduler; `None` lets rayon decide.
pub(crate) fn threads() -> Option<usize> {
    *OPGRAPH_THREADS.get_or_init(|| {
        non_empty("OPGRAPH_THREADS")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|threads| *threads > 0)
    })
}

pub(crate) fn pass_stats_enabled() -> bool {
    *OPGRAPH_PASS_STATS.get_or_init(|| match non_empty("OPGRAPH_PASS_STATS") {
        Some(value) => parse_bool(&value),
        None => false,
    })
}

/// Mutator names listed in `OPGRAPH_DISABLE_MUTATORS` (`all` disables every pass).
pub(crate) fn disabled_mutators() -> Option<&'static [String]> {
    OPGRAPH_DISABLE_MUTATORS
        .get_or_init(|| non_empty("OPGRAPH_DISABLE_MUTATORS").map(|value| parse_list(&value)))
        .as_deref()
}

/// CPU features allowed by `OPGRAPH_CPU_FEATURES` (`none` forces portable kernels).
pub(crate) fn cpu_feature_filter() -> Option<&'static [String]> {
    OPGRAPH_CPU_FEATURES
        .get_or_init(|| non_empty("OPGRAPH_CPU_FEATURES").map(|value| parse_list(&value)))
        .as_deref()
}
