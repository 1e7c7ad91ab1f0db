//! Runtime CPU feature detection.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::env;

/// Instruction-set extensions a kernel variant may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CpuFeature {
    Sse41,
    Avx2,
    Fma,
    Avx512f,
    Neon,
    Fp16,
    DotProd,
    I8mm,
    Sve,
    Sve2,
    Sme2,
}

impl CpuFeature {
    pub const ALL: [CpuFeature; 11] = [
        CpuFeature::Sse41,
        CpuFeature::Avx2,
        CpuFeature::Fma,
        CpuFeature::Avx512f,
        CpuFeature::Neon,
        CpuFeature::Fp16,
        CpuFeature::DotProd,
        CpuFeature::I8mm,
        CpuFeature::Sve,
        CpuFeature::Sve2,
        CpuFeature::Sme2,
    ];

    /// Relative specialization of the extension; higher tiers win selection.
    pub fn tier(self) -> u8 {
        match self {
            CpuFeature::Neon | CpuFeature::Sse41 => 1,
            CpuFeature::Fp16 | CpuFeature::DotProd | CpuFeature::Avx2 | CpuFeature::Fma => 2,
            CpuFeature::I8mm | CpuFeature::Sve | CpuFeature::Avx512f => 3,
            CpuFeature::Sve2 | CpuFeature::Sme2 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CpuFeature::Sse41 => "sse4.1",
            CpuFeature::Avx2 => "avx2",
            CpuFeature::Fma => "fma",
            CpuFeature::Avx512f => "avx512f",
            CpuFeature::Neon => "neon",
            CpuFeature::Fp16 => "fp16",
            CpuFeature::DotProd => "dotprod",
            CpuFeature::I8mm => "i8mm",
            CpuFeature::Sve => "sve",
            CpuFeature::Sve2 => "sve2",
            CpuFeature::Sme2 => "sme2",
        }
    }

    pub fn from_name(name: &str) -> Option<CpuFeature> {
        let name = name.trim().to_ascii_lowercase();
        CpuFeature::ALL
            .into_iter()
            .find(|feature| feature.name() == name || (name == "sse41" && *feature == CpuFeature::Sse41))
    }
}

impl fmt::Display for CpuFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hardware description consulted by kernel selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    features: BTreeSet<CpuFeature>,
    num_threads: usize,
}

impl Capabilities {
    /// No extensions, one thread: selects the portable kernels.
    pub fn portable() -> Self {
        Capabilities {
            features: BTreeSet::new(),
            num_threads: 1,
        }
    }

    /// Features reported by the running CPU.
    pub fn detect() -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Capabilities {
            features: detect_features(),
            num_threads,
        }
    }

    /// [`Capabilities::detect`] narrowed by `OPGRAPH_CPU_FEATURES` and `OPGRAPH_THREADS`.
    pub fn host() -> Self {
        let mut caps = Capabilities::detect();
        if let Some(filter) = env::cpu_feature_filter() {
            caps = caps.restricted_to(filter);
        }
        if let Some(threads) = env::threads() {
            caps.num_threads = threads;
        }
        debug!(features = ?caps.features, threads = caps.num_threads, "host capabilities");
        caps
    }

    pub fn with_feature(mut self, feature: CpuFeature) -> Self {
        self.features.insert(feature);
        self
    }

    pub fn with_features(mut self, features: impl IntoIterator<Item = CpuFeature>) -> Self {
        self.features.extend(features);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.num_threads = threads.max(1);
        self
    }

    /// Keeps only the named features; `none` clears them all.
    pub fn restricted_to(mut self, names: &[String]) -> Self {
        let allowed: BTreeSet<CpuFeature> = names
            .iter()
            .filter_map(|name| CpuFeature::from_name(name))
            .collect();
        self.features.retain(|feature| allowed.contains(feature));
        self
    }

    pub fn has(&self, feature: CpuFeature) -> bool {
        self.features.contains(&feature)
    }

    pub fn features(&self) -> &BTreeSet<CpuFeature> {
        &self.features
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::host()
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_features() -> BTreeSet<CpuFeature> {
    let mut features = BTreeSet::new();
    if std::arch::is_x86_feature_detected!("sse4.1") {
        features.insert(CpuFeature::Sse41);
    }
    if std::arch::is_x86_feature_detected!("avx2") {
        features.insert(CpuFeature::Avx2);
    }
    if std::arch::is_x86_feature_detected!("fma") {
        features.insert(CpuFeature::Fma);
    }
    if std::arch::is_x86_feature_detected!("avx512f") {
        features.insert(CpuFeature::Avx512f);
    }
    features
}

#[cfg(target_arch = "aarch64")]
fn detect_features() -> BTreeSet<CpuFeature> {
    let mut features = BTreeSet::new();
    if std::arch::is_aarch64_feature_detected!("neon") {
        features.insert(CpuFeature::Neon);
    }
    if std::arch::is_aarch64_feature_detected!("fp16") {
        features.insert(CpuFeature::Fp16);
    }
    if std::arch::is_aarch64_feature_detected!("dotprod") {
        features.insert(CpuFeature::DotProd);
    }
    if std::arch::is_aarch64_feature_detected!("i8mm") {
        features.insert(CpuFeature::I8mm);
    }
    if std::arch::is_aarch64_feature_detected!("sve") {
        features.insert(CpuFeature::Sve);
    }
    if std::arch::is_aarch64_feature_detected!("sve2") {
        features.insert(CpuFeature::Sve2);
    }
    // SME2 has no stable runtime probe; it is only reachable through `with_feature`.
    features
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_features() -> BTreeSet<CpuFeature> {
    BTreeSet::new()
}
