use serde::Serialize;

/// Monotonic counters accumulated over a run.
///
/// The driver snapshots these at end of run (or on divergence) and emits
/// them in whatever format it likes; nothing in here is consumed by the
/// engine itself.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GvmStats {
    pub cycles: u64,
    pub warps_created: u64,
    pub warps_finished: u64,
    pub insns_dispatched: u64,
    pub insns_retired: u64,
    pub single_cmp_pass: u64,
    pub single_cmp_fail: u64,
    pub single_cmp_unknown: u64,
    /// Mismatching scalar register words found by the retire comparator.
    pub retire_cmp_mismatch_words: u64,
}
