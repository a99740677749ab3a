//! Symbol names shared with the LLVM profiling runtime.
//!
//! The profiling runtime (`compiler-rt`'s `libclang_rt.profile`) and
//! `llvm-cov` locate instrumentation data purely by these names, so they
//! must not change.

/// Global symbol prefixes.
pub mod symbols {
    /// Per-function counter array, created when increments are lowered.
    pub const COUNTERS_PREFIX: &str = "__profc_";

    /// Per-function profile data, created when increments are lowered.
    pub const DATA_PREFIX: &str = "__profd_";

    /// Per-function name variable passed to the increment intrinsic.
    pub const NAME_PREFIX: &str = "__profn_";

    /// Per-function coverage record.
    pub const COVERAGE_RECORD_PREFIX: &str = "__covrec_";

    /// Module-wide coverage header and filenames table.
    pub const COVERAGE_MAPPING: &str = "__llvm_coverage_mapping";

    /// Combined names blob that lowering replaces the name variables with.
    pub const PROFILE_NAMES: &str = "__llvm_prf_nm";
}

/// Functions the instrumentation calls or references.
pub mod functions {
    /// `void llvm.instrprof.increment(ptr name, i64 hash, i32 num_counters, i32 index)`
    pub const INSTRPROF_INCREMENT: &str = "llvm.instrprof.increment";

    /// Runtime entry point that registers and writes out the profile.
    pub const PROFILE_RUNTIME: &str = "__llvm_profile_runtime";

    /// Hidden reference that forces [`PROFILE_RUNTIME`] to be linked.
    pub const PROFILE_RUNTIME_USER: &str = "__llvm_profile_runtime_user";
}

/// Strip the counter-array prefix, recovering the instrumented function's
/// name. Returns `None` for globals that are not counter arrays.
pub fn function_name_from_counters(global: &str) -> Option<&str> {
    global
        .strip_prefix(symbols::COUNTERS_PREFIX)
        .filter(|name| !name.is_empty())
}

pub fn counters_name(function: &str) -> String {
    format!("{}{}", symbols::COUNTERS_PREFIX, function)
}

pub fn data_name(function: &str) -> String {
    format!("{}{}", symbols::DATA_PREFIX, function)
}

pub fn profile_name_var(function: &str) -> String {
    format!("{}{}", symbols::NAME_PREFIX, function)
}

pub fn coverage_record_name(function: &str) -> String {
    format!("{}{}", symbols::COVERAGE_RECORD_PREFIX, function)
}
