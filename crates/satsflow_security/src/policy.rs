//! Vetting and guard policy.
//!
//! A [`Policy`] is built once by the host (strict for production runs,
//! relaxed for test harnesses) and passed by reference into every
//! analyzer and guard. Nothing mutates it afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Threshold profile. The same checks run in both modes; relaxed mode
/// logs complexity breaches instead of rejecting and carries larger
/// CPU/wall ceilings suited to slower, instrumented runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Strict,
    Relaxed,
}

/// Immutable thresholds and allow-lists for one vetting/guard profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Module names a strategy may import. Dotted descendants of an entry
    /// are allowed too (`pandas` admits `pandas.api.types`).
    pub allowed_modules: BTreeSet<String>,

    /// Fully-qualified `os` functions that pass the second-level check.
    pub allowed_os_functions: BTreeSet<String>,

    /// Domains strategies may fetch external data from.
    pub allowed_data_domains: BTreeSet<String>,

    /// Namespace prefix of strategy plugins themselves; sibling imports
    /// under it are always allowed.
    pub plugin_namespace: String,

    /// Resident memory ceiling in MB.
    pub max_memory_mb: f64,

    /// Accumulated process CPU time ceiling in seconds.
    pub max_cpu_seconds: f64,

    /// Wall-clock ceiling in seconds, measured from monitor creation.
    pub max_wall_seconds: f64,

    /// Cyclomatic complexity ceiling per function.
    pub max_cyclomatic: u32,

    /// Nesting depth ceiling per function.
    pub max_nesting: u32,

    /// Statement-count ceiling per function.
    pub max_function_statements: u32,

    /// Line-count ceiling per module. Hard in both modes.
    pub max_module_lines: usize,

    /// Source file size ceiling in KB.
    pub max_source_kb: u64,

    /// Longest permitted single source line, in characters.
    pub max_line_length: usize,

    /// Fraction of `max_memory_mb` past which a consistent-growth leak
    /// pattern escalates to a hard violation in strict mode.
    pub memory_escalation_ratio: f64,

    pub mode: Mode,
}

fn default_allowed_modules() -> BTreeSet<String> {
    [
        "pandas",
        "numpy",
        "datetime",
        "typing",
        "core.config",
        "core.strategies",
        "core.strategies.base_strategy",
        "pandas_datareader",
        "scipy",
        "time",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_allowed_os_functions() -> BTreeSet<String> {
    [
        "os.path.join",
        "os.path.exists",
        "os.path.abspath",
        "os.path.dirname",
        "os.makedirs",
        "os.path.isfile",
        "os.path.isdir",
        "os.path.getsize",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_allowed_data_domains() -> BTreeSet<String> {
    [
        "api.coinmetrics.io",
        "query1.finance.yahoo.com",
        "finance.yahoo.com",
        "api.coingecko.com",
        "data.nasdaq.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Policy {
    /// Production profile.
    pub fn strict() -> Self {
        Self {
            allowed_modules: default_allowed_modules(),
            allowed_os_functions: default_allowed_os_functions(),
            allowed_data_domains: default_allowed_data_domains(),
            plugin_namespace: "strategies".to_string(),
            max_memory_mb: 512.0,
            max_cpu_seconds: 10.0,
            max_wall_seconds: 30.0,
            max_cyclomatic: 25,
            max_nesting: 6,
            max_function_statements: 120,
            max_module_lines: 500,
            max_source_kb: 500,
            max_line_length: 800,
            memory_escalation_ratio: 0.8,
            mode: Mode::Strict,
        }
    }

    /// Test-harness profile: same static thresholds, complexity breaches
    /// downgraded to warnings, larger CPU/wall ceilings.
    pub fn relaxed() -> Self {
        Self {
            max_cpu_seconds: 30.0,
            max_wall_seconds: 60.0,
            mode: Mode::Relaxed,
            ..Self::strict()
        }
    }

    pub fn is_strict(&self) -> bool {
        self.mode == Mode::Strict
    }

    /// Allow-list decision for a module name: exact match or dotted
    /// descendant of an allowed entry.
    pub fn module_allowed(&self, name: &str) -> bool {
        self.allowed_modules
            .iter()
            .any(|allowed| name == allowed || name.starts_with(&format!("{}.", allowed)))
    }

    /// Whether a name is the strategy plugin namespace itself or lives
    /// under it.
    pub fn in_plugin_namespace(&self, name: &str) -> bool {
        name == self.plugin_namespace
            || name.starts_with(&format!("{}.", self.plugin_namespace))
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::strict()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_allowed_exact_and_descendant() {
        let policy = Policy::strict();
        assert!(policy.module_allowed("pandas"));
        assert!(policy.module_allowed("pandas.api.types"));
        assert!(policy.module_allowed("core.config"));
        assert!(!policy.module_allowed("pandasql"));
        assert!(!policy.module_allowed("socket"));
    }

    #[test]
    fn test_plugin_namespace_root_and_descendants() {
        let policy = Policy::strict();
        assert!(policy.in_plugin_namespace("strategies"));
        assert!(policy.in_plugin_namespace("strategies.my_dca"));
        assert!(!policy.in_plugin_namespace("strategy_tools.x"));
        assert!(!policy.in_plugin_namespace("strategies_extra"));
    }

    #[test]
    fn test_relaxed_profile_widens_runtime_ceilings_only() {
        let strict = Policy::strict();
        let relaxed = Policy::relaxed();
        assert_eq!(relaxed.mode, Mode::Relaxed);
        assert!(relaxed.max_cpu_seconds > strict.max_cpu_seconds);
        assert!(relaxed.max_wall_seconds > strict.max_wall_seconds);
        assert_eq!(relaxed.max_cyclomatic, strict.max_cyclomatic);
        assert_eq!(relaxed.max_module_lines, strict.max_module_lines);
    }
}
