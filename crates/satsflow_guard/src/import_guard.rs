//! Runtime import resolution against the policy allow-list.
//!
//! Strategy code never touches a loader directly; the host resolves each
//! module through [`ImportGuard::resolve`] before handing anything over.
//! Denials are hard failures. Abuse patterns (excessive or rapid repeat
//! resolution of the same module) are recorded and logged but never
//! fatal on their own.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use satsflow_security::{Policy, SecurityError};

const MAX_RESOLUTIONS_PER_MODULE: u32 = 15;
const MIN_RESOLUTION_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct ImportRecord {
    count: u32,
    timestamps: Vec<Instant>,
}

/// Counts and suspicious flags for the end-of-run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSummary {
    pub counts: BTreeMap<String, u32>,
    pub suspicious: Vec<String>,
}

pub struct ImportGuard {
    policy: Policy,
    records: BTreeMap<String, ImportRecord>,
    suspicious: BTreeSet<String>,
}

impl ImportGuard {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            records: BTreeMap::new(),
            suspicious: BTreeSet::new(),
        }
    }

    /// Resolve one module name. Records usage first so denied attempts
    /// also show up in the summary, then applies the allow decision.
    pub fn resolve(&mut self, module: &str) -> Result<(), SecurityError> {
        self.record_usage(module);

        if self.policy.in_plugin_namespace(module) {
            debug!(module, "resolved plugin-namespace import");
            return Ok(());
        }

        // Bare `os` is resolvable; which of its functions the strategy
        // may reach is decided statically at vetting time.
        if module == "os" {
            return Ok(());
        }
        if let Some(rest) = module.strip_prefix("os.") {
            if rest == "path" || self.policy.allowed_os_functions.contains(module) {
                return Ok(());
            }
            self.flag(module, "restricted os function");
            return Err(SecurityError::ImportViolation {
                module: module.to_string(),
            });
        }

        if self.policy.module_allowed(module) {
            debug!(module, "resolved allow-listed import");
            return Ok(());
        }

        self.flag(module, "module not in allow-list");
        Err(SecurityError::ImportViolation {
            module: module.to_string(),
        })
    }

    fn record_usage(&mut self, module: &str) {
        let now = Instant::now();
        let record = self.records.entry(module.to_string()).or_default();
        record.count += 1;

        if record.count > MAX_RESOLUTIONS_PER_MODULE {
            warn!(
                module,
                count = record.count,
                "excessive import resolution count"
            );
            self.suspicious.insert(module.to_string());
        }
        if let Some(last) = record.timestamps.last() {
            if now.duration_since(*last) < MIN_RESOLUTION_INTERVAL {
                warn!(module, "rapid repeated import resolution");
                self.suspicious.insert(module.to_string());
            }
        }
        record.timestamps.push(now);
    }

    fn flag(&mut self, module: &str, why: &str) {
        warn!(module, "blocked import: {why}");
        self.suspicious.insert(module.to_string());
    }

    pub fn summary(&self) -> ImportSummary {
        ImportSummary {
            counts: self
                .records
                .iter()
                .map(|(name, record)| (name.clone(), record.count))
                .collect(),
            suspicious: self.suspicious.iter().cloned().collect(),
        }
    }
}
