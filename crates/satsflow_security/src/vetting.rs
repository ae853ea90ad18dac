//! Static vetting orchestrator.
//!
//! Composes the pattern table, the AST-level checks and both analyzers
//! into one `validate` entry point. Vetting is a pure function of the
//! source text: the same input always yields the same verdict. Hard
//! violations abort with the first `SecurityError` encountered; taint
//! findings and complexity heuristics ride along in the report.
//!
//! Check order is cheapest-first and chosen so the reported kind is
//! stable: size pre-checks, then the textual pattern table, then the
//! parsed checks (dangerous calls, imports, complexity), then taint
//! analysis.

use std::collections::BTreeSet;
use std::path::Path;

use rustpython_parser::ast;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::complexity::{ComplexityAnalyzer, ComplexityReport};
use crate::dataflow::{DataFlowAnalyzer, VulnerabilityFinding};
use crate::error::SecurityError;
use crate::patterns;
use crate::policy::Policy;
use crate::walk;

/// Bare calls that are rejected outright wherever they appear.
const DANGEROUS_CALLS: &[&str] = &["eval", "exec", "open", "system"];

/// Method names logged as sensitive-operation usage (informational).
const TRACKED_SENSITIVE_ATTRS: &[&str] = &["eval", "exec", "system", "query", "execute"];

/// Call shapes logged as external-data access (informational).
const EXTERNAL_ACCESS_NAMES: &[&str] = &["requests", "urlopen", "read_csv", "get_data_yahoo"];
const EXTERNAL_ACCESS_ATTRS: &[&str] =
    &["get", "post", "request", "fetch", "load", "read_csv", "read_html"];

/// URL fragments that indicate probing beyond the domain allow-list.
const SUSPICIOUS_URL_FRAGMENTS: &[&str] = &[
    "..",
    "~",
    "%",
    "localhost",
    "127.0.0.1",
    "file:",
    "gopher:",
    "data:",
    "internal",
];

/// Immutable result of one vetting run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VettingReport {
    pub complexity: ComplexityReport,
    /// Advisory taint findings; never cause rejection.
    pub findings: Vec<VulnerabilityFinding>,
    /// External-data call descriptors seen in the source.
    pub external_data_access: Vec<String>,
    /// Sensitive-operation descriptors seen in the source.
    pub sensitive_operations: Vec<String>,
}

pub struct StrategyVetter {
    policy: Policy,
}

impl StrategyVetter {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Validate a strategy file before its first execution.
    pub fn validate_file(&self, path: &Path) -> Result<VettingReport, SecurityError> {
        let metadata = std::fs::metadata(path).map_err(|e| SecurityError::ExecutionFailure {
            message: format!("strategy file {} not readable: {e}", path.display()),
        })?;
        let size_kb = metadata.len() / 1024;
        if size_kb > self.policy.max_source_kb {
            return Err(SecurityError::SizeViolation {
                reason: format!(
                    "strategy file is {size_kb}KB > {}KB allowed",
                    self.policy.max_source_kb
                ),
            });
        }
        let source = std::fs::read_to_string(path).map_err(|e| SecurityError::ExecutionFailure {
            message: format!("strategy file {} not readable: {e}", path.display()),
        })?;
        let report = self.validate_source(&source)?;
        info!("strategy file {} passed security validation", path.display());
        Ok(report)
    }

    /// Validate raw strategy source.
    pub fn validate_source(&self, source: &str) -> Result<VettingReport, SecurityError> {
        self.check_line_lengths(source)?;
        patterns::scan(source)?;

        let suite = walk::parse_strategy(source)?;
        let (external_data_access, sensitive_operations) = self.check_calls(&suite)?;
        self.check_imports(&suite)?;

        let complexity = ComplexityAnalyzer::new(&self.policy).analyze(source)?;

        let mut dataflow = DataFlowAnalyzer::new();
        let findings = dataflow.analyze(source)?;

        if !external_data_access.is_empty() {
            info!(
                "strategy accesses external data: {}",
                external_data_access.join(", ")
            );
        }
        if !sensitive_operations.is_empty() {
            info!(
                "strategy uses sensitive operations: {}",
                sensitive_operations.join(", ")
            );
        }

        Ok(VettingReport {
            complexity,
            findings,
            external_data_access,
            sensitive_operations,
        })
    }

    /// Validate one external data URL against the domain allow-list.
    pub fn validate_external_data(&self, raw_url: &str) -> Result<(), SecurityError> {
        let parsed = Url::parse(raw_url).map_err(|e| SecurityError::DangerousPattern {
            reason: format!("invalid external data URL: {e}"),
        })?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SecurityError::DangerousPattern {
                    reason: format!("unsupported URL protocol: {other}"),
                })
            }
        }
        let domain = parsed.host_str().unwrap_or_default();
        if !self.policy.allowed_data_domains.contains(domain) {
            return Err(SecurityError::DangerousPattern {
                reason: format!("external data source not allowed: {domain}"),
            });
        }
        let lowered = raw_url.to_ascii_lowercase();
        for fragment in SUSPICIOUS_URL_FRAGMENTS {
            if lowered.contains(fragment) {
                return Err(SecurityError::DangerousPattern {
                    reason: format!("suspicious URL fragment: {fragment}"),
                });
            }
        }
        Ok(())
    }

    fn check_line_lengths(&self, source: &str) -> Result<(), SecurityError> {
        for (index, line) in source.lines().enumerate() {
            let length = line.chars().count();
            if length > self.policy.max_line_length {
                return Err(SecurityError::SizeViolation {
                    reason: format!(
                        "line {} is {length} characters > {} allowed",
                        index + 1,
                        self.policy.max_line_length
                    ),
                });
            }
        }
        Ok(())
    }

    fn check_imports(&self, suite: &[ast::Stmt]) -> Result<(), SecurityError> {
        let mut violation: Option<SecurityError> = None;
        walk::for_each_stmt(suite, &mut |stmt| {
            if violation.is_some() {
                return;
            }
            match stmt {
                ast::Stmt::Import(node) => {
                    for alias in &node.names {
                        let name = alias.name.as_str();
                        // `os` imports pass here; usage is constrained by
                        // the function-level checks instead.
                        if name == "os" {
                            continue;
                        }
                        if !self.import_allowed(name) {
                            violation = Some(SecurityError::ImportViolation {
                                module: name.to_string(),
                            });
                            return;
                        }
                    }
                }
                ast::Stmt::ImportFrom(node) => {
                    let Some(module) = &node.module else {
                        violation = Some(SecurityError::ImportViolation {
                            module: "<relative import>".to_string(),
                        });
                        return;
                    };
                    let name = module.as_str();
                    if name == "os.path" {
                        return;
                    }
                    if !self.import_allowed(name) {
                        violation = Some(SecurityError::ImportViolation {
                            module: name.to_string(),
                        });
                    }
                }
                _ => {}
            }
        });
        violation.map_or(Ok(()), Err)
    }

    fn import_allowed(&self, name: &str) -> bool {
        self.policy.module_allowed(name) || self.policy.in_plugin_namespace(name)
    }

    /// Dangerous-call and `os` usage checks, plus the informational
    /// external-access / sensitive-operation summaries.
    fn check_calls(
        &self,
        suite: &[ast::Stmt],
    ) -> Result<(Vec<String>, Vec<String>), SecurityError> {
        let mut violation: Option<SecurityError> = None;
        let mut external: BTreeSet<String> = BTreeSet::new();
        let mut sensitive: BTreeSet<String> = BTreeSet::new();

        walk::for_each_expr_in_stmts(suite, &mut |expr| {
            if violation.is_some() {
                return;
            }
            match expr {
                ast::Expr::Call(call) => {
                    if let Some(name) = walk::call_func_name(call) {
                        if DANGEROUS_CALLS.contains(&name) {
                            violation = Some(SecurityError::DangerousPattern {
                                reason: format!("dangerous function call: {name}"),
                            });
                            return;
                        }
                        if EXTERNAL_ACCESS_NAMES.contains(&name) {
                            external.insert(format!("function:{name}"));
                        }
                    }
                    if let Some(attr) = walk::call_attr_name(call) {
                        if TRACKED_SENSITIVE_ATTRS.contains(&attr) {
                            sensitive.insert(walk::dotted_name(&call.func));
                        }
                        if EXTERNAL_ACCESS_ATTRS.contains(&attr) {
                            external.insert(format!("method:{}", walk::dotted_name(&call.func)));
                        }
                    }
                    if let Some(err) = self.check_os_call(call) {
                        violation = Some(err);
                    }
                }
                ast::Expr::Attribute(attr) => {
                    if let ast::Expr::Name(base) = attr.value.as_ref() {
                        if base.id.as_str() == "os" {
                            let member = attr.attr.as_str();
                            if member != "path" && member != "makedirs" {
                                violation = Some(SecurityError::DangerousPattern {
                                    reason: format!("disallowed os module attribute: os.{member}"),
                                });
                            }
                        }
                    }
                }
                _ => {}
            }
        });

        match violation {
            Some(err) => Err(err),
            None => Ok((
                external.into_iter().collect(),
                sensitive.into_iter().collect(),
            )),
        }
    }

    /// Second-level check for `os` calls: only the fully-qualified names
    /// in the allow-list pass, never the facility as a whole.
    fn check_os_call(&self, call: &ast::ExprCall) -> Option<SecurityError> {
        let ast::Expr::Attribute(func) = call.func.as_ref() else {
            return None;
        };
        let qualified = match func.value.as_ref() {
            // os.path.<fn>(...)
            ast::Expr::Attribute(inner) => {
                let ast::Expr::Name(base) = inner.value.as_ref() else {
                    return None;
                };
                if base.id.as_str() != "os" || inner.attr.as_str() != "path" {
                    return None;
                }
                format!("os.path.{}", func.attr.as_str())
            }
            // os.<fn>(...)
            ast::Expr::Name(base) => {
                if base.id.as_str() != "os" {
                    return None;
                }
                format!("os.{}", func.attr.as_str())
            }
            _ => return None,
        };
        if self.policy.allowed_os_functions.contains(&qualified) {
            None
        } else {
            Some(SecurityError::DangerousPattern {
                reason: format!("disallowed os function call: {qualified}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vetter() -> StrategyVetter {
        StrategyVetter::new(Policy::strict())
    }

    const CLEAN_STRATEGY: &str = r#"
import pandas as pd
import numpy as np
from core.config import BACKTEST_START

def construct_weights(df):
    weights = pd.Series(index=df.index, dtype=float)
    weights[:] = 1.0 / len(df)
    return weights
"#;

    #[test]
    fn test_clean_strategy_passes() {
        let report = vetter().validate_source(CLEAN_STRATEGY).unwrap();
        assert!(report.findings.is_empty());
        assert!(report.complexity.functions.contains_key("construct_weights"));
    }

    #[test]
    fn test_validation_is_deterministic() {
        let v = vetter();
        let first = v.validate_source(CLEAN_STRATEGY).unwrap();
        let second = v.validate_source(CLEAN_STRATEGY).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_eval_rejected_in_both_modes() {
        for policy in [Policy::strict(), Policy::relaxed()] {
            let err = StrategyVetter::new(policy)
                .validate_source("x = eval('1 + 1')\n")
                .unwrap_err();
            assert_eq!(err.kind(), "dangerous_pattern");
        }
    }

    #[test]
    fn test_import_socket_is_import_violation() {
        let err = vetter().validate_source("import socket\n").unwrap_err();
        match err {
            SecurityError::ImportViolation { module } => assert_eq!(module, "socket"),
            other => panic!("expected ImportViolation, got {other:?}"),
        }
    }

    #[test]
    fn test_from_import_checked_too() {
        let err = vetter()
            .validate_source("from ctypes import CDLL\n")
            .unwrap_err();
        assert_eq!(err.kind(), "import_violation");
    }

    #[test]
    fn test_nested_import_checked() {
        let err = vetter()
            .validate_source("def f():\n    import pickle\n    return 1\n")
            .unwrap_err();
        assert_eq!(err.kind(), "import_violation");
    }

    #[test]
    fn test_allowed_descendant_import_passes() {
        let report = vetter()
            .validate_source("import pandas.api.types\nfrom scipy import optimize\n")
            .unwrap();
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_os_path_join_allowed_but_os_system_rejected() {
        let ok = vetter().validate_source("import os\np = os.path.join(a, b)\n");
        assert!(ok.is_ok());

        let err = vetter()
            .validate_source("import os\nos.popen('ls')\n")
            .unwrap_err();
        assert_eq!(err.kind(), "dangerous_pattern");
    }

    #[test]
    fn test_disallowed_os_attribute_rejected() {
        let err = vetter()
            .validate_source("import os\ncwd = os.getcwd()\n")
            .unwrap_err();
        assert!(err.to_string().contains("os.getcwd"));
    }

    #[test]
    fn test_overlong_line_is_size_violation() {
        let long_line = format!("x = '{}'\n", "a".repeat(900));
        let err = vetter().validate_source(&long_line).unwrap_err();
        assert_eq!(err.kind(), "size_violation");
    }

    #[test]
    fn test_small_module_scenario() {
        // 10-line module, one function with 3 statements, no branches.
        let source = "\
# simple uniform strategy
import pandas as pd


def construct_weights(df):
    total = len(df)
    weights = pd.Series(1.0 / total, index=df.index)
    return weights


";
        let report = vetter().validate_source(source).unwrap();
        let metrics = &report.complexity.functions["construct_weights"];
        assert_eq!(metrics.statements, 3);
        assert_eq!(metrics.cyclomatic, 1);
        assert_eq!(metrics.max_nesting, 0);
    }

    #[test]
    fn test_taint_findings_are_advisory() {
        let source = r#"
import pandas as pd

def load(path, db):
    data = pd.read_csv(path)
    derived = data * 2
    db.execute(derived)
    return derived
"#;
        let report = vetter().validate_source(source).unwrap();
        assert!(!report.findings.is_empty());
        assert!(report
            .external_data_access
            .iter()
            .any(|d| d.contains("read_csv")));
        assert!(report
            .sensitive_operations
            .iter()
            .any(|d| d.contains("execute")));
    }

    #[test]
    fn test_external_data_url_allow_list() {
        let v = vetter();
        assert!(v
            .validate_external_data("https://api.coingecko.com/api/v3/coins")
            .is_ok());

        let err = v
            .validate_external_data("https://evil.example.com/data")
            .unwrap_err();
        assert!(err.to_string().contains("evil.example.com"));

        let err = v
            .validate_external_data("ftp://api.coingecko.com/data")
            .unwrap_err();
        assert!(err.to_string().contains("ftp"));

        let err = v
            .validate_external_data("https://api.coingecko.com/../internal")
            .unwrap_err();
        assert_eq!(err.kind(), "dangerous_pattern");
    }

    #[test]
    fn test_validate_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy.py");
        std::fs::write(&path, CLEAN_STRATEGY).unwrap();
        assert!(vetter().validate_file(&path).is_ok());

        let missing = dir.path().join("absent.py");
        assert!(vetter().validate_file(&missing).is_err());
    }
}
