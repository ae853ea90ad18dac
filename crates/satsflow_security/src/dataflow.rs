//! Taint tracking from external data sources to sensitive operations.
//!
//! One forward pass over the statement suite in traversal order seeds
//! taint at assignments from external-source calls and propagates it
//! through later assignments; a second sweep over every call site emits
//! advisory findings. There is no fixed-point iteration: taint introduced
//! by a later statement does not flow backward into earlier assignments.
//! That is a documented limitation of the analysis, not a defect.
//!
//! Findings never reject a strategy; the vetting orchestrator surfaces
//! them in the report and the log.

use std::collections::{BTreeMap, BTreeSet};

use rustpython_parser::ast;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SecurityError;
use crate::walk;

/// Call names that bring external data into the process.
const EXTERNAL_DATA_SOURCES: &[&str] = &[
    "get_data_yahoo",
    "read_csv",
    "request",
    "get",
    "open",
    "urlopen",
    "read_html",
    "load_data",
    "fetch",
];

/// Call names whose side effects make tainted input dangerous.
const SENSITIVE_OPERATIONS: &[&str] = &[
    "eval",
    "exec",
    "system",
    "popen",
    "query",
    "execute",
    "call",
    "check_output",
    "to_csv",
    "to_json",
    "write",
    "post",
    "put",
    "send",
    "upload",
];

/// Method names capable of exporting data outside the process.
const DATA_OUTPUT_OPERATIONS: &[&str] =
    &["to_csv", "to_json", "write", "post", "put", "send", "upload"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintSource {
    /// Assigned directly from an external-source call.
    External,
    /// Assigned from an expression referencing tainted variables.
    Derived,
    /// No data-flow taint recorded (control-flow taint only).
    Unknown,
}

/// Per-variable taint record. Monotonic within one analysis pass: once a
/// variable is tainted its record is never replaced or retracted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaintState {
    pub source: TaintSource,
    pub parents: Vec<String>,
    pub control_flow_tainted: bool,
}

impl TaintState {
    fn untracked() -> Self {
        Self {
            source: TaintSource::Unknown,
            parents: Vec::new(),
            control_flow_tainted: false,
        }
    }

    pub fn is_tainted(&self) -> bool {
        matches!(self.source, TaintSource::External | TaintSource::Derived)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindingKind {
    /// Tainted data reaches a sensitive operation argument.
    SensitiveSink,
    /// Tainted data reaches a data-output operation.
    DataLeakage,
    /// A control-flow-tainted variable reaches a sensitive operation.
    ControlDependency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityFinding {
    pub kind: FindingKind,
    pub variable: String,
    pub operation: String,
    /// Rendered derivation chain or dependency description.
    pub detail: String,
}

impl VulnerabilityFinding {
    /// One-line description for the vetting log.
    pub fn summary(&self) -> String {
        match self.kind {
            FindingKind::SensitiveSink => format!(
                "potentially unsafe use of external data '{}' in sensitive operation '{}' (source: {})",
                self.variable, self.operation, self.detail
            ),
            FindingKind::DataLeakage => format!(
                "potential data leakage: external data '{}' used in output operation '{}'",
                self.variable, self.operation
            ),
            FindingKind::ControlDependency => format!(
                "variable '{}' used in sensitive operation '{}' is control-dependent on external data",
                self.variable, self.operation
            ),
        }
    }
}

/// Taint analysis over one source unit. Create one instance per analysis;
/// the taint map stays readable afterwards.
#[derive(Debug, Default)]
pub struct DataFlowAnalyzer {
    taint: BTreeMap<String, TaintState>,
}

impl DataFlowAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the analysis. Always advisory: a parse failure is the only
    /// error path, and findings are returned rather than raised.
    pub fn analyze(&mut self, source: &str) -> Result<Vec<VulnerabilityFinding>, SecurityError> {
        let suite = walk::parse_strategy(source)?;

        self.propagate(&suite, false);
        let findings = self.collect_findings(&suite);
        for finding in &findings {
            warn!("potential vulnerability: {}", finding.summary());
        }
        Ok(findings)
    }

    /// Taint record for a variable, once `analyze` has run.
    pub fn taint(&self, variable: &str) -> Option<&TaintState> {
        self.taint.get(variable)
    }

    fn propagate(&mut self, stmts: &[ast::Stmt], control_tainted: bool) {
        for stmt in stmts {
            match stmt {
                ast::Stmt::Assign(assign) => self.record_assignment(assign, control_tainted),
                ast::Stmt::If(node) => {
                    let inner = control_tainted || self.test_references_taint(&node.test);
                    self.propagate(&node.body, inner);
                    self.propagate(&node.orelse, inner);
                }
                ast::Stmt::While(node) => {
                    let inner = control_tainted || self.test_references_taint(&node.test);
                    self.propagate(&node.body, inner);
                    self.propagate(&node.orelse, inner);
                }
                other => {
                    for block in walk::child_blocks(other) {
                        self.propagate(block, control_tainted);
                    }
                }
            }
        }
    }

    fn record_assignment(&mut self, assign: &ast::StmtAssign, control_tainted: bool) {
        let seeded = is_external_source_call(&assign.value);
        let referenced = referenced_names(&assign.value);
        let tainted_parents: Vec<String> = referenced
            .iter()
            .filter(|name| self.is_tainted(name))
            .cloned()
            .collect();

        for target in &assign.targets {
            let ast::Expr::Name(name) = target else {
                continue;
            };
            let id = name.id.to_string();
            if seeded {
                self.mark_tainted(&id, TaintSource::External, Vec::new());
            } else if !tainted_parents.is_empty() {
                self.mark_tainted(&id, TaintSource::Derived, tainted_parents.clone());
            }
            if control_tainted {
                self.taint
                    .entry(id)
                    .or_insert_with(TaintState::untracked)
                    .control_flow_tainted = true;
            }
        }
    }

    /// Record taint without ever downgrading an existing record.
    fn mark_tainted(&mut self, variable: &str, source: TaintSource, parents: Vec<String>) {
        let state = self
            .taint
            .entry(variable.to_string())
            .or_insert_with(TaintState::untracked);
        if !state.is_tainted() {
            state.source = source;
            state.parents = parents;
        }
    }

    fn is_tainted(&self, variable: &str) -> bool {
        self.taint.get(variable).is_some_and(TaintState::is_tainted)
    }

    fn is_control_tainted(&self, variable: &str) -> bool {
        self.taint
            .get(variable)
            .is_some_and(|state| state.control_flow_tainted)
    }

    fn test_references_taint(&self, test: &ast::Expr) -> bool {
        referenced_names(test)
            .iter()
            .any(|name| self.is_tainted(name))
    }

    fn collect_findings(&self, suite: &[ast::Stmt]) -> Vec<VulnerabilityFinding> {
        let mut calls: Vec<&ast::ExprCall> = Vec::new();
        walk::for_each_expr_in_stmts(suite, &mut |expr| {
            if let ast::Expr::Call(call) = expr {
                calls.push(call);
            }
        });

        let mut findings = Vec::new();

        for call in &calls {
            if !is_sensitive_operation(call) {
                continue;
            }
            let operation = walk::dotted_name(&call.func);
            for arg in &call.args {
                for variable in referenced_names(arg) {
                    if self.is_tainted(&variable) {
                        let mut visited = BTreeSet::new();
                        findings.push(VulnerabilityFinding {
                            kind: FindingKind::SensitiveSink,
                            detail: self.source_chain(&variable, &mut visited),
                            variable,
                            operation: operation.clone(),
                        });
                    }
                }
            }
        }

        for call in &calls {
            if !is_data_output_operation(call) {
                continue;
            }
            let operation = walk::dotted_name(&call.func);
            for arg in &call.args {
                for variable in referenced_names(arg) {
                    if self.is_tainted(&variable) {
                        findings.push(VulnerabilityFinding {
                            kind: FindingKind::DataLeakage,
                            detail: "tainted data reaches an output operation".to_string(),
                            variable,
                            operation: operation.clone(),
                        });
                    }
                }
            }
        }

        for call in &calls {
            if !is_sensitive_operation(call) {
                continue;
            }
            let operation = walk::dotted_name(&call.func);
            for arg in &call.args {
                for variable in referenced_names(arg) {
                    if self.is_control_tainted(&variable) {
                        findings.push(VulnerabilityFinding {
                            kind: FindingKind::ControlDependency,
                            detail: "assigned under a condition derived from external data"
                                .to_string(),
                            variable,
                            operation: operation.clone(),
                        });
                    }
                }
            }
        }

        findings
    }

    /// Render the derivation chain of a tainted variable, recursing
    /// through `parents`. The visited set guards against malformed
    /// parent loops.
    fn source_chain(&self, variable: &str, visited: &mut BTreeSet<String>) -> String {
        if !visited.insert(variable.to_string()) {
            return "cyclic derivation".to_string();
        }
        match self.taint.get(variable) {
            None => "unknown".to_string(),
            Some(state) => match state.source {
                TaintSource::External => "direct external input".to_string(),
                TaintSource::Unknown => "unknown".to_string(),
                TaintSource::Derived => {
                    let parents: Vec<String> = state
                        .parents
                        .iter()
                        .map(|parent| self.source_chain(parent, visited))
                        .collect();
                    format!("derived from {}", parents.join(", "))
                }
            },
        }
    }
}

fn is_external_source_call(expr: &ast::Expr) -> bool {
    let ast::Expr::Call(call) = expr else {
        return false;
    };
    if let Some(name) = walk::call_func_name(call) {
        return EXTERNAL_DATA_SOURCES.contains(&name);
    }
    if let Some(attr) = walk::call_attr_name(call) {
        return EXTERNAL_DATA_SOURCES.contains(&attr);
    }
    false
}

fn is_sensitive_operation(call: &ast::ExprCall) -> bool {
    if let Some(name) = walk::call_func_name(call) {
        return SENSITIVE_OPERATIONS.contains(&name);
    }
    if let Some(attr) = walk::call_attr_name(call) {
        return SENSITIVE_OPERATIONS.contains(&attr);
    }
    false
}

fn is_data_output_operation(call: &ast::ExprCall) -> bool {
    walk::call_attr_name(call).is_some_and(|attr| DATA_OUTPUT_OPERATIONS.contains(&attr))
}

/// Variable names referenced by an expression, recursing through the
/// forms taint can travel in: binary/unary ops, call arguments
/// (positional and keyword), subscripts, list/tuple literals.
fn referenced_names(expr: &ast::Expr) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_names(expr, &mut names);
    names
}

fn collect_names(expr: &ast::Expr, names: &mut BTreeSet<String>) {
    match expr {
        ast::Expr::Name(name) => {
            names.insert(name.id.to_string());
        }
        ast::Expr::BinOp(op) => {
            collect_names(&op.left, names);
            collect_names(&op.right, names);
        }
        ast::Expr::UnaryOp(op) => collect_names(&op.operand, names),
        ast::Expr::Call(call) => {
            for arg in &call.args {
                collect_names(arg, names);
            }
            for kw in &call.keywords {
                collect_names(&kw.value, names);
            }
        }
        ast::Expr::Subscript(sub) => collect_names(&sub.value, names),
        ast::Expr::List(list) => {
            for elt in &list.elts {
                collect_names(elt, names);
            }
        }
        ast::Expr::Tuple(tuple) => {
            for elt in &tuple.elts {
                collect_names(elt, names);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (DataFlowAnalyzer, Vec<VulnerabilityFinding>) {
        let mut analyzer = DataFlowAnalyzer::new();
        let findings = analyzer.analyze(source).unwrap();
        (analyzer, findings)
    }

    #[test]
    fn test_external_call_seeds_taint() {
        let (analyzer, findings) = run("prices = read_csv('btc.csv')\n");
        let state = analyzer.taint("prices").unwrap();
        assert_eq!(state.source, TaintSource::External);
        assert!(state.parents.is_empty());
        assert!(findings.is_empty());
    }

    #[test]
    fn test_method_style_source_seeds_taint() {
        let (analyzer, _) = run("prices = pdr.get_data_yahoo('BTC-USD')\n");
        assert_eq!(
            analyzer.taint("prices").unwrap().source,
            TaintSource::External
        );
    }

    #[test]
    fn test_derived_taint_records_exact_parents() {
        let (analyzer, _) = run(
            r#"
a = fetch(url)
b = urlopen(other)
clean = 10
c = a + b + clean
"#,
        );
        let state = analyzer.taint("c").unwrap();
        assert_eq!(state.source, TaintSource::Derived);
        assert_eq!(state.parents, vec!["a".to_string(), "b".to_string()]);
        assert!(analyzer.taint("clean").is_none());
    }

    #[test]
    fn test_taint_travels_through_call_arguments() {
        let (analyzer, _) = run(
            r#"
raw = load_data(path)
scaled = normalize(raw, factor=2)
keyed = combine(x=scaled)
"#,
        );
        assert_eq!(
            analyzer.taint("scaled").unwrap().parents,
            vec!["raw".to_string()]
        );
        assert_eq!(
            analyzer.taint("keyed").unwrap().parents,
            vec!["scaled".to_string()]
        );
    }

    #[test]
    fn test_taint_without_sink_yields_no_findings() {
        let (_, findings) = run(
            r#"
data = read_csv('x.csv')
weights = data / data.sum()
"#,
        );
        assert!(findings.is_empty());
    }

    #[test]
    fn test_sensitive_sink_emits_finding_with_chain() {
        let (_, findings) = run(
            r#"
raw = fetch(url)
expr = raw + suffix
eval(expr)
"#,
        );
        let sink: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == FindingKind::SensitiveSink)
            .collect();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].variable, "expr");
        assert_eq!(sink[0].detail, "derived from direct external input");
    }

    #[test]
    fn test_output_operation_flags_leakage() {
        let (_, findings) = run(
            r#"
data = read_csv('btc.csv')
payload = data * 2
api.send(payload)
"#,
        );
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::DataLeakage && f.variable == "payload"));
    }

    #[test]
    fn test_control_dependency_finding() {
        let (analyzer, findings) = run(
            r#"
signal = fetch(url)
if signal:
    flag = 1
execute(flag)
"#,
        );
        let state = analyzer.taint("flag").unwrap();
        assert!(state.control_flow_tainted);
        assert_eq!(state.source, TaintSource::Unknown);
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::ControlDependency && f.variable == "flag"));
        // flag carries no data taint, so no sensitive-sink finding for it.
        assert!(!findings
            .iter()
            .any(|f| f.kind == FindingKind::SensitiveSink && f.variable == "flag"));
    }

    #[test]
    fn test_forward_pass_does_not_taint_retroactively() {
        let (analyzer, findings) = run(
            r#"
b = a
a = fetch(url)
eval(b)
"#,
        );
        assert!(analyzer.taint("b").is_none());
        assert!(findings.is_empty());
    }

    #[test]
    fn test_taint_is_monotonic_within_a_pass() {
        let (analyzer, _) = run(
            r#"
x = read_csv('data.csv')
x = 1
eval(x)
"#,
        );
        // Once tainted, stays tainted: reassignment does not retract.
        assert!(analyzer.taint("x").unwrap().is_tainted());
    }
}
