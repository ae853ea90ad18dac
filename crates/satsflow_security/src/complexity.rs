//! Complexity analysis of strategy source.
//!
//! Parses one source unit and computes per-function, per-class and
//! module-level complexity metrics. Threshold breaches reject the
//! strategy in strict mode and downgrade to warnings in relaxed mode;
//! the module line ceiling is hard in both. The loop/recursion
//! heuristics are always advisory.

use std::collections::{BTreeMap, BTreeSet};

use rustpython_parser::ast;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SecurityError;
use crate::policy::Policy;
use crate::walk;

/// Metrics for one function or method, keyed by bare name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMetrics {
    pub statements: u32,
    pub branches: u32,
    pub variables: u32,
    pub arguments: u32,
    pub returns: u32,
    /// Weighted ranking score; never gated on.
    pub complexity_score: f64,
    pub cyclomatic: u32,
    pub max_nesting: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub methods: u32,
    pub attributes: u32,
    pub complexity_score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMetrics {
    pub lines: usize,
    pub statements: u32,
    pub imports: u32,
    pub functions: u32,
    pub classes: u32,
    /// Comment-to-code ratio; a very low ratio is a signal, not a gate.
    pub comment_ratio: f64,
}

/// Everything one analysis run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityReport {
    pub module: ModuleMetrics,
    pub functions: BTreeMap<String, FunctionMetrics>,
    pub classes: BTreeMap<String, ClassMetrics>,
    /// Functions containing a `while <true>` with no break in its body.
    pub infinite_loop_risk: Vec<String>,
    /// Direct self-calls and 2-hop call cycles over module functions.
    pub recursion_risk: Vec<String>,
    /// Threshold breaches recorded instead of raised (relaxed mode).
    pub threshold_flags: Vec<String>,
}

pub struct ComplexityAnalyzer<'a> {
    policy: &'a Policy,
}

impl<'a> ComplexityAnalyzer<'a> {
    pub fn new(policy: &'a Policy) -> Self {
        Self { policy }
    }

    /// Analyze one source unit. In strict mode the first threshold breach
    /// aborts the whole analysis with `ComplexityViolation`.
    pub fn analyze(&self, source: &str) -> Result<ComplexityReport, SecurityError> {
        let suite = walk::parse_strategy(source)?;

        let module = self.module_metrics(source, &suite)?;

        let mut report = ComplexityReport {
            module,
            functions: BTreeMap::new(),
            classes: BTreeMap::new(),
            infinite_loop_risk: Vec::new(),
            recursion_risk: Vec::new(),
            threshold_flags: Vec::new(),
        };

        self.function_metrics(&suite, &mut report)?;
        self.class_metrics(&suite, &mut report);
        self.check_infinite_loop_risk(&suite, &mut report);
        self.check_recursion_risk(&suite, &mut report);
        self.log_summary(&report);

        Ok(report)
    }

    fn module_metrics(
        &self,
        source: &str,
        suite: &[ast::Stmt],
    ) -> Result<ModuleMetrics, SecurityError> {
        let lines = source.lines().count();

        let mut statements = 0u32;
        let mut imports = 0u32;
        let mut functions = 0u32;
        let mut classes = 0u32;
        walk::for_each_stmt(suite, &mut |stmt| {
            statements += 1;
            match stmt {
                ast::Stmt::Import(_) | ast::Stmt::ImportFrom(_) => imports += 1,
                ast::Stmt::FunctionDef(_) | ast::Stmt::AsyncFunctionDef(_) => functions += 1,
                ast::Stmt::ClassDef(_) => classes += 1,
                _ => {}
            }
        });

        // Oversized modules are rejected unconditionally, regardless of mode.
        if lines > self.policy.max_module_lines {
            return Err(SecurityError::ComplexityViolation {
                reason: format!(
                    "module has {} lines > {} allowed",
                    lines, self.policy.max_module_lines
                ),
            });
        }

        Ok(ModuleMetrics {
            lines,
            statements,
            imports,
            functions,
            classes,
            comment_ratio: comment_ratio(source),
        })
    }

    fn function_metrics(
        &self,
        suite: &[ast::Stmt],
        report: &mut ComplexityReport,
    ) -> Result<(), SecurityError> {
        let mut defs: Vec<(String, &ast::Arguments, &[ast::Stmt])> = Vec::new();
        walk::for_each_stmt(suite, &mut |stmt| match stmt {
            ast::Stmt::FunctionDef(f) => defs.push((f.name.to_string(), &f.args, &f.body)),
            ast::Stmt::AsyncFunctionDef(f) => defs.push((f.name.to_string(), &f.args, &f.body)),
            _ => {}
        });

        for (name, args, body) in &defs {
            let statements = count_statements(body);
            let branches = count_branches(body);
            let variables = assigned_variables(body).len() as u32;
            let arguments = (args.posonlyargs.len() + args.args.len()) as u32;
            let returns = count_returns(body);
            let cyclomatic = 1 + branches + bool_and_extra(body);
            let nesting = max_nesting(body);

            let complexity_score = statements as f64
                + branches as f64 * 2.0
                + variables as f64
                + arguments as f64 * 1.5
                + returns as f64;

            report.functions.insert(
                name.clone(),
                FunctionMetrics {
                    statements,
                    branches,
                    variables,
                    arguments,
                    returns,
                    complexity_score,
                    cyclomatic,
                    max_nesting: nesting,
                },
            );

            if statements > self.policy.max_function_statements {
                self.flag_or_fail(
                    report,
                    format!(
                        "function '{}' has {} statements > {} allowed",
                        name, statements, self.policy.max_function_statements
                    ),
                )?;
            }
        }

        // Separate passes so relaxed-mode flags group by kind, matching the
        // order breaches reject in strict mode.
        for (name, _, _) in &defs {
            let cyclomatic = report.functions[name].cyclomatic;
            if cyclomatic > self.policy.max_cyclomatic {
                self.flag_or_fail(
                    report,
                    format!(
                        "cyclomatic complexity of '{}' is {} > {} allowed",
                        name, cyclomatic, self.policy.max_cyclomatic
                    ),
                )?;
            }
        }
        for (name, _, _) in &defs {
            let nesting = report.functions[name].max_nesting;
            if nesting > self.policy.max_nesting {
                self.flag_or_fail(
                    report,
                    format!(
                        "nesting depth of '{}' is {} > {} allowed",
                        name, nesting, self.policy.max_nesting
                    ),
                )?;
            }
        }

        Ok(())
    }

    fn flag_or_fail(&self, report: &mut ComplexityReport, reason: String) -> Result<(), SecurityError> {
        if self.policy.is_strict() {
            return Err(SecurityError::ComplexityViolation { reason });
        }
        warn!("complexity threshold exceeded (relaxed mode): {reason}");
        report.threshold_flags.push(reason);
        Ok(())
    }

    fn class_metrics(&self, suite: &[ast::Stmt], report: &mut ComplexityReport) {
        walk::for_each_stmt(suite, &mut |stmt| {
            if let ast::Stmt::ClassDef(class) = stmt {
                let methods = class
                    .body
                    .iter()
                    .filter(|s| {
                        matches!(s, ast::Stmt::FunctionDef(_) | ast::Stmt::AsyncFunctionDef(_))
                    })
                    .count() as u32;
                let attributes = class
                    .body
                    .iter()
                    .filter(|s| matches!(s, ast::Stmt::Assign(_)))
                    .count() as u32;
                report.classes.insert(
                    class.name.to_string(),
                    ClassMetrics {
                        methods,
                        attributes,
                        complexity_score: methods * 2 + attributes,
                    },
                );
            }
        });
    }

    fn check_infinite_loop_risk(&self, suite: &[ast::Stmt], report: &mut ComplexityReport) {
        walk::for_each_stmt(suite, &mut |stmt| {
            let (name, body) = match stmt {
                ast::Stmt::FunctionDef(f) => (f.name.as_str(), f.body.as_slice()),
                ast::Stmt::AsyncFunctionDef(f) => (f.name.as_str(), f.body.as_slice()),
                _ => return,
            };
            let mut risky = false;
            walk::for_each_stmt(body, &mut |inner| {
                if let ast::Stmt::While(w) = inner {
                    if is_literal_true(&w.test) && !contains_break(&w.body) {
                        risky = true;
                    }
                }
            });
            if risky && !report.infinite_loop_risk.iter().any(|n| n == name) {
                warn!("potential infinite loop in '{name}': while-true without break");
                report.infinite_loop_risk.push(name.to_string());
            }
        });
    }

    fn check_recursion_risk(&self, suite: &[ast::Stmt], report: &mut ComplexityReport) {
        // Call graph over function names defined anywhere in the module.
        let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut defs: Vec<(String, &[ast::Stmt])> = Vec::new();
        walk::for_each_stmt(suite, &mut |stmt| match stmt {
            ast::Stmt::FunctionDef(f) => defs.push((f.name.to_string(), &f.body)),
            ast::Stmt::AsyncFunctionDef(f) => defs.push((f.name.to_string(), &f.body)),
            _ => {}
        });
        for (name, _) in &defs {
            graph.insert(name.clone(), BTreeSet::new());
        }
        for (name, body) in &defs {
            let mut called = BTreeSet::new();
            walk::for_each_expr_in_stmts(body, &mut |expr| {
                if let ast::Expr::Call(call) = expr {
                    if let Some(callee) = walk::call_func_name(call) {
                        if graph.contains_key(callee) {
                            called.insert(callee.to_string());
                        }
                    }
                }
            });
            graph.entry(name.clone()).or_default().extend(called);
        }

        for (name, called) in &graph {
            if called.contains(name) {
                warn!("potential recursive call in '{name}': function calls itself");
                report.recursion_risk.push(name.clone());
            }
        }
        for (name, called) in &graph {
            for callee in called {
                if callee != name && graph.get(callee).is_some_and(|back| back.contains(name)) {
                    warn!("potential indirect recursion: '{name}' and '{callee}' call each other");
                    report.recursion_risk.push(format!("{name}->{callee}"));
                }
            }
        }
    }

    fn log_summary(&self, report: &ComplexityReport) {
        let mut ranked: Vec<(&String, &FunctionMetrics)> = report.functions.iter().collect();
        ranked.sort_by(|a, b| {
            b.1.complexity_score
                .partial_cmp(&a.1.complexity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (name, metrics) in ranked.into_iter().take(3) {
            info!(
                "complex function '{}': score={:.1}, statements={}, cyclomatic={}, nesting={}",
                name,
                metrics.complexity_score,
                metrics.statements,
                metrics.cyclomatic,
                metrics.max_nesting
            );
        }
    }
}

fn count_statements(body: &[ast::Stmt]) -> u32 {
    let mut count = 0;
    walk::for_each_stmt(body, &mut |_| count += 1);
    count
}

fn count_branches(body: &[ast::Stmt]) -> u32 {
    let mut count = 0;
    walk::for_each_stmt(body, &mut |stmt| {
        if matches!(
            stmt,
            ast::Stmt::If(_)
                | ast::Stmt::While(_)
                | ast::Stmt::For(_)
                | ast::Stmt::AsyncFor(_)
                | ast::Stmt::Try(_)
                | ast::Stmt::TryStar(_)
        ) {
            count += 1;
        }
    });
    count
}

fn count_returns(body: &[ast::Stmt]) -> u32 {
    let mut count = 0;
    walk::for_each_stmt(body, &mut |stmt| {
        if matches!(stmt, ast::Stmt::Return(_)) {
            count += 1;
        }
    });
    count
}

fn assigned_variables(body: &[ast::Stmt]) -> BTreeSet<String> {
    let mut vars = BTreeSet::new();
    walk::for_each_expr_in_stmts(body, &mut |expr| {
        if let ast::Expr::Name(name) = expr {
            if matches!(name.ctx, ast::ExprContext::Store) {
                vars.insert(name.id.to_string());
            }
        }
    });
    vars
}

/// Extra cyclomatic paths contributed by boolean-AND chains: each chain
/// of n operands adds n - 1 decision points.
fn bool_and_extra(body: &[ast::Stmt]) -> u32 {
    let mut extra = 0u32;
    walk::for_each_expr_in_stmts(body, &mut |expr| {
        if let ast::Expr::BoolOp(op) = expr {
            if matches!(op.op, ast::BoolOp::And) {
                extra += op.values.len().saturating_sub(1) as u32;
            }
        }
    });
    extra
}

/// Max nesting depth: entering if/for/while/with/try increments; only
/// ancestry compounds, siblings never do.
fn max_nesting(body: &[ast::Stmt]) -> u32 {
    fn depth_of(stmt: &ast::Stmt, current: u32) -> u32 {
        let nests = matches!(
            stmt,
            ast::Stmt::If(_)
                | ast::Stmt::For(_)
                | ast::Stmt::AsyncFor(_)
                | ast::Stmt::While(_)
                | ast::Stmt::With(_)
                | ast::Stmt::AsyncWith(_)
                | ast::Stmt::Try(_)
                | ast::Stmt::TryStar(_)
        );
        let here = current + u32::from(nests);
        let mut deepest = here;
        for block in walk::child_blocks(stmt) {
            for child in block {
                deepest = deepest.max(depth_of(child, here));
            }
        }
        deepest
    }
    body.iter().map(|stmt| depth_of(stmt, 0)).max().unwrap_or(0)
}

fn is_literal_true(test: &ast::Expr) -> bool {
    match test {
        ast::Expr::Constant(c) => match &c.value {
            ast::Constant::Bool(b) => *b,
            ast::Constant::Int(i) => i.to_string() != "0",
            _ => false,
        },
        _ => false,
    }
}

fn contains_break(body: &[ast::Stmt]) -> bool {
    let mut found = false;
    walk::for_each_stmt(body, &mut |stmt| {
        if matches!(stmt, ast::Stmt::Break(_)) {
            found = true;
        }
    });
    found
}

fn comment_ratio(source: &str) -> f64 {
    let mut comment_lines = 0usize;
    let mut code_lines = 0usize;
    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            comment_lines += 1;
        } else if !trimmed.is_empty() {
            code_lines += 1;
        }
    }
    comment_lines as f64 / code_lines.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(source: &str) -> ComplexityReport {
        let policy = Policy::strict();
        ComplexityAnalyzer::new(&policy).analyze(source).unwrap()
    }

    #[test]
    fn test_zero_branch_function_has_cyclomatic_one() {
        let report = analyze(
            r#"
def construct_weights(df):
    total = df.sum()
    weights = df / total
    return weights
"#,
        );
        let metrics = &report.functions["construct_weights"];
        assert_eq!(metrics.cyclomatic, 1);
        assert_eq!(metrics.statements, 3);
        assert_eq!(metrics.max_nesting, 0);
        assert_eq!(metrics.returns, 1);
        assert_eq!(metrics.arguments, 1);
    }

    #[test]
    fn test_cyclomatic_monotonic_in_branches() {
        let flat = analyze("def f(x):\n    a = 1\n    b = 2\n    return a\n");
        let one_if = analyze("def f(x):\n    if x:\n        a = 1\n    return a\n");
        let two_if = analyze(
            "def f(x):\n    if x:\n        a = 1\n    if a:\n        b = 2\n    return a\n",
        );
        let c0 = flat.functions["f"].cyclomatic;
        let c1 = one_if.functions["f"].cyclomatic;
        let c2 = two_if.functions["f"].cyclomatic;
        assert_eq!(c0, 1);
        assert!(c1 > c0);
        assert!(c2 > c1);
    }

    #[test]
    fn test_boolean_and_adds_paths() {
        let report = analyze("def f(a, b, c):\n    if a and b and c:\n        return 1\n");
        // 1 base + 1 if + (3 operands - 1)
        assert_eq!(report.functions["f"].cyclomatic, 4);
    }

    #[test]
    fn test_nesting_counts_ancestry_not_siblings() {
        let report = analyze(
            r#"
def f(x):
    if x:
        for i in x:
            y = i
    if x:
        z = 1
"#,
        );
        assert_eq!(report.functions["f"].max_nesting, 2);
    }

    #[test]
    fn test_module_line_ceiling_is_hard_in_relaxed_mode() {
        let mut policy = Policy::relaxed();
        policy.max_module_lines = 3;
        let source = "a = 1\nb = 2\nc = 3\nd = 4\ne = 5\n";
        let err = ComplexityAnalyzer::new(&policy).analyze(source).unwrap_err();
        assert_eq!(err.kind(), "complexity_violation");
    }

    #[test]
    fn test_strict_mode_rejects_deep_nesting() {
        let mut policy = Policy::strict();
        policy.max_nesting = 2;
        let source = r#"
def f(x):
    if x:
        for i in x:
            while i:
                y = i
"#;
        let err = ComplexityAnalyzer::new(&policy).analyze(source).unwrap_err();
        assert!(err.to_string().contains("nesting"));
    }

    #[test]
    fn test_relaxed_mode_records_flags_and_completes() {
        let mut policy = Policy::relaxed();
        policy.max_nesting = 1;
        let source = r#"
def f(x):
    if x:
        for i in x:
            y = i

def g():
    return 1
"#;
        let report = ComplexityAnalyzer::new(&policy).analyze(source).unwrap();
        assert_eq!(report.threshold_flags.len(), 1);
        // Analysis ran to completion: later functions still measured.
        assert!(report.functions.contains_key("g"));
    }

    #[test]
    fn test_infinite_loop_risk_flagged() {
        let report = analyze(
            r#"
def spin():
    while True:
        x = 1

def bounded():
    while True:
        if done():
            break
"#,
        );
        assert_eq!(report.infinite_loop_risk, vec!["spin".to_string()]);
    }

    #[test]
    fn test_recursion_risk_direct_and_indirect() {
        let report = analyze(
            r#"
def a():
    return b()

def b():
    return a()

def c():
    return c()
"#,
        );
        assert!(report.recursion_risk.contains(&"c".to_string()));
        assert!(report.recursion_risk.contains(&"a->b".to_string()));
        assert!(report.recursion_risk.contains(&"b->a".to_string()));
    }

    #[test]
    fn test_module_metrics_counts() {
        let report = analyze(
            r#"
import pandas
from datetime import date

def f():
    return 1

class S:
    x = 1
    def run(self):
        return f()
"#,
        );
        assert_eq!(report.module.imports, 2);
        assert_eq!(report.module.functions, 2);
        assert_eq!(report.module.classes, 1);
        let class = &report.classes["S"];
        assert_eq!(class.methods, 1);
        assert_eq!(class.attributes, 1);
        assert_eq!(class.complexity_score, 3);
    }

    #[test]
    fn test_comment_ratio() {
        let report = analyze("# doc\n# more\nx = 1\ny = 2\n");
        assert!((report.module.comment_ratio - 1.0).abs() < 1e-9);
    }
}
