//! Satsflow Strategy Security Module
//!
//! Static vetting of untrusted strategy submissions before their first
//! execution:
//! - **ComplexityAnalyzer**: AST-based complexity metrics and thresholds
//! - **DataFlowAnalyzer**: taint tracking from external data to sensitive
//!   operations
//! - **StrategyVetter**: orchestrates both plus the dangerous-pattern
//!   table and the import allow-list into `validate`
//!
//! **Design Philosophy:**
//! Static analysis in Rust, not runtime validation inside the strategy
//! interpreter. Vetting is a pure function of the source text.

pub mod complexity;
pub mod dataflow;
pub mod error;
pub mod patterns;
pub mod policy;
pub mod vetting;
pub mod walk;

pub use complexity::{ComplexityAnalyzer, ComplexityReport, FunctionMetrics, ModuleMetrics};
pub use dataflow::{DataFlowAnalyzer, FindingKind, TaintSource, TaintState, VulnerabilityFinding};
pub use error::SecurityError;
pub use policy::{Mode, Policy};
pub use vetting::{StrategyVetter, VettingReport};
