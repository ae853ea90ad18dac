//! Error taxonomy for strategy vetting and guarded execution.
//!
//! Every failure a caller can observe from `validate` or `guard` is one
//! variant of [`SecurityError`]. Advisory findings never travel through
//! this type; they live in reports and logs only.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SecurityError {
    /// Oversized source file or an excessively long single line.
    #[error("size violation: {reason}")]
    SizeViolation { reason: String },

    /// A dangerous construct matched the pattern table or the AST checks.
    #[error("dangerous pattern detected: {reason}")]
    DangerousPattern { reason: String },

    /// An import (static or resolved at guard time) outside the allow-list.
    #[error("import of module '{module}' is not allowed")]
    ImportViolation { module: String },

    /// A complexity threshold was breached in strict mode.
    #[error("complexity violation: {reason}")]
    ComplexityViolation { reason: String },

    /// Memory, CPU time or wall-clock ceiling breached (including an
    /// escalated leak pattern).
    #[error("resource violation: {reason}")]
    ResourceViolation { reason: String },

    /// Any other failure raised by guarded strategy code, wrapped with the
    /// original message preserved.
    #[error("strategy execution failed: {message}")]
    ExecutionFailure { message: String },
}

impl SecurityError {
    /// Short stable name for logging and event timelines.
    pub fn kind(&self) -> &'static str {
        match self {
            SecurityError::SizeViolation { .. } => "size_violation",
            SecurityError::DangerousPattern { .. } => "dangerous_pattern",
            SecurityError::ImportViolation { .. } => "import_violation",
            SecurityError::ComplexityViolation { .. } => "complexity_violation",
            SecurityError::ResourceViolation { .. } => "resource_violation",
            SecurityError::ExecutionFailure { .. } => "execution_failure",
        }
    }

    /// Whether this error came from the guarded code itself rather than a
    /// policy decision.
    pub fn is_execution_failure(&self) -> bool {
        matches!(self, SecurityError::ExecutionFailure { .. })
    }
}
