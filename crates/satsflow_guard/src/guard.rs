//! Guarded execution of one vetted strategy invocation.
//!
//! [`StrategyGuard::run`] wraps a host callback with an import guard and
//! a resource monitor, records an event timeline, and guarantees the
//! end-of-run summary events are emitted on every exit path. Arbitrary
//! callback errors are wrapped as `ExecutionFailure`; security errors
//! raised inside the callback propagate with their kind intact.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use satsflow_security::{Policy, SecurityError};

use crate::import_guard::{ImportGuard, ImportSummary};
use crate::monitor::{ResourceMonitor, UsageSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardEventKind {
    Start,
    Warning,
    ResourceUsage,
    Complete,
    Violation,
}

/// One entry in the invocation timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardEvent {
    pub elapsed_seconds: f64,
    pub kind: GuardEventKind,
    pub detail: String,
}

/// Capabilities handed to the guarded callback. The callback resolves
/// imports and checkpoints resource usage through this; it has no other
/// channel to the guard's internals.
pub struct GuardContext<'a> {
    imports: &'a mut ImportGuard,
    monitor: &'a mut ResourceMonitor,
}

impl GuardContext<'_> {
    /// Resolve a module against the allow-list.
    pub fn import(&mut self, module: &str) -> Result<(), SecurityError> {
        self.imports.resolve(module)
    }

    /// Sample usage and enforce the resource ceilings. Long-running
    /// strategies call this from their inner loops; ceilings are only
    /// enforced as often as checkpoints happen.
    pub fn checkpoint(&mut self) -> Result<(), SecurityError> {
        self.monitor.check_limits()
    }
}

/// One guard per invocation. Construct fresh for each strategy run so
/// import counts, usage histories and the event timeline start empty.
pub struct StrategyGuard {
    imports: ImportGuard,
    monitor: ResourceMonitor,
    events: Vec<GuardEvent>,
    started: Instant,
}

impl StrategyGuard {
    pub fn new(policy: Policy) -> Self {
        Self {
            imports: ImportGuard::new(policy.clone()),
            monitor: ResourceMonitor::new(policy),
            events: Vec::new(),
            started: Instant::now(),
        }
    }

    #[cfg(test)]
    fn with_monitor(policy: Policy, monitor: ResourceMonitor) -> Self {
        Self {
            imports: ImportGuard::new(policy),
            monitor,
            events: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Execute `callback` under guard. On success the resource limits
    /// are checked one final time before the value is released. Teardown
    /// events are recorded on every path, violation or not.
    pub fn run<T>(
        &mut self,
        strategy: &str,
        callback: impl FnOnce(&mut GuardContext<'_>) -> anyhow::Result<T>,
    ) -> Result<T, SecurityError> {
        info!(strategy, "guarded execution starting");
        self.push_event(GuardEventKind::Start, format!("strategy '{strategy}'"));

        let outcome = {
            let mut ctx = GuardContext {
                imports: &mut self.imports,
                monitor: &mut self.monitor,
            };
            callback(&mut ctx)
        };

        let result = match outcome {
            Ok(value) => self.monitor.check_limits().map(|()| value),
            Err(err) => Err(Self::into_security_error(err)),
        };

        self.teardown(strategy, result.as_ref().err());
        result
    }

    fn teardown(&mut self, strategy: &str, violation: Option<&SecurityError>) {
        let imports = self.imports.summary();
        if !imports.suspicious.is_empty() {
            let detail = format!("suspicious module usage: {}", imports.suspicious.join(", "));
            warn!(strategy, "{detail}");
            self.push_event(GuardEventKind::Warning, detail);
        }

        let usage = self.monitor.usage_summary();
        self.push_event(
            GuardEventKind::ResourceUsage,
            format!(
                "peak memory {:.2}MB, cpu {:.2}s, elapsed {:.2}s",
                usage.max_memory_mb, usage.cpu_seconds, usage.elapsed_seconds
            ),
        );

        match violation {
            None => {
                info!(strategy, "guarded execution complete");
                self.push_event(GuardEventKind::Complete, format!("strategy '{strategy}'"));
            }
            Some(err) => {
                error!(strategy, kind = err.kind(), "guarded execution failed: {err}");
                self.push_event(GuardEventKind::Violation, err.to_string());
            }
        }
    }

    /// Security errors surfaced through `anyhow` keep their kind; any
    /// other callback error becomes an `ExecutionFailure` carrying the
    /// original message.
    fn into_security_error(err: anyhow::Error) -> SecurityError {
        match err.downcast::<SecurityError>() {
            Ok(sec) => sec,
            Err(other) => SecurityError::ExecutionFailure {
                message: format!("{other:#}"),
            },
        }
    }

    fn push_event(&mut self, kind: GuardEventKind, detail: String) {
        self.events.push(GuardEvent {
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            kind,
            detail,
        });
    }

    pub fn events(&self) -> &[GuardEvent] {
        &self.events
    }

    pub fn usage_summary(&mut self) -> UsageSummary {
        self.monitor.usage_summary()
    }

    pub fn import_summary(&self) -> ImportSummary {
        self.imports.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn kinds(guard: &StrategyGuard) -> Vec<GuardEventKind> {
        guard.events().iter().map(|event| event.kind).collect()
    }

    #[test]
    fn test_successful_run_returns_value_and_completes() {
        let mut guard = StrategyGuard::new(Policy::relaxed());
        let value = guard
            .run("momentum", |ctx| {
                ctx.import("pandas")?;
                ctx.checkpoint()?;
                Ok(42)
            })
            .unwrap();
        assert_eq!(value, 42);
        let kinds = kinds(&guard);
        assert_eq!(kinds.first(), Some(&GuardEventKind::Start));
        assert_eq!(kinds.last(), Some(&GuardEventKind::Complete));
        assert!(kinds.contains(&GuardEventKind::ResourceUsage));
    }

    #[test]
    fn test_denied_import_propagates_as_import_violation() {
        let mut guard = StrategyGuard::new(Policy::strict());
        let err = guard
            .run("exfil", |ctx| {
                ctx.import("socket")?;
                Ok(())
            })
            .unwrap_err();
        match err {
            SecurityError::ImportViolation { module } => assert_eq!(module, "socket"),
            other => panic!("unexpected error: {other}"),
        }
        let kinds = kinds(&guard);
        assert_eq!(kinds.last(), Some(&GuardEventKind::Violation));
        assert!(kinds.contains(&GuardEventKind::Warning));
    }

    #[test]
    fn test_arbitrary_error_is_wrapped_preserving_message() {
        let mut guard = StrategyGuard::new(Policy::relaxed());
        let err = guard
            .run("broken", |_ctx| -> anyhow::Result<()> {
                Err(anyhow!("division by zero in weight computation"))
            })
            .unwrap_err();
        assert!(err.is_execution_failure());
        assert!(err.to_string().contains("division by zero in weight computation"));
    }

    #[test]
    fn test_fresh_guard_starts_with_no_state() {
        let policy = Policy::strict();
        let mut first = StrategyGuard::new(policy.clone());
        let _ = first.run("bad", |ctx| {
            ctx.import("socket")?;
            Ok(())
        });
        assert!(!first.import_summary().counts.is_empty());

        let second = StrategyGuard::new(policy);
        assert!(second.import_summary().counts.is_empty());
        assert!(second.import_summary().suspicious.is_empty());
        assert!(second.events().is_empty());
    }

    #[test]
    fn test_final_limit_check_catches_violation_after_callback_returns() {
        use crate::monitor::{ResourceMonitor, UsageProbe};
        use std::time::Duration;

        struct HungryProbe;
        impl UsageProbe for HungryProbe {
            fn rss_mb(&mut self) -> Option<f64> {
                Some(9000.0)
            }
            fn cpu_seconds(&mut self) -> Option<f64> {
                Some(0.0)
            }
        }

        let mut policy = Policy::strict();
        policy.max_memory_mb = 512.0;
        let mut monitor = ResourceMonitor::with_probe(policy.clone(), Box::new(HungryProbe));
        monitor.set_check_interval(Duration::ZERO);
        let mut guard = StrategyGuard::with_monitor(policy, monitor);

        let err = guard.run("greedy", |_ctx| Ok(())).unwrap_err();
        assert_eq!(err.kind(), "resource_violation");
        assert_eq!(kinds(&guard).last(), Some(&GuardEventKind::Violation));
    }
}
