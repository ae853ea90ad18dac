//! Satsflow Runtime Strategy Guard
//!
//! Second phase of strategy security, applied while a vetted strategy
//! runs:
//! - **ImportGuard**: runtime module resolution against the policy
//!   allow-list, with abuse tracking
//! - **ResourceMonitor**: memory/CPU/wall-clock ceilings plus leak and
//!   sustained-CPU heuristics, sampled from procfs
//! - **StrategyGuard**: wraps a host callback with both, records an
//!   event timeline, and guarantees teardown on every exit path
//!
//! Vetting (see `satsflow_security`) decides whether a strategy may run
//! at all; this crate bounds what it can do once it does.

pub mod guard;
pub mod import_guard;
pub mod monitor;

pub use guard::{GuardContext, GuardEvent, GuardEventKind, StrategyGuard};
pub use import_guard::{ImportGuard, ImportSummary};
pub use monitor::{ProcProbe, ResourceMonitor, UsageProbe, UsageSample, UsageSummary};
