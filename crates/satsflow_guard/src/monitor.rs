//! Resource monitoring for one guarded strategy invocation.
//!
//! The monitor samples resident memory and process CPU time on a
//! half-second interval and enforces the policy ceilings. Sampling goes
//! through the [`UsageProbe`] trait so tests can script usage curves;
//! the default probe reads `/proc/self/status` and `/proc/self/stat`.
//!
//! One monitor per invocation. No background thread: heuristics are only
//! as fresh as the last `record_snapshot()`/`check_limits()` call.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use satsflow_security::{Policy, SecurityError};

const CHECK_INTERVAL: Duration = Duration::from_millis(500);
const LEAK_WINDOW: usize = 10;
const LEAK_GROWTH_THRESHOLD: f64 = 0.15;
const CPU_SUSTAINED_THRESHOLD: f64 = 80.0;

/// Source of process usage readings.
pub trait UsageProbe: Send {
    /// Resident set size in MB, if the platform exposes it.
    fn rss_mb(&mut self) -> Option<f64>;

    /// Accumulated process CPU time (user + system) in seconds.
    fn cpu_seconds(&mut self) -> Option<f64>;
}

/// Probe backed by procfs. On platforms without `/proc` every reading is
/// `None` and the monitor degrades to wall-clock enforcement only.
#[derive(Debug, Default)]
pub struct ProcProbe;

impl ProcProbe {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl UsageProbe for ProcProbe {
    fn rss_mb(&mut self) -> Option<f64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
        let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb / 1024.0)
    }

    fn cpu_seconds(&mut self) -> Option<f64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // Fields after the parenthesized comm; utime and stime are the
        // 14th and 15th fields of the full line.
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: f64 = fields.get(11)?.parse().ok()?;
        let stime: f64 = fields.get(12)?.parse().ok()?;
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks <= 0 {
            return None;
        }
        Some((utime + stime) / ticks as f64)
    }
}

#[cfg(not(target_os = "linux"))]
impl UsageProbe for ProcProbe {
    fn rss_mb(&mut self) -> Option<f64> {
        None
    }

    fn cpu_seconds(&mut self) -> Option<f64> {
        None
    }
}

/// One usage reading: seconds since monitor creation plus the sampled
/// value (MB for the memory history, percent for the CPU history).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsageSample {
    pub elapsed_seconds: f64,
    pub value: f64,
}

/// End-of-run usage summary for the event timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub max_memory_mb: f64,
    pub current_memory_mb: f64,
    pub cpu_seconds: f64,
    pub elapsed_seconds: f64,
    pub memory_history: Vec<UsageSample>,
    pub cpu_history: Vec<UsageSample>,
}

pub struct ResourceMonitor {
    policy: Policy,
    probe: Box<dyn UsageProbe>,
    started: Instant,
    check_interval: Duration,
    last_sample_at: Option<Instant>,
    max_memory_mb: f64,
    memory_history: Vec<UsageSample>,
    cpu_history: Vec<UsageSample>,
    last_cpu_seconds: f64,
    last_cpu_at: Instant,
    probe_warned: bool,
}

impl ResourceMonitor {
    pub fn new(policy: Policy) -> Self {
        Self::with_probe(policy, Box::new(ProcProbe::new()))
    }

    pub fn with_probe(policy: Policy, mut probe: Box<dyn UsageProbe>) -> Self {
        let now = Instant::now();
        let last_cpu_seconds = probe.cpu_seconds().unwrap_or(0.0);
        Self {
            policy,
            probe,
            started: now,
            check_interval: CHECK_INTERVAL,
            last_sample_at: None,
            max_memory_mb: 0.0,
            memory_history: Vec::new(),
            cpu_history: Vec::new(),
            last_cpu_seconds,
            last_cpu_at: now,
            probe_warned: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_check_interval(&mut self, interval: Duration) {
        self.check_interval = interval;
    }

    /// Seconds since the monitor was created.
    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Append one usage snapshot to the histories. Calls inside the
    /// sampling interval are no-ops, so cheap repeated checks cannot
    /// cause a sampling storm.
    pub fn record_snapshot(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_sample_at {
            if now.duration_since(last) < self.check_interval {
                return;
            }
        }

        let elapsed = self.elapsed_seconds();
        match self.probe.rss_mb() {
            Some(memory_mb) => {
                self.max_memory_mb = self.max_memory_mb.max(memory_mb);
                self.memory_history.push(UsageSample {
                    elapsed_seconds: elapsed,
                    value: memory_mb,
                });
            }
            None => self.warn_probe_unavailable(),
        }

        if let Some(cpu_seconds) = self.probe.cpu_seconds() {
            let wall_delta = now.duration_since(self.last_cpu_at).as_secs_f64();
            if wall_delta > 0.0 {
                let cpu_percent =
                    ((cpu_seconds - self.last_cpu_seconds) / wall_delta * 100.0).max(0.0);
                self.cpu_history.push(UsageSample {
                    elapsed_seconds: elapsed,
                    value: cpu_percent,
                });
            }
            self.last_cpu_seconds = cpu_seconds;
            self.last_cpu_at = now;
        }

        self.last_sample_at = Some(now);
    }

    /// Enforce the hard ceilings and the leak/abuse heuristics against
    /// the latest snapshot.
    pub fn check_limits(&mut self) -> Result<(), SecurityError> {
        self.record_snapshot();

        if let Some(sample) = self.memory_history.last() {
            if sample.value >= self.policy.max_memory_mb {
                return Err(SecurityError::ResourceViolation {
                    reason: format!(
                        "memory usage {:.2}MB reached limit {}MB",
                        sample.value, self.policy.max_memory_mb
                    ),
                });
            }
        }

        if self.last_cpu_seconds > self.policy.max_cpu_seconds {
            return Err(SecurityError::ResourceViolation {
                reason: format!(
                    "CPU time {:.2}s exceeded limit {}s",
                    self.last_cpu_seconds, self.policy.max_cpu_seconds
                ),
            });
        }

        let elapsed = self.elapsed_seconds();
        if elapsed > self.policy.max_wall_seconds {
            return Err(SecurityError::ResourceViolation {
                reason: format!(
                    "execution time {elapsed:.2}s exceeded limit {}s",
                    self.policy.max_wall_seconds
                ),
            });
        }

        self.check_for_memory_leak()?;
        self.check_for_cpu_abuse();
        Ok(())
    }

    /// Consistent-growth leak pattern over the last window of samples.
    /// Advisory, unless strict mode and memory is approaching the
    /// ceiling, in which case it escalates to a hard violation.
    fn check_for_memory_leak(&self) -> Result<(), SecurityError> {
        if self.memory_history.len() < LEAK_WINDOW {
            return Ok(());
        }
        let window = &self.memory_history[self.memory_history.len() - LEAK_WINDOW..];
        let start_mem = window[0].value;
        let end_mem = window[LEAK_WINDOW - 1].value;

        if end_mem <= start_mem * (1.0 + LEAK_GROWTH_THRESHOLD) {
            return Ok(());
        }
        let consistent = window.windows(2).all(|pair| pair[1].value >= pair[0].value);
        if !consistent {
            return Ok(());
        }

        let message =
            format!("potential memory leak detected: {start_mem:.2}MB -> {end_mem:.2}MB");
        if self.policy.is_strict()
            && end_mem > self.policy.max_memory_mb * self.policy.memory_escalation_ratio
        {
            return Err(SecurityError::ResourceViolation { reason: message });
        }
        warn!("{message}");
        Ok(())
    }

    /// Sustained high CPU is logged only; never escalated by itself.
    fn check_for_cpu_abuse(&self) {
        if self.cpu_history.len() < LEAK_WINDOW {
            return;
        }
        let window = &self.cpu_history[self.cpu_history.len() - LEAK_WINDOW..];
        let avg = window.iter().map(|s| s.value).sum::<f64>() / LEAK_WINDOW as f64;
        if avg > CPU_SUSTAINED_THRESHOLD {
            warn!("sustained high CPU usage detected: {avg:.2}%");
        }
    }

    pub fn usage_summary(&mut self) -> UsageSummary {
        UsageSummary {
            max_memory_mb: self.max_memory_mb,
            current_memory_mb: self.probe.rss_mb().unwrap_or(0.0),
            cpu_seconds: self.probe.cpu_seconds().unwrap_or(0.0),
            elapsed_seconds: self.elapsed_seconds(),
            memory_history: self.memory_history.clone(),
            cpu_history: self.cpu_history.clone(),
        }
    }

    fn warn_probe_unavailable(&mut self) {
        if !self.probe_warned {
            warn!("unable to read process usage; memory/CPU ceilings are not enforced");
            self.probe_warned = true;
        }
    }
}
