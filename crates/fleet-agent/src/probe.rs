//! Resource probes and status tracking for one instance.
//!
//! A reading over 80% of the configured ceiling, or over 150% of what the
//! deployment declared, is a warning event. A reading over the ceiling is a
//! condition and turns the instance status to error.

use std::collections::VecDeque;
use std::time::Duration;

use fleet_core::{DeployResource, Finding, Instance, ProbeStatus, ResourceUsage};
use tokio::time::Instant;

pub const WARN_OF_MAX: f64 = 0.8;
pub const WARN_OF_REQUIRED: f64 = 1.5;
pub const DISK_WINDOW: Duration = Duration::from_secs(5 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Findings {
    pub conditions: Vec<Finding>,
    pub events: Vec<Finding>,
}

impl Findings {
    fn classify(&mut self, kind: &str, value: f64, max: f64, required: f64, unit: &str) {
        if max > 0.0 && value > max {
            self.conditions.push(Finding::new(
                kind,
                format!("{value:.0}{unit} over limit {max:.0}{unit}"),
            ));
        } else if max > 0.0 && value > max * WARN_OF_MAX {
            self.events.push(Finding::new(
                kind,
                format!("{value:.0}{unit} above 80% of limit {max:.0}{unit}"),
            ));
        } else if required > 0.0 && value > required * WARN_OF_REQUIRED {
            self.events.push(Finding::new(
                kind,
                format!("{value:.0}{unit} above 150% of request {required:.0}{unit}"),
            ));
        }
    }
}

/// Memory, thread and CPU checks against the deployment's resources.
///
/// CPU is compared in millicores: 100% of one core is 1000.
pub fn check_resources(usage: &ResourceUsage, required: &DeployResource) -> Findings {
    let mut findings = Findings::default();
    findings.classify(
        "memory",
        usage.memory as f64,
        required.max_allowed_memory as f64,
        required.memory as f64,
        "MiB",
    );
    findings.classify(
        "threads",
        usage.threads as f64,
        required.max_allowed_threads as f64,
        0.0,
        "",
    );
    findings.classify(
        "cpu",
        usage.cpu_percent * 10.0,
        required.max_allowed_cpu as f64,
        required.cpu as f64,
        "m",
    );
    findings
}

/// Sliding window over cumulative bytes written, extrapolated to a day.
#[derive(Debug)]
pub struct DiskWriteWindow {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    /// Daily budget in MiB.
    budget_mib: f64,
}

impl DiskWriteWindow {
    pub fn new(budget_mib_per_day: u64) -> Self {
        Self {
            samples: VecDeque::new(),
            window: DISK_WINDOW,
            budget_mib: budget_mib_per_day as f64,
        }
    }

    pub fn record(&mut self, at: Instant, total_written: u64) {
        self.samples.push_back((at, total_written));
        while self
            .samples
            .get(1)
            .is_some_and(|(t, _)| at.duration_since(*t) >= self.window)
        {
            self.samples.pop_front();
        }
    }

    /// MiB per day at the rate seen across the window, once the window is full.
    pub fn daily_rate(&self) -> Option<f64> {
        let (first_at, first) = self.samples.front()?;
        let (last_at, last) = self.samples.back()?;
        let span = last_at.duration_since(*first_at);
        if span < self.window {
            return None;
        }
        let written = last.saturating_sub(*first) as f64 / MIB;
        Some(written * DAY.as_secs_f64() / span.as_secs_f64())
    }

    pub fn check(&self, findings: &mut Findings) {
        if let Some(rate) = self.daily_rate() {
            findings.classify("diskWrite", rate, self.budget_mib, 0.0, "MiB/d");
        }
    }
}

/// What an instance status transition means to the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    ProbeErr,
    ProbeWarn,
    Recovered,
}

/// Remembers the last status so only changes are reported.
#[derive(Debug, Default)]
pub struct StatusTracker {
    status: ProbeStatus,
}

impl StatusTracker {
    pub fn status(&self) -> ProbeStatus {
        self.status
    }

    /// Apply `findings` to `ins`, returning the transition if the status moved.
    pub fn apply(&mut self, ins: &mut Instance, findings: Findings) -> Option<Transition> {
        ins.conditions = findings.conditions;
        ins.events = findings.events;
        ins.status = ins.derive_status();
        if ins.status == self.status {
            return None;
        }
        self.status = ins.status;
        match ins.status {
            ProbeStatus::Error => Some(Transition::ProbeErr),
            ProbeStatus::Warning => Some(Transition::ProbeWarn),
            ProbeStatus::Success => Some(Transition::Recovered),
            ProbeStatus::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::DeployKey;

    fn limits() -> DeployResource {
        DeployResource {
            memory: 1000,
            cpu: 1000,
            max_allowed_memory: 2000,
            max_allowed_cpu: 4000,
            max_allowed_threads: 100,
            ..Default::default()
        }
    }

    #[test]
    fn thresholds() {
        let usage = |memory, cpu_percent, threads| ResourceUsage {
            memory,
            cpu_percent,
            threads,
            ..Default::default()
        };

        let ok = check_resources(&usage(1400, 50.0, 10), &limits());
        assert_eq!(ok, Findings::default());

        // over 150% of the request
        let f = check_resources(&usage(1600, 50.0, 10), &limits());
        assert_eq!(f.events.len(), 1);
        assert!(f.conditions.is_empty());

        // over 80% of the ceiling
        let f = check_resources(&usage(100, 50.0, 81), &limits());
        assert_eq!(f.events[0].kind, "threads");

        // over the ceiling
        let f = check_resources(&usage(2100, 450.0, 10), &limits());
        let kinds: Vec<&str> = f.conditions.iter().map(|c| c.kind.as_str()).collect();
        assert_eq!(kinds, ["memory", "cpu"]);
    }

    #[test]
    fn disk_window_needs_full_span() {
        let mut w = DiskWriteWindow::new(1024);
        let t0 = Instant::now();
        let mib = 1024 * 1024;
        w.record(t0, 0);
        w.record(t0 + Duration::from_secs(60), 10 * mib);
        assert_eq!(w.daily_rate(), None);

        // 20 MiB in 5 minutes → 5760 MiB/day
        w.record(t0 + DISK_WINDOW, 20 * mib);
        let rate = w.daily_rate().unwrap();
        assert!((rate - 5760.0).abs() < 1e-6, "{rate}");

        let mut findings = Findings::default();
        w.check(&mut findings);
        assert_eq!(findings.conditions[0].kind, "diskWrite");

        // old samples fall out of the window
        w.record(t0 + DISK_WINDOW * 2, 20 * mib);
        assert_eq!(w.daily_rate(), Some(0.0));
    }

    #[test]
    fn repeated_failures_report_once() {
        let key = DeployKey::new("java", "foo:bar");
        let mut ins = Instance::sample(&key, "i-1", "h1", "v1");
        let mut tracker = StatusTracker::default();
        let failing = || Findings {
            conditions: vec![Finding::new("probe", "fail=1")],
            events: Vec::new(),
        };

        let transitions: Vec<_> = (0..5)
            .filter_map(|_| tracker.apply(&mut ins, failing()))
            .collect();
        assert_eq!(transitions, [Transition::ProbeErr]);
        assert_eq!(ins.status, ProbeStatus::Error);

        assert_eq!(tracker.apply(&mut ins, Findings::default()), Some(Transition::Recovered));
        assert_eq!(ins.status, ProbeStatus::Success);
    }
}
