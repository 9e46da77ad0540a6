//! Bounded per-controller phase history.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Entries kept per controller.
pub const PHASE_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    UpdateConfig,
    Start,
    SchedulerHosts,
    UpdateNodeConfig,
    WaitingInstanceUp,
    DeployUptodate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::UpdateConfig => "updateConfig",
            Phase::Start => "start",
            Phase::SchedulerHosts => "schedulerHosts",
            Phase::UpdateNodeConfig => "updateNodeConfig",
            Phase::WaitingInstanceUp => "waitingInstanceUp",
            Phase::DeployUptodate => "deployUptodate",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseEntry {
    pub phase: Phase,
    pub at: DateTime<Utc>,
    pub detail: String,
}

/// Ring of the most recent phases; the oldest entry falls off when full.
#[derive(Debug)]
pub struct PhaseLog {
    entries: VecDeque<PhaseEntry>,
    capacity: usize,
}

impl Default for PhaseLog {
    fn default() -> Self {
        Self::with_capacity(PHASE_LOG_CAPACITY)
    }
}

impl PhaseLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, phase: Phase, detail: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(PhaseEntry {
            phase,
            at: Utc::now(),
            detail: detail.into(),
        });
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<PhaseEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest() {
        let mut log = PhaseLog::with_capacity(3);
        for i in 0..5 {
            log.record(Phase::UpdateNodeConfig, format!("host-{i}"));
        }
        assert_eq!(log.len(), 3);
        let details: Vec<_> = log.tail(10).into_iter().map(|e| e.detail).collect();
        assert_eq!(details, ["host-2", "host-3", "host-4"]);
        assert_eq!(log.tail(1)[0].detail, "host-4");
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::WaitingInstanceUp.to_string(), "waitingInstanceUp");
        assert_eq!(
            serde_json::to_string(&Phase::DeployUptodate).unwrap(),
            "\"deployUptodate\""
        );
    }
}
