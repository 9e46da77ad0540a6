//! Per-host desired replica counts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::DeployVer;

/// Desired replicas of one version on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSpec {
    pub num: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

/// Desired replica counts on one host for one deploy key.
///
/// An empty spec is never stored; writers delete the key instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySpec {
    #[serde(default)]
    pub info: BTreeMap<DeployVer, VersionSpec>,
}

impl DeploySpec {
    pub fn single(version: &str, num: u32) -> Self {
        let mut spec = Self::default();
        if num > 0 {
            spec.info.insert(
                version.to_string(),
                VersionSpec {
                    num,
                    values: BTreeMap::new(),
                },
            );
        }
        spec
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }

    pub fn num(&self, version: &str) -> u32 {
        self.info.get(version).map_or(0, |v| v.num)
    }

    pub fn total(&self) -> u32 {
        self.info.values().map(|v| v.num).sum()
    }

    /// Replicas of any version other than `expected`.
    pub fn legacy_count(&self, expected: &str) -> u32 {
        self.info
            .iter()
            .filter(|(ver, _)| ver.as_str() != expected)
            .map(|(_, v)| v.num)
            .sum()
    }

    pub fn has_legacy(&self, expected: &str) -> bool {
        self.legacy_count(expected) > 0
    }

    /// Add one replica of `version`, refreshing its values.
    pub fn bump(&mut self, version: &str, values: &BTreeMap<String, String>) {
        let entry = self.info.entry(version.to_string()).or_default();
        entry.num += 1;
        entry.values = values.clone();
    }

    /// Remove one replica of `version`. Returns false when there was none.
    pub fn decrement(&mut self, version: &str) -> bool {
        let Some(entry) = self.info.get_mut(version) else {
            return false;
        };
        entry.num = entry.num.saturating_sub(1);
        if entry.num == 0 {
            self.info.remove(version);
        }
        true
    }

    /// Remove one replica of the first version that is not `expected`.
    pub fn decrement_legacy(&mut self, expected: &str) -> Option<DeployVer> {
        let legacy = self
            .info
            .keys()
            .find(|ver| ver.as_str() != expected)
            .cloned()?;
        self.decrement(&legacy);
        Some(legacy)
    }

    /// Drop every version except `expected`. Returns how many replicas went away.
    pub fn retain_only(&mut self, expected: &str) -> u32 {
        let removed = self.legacy_count(expected);
        self.info.retain(|ver, _| ver.as_str() == expected);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_decrement() {
        let mut spec = DeploySpec::default();
        spec.bump("v1.0.0", &BTreeMap::new());
        spec.bump("v1.0.0", &BTreeMap::new());
        assert_eq!(spec.num("v1.0.0"), 2);
        assert!(spec.decrement("v1.0.0"));
        assert!(spec.decrement("v1.0.0"));
        assert!(spec.is_empty());
        assert!(!spec.decrement("v1.0.0"));
    }

    #[test]
    fn legacy_accounting() {
        let mut spec = DeploySpec::single("v1.0.0", 2);
        spec.bump("v1.1.0", &BTreeMap::new());
        assert_eq!(spec.total(), 3);
        assert_eq!(spec.legacy_count("v1.1.0"), 2);

        assert_eq!(spec.decrement_legacy("v1.1.0").as_deref(), Some("v1.0.0"));
        assert_eq!(spec.retain_only("v1.1.0"), 1);
        assert_eq!(spec, DeploySpec::single("v1.1.0", 1));
        assert_eq!(spec.decrement_legacy("v1.1.0"), None);
    }

    #[test]
    fn single_with_zero_is_empty() {
        assert!(DeploySpec::single("v1", 0).is_empty());
    }
}
