//! Default resource requirements per project type.

use std::collections::HashMap;

use crate::resource::DeployResource;
use crate::types::ProjectType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTier {
    pub small: DeployResource,
    pub medium: DeployResource,
    pub large: DeployResource,
}

/// Registry consulted when a deploy config declares no requirement.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct DefaultResources {
    tiers: HashMap<ProjectType, ResourceTier>,
}

fn sized(memory: i64, cpu: i64, threads: i64) -> DeployResource {
    DeployResource {
        memory,
        cpu,
        disk_space: memory * 2,
        max_allowed_memory: memory * 2,
        max_allowed_cpu: cpu * 4,
        max_allowed_threads: threads,
        ..Default::default()
    }
}

impl DefaultResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tiers for the project types shipped with the agent.
    pub fn builtin() -> Self {
        Self::new()
            .with(
                ProjectType::java(),
                ResourceTier {
                    small: sized(512, 500, 200),
                    medium: sized(2048, 1000, 500),
                    large: sized(8192, 4000, 1500),
                },
            )
            .with(
                ProjectType::redis(),
                ResourceTier {
                    small: sized(256, 250, 32),
                    medium: sized(1024, 500, 64),
                    large: sized(4096, 1000, 128),
                },
            )
    }

    pub fn with(mut self, project_type: ProjectType, tier: ResourceTier) -> Self {
        self.tiers.insert(project_type, tier);
        self
    }

    pub fn tier(&self, project_type: &ProjectType) -> Option<&ResourceTier> {
        self.tiers.get(project_type)
    }

    pub fn medium(&self, project_type: &ProjectType) -> Option<DeployResource> {
        self.tier(project_type).map(|t| t.medium)
    }
}
