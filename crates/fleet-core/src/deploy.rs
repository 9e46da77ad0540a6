//! Declared deployment state and its validation.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::resource::DeployResource;
use crate::selector::Selector;
use crate::types::{DeployKey, DeployVer, ProjectType, Stage};

/// Default pause between two mutations of one reconciliation pass.
pub const DEFAULT_STEP: Duration = Duration::from_secs(30);

/// Default bound on a rollout wait, also the legacy-version lease.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

static IMAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*/[a-z0-9]+(?:[._-][a-z0-9]+)*$")
        .unwrap_or_else(|e| panic!("image name pattern: {e}"))
});

/// Check a version string is `v` followed by a semantic version.
pub fn validate_version(version: &str) -> CoreResult<()> {
    let bare = version
        .strip_prefix('v')
        .ok_or_else(|| CoreError::Validation(format!("version {version:?} must start with 'v'")))?;
    semver::Version::parse(bare)
        .map(|_| ())
        .map_err(|e| CoreError::Validation(format!("version {version:?}: {e}")))
}

/// Check an image name has the `<ns>/<name>` shape with lowercase segments.
pub fn validate_image_name(name: &str) -> CoreResult<()> {
    if IMAGE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "image name {name:?} must look like <ns>/<name> in lowercase"
        )))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImagePullPolicy {
    #[default]
    IfNotPresent,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub name: String,
    pub version: DeployVer,
    #[serde(default)]
    pub update_policy: ImagePullPolicy,
}

impl Image {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            update_policy: ImagePullPolicy::default(),
        }
    }

    /// `name:version`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

/// How the agent lays out a new version on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployPolicy {
    #[default]
    Inplace,
    Abworld,
    Versioned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Run once; the process may exit shortly after start.
    Onetime,
    #[default]
    Always,
    /// Keep restarting until the given instant.
    Until { until: DateTime<Utc> },
}

/// Replica update strategy with its timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UpdateOption", into = "UpdateOption")]
pub enum UpdatePolicy {
    RollingUpdate {
        step: Duration,
        timeout: Duration,
    },
    NewDeploy {
        step: Duration,
        timeout: Duration,
    },
    /// `new_percent` is a fraction in `[0, 1]`.
    Mixed {
        new_percent: f64,
        step: Duration,
        timeout: Duration,
    },
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        UpdatePolicy::RollingUpdate {
            step: DEFAULT_STEP,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl UpdatePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            UpdatePolicy::RollingUpdate { .. } => "rollingUpdate",
            UpdatePolicy::NewDeploy { .. } => "newDeploy",
            UpdatePolicy::Mixed { .. } => "mixed",
        }
    }

    pub fn step(&self) -> Duration {
        match self {
            UpdatePolicy::RollingUpdate { step, .. }
            | UpdatePolicy::NewDeploy { step, .. }
            | UpdatePolicy::Mixed { step, .. } => *step,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            UpdatePolicy::RollingUpdate { timeout, .. }
            | UpdatePolicy::NewDeploy { timeout, .. }
            | UpdatePolicy::Mixed { timeout, .. } => *timeout,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.step() > self.timeout() {
            return Err(CoreError::Validation(format!(
                "update step {:?} exceeds timeout {:?}",
                self.step(),
                self.timeout()
            )));
        }
        if let UpdatePolicy::Mixed { new_percent, .. } = self {
            if !(0.0..=1.0).contains(new_percent) {
                return Err(CoreError::Validation(format!(
                    "mixed newPercent {new_percent} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

fn default_step_secs() -> u64 {
    DEFAULT_STEP.as_secs()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Wire form of [`UpdatePolicy`]: seconds and a percentage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOption {
    pub policy: String,
    #[serde(default = "default_step_secs")]
    pub step: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub new_percent: f64,
}

impl TryFrom<UpdateOption> for UpdatePolicy {
    type Error = CoreError;

    fn try_from(opt: UpdateOption) -> Result<Self, Self::Error> {
        if opt.step > opt.timeout {
            return Err(CoreError::Validation(format!(
                "update step {}s exceeds timeout {}s",
                opt.step, opt.timeout
            )));
        }
        let step = Duration::from_secs(opt.step);
        let timeout = Duration::from_secs(opt.timeout);
        match opt.policy.as_str() {
            "rollingUpdate" => Ok(UpdatePolicy::RollingUpdate { step, timeout }),
            "newDeploy" => Ok(UpdatePolicy::NewDeploy { step, timeout }),
            "mixed" => {
                if !(0.0..=100.0).contains(&opt.new_percent) {
                    return Err(CoreError::Validation(format!(
                        "newPercent {} outside [0, 100]",
                        opt.new_percent
                    )));
                }
                Ok(UpdatePolicy::Mixed {
                    new_percent: opt.new_percent / 100.0,
                    step,
                    timeout,
                })
            }
            other => Err(CoreError::Validation(format!("unknown update policy {other:?}"))),
        }
    }
}

impl From<UpdatePolicy> for UpdateOption {
    fn from(policy: UpdatePolicy) -> Self {
        let new_percent = match &policy {
            UpdatePolicy::Mixed { new_percent, .. } => new_percent * 100.0,
            _ => 0.0,
        };
        UpdateOption {
            policy: policy.name().to_string(),
            step: policy.step().as_secs(),
            timeout: policy.timeout().as_secs(),
            new_percent,
        }
    }
}

/// Declared desired state of one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    pub stage: Stage,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    pub name: String,
    pub num_of_instance: u32,
    #[serde(default)]
    pub service_type: String,
    pub image: Image,
    #[serde(default)]
    pub deploy_dir: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub deploy_policy: DeployPolicy,
    #[serde(default)]
    pub selector: Selector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_required: Option<DeployResource>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub update_policy: UpdatePolicy,
}

impl DeployConfig {
    pub fn new(stage: Stage, key: &DeployKey, num_of_instance: u32, image: Image) -> Self {
        Self {
            stage,
            project_type: key.project_type.clone(),
            name: key.name.clone(),
            num_of_instance,
            service_type: String::new(),
            image,
            deploy_dir: String::new(),
            values: BTreeMap::new(),
            deploy_policy: DeployPolicy::default(),
            selector: Selector::default(),
            resource_required: None,
            restart_policy: RestartPolicy::default(),
            update_policy: UpdatePolicy::default(),
        }
    }

    pub fn deploy_key(&self) -> DeployKey {
        DeployKey::new(self.project_type.clone(), self.name.clone())
    }

    pub fn expected_version(&self) -> &str {
        &self.image.version
    }

    /// Reject declared state the controller cannot act on.
    pub fn validate(&self) -> CoreResult<()> {
        if self.project_type.as_str().is_empty() || self.project_type.as_str().contains('/') {
            return Err(CoreError::Validation(format!(
                "invalid project type {:?}",
                self.project_type.as_str()
            )));
        }
        if self.name.is_empty() || self.name.contains('/') {
            return Err(CoreError::Validation(format!(
                "invalid deploy name {:?}",
                self.name
            )));
        }
        validate_image_name(&self.image.name)?;
        validate_version(&self.image.version)?;
        self.update_policy.validate()?;
        Ok(())
    }
}

/// Expected and fallback version of one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionInfo {
    pub expected: DeployVer,
    pub backup: DeployVer,
}

impl VersionInfo {
    /// Make `version` the expected one, keeping the previous as backup.
    pub fn add_version(&mut self, version: &str) {
        if self.expected == version {
            return;
        }
        if !self.expected.is_empty() {
            self.backup = std::mem::take(&mut self.expected);
        }
        self.expected = version.to_string();
    }
}
