//! Resource accounting and host records.

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::types::{HostId, Stage};

/// Capacity of a host, or the requirement of one replica.
///
/// Memory and disk are in MiB, cpu in millicores, network in Mbit/s.
/// The `max_*` fields are per-instance ceilings checked by the agent probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeployResource {
    pub memory: i64,
    pub cpu: i64,
    pub net_in: i64,
    pub net_out: i64,
    pub disk_space: i64,
    pub max_allowed_memory: i64,
    #[serde(rename = "maxAllowedCPU")]
    pub max_allowed_cpu: i64,
    #[serde(rename = "maxAllowdThreads")]
    pub max_allowed_threads: i64,
}

impl DeployResource {
    pub fn new(memory: i64, cpu: i64) -> Self {
        Self {
            memory,
            cpu,
            ..Default::default()
        }
    }

    fn capacity_dims(&self) -> [i64; 5] {
        [
            self.memory,
            self.cpu,
            self.net_in,
            self.net_out,
            self.disk_space,
        ]
    }

    /// How many units of `required` fit into `self`.
    ///
    /// Returns the floor of the smallest ratio over the dimensions `required`
    /// actually asks for. An all-zero requirement fits without bound.
    pub fn divide(&self, required: &DeployResource) -> i64 {
        self.capacity_dims()
            .into_iter()
            .zip(required.capacity_dims())
            .filter(|(_, req)| *req > 0)
            .map(|(have, req)| have.div_euclid(req))
            .min()
            .unwrap_or(i64::MAX)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

macro_rules! elementwise {
    ($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident, $op:tt) => {
        impl $trait for DeployResource {
            type Output = DeployResource;

            fn $method(self, rhs: DeployResource) -> DeployResource {
                DeployResource {
                    memory: self.memory $op rhs.memory,
                    cpu: self.cpu $op rhs.cpu,
                    net_in: self.net_in $op rhs.net_in,
                    net_out: self.net_out $op rhs.net_out,
                    disk_space: self.disk_space $op rhs.disk_space,
                    max_allowed_memory: self.max_allowed_memory $op rhs.max_allowed_memory,
                    max_allowed_cpu: self.max_allowed_cpu $op rhs.max_allowed_cpu,
                    max_allowed_threads: self.max_allowed_threads $op rhs.max_allowed_threads,
                }
            }
        }

        impl $assign_trait for DeployResource {
            fn $assign_method(&mut self, rhs: DeployResource) {
                *self = *self $op rhs;
            }
        }
    };
}

elementwise!(Add, add, AddAssign, add_assign, +);
elementwise!(Sub, sub, SubAssign, sub_assign, -);

/// Static description of a host, published by its agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub id: HostId,
    pub host_name: String,
    pub ip: String,
    pub stage: Stage,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub capacity: DeployResource,
    #[serde(default)]
    pub cpu_count: u32,
    /// Unix seconds.
    #[serde(default)]
    pub updated_at: i64,
}

/// Live usage of a host. Stored with a short lease so dead hosts vanish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostStatus {
    pub id: HostId,
    pub used: DeployResource,
    pub load_avg: [f64; 3],
    pub num_instances: u32,
    pub updated_at: i64,
}

/// Operator policy for a host, keyed by host name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostConfig {
    pub host_name: String,
    /// Capacity held back from scheduling.
    pub reserved: DeployResource,
}
