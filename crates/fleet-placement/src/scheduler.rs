//! Host selection for one deploy key.

use std::collections::{BTreeMap, HashMap, HashSet};

use fleet_core::keyspace::{HOST_CONFIG, HOST_INFO, HOST_STAT};
use fleet_core::{DeployKey, DeployResource, HostConfig, HostId, HostInfo, HostStatus, Selector};
use fleet_store::{Attrs, Predicate, Store};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Random picks tried per call before giving up.
pub const MAX_ATTEMPTS: usize = 50;

struct Candidates {
    hosts: Vec<HostInfo>,
    reserved: HashMap<String, DeployResource>,
    used: BTreeMap<HostId, DeployResource>,
}

/// Stateful host picker. Each successful call consumes a candidate.
pub struct Scheduler {
    store: Store,
    key: DeployKey,
    selector: Selector,
    required: DeployResource,
    exclude: HashSet<HostId>,
    candidates: Option<Candidates>,
    /// Co-located hosts seen so far, handed out once fresh hosts run out.
    fallback: Vec<HostId>,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(store: Store, key: DeployKey, selector: Selector, required: DeployResource) -> Self {
        Self {
            store,
            key,
            selector,
            required,
            exclude: HashSet::new(),
            candidates: None,
            fallback: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Hosts that already carry this deployment.
    pub fn exclude(mut self, hosts: impl IntoIterator<Item = HostId>) -> Self {
        self.exclude.extend(hosts);
        self
    }

    /// Deterministic picks for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    async fn load(&self) -> SchedulerResult<Candidates> {
        let selector = self.selector.clone();
        let predicate = Predicate::new(selector, Selector::everything(), |host: &HostInfo| Attrs {
            labels: host.labels.clone(),
            fields: BTreeMap::new(),
        });
        let mut hosts: Vec<HostInfo> = self.store.list(HOST_INFO, &predicate).await?;
        if hosts.is_empty() {
            return Err(SchedulerError::NoHostMeetCondition(self.key.to_string()));
        }

        let reserved = self
            .store
            .list::<HostConfig>(HOST_CONFIG, &Predicate::everything())
            .await?
            .into_iter()
            .map(|cfg| (cfg.host_name, cfg.reserved))
            .collect();
        let used: BTreeMap<HostId, DeployResource> = self
            .store
            .list::<HostStatus>(HOST_STAT, &Predicate::everything())
            .await?
            .into_iter()
            .map(|stat| (stat.id, stat.used))
            .collect();

        // The status record is leased by the host's agent; no record, no agent.
        hosts.retain(|host| {
            let live = used.contains_key(&host.id);
            if !live {
                debug!(deploy = %self.key, host = %host.id, "host has no live status, skipped");
            }
            live
        });
        if hosts.is_empty() {
            return Err(SchedulerError::NoHostMeetCondition(self.key.to_string()));
        }

        debug!(deploy = %self.key, candidates = hosts.len(), "scheduler candidates loaded");
        Ok(Candidates {
            hosts,
            reserved,
            used,
        })
    }

    /// Pick the next host for one new replica.
    ///
    /// On `AlreadyExists` the carried host is a usable last resort.
    pub async fn next_host(&mut self) -> SchedulerResult<HostId> {
        if self.candidates.is_none() {
            self.candidates = Some(self.load().await?);
        }
        let Some(cands) = self.candidates.as_mut() else {
            return Err(SchedulerError::NoHostMeetCondition(self.key.to_string()));
        };

        let mut last_err = None;
        for _ in 0..MAX_ATTEMPTS {
            if cands.hosts.is_empty() {
                break;
            }
            let idx = self.rng.gen_range(0..cands.hosts.len());
            let host = cands.hosts.swap_remove(idx);

            let reserved = cands.reserved.get(&host.host_name).copied().unwrap_or_default();
            let used = cands.used.get(&host.id).copied().unwrap_or_default();
            let free = host.capacity - reserved - used;
            if free.divide(&self.required) <= 0 {
                debug!(deploy = %self.key, host = %host.id, "host short of resource");
                last_err = Some(SchedulerError::ShortOfResource(host.id));
                continue;
            }
            if self.exclude.contains(&host.id) {
                debug!(deploy = %self.key, host = %host.id, "host already carries deployment");
                self.fallback.push(host.id);
                continue;
            }
            debug!(deploy = %self.key, host = %host.id, "host selected");
            return Ok(host.id);
        }

        if let Some(host) = self.fallback.pop() {
            return Err(SchedulerError::AlreadyExists(host));
        }
        Err(last_err.unwrap_or_else(|| SchedulerError::NoHostMeetCondition(self.key.to_string())))
    }
}
