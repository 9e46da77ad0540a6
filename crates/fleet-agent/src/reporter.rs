//! Publishes what the agent sees.
//!
//! [`InstanceReporter`] turns scanner events into
//! `deploy/actual/{host}/{type}/{name}/{id}` records and keeps a local table
//! the converger reads. Stopped records linger for a retention period so
//! the controller can see the exit, then are deleted.
//!
//! [`HostReporter`] publishes the host's capacity and, under a short lease,
//! its live usage.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::{
    DeployKey, DeployResource, HostInfo, HostStatus, Instance, InstanceId, KeySpace, LifeCycle,
};
use fleet_store::{Predicate, Store};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentResult;
use crate::handler::HostContext;
use crate::scanner::{AgentEvent, AgentEventKind};

const PURGE_INTERVAL: Duration = Duration::from_secs(5);
const HOST_INFO_REFRESH: Duration = Duration::from_secs(10 * 60);
const MIB: u64 = 1024 * 1024;

// ── Instances ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct InstanceReporter {
    store: Store,
    keyspace: KeySpace,
    host_id: String,
    retention: Duration,
    table: Arc<RwLock<HashMap<InstanceId, Instance>>>,
}

impl InstanceReporter {
    pub fn new(store: Store, keyspace: KeySpace, host_id: &str, retention: Duration) -> Self {
        Self {
            store,
            keyspace,
            host_id: host_id.to_string(),
            retention,
            table: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn key_of(&self, ins: &Instance) -> String {
        self.keyspace
            .instance(&self.host_id, &ins.deploy_key(), &ins.id)
    }

    /// Mark records left by a previous agent run as stopped. The scanner
    /// re-reports whatever is still alive under its own ids.
    pub async fn reconcile_stale(&self) -> AgentResult<usize> {
        let prefix = self.keyspace.instances_on_host(&self.host_id);
        let listed = self
            .store
            .list::<Instance>(&prefix, &Predicate::everything())
            .await?;
        let now = Utc::now();
        let mut marked = 0;
        for mut ins in listed {
            if !ins.is_stopped() {
                ins.life_cycle = LifeCycle::Stopped;
                ins.stop_time = Some(now);
                self.store.update(&self.key_of(&ins), &ins, 0).await?;
                marked += 1;
            }
            self.table
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(ins.id.clone(), ins);
        }
        if marked > 0 {
            info!(host = %self.host_id, marked, "stale instance records marked stopped");
        }
        Ok(marked)
    }

    pub async fn apply(&self, event: AgentEvent) -> AgentResult<()> {
        let AgentEvent { kind, instance } = event;
        debug!(kind = ?kind, id = %instance.id, deploy = %instance.deploy_key(), "instance event");
        self.store
            .update(&self.key_of(&instance), &instance, 0)
            .await?;
        if kind == AgentEventKind::Stopped {
            info!(id = %instance.id, deploy = %instance.deploy_key(), "instance exit recorded");
        }
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance.id.clone(), instance);
        Ok(())
    }

    /// Delete stopped records older than the retention period.
    pub async fn purge(&self, now: DateTime<Utc>) -> AgentResult<usize> {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let expired: Vec<Instance> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|ins| {
                ins.is_stopped()
                    && ins
                        .stop_time
                        .is_none_or(|at| now.signed_duration_since(at) >= retention)
            })
            .cloned()
            .collect();

        let mut purged = 0;
        for ins in expired {
            match self.store.delete::<Instance>(&self.key_of(&ins)).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            // a restart under the same id may have replaced the entry meanwhile
            if table.get(&ins.id).is_some_and(Instance::is_stopped) {
                table.remove(&ins.id);
            }
            purged += 1;
        }
        if purged > 0 {
            debug!(purged, "stopped instance records deleted");
        }
        Ok(purged)
    }

    /// Live instances of `key`, oldest first.
    pub fn running(&self, key: &DeployKey) -> Vec<Instance> {
        let mut out: Vec<Instance> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|ins| !ins.is_stopped() && ins.deploy_key() == *key)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn live_count(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|ins| !ins.is_stopped())
            .count()
    }

    /// Summed usage of live instances.
    pub fn used(&self) -> DeployResource {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut used = DeployResource::default();
        for ins in table.values().filter(|ins| !ins.is_stopped()) {
            used.memory += ins.res_usage.memory;
            used.cpu += (ins.res_usage.cpu_percent * 10.0) as i64;
        }
        used
    }

    pub async fn run(self, mut events: mpsc::Receiver<AgentEvent>, cancel: CancellationToken) {
        if let Err(e) = self.reconcile_stale().await {
            warn!(error = %e, "cannot reconcile stale instance records");
        }
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = self.apply(event).await {
                        warn!(error = %e, "cannot publish instance record");
                    }
                }
                _ = purge.tick() => {
                    if let Err(e) = self.purge(Utc::now()).await {
                        warn!(error = %e, "cannot purge stopped instance records");
                    }
                }
            }
        }
        info!("instance reporter stopped");
    }
}

// ── Host ──────────────────────────────────────────────────────────

pub struct HostReporter {
    store: Store,
    keyspace: KeySpace,
    host: HostContext,
    labels: BTreeMap<String, String>,
    stat_ttl: i64,
    sys: sysinfo::System,
}

impl HostReporter {
    pub fn new(
        store: Store,
        keyspace: KeySpace,
        host: HostContext,
        labels: BTreeMap<String, String>,
        stat_ttl: i64,
    ) -> Self {
        Self {
            store,
            keyspace,
            host,
            labels,
            stat_ttl,
            sys: sysinfo::System::new(),
        }
    }

    pub fn host_info(&mut self) -> HostInfo {
        self.sys.refresh_memory();
        self.sys.refresh_cpu();
        let cpus = self.sys.cpus().len() as i64;
        let disk: u64 = sysinfo::Disks::new_with_refreshed_list()
            .list()
            .iter()
            .map(|d| d.total_space())
            .sum();
        HostInfo {
            id: self.host.host_id.clone(),
            host_name: self.host.host_name.clone(),
            ip: self.host.ip.clone(),
            stage: self.host.stage,
            labels: self.labels.clone(),
            capacity: DeployResource {
                memory: (self.sys.total_memory() / MIB) as i64,
                cpu: cpus * 1000,
                disk_space: (disk / MIB) as i64,
                ..Default::default()
            },
            cpu_count: cpus as u32,
            updated_at: Utc::now().timestamp(),
        }
    }

    pub fn host_status(&mut self, instances: &InstanceReporter) -> HostStatus {
        let load = sysinfo::System::load_average();
        HostStatus {
            id: self.host.host_id.clone(),
            used: instances.used(),
            load_avg: [load.one, load.five, load.fifteen],
            num_instances: instances.live_count() as u32,
            updated_at: Utc::now().timestamp(),
        }
    }

    pub async fn publish_info(&mut self) -> AgentResult<()> {
        let info = self.host_info();
        debug!(host = %info.id, memory = info.capacity.memory, cpu = info.capacity.cpu, "publishing host info");
        self.store
            .update(&self.keyspace.host_info(&self.host.host_id), &info, 0)
            .await?;
        Ok(())
    }

    pub async fn publish_status(&mut self, instances: &InstanceReporter) -> AgentResult<()> {
        let status = self.host_status(instances);
        self.store
            .update(&self.keyspace.host_stat(&self.host.host_id), &status, self.stat_ttl)
            .await?;
        Ok(())
    }

    pub async fn run(mut self, instances: InstanceReporter, cancel: CancellationToken) {
        let period = Duration::from_secs((self.stat_ttl / 3).max(1) as u64);
        let mut stat = tokio::time::interval(period);
        let mut info = tokio::time::interval(HOST_INFO_REFRESH);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = info.tick() => {
                    if let Err(e) = self.publish_info().await {
                        warn!(error = %e, "cannot publish host info");
                    }
                }
                _ = stat.tick() => {
                    if let Err(e) = self.publish_status(&instances).await {
                        warn!(error = %e, "cannot publish host status");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_host::host;
    use fleet_core::Stage;

    fn setup() -> (Store, KeySpace, InstanceReporter) {
        let ks = KeySpace::new("deploy", Stage::Int);
        let store = Store::in_memory(&ks.prefix()).unwrap();
        let reporter = InstanceReporter::new(store.clone(), ks.clone(), "h1", Duration::from_secs(300));
        (store, ks, reporter)
    }

    fn event(kind: AgentEventKind, id: &str) -> AgentEvent {
        let key = DeployKey::new("java", "foo:bar");
        let mut instance = Instance::sample(&key, id, "h1", "v1");
        instance.life_cycle = match kind {
            AgentEventKind::Starting => LifeCycle::Starting,
            AgentEventKind::Stopped => LifeCycle::Stopped,
            AgentEventKind::Stopping => LifeCycle::Stopping,
            _ => LifeCycle::Running,
        };
        if kind == AgentEventKind::Stopped {
            instance.stop_time = Some(Utc::now());
        }
        AgentEvent { kind, instance }
    }

    #[tokio::test]
    async fn events_become_records() {
        let (store, ks, reporter) = setup();
        let key = DeployKey::new("java", "foo:bar");

        reporter.apply(event(AgentEventKind::Starting, "a")).await.unwrap();
        reporter.apply(event(AgentEventKind::Started, "b")).await.unwrap();
        let stored: Instance = store.get(&ks.instance("h1", &key, "a")).await.unwrap();
        assert_eq!(stored.life_cycle, LifeCycle::Starting);
        assert_eq!(reporter.running(&key).len(), 2);
        assert_eq!(reporter.live_count(), 2);

        reporter.apply(event(AgentEventKind::Stopped, "a")).await.unwrap();
        assert_eq!(reporter.running(&key).len(), 1);

        // still inside retention
        assert_eq!(reporter.purge(Utc::now()).await.unwrap(), 0);
        assert!(store.try_get::<Instance>(&ks.instance("h1", &key, "a")).await.unwrap().is_some());

        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(reporter.purge(later).await.unwrap(), 1);
        assert!(store.try_get::<Instance>(&ks.instance("h1", &key, "a")).await.unwrap().is_none());
        assert!(store.try_get::<Instance>(&ks.instance("h1", &key, "b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn restart_under_same_id_survives_purge() {
        let (_store, _ks, reporter) = setup();
        reporter.apply(event(AgentEventKind::Stopped, "a")).await.unwrap();
        reporter.apply(event(AgentEventKind::Starting, "a")).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(reporter.purge(later).await.unwrap(), 0);
        assert_eq!(reporter.live_count(), 1);
    }

    #[tokio::test]
    async fn stale_records_are_marked_stopped() {
        let (store, ks, reporter) = setup();
        let key = DeployKey::new("java", "foo:bar");
        let old = Instance::sample(&key, "old", "h1", "v1");
        store.create(&ks.instance("h1", &key, "old"), &old, 0).await.unwrap();
        let other_host = Instance::sample(&key, "x", "h2", "v1");
        store.create(&ks.instance("h2", &key, "x"), &other_host, 0).await.unwrap();

        assert_eq!(reporter.reconcile_stale().await.unwrap(), 1);
        let stored: Instance = store.get(&ks.instance("h1", &key, "old")).await.unwrap();
        assert!(stored.is_stopped());
        assert!(stored.stop_time.is_some());
        let untouched: Instance = store.get(&ks.instance("h2", &key, "x")).await.unwrap();
        assert!(!untouched.is_stopped());
    }

    #[tokio::test]
    async fn host_records() {
        let (store, ks, reporter) = setup();
        reporter.apply(event(AgentEventKind::Started, "a")).await.unwrap();
        let labels = BTreeMap::from([("zone".to_string(), "east".to_string())]);
        let mut host_reporter = HostReporter::new(store.clone(), ks.clone(), host(), labels, 30);

        host_reporter.publish_info().await.unwrap();
        host_reporter.publish_status(&reporter).await.unwrap();

        let info: HostInfo = store.get(&ks.host_info("h1")).await.unwrap();
        assert_eq!(info.host_name, "web01");
        assert_eq!(info.labels["zone"], "east");
        assert_eq!(info.capacity.cpu, i64::from(info.cpu_count) * 1000);
        let status: HostStatus = store.get(&ks.host_stat("h1")).await.unwrap();
        assert_eq!(status.num_instances, 1);
    }
}
