//! Drives local processes toward `deploy/expect/{host}/…`.
//!
//! ```text
//!   expect watch ─▶ desired[key] ──┐
//!                                  ├─▶ converge(key) ─▶ ctrl start / stop
//!   reporter.running(key) ─────────┘
//! ```
//!
//! Starts are remembered for [`PENDING_WINDOW`] so a slow process is not
//! started twice; they clear once the scanner reports the instance id.
//! Only keys that are, or were, in the expect tree are touched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use fleet_core::{DeployKey, DeploySpec, DeployVer, Instance, InstanceId, KeySpace, LifeCycle};
use fleet_store::{Predicate, Store, WatchEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ctrl::{CtrlOp, CtrlScript};
use crate::error::AgentResult;
use crate::handler::{ENV_DEPLOY_KEY, ENV_INSTANCE_ID, ENV_VERSION};
use crate::reporter::InstanceReporter;
use crate::scanner::{AgentEvent, AgentEventKind};

pub const PENDING_WINDOW: Duration = Duration::from_secs(2 * 60);
const CONVERGE_INTERVAL: Duration = Duration::from_secs(30);
const RESYNC_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Pending {
    id: InstanceId,
    version: DeployVer,
    at: Instant,
}

/// What one converge pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Converged {
    pub started: Vec<(DeployVer, InstanceId)>,
    pub stopped: Vec<InstanceId>,
}

pub struct Converger {
    store: Store,
    keyspace: KeySpace,
    host_id: String,
    ctrl: CtrlScript,
    instances: InstanceReporter,
    events: mpsc::Sender<AgentEvent>,
    desired: HashMap<DeployKey, DeploySpec>,
    pending: HashMap<DeployKey, Vec<Pending>>,
    stopping: HashMap<InstanceId, Instant>,
}

impl Converger {
    pub fn new(
        store: Store,
        keyspace: KeySpace,
        host_id: &str,
        ctrl: CtrlScript,
        instances: InstanceReporter,
        events: mpsc::Sender<AgentEvent>,
    ) -> Self {
        Self {
            store,
            keyspace,
            host_id: host_id.to_string(),
            ctrl,
            instances,
            events,
            desired: HashMap::new(),
            pending: HashMap::new(),
            stopping: HashMap::new(),
        }
    }

    pub fn set_desired(&mut self, key: DeployKey, spec: DeploySpec) {
        self.desired.insert(key, spec);
    }

    /// Forget `key`; the next converge stops everything it runs.
    pub fn clear_desired(&mut self, key: &DeployKey) {
        self.desired.insert(key.clone(), DeploySpec::default());
    }

    pub async fn converge(&mut self, key: &DeployKey) -> AgentResult<Converged> {
        let now = Instant::now();
        let running: Vec<Instance> = self
            .instances
            .running(key)
            .into_iter()
            .filter(|ins| !self.stopping.contains_key(&ins.id))
            .collect();
        let running_ids: BTreeSet<&str> = running.iter().map(|i| i.id.as_str()).collect();
        let pending = self.pending.entry(key.clone()).or_default();
        pending.retain(|p| now.duration_since(p.at) < PENDING_WINDOW && !running_ids.contains(p.id.as_str()));

        let want = self.desired.get(key).cloned().unwrap_or_default();
        let versions: BTreeSet<DeployVer> = want
            .info
            .keys()
            .cloned()
            .chain(running.iter().map(|i| i.version.clone()))
            .collect();

        let mut done = Converged::default();
        for version in versions {
            let want_n = want.num(&version) as usize;
            let live: Vec<&Instance> = running.iter().filter(|i| i.version == version).collect();
            let in_flight = self
                .pending
                .get(key)
                .map_or(0, |p| p.iter().filter(|p| p.version == version).count());

            if live.len() + in_flight < want_n {
                let values = want
                    .info
                    .get(&version)
                    .map(|v| v.values.clone())
                    .unwrap_or_default();
                for _ in live.len() + in_flight..want_n {
                    let id = self.start(key, &version, &values).await?;
                    self.pending.entry(key.clone()).or_default().push(Pending {
                        id: id.clone(),
                        version: version.clone(),
                        at: Instant::now(),
                    });
                    done.started.push((version.clone(), id));
                }
            } else if live.len() > want_n {
                for ins in live.iter().take(live.len() - want_n) {
                    self.stop(ins).await?;
                    done.stopped.push(ins.id.clone());
                }
            }
        }

        if want.is_empty() && running.is_empty() {
            self.desired.remove(key);
            self.pending.remove(key);
        }
        Ok(done)
    }

    async fn start(
        &self,
        key: &DeployKey,
        version: &str,
        values: &BTreeMap<String, String>,
    ) -> AgentResult<InstanceId> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut env: Vec<(String, String)> = values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        env.push((ENV_DEPLOY_KEY.to_string(), key.to_string()));
        env.push((ENV_VERSION.to_string(), version.to_string()));
        env.push((ENV_INSTANCE_ID.to_string(), id.clone()));
        info!(deploy = %key, version, id = %id, "starting instance");
        self.ctrl.run(CtrlOp::Start, key, 0, &env).await?;
        Ok(id)
    }

    async fn stop(&mut self, ins: &Instance) -> AgentResult<()> {
        let key = ins.deploy_key();
        info!(deploy = %key, version = %ins.version, id = %ins.id, pid = ins.pid, "stopping instance");
        let mut stopping = ins.clone();
        stopping.life_cycle = LifeCycle::Stopping;
        let _ = self
            .events
            .send(AgentEvent {
                kind: AgentEventKind::Stopping,
                instance: stopping,
            })
            .await;
        let env = vec![
            (ENV_DEPLOY_KEY.to_string(), key.to_string()),
            (ENV_VERSION.to_string(), ins.version.clone()),
            (ENV_INSTANCE_ID.to_string(), ins.id.clone()),
        ];
        self.stopping.insert(ins.id.clone(), Instant::now());
        self.ctrl.run(CtrlOp::Stop, &key, ins.pid, &env).await?;
        Ok(())
    }

    pub async fn converge_all(&mut self) {
        let now = Instant::now();
        self.stopping
            .retain(|_, at| now.duration_since(*at) < PENDING_WINDOW);
        let keys: Vec<DeployKey> = self.desired.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.converge(&key).await {
                warn!(deploy = %key, error = %e, "converge failed");
            }
        }
    }

    async fn load(&mut self) -> AgentResult<()> {
        let prefix = self.keyspace.deploy_expect_host(&self.host_id);
        let listed = self
            .store
            .list_map::<DeploySpec>(&prefix, &Predicate::everything())
            .await?;
        let mut fresh: HashMap<DeployKey, DeploySpec> = HashMap::new();
        for (suffix, spec) in listed {
            match suffix.parse::<DeployKey>() {
                Ok(key) => {
                    fresh.insert(key, spec);
                }
                Err(_) => warn!(key = %suffix, "ignoring malformed expect key"),
            }
        }
        // keys that vanished while the watch was down still get stopped
        for key in self.desired.keys() {
            fresh.entry(key.clone()).or_default();
        }
        debug!(keys = fresh.len(), "expect tree loaded");
        self.desired = fresh;
        Ok(())
    }

    fn on_event(&mut self, event: WatchEvent<DeploySpec>) -> Option<DeployKey> {
        let (suffix, spec) = match event {
            WatchEvent::Added { key, object } | WatchEvent::Modified { key, object } => {
                (key, Some(object))
            }
            WatchEvent::Deleted { key, .. } => (key, None),
            WatchEvent::Error(_) => return None,
        };
        let Ok(key) = suffix.trim_start_matches('/').parse::<DeployKey>() else {
            warn!(key = %suffix, "ignoring malformed expect key");
            return None;
        };
        match spec {
            Some(spec) => self.set_desired(key.clone(), spec),
            None => self.clear_desired(&key),
        }
        Some(key)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let prefix = self.keyspace.deploy_expect_host(&self.host_id);
        info!(host = %self.host_id, "converger started");
        loop {
            let mut stream = match self
                .store
                .watch::<DeploySpec>(&prefix, Predicate::everything(), true, &cancel)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "expect watch failed to start");
                    if !pause(&cancel).await {
                        return;
                    }
                    continue;
                }
            };
            if let Err(e) = self.load().await {
                warn!(error = %e, "cannot list expect tree");
                if !pause(&cancel).await {
                    return;
                }
                continue;
            }
            self.converge_all().await;

            let mut tick = tokio::time::interval_at(Instant::now() + CONVERGE_INTERVAL, CONVERGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => self.converge_all().await,
                    event = stream.recv() => match event {
                        Some(WatchEvent::Error(e)) => {
                            warn!(error = %e, "expect watch broke, resyncing");
                            break;
                        }
                        Some(event) => {
                            if let Some(key) = self.on_event(event) {
                                if let Err(e) = self.converge(&key).await {
                                    warn!(deploy = %key, error = %e, "converge failed");
                                }
                            }
                        }
                        None => break,
                    },
                }
            }
            if !pause(&cancel).await {
                return;
            }
        }
    }
}

async fn pause(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(RESYNC_DELAY) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::fixture;
    use fleet_core::Stage;

    struct Setup {
        _dir: tempfile::TempDir,
        log: std::path::PathBuf,
        store: Store,
        ks: KeySpace,
        reporter: InstanceReporter,
        converger: Converger,
        events: mpsc::Receiver<AgentEvent>,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let ctrl = CtrlScript::new(fixture::script(dir.path(), &log, 0));
        let ks = KeySpace::new("deploy", Stage::Int);
        let store = Store::in_memory(&ks.prefix()).unwrap();
        let reporter = InstanceReporter::new(store.clone(), ks.clone(), "h1", Duration::from_secs(300));
        let (tx, events) = mpsc::channel(16);
        let converger = Converger::new(store.clone(), ks.clone(), "h1", ctrl, reporter.clone(), tx);
        Setup {
            _dir: dir,
            log,
            store,
            ks,
            reporter,
            converger,
            events,
        }
    }

    fn calls(log: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn running(reporter: &InstanceReporter, key: &DeployKey, id: &str, version: &str, pid: i32) {
        let mut ins = Instance::sample(key, id, "h1", version);
        ins.pid = pid;
        ins.life_cycle = LifeCycle::Running;
        reporter
            .apply(AgentEvent {
                kind: AgentEventKind::Started,
                instance: ins,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn starts_missing_and_stops_extra() {
        let mut s = setup();
        let key = DeployKey::new("java", "foo:bar");
        running(&s.reporter, &key, "old", "v1", 41).await;
        s.converger.set_desired(key.clone(), DeploySpec::single("v2", 2));

        let done = s.converger.converge(&key).await.unwrap();
        assert_eq!(done.started.len(), 2);
        assert_eq!(done.stopped, ["old"]);

        let log = calls(&s.log);
        assert_eq!(log.iter().filter(|l| l.as_str() == "start java foo:bar 0 v2").count(), 2);
        assert!(log.contains(&"stop java foo:bar 41 v1".to_string()));
        let stopping = s.events.try_recv().unwrap();
        assert_eq!(stopping.kind, AgentEventKind::Stopping);
        assert_eq!(stopping.instance.id, "old");

        // pending starts and in-progress stops are not repeated
        let again = s.converger.converge(&key).await.unwrap();
        assert_eq!(again, Converged::default());
        assert_eq!(calls(&s.log).len(), 3);
    }

    #[tokio::test]
    async fn reported_start_clears_pending() {
        let mut s = setup();
        let key = DeployKey::new("java", "foo:bar");
        s.converger.set_desired(key.clone(), DeploySpec::single("v1", 1));
        let done = s.converger.converge(&key).await.unwrap();
        let (_, id) = done.started[0].clone();

        running(&s.reporter, &key, &id, "v1", 50).await;
        assert_eq!(s.converger.converge(&key).await.unwrap(), Converged::default());

        // the instance exits: start another one
        let mut gone = Instance::sample(&key, &id, "h1", "v1");
        gone.life_cycle = LifeCycle::Stopped;
        s.reporter
            .apply(AgentEvent {
                kind: AgentEventKind::Stopped,
                instance: gone,
            })
            .await
            .unwrap();
        let done = s.converger.converge(&key).await.unwrap();
        assert_eq!(done.started.len(), 1);
    }

    #[tokio::test]
    async fn deleted_key_stops_everything_and_unmanaged_keys_are_left_alone() {
        let mut s = setup();
        let key = DeployKey::new("java", "foo:bar");
        let unmanaged = DeployKey::new("redis", "cache");
        running(&s.reporter, &key, "a", "v1", 10).await;
        running(&s.reporter, &unmanaged, "r", "unknown", 11).await;

        s.converger.clear_desired(&key);
        s.converger.converge_all().await;
        assert_eq!(calls(&s.log), ["stop java foo:bar 10 v1"]);
    }

    #[tokio::test]
    async fn follows_expect_tree() {
        let s = setup();
        let key = DeployKey::new("java", "foo:bar");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(s.converger.run(cancel.clone()));

        s.store
            .create(&s.ks.deploy_expect("h1", &key), &DeploySpec::single("v1", 1), 0)
            .await
            .unwrap();
        let log = s.log.clone();
        tokio::time::timeout(Duration::from_secs(10), async move {
            while calls(&log).is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(calls(&s.log), ["start java foo:bar 0 v1"]);

        cancel.cancel();
        task.await.unwrap();
    }
}
