//! Process scanner.
//!
//! ```text
//!   every interval:  /proc pids ──▶ identify ──▶ handler.parse ──▶ Starting
//!                                                      │
//!                                               spawn watcher(pid)
//!   watcher, every interval:
//!     alive? ──no──▶ Stopped
//!       │ yes
//!     sample usage ─▶ resource checks ─▶ handler.probe ─▶ status transition
//!       │                                                   │
//!     metric points                                    ProbeErr / ProbeWarn / Started
//! ```
//!
//! The pid table is owned by the scan loop; watchers own their instance
//! record and only talk back through the event and metric channels.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_core::{
    DefaultResources, DeployKey, DeployResource, DeployVer, Finding, Instance, LifeCycle,
    PrivatePayload, ProjectType, ResourceUsage,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{self, HostContext, ProbeOutcome, ProjectHandler};
use crate::identify::TypeRegistry;
use crate::metrics::MetricPoint;
use crate::ports;
use crate::probe::{self, DiskWriteWindow, StatusTracker, Transition};
use crate::proc::ProcReader;
use crate::ratio::FailureRatio;

pub const SCAN_INTERVAL: Duration = Duration::from_secs(5);
/// Unidentified pids are looked at again after this long, in case they exec'd.
const IGNORE_RETRY: Duration = Duration::from_secs(60);
const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentEventKind {
    Starting,
    Started,
    ProbeErr,
    ProbeWarn,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub kind: AgentEventKind,
    pub instance: Instance,
}

/// Per-instance resource limits.
pub trait RequiredResources: Send + Sync {
    fn required(&self, key: &DeployKey) -> DeployResource;
}

impl RequiredResources for DefaultResources {
    fn required(&self, key: &DeployKey) -> DeployResource {
        self.medium(&key.project_type).unwrap_or_default()
    }
}

/// Reads resource usage of one process. Each watcher owns one.
pub trait UsageSampler: Send {
    fn sample(&mut self, pid: i32) -> Option<ResourceUsage>;
}

pub type SamplerFactory = Arc<dyn Fn(ProcReader) -> Box<dyn UsageSampler> + Send + Sync>;

/// `sysinfo` for memory, CPU and disk counters; `/proc` for threads and fds.
pub struct SysinfoSampler {
    sys: sysinfo::System,
    reader: ProcReader,
}

impl SysinfoSampler {
    pub fn new(reader: ProcReader) -> Self {
        Self {
            sys: sysinfo::System::new(),
            reader,
        }
    }

    pub fn factory() -> SamplerFactory {
        Arc::new(|reader| Box::new(SysinfoSampler::new(reader)))
    }
}

impl UsageSampler for SysinfoSampler {
    fn sample(&mut self, pid: i32) -> Option<ResourceUsage> {
        let spid = sysinfo::Pid::from_u32(u32::try_from(pid).ok()?);
        if !self.sys.refresh_process(spid) {
            return None;
        }
        let process = self.sys.process(spid)?;
        let disk = process.disk_usage();
        Some(ResourceUsage {
            memory: (process.memory() as f64 / MIB) as i64,
            cpu_percent: f64::from(process.cpu_usage()),
            threads: self.reader.threads(pid).unwrap_or_default(),
            fds: self.reader.fd_count(pid).unwrap_or_default(),
            read_bytes: disk.total_read_bytes,
            write_bytes: disk.total_written_bytes,
        })
    }
}

struct Tracked {
    key: DeployKey,
    version: DeployVer,
    handle: JoinHandle<()>,
}

/// Shared by every watcher the scanner spawns.
#[derive(Clone)]
struct WatchContext {
    reader: ProcReader,
    host: HostContext,
    resources: Arc<dyn RequiredResources>,
    sampler: SamplerFactory,
    interval: Duration,
    disk_budget_mib: u64,
    events: mpsc::Sender<AgentEvent>,
    metrics: mpsc::Sender<MetricPoint>,
}

pub struct Scanner {
    ctx: Arc<WatchContext>,
    registry: TypeRegistry,
    handlers: HashMap<ProjectType, Arc<dyn ProjectHandler>>,
    live: HashMap<i32, Tracked>,
    ignored: HashMap<i32, Instant>,
}

impl Scanner {
    pub fn new(
        reader: ProcReader,
        host: HostContext,
        handlers: Vec<Arc<dyn ProjectHandler>>,
        resources: Arc<dyn RequiredResources>,
        events: mpsc::Sender<AgentEvent>,
        metrics: mpsc::Sender<MetricPoint>,
    ) -> Self {
        let registry = TypeRegistry::new(handlers.iter().map(|h| h.identifier()));
        let handlers = handlers
            .into_iter()
            .map(|h| (h.project_type(), h))
            .collect();
        Self {
            ctx: Arc::new(WatchContext {
                reader,
                host,
                resources,
                sampler: SysinfoSampler::factory(),
                interval: SCAN_INTERVAL,
                disk_budget_mib: 200 * 1024,
                events,
                metrics,
            }),
            registry,
            handlers,
            live: HashMap::new(),
            ignored: HashMap::new(),
        }
    }

    fn ctx_mut(&mut self) -> &mut WatchContext {
        Arc::make_mut(&mut self.ctx)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.ctx_mut().interval = interval;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerFactory) -> Self {
        self.ctx_mut().sampler = sampler;
        self
    }

    pub fn with_disk_budget(mut self, mib_per_day: u64) -> Self {
        self.ctx_mut().disk_budget_mib = mib_per_day;
        self
    }

    /// Pids with a live watcher.
    pub fn tracked(&self) -> BTreeSet<i32> {
        self.live.keys().copied().collect()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(host = %self.ctx.host.host_id, interval = ?self.ctx.interval, "scanner started");
        loop {
            self.scan_once(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.interval) => {}
            }
        }
        for (_, tracked) in self.live.drain() {
            let _ = tracked.handle.await;
        }
        info!("scanner stopped");
    }

    pub async fn scan_once(&mut self, cancel: &CancellationToken) {
        let reader = &self.ctx.reader;
        self.live
            .retain(|pid, tracked| reader.is_alive(*pid) && !tracked.handle.is_finished());

        let pids = match self.ctx.reader.pids() {
            Ok(pids) => pids,
            Err(e) => {
                warn!(error = %e, "cannot list processes");
                return;
            }
        };
        let now = Instant::now();
        let present: BTreeSet<i32> = pids.iter().copied().collect();
        self.ignored
            .retain(|pid, at| present.contains(pid) && now.duration_since(*at) < IGNORE_RETRY);

        let own = std::process::id() as i32;
        for pid in pids {
            if pid == own || self.live.contains_key(&pid) || self.ignored.contains_key(&pid) {
                continue;
            }
            match self.discover(pid) {
                Some((ins, ppid, handler)) => self.track(ins, ppid, handler, cancel).await,
                None => {
                    self.ignored.insert(pid, now);
                }
            }
        }

        self.emit_deploy_metrics();
    }

    fn discover(&self, pid: i32) -> Option<(Instance, i32, Arc<dyn ProjectHandler>)> {
        let proc = self.ctx.reader.info(pid).ok()?;
        let project_type = self.registry.identify(&proc)?;
        let handler = self.handlers.get(&project_type)?.clone();
        let mut ins = handler::skeleton(&proc, project_type, &self.ctx.host);
        if let Err(e) = handler.parse(&proc, &self.ctx.host, &mut ins) {
            debug!(pid, error = %e, "identified process not parseable");
            return None;
        }
        Some((ins, proc.ppid, handler))
    }

    async fn track(
        &mut self,
        ins: Instance,
        ppid: i32,
        handler: Arc<dyn ProjectHandler>,
        cancel: &CancellationToken,
    ) {
        info!(pid = ins.pid, deploy = %ins.deploy_key(), version = %ins.version, id = %ins.id, "instance discovered");
        let _ = self
            .ctx
            .events
            .send(AgentEvent {
                kind: AgentEventKind::Starting,
                instance: ins.clone(),
            })
            .await;
        let pid = ins.pid;
        let key = ins.deploy_key();
        let version = ins.version.clone();
        let handle = tokio::spawn(watch_instance(
            self.ctx.clone(),
            handler,
            ins,
            ppid,
            cancel.child_token(),
        ));
        self.live.insert(pid, Tracked { key, version, handle });
    }

    fn emit_deploy_metrics(&self) {
        let mut by_key: HashMap<&DeployKey, (i64, BTreeSet<&str>)> = HashMap::new();
        for tracked in self.live.values() {
            let entry = by_key.entry(&tracked.key).or_default();
            entry.0 += 1;
            entry.1.insert(&tracked.version);
        }
        let ts = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        for (key, (count, versions)) in by_key {
            let point = MetricPoint::new("deploy", ts)
                .tag("deployKey", key.to_string())
                .tag("projectType", key.project_type.to_string())
                .tag("stage", self.ctx.host.stage.to_string())
                .tag("node", self.ctx.host.host_name.clone())
                .field("numInstances", count)
                .field("numVersions", versions.len() as i64);
            let _ = self.ctx.metrics.try_send(point);
        }
    }
}

async fn watch_instance(
    ctx: Arc<WatchContext>,
    handler: Arc<dyn ProjectHandler>,
    mut ins: Instance,
    ppid: i32,
    cancel: CancellationToken,
) {
    let pid = ins.pid;
    let key = ins.deploy_key();
    let required = ctx.resources.required(&key);
    let mut sampler = (ctx.sampler)(ctx.reader.clone());
    let mut disk = DiskWriteWindow::new(ctx.disk_budget_mib);
    let mut tracker = StatusTracker::default();
    let mut ratio = FailureRatio::default();
    let mut call_ratios: HashMap<String, FailureRatio> = HashMap::new();

    let (ports_tx, mut ports_rx) = oneshot::channel();
    {
        let reader = ctx.reader.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let found = ports::discover(reader, pid, ppid, cancel).await;
            let _ = ports_tx.send(found);
        });
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(ctx.interval) => {}
        }

        if !ctx.reader.is_alive(pid) {
            ins.life_cycle = LifeCycle::Stopped;
            ins.stop_time = Some(Utc::now());
            info!(pid, deploy = %key, id = %ins.id, "instance stopped");
            let _ = ctx
                .events
                .send(AgentEvent {
                    kind: AgentEventKind::Stopped,
                    instance: ins,
                })
                .await;
            return;
        }

        if let Ok(found) = ports_rx.try_recv() {
            if !found.is_empty() {
                debug!(pid, ports = ?found, "listening ports found");
                ins.service_type = "service".to_string();
            }
            ins.listening = found;
        }

        if let Some(usage) = sampler.sample(pid) {
            disk.record(Instant::now(), usage.write_bytes);
            ins.res_usage = usage;
        }
        let mut findings = probe::check_resources(&ins.res_usage, &required);
        disk.check(&mut findings);

        let calls = handler.probe(&ins).await;
        let mut last_report = None;
        for call in &calls {
            call_ratios
                .entry(call.name.clone())
                .or_default()
                .update(call.outcome.status());
            match &call.outcome {
                ProbeOutcome::Success => {}
                ProbeOutcome::Warning(reason) => findings
                    .events
                    .push(Finding::new("probe", format!("{}: {reason}", call.name))),
                ProbeOutcome::Failure(reason) => findings
                    .conditions
                    .push(Finding::new("probe", format!("{}: {reason}", call.name))),
            }
            if call.report.is_some() {
                last_report = call.report.clone();
            }
        }
        if let (Some(report), Ok(PrivatePayload::Java(mut payload))) = (last_report, ins.payload()) {
            payload.probe = Some(report);
            ins.set_payload(&PrivatePayload::Java(payload));
        }

        let first = ins.life_cycle == LifeCycle::Starting;
        if first {
            ins.life_cycle = LifeCycle::Running;
        }
        let kind = match tracker.apply(&mut ins, findings) {
            Some(Transition::ProbeErr) => Some(AgentEventKind::ProbeErr),
            Some(Transition::ProbeWarn) => Some(AgentEventKind::ProbeWarn),
            Some(Transition::Recovered) => Some(AgentEventKind::Started),
            None if first => Some(AgentEventKind::Started),
            None => None,
        };
        ratio.update(ins.status);

        if let Some(kind) = kind {
            if kind != AgentEventKind::Started {
                warn!(pid, deploy = %key, status = ?ins.status, conditions = ins.conditions.len(), "instance probe status changed");
            }
            let _ = ctx
                .events
                .send(AgentEvent {
                    kind,
                    instance: ins.clone(),
                })
                .await;
        }

        emit_instance_metrics(&ctx, &ins, &ratio, &call_ratios);
    }
}

fn emit_instance_metrics(
    ctx: &WatchContext,
    ins: &Instance,
    ratio: &FailureRatio,
    call_ratios: &HashMap<String, FailureRatio>,
) {
    let ts = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let base = |measurement: &str| {
        MetricPoint::new(measurement, ts)
            .tag("deployKey", ins.deploy_key().to_string())
            .tag("projectType", ins.project_type.to_string())
            .tag("stage", ctx.host.stage.to_string())
            .tag("node", ctx.host.host_name.clone())
            .tag("probeStatus", format!("{:?}", ins.status).to_lowercase())
    };
    let [r1, r5, r15] = ratio.averages();
    let point = base("instance")
        .tag("version", ins.version.clone())
        .field("memory", ins.res_usage.memory)
        .field("cpuPercent", ins.res_usage.cpu_percent)
        .field("threads", ins.res_usage.threads)
        .field("fds", ins.res_usage.fds)
        .field("writeBytes", ins.res_usage.write_bytes as i64)
        .field("failRatio1", r1)
        .field("failRatio5", r5)
        .field("failRatio15", r15);
    let _ = ctx.metrics.try_send(point);

    for (name, r) in call_ratios {
        let [r1, r5, r15] = r.averages();
        let point = base("endpoint")
            .tag("endpoint", name.clone())
            .field("failRatio1", r1)
            .field("failRatio5", r5)
            .field("failRatio15", r15);
        let _ = ctx.metrics.try_send(point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_host::host;
    use crate::handler::{JavaHandler, RedisHandler};
    use crate::proc::fixture;
    use fleet_registry::{InterfaceSource, ProbeInterface};

    struct NoInterfaces;

    impl InterfaceSource for NoInterfaces {
        fn interfaces(&self, _deploy_name: &str) -> Vec<ProbeInterface> {
            Vec::new()
        }
    }

    struct Fixed(ResourceUsage);

    impl UsageSampler for Fixed {
        fn sample(&mut self, _pid: i32) -> Option<ResourceUsage> {
            Some(self.0.clone())
        }
    }

    fn scanner(
        root: &std::path::Path,
        usage: ResourceUsage,
    ) -> (Scanner, mpsc::Receiver<AgentEvent>, mpsc::Receiver<MetricPoint>) {
        let (ev_tx, ev_rx) = mpsc::channel(64);
        let (m_tx, m_rx) = mpsc::channel(256);
        let handlers: Vec<Arc<dyn ProjectHandler>> = vec![
            Arc::new(JavaHandler::new(Arc::new(NoInterfaces))),
            Arc::new(RedisHandler::default()),
        ];
        let scanner = Scanner::new(
            ProcReader::new(root),
            host(),
            handlers,
            Arc::new(DefaultResources::builtin()),
            ev_tx,
            m_tx,
        )
        .with_sampler(Arc::new(move |_| Box::new(Fixed(usage.clone()))));
        (scanner, ev_rx, m_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_events() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fixture::process(
            root,
            500,
            1,
            "/usr/bin/java",
            &["java", "-Djava.apps.prog=foo-bar", "Main"],
            &[("_version", "v2"), ("_instanceID", "ins-500")],
        );
        fixture::process(root, 501, 1, "/bin/bash", &["bash"], &[]);

        let (mut scanner, mut events, mut metrics) = scanner(root, ResourceUsage::default());
        let cancel = CancellationToken::new();
        scanner.scan_once(&cancel).await;
        assert_eq!(scanner.tracked(), BTreeSet::from([500]));

        let starting = events.recv().await.unwrap();
        assert_eq!(starting.kind, AgentEventKind::Starting);
        assert_eq!(starting.instance.id, "ins-500");
        assert_eq!(starting.instance.deploy_key(), DeployKey::new("java", "foo:bar"));
        assert_eq!(starting.instance.version, "v2");

        let started = events.recv().await.unwrap();
        assert_eq!(started.kind, AgentEventKind::Started);
        assert_eq!(started.instance.life_cycle, LifeCycle::Running);
        let point = metrics.recv().await.unwrap();
        assert_eq!(point.measurement, "deploy");
        assert_eq!(point.fields["numInstances"], crate::metrics::FieldValue::Int(1));

        // a rescan does not rediscover
        scanner.scan_once(&cancel).await;
        assert_eq!(scanner.tracked().len(), 1);

        std::fs::remove_dir_all(root.join("500")).unwrap();
        let stopped = events.recv().await.unwrap();
        assert_eq!(stopped.kind, AgentEventKind::Stopped);
        assert!(stopped.instance.stop_time.is_some());

        scanner.scan_once(&cancel).await;
        assert!(scanner.tracked().is_empty());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn resource_condition_reports_probe_err_once() {
        let dir = tempfile::tempdir().unwrap();
        fixture::process(
            dir.path(),
            600,
            1,
            "/usr/bin/java",
            &["java", "-Djava.apps.prog=foo-bar"],
            &[],
        );
        // 10 GiB is over the java medium ceiling
        let usage = ResourceUsage {
            memory: 10 * 1024,
            ..Default::default()
        };
        let (mut scanner, mut events, _metrics) = scanner(dir.path(), usage);
        let cancel = CancellationToken::new();
        scanner.scan_once(&cancel).await;

        assert_eq!(events.recv().await.unwrap().kind, AgentEventKind::Starting);
        let err = events.recv().await.unwrap();
        assert_eq!(err.kind, AgentEventKind::ProbeErr);
        assert_eq!(err.instance.status, fleet_core::ProbeStatus::Error);
        assert_eq!(err.instance.conditions[0].kind, "memory");

        // further ticks with the same reading stay quiet
        tokio::time::sleep(SCAN_INTERVAL * 5).await;
        assert!(events.try_recv().is_err());
        cancel.cancel();
    }
}
