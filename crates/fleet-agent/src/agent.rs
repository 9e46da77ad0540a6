//! Wires the agent's tasks together.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use fleet_core::config::AgentConfig;
use fleet_core::{DefaultResources, KeySpace};
use fleet_registry::ProbeInterfaceProvider;
use fleet_store::Store;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::converge::Converger;
use crate::ctrl::CtrlScript;
use crate::error::AgentResult;
use crate::handler::{HostContext, JavaHandler, ProjectHandler, RedisHandler};
use crate::hostid::MachineId;
use crate::metrics::MetricPoint;
use crate::proc::ProcReader;
use crate::reporter::{HostReporter, InstanceReporter};
use crate::scanner::{AgentEvent, Scanner};

const EVENT_BUFFER: usize = 1024;
const METRIC_BUFFER: usize = 4096;

impl HostContext {
    /// Host name from the OS, address from the interface that routes out.
    pub fn detect(machine: &MachineId) -> Self {
        let host_name = sysinfo::System::host_name().unwrap_or_else(|| machine.host_id.clone());
        Self {
            host_id: machine.host_id.clone(),
            host_name,
            ip: outbound_ip().map_or_else(|| "127.0.0.1".to_string(), |ip| ip.to_string()),
            stage: machine.stage,
        }
    }
}

/// No packet is sent; connecting a UDP socket only picks a route.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.255.255.255:1").ok()?;
    Some(socket.local_addr().ok()?.ip())
}

pub struct Agent {
    store: Store,
    keyspace: KeySpace,
    host: HostContext,
    config: AgentConfig,
}

impl Agent {
    /// `store` must be rooted at `keyspace.prefix()`.
    pub fn new(store: Store, keyspace: KeySpace, host: HostContext, config: AgentConfig) -> Self {
        Self {
            store,
            keyspace,
            host,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> AgentResult<()> {
        let Agent {
            store,
            keyspace,
            host,
            config,
        } = self;
        info!(host_id = %host.host_id, host = %host.host_name, ip = %host.ip, stage = %host.stage, "agent starting");

        let interfaces = ProbeInterfaceProvider::new(store.clone(), host.stage);
        let interfaces_task = interfaces.start(&cancel);

        let handlers: Vec<Arc<dyn ProjectHandler>> = vec![
            Arc::new(JavaHandler::new(Arc::new(interfaces))),
            Arc::new(RedisHandler::default()),
        ];

        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(EVENT_BUFFER);
        let (metric_tx, metric_rx) = mpsc::channel::<MetricPoint>(METRIC_BUFFER);

        let instances = InstanceReporter::new(
            store.clone(),
            keyspace.clone(),
            &host.host_id,
            Duration::from_secs(config.stopped_retention_secs),
        );
        let hosts = HostReporter::new(
            store.clone(),
            keyspace.clone(),
            host.clone(),
            config.labels.clone(),
            config.host_stat_ttl_secs,
        );
        let scanner = Scanner::new(
            ProcReader::new(&config.proc_root),
            host.clone(),
            handlers,
            Arc::new(DefaultResources::builtin()),
            event_tx.clone(),
            metric_tx,
        )
        .with_interval(config.scan_interval())
        .with_disk_budget(config.disk_write_mb_per_day);
        let converger = Converger::new(
            store,
            keyspace,
            &host.host_id,
            CtrlScript::new(&config.ctrl_script),
            instances.clone(),
            event_tx,
        );

        // stale records are reconciled before the scanner reports anything
        let reporter_task = tokio::spawn(instances.clone().run(event_rx, cancel.clone()));
        let host_task = tokio::spawn(hosts.run(instances, cancel.clone()));
        let scanner_task = tokio::spawn(scanner.run(cancel.clone()));
        let converger_task = tokio::spawn(converger.run(cancel.clone()));
        let sink_task = tokio::spawn(metric_sink(metric_rx));

        cancel.cancelled().await;
        for (name, task) in [
            ("scanner", scanner_task),
            ("converger", converger_task),
            ("host reporter", host_task),
            ("instance reporter", reporter_task),
            ("probe interfaces", interfaces_task),
        ] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "agent task panicked");
            }
        }
        let _ = sink_task.await;
        info!("agent stopped");
        Ok(())
    }
}

/// Metric lines are handed to the log pipeline, which ships them on.
async fn metric_sink(mut rx: mpsc::Receiver<MetricPoint>) {
    while let Some(point) = rx.recv().await {
        trace!(target: "fleet::metrics", "{}", point.to_line_protocol());
    }
}
