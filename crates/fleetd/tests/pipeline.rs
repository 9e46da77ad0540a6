//! Controller and agent converger wired over one embedded store.
//!
//! A deploy config written through the CRUD surface must end as a ctrl-script
//! start on the chosen host, and deleting it must stop what was reported.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleet_agent::{AgentEvent, AgentEventKind, Converger, CtrlScript, InstanceReporter};
use fleet_controller::{
    ControllerContext, ControllerManager, ControllerSettings, DeployConfigApi,
    DeployConfigManager, WaitPolicy,
};
use fleet_core::{
    DefaultResources, DeployConfig, DeployKey, DeployResource, HostInfo, HostStatus, Image, Instance,
    KeySpace, LifeCycle, Stage, UpdatePolicy,
};
use fleet_store::Store;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn ctrl_script(dir: &Path, log: &Path) -> PathBuf {
    let path = dir.join("ctrl.sh");
    let body = format!(
        "#!/bin/sh\necho \"$1 $2 $3 $4 ${{_version}}\" >> {}\n",
        log.display()
    );
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn calls(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

async fn wait_for_calls(log: &Path, n: usize) -> Vec<String> {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let seen = calls(log);
            if seen.len() >= n {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("ctrl script saw {:?}, wanted {n} calls", calls(log)))
}

#[tokio::test]
async fn deploy_config_reaches_ctrl_script() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let ks = KeySpace::new("deploy", Stage::Dev);
    let store = Store::in_memory(&ks.prefix()).unwrap();
    let cancel = CancellationToken::new();

    store
        .update(
            &ks.host_info("h1"),
            &HostInfo {
                id: "h1".into(),
                host_name: "web01".into(),
                ip: "10.0.0.1".into(),
                stage: Stage::Dev,
                labels: BTreeMap::new(),
                capacity: DeployResource::new(16384, 8000),
                cpu_count: 8,
                updated_at: 0,
            },
            0,
        )
        .await
        .unwrap();
    store
        .update(
            &ks.host_stat("h1"),
            &HostStatus {
                id: "h1".into(),
                ..Default::default()
            },
            0,
        )
        .await
        .unwrap();

    // ── controller side ──────────────────────────────────────────
    let settings = ControllerSettings {
        wait: WaitPolicy {
            enabled: false,
            ..WaitPolicy::default()
        },
        legacy_timeout: None,
        scheduler_seed: Some(7),
    };
    let ctx = Arc::new(ControllerContext::new(store.clone(), ks.clone(), settings));
    ctx.infor.start(&cancel).await.unwrap();
    ctx.host_configs.load().await.unwrap();
    let configs = DeployConfigManager::new(
        store.clone(),
        Arc::new(DefaultResources::builtin()),
        &cancel,
    );
    let changes = configs.start();
    let manager = Arc::new(ControllerManager::new(ctx, 4, Duration::from_secs(60)));
    {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(changes, cancel).await });
    }

    // ── agent side ───────────────────────────────────────────────
    let reporter = InstanceReporter::new(store.clone(), ks.clone(), "h1", Duration::from_secs(300));
    let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(64);
    let converger = Converger::new(
        store.clone(),
        ks.clone(),
        "h1",
        CtrlScript::new(ctrl_script(dir.path(), &log)),
        reporter.clone(),
        event_tx,
    );
    tokio::spawn(reporter.clone().run(event_rx, cancel.clone()));
    tokio::spawn(converger.run(cancel.clone()));

    // ── deploy ───────────────────────────────────────────────────
    let key = DeployKey::new("java", "crm");
    let mut cfg = DeployConfig::new(Stage::Dev, &key, 1, Image::new("java/crm", "v1.0.0"));
    cfg.update_policy = UpdatePolicy::NewDeploy {
        step: Duration::from_millis(10),
        timeout: Duration::from_secs(60),
    };
    let api = DeployConfigApi::new(store.clone(), ks.clone());
    api.create(&cfg).await.unwrap();

    let seen = wait_for_calls(&log, 1).await;
    assert_eq!(seen, ["start java crm 0 v1.0.0"]);

    // the scanner would report the started process; stand in for it
    let mut ins = Instance::sample(&key, "ins-1", "h1", "v1.0.0");
    ins.pid = 4242;
    ins.life_cycle = LifeCycle::Running;
    reporter
        .apply(AgentEvent {
            kind: AgentEventKind::Started,
            instance: ins,
        })
        .await
        .unwrap();

    // ── remove ───────────────────────────────────────────────────
    api.delete(&key).await.unwrap();
    let seen = wait_for_calls(&log, 2).await;
    assert_eq!(seen[1], "stop java crm 4242 v1.0.0");

    cancel.cancel();
}
