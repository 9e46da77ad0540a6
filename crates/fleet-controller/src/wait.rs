//! Waiting for a freshly requested replica to report in.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::{DeployKey, Instance, KeySpace, LifeCycle, RestartPolicy};
use fleet_store::{Attrs, Predicate, Store, WatchEvent};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ControllerError, ControllerResult};

/// Arrival windows used to tell a new start from an old process.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub enabled: bool,
    /// `onetime` processes may exit right after starting.
    pub onetime_window: chrono::Duration,
    pub running_window: chrono::Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            onetime_window: chrono::Duration::seconds(10),
            running_window: chrono::Duration::minutes(2),
        }
    }
}

impl WaitPolicy {
    /// Whether `ins` is the replica we asked for.
    pub fn is_up(
        &self,
        ins: &Instance,
        key: &DeployKey,
        version: &str,
        restart: &RestartPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        if ins.deploy_key() != *key || ins.version != version {
            return false;
        }
        match restart {
            RestartPolicy::Onetime => ins.started_within(self.onetime_window, now),
            _ => ins.started_within(self.running_window, now) && ins.life_cycle == LifeCycle::Running,
        }
    }
}

/// Block until an instance of `key` at `version` is up on `host`.
#[allow(clippy::too_many_arguments)]
pub async fn wait_instance_up(
    store: &Store,
    keyspace: &KeySpace,
    host: &str,
    key: &DeployKey,
    version: &str,
    restart: &RestartPolicy,
    policy: &WaitPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ControllerResult<Instance> {
    let on_host = Predicate::fields(
        format!("hostID={host}").parse()?,
        |ins: &Instance| {
            let mut attrs = Attrs::default();
            attrs.fields.insert("hostID".into(), ins.host_id.clone());
            attrs
        },
    );
    let watch_cancel = cancel.child_token();
    let _stop = watch_cancel.clone().drop_guard();
    let mut stream = store
        .watch(&keyspace.instances_on_host(host), on_host, true, &watch_cancel)
        .await?;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(ControllerError::Cancelled),
            _ = &mut deadline => {
                return Err(ControllerError::InstanceNotUp {
                    key: key.clone(),
                    host: host.to_string(),
                    timeout,
                });
            }
            event = stream.recv() => event,
        };
        match event {
            Some(WatchEvent::Added { object, .. }) | Some(WatchEvent::Modified { object, .. }) => {
                if policy.is_up(&object, key, version, restart, Utc::now()) {
                    debug!(deploy = %key, %host, instance = %object.id, "instance up");
                    return Ok(object);
                }
            }
            Some(WatchEvent::Deleted { .. }) => {}
            Some(WatchEvent::Error(e)) => return Err(e.into()),
            None => return Err(ControllerError::Cancelled),
        }
    }
}
