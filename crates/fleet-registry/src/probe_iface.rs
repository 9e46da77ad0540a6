//! Probe interfaces — named sample calls per deployment.
//!
//! Stored as one JSON map per deployment under `java/probe/{deployName}`.
//! The provider follows that subtree and hands the agent the interfaces
//! that apply to its stage.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use fleet_core::Stage;
use fleet_core::keyspace::JAVA_PROBE;
use fleet_store::{Predicate, Store, WatchEvent};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RESYNC_DELAY: Duration = Duration::from_secs(1);

/// One sample call and how to judge its response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbeInterface {
    pub name: String,
    pub desc: String,
    /// Request path on the instance's listening port.
    pub path: String,
    /// Request body.
    pub data: String,
    pub headers: BTreeMap<String, String>,
    /// Stages the call may run in; empty means all.
    pub stages: Vec<Stage>,
    /// Patterns the response body must all match.
    pub matches: Vec<String>,
    /// Patterns the response body must not match.
    pub dont_matches: Vec<String>,
}

impl ProbeInterface {
    pub fn applies_to(&self, stage: Stage) -> bool {
        self.stages.is_empty() || self.stages.contains(&stage)
    }

    /// Check a response body against `matches` and `dont_matches`.
    pub fn check_response(&self, body: &str) -> Result<(), String> {
        for pattern in &self.matches {
            let re = Regex::new(pattern).map_err(|e| format!("bad pattern {pattern:?}: {e}"))?;
            if !re.is_match(body) {
                return Err(format!("{}: response does not match {pattern:?}", self.name));
            }
        }
        for pattern in &self.dont_matches {
            let re = Regex::new(pattern).map_err(|e| format!("bad pattern {pattern:?}: {e}"))?;
            if re.is_match(body) {
                return Err(format!("{}: response matches {pattern:?}", self.name));
            }
        }
        Ok(())
    }
}

/// Interfaces of one deployment, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeInterfaces(pub BTreeMap<String, ProbeInterface>);

fleet_store::json_codec!(ProbeInterfaces);

/// Where the java prober gets its sample calls.
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self, deploy_name: &str) -> Vec<ProbeInterface>;
}

/// Watched cache of `java/probe/`.
#[derive(Clone)]
pub struct ProbeInterfaceProvider {
    store: Store,
    stage: Stage,
    cache: Arc<RwLock<HashMap<String, ProbeInterfaces>>>,
}

impl ProbeInterfaceProvider {
    pub fn new(store: Store, stage: Stage) -> Self {
        Self {
            store,
            stage,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Follow `java/probe/` until cancelled.
    pub fn start(&self, cancel: &CancellationToken) -> JoinHandle<()> {
        let provider = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { provider.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        loop {
            match self
                .store
                .watch::<ProbeInterfaces>(JAVA_PROBE, Predicate::everything(), true, &cancel)
                .await
            {
                Ok(mut stream) => {
                    self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
                    loop {
                        let event = tokio::select! {
                            _ = cancel.cancelled() => return,
                            event = stream.recv() => event,
                        };
                        match event {
                            Some(WatchEvent::Error(e)) => {
                                warn!(error = %e, "probe interface watch broke");
                                break;
                            }
                            Some(event) => self.apply(event),
                            None => break,
                        }
                    }
                }
                Err(e) => warn!(error = %e, "probe interface watch failed to start"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RESYNC_DELAY) => {}
            }
        }
    }

    pub fn apply(&self, event: WatchEvent<ProbeInterfaces>) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            WatchEvent::Added { key, object } | WatchEvent::Modified { key, object } => {
                debug!(deploy = %key, interfaces = object.0.len(), "probe interfaces updated");
                cache.insert(key, object);
            }
            WatchEvent::Deleted { key, .. } => {
                cache.remove(&key);
            }
            WatchEvent::Error(_) => {}
        }
    }
}

impl InterfaceSource for ProbeInterfaceProvider {
    fn interfaces(&self, deploy_name: &str) -> Vec<ProbeInterface> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(deploy_name)
            .map(|set| {
                set.0
                    .values()
                    .filter(|iface| iface.applies_to(self.stage))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, stages: Vec<Stage>) -> ProbeInterface {
        ProbeInterface {
            name: name.into(),
            path: "/rpc".into(),
            data: r#"{"method":"ping"}"#.into(),
            stages,
            matches: vec![r#""ok"\s*:\s*true"#.into()],
            dont_matches: vec!["exception".into()],
            ..Default::default()
        }
    }

    #[test]
    fn response_checks() {
        let i = iface("ping", vec![]);
        assert!(i.check_response(r#"{"ok": true}"#).is_ok());
        assert!(i.check_response(r#"{"ok": false}"#).is_err());
        assert!(i.check_response(r#"{"ok": true, "exception": "npe"}"#).is_err());
    }

    #[test]
    fn wire_names() {
        let json = serde_json::to_value(iface("ping", vec![Stage::Int])).unwrap();
        assert!(json.get("dontMatches").is_some());
        assert_eq!(json["stages"], serde_json::json!(["int"]));
    }

    #[tokio::test]
    async fn provider_filters_by_stage() {
        let store = Store::in_memory("/deploy/int").unwrap();
        let mut set = ProbeInterfaces::default();
        set.0.insert("all".into(), iface("all", vec![]));
        set.0.insert("prd".into(), iface("prd", vec![Stage::Prd]));
        store.update("java/probe/foo:bar", &set, 0).await.unwrap();

        let provider = ProbeInterfaceProvider::new(store.clone(), Stage::Int);
        let cancel = CancellationToken::new();
        let task = provider.start(&cancel);

        let mut names = Vec::new();
        for _ in 0..200 {
            names = provider
                .interfaces("foo:bar")
                .into_iter()
                .map(|i| i.name)
                .collect::<Vec<_>>();
            if !names.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(names, ["all"]);
        assert!(provider.interfaces("other").is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}
