//! Per-environment ZooKeeper ↔ store mirror.
//!
//! ```text
//!   ZooKeeper bases ──watch──▶ merged events ──▶ copy / delete / diff ──▶ {root}/{stage}/…
//!        ▲    │                                                              │
//!        │    └──── bulk copy + prune on start ──────────────────────────────┤
//!        └────────── set / create / delete ◀── store watch ◀─────────────────┘
//! ```
//!
//! Only route and config kinds are mirrored; service registrations stay
//! authoritative in ZooKeeper. ZooKeeper wins at start; afterwards a change
//! on either side is carried to the other. A write is skipped when the target
//! already holds the same bytes, which is what stops echoes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::Stage;
use fleet_core::config::{ZkConfig, ZkEnvConfig};
use fleet_registry::RouteConfig;
use fleet_store::{Predicate, Store, StoreError, StoreResult, WatchEvent};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ZkError, ZkResult};
use crate::path::{MirrorPath, PathMapper, ZkKind};
use crate::source::{ZkClientSource, ZkEvent, ZkSource};

const MERGED_CHANNEL_SIZE: usize = 1024;

/// A watched ZooKeeper subtree and the paths under it allowed through.
#[derive(Debug, Clone)]
pub struct MirrorBase {
    path: String,
    allow: Vec<Regex>,
}

impl MirrorBase {
    pub fn new(path: &str, allow: &[String]) -> ZkResult<Self> {
        let allow = allow
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ZkError::Pattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<ZkResult<Vec<_>>>()?;
        let trimmed = path.trim_end_matches('/');
        Ok(Self {
            path: if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() },
            allow,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn contains(&self, zk_path: &str) -> bool {
        self.path == "/"
            || zk_path == self.path
            || zk_path
                .strip_prefix(&self.path)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    fn allows(&self, zk_path: &str) -> bool {
        self.allow.is_empty() || self.allow.iter().any(|re| re.is_match(zk_path))
    }
}

fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Log every bad line of a route table that does not parse.
fn parse_route(mp: &MirrorPath, zk_path: &str, data: &[u8]) -> Option<RouteConfig> {
    if mp.kind != ZkKind::Route || mp.rest.is_empty() || data.is_empty() {
        return None;
    }
    match RouteConfig::parse(mp.version, data) {
        Ok(route) => Some(route),
        Err(e) => {
            warn!(path = %zk_path, error = %e, "route table does not parse, mirroring as is");
            for line in e.bad_lines() {
                warn!(path = %zk_path, "{line}");
            }
            None
        }
    }
}

/// Bytes to write to ZooKeeper: route tables in their canonical text form,
/// everything else verbatim.
fn render_route(mp: &MirrorPath, zk_path: &str, data: &[u8]) -> Vec<u8> {
    match parse_route(mp, zk_path, data) {
        Some(route) => route.to_string().into_bytes(),
        None => data.to_vec(),
    }
}

pub struct Mirror {
    source: Arc<dyn ZkSource>,
    store: Store,
    mapper: PathMapper,
    stage: Stage,
    bases: Vec<MirrorBase>,
}

impl Mirror {
    /// `store` may have any prefix; the mirror re-roots it at the mapper's root.
    pub fn new(
        source: Arc<dyn ZkSource>,
        store: &Store,
        mapper: &PathMapper,
        stage: Stage,
        bases: Vec<MirrorBase>,
    ) -> Self {
        Self {
            source,
            store: store.with_prefix(mapper.root()),
            mapper: mapper.clone(),
            stage,
            bases,
        }
    }

    fn in_bases(&self, zk_path: &str) -> bool {
        self.bases
            .iter()
            .any(|b| b.contains(zk_path) && b.allows(zk_path))
    }

    /// Store key (relative to the mirror root) for a path that may be copied.
    fn admitted(&self, zk_path: &str) -> Option<(MirrorPath, String)> {
        if !self.in_bases(zk_path) {
            return None;
        }
        let mp = MirrorPath::from_zk(zk_path)?;
        if mp.kind == ZkKind::Instance {
            return None;
        }
        let key = mp.store_key(self.stage);
        Some((mp, key))
    }

    /// ZooKeeper node for a store key (relative to the mirror root) that may
    /// be written back.
    fn admitted_key(&self, key: &str) -> Option<(MirrorPath, String)> {
        let (stage, mp) = MirrorPath::from_store_key(key)?;
        if stage != self.stage || mp.kind == ZkKind::Instance {
            return None;
        }
        let zk_path = self.mapper.get_zk_path(&format!("{}/{key}", self.mapper.root()))?;
        if !self.in_bases(&zk_path) {
            return None;
        }
        Some((mp, zk_path))
    }

    fn is_instance_subtree(zk_path: &str) -> bool {
        MirrorPath::from_zk(zk_path).is_some_and(|mp| mp.kind == ZkKind::Instance)
    }

    /// Copy every admitted node under every base, then drop mirrored keys
    /// whose node is gone. Returns the number copied.
    pub async fn sync_all(&self) -> ZkResult<usize> {
        let mut copied = 0;
        for base in &self.bases {
            copied += self.sync_subtree(base.path()).await?;
        }
        let pruned = self.prune().await?;
        info!(stage = %self.stage, copied, pruned, "zookeeper bulk copy complete");
        Ok(copied)
    }

    async fn prune(&self) -> ZkResult<usize> {
        let mut pruned = 0;
        for kind in [ZkKind::Route, ZkKind::Config] {
            let prefix = format!("{}/{kind}/", self.stage);
            let stored = self
                .store
                .list_map::<Vec<u8>>(&prefix, &Predicate::everything())
                .await?;
            for suffix in stored.keys() {
                let key = format!("{prefix}{suffix}");
                let Some((_, zk_path)) = self.admitted_key(&key) else {
                    continue;
                };
                if self.source.get_data(&zk_path).await?.is_none() {
                    debug!(%key, path = %zk_path, "node gone from zookeeper, pruned");
                    self.delete_key(&key).await?;
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    async fn sync_subtree(&self, root: &str) -> ZkResult<usize> {
        let mut copied = 0;
        let mut stack = vec![root.to_string()];
        while let Some(path) = stack.pop() {
            if Self::is_instance_subtree(&path) {
                continue;
            }
            if self.copy_node(&path).await? {
                copied += 1;
            }
            for child in self.source.get_children(&path).await? {
                stack.push(child_path(&path, &child));
            }
        }
        Ok(copied)
    }

    /// Mirror one node's data. Returns whether anything was written.
    async fn copy_node(&self, zk_path: &str) -> ZkResult<bool> {
        let Some((mp, key)) = self.admitted(zk_path) else {
            return Ok(false);
        };
        match self.source.get_data(zk_path).await? {
            Some(data) => {
                if self.store.try_get::<Vec<u8>>(&key).await?.as_deref() == Some(&data[..]) {
                    return Ok(false);
                }
                parse_route(&mp, zk_path, &data);
                self.store.update(&key, &data, 0).await?;
                debug!(path = %zk_path, %key, bytes = data.len(), "mirrored");
                Ok(true)
            }
            None => {
                self.delete_key(&key).await?;
                Ok(false)
            }
        }
    }

    async fn delete_key(&self, key: &str) -> StoreResult<()> {
        match self.store.delete::<Vec<u8>>(key).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove `key` and everything below it.
    async fn delete_subtree(&self, key: &str) -> StoreResult<usize> {
        let below = self
            .store
            .list_map::<Vec<u8>>(&format!("{key}/"), &Predicate::everything())
            .await?;
        for suffix in below.keys() {
            self.delete_key(&format!("{key}/{suffix}")).await?;
        }
        self.delete_key(key).await?;
        Ok(below.len() + 1)
    }

    /// Reconcile the store's children of `zk_path` with ZooKeeper's.
    async fn diff_children(&self, zk_path: &str) -> ZkResult<()> {
        let zk_children: BTreeSet<String> =
            self.source.get_children(zk_path).await?.into_iter().collect();
        let stored: BTreeSet<String> = match self.admitted(zk_path) {
            Some((_, key)) => self.store.list_keys(&key).await?.into_iter().collect(),
            None => BTreeSet::new(),
        };
        for child in zk_children.difference(&stored) {
            self.sync_subtree(&child_path(zk_path, child)).await?;
        }
        if let Some((_, key)) = self.admitted(zk_path) {
            for child in stored.difference(&zk_children) {
                debug!(path = %zk_path, %child, "child gone from zookeeper");
                self.delete_subtree(&format!("{key}/{child}")).await?;
            }
        }
        Ok(())
    }

    pub async fn handle(&self, event: ZkEvent) -> ZkResult<()> {
        match event {
            ZkEvent::Created(path) | ZkEvent::DataChanged(path) => {
                self.copy_node(&path).await?;
            }
            ZkEvent::Deleted(path) => {
                if let Some((_, key)) = self.admitted(&path) {
                    self.delete_subtree(&key).await?;
                    debug!(%path, %key, "mirror entry deleted");
                }
            }
            ZkEvent::ChildrenChanged(path) => self.diff_children(&path).await?,
            ZkEvent::SessionLost => return Err(ZkError::SessionLost),
        }
        Ok(())
    }

    // ── Store → ZooKeeper ────────────────────────────────────────

    /// Carry one store change (key relative to the mirror root) to ZooKeeper.
    pub async fn handle_store(&self, key: &str, data: Option<&[u8]>) -> ZkResult<()> {
        let Some((mp, zk_path)) = self.admitted_key(key) else {
            return Ok(());
        };
        let current = self.source.get_data(&zk_path).await?;
        match data {
            Some(data) => {
                if current.as_deref() == Some(data) {
                    return Ok(());
                }
                let rendered = render_route(&mp, &zk_path, data);
                if current.as_deref() == Some(&rendered[..]) {
                    return Ok(());
                }
                if !self.source.set_data(&zk_path, &rendered).await? {
                    self.source.create(&zk_path, &rendered).await?;
                }
                debug!(%key, path = %zk_path, bytes = rendered.len(), "written back");
            }
            None => {
                if current.is_none() && self.source.get_children(&zk_path).await?.is_empty() {
                    return Ok(());
                }
                self.delete_zk_subtree(&zk_path).await?;
                debug!(%key, path = %zk_path, "deleted in zookeeper");
            }
        }
        Ok(())
    }

    async fn delete_zk_subtree(&self, root: &str) -> ZkResult<()> {
        let mut order = Vec::new();
        let mut stack = vec![root.to_string()];
        while let Some(path) = stack.pop() {
            for child in self.source.get_children(&path).await? {
                stack.push(child_path(&path, &child));
            }
            order.push(path);
        }
        for path in order.iter().rev() {
            self.source.delete(path).await?;
        }
        Ok(())
    }

    /// Watch every base, bulk copy, then follow both sides until cancelled.
    pub async fn run(&self, cancel: &CancellationToken) -> ZkResult<()> {
        let watch_cancel = cancel.child_token();
        let _guard = watch_cancel.clone().drop_guard();

        let (tx, mut merged) = mpsc::channel(MERGED_CHANNEL_SIZE);
        for base in &self.bases {
            let mut rx = self.source.watch(base.path(), &watch_cancel).await?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        self.sync_all().await?;

        let stage_prefix = format!("{}/", self.stage);
        let mut store_events = self
            .store
            .watch::<Vec<u8>>(&stage_prefix, Predicate::everything(), true, &watch_cancel)
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = merged.recv() => match event {
                    Some(event) => self.handle(event).await?,
                    None => return Err(ZkError::SessionLost),
                },
                event = store_events.recv() => match event {
                    Some(WatchEvent::Added { key, object }) | Some(WatchEvent::Modified { key, object }) => {
                        self.handle_store(&format!("{stage_prefix}{key}"), Some(&object)).await?;
                    }
                    Some(WatchEvent::Deleted { key, .. }) => {
                        self.handle_store(&format!("{stage_prefix}{key}"), None).await?;
                    }
                    Some(WatchEvent::Error(e)) => return Err(e.into()),
                    None => return Err(StoreError::Unreachable("store watch closed".into()).into()),
                },
            }
        }
    }
}

/// Connect to one environment's ensemble and mirror it until cancelled or broken.
pub async fn sync_env(
    env: &ZkEnvConfig,
    zk: &ZkConfig,
    store: &Store,
    cancel: &CancellationToken,
) -> ZkResult<()> {
    let bases = env
        .base
        .iter()
        .map(|b| MirrorBase::new(&b.path, &b.allow))
        .collect::<ZkResult<Vec<_>>>()?;
    let source = ZkClientSource::connect(&env.addr, Duration::from_secs(zk.dial_timeout_secs)).await?;
    let mapper = PathMapper::new(&zk.root);
    Mirror::new(Arc::new(source), store, &mapper, env.stage, bases)
        .run(cancel)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeZk;

    fn base(path: &str, allow: &[&str]) -> MirrorBase {
        let allow: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        MirrorBase::new(path, &allow).unwrap()
    }

    fn seeded() -> Arc<FakeZk> {
        let zk = Arc::new(FakeZk::default());
        zk.set("/biz/bar/app/policy/default/route", b"=> cluster = blue");
        zk.set("/biz/bar/app/config/db", b"url=x");
        zk.set("/biz/bar/app/daemon/n1", b"10.0.0.1:8080");
        zk.set("/service/crm/route/default", b"region = sh;bj");
        zk.set("/service/crm/config/db", b"url=y");
        zk.set("/service/crm/instance/i1", b"10.0.0.2:8080");
        zk
    }

    fn mirror(zk: &Arc<FakeZk>, store: &Store) -> Mirror {
        Mirror::new(
            zk.clone(),
            store,
            &PathMapper::new("/mnt/zk"),
            Stage::Int,
            vec![
                base("/biz", &[]),
                base("/service", &["^/service/crm/route(/.*)?$"]),
            ],
        )
    }

    async fn mirrored(store: &Store, key: &str) -> Option<Vec<u8>> {
        store.with_prefix("/mnt/zk").try_get::<Vec<u8>>(key).await.unwrap()
    }

    async fn eventually(store: &Store, key: &str, want: Option<&[u8]>) {
        for _ in 0..200 {
            if mirrored(store, key).await.as_deref() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{key} never became {want:?}");
    }

    async fn eventually_zk(zk: &FakeZk, path: &str, want: Option<&[u8]>) {
        for _ in 0..200 {
            if zk.data(path).as_deref() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{path} never became {want:?}");
    }

    #[test]
    fn bad_allow_pattern() {
        let err = MirrorBase::new("/biz", &["(".to_string()]).unwrap_err();
        assert!(matches!(err, ZkError::Pattern { .. }));
    }

    #[tokio::test]
    async fn bulk_copy_respects_kinds_and_allowlist() {
        let zk = seeded();
        let store = Store::in_memory("/").unwrap();
        let copied = mirror(&zk, &store).sync_all().await.unwrap();
        assert_eq!(copied, 3);

        assert_eq!(
            mirrored(&store, "int/route/4/bar.app/default/route").await.as_deref(),
            Some(&b"=> cluster = blue"[..])
        );
        assert_eq!(
            mirrored(&store, "int/config/4/bar.app/db").await.as_deref(),
            Some(&b"url=x"[..])
        );
        assert_eq!(
            mirrored(&store, "int/route/2/crm/default").await.as_deref(),
            Some(&b"region = sh;bj"[..])
        );
        // daemon / instance never mirrored, config under /service not allowed
        assert_eq!(mirrored(&store, "int/instance/4/bar.app/n1").await, None);
        assert_eq!(mirrored(&store, "int/instance/2/crm/i1").await, None);
        assert_eq!(mirrored(&store, "int/config/2/crm/db").await, None);
    }

    #[tokio::test]
    async fn malformed_route_is_still_mirrored() {
        let zk = Arc::new(FakeZk::default());
        zk.set("/service/crm/route/default", b"no separator here");
        let store = Store::in_memory("/").unwrap();
        let m = Mirror::new(
            zk.clone(),
            &store,
            &PathMapper::new("/mnt/zk"),
            Stage::Int,
            vec![base("/service", &[])],
        );
        m.sync_all().await.unwrap();
        assert_eq!(
            mirrored(&store, "int/route/2/crm/default").await.as_deref(),
            Some(&b"no separator here"[..])
        );
    }

    #[tokio::test]
    async fn follows_changes() {
        let zk = seeded();
        let store = Store::in_memory("/").unwrap();
        let m = mirror(&zk, &store);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { m.run(&cancel).await })
        };
        eventually(&store, "int/route/4/bar.app/default/route", Some(b"=> cluster = blue")).await;

        zk.set("/biz/bar/app/policy/default/route", b"=> cluster = green");
        eventually(&store, "int/route/4/bar.app/default/route", Some(b"=> cluster = green")).await;

        zk.set("/biz/foo/svc/config/cache", b"ttl=5");
        eventually(&store, "int/config/4/foo.svc/cache", Some(b"ttl=5")).await;

        zk.remove("/biz/foo/svc/config/cache");
        eventually(&store, "int/config/4/foo.svc/cache", None).await;

        // a child vanishes without its own event; the parent's child list catches it
        zk.remove_quietly("/biz/bar/app/config/db");
        zk.emit(ZkEvent::ChildrenChanged("/biz/bar/app/config".into()));
        eventually(&store, "int/config/4/bar.app/db", None).await;

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn session_loss_ends_the_run() {
        let zk = seeded();
        let store = Store::in_memory("/").unwrap();
        let m = mirror(&zk, &store);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { m.run(&cancel).await })
        };
        eventually(&store, "int/route/2/crm/default", Some(b"region = sh;bj")).await;
        zk.emit(ZkEvent::SessionLost);
        assert!(matches!(task.await.unwrap(), Err(ZkError::SessionLost)));
    }

    #[tokio::test]
    async fn startup_prunes_keys_gone_from_zookeeper() {
        let zk = seeded();
        let store = Store::in_memory("/").unwrap();
        let root = store.with_prefix("/mnt/zk");
        root.update("int/config/4/bar.app/stale", &b"x".to_vec(), 0).await.unwrap();
        root.update("int/config/2/crm/old", &b"y".to_vec(), 0).await.unwrap();

        mirror(&zk, &store).sync_all().await.unwrap();
        assert_eq!(mirrored(&store, "int/config/4/bar.app/stale").await, None);
        // outside the allowlist, so never ours to remove
        assert!(mirrored(&store, "int/config/2/crm/old").await.is_some());
        assert_eq!(zk.writes(), 0);
    }

    #[tokio::test]
    async fn writes_store_changes_back() {
        let zk = seeded();
        let store = Store::in_memory("/").unwrap();
        let root = store.with_prefix("/mnt/zk");
        let m = mirror(&zk, &store);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { m.run(&cancel).await })
        };
        eventually(&store, "int/route/2/crm/default", Some(b"region = sh;bj")).await;

        root.update("int/route/2/crm/default", &b"region = sh;bj;gz".to_vec(), 0)
            .await
            .unwrap();
        let rendered = b"# auto generated\nregion = sh;bj;gz\n";
        eventually_zk(&zk, "/service/crm/route/default", Some(rendered)).await;
        // the rendered table comes back into the store and stops there
        eventually(&store, "int/route/2/crm/default", Some(rendered)).await;

        root.update("int/instance/2/crm/i2", &b"10.0.0.3:8080".to_vec(), 0).await.unwrap();
        root.update("int/config/2/crm/db2", &b"url=z".to_vec(), 0).await.unwrap();
        root.update("int/config/4/bar.app/cache", &b"ttl=9".to_vec(), 0).await.unwrap();
        eventually_zk(&zk, "/biz/bar/app/config/cache", Some(b"ttl=9")).await;
        assert_eq!(zk.data("/service/crm/instance/i2"), None);
        assert_eq!(zk.data("/service/crm/config/db2"), None);

        root.delete::<Vec<u8>>("int/config/4/bar.app/cache").await.unwrap();
        eventually_zk(&zk, "/biz/bar/app/config/cache", None).await;

        // route set, config create, config delete; nothing from the bulk copy
        assert_eq!(zk.writes(), 3);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
