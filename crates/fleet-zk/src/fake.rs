//! In-memory [`ZkSource`] for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ZkError, ZkResult};
use crate::source::{ZkEvent, ZkSource};

/// Nodes that were never `set` exist implicitly as data-less parents.
#[derive(Default)]
pub struct FakeZk {
    nodes: Mutex<BTreeMap<String, Vec<u8>>>,
    watchers: Mutex<Vec<(String, mpsc::Sender<ZkEvent>)>>,
    /// Writes that came in through [`ZkSource`].
    writes: AtomicUsize,
}

fn under(root: &str, path: &str) -> bool {
    root == "/" || path == root || path.strip_prefix(root).is_some_and(|r| r.starts_with('/'))
}

impl FakeZk {
    pub fn set(&self, path: &str, data: &[u8]) {
        let existed = self
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), data.to_vec())
            .is_some();
        self.notify(if existed {
            ZkEvent::DataChanged(path.to_string())
        } else {
            ZkEvent::Created(path.to_string())
        });
    }

    pub fn remove(&self, path: &str) {
        self.remove_quietly(path);
        self.notify(ZkEvent::Deleted(path.to_string()));
    }

    pub fn remove_quietly(&self, path: &str) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every watcher, regardless of path.
    pub fn emit(&self, event: ZkEvent) {
        let watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, tx) in watchers.iter() {
            let _ = tx.try_send(event.clone());
        }
    }

    fn notify(&self, event: ZkEvent) {
        let path = match &event {
            ZkEvent::Created(p)
            | ZkEvent::DataChanged(p)
            | ZkEvent::ChildrenChanged(p)
            | ZkEvent::Deleted(p) => p.clone(),
            ZkEvent::SessionLost => return,
        };
        let watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        for (root, tx) in watchers.iter() {
            if under(root, &path) {
                let _ = tx.try_send(event.clone());
            }
        }
    }
}

#[async_trait]
impl ZkSource for FakeZk {
    async fn get_data(&self, path: &str) -> ZkResult<Option<Vec<u8>>> {
        Ok(self.data(path))
    }

    async fn get_children(&self, path: &str) -> ZkResult<Vec<String>> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        let nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = Vec::new();
        for key in nodes.keys() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let child = rest.split('/').next().unwrap_or_default();
            if !child.is_empty() && out.last().map(String::as_str) != Some(child) {
                out.push(child.to_string());
            }
        }
        Ok(out)
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> ZkResult<bool> {
        if self.data(path).is_none() {
            return Ok(false);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.set(path, data);
        Ok(true)
    }

    async fn create(&self, path: &str, data: &[u8]) -> ZkResult<()> {
        if self.data(path).is_some() {
            return Err(ZkError::Op {
                path: path.to_string(),
                reason: "node exists".into(),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.set(path, data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> ZkResult<()> {
        if !self.get_children(path).await?.is_empty() {
            return Err(ZkError::Op {
                path: path.to_string(),
                reason: "node has children".into(),
            });
        }
        if self.data(path).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.remove(path);
        }
        Ok(())
    }

    async fn watch(&self, path: &str, _cancel: &CancellationToken) -> ZkResult<mpsc::Receiver<ZkEvent>> {
        let (tx, rx) = mpsc::channel(256);
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((path.to_string(), tx));
        Ok(rx)
    }
}
