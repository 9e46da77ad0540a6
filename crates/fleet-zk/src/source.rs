//! ZooKeeper access behind a small trait so the mirror can run against a fake.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ZkError, ZkResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZkEvent {
    Created(String),
    DataChanged(String),
    ChildrenChanged(String),
    Deleted(String),
    /// The session ended; the watch delivers nothing further.
    SessionLost,
}

const EVENT_CHANNEL_SIZE: usize = 256;

#[async_trait]
pub trait ZkSource: Send + Sync {
    /// Node data, `None` when the node does not exist.
    async fn get_data(&self, path: &str) -> ZkResult<Option<Vec<u8>>>;

    /// Child names, empty when the node does not exist.
    async fn get_children(&self, path: &str) -> ZkResult<Vec<String>>;

    /// Overwrite node data. `false` when the node does not exist.
    async fn set_data(&self, path: &str, data: &[u8]) -> ZkResult<bool>;

    /// Create a persistent node, creating missing parents with empty data.
    async fn create(&self, path: &str, data: &[u8]) -> ZkResult<()>;

    /// Delete a childless node. A missing node is not an error.
    async fn delete(&self, path: &str) -> ZkResult<()>;

    /// Recursive change notifications under `path` until `cancel` fires.
    async fn watch(&self, path: &str, cancel: &CancellationToken) -> ZkResult<mpsc::Receiver<ZkEvent>>;
}

/// Every proper ancestor of `path`, shallowest first.
pub(crate) fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let segs: Vec<&str> = path.trim_matches('/').split('/').collect();
    for seg in &segs[..segs.len().saturating_sub(1)] {
        current.push('/');
        current.push_str(seg);
        out.push(current.clone());
    }
    out
}

/// [`ZkSource`] over a live ZooKeeper ensemble.
pub struct ZkClientSource {
    client: zookeeper_client::Client,
}

impl ZkClientSource {
    pub async fn connect(addr: &str, dial_timeout: Duration) -> ZkResult<Self> {
        let connect = zookeeper_client::Client::connect(addr);
        let client = match tokio::time::timeout(dial_timeout, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(ZkError::Connect {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ZkError::Connect {
                    addr: addr.to_string(),
                    reason: format!("no session within {dial_timeout:?}"),
                });
            }
        };
        info!(%addr, "zookeeper session established");
        Ok(Self { client })
    }
}

fn op_error(path: &str, e: zookeeper_client::Error) -> ZkError {
    match e {
        zookeeper_client::Error::SessionExpired | zookeeper_client::Error::ClientClosed => {
            ZkError::SessionLost
        }
        other => ZkError::Op {
            path: path.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl ZkSource for ZkClientSource {
    async fn get_data(&self, path: &str) -> ZkResult<Option<Vec<u8>>> {
        match self.client.get_data(path).await {
            Ok((data, _stat)) => Ok(Some(data)),
            Err(zookeeper_client::Error::NoNode) => Ok(None),
            Err(e) => Err(op_error(path, e)),
        }
    }

    async fn get_children(&self, path: &str) -> ZkResult<Vec<String>> {
        match self.client.list_children(path).await {
            Ok(children) => Ok(children),
            Err(zookeeper_client::Error::NoNode) => Ok(Vec::new()),
            Err(e) => Err(op_error(path, e)),
        }
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> ZkResult<bool> {
        match self.client.set_data(path, data, None).await {
            Ok(_) => Ok(true),
            Err(zookeeper_client::Error::NoNode) => Ok(false),
            Err(e) => Err(op_error(path, e)),
        }
    }

    async fn create(&self, path: &str, data: &[u8]) -> ZkResult<()> {
        let options = zookeeper_client::CreateMode::Persistent.with_acls(zookeeper_client::Acls::anyone_all());
        for parent in ancestors(path) {
            match self.client.create(&parent, &[], &options).await {
                Ok(_) | Err(zookeeper_client::Error::NodeExists) => {}
                Err(e) => return Err(op_error(&parent, e)),
            }
        }
        self.client
            .create(path, data, &options)
            .await
            .map(|_| ())
            .map_err(|e| op_error(path, e))
    }

    async fn delete(&self, path: &str) -> ZkResult<()> {
        match self.client.delete(path, None).await {
            Ok(()) | Err(zookeeper_client::Error::NoNode) => Ok(()),
            Err(e) => Err(op_error(path, e)),
        }
    }

    async fn watch(&self, path: &str, cancel: &CancellationToken) -> ZkResult<mpsc::Receiver<ZkEvent>> {
        let mut watcher = self
            .client
            .watch(path, zookeeper_client::AddWatchMode::PersistentRecursive)
            .await
            .map_err(|e| op_error(path, e))?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let cancel = cancel.clone();
        let root = path.to_string();
        tokio::spawn(async move {
            debug!(path = %root, "zookeeper watch started");
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = watcher.changed() => event,
                };
                use zookeeper_client::EventType;
                let translated = match event.event_type {
                    EventType::NodeCreated => ZkEvent::Created(event.path),
                    EventType::NodeDataChanged => ZkEvent::DataChanged(event.path),
                    EventType::NodeChildrenChanged => ZkEvent::ChildrenChanged(event.path),
                    EventType::NodeDeleted => ZkEvent::Deleted(event.path),
                    EventType::Session => {
                        if event.session_state.is_terminated() {
                            warn!(path = %root, state = ?event.session_state, "zookeeper session ended");
                            let _ = tx.send(ZkEvent::SessionLost).await;
                            break;
                        }
                        continue;
                    }
                };
                if tx.send(translated).await.is_err() {
                    break;
                }
            }
            debug!(path = %root, "zookeeper watch stopped");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_shallowest_first() {
        assert_eq!(ancestors("/biz/bar/app/config/db"), ["/biz", "/biz/bar", "/biz/bar/app", "/biz/bar/app/config"]);
        assert!(ancestors("/biz").is_empty());
    }
}
