//! etcd v3 backend.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{KeyValue, KvBackend, RawEvent, RawEventKind, RawWatchStream};
use crate::error::{StoreError, StoreResult};

const WATCH_BUFFER: usize = 100;

fn map_etcd(err: etcd_client::Error) -> StoreError {
    use etcd_client::Error as E;
    match err {
        E::TransportError(e) => StoreError::Unreachable(e.to_string()),
        E::IoError(e) => StoreError::Unreachable(e.to_string()),
        E::GRpcStatus(status) => match status.code() {
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
                StoreError::Unreachable(status.message().to_string())
            }
            tonic::Code::OutOfRange => StoreError::Compacted(0),
            _ => StoreError::Unknown(status.message().to_string()),
        },
        other => StoreError::Unknown(other.to_string()),
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> StoreResult<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| StoreError::Deserialize(e.to_string()))?
        .to_string();
    Ok(KeyValue {
        key,
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    })
}

fn convert_events(resp: &etcd_client::WatchResponse) -> StoreResult<Vec<RawEvent>> {
    let mut batch = Vec::with_capacity(resp.events().len());
    for event in resp.events() {
        let Some(kv) = event.kv() else { continue };
        batch.push(RawEvent {
            kind: match event.event_type() {
                EventType::Put => RawEventKind::Put,
                EventType::Delete => RawEventKind::Delete,
            },
            kv: convert_kv(kv)?,
            prev: event.prev_kv().map(convert_kv).transpose()?,
        });
    }
    Ok(batch)
}

fn put_options(lease: i64) -> PutOptions {
    let opts = PutOptions::new();
    if lease != 0 { opts.with_lease(lease) } else { opts }
}

/// [`KvBackend`] over an etcd cluster.
#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
}

impl EtcdBackend {
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let client = Client::connect(endpoints, None).await.map_err(map_etcd)?;
        debug!(?endpoints, "connected to etcd");
        Ok(Self { client })
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let resp = self
            .client
            .kv_client()
            .get(key, None)
            .await
            .map_err(map_etcd)?;
        resp.kvs().first().map(convert_kv).transpose()
    }

    async fn range(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, i64)> {
        let resp = self
            .client
            .kv_client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_etcd)?;
        let rev = resp.header().map_or(0, |h| h.revision());
        let kvs = resp.kvs().iter().map(convert_kv).collect::<StoreResult<_>>()?;
        Ok((kvs, rev))
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease: i64) -> StoreResult<()> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, Some(put_options(lease)))]);
        let resp = self.client.kv_client().txn(txn).await.map_err(map_etcd)?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(StoreError::Exists(key.to_string()))
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: i64) -> StoreResult<Option<KeyValue>> {
        let resp = self
            .client
            .kv_client()
            .put(key, value, Some(put_options(lease).with_prev_key()))
            .await
            .map_err(map_etcd)?;
        resp.prev_key().map(convert_kv).transpose()
    }

    async fn delete(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let resp = self
            .client
            .kv_client()
            .delete(key, Some(DeleteOptions::new().with_prev_key()))
            .await
            .map_err(map_etcd)?;
        resp.prev_kvs().first().map(convert_kv).transpose()
    }

    async fn grant_lease(&self, ttl: i64) -> StoreResult<i64> {
        let resp = self
            .client
            .lease_client()
            .grant(ttl.max(1), None)
            .await
            .map_err(map_etcd)?;
        Ok(resp.id())
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> StoreResult<RawWatchStream> {
        let mut opts = WatchOptions::new().with_prefix().with_prev_key();
        if start_revision > 0 {
            opts = opts.with_start_revision(start_revision);
        }
        let (mut watcher, mut stream) = self
            .client
            .watch_client()
            .watch(prefix, Some(opts))
            .await
            .map_err(map_etcd)?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    m = stream.message() => m,
                };
                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        debug!(%prefix, "etcd watch stream ended");
                        let closed = StoreError::Unreachable("watch stream closed".into());
                        let _ = tx.send(Err(closed)).await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(map_etcd(e))).await;
                        break;
                    }
                };
                if resp.compact_revision() > 0 {
                    let compacted = StoreError::Compacted(resp.compact_revision());
                    let _ = tx.send(Err(compacted)).await;
                    break;
                }
                if resp.canceled() {
                    warn!(%prefix, reason = resp.cancel_reason(), "etcd watch canceled");
                    let reason = StoreError::Unknown(resp.cancel_reason().to_string());
                    let _ = tx.send(Err(reason)).await;
                    break;
                }

                let batch = match convert_events(&resp) {
                    Ok(batch) => batch,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                if !batch.is_empty() && tx.send(Ok(batch)).await.is_err() {
                    break;
                }
            }
            let _ = watcher.cancel().await;
        });
        Ok(rx)
    }

    async fn compact(&self, revision: i64) -> StoreResult<()> {
        self.client
            .kv_client()
            .compact(revision, None)
            .await
            .map_err(map_etcd)?;
        Ok(())
    }

    async fn current_revision(&self) -> StoreResult<i64> {
        let resp = self
            .client
            .kv_client()
            .get("\0", None)
            .await
            .map_err(map_etcd)?;
        Ok(resp.header().map_or(0, |h| h.revision()))
    }
}
