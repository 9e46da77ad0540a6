//! Typed watches.
//!
//! A watch first lists the current snapshot and emits it as `Added`, then
//! resumes the backend watch at the snapshot revision + 1 so no mutation is
//! lost or seen twice. Live puts go through the filter-transform rule:
//!
//! | prior passes | current passes | emitted    |
//! |--------------|----------------|------------|
//! | yes          | yes            | `Modified` |
//! | no / absent  | yes            | `Added`    |
//! | yes          | no             | `Deleted`  |
//!
//! A value that does not decode as `T` is logged and skipped; consumers keep
//! whatever they last saw for that key.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::backend::{KvBackend, RawEvent, RawEventKind};
use crate::codec::Codec;
use crate::error::{StoreError, StoreResult};
use crate::predicate::Predicate;
use crate::store::decode_listed;

/// Outbound buffer of a typed watch.
pub const WATCH_CHANNEL_SIZE: usize = 100;

#[derive(Debug)]
pub enum WatchEvent<T> {
    Added { key: String, object: T },
    Modified { key: String, object: T },
    /// The prior object when the backend reported it.
    Deleted { key: String, object: Option<T> },
    /// Terminal: the stream ends after this and the consumer must resync.
    Error(StoreError),
}

impl<T> WatchEvent<T> {
    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Added { key, .. }
            | WatchEvent::Modified { key, .. }
            | WatchEvent::Deleted { key, .. } => Some(key),
            WatchEvent::Error(_) => None,
        }
    }
}

/// Receiving end of a typed watch. Dropping it stops the watch.
pub struct WatchStream<T> {
    rx: mpsc::Receiver<WatchEvent<T>>,
    _guard: DropGuard,
}

impl<T> WatchStream<T> {
    /// Next event, `None` once the watch has stopped.
    pub async fn recv(&mut self) -> Option<WatchEvent<T>> {
        self.rx.recv().await
    }
}

struct Scope {
    /// Absolute key or prefix being watched.
    target: String,
    /// Stripped from absolute keys before they are reported.
    base: String,
    recursive: bool,
}

impl Scope {
    fn covers(&self, key: &str) -> bool {
        if self.recursive {
            key.starts_with(&self.target)
        } else {
            key == self.target
        }
    }

    fn relative(&self, key: &str) -> String {
        key.strip_prefix(&self.base).unwrap_or(key).to_string()
    }
}

pub(crate) async fn start<T: Codec>(
    backend: Arc<dyn KvBackend>,
    target: String,
    base: String,
    recursive: bool,
    predicate: Predicate<T>,
    cancel: &CancellationToken,
) -> StoreResult<WatchStream<T>> {
    let scope = Scope {
        target,
        base,
        recursive,
    };
    let (snapshot, revision) = backend.range(&scope.target).await?;
    let mut raw = backend.watch(&scope.target, revision + 1).await?;

    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
    let token = cancel.child_token();
    let guard = token.clone().drop_guard();

    tokio::spawn(async move {
        debug!(target = %scope.target, revision, "watch started");
        for kv in snapshot.into_iter().filter(|kv| scope.covers(&kv.key)) {
            let Some(object) = decode_listed::<T>(&kv) else {
                continue;
            };
            if !predicate.matches(&object) {
                continue;
            }
            let event = WatchEvent::Added {
                key: scope.relative(&kv.key),
                object,
            };
            if !deliver(&tx, &token, &scope.target, event).await {
                return;
            }
        }

        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => break,
                batch = raw.recv() => batch,
            };
            let events = match batch {
                Some(Ok(events)) => events,
                Some(Err(e)) => {
                    warn!(target = %scope.target, error = %e, "watch failed");
                    deliver(&tx, &token, &scope.target, WatchEvent::Error(e)).await;
                    break;
                }
                None => {
                    let closed = StoreError::Unreachable("backend watch closed".into());
                    deliver(&tx, &token, &scope.target, WatchEvent::Error(closed)).await;
                    break;
                }
            };
            for event in events.iter().filter(|e| scope.covers(&e.kv.key)) {
                let Some(translated) = translate(event, &predicate, scope.relative(&event.kv.key)) else {
                    continue;
                };
                if !deliver(&tx, &token, &scope.target, translated).await {
                    return;
                }
            }
        }
        debug!(target = %scope.target, "watch stopped");
    });

    Ok(WatchStream { rx, _guard: guard })
}

fn translate<T: Codec>(
    event: &RawEvent,
    predicate: &Predicate<T>,
    key: String,
) -> Option<WatchEvent<T>> {
    let prev = event.prev.as_ref().and_then(|kv| T::decode(&kv.value).ok());

    match event.kind {
        RawEventKind::Put => {
            let current = decode_listed::<T>(&event.kv)?;
            let now = predicate.matches(&current);
            let before = prev.as_ref().map(|p| predicate.matches(p));
            match (before, now) {
                (Some(true), true) => Some(WatchEvent::Modified {
                    key,
                    object: current,
                }),
                (_, true) => Some(WatchEvent::Added {
                    key,
                    object: current,
                }),
                (Some(true), false) => Some(WatchEvent::Deleted { key, object: prev }),
                _ => None,
            }
        }
        RawEventKind::Delete => match prev {
            Some(p) if predicate.matches(&p) => Some(WatchEvent::Deleted {
                key,
                object: Some(p),
            }),
            Some(_) => None,
            None if predicate.is_everything() => Some(WatchEvent::Deleted { key, object: None }),
            None => None,
        },
    }
}

/// Send with backpressure: a full buffer is logged, then waited on, which in
/// turn stops draining the backend stream.
async fn deliver<T>(
    tx: &mpsc::Sender<WatchEvent<T>>,
    token: &CancellationToken,
    target: &str,
    event: WatchEvent<T>,
) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Closed(_)) => false,
        Err(TrySendError::Full(event)) => {
            warn!(%target, "watch consumer is slow, blocking");
            tokio::select! {
                _ = token.cancelled() => false,
                sent = tx.send(event) => sent.is_ok(),
            }
        }
    }
}
