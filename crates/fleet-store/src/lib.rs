//! fleet-store — typed key-value store for the fleet control plane.
//!
//! # Architecture
//!
//! ```text
//!   Store (typed, prefixed)  ──▶  dyn KvBackend
//!        │ Codec (JSON / raw bytes)      ├── EmbeddedBackend (redb, in-memory or file)
//!        │ Predicate (label/field)       └── EtcdBackend     (etcd v3)
//!        ▼
//!   WatchStream<T>: initial Added snapshot, then live Added/Modified/Deleted
//! ```
//!
//! Every backend exposes revisions, leases and prefix watches that can be
//! resumed from a revision, which is all the typed layer needs to offer
//! list-then-watch without gaps.

pub mod backend;
pub mod codec;
pub mod compactor;
pub mod embedded;
pub mod error;
pub mod etcd;
pub mod predicate;
pub mod store;
pub mod watch;

pub use backend::{KeyValue, KvBackend, RawEvent, RawEventKind, RawWatchStream};
pub use codec::Codec;
pub use compactor::run_compactor;
pub use embedded::EmbeddedBackend;
pub use error::{ErrorKind, StoreError, StoreResult};
pub use etcd::EtcdBackend;
pub use predicate::{Attrs, Predicate};
pub use store::Store;
pub use watch::{WatchEvent, WatchStream};

#[doc(hidden)]
pub use serde_json as __serde_json;
