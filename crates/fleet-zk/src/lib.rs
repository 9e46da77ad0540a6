//! fleet-zk — mirrors legacy ZooKeeper route and config trees with the store,
//! in both directions.
//!
//! ```text
//!   /service/{name}/…            ─┐
//!   /biz/{group}/{app}/…         ─┴─◀─▶ PathMapper ◀─▶ {root}/{stage}/{kind}/{2|4}/…
//! ```
//!
//! One [`Mirror`] runs per environment under [`supervise`]; a restart storm
//! is fatal to the process.

pub mod error;
#[cfg(test)]
mod fake;
pub mod mirror;
pub mod path;
pub mod source;
pub mod supervisor;

pub use error::{ZkError, ZkResult};
pub use mirror::{Mirror, MirrorBase, sync_env};
pub use path::{MirrorPath, PathMapper, ZkKind};
pub use source::{ZkClientSource, ZkEvent, ZkSource};
pub use supervisor::{RestartBudget, supervise};
