//! Mirror Kubernetes resources into a local indexed cache.
//!
//! The cache is kept convergent with the cluster by one watcher task per
//! resource kind running the classic list+watch cycle: a full list
//! establishes a baseline and a resume token, a watch stream applies
//! incremental events, and any stream failure restarts the whole cycle.
//! Readers query the cache by index and key prefix while the watchers run.

pub mod error;
pub mod k8s;
pub mod mirror;

pub use error::{Error, Result};
