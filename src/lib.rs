//! `lls`: the Local Location Store, a per-node coordinator that tracks
//! which machines in a cluster hold which pieces of content for a
//! distributed content-addressable cache.
//!
//! This crate never stores content bytes. It answers "who has this
//! hash" (`LocalLocationStore::get_bulk`), records that this machine
//! now has (or no longer has, or recently used) a hash
//! (`register_local_location` / `trim_bulk` / `touch_bulk`), and keeps
//! its local view of the cluster-wide index converging with the
//! authoritative global store through a heartbeat-driven role state
//! machine, periodic checkpoints, and reconciliation against the local
//! content store it fronts.
//!
//! See `lls` for the core coordinator and its startup/shutdown
//! lifecycle; the other modules are the leaf components it composes.

pub mod bitset;
pub mod central_storage;
pub mod checkpoint;
pub mod cluster_state;
pub mod config;
pub mod content_db;
pub mod error;
pub mod event_store;
pub mod eviction;
pub mod global_store;
pub mod hash;
pub mod lls;
pub mod local_store;
pub mod machine;
pub mod machine_list;
pub mod reputation;
pub mod telemetry;
pub mod volatile;

pub use config::LlsConfig;
pub use error::{Error, ErrorKind, Result};
pub use lls::{LocalLocationStore, Origin, ResolvedLocation};
