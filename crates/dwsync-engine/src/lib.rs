//! DWSync engine library
//!
//! The synchronization engine: streams rows out of relational sources and
//! loads them into a ClickHouse-style columnar store under a memory budget,
//! with per-dataset locking, worker liveness reporting, and post-load
//! type/consistency validation.
//!
//! # Architecture
//!
//! - [`job`] / [`status`]: the unit of work, its structural validation, and
//!   the persisted lifecycle history external dashboards read.
//! - [`dataset`]: read-only view of the dataset catalog (column mappings,
//!   source and target table names).
//! - [`source`] / [`target`]: the extraction side (Postgres/MySQL streaming
//!   cursors) and the load side (ClickHouse over HTTP).
//! - [`typemap`]: source-to-target type reconciliation and pre-flight schema
//!   validation.
//! - [`validate`]: post-load row-count reconciliation and duplicate merging.
//! - [`kv`] / [`lock`] / [`liveness`]: the shared key-value store behind the
//!   per-dataset lock and the worker heartbeat.
//! - [`memory`]: process memory budget checks consulted between batches.
//! - [`pipeline`]: the orchestrator tying all of the above together.

pub mod config;
pub mod dataset;
pub mod job;
pub mod kv;
pub mod liveness;
pub mod lock;
pub mod memory;
pub mod pipeline;
pub mod source;
pub mod status;
pub mod target;
pub mod typemap;
pub mod validate;

pub use config::EngineConfig;
pub use pipeline::{SyncOutcome, SyncPipeline};
