//! # liblvc — logical-volume reconciliation core
//!
//! `liblvc` keeps a declarative [`VolumeRecord`] synchronized with the real
//! on-disk state of a node-local logical volume across create, resize, and
//! delete, despite partial failures, restarts, and concurrent requests.  It
//! follows the RK8s architecture conventions (Tokio async runtime,
//! `tracing` for observability, `thiserror` for structured errors).
//!
//! It is a library: a host process wires [`RecordStore`] to a real
//! declarative-state backend and [`VolumeBackend`] to a real volume
//! manager, then runs the dispatcher workers over the store's watch stream.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: `VolumeRecord`, spec/status, `Phase`, versions. |
//! | [`error`] | [`LvcError`] enum covering all failure modes. |
//! | [`config`] | Backoff, timeout, and worker-pool tuning. |
//! | [`store`] | [`RecordStore`] trait + in-memory implementation. |
//! | [`backend`] | [`VolumeBackend`] trait + in-memory and sparse-file backends. |
//! | [`engine`] | [`ReconcileEngine`] — the reconcile state machine. |
//! | [`dispatcher`] | Per-key serialized work queue and worker pool. |
//!
//! ## Minimal wiring
//!
//! ```no_run
//! use std::sync::Arc;
//! use liblvc::{
//!     ControllerConfig, Dispatcher, MemoryStore, ReconcileEngine, RecordStore, SparseFileBackend,
//! };
//!
//! # async fn run() {
//! let store = Arc::new(MemoryStore::new());
//! let backend = Arc::new(SparseFileBackend::new("/var/lib/lvc/volumes"));
//! backend.recover().await.unwrap();
//!
//! let config = ControllerConfig::default();
//! let workers = config.workers;
//! let engine = Arc::new(ReconcileEngine::new(store.clone(), backend, config));
//!
//! let dispatcher = Dispatcher::new(engine);
//! dispatcher.spawn_drain(store.watch());
//! let handles = dispatcher.spawn_workers(workers);
//!
//! // Re-reconcile everything that survived a restart.
//! for name in store.list() {
//!     dispatcher.notify(name);
//! }
//! # let _ = handles;
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod store;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::{MemoryBackend, SparseFileBackend, VolumeBackend};
pub use config::ControllerConfig;
pub use dispatcher::{Dispatcher, Reconciler};
pub use engine::{Outcome, ReconcileEngine};
pub use error::LvcError;
pub use store::{MemoryStore, RecordStore};
pub use types::*;
