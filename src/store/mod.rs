//! Record storage trait and implementations.
//!
//! [`RecordStore`] is the capability interface the engine uses to read and
//! persist [`VolumeRecord`]s.  A production host wires it to a real
//! declarative-state service; tests and single-process deployments use the
//! in-memory [`MemoryStore`].

pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LvcError;
use crate::types::{Version, VolumeName, VolumeRecord};

pub use memory::MemoryStore;

/// Typed CRUD + change notification over the declarative volume records.
///
/// The store exclusively owns the persisted record bytes.  Writers follow
/// optimistic concurrency: [`RecordStore::update`] succeeds only when the
/// presented version matches the stored one, so a stale writer loses and
/// must re-read.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a record and its current version.  `None` when the record does
    /// not exist (already deleted upstream).
    async fn get(&self, name: &VolumeName) -> Result<Option<(VolumeRecord, Version)>, LvcError>;

    /// Persist `record`, provided the stored version still equals
    /// `expected`.  Returns the new version on success and
    /// [`LvcError::Conflict`] when the record changed underneath the caller.
    async fn update(
        &self,
        record: VolumeRecord,
        expected: Version,
    ) -> Result<Version, LvcError>;

    /// Subscribe to change notifications.  Every mutation of any record
    /// produces at least one key on the stream; duplicates are allowed
    /// (at-least-once delivery).
    fn watch(&self) -> mpsc::UnboundedReceiver<VolumeName>;
}
