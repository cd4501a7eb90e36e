//! Volume backend trait and implementations.
//!
//! [`VolumeBackend`] abstracts the node-local volume manager (an LVM-style
//! block allocator in production).  The engine only ever talks to this
//! trait, so tests run against [`MemoryBackend`] and single-node hosts can
//! use [`SparseFileBackend`] without a real volume manager.

pub mod memory;
pub mod sparse;

use async_trait::async_trait;

use crate::error::LvcError;
use crate::types::VolumeName;

pub use memory::MemoryBackend;
pub use sparse::SparseFileBackend;

/// Node-local physical volume operations.
///
/// Implementations must be safe for concurrent calls on *different* volume
/// names; the dispatcher guarantees calls for the same name are serialized.
/// Every operation is idempotent from the engine's point of view: the
/// engine probes before mutating and treats "already absent" on remove as
/// success.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Whether a volume with this name exists on the node.
    async fn exists(&self, name: &VolumeName) -> Result<bool, LvcError>;

    /// Current size of an existing volume in bytes.
    /// Returns [`LvcError::VolumeNotFound`] when the volume is absent.
    async fn current_size(&self, name: &VolumeName) -> Result<u64, LvcError>;

    /// Create the volume at the given size.
    async fn create(&self, name: &VolumeName, size_bytes: u64) -> Result<(), LvcError>;

    /// Grow the volume to the given size.  Never shrinks: implementations
    /// must reject a target smaller than the current size.
    async fn resize(&self, name: &VolumeName, size_bytes: u64) -> Result<(), LvcError>;

    /// Remove the volume.  Returns [`LvcError::VolumeNotFound`] when it is
    /// already gone; callers treat that as success.
    async fn remove(&self, name: &VolumeName) -> Result<(), LvcError>;
}
