//! In-memory fake volume backend.
//!
//! [`MemoryBackend`] records every call and supports one-shot fault
//! injection, which is what the engine and dispatcher tests are built on.
//! It enforces the same contract a real volume manager would: no duplicate
//! create, no shrink, remove of a missing volume reports
//! [`LvcError::VolumeNotFound`].

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::backend::VolumeBackend;
use crate::error::LvcError;
use crate::types::VolumeName;

/// Which backend operation a fault should hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    Exists,
    CurrentSize,
    Create,
    Resize,
    Remove,
}

/// Fake backend over a map of name to size.
#[derive(Default)]
pub struct MemoryBackend {
    volumes: DashMap<VolumeName, u64>,
    faults: Mutex<Vec<(BackendOp, LvcError)>>,
    create_calls: AtomicU64,
    resize_calls: AtomicU64,
    remove_calls: AtomicU64,
    probe_calls: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next call of `op` to fail with `err`.  Queued faults
    /// for the same operation fire in order, one per call.
    pub fn fail_next(&self, op: BackendOp, err: LvcError) {
        self.faults.lock().unwrap().push((op, err));
    }

    /// Number of `create` calls observed so far.
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `resize` calls observed so far.
    pub fn resize_calls(&self) -> u64 {
        self.resize_calls.load(Ordering::SeqCst)
    }

    /// Number of `remove` calls observed so far.
    pub fn remove_calls(&self) -> u64 {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Number of `exists` / `current_size` probes observed so far.
    pub fn probe_calls(&self) -> u64 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Directly seed a volume, bypassing `create` and its counters.  Used to
    /// model a volume that exists on disk but was never recorded in status
    /// (crash after create).
    pub fn seed(&self, name: impl Into<VolumeName>, size_bytes: u64) {
        self.volumes.insert(name.into(), size_bytes);
    }

    /// Size of a volume, if present.  Test inspection helper.
    pub fn size_of(&self, name: &VolumeName) -> Option<u64> {
        self.volumes.get(name).map(|e| *e.value())
    }

    fn take_fault(&self, op: BackendOp) -> Option<LvcError> {
        let mut faults = self.faults.lock().unwrap();
        let idx = faults.iter().position(|(o, _)| *o == op)?;
        Some(faults.remove(idx).1)
    }
}

#[async_trait]
impl VolumeBackend for MemoryBackend {
    async fn exists(&self, name: &VolumeName) -> Result<bool, LvcError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_fault(BackendOp::Exists) {
            return Err(err);
        }
        Ok(self.volumes.contains_key(name))
    }

    async fn current_size(&self, name: &VolumeName) -> Result<u64, LvcError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_fault(BackendOp::CurrentSize) {
            return Err(err);
        }
        self.volumes
            .get(name)
            .map(|e| *e.value())
            .ok_or_else(|| LvcError::VolumeNotFound(name.to_string()))
    }

    async fn create(&self, name: &VolumeName, size_bytes: u64) -> Result<(), LvcError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_fault(BackendOp::Create) {
            return Err(err);
        }
        if size_bytes == 0 {
            return Err(LvcError::Invalid(format!(
                "volume {name}: size must be non-zero"
            )));
        }
        match self.volumes.entry(name.clone()) {
            Entry::Occupied(_) => Err(LvcError::Invalid(format!(
                "volume {name} already exists"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(size_bytes);
                Ok(())
            }
        }
    }

    async fn resize(&self, name: &VolumeName, size_bytes: u64) -> Result<(), LvcError> {
        self.resize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_fault(BackendOp::Resize) {
            return Err(err);
        }
        let Some(mut entry) = self.volumes.get_mut(name) else {
            return Err(LvcError::VolumeNotFound(name.to_string()));
        };
        if size_bytes < *entry {
            return Err(LvcError::Invalid(format!(
                "volume {name}: cannot shrink {} -> {size_bytes}",
                *entry
            )));
        }
        *entry = size_bytes;
        Ok(())
    }

    async fn remove(&self, name: &VolumeName) -> Result<(), LvcError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_fault(BackendOp::Remove) {
            return Err(err);
        }
        if self.volumes.remove(name).is_none() {
            return Err(LvcError::VolumeNotFound(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_resize_remove() {
        let backend = MemoryBackend::new();
        let name: VolumeName = "vol-a".into();

        backend.create(&name, 1024).await.unwrap();
        assert!(backend.exists(&name).await.unwrap());
        assert_eq!(backend.current_size(&name).await.unwrap(), 1024);

        backend.resize(&name, 4096).await.unwrap();
        assert_eq!(backend.current_size(&name).await.unwrap(), 4096);

        backend.remove(&name).await.unwrap();
        assert!(!backend.exists(&name).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let backend = MemoryBackend::new();
        let name: VolumeName = "vol-a".into();
        backend.create(&name, 1024).await.unwrap();
        assert!(matches!(
            backend.create(&name, 1024).await,
            Err(LvcError::Invalid(_))
        ));
        assert_eq!(backend.create_calls(), 2);
    }

    #[tokio::test]
    async fn shrink_rejected() {
        let backend = MemoryBackend::new();
        let name: VolumeName = "vol-a".into();
        backend.create(&name, 4096).await.unwrap();
        assert!(matches!(
            backend.resize(&name, 1024).await,
            Err(LvcError::Invalid(_))
        ));
        assert_eq!(backend.current_size(&name).await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn remove_missing_reports_not_found() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.remove(&"ghost".into()).await,
            Err(LvcError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let backend = MemoryBackend::new();
        let name: VolumeName = "vol-a".into();
        backend.fail_next(BackendOp::Create, LvcError::Unavailable("vg busy".into()));

        assert!(matches!(
            backend.create(&name, 1024).await,
            Err(LvcError::Unavailable(_))
        ));
        backend.create(&name, 1024).await.unwrap();
        assert!(backend.exists(&name).await.unwrap());
    }
}
