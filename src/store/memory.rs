//! In-memory, versioned record store.
//!
//! [`MemoryStore`] backs tests and single-process hosts.  Besides the
//! [`RecordStore`] trait it exposes the provisioning-layer operations
//! (`create`, `delete`, `list`) and the spec-side validation the real
//! admission path would perform: extend-only resize, monotonic deletion
//! intent, immutable identity.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::LvcError;
use crate::store::RecordStore;
use crate::types::{Version, VolumeName, VolumeRecord};

/// Versioned in-memory record store with watch support.
///
/// All state lives in a [`DashMap`], so different keys can be touched from
/// different Tokio tasks concurrently; per-key atomicity comes from the
/// map's entry locking.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<VolumeName, (VolumeRecord, Version)>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<VolumeName>>>,
    /// One-shot injected failure for the next `update` call.  Test hook for
    /// crash-between-action-and-persist scenarios.
    fail_next_update: Mutex<Option<LvcError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a brand-new record, as the provisioning layer would.
    pub fn create(&self, record: VolumeRecord) -> Result<Version, LvcError> {
        if record.name.0.is_empty() {
            return Err(LvcError::Invalid("record name must not be empty".into()));
        }
        let name = record.name.clone();
        match self.records.entry(name.clone()) {
            Entry::Occupied(_) => Err(LvcError::Invalid(format!(
                "record {name} already exists"
            ))),
            Entry::Vacant(slot) => {
                slot.insert((record, Version::INITIAL));
                self.broadcast(&name);
                Ok(Version::INITIAL)
            }
        }
    }

    /// Remove a record outright, as the provisioning layer does once the
    /// finalizer is gone.  Refused while the finalizer is still present.
    pub fn delete(&self, name: &VolumeName) -> Result<(), LvcError> {
        let Some(entry) = self.records.get(name) else {
            return Err(LvcError::RecordNotFound(name.to_string()));
        };
        if entry.0.status.finalizer_present {
            return Err(LvcError::Invalid(format!(
                "record {name} still has its finalizer"
            )));
        }
        drop(entry);
        self.records.remove(name);
        self.broadcast(name);
        Ok(())
    }

    /// All record names currently stored.  Hosts use this to re-notify every
    /// key after a restart.
    pub fn list(&self) -> Vec<VolumeName> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    /// Mutate the spec of an existing record in place, as the provisioning
    /// layer would (e.g. grow the requested size or request deletion).
    /// Subject to the same validation as `update`.
    pub fn update_spec(
        &self,
        name: &VolumeName,
        f: impl FnOnce(&mut crate::types::VolumeSpec),
    ) -> Result<Version, LvcError> {
        let Some(entry) = self.records.get(name) else {
            return Err(LvcError::RecordNotFound(name.to_string()));
        };
        let (mut record, version) = entry.value().clone();
        drop(entry);
        f(&mut record.spec);
        self.update_inner(record, version)
    }

    /// Arrange for the next `update` call to fail with `err`.
    pub fn fail_next_update(&self, err: LvcError) {
        *self.fail_next_update.lock().unwrap() = Some(err);
    }

    fn broadcast(&self, name: &VolumeName) {
        let mut watchers = self.watchers.lock().unwrap();
        // Drop watchers whose receiver is gone.
        watchers.retain(|tx| tx.send(name.clone()).is_ok());
    }

    /// Synchronous core of `update`, shared with `update_spec`.
    fn update_inner(&self, record: VolumeRecord, expected: Version) -> Result<Version, LvcError> {
        if let Some(err) = self.fail_next_update.lock().unwrap().take() {
            return Err(err);
        }

        let name = record.name.clone();
        let Some(mut entry) = self.records.get_mut(&name) else {
            return Err(LvcError::RecordNotFound(name.to_string()));
        };

        let (stored, version) = &mut *entry;
        if *version != expected {
            debug!(volume = %name, stored = %version, presented = %expected, "update conflict");
            return Err(LvcError::Conflict(name.to_string()));
        }
        Self::validate(stored, &record)?;

        *stored = record;
        *version = version.next();
        let new_version = *version;
        drop(entry);

        self.broadcast(&name);
        Ok(new_version)
    }

    fn validate(old: &VolumeRecord, new: &VolumeRecord) -> Result<(), LvcError> {
        if new.node_name != old.node_name {
            return Err(LvcError::Invalid(format!(
                "node_name is immutable (was {}, got {})",
                old.node_name, new.node_name
            )));
        }
        if new.spec.requested_size_bytes < old.spec.requested_size_bytes {
            return Err(LvcError::Invalid(format!(
                "requested size may not shrink ({} -> {})",
                old.spec.requested_size_bytes, new.spec.requested_size_bytes
            )));
        }
        if old.spec.deletion_requested && !new.spec.deletion_requested {
            return Err(LvcError::Invalid(
                "deletion_requested may not be withdrawn".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, name: &VolumeName) -> Result<Option<(VolumeRecord, Version)>, LvcError> {
        Ok(self.records.get(name).map(|e| e.value().clone()))
    }

    async fn update(
        &self,
        record: VolumeRecord,
        expected: Version,
    ) -> Result<Version, LvcError> {
        self.update_inner(record, expected)
    }

    fn watch(&self) -> mpsc::UnboundedReceiver<VolumeName> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push(tx);
        rx
    }
}
