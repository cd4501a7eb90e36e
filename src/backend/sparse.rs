//! Sparse-file volume backend.
//!
//! [`SparseFileBackend`] implements [`VolumeBackend`] with one sparse file
//! per volume under a configurable root directory.  It stands in for a real
//! LVM daemon on single-node hosts and in integration tests that want
//! durable state across restarts.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/
//!   <volume-name>.img        # sparse data file, length == volume size
//!   <volume-name>.meta.json  # persisted metadata (used for recovery)
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::backend::VolumeBackend;
use crate::error::LvcError;
use crate::types::VolumeName;

/// Metadata sidecar persisted next to each volume's data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VolumeMeta {
    name: VolumeName,
    size_bytes: u64,
}

/// File-backed volume manager rooted at a single directory.
///
/// Mutable state is a concurrent map of known volumes, so different volumes
/// can be operated on from different Tokio tasks at once.
pub struct SparseFileBackend {
    root: PathBuf,
    volumes: DashMap<VolumeName, u64>,
}

impl SparseFileBackend {
    /// Create a new backend rooted at `root`.  Call [`Self::recover`]
    /// afterwards to restore state from a previous process run.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            volumes: DashMap::new(),
        }
    }

    fn data_path(&self, name: &VolumeName) -> PathBuf {
        self.root.join(format!("{}.img", name.0))
    }

    fn meta_path(&self, name: &VolumeName) -> PathBuf {
        self.root.join(format!("{}.meta.json", name.0))
    }

    /// Volume names must be usable as file names under the root.
    fn check_name(name: &VolumeName) -> Result<(), LvcError> {
        if name.0.is_empty() || name.0.contains('/') || name.0.starts_with('.') {
            return Err(LvcError::Invalid(format!("invalid volume name {name:?}")));
        }
        Ok(())
    }

    /// Scan the root directory for metadata sidecars and rebuild the
    /// in-memory volume map.
    ///
    /// Best-effort: sidecars that fail to parse or whose data file is
    /// missing are skipped with a warning rather than treated as hard
    /// errors.
    pub async fn recover(&self) -> Result<(), LvcError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            // Nothing to recover if the root does not exist yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(LvcError::Unavailable(format!(
                    "read_dir {}: {e}",
                    self.root.display()
                )));
            }
        };

        while let Some(entry) = dir.next_entry().await.map_err(LvcError::unavailable)? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".meta.json") {
                continue;
            }

            let json = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read volume metadata, skipping");
                    continue;
                }
            };
            let meta: VolumeMeta = match serde_json::from_str(&json) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse volume metadata, skipping");
                    continue;
                }
            };

            // The data file length is authoritative for the size: a resize
            // may have landed without the sidecar being rewritten.
            let size = match tokio::fs::metadata(self.data_path(&meta.name)).await {
                Ok(m) => m.len(),
                Err(_) => {
                    warn!(volume = %meta.name, "data file missing, skipping recovery");
                    continue;
                }
            };
            self.volumes.insert(meta.name, size);
        }

        info!(
            root = %self.root.display(),
            count = self.volumes.len(),
            "recovery complete",
        );
        Ok(())
    }

    async fn write_meta(&self, name: &VolumeName, size_bytes: u64) -> Result<(), LvcError> {
        let meta = VolumeMeta {
            name: name.clone(),
            size_bytes,
        };
        let json = serde_json::to_string_pretty(&meta).map_err(LvcError::internal)?;
        tokio::fs::write(self.meta_path(name), json)
            .await
            .map_err(|e| LvcError::Unavailable(format!("write meta {name}: {e}")))
    }
}

#[async_trait]
impl VolumeBackend for SparseFileBackend {
    async fn exists(&self, name: &VolumeName) -> Result<bool, LvcError> {
        if self.volumes.contains_key(name) {
            return Ok(true);
        }
        // Fall back to disk so a volume created by a previous run (or a
        // crashed pass) is still visible without an explicit recover().
        Ok(tokio::fs::metadata(self.data_path(name)).await.is_ok())
    }

    async fn current_size(&self, name: &VolumeName) -> Result<u64, LvcError> {
        match tokio::fs::metadata(self.data_path(name)).await {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LvcError::VolumeNotFound(name.to_string()))
            }
            Err(e) => Err(LvcError::unavailable(e)),
        }
    }

    #[instrument(skip(self), fields(volume = %name))]
    async fn create(&self, name: &VolumeName, size_bytes: u64) -> Result<(), LvcError> {
        Self::check_name(name)?;
        if size_bytes == 0 {
            return Err(LvcError::Invalid(format!(
                "volume {name}: size must be non-zero"
            )));
        }
        if self.exists(name).await? {
            return Err(LvcError::Invalid(format!("volume {name} already exists")));
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(LvcError::unavailable)?;

        let file = tokio::fs::File::create(self.data_path(name))
            .await
            .map_err(LvcError::unavailable)?;
        file.set_len(size_bytes)
            .await
            .map_err(LvcError::unavailable)?;

        // Data file lands before the sidecar; a crash in between leaves a
        // volume that `exists` still reports, which the reconcile loop
        // adopts on its next pass.
        self.write_meta(name, size_bytes).await?;
        self.volumes.insert(name.clone(), size_bytes);

        info!(size_bytes, "volume created");
        Ok(())
    }

    #[instrument(skip(self), fields(volume = %name))]
    async fn resize(&self, name: &VolumeName, size_bytes: u64) -> Result<(), LvcError> {
        let current = self.current_size(name).await?;
        if size_bytes < current {
            return Err(LvcError::Invalid(format!(
                "volume {name}: cannot shrink {current} -> {size_bytes}"
            )));
        }
        if size_bytes == current {
            debug!("resize is a no-op");
            return Ok(());
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.data_path(name))
            .await
            .map_err(LvcError::unavailable)?;
        file.set_len(size_bytes)
            .await
            .map_err(LvcError::unavailable)?;

        self.write_meta(name, size_bytes).await?;
        self.volumes.insert(name.clone(), size_bytes);

        info!(from = current, to = size_bytes, "volume resized");
        Ok(())
    }

    #[instrument(skip(self), fields(volume = %name))]
    async fn remove(&self, name: &VolumeName) -> Result<(), LvcError> {
        let data = self.data_path(name);
        match tokio::fs::remove_file(&data).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.volumes.remove(name);
                return Err(LvcError::VolumeNotFound(name.to_string()));
            }
            Err(e) => return Err(LvcError::unavailable(e)),
        }

        // Data goes first, then metadata: a crash in between leaves a
        // sidecar whose data file is missing, which recovery skips.
        if let Err(e) = tokio::fs::remove_file(self.meta_path(name)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            return Err(LvcError::unavailable(e));
        }

        self.volumes.remove(name);
        info!("volume removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_resize_remove_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = SparseFileBackend::new(tmp.path());
        let name: VolumeName = "vol-a".into();

        backend.create(&name, 1 << 20).await.unwrap();
        assert!(backend.exists(&name).await.unwrap());
        assert_eq!(backend.current_size(&name).await.unwrap(), 1 << 20);
        assert!(tmp.path().join("vol-a.img").exists());
        assert!(tmp.path().join("vol-a.meta.json").exists());

        backend.resize(&name, 2 << 20).await.unwrap();
        assert_eq!(backend.current_size(&name).await.unwrap(), 2 << 20);

        backend.remove(&name).await.unwrap();
        assert!(!backend.exists(&name).await.unwrap());
        assert!(!tmp.path().join("vol-a.meta.json").exists());
    }

    #[tokio::test]
    async fn shrink_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = SparseFileBackend::new(tmp.path());
        let name: VolumeName = "vol-a".into();

        backend.create(&name, 4096).await.unwrap();
        assert!(matches!(
            backend.resize(&name, 1024).await,
            Err(LvcError::Invalid(_))
        ));
        assert_eq!(backend.current_size(&name).await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn recover_restores_state() {
        let tmp = tempfile::tempdir().unwrap();
        let name: VolumeName = "persistent-vol".into();
        {
            let backend = SparseFileBackend::new(tmp.path());
            backend.create(&name, 8192).await.unwrap();
        }

        let backend2 = SparseFileBackend::new(tmp.path());
        backend2.recover().await.unwrap();
        assert!(backend2.exists(&name).await.unwrap());
        assert_eq!(backend2.current_size(&name).await.unwrap(), 8192);
    }

    #[tokio::test]
    async fn recover_skips_orphaned_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        // Sidecar without a data file, as left by a crash mid-remove.
        tokio::fs::write(
            tmp.path().join("ghost.meta.json"),
            r#"{"name":"ghost","size_bytes":1024}"#,
        )
        .await
        .unwrap();

        let backend = SparseFileBackend::new(tmp.path());
        backend.recover().await.unwrap();
        assert!(!backend.exists(&"ghost".into()).await.unwrap());
    }

    #[tokio::test]
    async fn remove_missing_reports_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = SparseFileBackend::new(tmp.path());
        assert!(matches!(
            backend.remove(&"ghost".into()).await,
            Err(LvcError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn bad_names_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = SparseFileBackend::new(tmp.path());
        for bad in ["", "../escape", ".hidden"] {
            assert!(matches!(
                backend.create(&bad.into(), 1024).await,
                Err(LvcError::Invalid(_))
            ));
        }
    }
}
