//! Core data model: the declarative [`VolumeRecord`] and its parts.
//!
//! A `VolumeRecord` carries both the desired state written by the
//! provisioning layer (`spec`) and the observed state written back by the
//! reconcile engine (`status`).  All types are [`Serialize`]/[`Deserialize`]
//! so records can be persisted or shipped to a real declarative-state
//! service unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Unique, immutable name of a logical volume.  Doubles as the reconcile
/// queue key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeName(pub String);

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Record version (optimistic concurrency)
// ---------------------------------------------------------------------------

/// Monotonic per-record version used for optimistic-concurrency updates.
///
/// An update succeeds only when the caller presents the version it last
/// read; the store bumps the version on every successful write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(pub u64);

impl Version {
    /// The version assigned to a freshly created record.
    pub const INITIAL: Version = Version(1);

    /// The version a successful update moves the record to.
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Spec & status
// ---------------------------------------------------------------------------

/// Desired state, owned by the provisioning layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Requested capacity in bytes.  May only grow across versions of the
    /// same record; a shrink is rejected at the store boundary.
    pub requested_size_bytes: u64,
    /// Set once by the provisioning layer when the volume should go away.
    /// Monotonic: never flips back to `false`.
    #[serde(default)]
    pub deletion_requested: bool,
}

/// Lifecycle phase of a volume as last observed by the engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    /// Record exists but the volume has not been confirmed on disk yet.
    #[default]
    Pending,
    /// The physical volume exists and satisfies the requested size.
    Provisioned,
    /// The last reconcile pass hit an error; see `last_error`.
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Provisioned => "Provisioned",
            Phase::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Observed state, owned by the reconcile engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStatus {
    /// Current lifecycle phase.
    #[serde(default)]
    pub phase: Phase,
    /// Size reported by the backend.  Only trustworthy when
    /// `phase == Provisioned`.
    #[serde(default)]
    pub actual_size_bytes: u64,
    /// Message from the most recent failed pass, cleared on success.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Gate for physical deletion: must be `true` before any physical
    /// create, cleared only after removal is confirmed.  While present,
    /// the provisioning layer must not delete the record outright.
    #[serde(default)]
    pub finalizer_present: bool,
}

// ---------------------------------------------------------------------------
// The declarative record
// ---------------------------------------------------------------------------

/// One logical volume as the provisioning layer and engine see it.
///
/// `name` and `node_name` are immutable after creation.  The engine mutates
/// only `status` (and never deletes the record); the provisioning layer
/// mutates only `spec`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRecord {
    /// Unique volume name.
    pub name: VolumeName,
    /// Node this volume is bound to.
    pub node_name: String,
    /// Desired state.
    pub spec: VolumeSpec,
    /// Observed state.
    #[serde(default)]
    pub status: VolumeStatus,
}

impl VolumeRecord {
    /// Build a fresh record as the provisioning layer would: Pending phase,
    /// no finalizer, no deletion intent.
    pub fn new(name: impl Into<VolumeName>, node_name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            node_name: node_name.into(),
            spec: VolumeSpec {
                requested_size_bytes: size_bytes,
                deletion_requested: false,
            },
            status: VolumeStatus::default(),
        }
    }
}
