//! The reconcile state machine.
//!
//! [`ReconcileEngine`] drives one [`VolumeRecord`](crate::types::VolumeRecord)
//! toward its desired state per pass: it re-reads the record, probes the
//! backend, applies at most the minimal corrective action, and persists the
//! observed status.  Side effects are strictly ordered so that a crash can
//! only leave a physical action whose status was never recorded (repaired by
//! adoption on the next pass), never a recorded status for an action that
//! never happened.
//!
//! Every store and backend failure is caught here and converted into an
//! [`Outcome`]; nothing unwinds past the dispatcher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::VolumeBackend;
use crate::config::ControllerConfig;
use crate::dispatcher::Reconciler;
use crate::error::LvcError;
use crate::store::RecordStore;
use crate::types::{Phase, Version, VolumeName, VolumeRecord};

/// Result of one reconcile pass, consumed by the dispatcher.
#[derive(Debug)]
pub enum Outcome {
    /// Desired and observed state agree; wait for the next notification.
    Done,
    /// State moved but another pass is needed right away (e.g. finalizer
    /// registration, or a lost optimistic-concurrency race).
    RequeueImmediately,
    /// The pass failed; retry after the given delay.
    RequeueAfter(Duration),
    /// A programming invariant is violated.  The dispatcher stops
    /// scheduling this key; the process keeps running.
    Fatal(LvcError),
}

/// The reconciliation core.
///
/// One engine instance serves all volumes; per-volume serialization is the
/// dispatcher's job, so the engine itself only keeps per-key retry counters.
pub struct ReconcileEngine {
    store: Arc<dyn RecordStore>,
    backend: Arc<dyn VolumeBackend>,
    config: ControllerConfig,
    /// Consecutive failed passes per volume.  Cleared on any successful
    /// pass; drives the exponential backoff.
    failures: DashMap<VolumeName, u32>,
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        backend: Arc<dyn VolumeBackend>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            backend,
            config,
            failures: DashMap::new(),
        }
    }

    /// Run one reconcile pass for `name`.
    ///
    /// Never returns an error: failures are classified, written into the
    /// record's status where appropriate, and folded into the outcome.
    #[instrument(skip(self), fields(volume = %name))]
    pub async fn reconcile(&self, name: &VolumeName) -> Outcome {
        match self.reconcile_inner(name).await {
            Ok(outcome) => {
                self.failures.remove(name);
                outcome
            }
            // A lost optimistic-concurrency race is not a failure: the
            // write is discarded and the pass re-runs on fresh data.
            Err(LvcError::Conflict(_)) => {
                debug!("record changed underneath, re-reading");
                Outcome::RequeueImmediately
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "invariant violated, halting this key");
                Outcome::Fatal(e)
            }
            Err(e) => {
                let delay = self.note_failure(name);
                warn!(
                    error = %e,
                    transient = e.is_transient(),
                    delay_ms = delay.as_millis() as u64,
                    "reconcile pass failed",
                );
                self.record_failure(name, &e).await;
                Outcome::RequeueAfter(delay)
            }
        }
    }

    async fn reconcile_inner(&self, name: &VolumeName) -> Result<Outcome, LvcError> {
        let Some((record, version)) = self.store.get(name).await? else {
            // Already cleaned up upstream.
            debug!("record absent, nothing to do");
            return Ok(Outcome::Done);
        };

        if record.name.0.is_empty() || record.node_name.is_empty() {
            return Err(LvcError::Fatal(format!(
                "record {name} is missing identity fields"
            )));
        }

        if record.spec.deletion_requested {
            self.finalize(record, version).await
        } else if !record.status.finalizer_present {
            self.register_finalizer(record, version).await
        } else {
            self.provision(record, version).await
        }
    }

    /// Persist the finalizer as its own step before any physical action, so
    /// a crash between registration and provisioning resumes safely.
    async fn register_finalizer(
        &self,
        mut record: VolumeRecord,
        version: Version,
    ) -> Result<Outcome, LvcError> {
        record.status.finalizer_present = true;
        self.store.update(record, version).await?;
        debug!("finalizer registered");
        Ok(Outcome::RequeueImmediately)
    }

    /// Create / extend / adopt path for a live record.
    async fn provision(
        &self,
        mut record: VolumeRecord,
        version: Version,
    ) -> Result<Outcome, LvcError> {
        let name = record.name.clone();
        let requested = record.spec.requested_size_bytes;

        if requested == 0 {
            return Err(LvcError::Invalid(format!(
                "volume {name}: requested size must be non-zero"
            )));
        }

        // Status is trustworthy while Provisioned: when it already covers
        // the request there is nothing to probe and nothing to write.
        if record.status.phase == Phase::Provisioned
            && record.status.actual_size_bytes >= requested
            && record.status.last_error.is_none()
        {
            return Ok(Outcome::Done);
        }

        let exists = self
            .backend_call("exists", &name, self.backend.exists(&name))
            .await?;

        if !exists {
            self.backend_call("create", &name, self.backend.create(&name, requested))
                .await?;
            info!(size_bytes = requested, "volume created");
        } else {
            let current = self
                .backend_call("current_size", &name, self.backend.current_size(&name))
                .await?;
            if current < requested {
                self.backend_call("resize", &name, self.backend.resize(&name, requested))
                    .await?;
                info!(from = current, to = requested, "volume extended");
            }
            // current >= requested is a no-op: either an idempotent retry
            // or a crash landed the physical action without the status
            // write; both are repaired by the status sync below.
        }

        let actual = self
            .backend_call("current_size", &name, self.backend.current_size(&name))
            .await?;

        record.status.phase = Phase::Provisioned;
        record.status.actual_size_bytes = actual;
        record.status.last_error = None;
        self.store.update(record, version).await?;

        debug!(actual_size_bytes = actual, "status synced");
        Ok(Outcome::Done)
    }

    /// Deletion path: remove the physical volume, then clear the finalizer
    /// so the provisioning layer may delete the record.
    async fn finalize(
        &self,
        mut record: VolumeRecord,
        version: Version,
    ) -> Result<Outcome, LvcError> {
        if !record.status.finalizer_present {
            // Nothing left to guard; the record's deletion is upstream's.
            return Ok(Outcome::Done);
        }

        let name = record.name.clone();
        let exists = self
            .backend_call("exists", &name, self.backend.exists(&name))
            .await?;

        if exists {
            match self
                .backend_call("remove", &name, self.backend.remove(&name))
                .await
            {
                Ok(()) => info!("volume removed"),
                // Lost a race with another remover; the volume is gone
                // either way.
                Err(LvcError::VolumeNotFound(_)) => {
                    debug!("volume already absent");
                }
                Err(e) => return Err(e),
            }
        }

        record.status.finalizer_present = false;
        self.store.update(record, version).await?;
        info!("finalizer cleared");
        Ok(Outcome::Done)
    }

    /// Bound a backend call by the configured deadline.  An elapsed
    /// deadline is a transient failure like any other backend outage.
    async fn backend_call<T>(
        &self,
        op: &'static str,
        name: &VolumeName,
        fut: impl Future<Output = Result<T, LvcError>>,
    ) -> Result<T, LvcError> {
        match tokio::time::timeout(self.config.backend_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(LvcError::Timeout {
                op,
                volume: name.to_string(),
            }),
        }
    }

    fn note_failure(&self, name: &VolumeName) -> Duration {
        let mut count = self.failures.entry(name.clone()).or_insert(0);
        *count += 1;
        self.config.backoff_for(*count)
    }

    /// Best-effort status write after a failed pass.  A conflict here just
    /// means fresher data already landed; the retry will see it.
    async fn record_failure(&self, name: &VolumeName, err: &LvcError) {
        let Ok(Some((mut record, version))) = self.store.get(name).await else {
            return;
        };
        record.status.phase = Phase::Error;
        record.status.last_error = Some(err.to_string());
        if let Err(e) = self.store.update(record, version).await {
            debug!(error = %e, "could not record failure status");
        }
    }
}

#[async_trait]
impl Reconciler for ReconcileEngine {
    async fn reconcile(&self, name: &VolumeName) -> Outcome {
        ReconcileEngine::reconcile(self, name).await
    }
}
