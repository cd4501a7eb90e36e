//! Per-key serialized dispatch of reconcile passes.
//!
//! The [`Dispatcher`] guarantees at most one in-flight reconcile per volume
//! name while never losing an update: a notification that lands while its
//! key is being reconciled sets a rerun flag instead of starting a second
//! pass, and the flag buys exactly one follow-up pass.  Notifications for a
//! key that is already waiting in the queue coalesce into that one entry.
//!
//! Keys are pulled from the ready queue by a pool of worker tasks; across
//! distinct keys there is no ordering at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::Outcome;
use crate::types::VolumeName;

/// Anything the dispatcher can drive.  [`ReconcileEngine`] is the real
/// implementation; tests substitute counting fakes.
///
/// [`ReconcileEngine`]: crate::engine::ReconcileEngine
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, name: &VolumeName) -> Outcome;
}

/// Scheduling state of one key.  All fields are guarded by the dispatcher's
/// single state mutex.
#[derive(Default)]
struct KeyState {
    /// Key sits in the ready queue.
    queued: bool,
    /// A worker is reconciling the key right now.
    running: bool,
    /// A notification arrived mid-flight; run once more when done.
    rerun: bool,
    /// A fatal outcome halted this key; notifications are ignored.
    halted: bool,
}

/// Per-key serializing work queue in front of a [`Reconciler`].
pub struct Dispatcher<R> {
    reconciler: Arc<R>,
    states: Mutex<HashMap<VolumeName, KeyState>>,
    /// `None` once shutdown has begun; late notifications are dropped
    /// (reconstructible from store state on restart).
    ready_tx: Mutex<Option<mpsc::UnboundedSender<VolumeName>>>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<VolumeName>>,
}

impl<R: Reconciler + 'static> Dispatcher<R> {
    pub fn new(reconciler: Arc<R>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            reconciler,
            states: Mutex::new(HashMap::new()),
            ready_tx: Mutex::new(Some(tx)),
            ready_rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Idempotent enqueue.  Safe to call from any task at any time.
    pub fn notify(&self, name: VolumeName) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(name.clone()).or_default();
        if state.halted {
            warn!(volume = %name, "ignoring notification for halted key");
            return;
        }
        if state.running {
            state.rerun = true;
            return;
        }
        if state.queued {
            // Coalesced with the pending entry.
            return;
        }
        state.queued = true;
        drop(states);
        self.enqueue(name);
    }

    /// Start `n` worker tasks.  Returned handles complete after
    /// [`Self::shutdown`], once the queue is drained and in-flight passes
    /// have finished.
    pub fn spawn_workers(self: &Arc<Self>, n: usize) -> Vec<JoinHandle<()>> {
        (0..n)
            .map(|worker| {
                let this = Arc::clone(self);
                tokio::spawn(this.worker_loop(worker))
            })
            .collect()
    }

    /// Pump a store watch stream into [`Self::notify`] until the stream
    /// ends.
    pub fn spawn_drain(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<VolumeName>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(name) = rx.recv().await {
                this.notify(name);
            }
            debug!("watch stream ended");
        })
    }

    /// Begin shutdown: close the ready queue.  Workers finish their current
    /// pass plus whatever is already queued, then exit.
    pub fn shutdown(&self) {
        info!("dispatcher shutting down");
        self.ready_tx.lock().unwrap().take();
    }

    fn enqueue(&self, name: VolumeName) {
        let tx = self.ready_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                // Receiver outlives the sender; send cannot fail.
                let _ = tx.send(name);
            }
            None => debug!(volume = %name, "dropping notification during shutdown"),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            let name = {
                let mut rx = self.ready_rx.lock().await;
                rx.recv().await
            };
            let Some(name) = name else { break };

            {
                let mut states = self.states.lock().unwrap();
                if let Some(state) = states.get_mut(&name) {
                    state.queued = false;
                    state.running = true;
                }
            }

            debug!(worker, volume = %name, "reconciling");
            let outcome = self.reconciler.reconcile(&name).await;
            self.complete(name, outcome);
        }
        debug!(worker, "worker exiting");
    }

    fn complete(self: &Arc<Self>, name: VolumeName, outcome: Outcome) {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(&name) else {
            return;
        };
        state.running = false;

        match outcome {
            // Fatal outranks everything, including a pending rerun: the key
            // is halted until an operator intervenes.
            Outcome::Fatal(err) => {
                error!(volume = %name, error = %err, "reconciliation halted for this key");
                state.rerun = false;
                state.halted = true;
            }
            // A mid-flight notification wins over the pass's own outcome:
            // the record may have changed again, so run again now.
            _ if state.rerun => {
                state.rerun = false;
                state.queued = true;
                drop(states);
                self.enqueue(name);
            }
            Outcome::Done => {
                states.remove(&name);
            }
            Outcome::RequeueImmediately => {
                state.queued = true;
                drop(states);
                self.enqueue(name);
            }
            Outcome::RequeueAfter(delay) => {
                states.remove(&name);
                drop(states);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.notify(name);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use crate::error::LvcError;

    /// Fake reconciler: counts calls, blocks each pass on a semaphore
    /// permit, and replays a scripted queue of outcomes (Done once the
    /// script is exhausted).
    struct ScriptedReconciler {
        calls: AtomicU64,
        gate: tokio::sync::Semaphore,
        script: Mutex<VecDeque<Outcome>>,
    }

    impl ScriptedReconciler {
        fn new(script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                gate: tokio::sync::Semaphore::new(0),
                script: Mutex::new(script.into()),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }

        /// Let one blocked pass proceed.
        fn release(&self) {
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl Reconciler for ScriptedReconciler {
        async fn reconcile(&self, _name: &VolumeName) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Done)
        }
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn notifications_coalesce_to_one_rerun() {
        let rec = ScriptedReconciler::new(vec![]);
        let dispatcher = Dispatcher::new(rec.clone());
        let workers = dispatcher.spawn_workers(2);

        dispatcher.notify("vol-a".into());
        wait_until("first pass to start", || rec.calls() == 1).await;

        // A burst of notifications while the pass is in flight.
        for _ in 0..5 {
            dispatcher.notify("vol-a".into());
        }

        rec.release(); // finish pass 1
        wait_until("the single follow-up pass", || rec.calls() == 2).await;
        rec.release(); // finish pass 2

        // No third pass ever starts.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rec.calls(), 2);

        dispatcher.shutdown();
        for handle in workers {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let rec = ScriptedReconciler::new(vec![]);
        let dispatcher = Dispatcher::new(rec.clone());
        dispatcher.spawn_workers(2);

        dispatcher.notify("vol-a".into());
        dispatcher.notify("vol-b".into());

        // Both passes start while neither has been released.
        wait_until("both passes in flight", || rec.calls() == 2).await;
        rec.release();
        rec.release();
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn requeue_immediately_runs_again() {
        let rec = ScriptedReconciler::new(vec![Outcome::RequeueImmediately]);
        let dispatcher = Dispatcher::new(rec.clone());
        dispatcher.spawn_workers(1);

        dispatcher.notify("vol-a".into());
        rec.release();
        wait_until("follow-up pass", || rec.calls() == 2).await;
        rec.release();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rec.calls(), 2);
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn requeue_after_fires_a_timer() {
        let rec = ScriptedReconciler::new(vec![Outcome::RequeueAfter(Duration::from_millis(30))]);
        let dispatcher = Dispatcher::new(rec.clone());
        dispatcher.spawn_workers(1);

        dispatcher.notify("vol-a".into());
        rec.release();
        wait_until("first pass done", || rec.calls() == 1).await;

        // The retry arrives only after the delay.
        wait_until("timed retry", || rec.calls() == 2).await;
        rec.release();
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn real_notification_beats_the_timer() {
        let rec = ScriptedReconciler::new(vec![Outcome::RequeueAfter(Duration::from_secs(60))]);
        let dispatcher = Dispatcher::new(rec.clone());
        dispatcher.spawn_workers(1);

        dispatcher.notify("vol-a".into());
        rec.release();
        wait_until("first pass done", || rec.calls() == 1).await;

        // A fresh change notification must not wait out the hour.
        dispatcher.notify("vol-a".into());
        wait_until("immediate rerun", || rec.calls() == 2).await;
        rec.release();
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn fatal_outcome_halts_the_key() {
        let rec = ScriptedReconciler::new(vec![Outcome::Fatal(LvcError::Fatal(
            "missing identity".into(),
        ))]);
        let dispatcher = Dispatcher::new(rec.clone());
        dispatcher.spawn_workers(1);

        dispatcher.notify("vol-a".into());
        rec.release();
        wait_until("fatal pass done", || rec.calls() == 1).await;

        // Further notifications are ignored; other keys still work.
        dispatcher.notify("vol-a".into());
        dispatcher.notify("vol-b".into());
        wait_until("other key reconciled", || rec.calls() == 2).await;
        rec.release();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rec.calls(), 2);
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn shutdown_lets_workers_finish_and_exit() {
        let rec = ScriptedReconciler::new(vec![]);
        let dispatcher = Dispatcher::new(rec.clone());
        let workers = dispatcher.spawn_workers(2);

        dispatcher.notify("vol-a".into());
        wait_until("pass in flight", || rec.calls() == 1).await;

        dispatcher.shutdown();
        // Notifications after shutdown are dropped, not panics.
        dispatcher.notify("vol-b".into());

        rec.release();
        for handle in workers {
            handle.await.unwrap();
        }
        assert_eq!(rec.calls(), 1);
    }

    #[tokio::test]
    async fn drain_pumps_watch_stream() {
        let rec = ScriptedReconciler::new(vec![]);
        let dispatcher = Dispatcher::new(rec.clone());
        dispatcher.spawn_workers(1);

        let (tx, rx) = mpsc::unbounded_channel();
        let drain = dispatcher.spawn_drain(rx);

        tx.send("vol-a".into()).unwrap();
        wait_until("pass from watch event", || rec.calls() == 1).await;
        rec.release();

        drop(tx);
        drain.await.unwrap();
        dispatcher.shutdown();
    }
}
