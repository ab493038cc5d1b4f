//! Per-snapshot grading reconcilers
//!
//! Each snapshot with grading activity gets one reconciler task. The task
//! sleeps until notified of a change, recomputes drift, and feeds pending
//! pairs to a grading process in batches until drift reaches zero. Grading
//! processes are disposable: resource exhaustion (or a transport error)
//! discards the process and spawns a successor, up to a per-episode restart
//! ceiling. The restart ceiling guards against a poison batch burning
//! budget forever; hitting it stalls the reconciler until the next
//! notification.

pub mod process;

use crate::access::Identity;
use crate::config::ReconcilerConfig;
use crate::drift::{DriftDetector, DriftScope};
use crate::error::{GradebookError, Result};
use crate::store::SqliteStore;
use crate::types::{PendingPair, SnapshotSlug};
use process::{GradingOutcome, GradingProcess, GradingProcessFactory};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What kind of write triggered a wakeup
///
/// Carried for logging only; the reconciler always recomputes drift from
/// the store rather than trusting the notification's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    RunCompleted,
    GroundTruthChanged,
    EdgesDeleted,
    OperatorNudge,
}

/// Where a reconciler currently is in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    /// No pending pairs; waiting for a change notification
    Idle,
    /// Actively feeding batches to a grading process
    Grading,
    /// Last process exhausted its resources; spawning a successor
    Restarting,
    /// Restart ceiling hit; waiting for operator intervention
    Stalled,
}

struct ReconcilerHandle {
    tx: mpsc::Sender<ChangeKind>,
    state: watch::Receiver<ReconcilerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns one reconciler task per snapshot and routes notifications to them
pub struct ReconcilerRegistry {
    store: Arc<SqliteStore>,
    factory: Arc<dyn GradingProcessFactory>,
    config: ReconcilerConfig,
    reconcilers: Mutex<HashMap<SnapshotSlug, ReconcilerHandle>>,
}

impl ReconcilerRegistry {
    pub fn new(
        store: Arc<SqliteStore>,
        factory: Arc<dyn GradingProcessFactory>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            factory,
            config,
            reconcilers: Mutex::new(HashMap::new()),
        }
    }

    /// Start a reconciler for the snapshot if one is not already running
    pub async fn ensure_reconciler(&self, slug: &SnapshotSlug) {
        let mut reconcilers = self.reconcilers.lock().await;
        if reconcilers.contains_key(slug) {
            return;
        }
        let (tx, rx) = mpsc::channel(self.config.notification_buffer);
        let (state_tx, state_rx) = watch::channel(ReconcilerState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = GraderReconciler {
            snapshot: slug.clone(),
            store: self.store.clone(),
            factory: self.factory.clone(),
            config: self.config.clone(),
            rx,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(reconciler.run());
        reconcilers.insert(
            slug.clone(),
            ReconcilerHandle {
                tx,
                state: state_rx,
                shutdown: shutdown_tx,
                task,
            },
        );
        info!("Started reconciler for snapshot '{slug}'");
    }

    /// Wake the snapshot's reconciler
    ///
    /// Notifications carry no payload the reconciler trusts, so a full
    /// channel means a wakeup is already queued and the new one can be
    /// dropped (coalesced) without losing work.
    pub async fn notify(&self, slug: &SnapshotSlug, change: ChangeKind) {
        self.ensure_reconciler(slug).await;
        let reconcilers = self.reconcilers.lock().await;
        let handle = match reconcilers.get(slug) {
            Some(h) => h,
            None => return,
        };
        match handle.tx.try_send(change) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Notification for '{slug}' coalesced into pending wakeup");
            }
            Err(TrySendError::Closed(_)) => {
                error!("Reconciler for '{slug}' is gone; notification dropped");
            }
        }
    }

    /// Current state of a snapshot's reconciler, if one is running
    pub async fn state(&self, slug: &SnapshotSlug) -> Option<ReconcilerState> {
        let reconcilers = self.reconcilers.lock().await;
        reconcilers.get(slug).map(|h| *h.state.borrow())
    }

    /// Stop every reconciler and wait for the tasks to finish
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut reconcilers = self.reconcilers.lock().await;
            reconcilers.drain().collect()
        };
        for (slug, handle) in handles {
            let _ = handle.shutdown.send(true);
            if handle.task.await.is_err() {
                error!("Reconciler task for '{slug}' panicked during shutdown");
            }
        }
        info!("All reconcilers stopped");
    }
}

/// The per-snapshot reconciliation loop
struct GraderReconciler {
    snapshot: SnapshotSlug,
    store: Arc<SqliteStore>,
    factory: Arc<dyn GradingProcessFactory>,
    config: ReconcilerConfig,
    rx: mpsc::Receiver<ChangeKind>,
    state: watch::Sender<ReconcilerState>,
    shutdown: watch::Receiver<bool>,
}

impl GraderReconciler {
    async fn run(mut self) {
        info!("Reconciler for '{}' running", self.snapshot);
        let identity = Identity::Grader {
            snapshot: self.snapshot.clone(),
        };
        let detector = DriftDetector::new(self.store.clone());

        // Grade whatever already drifted before we were started
        self.run_episode(&identity, &detector).await;

        loop {
            tokio::select! {
                change = self.rx.recv() => {
                    match change {
                        Some(kind) => {
                            debug!("Reconciler for '{}' woken: {kind:?}", self.snapshot);
                        }
                        None => break,
                    }
                }
                _ = self.shutdown.changed() => break,
            }
            self.drain_notifications();
            self.run_episode(&identity, &detector).await;
        }
        info!("Reconciler for '{}' stopped", self.snapshot);
    }

    /// Absorb queued wakeups; the drift recompute covers them all
    fn drain_notifications(&mut self) {
        let mut coalesced = 0;
        while self.rx.try_recv().is_ok() {
            coalesced += 1;
        }
        if coalesced > 0 {
            debug!(
                "Reconciler for '{}' coalesced {coalesced} queued notifications",
                self.snapshot
            );
        }
    }

    /// One reconciliation episode: grade until drift is zero or the restart
    /// ceiling is hit. The restart counter is scoped to the episode, so an
    /// operator fixing the data and re-notifying gets a fresh budget.
    async fn run_episode(&mut self, identity: &Identity, detector: &DriftDetector) {
        match self.grade_until_settled(identity, detector).await {
            Ok(()) => {
                let _ = self.state.send(ReconcilerState::Idle);
            }
            Err(GradebookError::RestartsExhausted { snapshot, restarts }) => {
                error!(
                    "Reconciler for '{snapshot}' stalled after {restarts} grading-process restarts"
                );
                let _ = self.state.send(ReconcilerState::Stalled);
            }
            Err(e) => {
                error!(
                    "Reconciler for '{}' abandoned episode: {e}",
                    self.snapshot
                );
                let _ = self.state.send(ReconcilerState::Idle);
            }
        }
    }

    async fn grade_until_settled(
        &mut self,
        identity: &Identity,
        detector: &DriftDetector,
    ) -> Result<()> {
        let mut restarts: u32 = 0;
        let mut process: Option<Box<dyn GradingProcess>> = None;

        loop {
            self.drain_notifications();
            let pending = self
                .with_retry("drift computation", || {
                    detector.pending_for(identity, DriftScope::Snapshot(self.snapshot.clone()))
                })
                .await?;
            if pending.is_empty() {
                debug!("Reconciler for '{}' settled: zero drift", self.snapshot);
                return Ok(());
            }
            let _ = self.state.send(ReconcilerState::Grading);
            let batch: Vec<PendingPair> = pending
                .into_iter()
                .take(self.config.batch_size)
                .collect();

            let outcome = match process.as_mut() {
                Some(p) => p.decide(&batch).await,
                None => match self.factory.spawn(&self.snapshot).await {
                    Ok(mut p) => {
                        let outcome = p.decide(&batch).await;
                        process = Some(p);
                        outcome
                    }
                    Err(e) => Err(e),
                },
            };

            match outcome {
                Ok(GradingOutcome::Edges(drafts)) => {
                    if drafts.is_empty() {
                        // A process that judges nothing and never exhausts
                        // would spin; treat it like exhaustion.
                        warn!(
                            "Grading process for '{}' returned no edges; restarting",
                            self.snapshot
                        );
                        process = None;
                        restarts = self.count_restart(restarts).await?;
                        continue;
                    }
                    let result = self
                        .with_retry("edge persistence", || {
                            self.store
                                .put_edges(identity, &self.snapshot, drafts.clone())
                        })
                        .await;
                    match result {
                        Ok(n) => {
                            debug!("Reconciler for '{}' committed {n} edges", self.snapshot);
                        }
                        Err(GradebookError::DuplicateEdge { issue_id, .. }) => {
                            // Someone graded the pair concurrently; the next
                            // drift recompute excludes it.
                            warn!(
                                "Concurrent edge for issue '{issue_id}' on '{}'; recomputing drift",
                                self.snapshot
                            );
                        }
                        Err(e) => {
                            // The batch was rejected by the store (or the
                            // retry budget ran out); the process that made
                            // it cannot be trusted with the same pairs again.
                            warn!(
                                "Edge batch for '{}' rejected ({e}); restarting",
                                self.snapshot
                            );
                            process = None;
                            restarts = self.count_restart(restarts).await?;
                        }
                    }
                }
                Ok(GradingOutcome::ResourceExhausted) => {
                    info!(
                        "Grading process for '{}' exhausted its resources",
                        self.snapshot
                    );
                    process = None;
                    restarts = self.count_restart(restarts).await?;
                }
                Err(e) => {
                    warn!(
                        "Grading process for '{}' failed ({e}); restarting",
                        self.snapshot
                    );
                    process = None;
                    restarts = self.count_restart(restarts).await?;
                }
            }
        }
    }

    /// Record one restart against the episode ceiling
    async fn count_restart(&self, restarts: u32) -> Result<u32> {
        let restarts = restarts + 1;
        if restarts > self.config.max_restarts {
            return Err(GradebookError::RestartsExhausted {
                snapshot: self.snapshot.clone(),
                restarts: restarts - 1,
            });
        }
        let _ = self.state.send(ReconcilerState::Restarting);
        tokio::time::sleep(self.backoff(restarts)).await;
        Ok(restarts)
    }

    /// Retry transient store failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, what: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(GradebookError::Database(msg)) if attempt < self.config.retry_attempts => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        "{what} for '{}' failed ({msg}); retry {attempt}/{} in {delay:?}",
                        self.snapshot, self.config.retry_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff;
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(1 << 16);
        (base * factor).min(self.config.retry_backoff_cap)
    }
}
