//! Grading-process abstraction
//!
//! The reconciler drives an external judgment process (typically an LLM
//! agent) that decides credit for pending pairs. The engine only depends on
//! this trait; tests plug in scripted implementations.

use crate::error::Result;
use crate::types::{EdgeDraft, PendingPair, SnapshotSlug};
use async_trait::async_trait;

/// What a grading process produced for one batch
#[derive(Debug)]
pub enum GradingOutcome {
    /// One edge per pair it judged (a subset of the batch is fine; the
    /// remainder stays pending)
    Edges(Vec<EdgeDraft>),
    /// The process ran out of budget (context window, tokens, wall clock)
    /// before finishing. Not an error: the reconciler restarts with a fresh
    /// process and the progress already committed stands.
    ResourceExhausted,
}

/// One stateful grading session
///
/// A process accumulates context across batches; when it exhausts its
/// resources the reconciler discards it and spawns a successor.
#[async_trait]
pub trait GradingProcess: Send {
    /// Judge a batch of pending pairs
    ///
    /// Errors are treated like resource exhaustion: the process is
    /// discarded and a fresh one takes over, counting against the restart
    /// ceiling.
    async fn decide(&mut self, batch: &[PendingPair]) -> Result<GradingOutcome>;
}

/// Spawns fresh grading processes for a snapshot
#[async_trait]
pub trait GradingProcessFactory: Send + Sync {
    async fn spawn(&self, snapshot: &SnapshotSlug) -> Result<Box<dyn GradingProcess>>;
}
