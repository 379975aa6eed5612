//! Engine error kinds.
//!
//! Failures surface at the `register_scan` boundary; recoverable conditions
//! (an infeasible Murty child, an exhausted parent stream) are handled where
//! they arise and only reach this enum when a caller asks for strictness.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the tracking engine.
#[derive(Debug, Clone, Error)]
pub enum MhtError {
    /// The assignment solver was handed a degenerate cost matrix.
    #[error("assignment solver called on {rows}x{cols} cost matrix")]
    InvalidMatrix { rows: usize, cols: usize },

    /// Every complete assignment covers a forbidden (`LARGE`) entry.
    #[error("no feasible assignment avoids a forbidden entry")]
    NoFeasibleAssignment,

    /// The parent-hypothesis stream ran dry before producing a hypothesis.
    #[error("hypothesis stream exhausted before any hypothesis was produced")]
    EmptyStream,

    /// An innovation covariance failed its Cholesky factorisation.
    #[error("innovation covariance is not positive definite (track {track})")]
    FilterDegenerate { track: Uuid },

    /// One or more clusters failed during scan registration; the failed
    /// clusters were left at their pre-scan state and marked tainted.
    #[error("{failed} of {total} clusters tainted during scan registration")]
    TaintedClusters { failed: usize, total: usize },

    /// Cluster snapshot store failure.
    #[error("cluster store: {0}")]
    Store(String),
}

impl MhtError {
    /// Attach a concrete track id to a degenerate-filter error raised below
    /// the track layer.
    pub fn for_track(self, track: Uuid) -> Self {
        match self {
            MhtError::FilterDegenerate { .. } => MhtError::FilterDegenerate { track },
            other => other,
        }
    }
}

impl From<sled::Error> for MhtError {
    fn from(e: sled::Error) -> Self {
        MhtError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for MhtError {
    fn from(e: serde_json::Error) -> Self {
        MhtError::Store(e.to_string())
    }
}
