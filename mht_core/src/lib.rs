//! Multiple hypothesis tracking engine.
//!
//! This library defers hard data-association decisions across sensor scans by
//! maintaining ranked joint explanations of which observations belong to which
//! targets:
//! 1. **Assignment**: optimal rectangular LAP solving plus lazy k-best
//!    enumeration (Murty partitioning)
//! 2. **Hypothesis trees**: per-target track trees carrying Kalman posteriors
//! 3. **Clusters**: independent groups of entangled targets with ranked,
//!    normalised joint hypotheses
//! 4. **Tracker**: scan ingress, cluster routing, merge/split, global
//!    hypothesis enumeration

pub mod assignment;
pub mod cluster;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod hypgen;
pub mod hypothesis;
pub mod models;
pub mod scan;
pub mod store;
pub mod target;
pub mod track;
pub mod tracker;

/// Cost sentinel marking forbidden assignment-matrix entries.
///
/// Real costs stay below this value (per-report gating uses `nll_limit`,
/// which defaults to the same magnitude).
pub const LARGE: f64 = 1.0e4;

// Re-export key types for convenience
pub use cluster::{Cluster, ClusterParams};
pub use error::MhtError;
pub use filter::{DefaultTargetInit, KalmanFilter, TargetFilter, TargetInit};
pub use geometry::Rect;
pub use hypgen::{Murty, PermGen};
pub use hypothesis::ClusterHypothesis;
pub use scan::{FovSensor, IdealSensor, Report, Scan, Sensor};
pub use store::ClusterStore;
pub use target::Target;
pub use track::{Track, MAX_EXIST_SCORE, NEW_EXIST_SCORE};
pub use tracker::{GlobalHypothesis, TrackEstimate, Tracker};

/// Identifier for a cluster of entangled targets.
pub type ClusterId = uuid::Uuid;
/// Identifier for a putative physical object.
pub type TargetId = uuid::Uuid;
/// Identifier for one node in a target's hypothesis tree.
pub type TrackId = uuid::Uuid;
/// Identifier for a measurement within its scan.
pub type ReportId = uuid::Uuid;
