//! Targets: roots of per-object hypothesis trees.

use std::collections::HashMap;

use crate::{ReportId, TargetId, TrackId};

/// A putative physical object and the live leaves of its hypothesis tree.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub id: TargetId,
    /// Surviving leaf tracks after the latest scan finalisation.
    pub tracks: Vec<TrackId>,
    /// Report-driven children created during the current scan; flushed when
    /// the assignment is finalised.
    pub new_tracks: HashMap<ReportId, TrackId>,
}

impl Target {
    pub fn new(id: TargetId) -> Self {
        Self { id, tracks: Vec::new(), new_tracks: HashMap::new() }
    }

    /// Replace the live leaves with the tracks surviving in at least one
    /// hypothesis and flush the per-scan cache.
    pub fn finalize_assignment(&mut self, surviving: Vec<TrackId>) {
        self.tracks = surviving;
        self.new_tracks.clear();
    }
}
