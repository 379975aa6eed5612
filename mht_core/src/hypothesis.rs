//! Cluster hypotheses: one consistent choice of a single track per target.

use std::collections::HashMap;

use crate::track::Track;
use crate::{TargetId, TrackId};

/// One joint assignment of tracks inside a cluster.
///
/// Identity is the ordered track tuple; the score is the sum of the member
/// tracks' lineage scores, shifted by the cluster's normalisation constant.
#[derive(Debug, Clone)]
pub struct ClusterHypothesis {
    pub tracks: Vec<TrackId>,
    pub targets: Vec<TargetId>,
    pub total_score: f64,
}

impl ClusterHypothesis {
    /// Hypothesis over the given tracks, scored from the arena.
    pub fn initial(tracks: Vec<TrackId>, arena: &HashMap<TrackId, Track>) -> Self {
        let targets = distinct_targets(&tracks, arena);
        let total_score = tracks.iter().map(|id| arena[id].score()).sum();
        Self { tracks, targets, total_score }
    }

    /// Concatenation of per-cluster hypotheses into one joint hypothesis.
    pub fn merge(parts: &[&ClusterHypothesis]) -> Self {
        let tracks: Vec<TrackId> = parts.iter().flat_map(|h| h.tracks.iter().copied()).collect();
        let targets = parts.iter().flat_map(|h| h.targets.iter().copied()).collect();
        let total_score = parts.iter().map(|h| h.total_score).sum();
        Self { tracks, targets, total_score }
    }

    /// Projection onto a subset of targets, rescored from the arena;
    /// `None` when no member track belongs to the subset.
    pub fn split(
        &self,
        keep: &dyn Fn(TargetId) -> bool,
        arena: &HashMap<TrackId, Track>,
    ) -> Option<Self> {
        let tracks: Vec<TrackId> = self
            .tracks
            .iter()
            .copied()
            .filter(|id| arena.get(id).is_some_and(|t| keep(t.target)))
            .collect();
        if tracks.is_empty() {
            return None;
        }
        Some(Self::initial(tracks, arena))
    }

    pub fn score(&self) -> f64 {
        self.total_score
    }
}

impl PartialEq for ClusterHypothesis {
    fn eq(&self, other: &Self) -> bool {
        self.tracks == other.tracks
    }
}

impl Eq for ClusterHypothesis {}

impl std::hash::Hash for ClusterHypothesis {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.tracks.hash(state);
    }
}

fn distinct_targets(tracks: &[TrackId], arena: &HashMap<TrackId, Track>) -> Vec<TargetId> {
    let mut targets = Vec::new();
    for id in tracks {
        let target = arena[id].target;
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}
