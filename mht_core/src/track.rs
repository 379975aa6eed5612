//! Track nodes of a target's hypothesis tree.
//!
//! A track is one lineage of report-to-target assignments: it owns a filter
//! posterior, the score contribution of its own assignment, and a cached sum
//! of its ancestors' contributions. Children are created at most once per
//! `(parent, report)` pair and shared by every hypothesis extending the
//! parent that way; the missed-detection child is unique per parent.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::MhtError;
use crate::filter::{TargetFilter, TargetInit};
use crate::scan::{Report, Sensor};
use crate::{ReportId, TargetId, TrackId, LARGE};

/// Persistence counter granted to a track born from an extraneous report.
pub const NEW_EXIST_SCORE: u8 = 1;
/// Persistence counter ceiling.
pub const MAX_EXIST_SCORE: u8 = 4;

/// One node in a target's hypothesis tree.
#[derive(Clone)]
pub struct Track {
    pub id: TrackId,
    pub target: TargetId,
    pub parent: Option<TrackId>,
    pub filter: Box<dyn TargetFilter>,
    /// Report that produced this node; `None` for roots and missed
    /// detections.
    pub report: Option<ReportId>,
    /// Score contribution of this node's own assignment.
    pub my_score: f64,
    parent_score: f64,
    /// Persistence counter in `0..=MAX_EXIST_SCORE`; a track whose parent has
    /// dropped to 1 or below is no longer carried through a missed scan.
    pub exist_score: u8,
    /// Children created this scan, keyed by the report that extends the
    /// lineage (`None` marks the missed-detection child).
    pub children: HashMap<Option<ReportId>, TrackId>,
    /// Sensor tags that contributed to this lineage.
    pub sources: HashSet<usize>,
    /// Lineage length in scans.
    pub trlen: u32,
}

impl Track {
    fn node(
        target: TargetId,
        parent: Option<&Track>,
        filter: Box<dyn TargetFilter>,
        report: Option<&Report>,
    ) -> Self {
        let mut sources = parent.map(|p| p.sources.clone()).unwrap_or_default();
        if let Some(src) = report.and_then(|r| r.source) {
            sources.insert(src);
        }
        Self {
            id: Uuid::new_v4(),
            target,
            parent: parent.map(|p| p.id),
            filter,
            report: report.map(|r| r.id),
            my_score: 0.0,
            parent_score: parent.map(|p| p.score()).unwrap_or(0.0),
            exist_score: parent.map(|p| p.exist_score).unwrap_or(0),
            children: HashMap::new(),
            sources,
            trlen: parent.map(|p| p.trlen + 1).unwrap_or(1),
        }
    }

    /// Root track of a pre-existing target.
    pub fn initial(target: TargetId, filter: Box<dyn TargetFilter>) -> Self {
        let mut track = Track::node(target, None, filter, None);
        track.exist_score = MAX_EXIST_SCORE;
        track
    }

    /// Root track of a target born from an extraneous report.
    pub fn new_target(
        target: TargetId,
        filter: Box<dyn TargetFilter>,
        sensor: &dyn Sensor,
        report: &Report,
    ) -> Self {
        let mut track = Track::node(target, None, filter, Some(report));
        track.my_score = sensor.score_extraneous();
        track.exist_score = NEW_EXIST_SCORE;
        track
    }

    /// Child extending `parent` with `report`: branches the parent's
    /// posterior, corrects it, and prices the detection.
    pub fn extend(
        parent: &Track,
        report: &Report,
        sensor: &dyn Sensor,
        init: &dyn TargetInit,
    ) -> Result<Self, MhtError> {
        let mut filter = init.init(report, Some(parent.filter.as_ref()));
        let score = filter
            .correct(report)
            .map_err(|e| e.for_track(parent.id))?;
        let mut track = Track::node(parent.target, Some(parent), filter, Some(report));
        track.my_score = score - sensor.score_found();
        track.exist_score = (parent.exist_score + 1).min(MAX_EXIST_SCORE);
        Ok(track)
    }

    /// Missed-detection child: a miss inside the field of view is priced and
    /// ages the lineage, a miss outside it is free.
    pub fn missed(parent: &Track, sensor: &dyn Sensor) -> Self {
        let filter = parent.filter.clone();
        let mut track = Track::node(parent.target, Some(parent), filter, None);
        if sensor.in_fov(&parent.filter.state()) {
            track.my_score = parent.miss_score(sensor);
            track.exist_score = parent.exist_score.saturating_sub(1);
        } else {
            track.my_score = 0.0;
            track.exist_score = parent.exist_score;
        }
        track
    }

    /// Accumulated lineage score.
    pub fn score(&self) -> f64 {
        self.parent_score + self.my_score
    }

    /// Cost of assigning `report` to this track, or [`LARGE`] when gated out
    /// by the bbox test or the nll limit.
    pub fn match_score(
        &self,
        report: &Report,
        sensor: &dyn Sensor,
        nll_limit: f64,
    ) -> Result<f64, MhtError> {
        if self.filter.bbox().overlaps(&sensor.bbox()) {
            let nll = self.filter.nll(report).map_err(|e| e.for_track(self.id))?;
            if nll < nll_limit {
                return Ok(nll - sensor.score_found() - self.miss_score(sensor));
            }
        }
        Ok(LARGE)
    }

    /// Cost of this track receiving no report, weighted by how much of its
    /// uncertainty lies inside the field of view.
    pub fn miss_score(&self, sensor: &dyn Sensor) -> f64 {
        sensor.score_miss() * self.filter.bbox().overlap_fraction(&sensor.bbox())
    }

    pub fn predict(&mut self, dt: f64) {
        self.filter.predict(dt);
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tr({}/{}: {:?} {} e{})",
            self.target,
            self.id,
            self.filter.state().as_slice(),
            self.report.map(|_| "r").unwrap_or("x"),
            self.exist_score
        )
    }
}
