//! Clusters: independent groups of entangled targets.
//!
//! A cluster owns the target and track arenas for its group, the ranked list
//! of joint hypotheses over them, and the ambiguity sets that decide when the
//! group can be split. Scan registration enumerates new hypotheses lazily:
//! each parent hypothesis drives its own Murty stream over a per-parent cost
//! matrix, and the streams are interleaved in cost order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use nalgebra::DMatrix;
use ordered_float::NotNan;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::MhtError;
use crate::filter::{DefaultTargetInit, TargetFilter, TargetInit};
use crate::geometry::Rect;
use crate::hypgen::{Murty, PermGen};
use crate::hypothesis::ClusterHypothesis;
use crate::scan::{Report, Scan, Sensor};
use crate::target::Target;
use crate::track::Track;
use crate::{ClusterId, ReportId, TargetId, TrackId, LARGE};

/// Tuning knobs shared by every cluster of a tracker.
#[derive(Clone)]
pub struct ClusterParams {
    /// Hypotheses retained per cluster after each scan.
    pub k_max: usize,
    /// Tail-probability cut-off for hypothesis enumeration.
    pub hp_limit: f64,
    /// Per-(track, report) gating threshold.
    pub nll_limit: f64,
    /// Factory for new-target filters (and for branching track posteriors).
    pub init_target_tracker: Arc<dyn TargetInit>,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            k_max: 100,
            hp_limit: 1.0e4,
            nll_limit: 1.0e4,
            init_target_tracker: Arc::new(DefaultTargetInit::new(0.1, 0.1)),
        }
    }
}

impl std::fmt::Debug for ClusterParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterParams")
            .field("k_max", &self.k_max)
            .field("hp_limit", &self.hp_limit)
            .field("nll_limit", &self.nll_limit)
            .finish()
    }
}

/// Snapshot of a parent hypothesis taken before the arenas mutate.
struct ParentHyp {
    score: f64,
    tracks: Vec<TrackId>,
}

/// Peekable draw stream for one parent hypothesis.
struct Draws {
    iter: Box<dyn Iterator<Item = (f64, Vec<usize>)>>,
    peeked: Option<(f64, Vec<usize>)>,
}

impl Draws {
    fn new(mut iter: Box<dyn Iterator<Item = (f64, Vec<usize>)>>) -> Self {
        let peeked = iter.next();
        Self { iter, peeked }
    }

    fn peek_cost(&self) -> Option<f64> {
        self.peeked.as_ref().map(|item| item.0)
    }

    fn next(&mut self) -> Option<(f64, Vec<usize>)> {
        let item = self.peeked.take()?;
        self.peeked = self.iter.next();
        Some(item)
    }
}

/// Heap entry interleaving the per-parent streams by pending cost.
struct PendingStream {
    cost: NotNan<f64>,
    seq: u64,
    parent: usize,
    draws: Draws,
}

impl PartialEq for PendingStream {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.seq == other.seq
    }
}

impl Eq for PendingStream {}

impl Ord for PendingStream {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.cost, self.seq).cmp(&(other.cost, other.seq))
    }
}

impl PartialOrd for PendingStream {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// An independent group of targets whose hypotheses are entangled.
#[derive(Clone)]
pub struct Cluster {
    pub id: ClusterId,
    pub params: ClusterParams,
    /// Member targets in insertion order.
    pub targets: Vec<TargetId>,
    target_arena: HashMap<TargetId, Target>,
    track_arena: HashMap<TrackId, Track>,
    /// Joint hypotheses, ascending by normalised score.
    pub hypotheses: Vec<ClusterHypothesis>,
    /// Sets of live tracks that share a provisionally multi-assigned report.
    pub ambiguous_tracks: Vec<HashSet<TrackId>>,
    /// Reports staged for this cluster by the tracker's routing phase.
    pub assigned_reports: Vec<Report>,
    /// Set when a scan update failed and the cluster kept its prior state.
    pub tainted: bool,
}

impl Cluster {
    /// Cluster with no targets and the single empty parent hypothesis.
    pub fn empty(params: ClusterParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            params,
            targets: Vec::new(),
            target_arena: HashMap::new(),
            track_arena: HashMap::new(),
            hypotheses: vec![ClusterHypothesis {
                tracks: Vec::new(),
                targets: Vec::new(),
                total_score: 0.0,
            }],
            ambiguous_tracks: Vec::new(),
            assigned_reports: Vec::new(),
            tainted: false,
        }
    }

    /// Cluster seeded with one confirmed target per filter.
    pub fn initial(params: ClusterParams, filters: Vec<Box<dyn TargetFilter>>) -> Self {
        let mut cluster = Cluster::empty(params);
        let mut roots = Vec::new();
        for filter in filters {
            let target_id = Uuid::new_v4();
            let track = Track::initial(target_id, filter);
            let mut target = Target::new(target_id);
            target.tracks.push(track.id);
            roots.push(track.id);
            cluster.track_arena.insert(track.id, track);
            cluster.target_arena.insert(target_id, target);
            cluster.targets.push(target_id);
        }
        cluster.hypotheses = vec![ClusterHypothesis::initial(roots, &cluster.track_arena)];
        cluster.normalise();
        cluster
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.track_arena.get(&id)
    }

    pub fn target(&self, id: TargetId) -> Option<&Target> {
        self.target_arena.get(&id)
    }

    /// Leaf tracks referenced by the member targets.
    pub fn live_tracks(&self) -> impl Iterator<Item = &Track> + '_ {
        self.targets
            .iter()
            .filter_map(move |id| self.target_arena.get(id))
            .flat_map(|target| target.tracks.iter())
            .filter_map(move |id| self.track_arena.get(id))
    }

    /// Head of the ordered hypothesis list.
    pub fn best_hypothesis(&self) -> Option<&ClusterHypothesis> {
        self.hypotheses.first()
    }

    /// Union of the live tracks' position uncertainty boxes.
    pub fn bbox(&self) -> Option<Rect> {
        self.live_tracks()
            .map(|track| track.filter.bbox())
            .reduce(|a, b| a.union(&b))
    }

    /// Whether any live track's uncertainty box overlaps the report's.
    pub fn matches_report(&self, report_bbox: &Rect) -> bool {
        self.live_tracks().any(|track| track.filter.bbox().overlaps(report_bbox))
    }

    /// Advance every live posterior by `dt`.
    pub fn predict(&mut self, dt: f64) {
        let ids: Vec<TrackId> = self
            .targets
            .iter()
            .filter_map(|id| self.target_arena.get(id))
            .flat_map(|target| target.tracks.iter().copied())
            .collect();
        for id in ids {
            if let Some(track) = self.track_arena.get_mut(&id) {
                track.predict(dt);
            }
        }
    }

    /// Shift hypothesis scores so that `Σ exp(−score) = 1`.
    pub fn normalise(&mut self) {
        let Some(min) = self
            .hypotheses
            .iter()
            .map(|h| h.total_score)
            .reduce(f64::min)
        else {
            return;
        };
        let sum: f64 = self
            .hypotheses
            .iter()
            .map(|h| (min - h.total_score).exp())
            .sum();
        let shift = sum.ln() - min;
        for hypothesis in &mut self.hypotheses {
            hypothesis.total_score += shift;
        }
    }

    /// Ingest one sensor's reports: enumerate up to `k_max` joint hypotheses
    /// in cost order, then refresh ambiguity sets and prune dead lineages.
    pub fn register_scan(&mut self, scan: &Scan) -> Result<(), MhtError> {
        let parents: Vec<ParentHyp> = self
            .hypotheses
            .iter()
            .map(|h| ParentHyp { score: h.total_score, tracks: h.tracks.clone() })
            .collect();

        let mut new_hypotheses: Vec<ClusterHypothesis> = Vec::new();
        let mut seen: HashSet<Vec<TrackId>> = HashSet::new();
        let mut new_target_tracks: HashMap<ReportId, TrackId> = HashMap::new();
        let mut report_tracks: HashMap<ReportId, HashSet<TrackId>> = HashMap::new();

        let mut heap: BinaryHeap<Reverse<PendingStream>> = BinaryHeap::new();
        let mut seq = 0u64;
        let mut next_parent = 0usize;
        let mut upcoming = self.open_next(&parents, &mut next_parent, scan)?;
        if let Some((parent, draws, cost)) = upcoming.take() {
            if let Ok(cost) = NotNan::new(cost) {
                heap.push(Reverse(PendingStream { cost, seq, parent, draws }));
                seq += 1;
            }
        }
        upcoming = self.open_next(&parents, &mut next_parent, scan)?;

        let mut drawn = 0usize;
        let mut norm_min: Option<f64> = None;
        let mut norm_sum = 0.0f64;

        'outer: while let Some(Reverse(mut stream)) = heap.pop() {
            let next_break = match (
                upcoming.as_ref().map(|(_, _, cost)| *cost),
                heap.peek().map(|Reverse(s)| s.cost.into_inner()),
            ) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => f64::INFINITY,
            };

            while let Some((cost, columns)) = stream.draws.next() {
                drawn += 1;
                let min = *norm_min.get_or_insert(cost);
                norm_sum += (min - cost).exp();
                let shift = norm_sum.ln() - min;
                if cost + shift > self.params.hp_limit {
                    trace!(cost, "hypothesis enumeration cut off by tail-probability limit");
                    break 'outer;
                }

                let built = self.build_hypothesis(
                    &parents[stream.parent],
                    &columns,
                    scan,
                    &mut new_target_tracks,
                    &mut report_tracks,
                )?;
                if let Some(hypothesis) = built {
                    if seen.insert(hypothesis.tracks.clone()) {
                        new_hypotheses.push(hypothesis);
                    }
                }
                if drawn >= self.params.k_max {
                    break 'outer;
                }

                match stream.draws.peek_cost() {
                    None => break,
                    Some(next_cost) if next_cost > next_break => {
                        if let Ok(cost) = NotNan::new(next_cost) {
                            stream.cost = cost;
                            stream.seq = seq;
                            seq += 1;
                            heap.push(Reverse(stream));
                        }
                        break;
                    }
                    Some(_) => {}
                }
            }

            // Admit the next parent stream once nothing pending is cheaper.
            if let Some((parent, draws, cost)) = upcoming.take() {
                let cheaper_pending = heap
                    .peek()
                    .is_some_and(|Reverse(s)| s.cost.into_inner() <= cost);
                if cheaper_pending {
                    upcoming = Some((parent, draws, cost));
                } else {
                    if let Ok(cost) = NotNan::new(cost) {
                        heap.push(Reverse(PendingStream { cost, seq, parent, draws }));
                        seq += 1;
                    }
                    upcoming = self.open_next(&parents, &mut next_parent, scan)?;
                }
            }
        }

        if new_hypotheses.is_empty() {
            warn!(cluster = %self.id, error = %MhtError::EmptyStream, "emptying cluster");
            self.hypotheses.clear();
            self.targets.clear();
            self.target_arena.clear();
            self.track_arena.clear();
            self.ambiguous_tracks.clear();
            return Ok(());
        }

        new_hypotheses.sort_by(|a, b| {
            a.total_score
                .partial_cmp(&b.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.hypotheses = new_hypotheses;
        self.normalise();

        let live: HashSet<TrackId> = self
            .hypotheses
            .iter()
            .flat_map(|h| h.tracks.iter().copied())
            .collect();
        self.refresh_ambiguities(&live, &report_tracks);
        self.finalize_assignments(&live);
        Ok(())
    }

    /// Open the draw stream for the next parent hypothesis, if any remain.
    fn open_next(
        &self,
        parents: &[ParentHyp],
        next_parent: &mut usize,
        scan: &Scan,
    ) -> Result<Option<(usize, Draws, f64)>, MhtError> {
        while *next_parent < parents.len() {
            let index = *next_parent;
            *next_parent += 1;
            let draws = self.open_draws(&parents[index], scan)?;
            if let Some(cost) = draws.peek_cost() {
                return Ok(Some((index, draws, cost)));
            }
        }
        Ok(None)
    }

    /// Build the parent's cost matrix and wrap its Murty stream.
    ///
    /// Layout is `M × (N + M)`: matching block, then a diagonal extraneous
    /// block pricing each report as false alarm or new entrant. Misses are
    /// charged additively through `miss_all`, which `match_score` already
    /// discounts per assigned track.
    fn open_draws(&self, parent: &ParentHyp, scan: &Scan) -> Result<Draws, MhtError> {
        let sensor = scan.sensor.as_ref();
        let m = scan.reports.len();
        let n = parent.tracks.len();
        let miss_all: f64 = parent
            .tracks
            .iter()
            .filter_map(|id| self.track_arena.get(id))
            .map(|track| track.miss_score(sensor))
            .sum();
        let base = parent.score + miss_all;

        if m == 0 {
            return Ok(Draws::new(Box::new(std::iter::once((base, Vec::new())))));
        }

        let mut cost = DMatrix::from_element(m, n + m, LARGE);
        for (j, id) in parent.tracks.iter().enumerate() {
            if let Some(track) = self.track_arena.get(id) {
                for (i, report) in scan.reports.iter().enumerate() {
                    cost[(i, j)] = track.match_score(report, sensor, self.params.nll_limit)?;
                }
            }
        }
        for i in 0..m {
            cost[(i, n + i)] = sensor.score_extraneous();
        }

        let murty = Murty::new(cost)?;
        Ok(Draws::new(Box::new(
            murty.map(move |(cost, assignment)| (base + cost, assignment)),
        )))
    }

    /// Materialise one drawn assignment into a cluster hypothesis.
    fn build_hypothesis(
        &mut self,
        parent: &ParentHyp,
        columns: &[usize],
        scan: &Scan,
        new_target_tracks: &mut HashMap<ReportId, TrackId>,
        report_tracks: &mut HashMap<ReportId, HashSet<TrackId>>,
    ) -> Result<Option<ClusterHypothesis>, MhtError> {
        let sensor = scan.sensor.as_ref();
        let n = parent.tracks.len();
        let mut tracks: Vec<TrackId> = Vec::with_capacity(columns.len() + n);
        let mut assigned: HashSet<TrackId> = HashSet::new();

        for (i, report) in scan.reports.iter().enumerate() {
            let column = columns[i];
            let child = if column < n {
                let parent_track = parent.tracks[column];
                assigned.insert(parent_track);
                self.assign_track(parent_track, report, sensor)?
            } else {
                self.report_target_track(report, sensor, new_target_tracks)
            };
            report_tracks.entry(report.id).or_default().insert(child);
            tracks.push(child);
        }

        for &parent_track in &parent.tracks {
            if assigned.contains(&parent_track) {
                continue;
            }
            let Some(track) = self.track_arena.get(&parent_track) else { continue };
            if track.exist_score > 1 {
                tracks.push(self.missed_track(parent_track, sensor));
            }
        }

        if tracks.is_empty() {
            return Ok(None);
        }
        Ok(Some(ClusterHypothesis::initial(tracks, &self.track_arena)))
    }

    /// Extension child for `(parent, report)`, created once and shared.
    fn assign_track(
        &mut self,
        parent_id: TrackId,
        report: &Report,
        sensor: &dyn Sensor,
    ) -> Result<TrackId, MhtError> {
        if let Some(&child) = self.track_arena[&parent_id].children.get(&Some(report.id)) {
            return Ok(child);
        }
        let child = Track::extend(
            &self.track_arena[&parent_id],
            report,
            sensor,
            self.params.init_target_tracker.as_ref(),
        )?;
        let child_id = child.id;
        let target_id = child.target;
        self.track_arena.insert(child_id, child);
        if let Some(parent) = self.track_arena.get_mut(&parent_id) {
            parent.children.insert(Some(report.id), child_id);
        }
        if let Some(target) = self.target_arena.get_mut(&target_id) {
            target.new_tracks.insert(report.id, child_id);
        }
        Ok(child_id)
    }

    /// Missed-detection child, unique per parent.
    fn missed_track(&mut self, parent_id: TrackId, sensor: &dyn Sensor) -> TrackId {
        if let Some(&child) = self.track_arena[&parent_id].children.get(&None) {
            return child;
        }
        let child = Track::missed(&self.track_arena[&parent_id], sensor);
        let child_id = child.id;
        self.track_arena.insert(child_id, child);
        if let Some(parent) = self.track_arena.get_mut(&parent_id) {
            parent.children.insert(None, child_id);
        }
        child_id
    }

    /// New-target track for an extraneous report, one per report per scan so
    /// every parent hypothesis spawns the same target.
    fn report_target_track(
        &mut self,
        report: &Report,
        sensor: &dyn Sensor,
        cache: &mut HashMap<ReportId, TrackId>,
    ) -> TrackId {
        if let Some(&track) = cache.get(&report.id) {
            return track;
        }
        let target_id = Uuid::new_v4();
        let filter = self.params.init_target_tracker.init(report, None);
        let track = Track::new_target(target_id, filter, sensor, report);
        let track_id = track.id;
        let mut target = Target::new(target_id);
        target.new_tracks.insert(report.id, track_id);
        self.track_arena.insert(track_id, track);
        self.target_arena.insert(target_id, target);
        self.targets.push(target_id);
        cache.insert(report.id, track_id);
        track_id
    }

    /// Carry prior ambiguity sets onto this scan's children and record the
    /// reports that ended up claimed by more than one track.
    fn refresh_ambiguities(
        &mut self,
        live: &HashSet<TrackId>,
        report_tracks: &HashMap<ReportId, HashSet<TrackId>>,
    ) {
        let mut ambiguous: Vec<HashSet<TrackId>> = Vec::new();
        for set in &self.ambiguous_tracks {
            let next: HashSet<TrackId> = set
                .iter()
                .filter_map(|id| self.track_arena.get(id))
                .flat_map(|track| track.children.values().copied())
                .filter(|id| live.contains(id))
                .collect();
            if next.len() >= 2 {
                ambiguous.push(next);
            }
        }
        for tracks in report_tracks.values() {
            let set: HashSet<TrackId> = tracks.intersection(live).copied().collect();
            if set.len() >= 2 {
                ambiguous.push(set);
            }
        }
        self.ambiguous_tracks = ambiguous;
    }

    /// Prune every target to its surviving leaves and drop dead lineages.
    fn finalize_assignments(&mut self, live: &HashSet<TrackId>) {
        let mut survivors: HashMap<TargetId, Vec<TrackId>> = HashMap::new();
        for hypothesis in &self.hypotheses {
            for &track_id in &hypothesis.tracks {
                let Some(track) = self.track_arena.get(&track_id) else { continue };
                let entry = survivors.entry(track.target).or_default();
                if !entry.contains(&track_id) {
                    entry.push(track_id);
                }
            }
        }
        self.targets.retain(|id| survivors.contains_key(id));
        self.target_arena.retain(|id, _| survivors.contains_key(id));
        for (target_id, tracks) in survivors {
            if let Some(target) = self.target_arena.get_mut(&target_id) {
                target.finalize_assignment(tracks);
            }
        }
        self.track_arena.retain(|id, _| live.contains(id));
    }

    /// Partition the targets by ambiguity connectivity and spin each
    /// component off into its own cluster. Returns `vec![self]` when the
    /// group is still fully entangled (or trivially small).
    pub fn split(mut self) -> Vec<Cluster> {
        if self.targets.len() <= 1 {
            return vec![self];
        }
        let index: HashMap<TargetId, usize> = self
            .targets
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        let mut components: Vec<usize> = (0..self.targets.len()).collect();
        for set in &self.ambiguous_tracks {
            let mut members = set
                .iter()
                .filter_map(|id| self.track_arena.get(id))
                .filter_map(|track| index.get(&track.target).copied());
            let Some(first) = members.next() else { continue };
            let root = find(&mut components, first);
            for member in members {
                let other = find(&mut components, member);
                let (low, high) = if root <= other { (root, other) } else { (other, root) };
                components[high] = low;
            }
        }

        let mut groups: Vec<Vec<TargetId>> = Vec::new();
        let mut group_of: HashMap<usize, usize> = HashMap::new();
        for (i, &target) in self.targets.iter().enumerate() {
            let root = find(&mut components, i);
            let group = *group_of.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[group].push(target);
        }
        if groups.len() <= 1 {
            return vec![self];
        }
        debug!(cluster = %self.id, daughters = groups.len(), "splitting cluster");

        let mut daughters = Vec::new();
        for group in groups {
            let members: HashSet<TargetId> = group.iter().copied().collect();
            let mut daughter = Cluster::empty(self.params.clone());
            daughter.hypotheses.clear();
            daughter.targets = group;
            for id in &daughter.targets {
                if let Some(target) = self.target_arena.remove(id) {
                    daughter.target_arena.insert(*id, target);
                }
            }
            let track_ids: Vec<TrackId> = self
                .track_arena
                .iter()
                .filter(|(_, track)| members.contains(&track.target))
                .map(|(&id, _)| id)
                .collect();
            for id in track_ids {
                if let Some(track) = self.track_arena.remove(&id) {
                    daughter.track_arena.insert(id, track);
                }
            }

            let mut seen: HashSet<Vec<TrackId>> = HashSet::new();
            for hypothesis in &self.hypotheses {
                let Some(projected) =
                    hypothesis.split(&|t| members.contains(&t), &daughter.track_arena)
                else {
                    continue;
                };
                if seen.insert(projected.tracks.clone()) {
                    daughter.hypotheses.push(projected);
                }
            }
            daughter.hypotheses.sort_by(|a, b| {
                a.total_score
                    .partial_cmp(&b.total_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            daughter.normalise();

            daughter.ambiguous_tracks = self
                .ambiguous_tracks
                .iter()
                .filter(|set| {
                    set.iter().any(|id| daughter.track_arena.contains_key(id))
                })
                .cloned()
                .collect();
            daughters.push(daughter);
        }
        daughters
    }

    /// Fuse clusters entangled by a shared report: hypotheses become the
    /// k-best cross-products of the members' hypothesis lists.
    pub fn merge(params: ClusterParams, clusters: Vec<Cluster>) -> Cluster {
        let k_max = params.k_max;
        let mut merged = Cluster::empty(params);
        merged.hypotheses.clear();

        let mut hyp_lists: Vec<Vec<ClusterHypothesis>> = Vec::new();
        for mut cluster in clusters {
            merged.targets.append(&mut cluster.targets);
            merged.target_arena.extend(cluster.target_arena.drain());
            merged.track_arena.extend(cluster.track_arena.drain());
            merged.ambiguous_tracks.append(&mut cluster.ambiguous_tracks);
            merged.assigned_reports.append(&mut cluster.assigned_reports);
            hyp_lists.push(std::mem::take(&mut cluster.hypotheses));
        }

        let lists: Vec<Vec<(f64, usize)>> = hyp_lists
            .iter()
            .map(|hyps| {
                hyps.iter()
                    .enumerate()
                    .map(|(i, h)| (h.total_score, i))
                    .collect()
            })
            .collect();
        for (_, picks) in PermGen::presorted(lists).take(k_max) {
            let parts: Vec<&ClusterHypothesis> = picks
                .iter()
                .enumerate()
                .map(|(cluster_index, &hyp_index)| &hyp_lists[cluster_index][hyp_index])
                .collect();
            merged.hypotheses.push(ClusterHypothesis::merge(&parts));
        }
        merged.normalise();
        debug!(cluster = %merged.id, targets = merged.targets.len(), "merged clusters");
        merged
    }
}

fn find(components: &mut [usize], mut i: usize) -> usize {
    while components[i] != i {
        components[i] = components[components[i]];
        i = components[i];
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::KalmanFilter;
    use crate::models::{constant_velocity_2d, position_measurement};
    use crate::scan::IdealSensor;
    use crate::track::{MAX_EXIST_SCORE, NEW_EXIST_SCORE};
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    fn filter_at(x: f64, y: f64) -> Box<dyn TargetFilter> {
        Box::new(KalmanFilter::new(
            constant_velocity_2d(0.1),
            DVector::from_vec(vec![x, y, 0.0, 0.0]),
            DMatrix::identity(4, 4),
        ))
    }

    fn report_at(x: f64, y: f64) -> Report {
        Report::new(
            DVector::from_vec(vec![x, y]),
            DMatrix::identity(2, 2) * 0.1,
            position_measurement,
        )
    }

    fn scan(reports: Vec<Report>) -> Scan {
        Scan::new(Arc::new(IdealSensor::new(10.0, 3.0)), reports)
    }

    fn assert_normalised(cluster: &Cluster) {
        let total: f64 = cluster
            .hypotheses
            .iter()
            .map(|h| (-h.total_score).exp())
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_initial_cluster() {
        let cluster = Cluster::initial(
            ClusterParams::default(),
            vec![filter_at(0.0, 0.0), filter_at(0.0, 10.0)],
        );
        assert_eq!(cluster.targets.len(), 2);
        assert_eq!(cluster.hypotheses.len(), 1);
        assert_eq!(cluster.hypotheses[0].tracks.len(), 2);
        assert_normalised(&cluster);
    }

    #[test]
    fn test_register_scan_extends_tracks() {
        let mut cluster = Cluster::initial(
            ClusterParams::default(),
            vec![filter_at(0.0, 0.0), filter_at(0.0, 10.0)],
        );
        cluster
            .register_scan(&scan(vec![report_at(0.1, 0.1), report_at(0.1, 9.9)]))
            .unwrap();

        assert!(!cluster.hypotheses.is_empty());
        assert_normalised(&cluster);
        // Best explanation keeps both targets on their measurements
        let best = cluster.best_hypothesis().unwrap();
        assert_eq!(best.targets.len(), 2);
        // Ordering invariant
        for pair in cluster.hypotheses.windows(2) {
            assert!(pair[0].total_score <= pair[1].total_score + 1e-9);
        }
    }

    #[test]
    fn test_register_scan_respects_k_max() {
        let params = ClusterParams { k_max: 3, ..Default::default() };
        let mut cluster =
            Cluster::initial(params, vec![filter_at(0.0, 0.0), filter_at(0.0, 2.0)]);
        cluster
            .register_scan(&scan(vec![report_at(0.0, 0.5), report_at(0.0, 1.5)]))
            .unwrap();
        assert!(cluster.hypotheses.len() <= 3);
    }

    #[test]
    fn test_empty_scan_yields_one_hypothesis_per_parent() {
        let mut cluster = Cluster::initial(
            ClusterParams::default(),
            vec![filter_at(0.0, 0.0), filter_at(0.0, 10.0)],
        );
        cluster.register_scan(&scan(vec![])).unwrap();

        assert_eq!(cluster.hypotheses.len(), 1);
        assert_eq!(cluster.targets.len(), 2);
        // Both survivors are missed-detection children that aged by one
        for track in cluster.live_tracks() {
            assert_eq!(track.exist_score, MAX_EXIST_SCORE - 1);
            assert!(track.report.is_none());
        }
    }

    #[test]
    fn test_new_target_from_extraneous_report() {
        let mut cluster = Cluster::empty(ClusterParams::default());
        cluster.register_scan(&scan(vec![report_at(5.0, 5.0)])).unwrap();

        assert_eq!(cluster.targets.len(), 1);
        assert_eq!(cluster.hypotheses.len(), 1);
        let track = cluster.live_tracks().next().unwrap();
        assert_eq!(track.exist_score, NEW_EXIST_SCORE);
        assert_relative_eq!(track.filter.state()[0], 5.0);
    }

    #[test]
    fn test_track_ageing_drops_unconfirmed_target() {
        let mut cluster = Cluster::empty(ClusterParams::default());
        // Born with exist_score 1...
        cluster.register_scan(&scan(vec![report_at(5.0, 5.0)])).unwrap();
        // ...confirmed once, exist_score 2 in the best hypothesis (a runner-up
        // hypothesis explains the second report as yet another new target)
        cluster.register_scan(&scan(vec![report_at(5.0, 5.0)])).unwrap();
        let best = cluster.best_hypothesis().unwrap().clone();
        assert_eq!(best.tracks.len(), 1);
        assert_eq!(cluster.track(best.tracks[0]).unwrap().exist_score, 2);

        // First silent scan: only the confirmed lineage is carried, aged to 1
        cluster.register_scan(&scan(vec![])).unwrap();
        assert_eq!(cluster.targets.len(), 1);
        assert_eq!(cluster.live_tracks().next().unwrap().exist_score, 1);

        // Second silent scan: exist_score 1 is no longer carried
        cluster.register_scan(&scan(vec![])).unwrap();
        assert!(cluster.targets.is_empty());
        assert!(cluster.hypotheses.is_empty());
    }

    #[test]
    fn test_ambiguous_report_recorded() {
        // Two close targets fighting over one report
        let mut cluster = Cluster::initial(
            ClusterParams::default(),
            vec![filter_at(0.0, 0.0), filter_at(0.0, 1.0)],
        );
        cluster.register_scan(&scan(vec![report_at(0.0, 0.5)])).unwrap();
        assert!(
            !cluster.ambiguous_tracks.is_empty(),
            "a report claimed by both targets must be flagged ambiguous"
        );
    }

    #[test]
    fn test_split_by_ambiguity_components() {
        let mut cluster = Cluster::initial(
            ClusterParams::default(),
            vec![filter_at(0.0, 0.0), filter_at(0.0, 1.0), filter_at(50.0, 50.0)],
        );
        let t0 = cluster.targets[0];
        let t1 = cluster.targets[1];
        let t2 = cluster.targets[2];
        let entangled: HashSet<TrackId> = cluster
            .live_tracks()
            .filter(|track| track.target == t0 || track.target == t1)
            .map(|track| track.id)
            .collect();
        cluster.ambiguous_tracks = vec![entangled];

        let daughters = cluster.split();
        assert_eq!(daughters.len(), 2);
        assert_eq!(daughters[0].targets, vec![t0, t1]);
        assert_eq!(daughters[1].targets, vec![t2]);
        for daughter in &daughters {
            assert_eq!(daughter.hypotheses.len(), 1);
            assert_normalised(daughter);
        }
    }

    #[test]
    fn test_fully_entangled_cluster_does_not_split() {
        let mut cluster = Cluster::initial(
            ClusterParams::default(),
            vec![filter_at(0.0, 0.0), filter_at(0.0, 1.0)],
        );
        let all: HashSet<TrackId> = cluster.live_tracks().map(|t| t.id).collect();
        cluster.ambiguous_tracks = vec![all];
        let out = cluster.split();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].targets.len(), 2);
    }

    #[test]
    fn test_split_then_merge_round_trip() {
        let mut cluster = Cluster::initial(
            ClusterParams::default(),
            vec![filter_at(0.0, 0.0), filter_at(0.0, 1.0), filter_at(50.0, 50.0)],
        );
        let expected: HashSet<TargetId> = cluster.targets.iter().copied().collect();
        let t0 = cluster.targets[0];
        let t1 = cluster.targets[1];
        let entangled: HashSet<TrackId> = cluster
            .live_tracks()
            .filter(|track| track.target == t0 || track.target == t1)
            .map(|track| track.id)
            .collect();
        cluster.ambiguous_tracks = vec![entangled];
        let params = cluster.params.clone();

        let daughters = cluster.split();
        let merged = Cluster::merge(params, daughters);

        let rejoined: HashSet<TargetId> = merged.targets.iter().copied().collect();
        assert_eq!(rejoined, expected);
        assert_eq!(merged.hypotheses.len(), 1);
        assert_eq!(merged.hypotheses[0].tracks.len(), 3);
        assert_normalised(&merged);
    }

    #[test]
    fn test_merge_ranks_cross_products() {
        let a = Cluster::initial(ClusterParams::default(), vec![filter_at(0.0, 0.0)]);
        let b = Cluster::initial(ClusterParams::default(), vec![filter_at(9.0, 9.0)]);
        let merged = Cluster::merge(ClusterParams::default(), vec![a, b]);

        assert_eq!(merged.targets.len(), 2);
        assert_eq!(merged.hypotheses.len(), 1);
        for pair in merged.hypotheses.windows(2) {
            assert!(pair[0].total_score <= pair[1].total_score + 1e-9);
        }
        assert_normalised(&merged);
    }

    #[test]
    fn test_shared_extension_across_parent_hypotheses() {
        // Force several parent hypotheses, then check the (parent, report)
        // child cache kept the tree small on the next scan.
        let mut cluster = Cluster::initial(
            ClusterParams::default(),
            vec![filter_at(0.0, 0.0), filter_at(0.0, 1.5)],
        );
        cluster.register_scan(&scan(vec![report_at(0.0, 0.7)])).unwrap();
        assert!(cluster.hypotheses.len() > 1);

        cluster.register_scan(&scan(vec![report_at(0.0, 0.8)])).unwrap();
        // Each surviving track appears exactly once in the arena
        let live: Vec<TrackId> = cluster
            .hypotheses
            .iter()
            .flat_map(|h| h.tracks.iter().copied())
            .collect();
        for id in live {
            assert!(cluster.track(id).is_some());
        }
        assert_normalised(&cluster);
    }
}
