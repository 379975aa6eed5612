//! Tracker orchestration: scan ingress, cluster routing and global
//! hypotheses.
//!
//! The tracker is the single writer over the cluster store. Per scan the
//! visible order is: route reports (merging clusters a report straddles),
//! update each affected cluster against its sub-scan, split clusters whose
//! ambiguities dissolved, persist. Cluster updates are independent between
//! the merge and split phases and may fan out over a worker pool.

use std::path::Path;
use std::sync::Arc;

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::cluster::{Cluster, ClusterParams};
use crate::error::MhtError;
use crate::filter::TargetFilter;
use crate::geometry::Rect;
use crate::hypgen::PermGen;
use crate::scan::{Scan, Sensor};
use crate::store::ClusterStore;
use crate::{ClusterId, TargetId, TrackId};

/// Resolved view of one track inside a global hypothesis.
#[derive(Debug, Clone)]
pub struct TrackEstimate {
    pub cluster: ClusterId,
    pub target: TargetId,
    pub track: TrackId,
    pub state: DVector<f64>,
    /// 2-sigma box of the position marginal.
    pub bbox: Rect,
    pub score: f64,
    /// Sensor tags that contributed to the lineage.
    pub sources: Vec<usize>,
    /// Lineage length in scans.
    pub length: u32,
}

/// One cluster hypothesis per cluster: a joint explanation of the world.
#[derive(Debug, Clone)]
pub struct GlobalHypothesis {
    pub score: f64,
    /// `(cluster, index into its ordered hypothesis list)` per member.
    pub cluster_hypotheses: Vec<(ClusterId, usize)>,
    pub tracks: Vec<TrackEstimate>,
}

/// Multiple hypothesis tracker over a store of independent clusters.
pub struct Tracker {
    params: ClusterParams,
    store: ClusterStore,
}

impl Tracker {
    pub fn new(params: ClusterParams) -> Self {
        Self { params, store: ClusterStore::in_memory() }
    }

    /// Tracker mirroring cluster snapshots into a sled database at `path`.
    pub fn with_store(params: ClusterParams, path: &Path) -> Result<Self, MhtError> {
        Ok(Self { params, store: ClusterStore::open(path)? })
    }

    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> + '_ {
        self.store.iter()
    }

    pub fn cluster_count(&self) -> usize {
        self.store.len()
    }

    /// Seed the tracker with one cluster per confirmed initial filter.
    pub fn initiate_clusters(
        &mut self,
        filters: Vec<Box<dyn TargetFilter>>,
    ) -> Result<Vec<ClusterId>, MhtError> {
        let mut ids = Vec::with_capacity(filters.len());
        for filter in filters {
            let cluster = Cluster::initial(self.params.clone(), vec![filter]);
            ids.push(self.store.insert(cluster)?);
        }
        Ok(ids)
    }

    /// Advance every cluster (optionally only those overlapping `bbox`) by
    /// `dt`. Clusters are independent, so the work may run in parallel.
    pub fn predict(&mut self, dt: f64, bbox: Option<Rect>) -> Result<(), MhtError> {
        let ids = match bbox {
            Some(query) => self.store.ids_overlapping(&query),
            None => self.store.ids(),
        };
        let mut clusters = self.store.detach(&ids);

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            clusters.par_iter_mut().for_each(|cluster| cluster.predict(dt));
        }
        #[cfg(not(feature = "parallel"))]
        for cluster in clusters.iter_mut() {
            cluster.predict(dt);
        }

        self.store.reattach(clusters)
    }

    /// Register one scan: route reports to clusters (merging where a report
    /// straddles several), update each affected cluster, split, persist.
    ///
    /// A cluster whose update fails keeps its pre-scan state and is marked
    /// tainted; the remaining clusters proceed and the failure is reported
    /// at this boundary.
    pub fn register_scan(&mut self, scan: Scan) -> Result<(), MhtError> {
        let Scan { sensor, reports } = scan;
        let mut affected = self.store.ids_overlapping(&sensor.bbox());
        debug!(reports = reports.len(), clusters = affected.len(), "registering scan");

        // Routing phase: stage each report on exactly one cluster.
        for report in reports {
            let hits: Vec<ClusterId> = affected
                .iter()
                .copied()
                .filter(|&id| {
                    self.store
                        .get(id)
                        .is_some_and(|cluster| cluster.matches_report(&report.bbox))
                })
                .collect();
            let destination = match hits.len() {
                0 => {
                    let id = self.store.insert(Cluster::empty(self.params.clone()))?;
                    affected.push(id);
                    id
                }
                1 => hits[0],
                _ => {
                    let mut members = Vec::with_capacity(hits.len());
                    for id in &hits {
                        if let Some(cluster) = self.store.remove(*id)? {
                            members.push(cluster);
                        }
                        affected.retain(|other| other != id);
                    }
                    let merged = Cluster::merge(self.params.clone(), members);
                    let id = self.store.insert(merged)?;
                    affected.push(id);
                    id
                }
            };
            if let Some(cluster) = self.store.get_mut(destination) {
                cluster.assigned_reports.push(report);
            }
        }

        // Update phase: clusters are pairwise independent here.
        let mut clusters = self.store.detach(&affected);
        let total = clusters.len();

        #[cfg(feature = "parallel")]
        let errors: Vec<Option<MhtError>> = {
            use rayon::prelude::*;
            clusters
                .par_iter_mut()
                .map(|cluster| update_cluster(cluster, &sensor))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let errors: Vec<Option<MhtError>> = clusters
            .iter_mut()
            .map(|cluster| update_cluster(cluster, &sensor))
            .collect();

        // Split phase and persistence.
        let mut failed = 0usize;
        for (cluster, error) in clusters.into_iter().zip(errors) {
            let origin = cluster.id;
            self.store.remove(origin)?;
            if error.is_some() {
                failed += 1;
                self.store.insert(cluster)?;
                continue;
            }
            if cluster.targets.is_empty() {
                debug!(cluster = %origin, "deleting dead cluster");
                continue;
            }
            for daughter in cluster.split() {
                self.store.insert(daughter)?;
            }
        }
        self.store.flush()?;

        if failed > 0 {
            Err(MhtError::TaintedClusters { failed, total })
        } else {
            Ok(())
        }
    }

    /// Ranked joint explanations across clusters (optionally restricted to
    /// those overlapping `bbox`), lazily enumerated in score order.
    pub fn global_hypotheses(
        &self,
        bbox: Option<Rect>,
    ) -> impl Iterator<Item = GlobalHypothesis> + '_ {
        let ids = match bbox {
            Some(query) => self.store.ids_overlapping(&query),
            None => self.store.ids(),
        };
        let lists: Vec<Vec<(f64, (ClusterId, usize))>> = ids
            .iter()
            .map(|&cluster_id| {
                self.store
                    .get(cluster_id)
                    .map(|cluster| {
                        cluster
                            .hypotheses
                            .iter()
                            .enumerate()
                            .map(|(i, h)| (h.total_score, (cluster_id, i)))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();
        PermGen::presorted(lists).map(move |(score, picks)| self.resolve(score, picks))
    }

    /// Top-ranked global hypothesis.
    pub fn best_global_hypothesis(&self, bbox: Option<Rect>) -> Option<GlobalHypothesis> {
        self.global_hypotheses(bbox).next()
    }

    fn resolve(&self, score: f64, picks: Vec<(ClusterId, usize)>) -> GlobalHypothesis {
        let mut tracks = Vec::new();
        for &(cluster_id, hyp_index) in &picks {
            let Some(cluster) = self.store.get(cluster_id) else { continue };
            let Some(hypothesis) = cluster.hypotheses.get(hyp_index) else { continue };
            for &track_id in &hypothesis.tracks {
                let Some(track) = cluster.track(track_id) else { continue };
                let mut sources: Vec<usize> = track.sources.iter().copied().collect();
                sources.sort_unstable();
                tracks.push(TrackEstimate {
                    cluster: cluster_id,
                    target: track.target,
                    track: track_id,
                    state: track.filter.state(),
                    bbox: track.filter.bbox(),
                    score: track.score(),
                    sources,
                    length: track.trlen,
                });
            }
        }
        GlobalHypothesis { score, cluster_hypotheses: picks, tracks }
    }
}

/// Update one detached cluster against its staged sub-scan, restoring the
/// prior state on failure.
fn update_cluster(cluster: &mut Cluster, sensor: &Arc<dyn Sensor>) -> Option<MhtError> {
    let reports = std::mem::take(&mut cluster.assigned_reports);
    let sub_scan = Scan::new(sensor.clone(), reports);
    let backup = cluster.clone();
    match cluster.register_scan(&sub_scan) {
        Ok(()) => None,
        Err(error) => {
            *cluster = backup;
            cluster.tainted = true;
            warn!(cluster = %cluster.id, error = %error, "cluster update failed; keeping prior state");
            Some(error)
        }
    }
}
