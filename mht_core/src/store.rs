//! Cluster storage.
//!
//! The in-memory map is the authoritative, single-writer store; alongside it
//! sits a bbox table answering spatial queries. When opened with a path, the
//! store also mirrors serialised cluster snapshots into a sled tree keyed by
//! cluster id, so external readers can pre-load state between scans.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;
use crate::error::MhtError;
use crate::geometry::Rect;
use crate::{ClusterId, TargetId, TrackId};

/// Serialised view of one track, carried in cluster snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub target: TargetId,
    pub parent: Option<TrackId>,
    pub state: Vec<f64>,
    pub bbox: Rect,
    pub score: f64,
    pub exist_score: u8,
    pub trlen: u32,
}

/// Serialised view of one cluster, the sled payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub id: ClusterId,
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub targets: Vec<TargetId>,
    pub tracks: Vec<TrackSnapshot>,
    /// `(normalised score, track ids)` per hypothesis, ascending.
    pub hypotheses: Vec<(f64, Vec<TrackId>)>,
}

impl ClusterSnapshot {
    fn of(cluster: &Cluster) -> Self {
        let bbox = cluster.bbox().unwrap_or(Rect::new(0.0, 0.0, 0.0, 0.0));
        let tracks = cluster
            .live_tracks()
            .map(|track| TrackSnapshot {
                id: track.id,
                target: track.target,
                parent: track.parent,
                state: track.filter.state().iter().copied().collect(),
                bbox: track.filter.bbox(),
                score: track.score(),
                exist_score: track.exist_score,
                trlen: track.trlen,
            })
            .collect();
        ClusterSnapshot {
            id: cluster.id,
            min_x: bbox.min_x,
            max_x: bbox.max_x,
            min_y: bbox.min_y,
            max_y: bbox.max_y,
            targets: cluster.targets.clone(),
            tracks,
            hypotheses: cluster
                .hypotheses
                .iter()
                .map(|h| (h.total_score, h.tracks.clone()))
                .collect(),
        }
    }
}

/// Single-writer cluster store with a bbox index and an optional sled mirror.
pub struct ClusterStore {
    clusters: HashMap<ClusterId, Cluster>,
    /// Insertion order, kept for deterministic iteration.
    order: Vec<ClusterId>,
    bboxes: HashMap<ClusterId, Option<Rect>>,
    db: Option<sled::Db>,
}

impl ClusterStore {
    /// Purely in-memory store.
    pub fn in_memory() -> Self {
        Self { clusters: HashMap::new(), order: Vec::new(), bboxes: HashMap::new(), db: None }
    }

    /// Store mirroring snapshots into a sled database at `path`.
    pub fn open(path: &Path) -> Result<Self, MhtError> {
        let db = sled::open(path)?;
        Ok(Self {
            clusters: HashMap::new(),
            order: Vec::new(),
            bboxes: HashMap::new(),
            db: Some(db),
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(&id)
    }

    pub fn get_mut(&mut self, id: ClusterId) -> Option<&mut Cluster> {
        self.clusters.get_mut(&id)
    }

    /// Insert or replace a cluster, refreshing its bbox and mirror entry.
    pub fn insert(&mut self, cluster: Cluster) -> Result<ClusterId, MhtError> {
        let id = cluster.id;
        self.bboxes.insert(id, cluster.bbox());
        if !self.clusters.contains_key(&id) {
            self.order.push(id);
        }
        self.mirror(&cluster)?;
        self.clusters.insert(id, cluster);
        Ok(id)
    }

    /// Remove a cluster from the store and the mirror. Also clears the index
    /// entries of a cluster currently detached for mutation.
    pub fn remove(&mut self, id: ClusterId) -> Result<Option<Cluster>, MhtError> {
        let cluster = self.clusters.remove(&id);
        self.order.retain(|&other| other != id);
        self.bboxes.remove(&id);
        if let Some(db) = &self.db {
            db.remove(id.as_bytes())?;
        }
        Ok(cluster)
    }

    /// Re-serialise a cluster mutated in place.
    pub fn persist(&mut self, id: ClusterId) -> Result<(), MhtError> {
        let Some(cluster) = self.clusters.get(&id) else { return Ok(()) };
        self.bboxes.insert(id, cluster.bbox());
        let snapshot = self.db.is_some().then(|| ClusterSnapshot::of(cluster));
        if let (Some(db), Some(snapshot)) = (&self.db, snapshot) {
            db.insert(id.as_bytes(), serde_json::to_vec(&snapshot)?)?;
        }
        Ok(())
    }

    /// Flush the sled mirror, when one is attached.
    pub fn flush(&self) -> Result<(), MhtError> {
        if let Some(db) = &self.db {
            db.flush()?;
        }
        Ok(())
    }

    /// All cluster ids, in insertion order.
    pub fn ids(&self) -> Vec<ClusterId> {
        self.order.clone()
    }

    /// Ids of clusters whose bbox overlaps the query rectangle.
    pub fn ids_overlapping(&self, query: &Rect) -> Vec<ClusterId> {
        self.order
            .iter()
            .copied()
            .filter(|id| {
                self.bboxes
                    .get(id)
                    .copied()
                    .flatten()
                    .is_some_and(|bbox| bbox.overlaps(query))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cluster> + '_ {
        self.order.iter().filter_map(move |id| self.clusters.get(id))
    }

    /// Detach the given clusters for mutation; reattach with
    /// [`ClusterStore::reattach`].
    pub fn detach(&mut self, ids: &[ClusterId]) -> Vec<Cluster> {
        ids.iter().filter_map(|id| self.clusters.remove(id)).collect()
    }

    /// Put detached clusters back, refreshing bboxes and mirror entries.
    pub fn reattach(&mut self, clusters: Vec<Cluster>) -> Result<(), MhtError> {
        for cluster in clusters {
            let id = cluster.id;
            self.bboxes.insert(id, cluster.bbox());
            self.mirror(&cluster)?;
            self.clusters.insert(id, cluster);
        }
        Ok(())
    }

    fn mirror(&self, cluster: &Cluster) -> Result<(), MhtError> {
        if let Some(db) = &self.db {
            let snapshot = ClusterSnapshot::of(cluster);
            db.insert(cluster.id.as_bytes(), serde_json::to_vec(&snapshot)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterParams;
    use crate::filter::{KalmanFilter, TargetFilter};
    use crate::models::constant_velocity_2d;
    use nalgebra::{DMatrix, DVector};

    fn cluster_at(x: f64, y: f64) -> Cluster {
        let filter: Box<dyn TargetFilter> = Box::new(KalmanFilter::new(
            constant_velocity_2d(0.1),
            DVector::from_vec(vec![x, y, 0.0, 0.0]),
            DMatrix::identity(4, 4),
        ));
        Cluster::initial(ClusterParams::default(), vec![filter])
    }

    #[test]
    fn test_bbox_query() {
        let mut store = ClusterStore::in_memory();
        let near = store.insert(cluster_at(0.0, 0.0)).unwrap();
        let far = store.insert(cluster_at(100.0, 100.0)).unwrap();

        let hits = store.ids_overlapping(&Rect::new(-5.0, 5.0, -5.0, 5.0));
        assert_eq!(hits, vec![near]);

        let all = store.ids_overlapping(&Rect::new(-500.0, 500.0, -500.0, 500.0));
        assert_eq!(all, vec![near, far]);
    }

    #[test]
    fn test_detach_reattach() {
        let mut store = ClusterStore::in_memory();
        let id = store.insert(cluster_at(0.0, 0.0)).unwrap();

        let mut detached = store.detach(&[id]);
        assert!(store.get(id).is_none());
        detached[0].predict(1.0);
        store.reattach(detached).unwrap();
        assert!(store.get(id).is_some());
    }

    #[test]
    fn test_remove() {
        let mut store = ClusterStore::in_memory();
        let id = store.insert(cluster_at(0.0, 0.0)).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.remove(id).unwrap().is_some());
        assert!(store.is_empty());
        assert!(store.ids_overlapping(&Rect::everywhere()).is_empty());
    }

    #[test]
    fn test_sled_mirror_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ClusterStore::open(dir.path()).unwrap();
        let id = store.insert(cluster_at(1.0, 2.0)).unwrap();
        store.flush().unwrap();

        let db = store.db.as_ref().unwrap();
        let bytes = db.get(id.as_bytes()).unwrap().unwrap();
        let snapshot: ClusterSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.tracks.len(), 1);
        assert_eq!(snapshot.tracks[0].state[0], 1.0);
        assert!(snapshot.min_x <= 1.0 && snapshot.max_x >= 1.0);
    }
}
