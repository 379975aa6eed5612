//! Axis-aligned bounding boxes and Gaussian extent helpers.
//!
//! Everything spatial in the engine reduces to interval overlap on the
//! position plane: report gating, sensor field-of-view tests, cluster
//! routing and the store's bbox index all use [`Rect`].

use nalgebra::{DMatrixView, DVectorView};
use serde::{Deserialize, Serialize};

use crate::LARGE;

/// Axis-aligned rectangle on the position plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Rect {
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
        Self { min_x, max_x, min_y, max_y }
    }

    /// Rectangle covering the whole tracked plane.
    pub fn everywhere() -> Self {
        Self::new(-LARGE, LARGE, -LARGE, LARGE)
    }

    /// Interval-overlap test per dimension.
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.max_x >= other.min_x
            && self.min_x <= other.max_x
            && self.max_y >= other.min_y
            && self.min_y <= other.max_y
    }

    /// Fraction of `self`'s area lying inside `other`.
    pub fn overlap_fraction(&self, other: &Rect) -> f64 {
        let area = (self.max_x - self.min_x) * (self.max_y - self.min_y);
        if area <= 0.0 {
            return 0.0;
        }
        let ix = (self.max_x.min(other.max_x) - self.min_x.max(other.min_x)).max(0.0);
        let iy = (self.max_y.min(other.max_y) - self.min_y.max(other.min_y)).max(0.0);
        ix * iy / area
    }

    /// Point containment test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.min_x <= x && x <= self.max_x && self.min_y <= y && y <= self.max_y
    }

    /// Smallest rectangle covering both operands.
    pub fn union(&self, other: &Rect) -> Rect {
        Rect::new(
            self.min_x.min(other.min_x),
            self.max_x.max(other.max_x),
            self.min_y.min(other.min_y),
            self.max_y.max(other.max_y),
        )
    }
}

/// Axis-aligned extent of the `nstd`-sigma ellipse of a 2D Gaussian.
///
/// The extreme x (resp. y) of the level set `dᵀP⁻¹d = nstd²` is
/// `±nstd·√P₀₀` (resp. `±nstd·√P₁₁`).
pub fn gaussian_bbox(mean: DVectorView<'_, f64>, cov: DMatrixView<'_, f64>, nstd: f64) -> Rect {
    let dx = nstd * cov[(0, 0)].max(0.0).sqrt();
    let dy = nstd * cov[(1, 1)].max(0.0).sqrt();
    Rect::new(mean[0] - dx, mean[0] + dx, mean[1] - dy, mean[1] + dy)
}
