//! Target state filters.
//!
//! The engine is filter-agnostic: anything that can predict, score and
//! correct against a report behind [`TargetFilter`] can drive a track tree.
//! [`KalmanFilter`] with the constant-velocity model is the stock
//! implementation.

use nalgebra::{DMatrix, DVector};
use uuid::Uuid;

use crate::error::MhtError;
use crate::geometry::{gaussian_bbox, Rect};
use crate::models::{constant_velocity_2d, MotionModel};
use crate::scan::Report;

/// Capability set a track needs from its state estimator.
pub trait TargetFilter: Send {
    /// Propagate the state forward by `dt`.
    fn predict(&mut self, dt: f64);

    /// Measurement update; returns the negative log-likelihood of the report
    /// under the prior.
    fn correct(&mut self, report: &Report) -> Result<f64, MhtError>;

    /// Negative log-likelihood of the report without updating the posterior.
    fn nll(&self, report: &Report) -> Result<f64, MhtError>;

    /// 2-sigma bounding box of the position marginal.
    fn bbox(&self) -> Rect;

    /// Current state estimate.
    fn state(&self) -> DVector<f64>;

    fn clone_box(&self) -> Box<dyn TargetFilter>;
}

impl Clone for Box<dyn TargetFilter> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Linear Kalman filter over a motion model.
#[derive(Clone)]
pub struct KalmanFilter {
    model: MotionModel,
    pub x: DVector<f64>,
    pub p: DMatrix<f64>,
}

impl KalmanFilter {
    pub fn new(model: MotionModel, x0: DVector<f64>, p0: DMatrix<f64>) -> Self {
        Self { model, x: x0, p: p0 }
    }

    /// Innovation statistics shared by `correct` and `nll`:
    /// `(dz, S⁻¹, ln(2π·√|S|))`.
    fn innovation(&self, report: &Report) -> Result<(DVector<f64>, DMatrix<f64>, f64), MhtError> {
        let (zhat, h) = (report.model)(&self.x);
        let dz = &report.z - zhat;
        let s = &h * &self.p * h.transpose() + &report.r;
        let chol = s
            .cholesky()
            .ok_or(MhtError::FilterDegenerate { track: Uuid::nil() })?;
        let det = chol.determinant();
        let s_inv = chol.inverse();
        let norm = (2.0 * std::f64::consts::PI * det.sqrt()).ln();
        Ok((dz, s_inv, norm))
    }
}

impl std::fmt::Debug for KalmanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalmanFilter").field("x", &self.x).finish()
    }
}

impl TargetFilter for KalmanFilter {
    fn predict(&mut self, dt: f64) {
        let (x, p) = (self.model)(&self.x, &self.p, dt);
        self.x = x;
        self.p = p;
    }

    fn correct(&mut self, report: &Report) -> Result<f64, MhtError> {
        let (zhat, h) = (report.model)(&self.x);
        let dz = &report.z - zhat;
        let s = &h * &self.p * h.transpose() + &report.r;
        let chol = s
            .cholesky()
            .ok_or(MhtError::FilterDegenerate { track: Uuid::nil() })?;
        let det = chol.determinant();
        let s_inv = chol.inverse();

        let k = &self.p * h.transpose() * &s_inv;
        self.x += &k * &dz;
        self.p -= &k * &h * &self.p;

        let score = (dz.transpose() * &s_inv * &dz)[(0, 0)] / 2.0
            + (2.0 * std::f64::consts::PI * det.sqrt()).ln();
        Ok(score)
    }

    fn nll(&self, report: &Report) -> Result<f64, MhtError> {
        let (dz, s_inv, norm) = self.innovation(report)?;
        Ok((dz.transpose() * &s_inv * &dz)[(0, 0)] / 2.0 + norm)
    }

    fn bbox(&self) -> Rect {
        gaussian_bbox(self.x.rows(0, 2), self.p.view((0, 0), (2, 2)), 2.0)
    }

    fn state(&self) -> DVector<f64> {
        self.x.clone()
    }

    fn clone_box(&self) -> Box<dyn TargetFilter> {
        Box::new(self.clone())
    }
}

/// Factory producing the filter for a newly hypothesised target.
pub trait TargetInit: Send + Sync {
    /// Build a filter seeded from `report`; when a `parent` is supplied the
    /// result branches off the parent's posterior instead.
    fn init(&self, report: &Report, parent: Option<&dyn TargetFilter>) -> Box<dyn TargetFilter>;
}

/// Constant-velocity initiator: position from the report, zero velocity.
#[derive(Debug, Clone, Copy)]
pub struct DefaultTargetInit {
    /// Process noise intensity.
    pub q: f64,
    /// Initial velocity variance.
    pub pv: f64,
}

impl DefaultTargetInit {
    pub fn new(q: f64, pv: f64) -> Self {
        Self { q, pv }
    }
}

impl TargetInit for DefaultTargetInit {
    fn init(&self, report: &Report, parent: Option<&dyn TargetFilter>) -> Box<dyn TargetFilter> {
        if let Some(parent) = parent {
            return parent.clone_box();
        }
        let x0 = DVector::from_vec(vec![report.z[0], report.z[1], 0.0, 0.0]);
        let mut p0 = DMatrix::zeros(4, 4);
        p0.view_mut((0, 0), (2, 2)).copy_from(&report.r.view((0, 0), (2, 2)));
        p0[(2, 2)] = self.pv;
        p0[(3, 3)] = self.pv;
        Box::new(KalmanFilter::new(constant_velocity_2d(self.q), x0, p0))
    }
}
