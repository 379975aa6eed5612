//! Measurements and the sensors that produce them.
//!
//! A [`Report`] is one noisy point measurement; a [`Scan`] is the batch a
//! sensor delivered for one timestep. Reports are consumed within the scan
//! that carries them — their identity does not outlive it.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use uuid::Uuid;

use crate::geometry::{gaussian_bbox, Rect};
use crate::models::MeasurementModel;
use crate::{ReportId, LARGE};

/// A single measurement: mean, covariance and the model that produced it.
#[derive(Clone)]
pub struct Report {
    pub id: ReportId,
    pub z: DVector<f64>,
    pub r: DMatrix<f64>,
    pub model: MeasurementModel,
    /// Originating sensor tag, when the scan fuses several sources.
    pub source: Option<usize>,
    /// 2-sigma extent of the measurement on the position plane.
    pub bbox: Rect,
}

impl Report {
    pub fn new(z: DVector<f64>, r: DMatrix<f64>, model: MeasurementModel) -> Self {
        let bbox = gaussian_bbox(z.rows(0, 2), r.view((0, 0), (2, 2)), 2.0);
        Self { id: Uuid::new_v4(), z, r, model, source: None, bbox }
    }

    pub fn with_source(mut self, source: usize) -> Self {
        self.source = Some(source);
        self
    }
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R({:?}, src {:?})", self.z.as_slice(), self.source)
    }
}

/// Detection characteristics of a sensor.
///
/// Scores are negative log-likelihood costs: `score_extraneous` prices a
/// report explained as false alarm or new entrant, `score_miss` prices a
/// missed detection inside the field of view.
pub trait Sensor: Send + Sync {
    /// Field-of-view bounding box.
    fn bbox(&self) -> Rect;

    /// Whether a target state lies inside the field of view.
    fn in_fov(&self, state: &DVector<f64>) -> bool;

    fn score_extraneous(&self) -> f64;

    fn score_miss(&self) -> f64;

    /// Cost of a detection that did happen, `−ln(1 − exp(−score_miss))`.
    fn score_found(&self) -> f64 {
        let miss = self.score_miss();
        if miss > 0.0 {
            -(1.0 - (-miss).exp()).ln()
        } else {
            LARGE
        }
    }
}

/// Sensor with unbounded field of view.
#[derive(Debug, Clone, Copy)]
pub struct IdealSensor {
    score_extraneous: f64,
    score_miss: f64,
}

impl IdealSensor {
    pub fn new(score_extraneous: f64, score_miss: f64) -> Self {
        Self { score_extraneous, score_miss }
    }
}

impl Sensor for IdealSensor {
    fn bbox(&self) -> Rect {
        Rect::everywhere()
    }

    fn in_fov(&self, _state: &DVector<f64>) -> bool {
        true
    }

    fn score_extraneous(&self) -> f64 {
        self.score_extraneous
    }

    fn score_miss(&self) -> f64 {
        self.score_miss
    }
}

/// Sensor limited to a rectangular field of view.
#[derive(Debug, Clone, Copy)]
pub struct FovSensor {
    fov: Rect,
    score_extraneous: f64,
    score_miss: f64,
}

impl FovSensor {
    pub fn new(fov: Rect, score_extraneous: f64, score_miss: f64) -> Self {
        Self { fov, score_extraneous, score_miss }
    }
}

impl Sensor for FovSensor {
    fn bbox(&self) -> Rect {
        self.fov
    }

    fn in_fov(&self, state: &DVector<f64>) -> bool {
        self.fov.contains(state[0], state[1])
    }

    fn score_extraneous(&self) -> f64 {
        self.score_extraneous
    }

    fn score_miss(&self) -> f64 {
        self.score_miss
    }
}

/// One sensor's batch of reports for a timestep.
#[derive(Clone)]
pub struct Scan {
    pub sensor: Arc<dyn Sensor>,
    pub reports: Vec<Report>,
}

impl Scan {
    pub fn new(sensor: Arc<dyn Sensor>, reports: Vec<Report>) -> Self {
        Self { sensor, reports }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::position_measurement;
    use approx::assert_relative_eq;

    #[test]
    fn test_report_bbox() {
        let report = Report::new(
            DVector::from_vec(vec![1.0, 2.0]),
            DMatrix::identity(2, 2) * 0.25,
            position_measurement,
        );
        assert_relative_eq!(report.bbox.min_x, 0.0);
        assert_relative_eq!(report.bbox.max_x, 2.0);
        assert_relative_eq!(report.bbox.min_y, 1.0);
        assert_relative_eq!(report.bbox.max_y, 3.0);
    }

    #[test]
    fn test_score_found_derivation() {
        let sensor = IdealSensor::new(3.0, 12.0);
        let expected = -(1.0 - (-12.0f64).exp()).ln();
        assert_relative_eq!(sensor.score_found(), expected);

        // A sensor that never detects makes "found" unaffordable
        let blind = IdealSensor::new(3.0, 0.0);
        assert_relative_eq!(blind.score_found(), LARGE);
    }

    #[test]
    fn test_fov_sensor() {
        let sensor = FovSensor::new(Rect::new(0.0, 10.0, 0.0, 10.0), 3.0, 3.0);
        let inside = DVector::from_vec(vec![5.0, 5.0, 1.0, 1.0]);
        let outside = DVector::from_vec(vec![-5.0, 5.0, 1.0, 1.0]);
        assert!(sensor.in_fov(&inside));
        assert!(!sensor.in_fov(&outside));
    }
}
