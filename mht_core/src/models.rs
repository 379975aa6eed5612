//! Motion and measurement models.
//!
//! Models are pure functions. A motion model maps `(x, P, dT)` to the
//! predicted `(x, P)`; a measurement model maps a state to the predicted
//! measurement and its Jacobian.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

/// State transition: `(x, P, dT) -> (x', P')`.
pub type MotionModel =
    Arc<dyn Fn(&DVector<f64>, &DMatrix<f64>, f64) -> (DVector<f64>, DMatrix<f64>) + Send + Sync>;

/// Measurement map: `x -> (ẑ, H)`.
pub type MeasurementModel = fn(&DVector<f64>) -> (DVector<f64>, DMatrix<f64>);

/// Constant-velocity model on the plane, state `[x, y, vx, vy]`.
///
/// Process noise is the integrated-white-noise covariance scaled by `q`.
pub fn constant_velocity_2d(q: f64) -> MotionModel {
    Arc::new(move |x, p, dt| {
        #[rustfmt::skip]
        let f = DMatrix::from_row_slice(4, 4, &[
            1.0, 0.0, dt,  0.0,
            0.0, 1.0, 0.0, dt,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]);
        let dt3 = dt.powi(3) / 3.0;
        let dt2 = dt.powi(2) / 2.0;
        #[rustfmt::skip]
        let qm = DMatrix::from_row_slice(4, 4, &[
            dt3, 0.0, dt2, 0.0,
            0.0, dt3, 0.0, dt2,
            dt2, 0.0, dt,  0.0,
            0.0, dt2, 0.0, dt,
        ]) * q;
        let new_x = &f * x;
        let new_p = &f * p * f.transpose() + qm;
        (new_x, new_p)
    })
}

/// Direct observation of the position components.
pub fn position_measurement(x: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
    #[rustfmt::skip]
    let h = DMatrix::from_row_slice(2, 4, &[
        1.0, 0.0, 0.0, 0.0,
        0.0, 1.0, 0.0, 0.0,
    ]);
    (&h * x, h)
}

/// Direct observation of the velocity components.
pub fn velocity_measurement(x: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
    #[rustfmt::skip]
    let h = DMatrix::from_row_slice(2, 4, &[
        0.0, 0.0, 1.0, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ]);
    (&h * x, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_constant_velocity_prediction() {
        let model = constant_velocity_2d(0.1);
        let x = DVector::from_vec(vec![0.0, 0.0, 1.0, -1.0]);
        let p = DMatrix::identity(4, 4);

        let (x1, p1) = model(&x, &p, 2.0);

        assert_relative_eq!(x1[0], 2.0);
        assert_relative_eq!(x1[1], -2.0);
        assert_relative_eq!(x1[2], 1.0);
        assert_relative_eq!(x1[3], -1.0);
        // Covariance grows and stays symmetric
        assert!(p1[(0, 0)] > p[(0, 0)]);
        assert_relative_eq!(p1[(0, 2)], p1[(2, 0)], epsilon = 1e-12);
    }

    #[test]
    fn test_position_measurement() {
        let x = DVector::from_vec(vec![3.0, 4.0, 1.0, 2.0]);
        let (z, h) = position_measurement(&x);
        assert_relative_eq!(z[0], 3.0);
        assert_relative_eq!(z[1], 4.0);
        assert_eq!(h.shape(), (2, 4));
    }

    #[test]
    fn test_velocity_measurement() {
        let x = DVector::from_vec(vec![3.0, 4.0, 1.0, 2.0]);
        let (z, _) = velocity_measurement(&x);
        assert_relative_eq!(z[0], 1.0);
        assert_relative_eq!(z[1], 2.0);
    }
}
