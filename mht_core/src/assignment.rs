//! Optimal linear assignment on rectangular cost matrices.
//!
//! Shortest augmenting path with dual potentials (Jonker-Volgenant family),
//! O(M²·N) for an M×N matrix with M ≤ N. Wider-than-tall inputs are solved
//! directly; taller-than-wide inputs are padded with [`LARGE`] columns, so a
//! returned column index may point at a forbidden entry — callers must reject
//! assignments that cover one.

use nalgebra::{DMatrix, Dyn, Matrix, RawStorage};

use crate::error::MhtError;
use crate::LARGE;

/// Solve the minimum-cost assignment of rows to distinct columns.
///
/// Returns `(total_cost, assignment)` with `assignment[row] = column`.
/// Entries equal to [`LARGE`] are sentinels for forbidden pairs; the solver
/// treats them as ordinary (very expensive) costs and leaves rejection to the
/// caller.
pub fn lap<S>(cost: &Matrix<f64, Dyn, Dyn, S>) -> Result<(f64, Vec<usize>), MhtError>
where
    S: RawStorage<f64, Dyn, Dyn>,
{
    let rows = cost.nrows();
    let cols = cost.ncols();
    if rows == 0 || cols == 0 {
        return Err(MhtError::InvalidMatrix { rows, cols });
    }
    if rows > cols {
        let padded = DMatrix::from_fn(rows, rows, |i, j| if j < cols { cost[(i, j)] } else { LARGE });
        return lap(&padded);
    }

    // Dual potentials and the column->row matching, 1-based with a virtual
    // column 0 that seeds each augmenting search.
    let mut u = vec![0.0f64; rows + 1];
    let mut v = vec![0.0f64; cols + 1];
    let mut matched = vec![0usize; cols + 1];
    let mut way = vec![0usize; cols + 1];

    for row in 1..=rows {
        matched[0] = row;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; cols + 1];
        let mut used = vec![false; cols + 1];

        loop {
            used[j0] = true;
            let i0 = matched[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=cols {
                if !used[j] {
                    let reduced = cost[(i0 - 1, j - 1)] - u[i0] - v[j];
                    if reduced < minv[j] {
                        minv[j] = reduced;
                        way[j] = j0;
                    }
                    if minv[j] < delta {
                        delta = minv[j];
                        j1 = j;
                    }
                }
            }
            if !delta.is_finite() {
                return Err(MhtError::NoFeasibleAssignment);
            }
            for j in 0..=cols {
                if used[j] {
                    u[matched[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if matched[j0] == 0 {
                break;
            }
        }

        // Walk the alternating path back, flipping the matching.
        loop {
            let j1 = way[j0];
            matched[j0] = matched[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![usize::MAX; rows];
    for j in 1..=cols {
        if matched[j] != 0 {
            assignment[matched[j] - 1] = j - 1;
        }
    }
    let total = assignment
        .iter()
        .enumerate()
        .map(|(i, &j)| cost[(i, j)])
        .sum();
    Ok((total, assignment))
}
